//! # pronto-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ProntoSettings::default()`]
//! 2. **Settings file**: `~/.pronto/settings.json` or `$PRONTO_SETTINGS`
//!    (deep-merged over defaults)
//! 3. **Environment variables** (highest priority)
//!
//! There is no global instance. The binary loads settings once and hands the
//! relevant sections to each service.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
