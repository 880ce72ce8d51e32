//! WebSocket connection state, channel registry, pending subscriptions and the
//! per-socket session loop.

pub mod connection;
pub mod manager;
pub mod pending;
pub mod session;
