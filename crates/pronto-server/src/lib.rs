//! # pronto-server
//!
//! Realtime delivery for search results over WebSocket.
//!
//! - Connection admission: origin/HTTPS policy and one-time tickets
//! - Per-connection subscribe rate limiting
//! - Channel registry with session ownership checks on subscribe and publish
//! - Pending subscriptions for jobs that have not started yet
//! - Heartbeat liveness and coordinated shutdown

#![deny(unsafe_code)]

pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod health;
pub mod jobs;
pub mod publisher;
pub mod rate_limit;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use auth::{AuthError, AuthenticatedClient, ConnectionAuthenticator, TicketError};
pub use config::ServerConfig;
pub use jobs::JobTracker;
pub use rate_limit::RateLimiter;
pub use server::{ProntoServer, ServerHandle};
pub use websocket::manager::WebSocketManager;
