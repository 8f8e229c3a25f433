//! Relay from a notification SSE stream to a chat delivery channel.
//!
//! The crate is organized by concern:
//! - `auth`: OAuth2 client-credentials token provider.
//! - `stream`: SSE connection, inactivity watchdog, and the supervisor that
//!   keeps one connection alive and reconnects on silence or disconnect.
//! - `dispatch`: delivery boundary for decoded notifications.
//! - `config`: environment configuration.
//! - `retry`: reconnect backoff and timeout utilities.

/// Token acquisition for stream credentials.
pub mod auth;
/// Relay configuration loaded from the environment.
pub mod config;
/// Notification delivery boundary.
pub mod dispatch;
/// Backoff and timeout helpers used by the supervisor.
pub mod retry;
/// Stream transport, event model, watchdog, and supervisor.
pub mod stream;
