//! Notification stream modules.
//!
//! - `client`: SSE transport and connection handle.
//! - `proto`: event classification and notification payloads.
//! - `watchdog`: resettable inactivity timer.
//! - `supervisor`: connect/consume/reconnect state machine.

/// SSE connection and connector.
pub mod client;
/// Stream event model.
pub mod proto;
/// Reconnect state machine.
pub mod supervisor;
/// Inactivity timer.
pub mod watchdog;
