//! Delivery boundary for decoded notifications.
//!
//! The supervisor only knows [`NotificationDispatcher`]. Chat-platform member
//! lookup and message formatting live behind [`RecipientChannel`], which the
//! embedding application implements; [`DirectoryDispatcher`] walks a
//! payload's receivers through it.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::stream::proto::{NotificationPayload, Receiver};

/// Consumer of decoded notification payloads.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, payload: NotificationPayload) -> Result<DispatchReport, DispatchError>;
}

/// Per-receiver outcome counts of one dispatch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub unresolved: usize,
    pub failed: usize,
}

/// Failure to resolve or deliver to a receiver.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("recipient lookup failed for {receiver}: {detail}")]
    Lookup { receiver: String, detail: String },

    #[error("delivery failed for {receiver}: {detail}")]
    Delivery { receiver: String, detail: String },

    #[error("dispatch failed: {0}")]
    Other(String),
}

/// Resolved delivery-channel identity of a receiver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Recipient {
    pub receiver: Receiver,
    /// Channel-specific member id.
    pub address: String,
}

/// Chat delivery channel implemented outside this crate.
#[async_trait]
pub trait RecipientChannel: Send + Sync + 'static {
    /// Looks up the channel member for `receiver`. `Ok(None)` means unknown.
    async fn resolve(&self, receiver: &Receiver) -> Result<Option<Recipient>, DispatchError>;

    async fn deliver(
        &self,
        recipient: &Recipient,
        payload: &NotificationPayload,
    ) -> Result<(), DispatchError>;
}

/// Dispatches to every receiver of a payload, in list order.
///
/// Receivers that cannot be resolved are skipped and a failed delivery does
/// not stop the remaining receivers; both are only counted and logged.
#[derive(Debug)]
pub struct DirectoryDispatcher<C> {
    channel: C,
}

impl<C: RecipientChannel> DirectoryDispatcher<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }
}

#[async_trait]
impl<C: RecipientChannel> NotificationDispatcher for DirectoryDispatcher<C> {
    async fn dispatch(&self, payload: NotificationPayload) -> Result<DispatchReport, DispatchError> {
        let mut report = DispatchReport::default();

        if payload.receivers.is_empty() {
            info!(event = "dispatch_no_receivers", title = %payload.title);
            return Ok(report);
        }

        for receiver in &payload.receivers {
            let recipient = match self.channel.resolve(receiver).await {
                Ok(Some(recipient)) => recipient,
                Ok(None) => {
                    info!(event = "recipient_not_found", email = %receiver.email);
                    report.unresolved += 1;
                    continue;
                }
                Err(err) => {
                    warn!(event = "recipient_lookup_failed", email = %receiver.email, error = %err);
                    report.unresolved += 1;
                    continue;
                }
            };

            match self.channel.deliver(&recipient, &payload).await {
                Ok(()) => {
                    info!(event = "notification_delivered", email = %receiver.email);
                    report.delivered += 1;
                }
                Err(err) => {
                    warn!(event = "notification_delivery_failed", email = %receiver.email, error = %err);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Dispatcher that only logs notifications.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn dispatch(&self, payload: NotificationPayload) -> Result<DispatchReport, DispatchError> {
        for receiver in &payload.receivers {
            info!(
                event = "notification",
                email = %receiver.email,
                title = %payload.title,
                module = %payload.module,
                priority = %payload.priority,
                url = payload.url.as_deref().unwrap_or_default(),
            );
        }
        Ok(DispatchReport {
            delivered: payload.receivers.len(),
            ..DispatchReport::default()
        })
    }
}
