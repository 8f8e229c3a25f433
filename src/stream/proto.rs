//! Event model for the notification SSE stream.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::warn;

/// SSE event type carrying a notification payload.
pub const NOTIFICATION_EVENT: &str = "notification";
/// SSE event type emitted by the server as a liveness signal.
pub const HEALTH_EVENT: &str = "health";

/// Classification of an inbound SSE frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    Notification,
    Health,
    Other,
}

/// Typed event produced by a stream connection for each inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamEvent {
    pub kind: EventKind,
    /// SSE event type as received (`message` when the frame carried none).
    pub event_type: String,
    pub id: Option<String>,
    pub raw_data: String,
    payload: Option<NotificationPayload>,
}

impl StreamEvent {
    /// Classifies a raw SSE frame.
    ///
    /// A `notification` frame needs a non-empty id and a decodable payload to
    /// be classified as [`EventKind::Notification`]; anything that fails
    /// those checks is surfaced as [`EventKind::Other`] so one bad frame never
    /// ends the stream.
    pub fn from_frame(event_type: &str, id: &str, data: &str) -> Self {
        let id = (!id.is_empty()).then(|| id.to_string());
        let mut event = Self {
            kind: EventKind::Other,
            event_type: event_type.to_string(),
            id,
            raw_data: data.to_string(),
            payload: None,
        };

        match event_type {
            NOTIFICATION_EVENT if event.id.is_some() => match NotificationPayload::decode(data) {
                Ok(payload) => {
                    event.kind = EventKind::Notification;
                    event.payload = Some(payload);
                }
                Err(err) => {
                    warn!(
                        event = "malformed_frame",
                        id = event.id.as_deref().unwrap_or_default(),
                        error = %err
                    );
                }
            },
            HEALTH_EVENT => event.kind = EventKind::Health,
            _ => {}
        }

        event
    }

    /// Decoded payload, present only for notification events.
    pub fn payload(&self) -> Option<&NotificationPayload> {
        self.payload.as_ref()
    }

    /// Consumes the event and returns its decoded payload.
    pub fn into_payload(self) -> Option<NotificationPayload> {
        self.payload
    }
}

/// Notification content decoded from the `payload` field of a frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationPayload {
    #[serde(default, deserialize_with = "null_as_default")]
    pub receivers: Vec<Receiver>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub module: String,
    /// Notification body text.
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
    /// Creation time as a naive ISO-8601 timestamp in UTC.
    #[serde(default, deserialize_with = "null_as_default")]
    pub created: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub priority: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl NotificationPayload {
    /// Decodes the JSON `data` field of a notification frame.
    pub fn decode(data: &str) -> Result<Self, MalformedFrameError> {
        let envelope: NotificationEnvelope = serde_json::from_str(data)?;
        envelope.payload.ok_or(MalformedFrameError::MissingPayload)
    }

    /// Parses [`Self::created`]; the server omits the zone and means UTC.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let trimmed = self.created.trim().trim_end_matches('Z');
        NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

/// Recipient identity of a notification.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receiver {
    #[serde(default, deserialize_with = "null_as_default")]
    pub email: String,
}

/// Reads an explicit JSON `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct NotificationEnvelope {
    #[serde(default)]
    payload: Option<NotificationPayload>,
}

/// A notification frame whose data could not be decoded.
#[derive(Debug, Error)]
pub enum MalformedFrameError {
    #[error("invalid notification json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("notification data has no payload")]
    MissingPayload,
}
