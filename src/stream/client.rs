//! SSE transport and connection handle.
//!
//! A connection is a background worker that owns the HTTP response body and
//! forwards classified events over a channel. The [`StreamConnection`] handle
//! reads that channel and can close the worker at any time; once closed, no
//! further events are delivered, even ones already buffered.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::Credential;
use crate::stream::proto::StreamEvent;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Path of the SSE endpoint relative to the notification service base URL.
pub const SSE_ENDPOINT_PATH: &str = "/notifications/external/api/v1/sse";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Item delivered by [`StreamConnection::recv`].
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionUpdate {
    /// Next event in arrival order.
    Event(StreamEvent),
    /// The transport ended without a local close. Delivered at most once.
    TransportClosed { reason: Option<String> },
}

/// Producer side of a connection's event channel.
#[derive(Clone, Debug)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<ConnectionUpdate>,
}

impl FrameSender {
    /// Classifies a raw SSE frame and forwards it.
    ///
    /// Returns `false` once the connection has been closed locally.
    pub fn send_frame(&self, event_type: &str, id: &str, data: &str) -> bool {
        self.send_event(StreamEvent::from_frame(event_type, id, data))
    }

    pub fn send_event(&self, event: StreamEvent) -> bool {
        self.tx.send(ConnectionUpdate::Event(event)).is_ok()
    }

    /// Reports the end of the transport.
    pub fn transport_closed(&self, reason: Option<String>) -> bool {
        self.tx
            .send(ConnectionUpdate::TransportClosed { reason })
            .is_ok()
    }

    /// Whether the consuming connection has been closed or dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Handle to one live stream connection.
#[derive(Debug)]
pub struct StreamConnection {
    updates: mpsc::UnboundedReceiver<ConnectionUpdate>,
    worker: Option<JoinHandle<()>>,
    closed: bool,
    transport_reported: bool,
}

impl StreamConnection {
    /// Creates a connection fed by the returned [`FrameSender`].
    pub fn channel() -> (FrameSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            FrameSender { tx },
            Self {
                updates: rx,
                worker: None,
                closed: false,
                transport_reported: false,
            },
        )
    }

    fn with_worker(mut self, worker: JoinHandle<()>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Receives the next update.
    ///
    /// Returns `None` after a local close or once the transport end has been
    /// reported. If the producer goes away without reporting, a single
    /// `TransportClosed { reason: None }` is synthesized.
    pub async fn recv(&mut self) -> Option<ConnectionUpdate> {
        if self.closed || self.transport_reported {
            return None;
        }

        match self.updates.recv().await {
            Some(ConnectionUpdate::Event(event)) => Some(ConnectionUpdate::Event(event)),
            Some(closed @ ConnectionUpdate::TransportClosed { .. }) => {
                self.transport_reported = true;
                Some(closed)
            }
            None => {
                self.transport_reported = true;
                Some(ConnectionUpdate::TransportClosed { reason: None })
            }
        }
    }

    /// Closes the connection. Calling this more than once has no effect.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.updates.close();
        while self.updates.try_recv().is_ok() {}
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        debug!(event = "stream_connection_closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens stream connections.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn open(
        &self,
        url: &str,
        credential: &Credential,
    ) -> Result<StreamConnection, TransportError>;
}

/// [`StreamConnector`] speaking SSE over reqwest.
#[derive(Clone)]
pub struct SseConnector {
    http: Client,
}

impl SseConnector {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self, TransportError> {
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(TransportError::Request)?;
        Ok(Self { http })
    }
}

#[async_trait]
impl StreamConnector for SseConnector {
    async fn open(
        &self,
        url: &str,
        credential: &Credential,
    ) -> Result<StreamConnection, TransportError> {
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, credential.authorization_header())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(TransportError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::HttpStatus {
                status,
                body: body.chars().take(ERROR_BODY_SNIPPET_LEN).collect(),
            });
        }

        info!(event = "stream_connected", url);

        let (sender, connection) = StreamConnection::channel();
        let url = url.to_string();
        let worker = tokio::spawn(async move {
            let mut frames = response.bytes_stream().eventsource();
            let reason = loop {
                match frames.next().await {
                    Some(Ok(frame)) => {
                        if !sender.send_frame(&frame.event, &frame.id, &frame.data) {
                            return;
                        }
                    }
                    Some(Err(err)) => break Some(err.to_string()),
                    None => break None,
                }
            };

            match reason.as_deref() {
                Some(error) => warn!(event = "stream_disconnected", url = %url, error),
                None => info!(event = "stream_disconnected", url = %url),
            }
            let _ = sender.transport_closed(reason);
        });

        Ok(connection.with_worker(worker))
    }
}

/// Failure to establish or keep a stream connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("stream request failed: {0}")]
    Request(reqwest::Error),

    #[error("stream endpoint returned {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
}
