//! Stream supervisor: owns the live connection and its inactivity watchdog.
//!
//! The supervisor is an explicit state machine:
//!
//! ```text
//! Idle -> Connecting -> Streaming -> Draining -> Connecting -> ...
//! ```
//!
//! `Connecting` fetches a fresh credential and opens a connection; failures
//! loop back to `Connecting` after a backoff delay. `Streaming` consumes
//! events until the watchdog expires or the transport ends. `Draining` closes
//! the connection and disarms the watchdog before the next connect, so two
//! connections are never live at once.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, TokenProvider};
use crate::dispatch::NotificationDispatcher;
use crate::retry::{backoff_sleep, with_timeout, BackoffPolicy};
use crate::stream::client::{
    ConnectionUpdate, StreamConnection, StreamConnector, TransportError, DEFAULT_CONNECT_TIMEOUT,
};
use crate::stream::proto::{EventKind, StreamEvent};
use crate::stream::watchdog::{InactivityWatchdog, DEFAULT_INACTIVITY_TIMEOUT};

/// Supervisor lifecycle state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SupervisorState {
    /// Not started, or stopped after shutdown.
    Idle,
    /// Fetching a credential and opening the stream.
    Connecting,
    /// Consuming events from a live connection.
    Streaming,
    /// Tearing down the current connection before reconnecting.
    Draining(DrainReason),
}

/// Why a streaming connection is being torn down.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DrainReason {
    /// No event arrived within the inactivity timeout.
    Inactivity,
    /// The transport ended on its own.
    TransportClosed,
}

/// How long shutdown waits for in-flight dispatches before aborting them.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Supervisor tuning.
#[derive(Clone, Debug)]
pub struct SupervisorOptions {
    /// SSE endpoint URL.
    pub url: String,
    /// Silence tolerated before the connection is recycled.
    pub inactivity_timeout: Duration,
    /// Bound applied separately to the token fetch and to opening the stream.
    pub connect_timeout: Duration,
    /// Delay policy between failed connect attempts.
    pub backoff: BackoffPolicy,
    /// Upper bound on waiting for in-flight dispatches at shutdown.
    pub shutdown_grace: Duration,
}

impl SupervisorOptions {
    /// Options for `url` with default timeouts and backoff.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backoff: BackoffPolicy::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Overrides the inactivity timeout.
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Overrides the per-stage connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Overrides the reconnect backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Overrides the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Failure of one connect attempt.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{stage} timed out after {timeout:?}")]
    Timeout {
        stage: &'static str,
        timeout: Duration,
    },
}

/// Keeps one authenticated stream alive and forwards notifications.
pub struct StreamSupervisor<T, C, D> {
    tokens: T,
    connector: C,
    dispatcher: Arc<D>,
    options: SupervisorOptions,
    state: SupervisorState,
    state_tx: watch::Sender<SupervisorState>,
    connection: Option<StreamConnection>,
    watchdog: InactivityWatchdog,
    failed_attempts: usize,
    in_flight: JoinSet<()>,
}

impl<T, C, D> StreamSupervisor<T, C, D>
where
    T: TokenProvider,
    C: StreamConnector,
    D: NotificationDispatcher,
{
    /// Creates an idle supervisor. Nothing connects until the first [`Self::step`].
    pub fn new(tokens: T, connector: C, dispatcher: Arc<D>, options: SupervisorOptions) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Idle);
        let watchdog = InactivityWatchdog::new(options.inactivity_timeout);
        Self {
            tokens,
            connector,
            dispatcher,
            options,
            state: SupervisorState::Idle,
            state_tx,
            connection: None,
            watchdog,
            failed_attempts: 0,
            in_flight: JoinSet::new(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Observes state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    /// Inactivity watchdog of the current connection.
    pub fn watchdog(&self) -> &InactivityWatchdog {
        &self.watchdog
    }

    /// Number of dispatch tasks that have not been reaped yet.
    pub fn dispatches_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Runs until `shutdown` completes, then closes the connection and waits
    /// up to the shutdown grace period for in-flight dispatches. Dispatches
    /// still running after that are aborted.
    pub async fn run_until<S>(mut self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.step() => {}
            }
        }

        info!(event = "supervisor_shutdown");
        self.close_current();
        self.watchdog.disarm();
        self.drain_dispatches().await;
        self.set_state(SupervisorState::Idle);
    }

    /// Performs exactly one state transition and returns the new state.
    pub async fn step(&mut self) -> SupervisorState {
        reap_finished(&mut self.in_flight);

        let next = match self.state {
            SupervisorState::Idle => SupervisorState::Connecting,
            SupervisorState::Connecting => self.connect().await,
            SupervisorState::Streaming => self.stream().await,
            SupervisorState::Draining(reason) => self.drain(reason),
        };
        self.set_state(next);
        next
    }

    async fn connect(&mut self) -> SupervisorState {
        debug_assert!(self.connection.is_none());

        match open_connection(&self.tokens, &self.connector, &self.options).await {
            Ok(connection) => {
                info!(event = "stream_open", url = %self.options.url);
                self.connection = Some(connection);
                self.failed_attempts = 0;
                self.watchdog.arm();
                SupervisorState::Streaming
            }
            Err(err) => {
                self.failed_attempts += 1;
                warn!(
                    event = "stream_connect_failed",
                    attempt = self.failed_attempts,
                    error = %err
                );
                backoff_sleep(&self.options.backoff, self.failed_attempts).await;
                SupervisorState::Connecting
            }
        }
    }

    async fn stream(&mut self) -> SupervisorState {
        let Some(connection) = self.connection.as_mut() else {
            return SupervisorState::Connecting;
        };

        loop {
            tokio::select! {
                biased;

                update = connection.recv() => match update {
                    Some(ConnectionUpdate::Event(event)) => {
                        self.watchdog.reset();
                        reap_finished(&mut self.in_flight);
                        handle_event(event, &self.dispatcher, &mut self.in_flight);
                    }
                    Some(ConnectionUpdate::TransportClosed { reason }) => {
                        info!(
                            event = "stream_transport_closed",
                            reason = reason.as_deref().unwrap_or("peer closed")
                        );
                        return SupervisorState::Draining(DrainReason::TransportClosed);
                    }
                    None => return SupervisorState::Draining(DrainReason::TransportClosed),
                },
                _ = self.watchdog.expired() => {
                    info!(
                        event = "stream_inactive",
                        timeout_ms = self.watchdog.timeout().as_millis() as u64
                    );
                    return SupervisorState::Draining(DrainReason::Inactivity);
                }
            }
        }
    }

    async fn drain_dispatches(&mut self) {
        let grace = self.options.shutdown_grace;
        let in_flight = &mut self.in_flight;
        let joined = with_timeout(grace, async move {
            while let Some(result) = in_flight.join_next().await {
                if let Err(err) = result {
                    warn!(event = "dispatch_task_failed", error = %err);
                }
            }
        })
        .await;

        if joined.is_err() {
            warn!(
                event = "dispatches_abandoned",
                abandoned = self.in_flight.len(),
                grace_ms = grace.as_millis() as u64
            );
            self.in_flight.shutdown().await;
        }
    }

    fn drain(&mut self, reason: DrainReason) -> SupervisorState {
        debug!(event = "stream_draining", ?reason);
        self.close_current();
        self.watchdog.disarm();
        SupervisorState::Connecting
    }

    fn close_current(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
    }

    fn set_state(&mut self, next: SupervisorState) {
        if self.state != next {
            debug!(event = "supervisor_transition", from = ?self.state, to = ?next);
        }
        self.state = next;
        self.state_tx.send_replace(next);
    }
}

async fn open_connection<T, C>(
    tokens: &T,
    connector: &C,
    options: &SupervisorOptions,
) -> Result<StreamConnection, ConnectError>
where
    T: TokenProvider,
    C: StreamConnector,
{
    let timeout = options.connect_timeout;

    let credential = with_timeout(timeout, tokens.fetch_token())
        .await
        .map_err(|_| ConnectError::Timeout {
            stage: "token fetch",
            timeout,
        })??;

    let connection = with_timeout(timeout, connector.open(&options.url, &credential))
        .await
        .map_err(|_| ConnectError::Timeout {
            stage: "stream open",
            timeout,
        })??;

    Ok(connection)
}

fn reap_finished(in_flight: &mut JoinSet<()>) {
    while let Some(result) = in_flight.try_join_next() {
        if let Err(err) = result {
            warn!(event = "dispatch_task_failed", error = %err);
        }
    }
}

fn handle_event<D: NotificationDispatcher>(
    event: StreamEvent,
    dispatcher: &Arc<D>,
    in_flight: &mut JoinSet<()>,
) {
    match event.kind {
        EventKind::Notification => {
            let id = event.id.clone().unwrap_or_default();
            let Some(payload) = event.into_payload() else {
                return;
            };
            info!(
                event = "notification_received",
                id = %id,
                receivers = payload.receivers.len()
            );

            let dispatcher = Arc::clone(dispatcher);
            in_flight.spawn(async move {
                match dispatcher.dispatch(payload).await {
                    Ok(report) => debug!(
                        event = "notification_dispatched",
                        id = %id,
                        delivered = report.delivered,
                        unresolved = report.unresolved,
                        failed = report.failed
                    ),
                    Err(err) => warn!(event = "notification_dispatch_failed", id = %id, error = %err),
                }
            });
        }
        EventKind::Health => debug!(event = "stream_health", data = %event.raw_data),
        EventKind::Other => info!(
            event = "stream_event_ignored",
            event_type = %event.event_type,
            id = event.id.as_deref().unwrap_or_default(),
            data = %event.raw_data
        ),
    }
}
