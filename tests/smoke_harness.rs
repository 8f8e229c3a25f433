use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use futures_util::stream;
use notification_relay::auth::{
    AuthError, ClientAuthMethod, ClientCredentialsProvider, TokenProvider, TokenProviderOptions,
    TOKEN_ENDPOINT_PATH,
};
use notification_relay::dispatch::{DispatchError, DispatchReport, NotificationDispatcher};
use notification_relay::retry::BackoffPolicy;
use notification_relay::stream::client::{
    ConnectionUpdate, SseConnector, StreamConnector, TransportError, SSE_ENDPOINT_PATH,
};
use notification_relay::stream::proto::{EventKind, NotificationPayload};
use notification_relay::stream::supervisor::{StreamSupervisor, SupervisorOptions};
use secrecy::SecretString;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const TEST_CLIENT_ID: &str = "relay";
const TEST_CLIENT_SECRET: &str = "s3cret";
// base64("relay:s3cret")
const TEST_BASIC_AUTH: &str = "Basic cmVsYXk6czNjcmV0";
const TEST_TOKEN: &str = "issued-token";
const NOTIFICATION_DATA: &str = r#"{"payload":{"receivers":[{"email":"a@x.no"}],"title":"T","module":"HRM","message":"M","created":"2024-01-01T00:00:00","priority":"high","url":"http://x"}}"#;

#[derive(Clone, Default)]
struct IssuerState {
    token_calls: Arc<AtomicUsize>,
    stream_calls: Arc<AtomicUsize>,
}

async fn token_handler(
    State(state): State<IssuerState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.token_calls.fetch_add(1, Ordering::SeqCst);

    if form.get("grant_type").map(String::as_str) != Some("client_credentials") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error":"unsupported_grant_type"})),
        )
            .into_response();
    }

    let basic_ok = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == TEST_BASIC_AUTH);
    let post_ok = form.get("client_id").map(String::as_str) == Some(TEST_CLIENT_ID)
        && form.get("client_secret").map(String::as_str) == Some(TEST_CLIENT_SECRET);

    if !basic_ok && !post_ok {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error":"invalid_client","error_description":"bad client credentials"})),
        )
            .into_response();
    }

    let token = format!("{TEST_TOKEN}-{}", state.token_calls.load(Ordering::SeqCst));
    Json(json!({"access_token": token, "token_type": "Bearer", "expires_in": 300})).into_response()
}

async fn sse_handler(State(state): State<IssuerState>, headers: HeaderMap) -> Response {
    state.stream_calls.fetch_add(1, Ordering::SeqCst);

    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with(&format!("Bearer {TEST_TOKEN}")));
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    }

    let frames = vec![
        Ok::<_, Infallible>(Event::default().event("health").data("ok")),
        Ok(Event::default()
            .event("notification")
            .id("41")
            .data("{broken")),
        Ok(Event::default()
            .event("notification")
            .id("42")
            .data(NOTIFICATION_DATA)),
        Ok(Event::default().event("status").data("ignored")),
    ];
    Sse::new(stream::iter(frames)).into_response()
}

fn issuer_app(state: IssuerState) -> Router {
    Router::new()
        .route(TOKEN_ENDPOINT_PATH, post(token_handler))
        .route(SSE_ENDPOINT_PATH, get(sse_handler))
        .with_state(state)
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}

fn provider(addr: SocketAddr, auth_method: ClientAuthMethod) -> ClientCredentialsProvider {
    ClientCredentialsProvider::with_options(
        format!("http://{addr}{TOKEN_ENDPOINT_PATH}"),
        TEST_CLIENT_ID,
        SecretString::new(TEST_CLIENT_SECRET.to_string()),
        TokenProviderOptions {
            auth_method,
            ..TokenProviderOptions::default()
        },
    )
    .expect("build token provider")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn token_provider_smoke_basic_and_post_auth() {
    let state = IssuerState::default();
    let (addr, shutdown_tx, server_task) = spawn_server(issuer_app(state.clone())).await;

    let basic_provider = provider(addr, ClientAuthMethod::ClientSecretBasic);
    assert_eq!(
        basic_provider.token_endpoint(),
        format!("http://{addr}/authz/api/oauth/token")
    );
    let basic = basic_provider
        .fetch_token()
        .await
        .expect("basic auth token");
    assert_eq!(basic.token(), format!("{TEST_TOKEN}-1"));

    let post = provider(addr, ClientAuthMethod::ClientSecretPost)
        .fetch_token()
        .await
        .expect("post auth token");
    assert_eq!(post.token(), format!("{TEST_TOKEN}-2"));
    assert_eq!(state.token_calls.load(Ordering::SeqCst), 2);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn token_provider_reports_rejected_client() {
    let state = IssuerState::default();
    let (addr, shutdown_tx, server_task) = spawn_server(issuer_app(state.clone())).await;

    let rejected = ClientCredentialsProvider::new(
        format!("http://{addr}{TOKEN_ENDPOINT_PATH}"),
        TEST_CLIENT_ID,
        SecretString::new("wrong".to_string()),
    )
    .expect("build token provider")
    .fetch_token()
    .await
    .expect_err("wrong secret must be rejected");

    match rejected {
        AuthError::HttpStatus { status, body } => {
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body, "bad client credentials");
        }
        other => panic!("unexpected error variant: {other:?}"),
    }

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sse_connector_smoke_classifies_frames_until_transport_end() {
    let state = IssuerState::default();
    let (addr, shutdown_tx, server_task) = spawn_server(issuer_app(state.clone())).await;

    let credential = provider(addr, ClientAuthMethod::ClientSecretBasic)
        .fetch_token()
        .await
        .expect("token");
    let mut connection = SseConnector::new()
        .expect("build connector")
        .open(&format!("http://{addr}{SSE_ENDPOINT_PATH}"), &credential)
        .await
        .expect("open stream");

    let mut kinds = Vec::new();
    let mut notification = None;
    loop {
        let update = timeout(Duration::from_secs(5), connection.recv())
            .await
            .expect("timed out waiting for stream update");
        match update {
            Some(ConnectionUpdate::Event(event)) => {
                kinds.push(event.kind);
                if event.kind == EventKind::Notification {
                    notification = Some(event);
                }
            }
            Some(ConnectionUpdate::TransportClosed { .. }) => break,
            None => panic!("transport end must be reported before the sequence ends"),
        }
    }

    assert_eq!(
        kinds,
        vec![
            EventKind::Health,
            EventKind::Other,
            EventKind::Notification,
            EventKind::Other
        ]
    );
    let notification = notification.expect("notification event");
    assert_eq!(notification.id.as_deref(), Some("42"));
    assert_eq!(
        notification.payload().expect("payload").receivers[0].email,
        "a@x.no"
    );
    assert_eq!(connection.recv().await, None);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sse_connector_rejects_unauthorized_stream() {
    let state = IssuerState::default();
    let (addr, shutdown_tx, server_task) = spawn_server(issuer_app(state.clone())).await;

    let result = SseConnector::new()
        .expect("build connector")
        .open(
            &format!("http://{addr}{SSE_ENDPOINT_PATH}"),
            &notification_relay::auth::Credential::bearer("forged"),
        )
        .await;

    match result {
        Err(TransportError::HttpStatus { status, .. }) => {
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }
        other => panic!("unexpected open result: {other:?}"),
    }

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

struct ForwardingDispatcher {
    tx: mpsc::UnboundedSender<NotificationPayload>,
}

#[async_trait]
impl NotificationDispatcher for ForwardingDispatcher {
    async fn dispatch(&self, payload: NotificationPayload) -> Result<DispatchReport, DispatchError> {
        let _ = self.tx.send(payload);
        Ok(DispatchReport::default())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn supervisor_smoke_reconnects_with_fresh_token_after_stream_end() {
    let state = IssuerState::default();
    let (addr, shutdown_tx, server_task) = spawn_server(issuer_app(state.clone())).await;

    let (dispatched_tx, mut dispatched_rx) = mpsc::unbounded_channel();
    let supervisor = StreamSupervisor::new(
        provider(addr, ClientAuthMethod::ClientSecretBasic),
        SseConnector::new().expect("build connector"),
        Arc::new(ForwardingDispatcher { tx: dispatched_tx }),
        SupervisorOptions::new(format!("http://{addr}{SSE_ENDPOINT_PATH}"))
            .with_backoff(BackoffPolicy::immediate()),
    );
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let supervisor_task = tokio::spawn(supervisor.run_until(async move {
        let _ = stop_rx.await;
    }));

    for _ in 0..2 {
        let payload = timeout(Duration::from_secs(5), dispatched_rx.recv())
            .await
            .expect("timed out waiting for dispatch")
            .expect("dispatch channel open");
        assert_eq!(payload.priority, "high");
        assert_eq!(payload.receivers[0].email, "a@x.no");
    }

    let _ = stop_tx.send(());
    timeout(Duration::from_secs(5), supervisor_task)
        .await
        .expect("supervisor should stop")
        .expect("supervisor task should join");

    let token_calls = state.token_calls.load(Ordering::SeqCst);
    let stream_calls = state.stream_calls.load(Ordering::SeqCst);
    assert!(stream_calls >= 2, "expected a reconnect, saw {stream_calls}");
    assert!(token_calls >= stream_calls, "every stream open needs its own token");

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}
