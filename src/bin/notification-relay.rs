//! Notification relay entry point.
//!
//! Connects to the notification stream and logs every notification through
//! [`LogDispatcher`] until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use notification_relay::auth::{ClientCredentialsProvider, TokenProviderOptions};
use notification_relay::config::RelayConfig;
use notification_relay::dispatch::LogDispatcher;
use notification_relay::stream::client::SseConnector;
use notification_relay::stream::supervisor::{StreamSupervisor, SupervisorOptions};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = RelayConfig::from_env().context("invalid relay configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        base_url = %config.base_url,
        inactivity_timeout_secs = config.inactivity_timeout.as_secs(),
        "Starting notification relay"
    );

    let tokens = ClientCredentialsProvider::with_options(
        config.token_endpoint(),
        config.client_id.clone(),
        config.client_secret.clone(),
        TokenProviderOptions {
            connect_timeout: config.connect_timeout,
            auth_method: config.client_auth_method,
            ..TokenProviderOptions::default()
        },
    )
    .context("failed to build token client")?;
    let connector = SseConnector::with_connect_timeout(config.connect_timeout)
        .context("failed to build stream client")?;

    let options = SupervisorOptions::new(config.sse_url())
        .with_inactivity_timeout(config.inactivity_timeout)
        .with_connect_timeout(config.connect_timeout);
    let supervisor = StreamSupervisor::new(tokens, connector, Arc::new(LogDispatcher), options);

    supervisor
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    info!("Notification relay stopped");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "notification_relay=info".into());

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
