//! Environment-derived relay configuration.

use std::env;
use std::fmt;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

use crate::auth::{ClientAuthMethod, TOKEN_ENDPOINT_PATH};
use crate::stream::client::{DEFAULT_CONNECT_TIMEOUT, SSE_ENDPOINT_PATH};
use crate::stream::watchdog::DEFAULT_INACTIVITY_TIMEOUT;

pub const ENV_BASE_URL: &str = "BASE_URL";
pub const ENV_CLIENT_ID: &str = "AUTHZ_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "AUTHZ_CLIENT_SECRET";
pub const ENV_CLIENT_AUTH_METHOD: &str = "AUTHZ_CLIENT_AUTH_METHOD";
pub const ENV_INACTIVITY_TIMEOUT_SECS: &str = "INACTIVITY_TIMEOUT_SECS";
pub const ENV_CONNECT_TIMEOUT_SECS: &str = "CONNECT_TIMEOUT_SECS";

/// Runtime configuration of the relay binary.
#[derive(Clone)]
pub struct RelayConfig {
    /// Notification service base URL without a trailing slash.
    pub base_url: String,
    /// OAuth2 client id at the token endpoint.
    pub client_id: String,
    /// OAuth2 client secret at the token endpoint.
    pub client_secret: SecretString,
    /// How the client id and secret are presented.
    pub client_auth_method: ClientAuthMethod,
    /// Silence tolerated before the stream is recycled.
    pub inactivity_timeout: Duration,
    /// Bound on connecting to the token and stream endpoints.
    pub connect_timeout: Duration,
}

impl RelayConfig {
    /// Loads the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let base_url = required(ENV_BASE_URL)?.trim_end_matches('/').to_string();
        let client_id = required(ENV_CLIENT_ID)?;
        let client_secret = SecretString::new(required(ENV_CLIENT_SECRET)?);

        let client_auth_method = match lookup(ENV_CLIENT_AUTH_METHOD) {
            Some(value) => ClientAuthMethod::parse(&value).ok_or_else(|| ConfigError::Invalid {
                key: ENV_CLIENT_AUTH_METHOD,
                value,
            })?,
            None => ClientAuthMethod::default(),
        };

        Ok(Self {
            base_url,
            client_id,
            client_secret,
            client_auth_method,
            inactivity_timeout: parse_secs(
                &lookup,
                ENV_INACTIVITY_TIMEOUT_SECS,
                DEFAULT_INACTIVITY_TIMEOUT,
            )?,
            connect_timeout: parse_secs(&lookup, ENV_CONNECT_TIMEOUT_SECS, DEFAULT_CONNECT_TIMEOUT)?,
        })
    }

    /// Full URL of the SSE endpoint.
    pub fn sse_url(&self) -> String {
        format!("{}{}", self.base_url, SSE_ENDPOINT_PATH)
    }

    /// Full URL of the OAuth2 token endpoint.
    pub fn token_endpoint(&self) -> String {
        format!("{}{}", self.base_url, TOKEN_ENDPOINT_PATH)
    }
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("client_auth_method", &self.client_auth_method)
            .field("inactivity_timeout", &self.inactivity_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

fn parse_secs<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::Invalid { key, value }),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}
