//! OAuth2 client-credentials token acquisition.
//!
//! Every call performs exactly one token request. Nothing is cached: the
//! supervisor asks for a new credential on every connect attempt.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Path of the token endpoint relative to the notification service base URL.
pub const TOKEN_ENDPOINT_PATH: &str = "/authz/api/oauth/token";

/// Short-lived bearer token used to authorize one stream connection.
#[derive(Clone)]
pub struct Credential {
    token: SecretString,
}

impl Credential {
    /// Wraps a bearer token returned by the issuer.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::new(token.into()),
        }
    }

    /// Raw token value.
    pub fn token(&self) -> &str {
        self.token.expose_secret()
    }

    /// Value for the `Authorization` request header.
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Source of stream credentials.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetches a new credential. Implementations must not retry internally.
    async fn fetch_token(&self) -> Result<Credential, AuthError>;
}

/// How the client authenticates itself to the token endpoint.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ClientAuthMethod {
    /// Client id and secret in an HTTP Basic `Authorization` header.
    #[default]
    ClientSecretBasic,
    /// Client id and secret as form fields of the request body.
    ClientSecretPost,
}

impl ClientAuthMethod {
    /// Parses a configured method name; the short forms `basic`/`post` are accepted.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "client_secret_basic" | "basic" => Some(Self::ClientSecretBasic),
            "client_secret_post" | "post" => Some(Self::ClientSecretPost),
            _ => None,
        }
    }
}

/// Default timeouts used by [`ClientCredentialsProvider`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TokenProviderDefaults;

impl TokenProviderDefaults {
    /// TCP/TLS connect timeout for the token endpoint.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Whole-request timeout for one token fetch.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Construction options for [`ClientCredentialsProvider`].
#[derive(Clone, Debug)]
pub struct TokenProviderOptions {
    /// Connect timeout applied to the underlying HTTP client.
    pub connect_timeout: Duration,
    /// Timeout for a single token request.
    pub request_timeout: Duration,
    /// Client authentication scheme at the token endpoint.
    pub auth_method: ClientAuthMethod,
}

impl Default for TokenProviderOptions {
    fn default() -> Self {
        Self {
            connect_timeout: TokenProviderDefaults::CONNECT_TIMEOUT,
            request_timeout: TokenProviderDefaults::REQUEST_TIMEOUT,
            auth_method: ClientAuthMethod::default(),
        }
    }
}

/// [`TokenProvider`] performing the OAuth2 client-credentials grant.
#[derive(Clone)]
pub struct ClientCredentialsProvider {
    http: Client,
    token_endpoint: String,
    client_id: String,
    client_secret: SecretString,
    request_timeout: Duration,
    auth_method: ClientAuthMethod,
}

impl ClientCredentialsProvider {
    /// Creates a provider with default options.
    pub fn new(
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Result<Self, AuthError> {
        Self::with_options(
            token_endpoint,
            client_id,
            client_secret,
            TokenProviderOptions::default(),
        )
    }

    /// Creates a provider with explicit timeouts and auth method.
    pub fn with_options(
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
        options: TokenProviderOptions,
    ) -> Result<Self, AuthError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(AuthError::Transport)?;

        Ok(Self {
            http,
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            client_secret,
            request_timeout: options.request_timeout,
            auth_method: options.auth_method,
        })
    }

    /// Token endpoint URL this provider posts to.
    pub fn token_endpoint(&self) -> &str {
        &self.token_endpoint
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsProvider {
    async fn fetch_token(&self) -> Result<Credential, AuthError> {
        let builder = self
            .http
            .post(&self.token_endpoint)
            .timeout(self.request_timeout);

        let builder = match self.auth_method {
            ClientAuthMethod::ClientSecretBasic => builder
                .basic_auth(&self.client_id, Some(self.client_secret.expose_secret()))
                .form(&[("grant_type", "client_credentials")]),
            ClientAuthMethod::ClientSecretPost => builder.form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret().as_str()),
            ]),
        };

        let response = builder.send().await.map_err(AuthError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(AuthError::Transport)?;

        if !status.is_success() {
            return Err(AuthError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        let credential = parse_token_response(&body)?;
        debug!(event = "token_fetched", endpoint = %self.token_endpoint);
        Ok(credential)
    }
}

/// Failure to obtain a credential from the identity issuer.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Transport(reqwest::Error),

    #[error("token endpoint returned {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("token response has no usable access_token")]
    MissingToken,

    #[error("failed to parse token response: {0}")]
    Parse(String),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
}

fn parse_token_response(body: &str) -> Result<Credential, AuthError> {
    let parsed: TokenResponse =
        serde_json::from_str(body).map_err(|err| AuthError::Parse(err.to_string()))?;

    if let Some(token_type) = parsed.token_type.as_deref() {
        if !token_type.eq_ignore_ascii_case("bearer") {
            return Err(AuthError::Parse(format!(
                "unsupported token_type {token_type}"
            )));
        }
    }

    match parsed.access_token {
        Some(token) if !token.trim().is_empty() => Ok(Credential::bearer(token)),
        _ => Err(AuthError::MissingToken),
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error_description: Option<String>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed
            .error_description
            .or(parsed.error)
            .or(parsed.message)
        {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
