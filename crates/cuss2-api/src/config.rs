// Session configuration for a single platform connection.

use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::error::Error;
use crate::models::DEFAULT_DEVICE_ID;
use crate::retry::RetryPolicy;

const USER_AGENT: &str = concat!("cuss2-rs/", env!("CARGO_PKG_VERSION"));

/// Everything a [`Connection`](crate::Connection) needs to reach a platform.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Platform base URL (`http`, `https`, `ws` or `wss`).
    pub base_url: Url,
    pub client_id: String,
    pub client_secret: SecretString,
    /// Device id stamped on outbound frames. May be replaced by the
    /// platform-reported id during initialization.
    pub device_id: String,
    /// Explicit token endpoint; derived from `base_url` when absent.
    pub token_url: Option<Url>,
    /// Backoff for authentication and socket (re)connects.
    pub retry: RetryPolicy,
    /// How long a correlated request waits for its response.
    pub request_timeout: Duration,
    /// Timeout applied to OAuth HTTP calls.
    pub http_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(base_url: Url, client_id: impl Into<String>, client_secret: SecretString) -> Self {
        Self {
            base_url,
            client_id: client_id.into(),
            client_secret,
            device_id: DEFAULT_DEVICE_ID.to_owned(),
            token_url: None,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            http_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn with_token_url(mut self, token_url: Url) -> Self {
        self.token_url = Some(token_url);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Build the HTTP client used for token requests.
    pub fn build_http_client(&self) -> Result<reqwest::Client, Error> {
        let client = reqwest::Client::builder()
            .timeout(self.http_timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(client)
    }
}
