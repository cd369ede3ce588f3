// OAuth client-credentials token lifecycle
//
// One token per session. `authorize` fetches it with retry; the refresh
// timer re-runs `authorize` one second before expiry and re-arms itself.
// A failed scheduled refresh is reported on the event stream, never raised.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Error;
use crate::events::{ConnectionEvent, EventBus};
use crate::retry::{RetryPolicy, retry};

/// An issued access token.
#[derive(Debug, Clone)]
pub struct Token {
    pub access_token: SecretString,
    /// Lifetime in seconds as reported by the token endpoint.
    pub expires_in: i64,
    pub token_type: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
    #[serde(default = "default_token_type")]
    token_type: String,
}

fn default_token_type() -> String {
    "Bearer".into()
}

impl From<TokenResponse> for Token {
    fn from(raw: TokenResponse) -> Self {
        Self {
            access_token: SecretString::from(raw.access_token),
            expires_in: raw.expires_in,
            token_type: raw.token_type,
        }
    }
}

/// Delay before refreshing a token that lives `expires_in` seconds.
///
/// Non-positive lifetimes never refresh.
pub fn refresh_delay(expires_in: i64) -> Option<Duration> {
    if expires_in <= 0 {
        return None;
    }
    let secs = u64::try_from(expires_in - 1).unwrap_or(0);
    Some(Duration::from_secs(secs))
}

/// Fetches and refreshes the session's OAuth token.
pub struct TokenManager {
    http: reqwest::Client,
    token_url: Url,
    client_id: String,
    client_secret: SecretString,
    retry: RetryPolicy,
    events: Arc<EventBus>,
    token: ArcSwapOption<Token>,
    refresh: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl TokenManager {
    pub(crate) fn new(
        http: reqwest::Client,
        token_url: Url,
        client_id: String,
        client_secret: SecretString,
        retry: RetryPolicy,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            http,
            token_url,
            client_id,
            client_secret,
            retry,
            events,
            token: ArcSwapOption::empty(),
            refresh: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// The current token, if one has been issued.
    pub fn token(&self) -> Option<Arc<Token>> {
        self.token.load_full()
    }

    /// The current access token in plain text, for stamping outbound frames.
    pub(crate) fn access_token(&self) -> Option<String> {
        self.token
            .load()
            .as_ref()
            .map(|t| t.access_token.expose_secret().to_owned())
    }

    /// Obtain a token, retrying transient failures per the retry policy.
    ///
    /// HTTP 401 fails immediately with [`Error::Authentication`].
    pub async fn authorize(&self) -> Result<Token, Error> {
        let token = retry(&self.retry, &self.shutdown, |attempt| {
            self.events.emit(ConnectionEvent::Authenticating { attempt });
            self.request_token()
        })
        .await?;

        info!(
            token_type = %token.token_type,
            expires_in = token.expires_in,
            "access token obtained"
        );
        self.token.store(Some(Arc::new(token.clone())));
        self.events.emit(ConnectionEvent::Authenticated {
            token_type: token.token_type.clone(),
            expires_in: token.expires_in,
        });
        Ok(token)
    }

    async fn request_token(&self) -> Result<Token, Error> {
        debug!(url = %self.token_url, "requesting access token");

        let resp = self
            .http
            .post(self.token_url.clone())
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication {
                message: "client credentials rejected (HTTP 401)".into(),
            });
        }

        let body = resp.text().await?;
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let raw: TokenResponse =
            serde_json::from_str(&body).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body: body.clone(),
            })?;
        Ok(raw.into())
    }

    /// Arm the refresh timer for a token that lives `expires_in` seconds.
    ///
    /// Any previously armed timer is cancelled first.
    pub fn schedule_refresh(self: &Arc<Self>, expires_in: i64) {
        self.cancel_refresh();

        let Some(delay) = refresh_delay(expires_in) else {
            debug!(expires_in, "token does not expire, no refresh armed");
            return;
        };

        let timer = self.shutdown.child_token();
        *self.refresh.lock().unwrap_or_else(PoisonError::into_inner) = Some(timer.clone());

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = timer.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            debug!("refreshing access token");
            match manager.authorize().await {
                Ok(token) => manager.schedule_refresh(token.expires_in),
                Err(e) => {
                    warn!(error = %e, "token refresh failed");
                    manager
                        .events
                        .emit(ConnectionEvent::AuthenticationError { message: e.to_string() });
                }
            }
        });
    }

    /// Whether a refresh timer is currently armed.
    pub fn refresh_armed(&self) -> bool {
        self.refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    /// Disarm the refresh timer, if any.
    pub fn cancel_refresh(&self) {
        if let Some(timer) = self
            .refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.cancel();
        }
    }

    /// Stop the refresh timer and abort any in-flight retry backoff.
    pub(crate) fn shutdown(&self) {
        self.cancel_refresh();
        self.shutdown.cancel();
    }
}
