//! Configuration for CUSS 2 applications.
//!
//! TOML file plus `CUSS2_`-prefixed environment overrides, client-secret
//! resolution (named env var, then `CUSS2_CLIENT_SECRET`, then plaintext),
//! and translation to `cuss2_api::ConnectionConfig`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cuss2_api::models::DEFAULT_DEVICE_ID;
use cuss2_api::{ConnectionConfig, RetryPolicy};
use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Environment variable consulted for the client secret when the file
/// does not name one.
pub const CLIENT_SECRET_ENV: &str = "CUSS2_CLIENT_SECRET";

const ENV_PREFIX: &str = "CUSS2_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("missing required setting '{field}'")]
    Missing { field: String },

    #[error("no client secret configured")]
    NoCredentials,

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Platform base URL (`http`, `https`, `ws` or `wss`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Plaintext secret. Prefer `client_secret_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Name of an environment variable holding the secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// Token endpoint override; derived from `base_url` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,

    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_timeout")]
    pub http_timeout_secs: u64,

    /// Default `tracing` filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: None,
            client_id: None,
            client_secret: None,
            client_secret_env: None,
            device_id: None,
            token_url: None,
            request_timeout_secs: default_timeout(),
            http_timeout_secs: default_timeout(),
            log_filter: default_log_filter(),
            retry: RetrySettings::default(),
        }
    }
}

/// `[retry]` table, mirrored onto `RetryPolicy`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_timeout_ms: 1_000,
            max_timeout_ms: 64_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            min_timeout: Duration::from_millis(settings.min_timeout_ms),
            max_timeout: Duration::from_millis(settings.max_timeout_ms),
            multiplier: settings.multiplier,
            jitter: settings.jitter,
        }
    }
}

fn default_timeout() -> u64 {
    30
}
fn default_log_filter() -> String {
    "info".into()
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "cuss2", "cuss2").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("cuss2");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Load from the canonical path plus environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` plus environment. A missing file yields defaults.
///
/// Nested keys use a double underscore: `CUSS2_RETRY__MAX_ATTEMPTS`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    debug!(path = %path.display(), exists = path.exists(), "loading config");
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Serialize config to TOML and write it to `path`.
pub fn save_config_to(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    debug!(path = %path.display(), "config saved");
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

impl Config {
    /// Resolve the client secret from the process environment.
    pub fn resolve_client_secret(&self) -> Result<SecretString, ConfigError> {
        self.resolve_client_secret_with(|name| std::env::var(name).ok())
    }

    /// Resolve the client secret, looking variables up through `lookup`.
    pub fn resolve_client_secret_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<SecretString, ConfigError> {
        // 1. Configured env var name
        if let Some(name) = self.client_secret_env.as_deref() {
            if let Some(secret) = lookup(name) {
                debug!(source = name, "client secret resolved");
                return Ok(SecretString::from(secret));
            }
        }

        // 2. Well-known env var
        if let Some(secret) = lookup(CLIENT_SECRET_ENV) {
            debug!(source = CLIENT_SECRET_ENV, "client secret resolved");
            return Ok(SecretString::from(secret));
        }

        // 3. Plaintext in config
        if let Some(ref secret) = self.client_secret {
            debug!(source = "config file", "client secret resolved");
            return Ok(SecretString::from(secret.clone()));
        }

        Err(ConfigError::NoCredentials)
    }

    /// Validate and build a `ConnectionConfig`.
    pub fn to_connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        let secret = self.resolve_client_secret()?;
        self.to_connection_config_with_secret(secret)
    }

    /// Like [`to_connection_config`](Self::to_connection_config) with an
    /// already resolved secret.
    pub fn to_connection_config_with_secret(
        &self,
        secret: SecretString,
    ) -> Result<ConnectionConfig, ConfigError> {
        let base_url = parse_url("base_url", required("base_url", self.base_url.as_deref())?)?;
        let client_id = required("client_id", self.client_id.as_deref())?;

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Validation {
                field: "request_timeout_secs".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation {
                field: "retry.max_attempts".into(),
                reason: "must be at least 1".into(),
            });
        }

        let mut config = ConnectionConfig::new(base_url, client_id, secret)
            .with_device_id(
                self.device_id
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_owned()),
            )
            .with_retry(RetryPolicy::from(&self.retry))
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs));
        config.http_timeout = Duration::from_secs(self.http_timeout_secs);

        if let Some(ref token_url) = self.token_url {
            config = config.with_token_url(parse_url("token_url", token_url)?);
        }
        Ok(config)
    }
}

fn required<'a>(field: &str, value: Option<&'a str>) -> Result<&'a str, ConfigError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::Missing {
            field: field.into(),
        })
}

fn parse_url(field: &str, raw: &str) -> Result<Url, ConfigError> {
    raw.parse().map_err(|e: url::ParseError| ConfigError::Validation {
        field: field.into(),
        reason: format!("invalid URL '{raw}': {e}"),
    })
}

// ── Tracing ─────────────────────────────────────────────────────────

/// Install a fmt subscriber. `RUST_LOG` wins over `default_filter`.
/// A second call is a no-op.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .try_init();
}
