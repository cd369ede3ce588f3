use thiserror::Error;

use crate::models::{MessageCode, PlatformData, PlatformDirective};

/// Top-level error type for the `cuss2-api` crate.
///
/// Covers authentication, transport, socket, and correlated-response
/// failures. `cuss2-core` maps these into user-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// The OAuth endpoint rejected the client credentials (HTTP 401).
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success HTTP status other than 401.
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Base URL scheme is none of http, https, ws, wss.
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// A correlated request got no answer in time.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed while a caller was waiting.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// An open socket failed while a caller was waiting.
    #[error("WebSocket error: {0}")]
    Socket(String),

    /// `send` was called without an open socket.
    #[error("WebSocket is not open")]
    NotConnected,

    /// The platform sent a frame that is not valid JSON.
    #[error("Malformed platform message: {0}")]
    MalformedMessage(String),

    // ── Data ────────────────────────────────────────────────────────
    /// JSON (de)serialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// Outbound envelope could not be encoded.
    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    // ── Platform ────────────────────────────────────────────────────
    /// A correlated response carried a critical status code.
    #[error(transparent)]
    Platform(Box<PlatformResponseError>),
}

/// A response whose `messageCode` is in the critical set.
///
/// Carries the full response so callers can inspect payload details.
#[derive(Debug, Clone, Error)]
#[error("Platform rejected {directive}: {message_code}")]
pub struct PlatformResponseError {
    pub directive: PlatformDirective,
    pub message_code: MessageCode,
    pub response: PlatformData,
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    ///
    /// Only authentication and socket (re)connection loops consult this.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::HttpStatus { status, .. } => *status >= 500,
            Self::Timeout { .. } | Self::WebSocketConnect(_) => true,
            _ => false,
        }
    }

    /// Returns `true` if the credentials themselves were rejected.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// The critical status code, if the platform rejected the request.
    pub fn message_code(&self) -> Option<MessageCode> {
        match self {
            Self::Platform(e) => Some(e.message_code),
            _ => None,
        }
    }
}

impl From<PlatformResponseError> for Error {
    fn from(err: PlatformResponseError) -> Self {
        Self::Platform(Box::new(err))
    }
}
