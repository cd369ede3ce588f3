// ── Core error types ──
//
// User-facing errors from cuss2-core. The `From<cuss2_api::Error>` impl
// folds transport detail into a handful of variants an embedding
// application can act on.

use cuss2_api::{ComponentId, PlatformResponseError};
use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to platform: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Not connected to the platform")]
    NotConnected,

    #[error("Platform did not answer within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The platform is not in a state a session can start from.
    #[error("Initialization failed: {message}")]
    Initialization { message: String },

    // ── Protocol errors ──────────────────────────────────────────────
    /// A response carried a critical status code.
    #[error(transparent)]
    PlatformRejected(Box<PlatformResponseError>),

    #[error("Protocol violation: {message}")]
    Protocol { message: String },

    #[error("Unknown component: {id}")]
    ComponentNotFound { id: ComponentId },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// The platform's full response, when it rejected the request.
    pub fn rejection(&self) -> Option<&PlatformResponseError> {
        match self {
            Self::PlatformRejected(e) => Some(e),
            _ => None,
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<cuss2_api::Error> for CoreError {
    fn from(err: cuss2_api::Error) -> Self {
        use cuss2_api::Error as Api;

        match err {
            Api::Authentication { message } => CoreError::AuthenticationFailed { message },
            Api::Platform(rejection) => CoreError::PlatformRejected(rejection),
            Api::Timeout { timeout_ms } => CoreError::Timeout { timeout_ms },
            Api::NotConnected => CoreError::NotConnected,
            Api::WebSocketClosed { code, reason } => CoreError::ConnectionFailed {
                reason: format!("socket closed (code {code}): {reason}"),
            },
            e @ (Api::Transport(_)
            | Api::HttpStatus { .. }
            | Api::WebSocketConnect(_)
            | Api::Socket(_)
            | Api::InvalidUrl(_)
            | Api::UnsupportedScheme(_)) => CoreError::ConnectionFailed {
                reason: e.to_string(),
            },
            Api::MalformedMessage(message) | Api::Deserialization { message, .. } => {
                CoreError::Protocol { message }
            }
            Api::Json(e) => CoreError::Internal(format!("JSON encoding error: {e}")),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Protocol {
            message: format!("unexpected payload shape: {err}"),
        }
    }
}
