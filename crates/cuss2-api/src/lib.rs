//! Async transport layer for CUSS 2 kiosk platforms.
//!
//! Handles the pieces every platform session needs:
//!
//! - **[`TokenManager`]** -- OAuth client-credentials token fetch and
//!   refresh one second before expiry.
//! - **[`Connection`]** -- the WebSocket session: authenticate, connect
//!   with exponential backoff, reconnect on abnormal close, answer pings,
//!   and correlate requests with responses by `requestID`.
//! - **[`models`]** -- the `ApplicationData` / `PlatformData` wire model.
//!
//! Component bookkeeping and the application state machine live in
//! `cuss2-core`; this crate only moves frames.

pub mod config;
pub mod connection;
pub mod endpoints;
pub mod error;
pub mod events;
pub mod models;
pub mod retry;
pub mod token;

pub use config::ConnectionConfig;
pub use connection::{CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, Connection};
pub use endpoints::Endpoints;
pub use error::{Error, PlatformResponseError};
pub use events::{ConnectionEvent, ConnectionObserver, ConnectionState};
pub use models::{
    ApplicationActivation, ApplicationData, ApplicationStateCode, ComponentId, ComponentState,
    MessageCode, PlatformData, PlatformDirective,
};
pub use retry::RetryPolicy;
pub use token::{Token, TokenManager};
