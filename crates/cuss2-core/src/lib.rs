//! Application-side logic for CUSS 2 kiosk sessions, layered on `cuss2-api`.
//!
//! - **[`Cuss2`]** -- the engine. [`connect()`](Cuss2::connect) opens the
//!   session, adopts the platform's device id, discovers components and
//!   queries their status. It then tracks the application state the
//!   platform reports and keeps it in step with required-component
//!   readiness.
//!
//! - **Component registry** -- discovered peripherals as
//!   [`ComponentRecord`]s, classified into a [`DeviceType`] by
//!   [`discover`]. Changes are pushed as `watch` snapshots
//!   ([`ComponentSnapshot`]).
//!
//! - **State machine** -- [`request_allowed`] decides which state requests
//!   the application may issue; at most one is in flight at a time.
//!
//! - **[`PlatformLink`]** -- the seam between the engine and the transport.
//!   `cuss2_api::Connection` implements it.

pub mod component;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod event;
pub mod link;
mod registry;
pub mod state;

pub use component::{ComponentRecord, DeviceType};
pub use discovery::discover;
pub use engine::Cuss2;
pub use error::CoreError;
pub use event::EngineEvent;
pub use link::PlatformLink;
pub use registry::ComponentSnapshot;
pub use state::{ApplicationStateChange, request_allowed};
