// Typed engine events, fanned out on a `broadcast` channel.

use std::sync::Arc;

use cuss2_api::{ApplicationActivation, ApplicationStateCode, ConnectionEvent, PlatformData};

use crate::component::ComponentRecord;
use crate::error::CoreError;
use crate::state::ApplicationStateChange;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Transport lifecycle: authentication, connecting, open, close, errors.
    Connection(ConnectionEvent),
    /// Initialization finished on a freshly opened socket.
    Connected,
    StateChange(ApplicationStateChange),
    /// The platform moved the application to ACTIVE.
    Activated(ApplicationActivation),
    /// The application left ACTIVE for `next`.
    Deactivated { next: ApplicationStateCode },
    ComponentStateChange(ComponentRecord),
    /// Every platform message, after the engine has applied it.
    Message(Arc<PlatformData>),
    Error(Arc<CoreError>),
}
