// Application state machine rules
//
// STOPPED -> INITIALIZE -> UNAVAILABLE <-> AVAILABLE <-> ACTIVE, with
// STOPPED and RELOAD reachable from anywhere the table allows.

use std::sync::atomic::{AtomicBool, Ordering};

use cuss2_api::ApplicationStateCode;
use serde::Serialize;

/// A transition the platform reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ApplicationStateChange {
    pub previous: ApplicationStateCode,
    pub current: ApplicationStateCode,
}

impl ApplicationStateChange {
    /// Synthetic value before the platform reports anything.
    pub const INITIAL: Self = Self {
        previous: ApplicationStateCode::Stopped,
        current: ApplicationStateCode::Stopped,
    };
}

impl Default for ApplicationStateChange {
    fn default() -> Self {
        Self::INITIAL
    }
}

/// Whether the application may ask for `target` while in `current`.
///
/// `current` is `None` until the platform has reported a state.
pub fn request_allowed(
    target: ApplicationStateCode,
    current: Option<ApplicationStateCode>,
) -> bool {
    use ApplicationStateCode::{
        Active, Available, Disabled, Initialize, Reload, Stopped, Suspended, Unavailable,
    };

    match target {
        Initialize => matches!(current, None | Some(Stopped)),
        Unavailable => matches!(current, Some(Initialize | Available | Active)),
        Available => matches!(current, Some(Unavailable | Active)),
        Active => matches!(current, Some(Available | Active)),
        Stopped => true,
        Reload => matches!(current, None | Some(Unavailable | Available | Active)),
        Suspended | Disabled => false,
    }
}

/// At most one state-change request in flight.
#[derive(Debug, Default)]
pub(crate) struct SingleFlight {
    busy: AtomicBool,
}

impl SingleFlight {
    /// Claim the slot, or `None` if a request is already pending.
    pub(crate) fn try_acquire(&self) -> Option<FlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { flight: self })
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the slot when the request settles, whatever the outcome.
pub(crate) struct FlightGuard<'a> {
    flight: &'a SingleFlight,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flight.busy.store(false, Ordering::Release);
    }
}
