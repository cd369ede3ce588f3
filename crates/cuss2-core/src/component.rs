// Component records and their update contract
//
// Every peripheral the platform exposes is tracked as one `ComponentRecord`.
// Inbound messages addressed to a component go through `update_state`,
// which picks the modern path when the message carries a
// `currentComponentState` block and the legacy path otherwise.

use cuss2_api::models::CurrentComponentState;
use cuss2_api::{ApplicationStateCode, ComponentId, ComponentState, MessageCode, PlatformData};
use serde::Serialize;

/// Concrete peripheral variant, chosen once at discovery time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case", tag = "kind")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceType {
    Feeder,
    Dispenser,
    BagTagPrinter {
        feeder: Option<ComponentId>,
        dispenser: Option<ComponentId>,
    },
    BoardingPassPrinter {
        feeder: Option<ComponentId>,
        dispenser: Option<ComponentId>,
    },
    DocumentReader,
    BarcodeReader,
    CardReader,
    Keypad,
    Headset,
    Scale,
    Camera,
    InsertionBelt,
    VerificationBelt,
    ParkingBelt,
    Rfid,
    Illumination,
    Announcement,
    Generic,
}

impl DeviceType {
    pub fn is_printer(&self) -> bool {
        matches!(
            self,
            Self::BagTagPrinter { .. } | Self::BoardingPassPrinter { .. }
        )
    }
}

/// The three fields an inbound message can change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Derived {
    component_state: ComponentState,
    status: MessageCode,
    enabled: bool,
}

/// Tracked state of one platform component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentRecord {
    pub id: ComponentId,
    pub device_type: DeviceType,
    pub description: Option<String>,
    pub component_state: ComponentState,
    pub status: MessageCode,
    pub enabled: bool,
    /// Unavailability of a required component keeps the application unavailable.
    pub required: bool,
    /// In-flight directives addressed to this component.
    pub pending_calls: u32,
}

impl ComponentRecord {
    pub fn new(id: ComponentId, device_type: DeviceType) -> Self {
        Self {
            id,
            device_type,
            description: None,
            component_state: ComponentState::Unavailable,
            status: MessageCode::Ok,
            enabled: false,
            required: false,
            pending_calls: 0,
        }
    }

    pub fn ready(&self) -> bool {
        self.component_state == ComponentState::Ready
    }

    /// Whether `msg` would change this record.
    pub fn state_is_different(
        &self,
        msg: &PlatformData,
        app_state: Option<ApplicationStateCode>,
    ) -> bool {
        self.derive(msg, app_state) != self.current()
    }

    /// Apply `msg`. Returns `true` if anything changed.
    pub fn update_state(
        &mut self,
        msg: &PlatformData,
        app_state: Option<ApplicationStateCode>,
    ) -> bool {
        let next = self.derive(msg, app_state);
        if next == self.current() {
            return false;
        }
        self.component_state = next.component_state;
        self.status = next.status;
        self.enabled = next.enabled;
        true
    }

    fn current(&self) -> Derived {
        Derived {
            component_state: self.component_state,
            status: self.status,
            enabled: self.enabled,
        }
    }

    fn derive(&self, msg: &PlatformData, app_state: Option<ApplicationStateCode>) -> Derived {
        let mut next = match msg.meta.current_component_state {
            Some(CurrentComponentState {
                component_state,
                status,
                enabled,
            }) => Derived {
                component_state,
                status,
                enabled,
            },
            None => {
                let mut next = self.current();
                if let Some(state) = msg.meta.component_state {
                    next.component_state = state;
                }
                // A command's own response code says nothing about the device.
                if msg.is_unsolicited() || msg.is_query_response() {
                    next.status = msg.message_code();
                }
                next
            }
        };

        if next.component_state == ComponentState::Unavailable
            || app_state != Some(ApplicationStateCode::Active)
        {
            next.enabled = false;
        }
        next
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cuss2_api::PlatformDirective;
    use serde_json::json;

    use super::*;

    const ACTIVE: Option<ApplicationStateCode> = Some(ApplicationStateCode::Active);

    fn msg(meta: serde_json::Value) -> PlatformData {
        serde_json::from_value(json!({ "meta": meta })).unwrap()
    }

    fn ready_record() -> ComponentRecord {
        let mut record = ComponentRecord::new(7, DeviceType::BarcodeReader);
        record.component_state = ComponentState::Ready;
        record
    }

    #[test]
    fn legacy_command_response_keeps_status() {
        let mut record = ready_record();
        let response = msg(json!({
            "componentID": 7,
            "messageCode": "MEDIA_LOW",
            "platformDirective": PlatformDirective::PeripheralsSend,
        }));

        assert!(!record.state_is_different(&response, ACTIVE));
        assert!(!record.update_state(&response, ACTIVE));
        assert_eq!(record.status, MessageCode::Ok);
    }

    #[test]
    fn legacy_unsolicited_and_query_update_status() {
        let mut record = ready_record();

        let unsolicited = msg(json!({ "componentID": 7, "messageCode": "MEDIA_LOW" }));
        assert!(record.update_state(&unsolicited, ACTIVE));
        assert_eq!(record.status, MessageCode::MediaLow);

        let query = msg(json!({
            "componentID": 7,
            "messageCode": "OK",
            "platformDirective": "peripherals_query",
        }));
        assert!(record.update_state(&query, ACTIVE));
        assert_eq!(record.status, MessageCode::Ok);
    }

    #[test]
    fn legacy_component_state_and_enabled() {
        let mut record = ready_record();
        record.enabled = true;

        // Enabled is left alone while the application is active.
        let ready = msg(json!({ "componentID": 7, "componentState": "READY" }));
        assert!(!record.update_state(&ready, ACTIVE));
        assert!(record.enabled);

        let gone = msg(json!({ "componentID": 7, "componentState": "UNAVAILABLE" }));
        assert!(record.update_state(&gone, ACTIVE));
        assert!(!record.ready());
        assert!(!record.enabled);
    }

    #[test]
    fn modern_block_is_authoritative() {
        let mut record = ComponentRecord::new(7, DeviceType::Generic);
        let update = msg(json!({
            "componentID": 7,
            "messageCode": "OK",
            "platformDirective": "peripherals_send",
            "currentComponentState": {
                "componentState": "READY",
                "status": "MEDIA_HIGH",
                "enabled": true
            }
        }));

        assert!(record.update_state(&update, ACTIVE));
        assert!(record.ready());
        assert_eq!(record.status, MessageCode::MediaHigh);
        assert!(record.enabled);
    }

    #[test]
    fn modern_enabled_cleared_unless_active() {
        let mut record = ComponentRecord::new(7, DeviceType::Generic);
        let update = msg(json!({
            "componentID": 7,
            "currentComponentState": { "componentState": "READY", "status": "OK", "enabled": true }
        }));

        record.update_state(&update, Some(ApplicationStateCode::Available));
        assert!(record.ready());
        assert!(!record.enabled);
    }

    #[test]
    fn modern_enabled_cleared_when_unavailable() {
        let mut record = ready_record();
        let update = msg(json!({
            "componentID": 7,
            "currentComponentState": { "componentState": "UNAVAILABLE", "status": "HARDWARE_ERROR", "enabled": true }
        }));

        record.update_state(&update, ACTIVE);
        assert!(!record.enabled);
        assert_eq!(record.status, MessageCode::HardwareError);
    }
}
