// CUSS 2 wire model
//
// Outbound frames are `ApplicationData` envelopes (`{meta, payload}`),
// inbound frames are `PlatformData`. Field names follow the platform's
// camelCase JSON with the `ID` suffix spelled in capitals.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Numeric identifier the platform assigns to a peripheral component.
pub type ComponentId = i64;

/// Device id the platform uses when none has been provisioned.
pub const DEFAULT_DEVICE_ID: &str = "00000000-0000-0000-0000-000000000000";

// ── Enumerations ────────────────────────────────────────────────────

/// Application state as tracked by the platform.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ApplicationStateCode {
    Stopped,
    Initialize,
    Unavailable,
    Available,
    Active,
    Reload,
    Suspended,
    Disabled,
}

/// Readiness of a single peripheral component.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ComponentState {
    Ready,
    #[default]
    Unavailable,
    Released,
    #[serde(other)]
    Unknown,
}

/// Status code carried in every platform response.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageCode {
    #[default]
    Ok,
    Cancelled,
    WrongState,
    OutOfSequence,
    Timeout,
    SessionTimeout,
    KillTimeout,
    SoftwareError,
    CriticalSoftwareError,
    FormatError,
    LengthError,
    DataMissing,
    DataPresent,
    ThresholdError,
    ThresholdUsage,
    ThresholdWarning,
    HardwareError,
    NotReachable,
    NotResponding,
    MediaPresent,
    MediaAbsent,
    MediaFull,
    MediaHigh,
    MediaLow,
    MediaEmpty,
    MediaJammed,
    MediaDamaged,
    MediaIncomplete,
    BaggageFull,
    BaggageUndetected,
    BaggagePresent,
    BaggageAbsent,
    BaggageOversized,
    BaggageTooManyBags,
    BaggageUnexpectedBag,
    BaggageTooHigh,
    BaggageTooLong,
    BaggageTooFlat,
    BaggageTooShort,
    BaggageInvalidData,
    BaggageWeightOutOfRange,
    BaggageJammed,
    BaggageEmergencyStop,
    BaggageRestless,
    BaggageTransportBusy,
    BaggageMistracked,
    BaggageUnexpectedChange,
    BaggageInterferenceUser,
    BaggageIntrusionSafety,
    BaggageNotConveyable,
    BaggageIrregularBag,
    BaggageMetalDetected,
    #[serde(other)]
    Unknown,
}

impl MessageCode {
    /// Whether a response carrying this code fails the request that produced it.
    ///
    /// Soft conditions (media levels, data present, threshold warnings) and
    /// codes this client does not recognise still resolve the exchange.
    pub fn is_critical(self) -> bool {
        !matches!(
            self,
            Self::Ok
                | Self::DataPresent
                | Self::ThresholdWarning
                | Self::MediaPresent
                | Self::MediaAbsent
                | Self::MediaFull
                | Self::MediaHigh
                | Self::MediaLow
                | Self::MediaEmpty
                | Self::MediaIncomplete
                | Self::BaggagePresent
                | Self::BaggageAbsent
                | Self::Unknown
        )
    }
}

/// Named platform operation an application can request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlatformDirective {
    PlatformEnvironment,
    PlatformComponents,
    PlatformApplicationsStaterequest,
    PeripheralsQuery,
    PeripheralsCancel,
    PeripheralsSetup,
    PeripheralsSend,
    PeripheralsUserpresentEnable,
    PeripheralsUserpresentDisable,
    PeripheralsUserpresentOffer,
    /// A directive this client does not issue, echoed back by the platform.
    #[serde(other)]
    Unknown,
}

// ── Inbound ─────────────────────────────────────────────────────────

/// `meta.currentApplicationState` on inbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationState {
    pub application_state_code: ApplicationStateCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessible_mode: Option<bool>,
}

/// Authoritative component state block (`meta.currentComponentState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentComponentState {
    pub component_state: ComponentState,
    #[serde(default)]
    pub status: MessageCode,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformMeta {
    #[serde(rename = "requestID", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub message_code: MessageCode,
    #[serde(rename = "componentID", default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<ComponentId>,
    #[serde(rename = "deviceID", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_state: Option<ComponentState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_application_state: Option<ApplicationState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_component_state: Option<CurrentComponentState>,
    /// Directive this message answers. Absent on unsolicited messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_directive: Option<PlatformDirective>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A message sent by the platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformData {
    pub meta: PlatformMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl PlatformData {
    pub fn request_id(&self) -> Option<&str> {
        self.meta.request_id.as_deref()
    }

    pub fn component_id(&self) -> Option<ComponentId> {
        self.meta.component_id
    }

    pub fn message_code(&self) -> MessageCode {
        self.meta.message_code
    }

    pub fn application_state(&self) -> Option<ApplicationStateCode> {
        self.meta
            .current_application_state
            .as_ref()
            .map(|s| s.application_state_code)
    }

    /// Messages the platform pushes on its own carry no originating directive.
    pub fn is_unsolicited(&self) -> bool {
        self.meta.platform_directive.is_none()
    }

    /// Whether this message answers an explicit status query.
    pub fn is_query_response(&self) -> bool {
        self.meta.platform_directive == Some(PlatformDirective::PeripheralsQuery)
    }

    /// Decode `payload.<field>` into `T`.
    pub fn payload_field<T: serde::de::DeserializeOwned>(
        &self,
        field: &str,
    ) -> Result<Option<T>, serde_json::Error> {
        match self.payload.as_ref().and_then(|p| p.get(field)) {
            Some(Value::Null) | None => Ok(None),
            Some(v) => serde_json::from_value(v.clone()).map(Some),
        }
    }
}

/// `payload.environmentLevel` from a `platform_environment` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentLevel {
    #[serde(rename = "deviceID", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One entry of `payload.componentList`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentComponent {
    #[serde(rename = "componentID")]
    pub component_id: ComponentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_description: Option<String>,
    #[serde(default)]
    pub component_characteristics: Vec<ComponentCharacteristics>,
    #[serde(rename = "linkedComponentIDs", default)]
    pub linked_component_ids: Vec<ComponentId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentCharacteristics {
    #[serde(default)]
    pub media_types_list: Vec<String>,
    #[serde(default)]
    pub device_types_list: Vec<String>,
    #[serde(default)]
    pub ds_types_list: Vec<String>,
}

/// `payload.applicationActivation`, present when the platform activates the application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationActivation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessible_mode: Option<bool>,
    #[serde(rename = "languageID", default, skip_serializing_if = "Option::is_none")]
    pub language_id: Option<String>,
}

impl ApplicationActivation {
    /// Multi-application mode lets several tenants share one session.
    pub fn is_multi_tenant(&self) -> bool {
        self.execution_mode.as_deref() == Some("MAM")
    }
}

// ── Outbound ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationMeta {
    #[serde(rename = "requestID", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub directive: PlatformDirective,
    #[serde(rename = "componentID", default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<ComponentId>,
    #[serde(rename = "deviceID", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_token: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A directive sent by the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationData {
    pub meta: ApplicationMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ApplicationData {
    pub fn new(directive: PlatformDirective) -> Self {
        Self {
            meta: ApplicationMeta {
                request_id: None,
                directive,
                component_id: None,
                device_id: None,
                oauth_token: None,
                extra: Map::new(),
            },
            payload: None,
        }
    }

    /// A directive addressed to one component.
    pub fn for_component(directive: PlatformDirective, component_id: ComponentId) -> Self {
        let mut data = Self::new(directive);
        data.meta.component_id = Some(component_id);
        data
    }

    /// `platform_applications_staterequest` asking the platform to move to `code`.
    pub fn state_request(code: ApplicationStateCode, reason: Option<&str>) -> Self {
        let mut request = Map::new();
        request.insert("applicationStateCode".into(), Value::String(code.to_string()));
        request.insert(
            "applicationStateChangeReasonCode".into(),
            Value::String("NOT_APPLICABLE".into()),
        );
        if let Some(reason) = reason {
            request.insert(
                "applicationStateChangeReason".into(),
                Value::String(reason.to_owned()),
            );
        }

        let mut payload = Map::new();
        payload.insert("applicationStateChangeRequest".into(), Value::Object(request));

        Self::new(PlatformDirective::PlatformApplicationsStaterequest)
            .with_payload(Value::Object(payload))
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn directive(&self) -> PlatformDirective {
        self.meta.directive
    }

    /// The state a `platform_applications_staterequest` asks for, if this is one.
    pub fn requested_state(&self) -> Option<ApplicationStateCode> {
        let code = self
            .payload
            .as_ref()?
            .get("applicationStateChangeRequest")?
            .get("applicationStateCode")?
            .as_str()?;
        code.parse().ok()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn directive_wire_names() {
        assert_eq!(
            serde_json::to_value(PlatformDirective::PeripheralsUserpresentEnable).unwrap(),
            json!("peripherals_userpresent_enable")
        );
        assert_eq!(
            PlatformDirective::PlatformApplicationsStaterequest.to_string(),
            "platform_applications_staterequest"
        );
    }

    #[test]
    fn parses_inbound_with_unknown_codes() {
        let raw = json!({
            "meta": {
                "requestID": "abc",
                "messageCode": "SOMETHINGNEW",
                "componentID": 7,
                "componentState": "READY",
                "currentApplicationState": { "applicationStateCode": "AVAILABLE" },
                "platformDirective": "peripherals_query",
                "vendorField": 1
            },
            "payload": { "x": 1 }
        });

        let msg: PlatformData = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.request_id(), Some("abc"));
        assert_eq!(msg.message_code(), MessageCode::Unknown);
        assert_eq!(msg.component_id(), Some(7));
        assert_eq!(msg.meta.component_state, Some(ComponentState::Ready));
        assert_eq!(msg.application_state(), Some(ApplicationStateCode::Available));
        assert!(msg.is_query_response());
        assert!(!msg.is_unsolicited());
        assert_eq!(msg.meta.extra["vendorField"], 1);
    }

    #[test]
    fn outbound_skips_unset_fields() {
        let data = ApplicationData::for_component(PlatformDirective::PeripheralsQuery, 3);
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(
            value,
            json!({ "meta": { "directive": "peripherals_query", "componentID": 3 } })
        );
    }

    #[test]
    fn state_request_payload() {
        let data = ApplicationData::state_request(ApplicationStateCode::Available, None);
        assert_eq!(data.directive(), PlatformDirective::PlatformApplicationsStaterequest);
        assert_eq!(data.requested_state(), Some(ApplicationStateCode::Available));
        assert_eq!(
            data.payload.unwrap()["applicationStateChangeRequest"]["applicationStateChangeReasonCode"],
            "NOT_APPLICABLE"
        );
    }

    #[test]
    fn message_codes_use_screaming_snake_case() {
        let code: MessageCode = serde_json::from_value(json!("HARDWARE_ERROR")).unwrap();
        assert_eq!(code, MessageCode::HardwareError);
        assert_eq!(MessageCode::BaggageTooManyBags.to_string(), "BAGGAGE_TOO_MANY_BAGS");
    }

    #[test]
    fn critical_codes() {
        assert!(!MessageCode::Ok.is_critical());
        assert!(!MessageCode::MediaLow.is_critical());
        assert!(!MessageCode::Unknown.is_critical());
        assert!(MessageCode::SoftwareError.is_critical());
        assert!(MessageCode::WrongState.is_critical());
        assert!(MessageCode::BaggageJammed.is_critical());
    }

    #[test]
    fn payload_field_decodes_environment() {
        let msg = PlatformData {
            payload: Some(json!({ "environmentLevel": { "deviceID": "kiosk-1", "killTimeout": 5 } })),
            ..PlatformData::default()
        };
        let env: EnvironmentLevel = msg.payload_field("environmentLevel").unwrap().unwrap();
        assert_eq!(env.device_id.as_deref(), Some("kiosk-1"));
        assert!(msg.payload_field::<EnvironmentLevel>("missing").unwrap().is_none());
    }

    #[test]
    fn activation_multi_tenant() {
        let act: ApplicationActivation =
            serde_json::from_value(json!({ "executionMode": "MAM", "languageID": "fr-FR" })).unwrap();
        assert!(act.is_multi_tenant());
        assert_eq!(act.language_id.as_deref(), Some("fr-FR"));
    }
}
