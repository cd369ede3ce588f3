#![allow(clippy::unwrap_used)]
// Engine tests against a scripted in-memory platform.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::Notify;

use cuss2_api::models::{ApplicationState, DEFAULT_DEVICE_ID, PlatformMeta};
use cuss2_api::{
    ApplicationData, ApplicationStateCode, ComponentId, ComponentState, ConnectionEvent,
    ConnectionObserver, Error, MessageCode, PlatformData, PlatformDirective,
    PlatformResponseError,
};
use cuss2_core::{CoreError, Cuss2, DeviceType, EngineEvent, PlatformLink};

use ApplicationStateCode as S;

// ── Scripted platform ───────────────────────────────────────────────

struct Platform {
    state: Option<ApplicationStateCode>,
    components: Value,
    readiness: HashMap<ComponentId, &'static str>,
    failing_disable: HashSet<ComponentId>,
}

struct MockLink {
    platform: Mutex<Platform>,
    sent: Mutex<Vec<ApplicationData>>,
    observer: Mutex<Option<Arc<dyn ConnectionObserver>>>,
    device_id: Mutex<String>,
    closes: Mutex<Vec<u16>>,
    hold_state_requests: Mutex<Option<Arc<Notify>>>,
}

impl MockLink {
    fn new(state: ApplicationStateCode) -> Self {
        Self {
            platform: Mutex::new(Platform {
                state: Some(state),
                components: json!([
                    {
                        "componentID": 1,
                        "componentCharacteristics": [{ "dsTypesList": ["DS_TYPES_BARCODE"] }]
                    },
                    {
                        "componentID": 2,
                        "componentCharacteristics": [{ "deviceTypesList": ["SCALE"] }]
                    }
                ]),
                readiness: HashMap::from([(1, "READY"), (2, "UNAVAILABLE")]),
                failing_disable: HashSet::new(),
            }),
            sent: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
            device_id: Mutex::new(DEFAULT_DEVICE_ID.to_owned()),
            closes: Mutex::new(Vec::new()),
            hold_state_requests: Mutex::new(None),
        }
    }

    fn notify(&self, event: &ConnectionEvent) {
        let observer = self.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer.on_event(event);
        }
    }

    fn sent_directives(&self) -> Vec<PlatformDirective> {
        self.sent.lock().unwrap().iter().map(ApplicationData::directive).collect()
    }

    fn state_requests(&self) -> Vec<ApplicationStateCode> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(ApplicationData::requested_state)
            .collect()
    }

    fn closes(&self) -> Vec<u16> {
        self.closes.lock().unwrap().clone()
    }

    /// Build the platform's answer, updating its own state first.
    fn answer(&self, data: &ApplicationData) -> PlatformData {
        let mut platform = self.platform.lock().unwrap();
        let directive = data.directive();
        let component_id = data.meta.component_id;

        let mut message_code = MessageCode::Ok;
        let mut component_state = None;
        let mut payload = None;

        match directive {
            PlatformDirective::PlatformEnvironment => {
                payload = Some(json!({ "environmentLevel": { "deviceID": "platform-device" } }));
            }
            PlatformDirective::PlatformComponents => {
                payload = Some(json!({ "componentList": platform.components.clone() }));
            }
            PlatformDirective::PlatformApplicationsStaterequest => {
                let requested = data.requested_state().unwrap();
                if requested != S::Reload {
                    platform.state = Some(requested);
                }
                if requested == S::Active {
                    payload = Some(json!({
                        "applicationActivation": { "executionMode": "MAM", "languageID": "fr-FR" }
                    }));
                }
            }
            PlatformDirective::PeripheralsQuery => {
                let id = component_id.unwrap();
                component_state = platform
                    .readiness
                    .get(&id)
                    .map(|s| serde_json::from_value::<ComponentState>(json!(s)).unwrap());
            }
            PlatformDirective::PeripheralsUserpresentDisable => {
                if component_id.is_some_and(|id| platform.failing_disable.contains(&id)) {
                    message_code = MessageCode::HardwareError;
                }
            }
            _ => {}
        }

        PlatformData {
            meta: PlatformMeta {
                request_id: Some(format!("req-{}", self.sent.lock().unwrap().len())),
                message_code,
                component_id,
                component_state,
                current_application_state: platform.state.map(|code| ApplicationState {
                    application_state_code: code,
                    accessible_mode: None,
                }),
                platform_directive: Some(directive),
                ..PlatformMeta::default()
            },
            payload,
        }
    }
}

impl PlatformLink for MockLink {
    fn connect(&self) -> impl Future<Output = Result<(), Error>> + Send {
        self.notify(&ConnectionEvent::Open);
        async { Ok(()) }
    }

    fn send_and_get_response(
        &self,
        data: ApplicationData,
    ) -> impl Future<Output = Result<PlatformData, Error>> + Send {
        async move {
            self.sent.lock().unwrap().push(data.clone());

            if data.directive() == PlatformDirective::PlatformApplicationsStaterequest {
                let hold = self.hold_state_requests.lock().unwrap().clone();
                if let Some(hold) = hold {
                    hold.notified().await;
                }
            }

            let response = self.answer(&data);
            self.notify(&ConnectionEvent::Message(Arc::new(response.clone())));

            if response.message_code().is_critical() {
                return Err(PlatformResponseError {
                    directive: data.directive(),
                    message_code: response.message_code(),
                    response,
                }
                .into());
            }
            Ok(response)
        }
    }

    fn close(&self, code: u16, _reason: &str) {
        self.closes.lock().unwrap().push(code);
    }

    fn set_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        *self.observer.lock().unwrap() = Some(observer);
    }

    fn device_id(&self) -> String {
        self.device_id.lock().unwrap().clone()
    }

    fn set_device_id(&self, device_id: &str) {
        device_id.clone_into(&mut self.device_id.lock().unwrap());
    }
}

async fn connected(state: ApplicationStateCode) -> Cuss2<MockLink> {
    let engine = Cuss2::with_link(MockLink::new(state));
    engine.connect().await.unwrap();
    engine
}

fn inbound(meta: Value) -> Arc<PlatformData> {
    Arc::new(serde_json::from_value(json!({ "meta": meta })).unwrap())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

// ── Initialization ──────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_discovers_and_queries_components() {
    let engine = connected(S::Unavailable).await;
    let link = engine.link();

    assert_eq!(
        link.sent_directives(),
        vec![
            PlatformDirective::PlatformEnvironment,
            PlatformDirective::PlatformComponents,
            PlatformDirective::PeripheralsQuery,
            PlatformDirective::PeripheralsQuery,
        ]
    );
    assert_eq!(engine.device_id(), "platform-device");
    assert_eq!(engine.current_state(), Some(S::Unavailable));

    let components = engine.components();
    assert_eq!(components.len(), 2);
    assert_eq!(components[0].device_type, DeviceType::BarcodeReader);
    assert_eq!(components[1].device_type, DeviceType::Scale);
    assert!(engine.component(1).unwrap().ready());
    assert!(!engine.component(2).unwrap().ready());
}

#[tokio::test]
async fn test_configured_device_id_is_kept() {
    let link = MockLink::new(S::Unavailable);
    link.set_device_id("kiosk-7");
    let engine = Cuss2::with_link(link);
    engine.connect().await.unwrap();

    assert_eq!(engine.device_id(), "kiosk-7");
}

#[tokio::test]
async fn test_suspended_platform_fails_initialization() {
    let engine = Cuss2::with_link(MockLink::new(S::Suspended));

    let err = engine.connect().await.unwrap_err();
    assert!(matches!(err, CoreError::Initialization { .. }), "got {err:?}");
    assert!(
        !engine
            .link()
            .sent_directives()
            .contains(&PlatformDirective::PlatformComponents)
    );
}

#[tokio::test]
async fn test_failed_discovery_is_returned_from_connect() {
    let link = MockLink::new(S::Available);
    link.platform.lock().unwrap().components = json!("not-a-list");
    let engine = Cuss2::with_link(link);
    let mut events = engine.subscribe();

    let err = tokio::time::timeout(Duration::from_secs(2), engine.connect())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, CoreError::Protocol { .. }), "got {err:?}");

    let mut reported = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::Error(e) = event {
            reported = matches!(e.as_ref(), CoreError::Protocol { .. });
        }
    }
    assert!(reported);
    assert!(engine.components().is_empty());
}

// ── State requests ──────────────────────────────────────────────────

#[tokio::test]
async fn test_active_requires_available() {
    let engine = connected(S::Unavailable).await;

    assert!(engine.request_active_state().await.unwrap().is_none());
    assert!(engine.link().state_requests().is_empty());

    assert!(engine.request_available_state().await.unwrap().is_some());
    assert_eq!(engine.current_state(), Some(S::Available));

    assert!(engine.request_active_state().await.unwrap().is_some());
    assert_eq!(engine.current_state(), Some(S::Active));
    assert_eq!(engine.link().state_requests(), vec![S::Available, S::Active]);
}

#[tokio::test]
async fn test_state_change_is_visible_when_request_returns() {
    let engine = connected(S::Unavailable).await;

    engine.request_available_state().await.unwrap();
    let change = engine.state();
    assert_eq!(change.previous, S::Unavailable);
    assert_eq!(change.current, S::Available);
}

#[tokio::test]
async fn test_only_one_state_request_in_flight() {
    let engine = connected(S::Unavailable).await;
    let hold = Arc::new(Notify::new());
    *engine.link().hold_state_requests.lock().unwrap() = Some(Arc::clone(&hold));

    let first = tokio::spawn({
        let engine = engine.clone();
        async move { engine.request_available_state().await }
    });
    wait_until(|| engine.pending_state_change()).await;

    assert!(engine.request_stopped_state().await.unwrap().is_none());
    // Sync defers to the in-flight request.
    engine.set_online(true).await.unwrap();

    hold.notify_one();
    assert!(first.await.unwrap().unwrap().is_some());
    assert!(!engine.pending_state_change());
    assert_eq!(engine.link().state_requests(), vec![S::Available]);
}

#[tokio::test]
async fn test_activation_metadata_and_events() {
    let engine = connected(S::Available).await;
    let mut events = engine.subscribe();

    engine.request_active_state().await.unwrap();
    assert!(engine.multi_tenant());
    assert_eq!(engine.language(), "fr-FR");

    engine.request_available_state().await.unwrap();

    let mut activated = false;
    let mut deactivated = None;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::Activated(activation) => {
                activated = true;
                assert_eq!(activation.language_id.as_deref(), Some("fr-FR"));
            }
            EngineEvent::Deactivated { next } => deactivated = Some(next),
            _ => {}
        }
    }
    assert!(activated);
    assert_eq!(deactivated, Some(S::Available));
}

#[tokio::test]
async fn test_leaving_active_disables_enabled_components() {
    let link = MockLink::new(S::Available);
    link.platform.lock().unwrap().readiness.insert(2, "READY");
    let engine = Cuss2::with_link(link);
    engine.connect().await.unwrap();
    engine.request_active_state().await.unwrap();
    engine.enable(1).await.unwrap();
    engine.enable(2).await.unwrap();
    assert!(engine.component(1).unwrap().enabled);
    assert!(engine.component(2).unwrap().enabled);

    engine
        .link()
        .platform
        .lock()
        .unwrap()
        .failing_disable
        .insert(2);

    // A failed disable does not block the transition.
    assert!(engine.request_available_state().await.unwrap().is_some());

    let directives = engine.link().sent_directives();
    assert_eq!(
        directives[directives.len() - 3..].to_vec(),
        vec![
            PlatformDirective::PeripheralsUserpresentDisable,
            PlatformDirective::PeripheralsUserpresentDisable,
            PlatformDirective::PlatformApplicationsStaterequest,
        ]
    );
    assert!(!engine.component(1).unwrap().enabled);
    assert_eq!(engine.current_state(), Some(S::Available));
}

#[tokio::test]
async fn test_reload_closes_going_away() {
    let engine = connected(S::Available).await;

    assert!(engine.request_reload().await.unwrap());
    assert_eq!(engine.link().state_requests(), vec![S::Reload]);
    assert_eq!(engine.link().closes(), vec![1001]);
}

// ── Availability sync ───────────────────────────────────────────────

#[tokio::test]
async fn test_online_with_required_ready_requests_available() {
    let engine = connected(S::Unavailable).await;
    assert!(engine.set_required(1, true));

    engine.set_online(true).await.unwrap();

    assert_eq!(engine.link().state_requests(), vec![S::Available]);
    assert_eq!(engine.current_state(), Some(S::Available));
}

#[tokio::test]
async fn test_required_component_unavailable_requests_unavailable() {
    let engine = connected(S::Available).await;
    engine.set_required(2, true);

    engine.set_online(true).await.unwrap();

    assert_eq!(engine.unavailable_required_components(), vec![2]);
    assert_eq!(engine.link().state_requests(), vec![S::Unavailable]);
    assert_eq!(engine.current_state(), Some(S::Unavailable));
}

#[tokio::test]
async fn test_offline_after_discovery_requests_unavailable() {
    let engine = connected(S::Available).await;

    engine.check_required_components_and_sync_state().await.unwrap();

    assert_eq!(engine.link().state_requests(), vec![S::Unavailable]);
}

#[tokio::test]
async fn test_unsolicited_readiness_triggers_sync() {
    let engine = connected(S::Unavailable).await;
    engine.set_required(2, true);
    engine.set_online(true).await.unwrap();
    assert!(engine.link().state_requests().is_empty());

    engine
        .handle_message(inbound(json!({
            "componentID": 2,
            "componentState": "READY",
            "currentApplicationState": { "applicationStateCode": "UNAVAILABLE" }
        })))
        .unwrap();

    wait_until(|| !engine.link().state_requests().is_empty()).await;
    assert_eq!(engine.link().state_requests(), vec![S::Available]);
}

// ── Inbound messages ────────────────────────────────────────────────

#[tokio::test]
async fn test_unsolicited_status_updates_component() {
    let engine = connected(S::Available).await;
    let mut events = engine.subscribe();

    engine
        .handle_message(inbound(json!({
            "componentID": 1,
            "messageCode": "MEDIA_LOW",
            "currentApplicationState": { "applicationStateCode": "AVAILABLE" }
        })))
        .unwrap();
    assert_eq!(engine.component(1).unwrap().status, MessageCode::MediaLow);

    // A command response's code is not a device status.
    engine
        .handle_message(inbound(json!({
            "componentID": 1,
            "messageCode": "HARDWARE_ERROR",
            "platformDirective": "peripherals_send",
            "currentApplicationState": { "applicationStateCode": "AVAILABLE" }
        })))
        .unwrap();
    assert_eq!(engine.component(1).unwrap().status, MessageCode::MediaLow);

    let changes: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|e| match e {
            EngineEvent::ComponentStateChange(record) => Some(record.status),
            _ => None,
        })
        .collect();
    assert_eq!(changes, vec![MessageCode::MediaLow]);
}

#[tokio::test]
async fn test_enabled_only_while_active() {
    let engine = connected(S::Available).await;
    let block = json!({ "componentState": "READY", "status": "OK", "enabled": true });

    engine
        .handle_message(inbound(json!({
            "componentID": 1,
            "currentComponentState": block.clone(),
            "currentApplicationState": { "applicationStateCode": "AVAILABLE" }
        })))
        .unwrap();
    assert!(!engine.component(1).unwrap().enabled);

    engine
        .handle_message(inbound(json!({
            "componentID": 1,
            "currentComponentState": block,
            "currentApplicationState": { "applicationStateCode": "ACTIVE" }
        })))
        .unwrap();
    assert!(engine.component(1).unwrap().enabled);
}

#[tokio::test]
async fn test_enable_outside_active_is_not_recorded() {
    let engine = connected(S::Available).await;

    engine.enable(1).await.unwrap();
    assert!(!engine.component(1).unwrap().enabled);

    engine.request_active_state().await.unwrap();
    engine.enable(2).await.unwrap();
    assert!(!engine.component(2).unwrap().enabled);

    engine.enable(1).await.unwrap();
    assert!(engine.component(1).unwrap().enabled);
}

#[tokio::test]
async fn test_missing_application_state_closes_session() {
    let engine = connected(S::Available).await;

    let err = engine
        .handle_message(inbound(json!({ "componentID": 1 })))
        .unwrap_err();

    assert!(matches!(err, CoreError::Protocol { .. }));
    assert_eq!(engine.link().closes(), vec![1011]);
    assert_eq!(engine.current_state(), Some(S::Available));
}

// ── Component directives ────────────────────────────────────────────

#[tokio::test]
async fn test_unknown_component_is_rejected_locally() {
    let engine = connected(S::Available).await;
    let before = engine.link().sent_directives().len();

    let err = engine.query(42).await.unwrap_err();

    assert!(matches!(err, CoreError::ComponentNotFound { id: 42 }));
    assert_eq!(engine.link().sent_directives().len(), before);
}

#[tokio::test]
async fn test_critical_response_surfaces_rejection() {
    let engine = connected(S::Active).await;
    engine
        .link()
        .platform
        .lock()
        .unwrap()
        .failing_disable
        .insert(1);

    let err = engine.disable(1).await.unwrap_err();

    let rejection = err.rejection().unwrap();
    assert_eq!(rejection.message_code, MessageCode::HardwareError);
    assert_eq!(engine.component(1).unwrap().pending_calls, 0);
}

#[tokio::test]
async fn test_close_is_normal() {
    let engine = connected(S::Available).await;

    engine.close();

    assert_eq!(engine.link().closes(), vec![1000]);
}
