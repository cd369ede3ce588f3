// ── Protocol engine ──
//
// `Cuss2` owns a `PlatformLink` and installs itself as the link's
// synchronous observer. Every inbound message is applied (application
// state, component records) before the request that produced it resumes,
// so callers always observe their own response's effects. Work that needs
// the network (initialization, availability sync) is spawned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use arc_swap::ArcSwap;
use cuss2_api::models::{DEFAULT_DEVICE_ID, EnvironmentComponent, EnvironmentLevel};
use cuss2_api::{
    ApplicationActivation, ApplicationData, ApplicationStateCode, CLOSE_GOING_AWAY,
    CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, ComponentId, Connection, ConnectionConfig,
    ConnectionEvent, ConnectionObserver, PlatformData, PlatformDirective,
};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::component::ComponentRecord;
use crate::discovery::discover;
use crate::error::CoreError;
use crate::event::EngineEvent;
use crate::link::PlatformLink;
use crate::registry::{ComponentRegistry, ComponentSnapshot};
use crate::state::{ApplicationStateChange, SingleFlight, request_allowed};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_LANGUAGE: &str = "en-US";

type InitWaiter = oneshot::Sender<Result<(), CoreError>>;

/// Activation metadata captured on entering ACTIVE.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Activation {
    multi_tenant: bool,
    accessible_mode: bool,
    language: String,
}

impl Default for Activation {
    fn default() -> Self {
        Self {
            multi_tenant: false,
            accessible_mode: false,
            language: DEFAULT_LANGUAGE.to_owned(),
        }
    }
}

#[derive(Debug, Default)]
struct TrackedState {
    /// `None` until the platform reports a state.
    current: Option<ApplicationStateCode>,
    last_change: ApplicationStateChange,
}

/// Client engine for a CUSS 2 platform session.
///
/// Cheaply cloneable via `Arc<EngineInner>`.
pub struct Cuss2<L: PlatformLink = Connection> {
    inner: Arc<EngineInner<L>>,
}

impl<L: PlatformLink> Clone for Cuss2<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct EngineInner<L> {
    link: L,
    registry: ComponentRegistry,
    state: Mutex<TrackedState>,
    activation: ArcSwap<Activation>,
    online: AtomicBool,
    state_flight: SingleFlight,
    events: broadcast::Sender<EngineEvent>,
    /// Completed by the next initialization run, set while `connect()` waits.
    init_waiter: Mutex<Option<InitWaiter>>,
    shutdown: CancellationToken,
}

/// Forwards link events into the engine without keeping it alive.
struct EngineObserver<L: PlatformLink> {
    engine: Weak<EngineInner<L>>,
}

impl<L: PlatformLink> ConnectionObserver for EngineObserver<L> {
    fn on_event(&self, event: &ConnectionEvent) {
        if let Some(inner) = self.engine.upgrade() {
            Cuss2 { inner }.on_connection_event(event);
        }
    }
}

impl Cuss2<Connection> {
    /// Build an engine over a real platform connection. Does not connect.
    pub fn new(config: ConnectionConfig) -> Result<Self, CoreError> {
        Ok(Self::with_link(Connection::new(config)?))
    }
}

impl<L: PlatformLink> Cuss2<L> {
    /// Build an engine over any link and install it as the link's observer.
    pub fn with_link(link: L) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(EngineInner {
            link,
            registry: ComponentRegistry::new(),
            state: Mutex::new(TrackedState::default()),
            activation: ArcSwap::from_pointee(Activation::default()),
            online: AtomicBool::new(false),
            state_flight: SingleFlight::default(),
            events,
            init_waiter: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });
        inner.link.set_observer(Arc::new(EngineObserver {
            engine: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Open the session and wait for initialization to finish.
    ///
    /// Every initialization failure is returned, not only fatal platform
    /// states.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let (tx, rx) = oneshot::channel();
        *self.init_waiter() = Some(tx);

        if let Err(e) = self.inner.link.connect().await {
            self.init_waiter().take();
            return Err(e.into());
        }

        rx.await.unwrap_or(Err(CoreError::NotConnected))
    }

    fn init_waiter(&self) -> MutexGuard<'_, Option<InitWaiter>> {
        self.inner
            .init_waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_initialization(&self, result: Result<(), CoreError>) {
        let waiter = self.init_waiter().take();
        match &result {
            Ok(()) => self.emit(EngineEvent::Connected),
            Err(e) => {
                warn!(error = %e, "initialization failed");
                self.emit(EngineEvent::Error(Arc::new(e.clone())));
            }
        }
        if let Some(waiter) = waiter {
            let _ = waiter.send(result);
        }
    }

    /// Close the link normally and stop spawned background work.
    pub fn close(&self) {
        info!("closing platform session");
        self.inner.shutdown.cancel();
        self.inner.link.close(CLOSE_NORMAL, "");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn link(&self) -> &L {
        &self.inner.link
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.inner.events.send(event);
    }

    fn on_connection_event(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Message(data) => {
                // Failures are already emitted as engine errors.
                let _ = self.handle_message(Arc::clone(data));
            }
            ConnectionEvent::Open => {
                self.emit(EngineEvent::Connection(event.clone()));
                let engine = self.clone();
                tokio::spawn(async move {
                    let result = tokio::select! {
                        () = engine.inner.shutdown.cancelled() => {
                            // A waiting `connect()` sees the dropped sender.
                            engine.init_waiter().take();
                            return;
                        }
                        result = engine.initialize() => result,
                    };
                    engine.finish_initialization(result);
                });
            }
            _ => self.emit(EngineEvent::Connection(event.clone())),
        }
    }

    // ── Initialization ───────────────────────────────────────────────

    async fn initialize(&self) -> Result<(), CoreError> {
        info!("initializing platform session");

        let environment = self.environment().await?;
        let configured = self.inner.link.device_id();
        if configured.is_empty() || configured == DEFAULT_DEVICE_ID {
            let reported = environment
                .payload_field::<EnvironmentLevel>("environmentLevel")?
                .and_then(|env| env.device_id);
            if let Some(device_id) = reported {
                info!(device_id, "adopting platform device id");
                self.inner.link.set_device_id(&device_id);
            }
        }

        match environment.application_state() {
            None => {
                return Err(CoreError::Initialization {
                    message: "platform reported no application state".into(),
                });
            }
            Some(state @ (ApplicationStateCode::Suspended | ApplicationStateCode::Disabled)) => {
                return Err(CoreError::Initialization {
                    message: format!("platform is in {state} state"),
                });
            }
            Some(_) => {}
        }

        let list = self.component_list().await?;
        self.inner.registry.rebuild(discover(&list));
        info!(components = list.len(), "component registry built");

        self.query_components().await;
        Ok(())
    }

    /// `platform_environment`.
    pub async fn environment(&self) -> Result<PlatformData, CoreError> {
        let data = ApplicationData::new(PlatformDirective::PlatformEnvironment);
        Ok(self.inner.link.send_and_get_response(data).await?)
    }

    /// `platform_components`, decoded from `payload.componentList`.
    pub async fn component_list(&self) -> Result<Vec<EnvironmentComponent>, CoreError> {
        let data = ApplicationData::new(PlatformDirective::PlatformComponents);
        let response = self.inner.link.send_and_get_response(data).await?;
        Ok(response
            .payload_field::<Vec<EnvironmentComponent>>("componentList")?
            .unwrap_or_default())
    }

    /// Query every known component. Failures are logged and counted.
    pub async fn query_components(&self) -> usize {
        let mut failures = 0;
        for id in self.inner.registry.ids() {
            if let Err(e) = self.query(id).await {
                warn!(component_id = id, error = %e, "component query failed");
                failures += 1;
            }
        }
        failures
    }

    // ── Inbound messages ─────────────────────────────────────────────

    /// Apply one platform message: application state, then the addressed
    /// component. Runs synchronously on the link's event path.
    pub fn handle_message(&self, data: Arc<PlatformData>) -> Result<(), CoreError> {
        let Some(current) = data.application_state() else {
            warn!(
                request_id = data.request_id().unwrap_or_default(),
                "platform message without application state"
            );
            self.inner
                .link
                .close(CLOSE_INTERNAL_ERROR, "missing application state");
            let message = "platform message carried no currentApplicationState".to_owned();
            self.emit(EngineEvent::Error(Arc::new(CoreError::Protocol {
                message: message.clone(),
            })));
            return Err(CoreError::Protocol { message });
        };

        let change = {
            let mut tracked = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = tracked.current.unwrap_or(ApplicationStateCode::Stopped);
            tracked.current = Some(current);
            if previous == current {
                None
            } else {
                let change = ApplicationStateChange { previous, current };
                tracked.last_change = change;
                Some(change)
            }
        };

        if let Some(change) = change {
            self.on_state_change(change, &data);
        }

        if let Some(id) = data.component_id() {
            if let Some(record) = self.inner.registry.apply(id, &data, Some(current)) {
                debug!(
                    component_id = id,
                    state = %record.component_state,
                    status = %record.status,
                    enabled = record.enabled,
                    "component state changed"
                );
                self.emit(EngineEvent::ComponentStateChange(record));
                if self.is_online() && (data.is_unsolicited() || data.is_query_response()) {
                    self.spawn_sync();
                }
            }
        }

        self.emit(EngineEvent::Message(data));
        Ok(())
    }

    fn on_state_change(&self, change: ApplicationStateChange, data: &PlatformData) {
        info!(
            previous = %change.previous,
            current = %change.current,
            "application state changed"
        );
        self.emit(EngineEvent::StateChange(change));

        if change.current == ApplicationStateCode::Active {
            let activation = data
                .payload_field::<ApplicationActivation>("applicationActivation")
                .ok()
                .flatten()
                .unwrap_or_default();
            let accessible_mode = activation
                .accessible_mode
                .or_else(|| {
                    data.meta
                        .current_application_state
                        .as_ref()
                        .and_then(|s| s.accessible_mode)
                })
                .unwrap_or(false);
            self.inner.activation.store(Arc::new(Activation {
                multi_tenant: activation.is_multi_tenant(),
                accessible_mode,
                language: activation
                    .language_id
                    .clone()
                    .unwrap_or_else(|| DEFAULT_LANGUAGE.to_owned()),
            }));
            self.emit(EngineEvent::Activated(activation));
        } else if change.previous == ApplicationStateCode::Active {
            self.emit(EngineEvent::Deactivated {
                next: change.current,
            });
        }

        if change.current == ApplicationStateCode::Unavailable && self.is_online() {
            self.spawn_sync();
        }
    }

    fn spawn_sync(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = engine.inner.shutdown.cancelled() => {}
                result = engine.check_required_components_and_sync_state() => {
                    if let Err(e) = result {
                        warn!(error = %e, "availability sync failed");
                    }
                }
            }
        });
    }

    // ── Availability sync ────────────────────────────────────────────

    /// Reconcile required-component readiness with the application state.
    pub async fn check_required_components_and_sync_state(&self) -> Result<(), CoreError> {
        if self.inner.state_flight.is_pending() {
            debug!("state change pending, skipping availability sync");
            return Ok(());
        }

        if self.is_online() {
            let missing = self.inner.registry.unavailable_required();
            if missing.is_empty() {
                if self.current_state() == Some(ApplicationStateCode::Unavailable) {
                    info!("all required components ready");
                    self.request_available_state().await?;
                }
            } else {
                info!(?missing, "required components unavailable");
                self.request_unavailable_state().await?;
            }
        } else if self.inner.registry.is_discovered() {
            self.request_unavailable_state().await?;
        }
        Ok(())
    }

    /// Set the application's online flag and re-run availability sync.
    pub async fn set_online(&self, online: bool) -> Result<(), CoreError> {
        self.inner.online.store(online, Ordering::Release);
        debug!(online, "online flag set");
        self.check_required_components_and_sync_state().await
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    // ── State requests ───────────────────────────────────────────────

    pub async fn request_initialize_state(&self) -> Result<Option<PlatformData>, CoreError> {
        self.request_state(ApplicationStateCode::Initialize).await
    }

    pub async fn request_unavailable_state(&self) -> Result<Option<PlatformData>, CoreError> {
        self.request_state(ApplicationStateCode::Unavailable).await
    }

    pub async fn request_available_state(&self) -> Result<Option<PlatformData>, CoreError> {
        self.request_state(ApplicationStateCode::Available).await
    }

    pub async fn request_active_state(&self) -> Result<Option<PlatformData>, CoreError> {
        self.request_state(ApplicationStateCode::Active).await
    }

    pub async fn request_stopped_state(&self) -> Result<Option<PlatformData>, CoreError> {
        self.request_state(ApplicationStateCode::Stopped).await
    }

    /// Ask the platform to reload the application, then drop the socket
    /// with 1001 so the session is re-established. Returns `false` when
    /// the request is not allowed or another state change is pending.
    pub async fn request_reload(&self) -> Result<bool, CoreError> {
        let current = self.current_state();
        if !request_allowed(ApplicationStateCode::Reload, current) {
            debug!(?current, "reload not allowed");
            return Ok(false);
        }
        let Some(_flight) = self.inner.state_flight.try_acquire() else {
            debug!("state change already pending");
            return Ok(false);
        };

        info!("requesting reload");
        self.inner
            .link
            .send_and_get_response(ApplicationData::state_request(
                ApplicationStateCode::Reload,
                None,
            ))
            .await?;
        self.inner.link.close(CLOSE_GOING_AWAY, "Reloading");
        Ok(true)
    }

    async fn request_state(
        &self,
        target: ApplicationStateCode,
    ) -> Result<Option<PlatformData>, CoreError> {
        let current = self.current_state();
        if !request_allowed(target, current) {
            debug!(%target, ?current, "state request not allowed");
            return Ok(None);
        }
        let Some(_flight) = self.inner.state_flight.try_acquire() else {
            debug!(%target, "state change already pending");
            return Ok(None);
        };

        if current == Some(ApplicationStateCode::Active)
            && matches!(
                target,
                ApplicationStateCode::Unavailable | ApplicationStateCode::Available
            )
        {
            self.disable_enabled_components().await;
        }

        info!(%target, "requesting application state");
        let response = self
            .inner
            .link
            .send_and_get_response(ApplicationData::state_request(target, None))
            .await?;
        Ok(Some(response))
    }

    async fn disable_enabled_components(&self) {
        for id in self.inner.registry.enabled_ids() {
            if let Err(e) = self.disable(id).await {
                warn!(component_id = id, error = %e, "disable failed while leaving ACTIVE");
            }
        }
    }

    // ── Component directives ─────────────────────────────────────────

    pub async fn query(&self, id: ComponentId) -> Result<PlatformData, CoreError> {
        self.component_call(id, PlatformDirective::PeripheralsQuery, None)
            .await
    }

    pub async fn cancel(&self, id: ComponentId) -> Result<PlatformData, CoreError> {
        self.component_call(id, PlatformDirective::PeripheralsCancel, None)
            .await
    }

    pub async fn setup(&self, id: ComponentId, payload: Value) -> Result<PlatformData, CoreError> {
        self.component_call(id, PlatformDirective::PeripheralsSetup, Some(payload))
            .await
    }

    pub async fn send(&self, id: ComponentId, payload: Value) -> Result<PlatformData, CoreError> {
        self.component_call(id, PlatformDirective::PeripheralsSend, Some(payload))
            .await
    }

    pub async fn enable(&self, id: ComponentId) -> Result<PlatformData, CoreError> {
        let response = self
            .component_call(id, PlatformDirective::PeripheralsUserpresentEnable, None)
            .await?;
        self.record_enabled(id, &response, true);
        Ok(response)
    }

    pub async fn disable(&self, id: ComponentId) -> Result<PlatformData, CoreError> {
        let response = self
            .component_call(id, PlatformDirective::PeripheralsUserpresentDisable, None)
            .await?;
        self.record_enabled(id, &response, false);
        Ok(response)
    }

    pub async fn offer(
        &self,
        id: ComponentId,
        payload: Option<Value>,
    ) -> Result<PlatformData, CoreError> {
        self.component_call(id, PlatformDirective::PeripheralsUserpresentOffer, payload)
            .await
    }

    /// Without a `currentComponentState` block the response only tells us
    /// the command succeeded.
    fn record_enabled(&self, id: ComponentId, response: &PlatformData, enabled: bool) {
        if response.meta.current_component_state.is_some() {
            return;
        }
        if let Some(record) = self
            .inner
            .registry
            .set_enabled(id, enabled, self.current_state()) {
            self.emit(EngineEvent::ComponentStateChange(record));
        }
    }

    async fn component_call(
        &self,
        id: ComponentId,
        directive: PlatformDirective,
        payload: Option<Value>,
    ) -> Result<PlatformData, CoreError> {
        if !self.inner.registry.contains(id) {
            return Err(CoreError::ComponentNotFound { id });
        }
        let _call = self.inner.registry.begin_call(id);

        let mut data = ApplicationData::for_component(directive, id);
        data.payload = payload;
        debug!(component_id = id, %directive, "component directive");
        Ok(self.inner.link.send_and_get_response(data).await?)
    }

    // ── Accessors ────────────────────────────────────────────────────

    /// The most recent reported transition, or the synthetic initial one.
    pub fn state(&self) -> ApplicationStateChange {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_change
    }

    /// The state the platform last reported, if any.
    pub fn current_state(&self) -> Option<ApplicationStateCode> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
    }

    /// Whether a state-change request is in flight.
    pub fn pending_state_change(&self) -> bool {
        self.inner.state_flight.is_pending()
    }

    pub fn multi_tenant(&self) -> bool {
        self.inner.activation.load().multi_tenant
    }

    pub fn accessible_mode(&self) -> bool {
        self.inner.activation.load().accessible_mode
    }

    pub fn language(&self) -> String {
        self.inner.activation.load().language.clone()
    }

    pub fn device_id(&self) -> String {
        self.inner.link.device_id()
    }

    pub fn components(&self) -> ComponentSnapshot {
        self.inner.registry.snapshot()
    }

    pub fn component(&self, id: ComponentId) -> Option<ComponentRecord> {
        self.inner.registry.get(id)
    }

    pub fn subscribe_components(&self) -> watch::Receiver<ComponentSnapshot> {
        self.inner.registry.subscribe()
    }

    /// Mark a component as required. Returns `false` if it is unknown.
    pub fn set_required(&self, id: ComponentId, required: bool) -> bool {
        self.inner.registry.set_required(id, required)
    }

    pub fn unavailable_required_components(&self) -> Vec<ComponentId> {
        self.inner.registry.unavailable_required()
    }
}

impl<L: PlatformLink> std::fmt::Debug for Cuss2<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cuss2")
            .field("state", &self.current_state())
            .field("online", &self.is_online())
            .field("components", &self.inner.registry.ids().len())
            .finish_non_exhaustive()
    }
}
