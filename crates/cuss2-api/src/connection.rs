// Platform session: OAuth token + WebSocket + request correlation
//
// A single background task owns the socket. Outbound frames reach it
// through an unbounded mpsc queue; inbound frames are classified,
// published to the event bus, and then matched against pending waiters
// by `requestID`. Abnormal closes reconnect with backoff; a clean 1000
// close is terminal.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::endpoints::Endpoints;
use crate::error::{Error, PlatformResponseError};
use crate::events::{ConnectionEvent, ConnectionObserver, ConnectionState, EventBus};
use crate::models::{ApplicationData, PlatformData};
use crate::retry::retry;
use crate::token::TokenManager;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Waiter = oneshot::Sender<Result<PlatformData, Error>>;

/// Normal closure. The only close code that does not reconnect.
pub const CLOSE_NORMAL: u16 = 1000;
/// Going away; used when the application reloads.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Internal error; used when the platform omits the application state.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
const CLOSE_ABNORMAL: u16 = 1006;
const CLOSE_NO_STATUS: u16 = 1005;

/// How long to wait for the peer to answer our close frame.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Classified inbound text frame.
#[derive(Debug)]
enum Frame {
    Empty,
    Ping(Value),
    Ack(Value),
    Platform(PlatformData),
}

fn parse_frame(text: &str) -> Result<Frame, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    match value {
        Value::Null => Ok(Frame::Empty),
        Value::Object(ref map) if map.contains_key("ping") => {
            Ok(Frame::Ping(map.get("ping").cloned().unwrap_or_default()))
        }
        Value::Object(ref map) if map.contains_key("ackCode") => {
            Ok(Frame::Ack(map.get("ackCode").cloned().unwrap_or_default()))
        }
        other => serde_json::from_value(other).map(Frame::Platform),
    }
}

// ── Connection ───────────────────────────────────────────────────────

/// An authenticated, self-healing session with a CUSS 2 platform.
///
/// Cheap to clone; all clones share one socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionConfig,
    endpoints: Endpoints,
    tokens: Arc<TokenManager>,
    device_id: ArcSwap<String>,
    events: Arc<EventBus>,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    pending: DashMap<String, Waiter>,
    session: Mutex<CancellationToken>,
}

impl Connection {
    /// Create a connection with its own HTTP client. Does not connect.
    pub fn new(config: ConnectionConfig) -> Result<Self, Error> {
        let http = config.build_http_client()?;
        Self::with_client(config, http)
    }

    /// Create a connection reusing an existing HTTP client.
    pub fn with_client(config: ConnectionConfig, http: reqwest::Client) -> Result<Self, Error> {
        let endpoints = Endpoints::derive(&config.base_url, config.token_url.as_ref())?;
        let events = Arc::new(EventBus::new());
        let tokens = Arc::new(TokenManager::new(
            http,
            endpoints.oauth.clone(),
            config.client_id.clone(),
            config.client_secret.clone(),
            config.retry.clone(),
            Arc::clone(&events),
        ));
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        debug!(
            oauth = %endpoints.oauth,
            websocket = %endpoints.websocket,
            "connection configured"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                device_id: ArcSwap::from_pointee(config.device_id.clone()),
                config,
                endpoints,
                tokens,
                events,
                state,
                outbound: Mutex::new(None),
                pending: DashMap::new(),
                session: Mutex::new(CancellationToken::new()),
            }),
        })
    }

    /// Run `f` against a fresh connection and always shut it down afterwards,
    /// including when `f` fails or panics.
    pub async fn oneshot<F, Fut, T>(config: ConnectionConfig, f: F) -> Result<T, Error>
    where
        F: FnOnce(Self) -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        let connection = Self::new(config)?;
        let _guard = ShutdownGuard(connection.clone());
        connection.connect().await?;
        f(connection).await
    }

    /// Authenticate, arm the token refresh, and open the socket.
    ///
    /// Resolves once the socket reaches the open state for the first time.
    pub async fn connect(&self) -> Result<(), Error> {
        self.inner.state.send_replace(ConnectionState::Authenticating);
        let token = match self.inner.tokens.authorize().await {
            Ok(token) => token,
            Err(e) => {
                self.inner.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        self.inner.tokens.schedule_refresh(token.expires_in);

        let session = CancellationToken::new();
        let previous = std::mem::replace(
            &mut *self.inner.session.lock().unwrap_or_else(PoisonError::into_inner),
            session.clone(),
        );
        previous.cancel();

        let (opened_tx, opened_rx) = oneshot::channel();
        tokio::spawn(socket_task(Arc::clone(&self.inner), session, opened_tx));

        opened_rx.await.map_err(|_| Error::NotConnected)?
    }

    /// Queue a frame without waiting for any answer.
    ///
    /// Missing `oauthToken` and `deviceID` are filled in from the session.
    pub fn send(&self, data: ApplicationData) -> Result<(), Error> {
        let data = self.enrich(data);
        let text = serde_json::to_string(&data)?;

        let guard = self.inner.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(Error::NotConnected)?;
        tx.send(Outbound::Text(text)).map_err(|_| Error::NotConnected)?;

        trace!(
            directive = %data.meta.directive,
            request_id = data.meta.request_id.as_deref().unwrap_or_default(),
            "frame queued"
        );
        Ok(())
    }

    /// Send a frame and wait for the response carrying the same `requestID`.
    ///
    /// A `requestID` is generated when absent. A response whose
    /// `messageCode` is critical is returned as [`Error::Platform`].
    pub async fn send_and_get_response(
        &self,
        mut data: ApplicationData,
    ) -> Result<PlatformData, Error> {
        let request_id = data
            .meta
            .request_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let directive = data.meta.directive;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(request_id.clone(), tx);
        let _pending = PendingGuard {
            inner: &self.inner,
            request_id: &request_id,
        };

        self.send(data)?;

        let timeout = self.inner.config.request_timeout;
        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(Error::NotConnected),
            Err(_) => {
                warn!(%directive, request_id, "request timed out");
                return Err(Error::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        };

        let message_code = response.message_code();
        if message_code.is_critical() {
            debug!(%directive, %message_code, "platform rejected request");
            return Err(PlatformResponseError {
                directive,
                message_code,
                response,
            }
            .into());
        }
        Ok(response)
    }

    /// Close the socket and disarm the token refresh. Safe to call with no
    /// socket and more than once. `None` means a normal (1000) close, which
    /// also stops any pending reconnect.
    pub fn close(&self, code: Option<u16>, reason: Option<&str>) {
        self.inner.tokens.cancel_refresh();
        let code = code.unwrap_or(CLOSE_NORMAL);
        let reason = reason.unwrap_or_default().to_owned();

        let queued = self
            .inner
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| tx.send(Outbound::Close { code, reason }).is_ok());
        if !queued {
            debug!(code, "close requested with no open socket");
        }

        if code == CLOSE_NORMAL {
            self.inner
                .session
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .cancel();
        }
    }

    /// Tear everything down: refresh timer, socket, reconnect loop.
    pub fn shutdown(&self) {
        self.inner.tokens.shutdown();
        self.close(None, None);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Install the synchronous observer. It sees every event before
    /// broadcast subscribers and before correlated waiters resume.
    pub fn set_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.inner.events.set_observer(Some(observer));
    }

    pub fn clear_observer(&self) {
        self.inner.events.set_observer(None);
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.inner.state.borrow(), ConnectionState::Open)
    }

    pub fn device_id(&self) -> String {
        self.inner.device_id.load().as_ref().clone()
    }

    pub fn set_device_id(&self, device_id: impl Into<String>) {
        self.inner.device_id.store(Arc::new(device_id.into()));
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.inner.endpoints
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.inner.tokens
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    fn enrich(&self, mut data: ApplicationData) -> ApplicationData {
        if data.meta.oauth_token.is_none() {
            data.meta.oauth_token = self.inner.tokens.access_token();
        }
        if data.meta.device_id.is_none() {
            data.meta.device_id = Some(self.device_id());
        }
        data
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("websocket", &self.inner.endpoints.websocket.as_str())
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

struct ShutdownGuard(Connection);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

/// Removes a pending waiter when the requesting future finishes or is dropped.
struct PendingGuard<'a> {
    inner: &'a Inner,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.remove(self.request_id);
    }
}

// ── Socket task ──────────────────────────────────────────────────────

impl Inner {
    fn reject_pending(&self, make_err: impl Fn() -> Error) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(make_err()));
            }
        }
    }

    /// Publish an inbound frame, then resolve its waiter. Returns the
    /// reply to write back, if any.
    fn handle_text(&self, text: &str) -> Option<String> {
        match parse_frame(text) {
            Ok(Frame::Empty) => {
                trace!("ignoring null frame");
                None
            }
            Ok(Frame::Ping(timestamp)) => {
                self.events.emit(ConnectionEvent::Ping { timestamp });
                Some(json!({ "pong": chrono::Utc::now().timestamp_millis() }).to_string())
            }
            Ok(Frame::Ack(code)) => {
                self.events.emit(ConnectionEvent::Ack { code });
                None
            }
            Ok(Frame::Platform(data)) => {
                let data = Arc::new(data);
                trace!(
                    request_id = data.request_id().unwrap_or_default(),
                    message_code = %data.message_code(),
                    "platform message"
                );
                self.events.emit(ConnectionEvent::Message(Arc::clone(&data)));

                if let Some((_, waiter)) = data.request_id().and_then(|id| self.pending.remove(id)) {
                    let _ = waiter.send(Ok(data.as_ref().clone()));
                }
                None
            }
            Err(e) => {
                warn!(error = %e, "unparseable platform frame");
                let message = e.to_string();
                self.events.emit(ConnectionEvent::MessageError {
                    message: message.clone(),
                });
                self.reject_pending(|| Error::MalformedMessage(message.clone()));
                None
            }
        }
    }
}

async fn open_socket(inner: &Inner, session: &CancellationToken) -> Result<WsStream, Error> {
    retry(&inner.config.retry, session, |attempt| {
        inner.state.send_replace(ConnectionState::Connecting { attempt });
        inner.events.emit(ConnectionEvent::Connecting { attempt });
        debug!(url = %inner.endpoints.websocket, attempt, "opening socket");
        async move {
            let (ws, _) = tokio_tungstenite::connect_async(inner.endpoints.websocket.as_str())
                .await
                .map_err(|e| Error::WebSocketConnect(e.to_string()))?;
            Ok(ws)
        }
    })
    .await
}

async fn socket_task(
    inner: Arc<Inner>,
    session: CancellationToken,
    opened: oneshot::Sender<Result<(), Error>>,
) {
    let mut opened = Some(opened);

    loop {
        let ws = match open_socket(&inner, &session).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "giving up on socket");
                inner.events.emit(ConnectionEvent::SocketError {
                    message: e.to_string(),
                });
                inner.state.send_replace(ConnectionState::Closed {
                    code: CLOSE_ABNORMAL,
                });
                inner.tokens.cancel_refresh();
                if let Some(tx) = opened.take() {
                    let _ = tx.send(Err(e));
                }
                return;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *inner.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        inner.state.send_replace(ConnectionState::Open);
        info!(url = %inner.endpoints.websocket, "socket open");
        inner.events.emit(ConnectionEvent::Open);
        if let Some(tx) = opened.take() {
            let _ = tx.send(Ok(()));
        }

        let Ended {
            code,
            reason,
            fault,
        } = pump(&inner, &session, ws, rx).await;

        *inner.outbound.lock().unwrap_or_else(PoisonError::into_inner) = None;
        inner.reject_pending(|| match &fault {
            Some(message) => Error::Socket(message.clone()),
            None => Error::WebSocketClosed {
                code,
                reason: reason.clone(),
            },
        });
        inner.state.send_replace(ConnectionState::Closed { code });
        inner.events.emit(ConnectionEvent::Close {
            code,
            reason: reason.clone(),
        });

        if code == CLOSE_NORMAL || session.is_cancelled() {
            info!(code, "socket closed");
            return;
        }
        warn!(code, reason, "socket closed abnormally, reconnecting");
        inner.state.send_replace(ConnectionState::Reconnecting);

        // A local close disarms the refresh; the new socket needs a live token.
        let token = tokio::select! {
            () = session.cancelled() => return,
            token = inner.tokens.authorize() => token,
        };
        match token {
            Ok(token) => inner.tokens.schedule_refresh(token.expires_in),
            Err(e) => {
                warn!(error = %e, "re-authorization failed, giving up on socket");
                inner.events.emit(ConnectionEvent::AuthenticationError {
                    message: e.to_string(),
                });
                inner.state.send_replace(ConnectionState::Closed {
                    code: CLOSE_ABNORMAL,
                });
                return;
            }
        }
    }
}

/// How one socket's pump ended.
struct Ended {
    code: u16,
    reason: String,
    /// Set when a read or write failed instead of the socket closing.
    fault: Option<String>,
}

impl Ended {
    fn closed((code, reason): (u16, String)) -> Self {
        Self {
            code,
            reason,
            fault: None,
        }
    }

    fn faulted(inner: &Inner, err: &WsError) -> Self {
        let message = err.to_string();
        warn!(error = %message, "socket error");
        inner.events.emit(ConnectionEvent::SocketError {
            message: message.clone(),
        });
        Self {
            code: CLOSE_ABNORMAL,
            reason: message.clone(),
            fault: Some(message),
        }
    }
}

/// Drive one open socket until it closes. Returns the effective close code
/// and reason; a close we initiated wins over the peer's.
async fn pump(
    inner: &Inner,
    session: &CancellationToken,
    ws: WsStream,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> Ended {
    let (mut write, mut read) = ws.split();
    let mut local: Option<(u16, String)> = None;
    let mut remote: Option<(u16, String)> = None;
    let close_deadline = tokio::time::sleep(Duration::MAX);
    tokio::pin!(close_deadline);

    loop {
        tokio::select! {
            biased;

            outbound = rx.recv(), if local.is_none() => match outbound {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        return Ended::faulted(inner, &e);
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    start_close(&mut write, code, &reason).await;
                    close_deadline.as_mut().reset(tokio::time::Instant::now() + CLOSE_HANDSHAKE_TIMEOUT);
                    local = Some((code, reason));
                }
                None => {
                    start_close(&mut write, CLOSE_NORMAL, "").await;
                    close_deadline.as_mut().reset(tokio::time::Instant::now() + CLOSE_HANDSHAKE_TIMEOUT);
                    local = Some((CLOSE_NORMAL, String::new()));
                }
            },

            () = session.cancelled(), if local.is_none() => {
                start_close(&mut write, CLOSE_NORMAL, "").await;
                close_deadline.as_mut().reset(tokio::time::Instant::now() + CLOSE_HANDSHAKE_TIMEOUT);
                local = Some((CLOSE_NORMAL, String::new()));
            }

            () = &mut close_deadline, if local.is_some() => {
                debug!("close handshake timed out");
                break;
            }

            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = inner.handle_text(text.as_str()) {
                        if let Err(e) = write.send(Message::Text(reply.into())).await {
                            return Ended::faulted(inner, &e);
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or((CLOSE_NO_STATUS, String::new()), |f| {
                        (u16::from(f.code), f.reason.to_string())
                    });
                    debug!(code, reason, "peer sent close frame");
                    remote = Some((code, reason));
                    if local.is_some() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    if local.is_some() || remote.is_some() {
                        break;
                    }
                    return Ended::faulted(inner, &e);
                }
                None => break,
            },
        }
    }

    Ended::closed(
        local
            .or(remote)
            .unwrap_or_else(|| (CLOSE_ABNORMAL, "connection dropped".into())),
    )
}

async fn start_close<S>(write: &mut S, code: u16, reason: &str)
where
    S: SinkExt<Message> + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_owned().into(),
    };
    if write.send(Message::Close(Some(frame))).await.is_err() {
        debug!(code, "close frame could not be sent");
    }
}
