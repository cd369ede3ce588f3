// Connection event stream
//
// Every lifecycle change and inbound frame is published twice: first to
// the single synchronous observer (if one is installed), then to the
// broadcast channel. The observer runs on the socket task before any
// correlated waiter is resolved, so a consumer that mutates state from
// inbound messages sees them strictly in arrival order.

use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::models::PlatformData;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle and message events emitted by a [`Connection`](crate::Connection).
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// An OAuth token request is about to be made (1-based attempt).
    Authenticating { attempt: u32 },
    /// A token was obtained.
    Authenticated { token_type: String, expires_in: i64 },
    /// A scheduled refresh or a reconnect could not obtain a token.
    AuthenticationError { message: String },
    /// A socket connect attempt is about to be made (1-based attempt).
    Connecting { attempt: u32 },
    /// The socket is open.
    Open,
    /// The platform pinged; a pong has been queued.
    Ping { timestamp: Value },
    /// The platform acknowledged a frame.
    Ack { code: Value },
    /// A platform message arrived.
    Message(Arc<PlatformData>),
    /// An inbound frame could not be parsed.
    MessageError { message: String },
    /// The socket reported a transport error.
    SocketError { message: String },
    /// The socket closed.
    Close { code: u16, reason: String },
}

/// Coarse connection state, observable through a `watch` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Authenticating,
    Connecting { attempt: u32 },
    Open,
    /// An abnormal close is being recovered from.
    Reconnecting,
    Closed { code: u16 },
}

/// Synchronous consumer of connection events.
///
/// Called on the socket task. Implementations must not block; long work
/// belongs on a spawned task.
pub trait ConnectionObserver: Send + Sync + 'static {
    fn on_event(&self, event: &ConnectionEvent);
}

/// Fan-out point shared by the token manager and the socket task.
pub(crate) struct EventBus {
    tx: broadcast::Sender<ConnectionEvent>,
    observer: RwLock<Option<Arc<dyn ConnectionObserver>>>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            observer: RwLock::new(None),
        }
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let observer = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer.on_event(&event);
        }
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn set_observer(&self, observer: Option<Arc<dyn ConnectionObserver>>) {
        *self.observer.write().unwrap_or_else(PoisonError::into_inner) = observer;
    }
}
