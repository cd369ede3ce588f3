// The engine's view of the transport.
//
// `Connection` is the production implementation; tests substitute an
// in-memory link that answers directives from a scripted platform.

use std::future::Future;
use std::sync::Arc;

use cuss2_api::{ApplicationData, Connection, ConnectionObserver, Error, PlatformData};

pub trait PlatformLink: Send + Sync + 'static {
    /// Authenticate and open the session. Lifecycle events, including
    /// `Open`, reach the installed observer.
    fn connect(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Send a directive and wait for its correlated response.
    fn send_and_get_response(
        &self,
        data: ApplicationData,
    ) -> impl Future<Output = Result<PlatformData, Error>> + Send;

    fn close(&self, code: u16, reason: &str);

    fn set_observer(&self, observer: Arc<dyn ConnectionObserver>);

    fn device_id(&self) -> String;

    fn set_device_id(&self, device_id: &str);
}

impl PlatformLink for Connection {
    fn connect(&self) -> impl Future<Output = Result<(), Error>> + Send {
        Connection::connect(self)
    }

    fn send_and_get_response(
        &self,
        data: ApplicationData,
    ) -> impl Future<Output = Result<PlatformData, Error>> + Send {
        Connection::send_and_get_response(self, data)
    }

    fn close(&self, code: u16, reason: &str) {
        Connection::close(self, Some(code), Some(reason));
    }

    fn set_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        Connection::set_observer(self, observer);
    }

    fn device_id(&self) -> String {
        Connection::device_id(self)
    }

    fn set_device_id(&self, device_id: &str) {
        Connection::set_device_id(self, device_id);
    }
}
