//! Listening endpoint of a real (non-intercepted) service.

use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;

use mitm_broker::{Port, ServiceManager};
use mitm_core::{
    kdebug, kwarn, ConnectionInfo, HandleOutcome, RegistrationError, ServiceFactory, Waitable,
    WaitableKind, WaitableSink,
};

use crate::session::ServiceSession;

/// Accept one queued connection and hand its session to `sink`.
///
/// Returns true only when a session was created.
pub(crate) fn accept_one<F: ServiceFactory>(
    port: &Port,
    factory: &F,
    intercepted: bool,
    sink: &dyn WaitableSink,
) -> bool {
    let pending = match port.accept() {
        Some(pending) => pending,
        None => return false,
    };
    let connection = ConnectionInfo {
        service: port.name(),
        client: pending.client,
        intercepted,
    };

    let service = match factory.on_connect(&connection) {
        Ok(service) => service,
        Err(e) => {
            // Dropping the pending session closes the client's stream.
            kwarn!("{}: refusing connection: {}", connection.service, e);
            return false;
        }
    };

    let session = ServiceSession::new(pending.stream, service, connection, pending.forward, pending.guard);
    kdebug!("{}: accepted {}", connection.service, session.describe());
    sink.add(Box::new(session));
    true
}

pub struct ServiceServer<F: ServiceFactory> {
    port: Port,
    factory: Arc<F>,
}

impl<F: ServiceFactory> ServiceServer<F> {
    pub fn new(port: Port, factory: Arc<F>) -> Self {
        Self { port, factory }
    }

    /// Register `name` with the broker and serve it with `factory`.
    pub fn register(
        broker: &ServiceManager,
        name: &str,
        max_sessions: u32,
        factory: Arc<F>,
    ) -> Result<Self, RegistrationError> {
        let port = broker.register_service(name, max_sessions)?;
        Ok(Self::new(port, factory))
    }

    pub fn port(&self) -> &Port {
        &self.port
    }
}

impl<F: ServiceFactory> Waitable for ServiceServer<F> {
    fn kind(&self) -> WaitableKind {
        WaitableKind::Listening
    }

    fn handle(&self) -> BorrowedFd<'_> {
        self.port.as_fd()
    }

    fn handle_signaled(&mut self, sink: &dyn WaitableSink) -> HandleOutcome {
        if self.port.is_closed() {
            return HandleOutcome::Close;
        }
        accept_one(&self.port, &*self.factory, false, sink);
        HandleOutcome::Continue
    }

    fn describe(&self) -> String {
        format!("{} server", self.port.name())
    }
}

impl<F: ServiceFactory> Drop for ServiceServer<F> {
    fn drop(&mut self) {
        self.port.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mitm_broker::BrokerConfig;
    use mitm_core::{ClientInfo, CommandId, Handler, Service, ServiceInitError, Waitable};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct Nothing;

    impl Service for Nothing {
        fn handler(&self, _command: CommandId) -> Option<Handler<Self>> {
            None
        }
    }

    struct Gate {
        open: AtomicBool,
    }

    impl ServiceFactory for Gate {
        type Service = Nothing;

        fn on_connect(&self, c: &ConnectionInfo) -> Result<Nothing, ServiceInitError> {
            assert!(!c.intercepted);
            if self.open.load(Ordering::SeqCst) {
                Ok(Nothing)
            } else {
                Err(ServiceInitError::new("gate closed"))
            }
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<Box<dyn Waitable>>>);

    impl WaitableSink for Collect {
        fn add(&self, waitable: Box<dyn Waitable>) {
            self.0.lock().unwrap().push(waitable);
        }
    }

    fn server(open: bool) -> (ServiceManager, ServiceServer<Gate>) {
        let broker = ServiceManager::new(BrokerConfig::new());
        let gate = Arc::new(Gate {
            open: AtomicBool::new(open),
        });
        let server = ServiceServer::register(&broker, "svc-b", 4, gate).unwrap();
        (broker, server)
    }

    #[test]
    fn test_accept_hands_session_to_sink() {
        let (broker, mut server) = server(true);
        let _client = broker.get_service("svc-b", ClientInfo::new(1, 1)).unwrap();

        let sink = Collect::default();
        assert!(matches!(server.handle_signaled(&sink), HandleOutcome::Continue));
        let added = sink.0.lock().unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].kind(), WaitableKind::Session);
        assert_eq!(server.port().active_sessions(), 1);
    }

    #[test]
    fn test_refused_connection_releases_slot() {
        let (broker, server) = server(false);
        let _client = broker.get_service("svc-b", ClientInfo::new(1, 1)).unwrap();

        let sink = Collect::default();
        assert!(!accept_one(server.port(), &Gate { open: AtomicBool::new(false) }, false, &sink));
        assert!(sink.0.lock().unwrap().is_empty());
        assert_eq!(server.port().active_sessions(), 0);
    }

    #[test]
    fn test_closed_port_retires_server() {
        let (_broker, mut server) = server(true);
        server.port().close();
        assert!(matches!(server.handle_signaled(&Collect::default()), HandleOutcome::Close));
    }
}
