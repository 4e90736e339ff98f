//! Interception registration
//!
//! A registration takes over a service name at the broker and produces two
//! waitables:
//!
//! - a [`MitmQuerySession`] answering, per client process, whether to
//!   intercept;
//! - a [`MitmServer`] accepting the sessions of approved processes. Each
//!   such session carries a forward session to the original service.
//!
//! State only moves forward: `Unregistered → Registered → Active` (first
//! session accepted) `→ Closed` (main endpoint destroyed).

use std::fmt;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use mitm_broker::{MitmEndpoints, Port, ServiceManager};
use mitm_core::{
    kinfo, HandleOutcome, RegistrationError, ServiceFactory, ServiceName, Waitable, WaitableKind,
    WaitableSink,
};

use crate::query::MitmQuerySession;
use crate::server::accept_one;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegistrationState {
    Unregistered = 0,
    Registered = 1,
    Active = 2,
    Closed = 3,
}

impl RegistrationState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Unregistered,
            1 => Self::Registered,
            2 => Self::Active,
            _ => Self::Closed,
        }
    }
}

/// Shared view of a registration's state.
#[derive(Clone)]
pub struct RegistrationStatus(Arc<AtomicU8>);

impl RegistrationStatus {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(RegistrationState::Unregistered as u8)))
    }

    pub fn get(&self) -> RegistrationState {
        RegistrationState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move to `to` unless already past it. True if the state changed.
    fn advance(&self, to: RegistrationState) -> bool {
        self.0.fetch_max(to as u8, Ordering::SeqCst) < to as u8
    }
}

impl fmt::Debug for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.get())
    }
}

pub struct MitmRegistration<F: ServiceFactory> {
    name: ServiceName,
    max_sessions: u32,
    factory: Arc<F>,
    endpoints: Option<MitmEndpoints>,
    status: RegistrationStatus,
}

impl<F: ServiceFactory> MitmRegistration<F> {
    pub fn new(name: &str, max_sessions: u32, factory: Arc<F>) -> Result<Self, RegistrationError> {
        Ok(Self {
            name: ServiceName::new(name)?,
            max_sessions,
            factory,
            endpoints: None,
            status: RegistrationStatus::new(),
        })
    }

    pub fn name(&self) -> ServiceName {
        self.name
    }

    pub fn max_sessions(&self) -> u32 {
        self.max_sessions
    }

    pub fn status(&self) -> RegistrationStatus {
        self.status.clone()
    }

    /// Announce the interception to the broker.
    pub fn register(&mut self, broker: &ServiceManager) -> Result<(), RegistrationError> {
        if self.endpoints.is_some() {
            return Err(RegistrationError::AlreadyIntercepted(self.name));
        }
        let endpoints = broker.install_mitm(self.name.as_str(), self.max_sessions)?;
        self.endpoints = Some(endpoints);
        self.status.advance(RegistrationState::Registered);
        Ok(())
    }

    /// Split a registered registration into its query and main waitables.
    pub fn into_waitables(self) -> Result<(MitmQuerySession<F>, MitmServer<F>), RegistrationError> {
        let MitmEndpoints { main, query } = self
            .endpoints
            .ok_or(RegistrationError::NotRegistered(self.name))?;
        let query = MitmQuerySession::new(query, Arc::clone(&self.factory), self.name);
        let server = MitmServer {
            port: main,
            factory: self.factory,
            status: self.status,
        };
        Ok((query, server))
    }

    /// Hand both waitables to `sink`.
    pub fn install(self, sink: &dyn WaitableSink) -> Result<RegistrationStatus, RegistrationError> {
        let status = self.status.clone();
        let (query, server) = self.into_waitables()?;
        sink.add(Box::new(query));
        sink.add(Box::new(server));
        Ok(status)
    }
}

/// Main endpoint of an interception registration.
pub struct MitmServer<F: ServiceFactory> {
    port: Port,
    factory: Arc<F>,
    status: RegistrationStatus,
}

impl<F: ServiceFactory> MitmServer<F> {
    pub fn port(&self) -> &Port {
        &self.port
    }

    pub fn status(&self) -> RegistrationStatus {
        self.status.clone()
    }
}

impl<F: ServiceFactory> Waitable for MitmServer<F> {
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
        if accept_one(&self.port, &*self.factory, true, sink)
            && self.status.advance(RegistrationState::Active)
        {
            kinfo!("{}: interception active", self.port.name());
        }
        HandleOutcome::Continue
    }

    fn describe(&self) -> String {
        format!("{} mitm server", self.port.name())
    }
}

impl<F: ServiceFactory> Drop for MitmServer<F> {
    fn drop(&mut self) {
        self.port.close();
        if self.status.advance(RegistrationState::Closed) {
            kinfo!("{}: interception closed", self.port.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServiceServer;
    use mitm_broker::{BrokerConfig, ServiceClient};
    use mitm_core::{
        ClientInfo, CommandId, ConnectionInfo, Handler, HandlerResult, QueryError, Request,
        RequestContext, Response, ResultCode, Service, ServiceInitError, TransportError,
    };
    use mitm_runtime::{ManagerConfig, ManagerError, ManagerHandle, ManagerStats, WaitableManager};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    const APP: u64 = 0x0100_0000_0001_0000;

    // -- original service ---------------------------------------------------

    struct Original;

    impl Original {
        fn hello(&mut self, _ctx: &mut RequestContext<'_>) -> HandlerResult {
            Ok(Response::ok(b"original".to_vec()))
        }

        fn echo(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
            let mut out = b"orig:".to_vec();
            out.extend_from_slice(ctx.payload());
            Ok(Response::ok(out))
        }

        fn exclusive(&mut self, _ctx: &mut RequestContext<'_>) -> HandlerResult {
            Ok(Response::ok(b"only-original".to_vec()))
        }
    }

    impl Service for Original {
        fn handler(&self, command: CommandId) -> Option<Handler<Self>> {
            match command.0 {
                1 => Some(Self::hello),
                2 => Some(Self::echo),
                5 => Some(Self::exclusive),
                _ => None,
            }
        }
    }

    struct OriginalFactory;

    impl ServiceFactory for OriginalFactory {
        type Service = Original;

        fn on_connect(&self, _c: &ConnectionInfo) -> Result<Original, ServiceInitError> {
            Ok(Original)
        }
    }

    // -- interceptor --------------------------------------------------------

    struct Intercepting {
        served: u32,
    }

    impl Intercepting {
        fn hello(&mut self, _ctx: &mut RequestContext<'_>) -> HandlerResult {
            Ok(Response::ok(b"mitm".to_vec()))
        }

        /// Sequence number of this request on the session, then the payload.
        fn sequence(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
            self.served += 1;
            let mut out = self.served.to_le_bytes().to_vec();
            out.extend_from_slice(ctx.payload());
            Ok(Response::ok(out))
        }

        fn pass(&mut self, _ctx: &mut RequestContext<'_>) -> HandlerResult {
            Ok(Response::Forward)
        }

        fn rewrite(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
            let rewritten = Request::new(CommandId(2), b"rewritten".to_vec());
            let reply = ctx
                .forward(&rewritten)
                .map_err(|_| ResultCode::KERNEL_SESSION_CLOSED)?;
            Ok(Response::Reply(reply))
        }
    }

    impl Service for Intercepting {
        fn handler(&self, command: CommandId) -> Option<Handler<Self>> {
            match command.0 {
                1 => Some(Self::hello),
                2 => Some(Self::sequence),
                3 => Some(Self::pass),
                4 => Some(Self::rewrite),
                _ => None,
            }
        }
    }

    #[derive(Clone, Copy)]
    enum Policy {
        All,
        Nobody,
        EvenProcesses,
        Failing,
    }

    struct Interceptor {
        policy: Policy,
        refuse_connections: bool,
    }

    impl ServiceFactory for Interceptor {
        type Service = Intercepting;

        fn on_connect(&self, c: &ConnectionInfo) -> Result<Intercepting, ServiceInitError> {
            assert!(c.intercepted);
            if self.refuse_connections {
                return Err(ServiceInitError::new("refused by test"));
            }
            Ok(Intercepting { served: 0 })
        }

        fn should_mitm(&self, client: &ClientInfo) -> Result<bool, QueryError> {
            match self.policy {
                Policy::All => Ok(true),
                Policy::Nobody => Ok(false),
                Policy::EvenProcesses => Ok(client.process_id.0 % 2 == 0),
                Policy::Failing => Err(QueryError::new("policy unavailable")),
            }
        }
    }

    // -- harness ------------------------------------------------------------

    struct Harness {
        broker: ServiceManager,
        manager: ManagerHandle,
        status: RegistrationStatus,
        runner: JoinHandle<Result<ManagerStats, ManagerError>>,
    }

    impl Harness {
        fn start(policy: Policy, refuse_connections: bool) -> Self {
            let broker = ServiceManager::new(
                BrokerConfig::new().query_timeout(Duration::from_millis(500)),
            );
            let manager = WaitableManager::new(
                ManagerConfig::new()
                    .num_threads(3)
                    .wait_timeout(Some(Duration::from_millis(50))),
            )
            .unwrap();

            let original =
                ServiceServer::register(&broker, "svc-a", 16, Arc::new(OriginalFactory)).unwrap();
            manager.add(Box::new(original));

            let factory = Arc::new(Interceptor {
                policy,
                refuse_connections,
            });
            let mut registration = MitmRegistration::new("svc-a", 60, factory).unwrap();
            assert_eq!(registration.status().get(), RegistrationState::Unregistered);
            registration.register(&broker).unwrap();
            let status = registration.install(&manager.handle()).unwrap();
            assert_eq!(status.get(), RegistrationState::Registered);

            let handle = manager.handle();
            let runner = thread::spawn(move || manager.process());
            Self {
                broker,
                manager: handle,
                status,
                runner,
            }
        }

        fn open(&self, process: u64) -> ServiceClient {
            let mut client = self
                .broker
                .get_service("svc-a", ClientInfo::new(process, APP))
                .unwrap();
            client.set_timeout(Some(Duration::from_secs(5)));
            client
        }

        fn stop(self) -> (ManagerStats, RegistrationStatus, ServiceManager) {
            self.manager.request_shutdown();
            let stats = self.runner.join().unwrap().unwrap();
            (stats, self.status, self.broker)
        }
    }

    fn text(client: &mut ServiceClient, command: u32, payload: &[u8]) -> Vec<u8> {
        let reply = client.request(CommandId(command), payload.to_vec()).unwrap();
        assert!(reply.is_success(), "command {} failed: {}", command, reply.result);
        reply.payload
    }

    #[test]
    fn test_intercept_all_scenario() {
        let harness = Harness::start(Policy::All, false);
        let mut client = harness.open(0x51);
        assert_eq!(text(&mut client, 0x1, &[]), b"mitm");
        assert_eq!(harness.status.get(), RegistrationState::Active);

        drop(client);
        let (_, status, broker) = harness.stop();
        assert_eq!(status.get(), RegistrationState::Closed);
        assert!(!broker.has_mitm("svc-a"));
    }

    #[test]
    fn test_declined_client_reaches_original() {
        let harness = Harness::start(Policy::Nobody, false);
        let mut client = harness.open(0x51);
        assert_eq!(text(&mut client, 0x1, &[]), b"original");
        assert_eq!(harness.status.get(), RegistrationState::Registered);
        drop(client);
        harness.stop();
    }

    #[test]
    fn test_decision_routes_every_open() {
        let harness = Harness::start(Policy::EvenProcesses, false);
        for _ in 0..3 {
            let mut approved = harness.open(2);
            assert_eq!(text(&mut approved, 1, &[]), b"mitm");
            let mut declined = harness.open(3);
            assert_eq!(text(&mut declined, 1, &[]), b"original");
        }
        harness.stop();
    }

    #[test]
    fn test_failing_policy_fails_closed() {
        let harness = Harness::start(Policy::Failing, false);
        let mut client = harness.open(4);
        assert_eq!(text(&mut client, 1, &[]), b"original");
        drop(client);
        harness.stop();
    }

    #[test]
    fn test_forwarding_paths() {
        let harness = Harness::start(Policy::All, false);
        let mut client = harness.open(8);

        // No interceptor handler: relayed to the original.
        assert_eq!(text(&mut client, 5, &[]), b"only-original");
        // Explicit forward of a command the original does not know either:
        // its error reply comes back verbatim.
        let reply = client.request(CommandId(3), Vec::new()).unwrap();
        assert_eq!(reply.result, ResultCode::SF_UNKNOWN_COMMAND_ID);
        // Rewritten request.
        assert_eq!(text(&mut client, 4, b"ignored"), b"orig:rewritten");
        // The session is still intercepted afterwards.
        assert_eq!(text(&mut client, 1, &[]), b"mitm");

        drop(client);
        harness.stop();
    }

    #[test]
    fn test_two_sessions_in_order() {
        let harness = Harness::start(Policy::All, false);
        let workers: Vec<_> = [10u64, 12]
            .iter()
            .map(|&pid| {
                let mut client = harness.open(pid);
                thread::spawn(move || {
                    for i in 1..=100u32 {
                        let mut payload = pid.to_le_bytes().to_vec();
                        payload.extend_from_slice(&i.to_le_bytes());
                        let reply = text(&mut client, 2, &payload);
                        assert_eq!(&reply[0..4], &i.to_le_bytes());
                        assert_eq!(&reply[4..], &payload[..]);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        let (stats, _, _) = harness.stop();
        assert!(stats.dispatches >= 200);
    }

    #[test]
    fn test_refused_connection_is_closed() {
        let harness = Harness::start(Policy::All, true);
        let mut client = harness.open(6);
        let err = client.request(CommandId(1), Vec::new()).unwrap_err();
        assert!(matches!(err, TransportError::PeerClosed), "{:?}", err);
        // Registration never became active.
        assert_eq!(harness.status.get(), RegistrationState::Registered);
        harness.stop();
    }

    #[test]
    fn test_status_never_moves_back() {
        let status = RegistrationStatus::new();
        assert!(status.advance(RegistrationState::Active));
        assert!(!status.advance(RegistrationState::Registered));
        assert_eq!(status.get(), RegistrationState::Active);
    }

    #[test]
    fn test_install_requires_registration() {
        let registration = MitmRegistration::new(
            "svc-a",
            60,
            Arc::new(Interceptor {
                policy: Policy::All,
                refuse_connections: false,
            }),
        )
        .unwrap();
        let manager = WaitableManager::new(ManagerConfig::new()).unwrap();
        assert!(matches!(
            registration.install(&manager.handle()),
            Err(RegistrationError::NotRegistered(_))
        ));
    }
}
