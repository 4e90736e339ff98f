//! Service broker
//!
//! Routes session opens by name. For a name with an interception
//! registration the broker first asks the registration's query endpoint
//! whether the opening process should be intercepted:
//!
//! ```text
//! get_service(name, client)
//!   ├─ no mitm ───────────────────────────────► real port
//!   └─ mitm ─► cached decision? ─► ask query (bounded by query_timeout)
//!                 ├─ true  ─► mitm port (+ forward session to real port)
//!                 └─ false / error / timeout ─► real port
//! ```
//!
//! Decisions are cached per process once answered, up to
//! `decision_cache` processes per registration; past that the oldest
//! decision is forgotten and that process is asked again on its next open.
//! Failed or timed out queries are not cached, so the next open asks
//! again. Replies carry the query token; a late reply to an abandoned
//! query is discarded.
//!
//! The session relaying an intercepted client to the real service is
//! bounded by `forward_timeout` per exchange.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use mitm_core::message::{read_reply, write_request, Deadline};
use mitm_core::query::{QueryReply, QueryRequest};
use mitm_core::{
    kdebug, kinfo, kwarn, ClientInfo, ProcessId, ProtocolError, RegistrationError, ServiceName,
    TransportError,
};

use crate::client::{ForwardHandle, ServiceClient};
use crate::config::BrokerConfig;
use crate::error::ConnectError;
use crate::port::{PendingSession, Port};

/// What an interception registration receives from the broker.
pub struct MitmEndpoints {
    /// Sessions of approved processes arrive here.
    pub main: Port,
    /// Server half of the query session.
    pub query: UnixStream,
}

struct QueryChannel {
    stream: UnixStream,
    decisions: HashMap<ProcessId, bool>,
    /// Decided processes, oldest first.
    decided: VecDeque<ProcessId>,
    capacity: usize,
}

impl QueryChannel {
    fn new(stream: UnixStream, capacity: usize) -> Self {
        Self {
            stream,
            decisions: HashMap::new(),
            decided: VecDeque::new(),
            capacity,
        }
    }

    fn recall(&self, process: ProcessId) -> Option<bool> {
        self.decisions.get(&process).copied()
    }

    fn remember(&mut self, process: ProcessId, decision: bool) {
        if self.decisions.insert(process, decision).is_some() {
            return;
        }
        self.decided.push_back(process);
        while self.decided.len() > self.capacity {
            if let Some(oldest) = self.decided.pop_front() {
                self.decisions.remove(&oldest);
            }
        }
    }

    fn ask(&mut self, token: u64, client: ClientInfo, timeout: Duration) -> Result<bool, TransportError> {
        let request = QueryRequest { token, client }.encode();
        write_request(&mut self.stream, &request)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::TimedOut);
            }
            let reply = read_reply(&mut Deadline::new(&self.stream, remaining))?;
            if reply.result.is_failure() {
                kdebug!("query answered with {}", reply.result);
                return Err(TransportError::BadReply(ProtocolError::Malformed(
                    "query answered with an error",
                )));
            }
            let answer = QueryReply::decode(&reply).map_err(TransportError::BadReply)?;
            if answer.token == token {
                return Ok(answer.intercept);
            }
            kdebug!("discarding stale query reply (token {})", answer.token);
        }
    }
}

struct MitmEntry {
    port: Port,
    query: Arc<Mutex<QueryChannel>>,
}

#[derive(Default)]
struct Registry {
    services: HashMap<ServiceName, Port>,
    mitms: HashMap<ServiceName, MitmEntry>,
}

struct BrokerInner {
    config: BrokerConfig,
    registry: Mutex<Registry>,
    changed: Condvar,
    open: AtomicBool,
    next_token: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle to one broker.
#[derive(Clone)]
pub struct ServiceManager {
    inner: Arc<BrokerInner>,
}

impl ServiceManager {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                registry: Mutex::new(Registry::default()),
                changed: Condvar::new(),
                open: AtomicBool::new(true),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    fn check_registration(&self, name: &str, max_sessions: u32) -> Result<ServiceName, RegistrationError> {
        if !self.is_open() {
            return Err(RegistrationError::BrokerUnreachable);
        }
        let name = ServiceName::new(name)?;
        let limit = self.inner.config.max_sessions;
        if max_sessions == 0 || max_sessions > limit {
            return Err(RegistrationError::InvalidSessionCount {
                requested: max_sessions,
                limit,
            });
        }
        Ok(name)
    }

    /// Register a real service. The caller serves the returned port.
    pub fn register_service(&self, name: &str, max_sessions: u32) -> Result<Port, RegistrationError> {
        let name = self.check_registration(name, max_sessions)?;
        let mut registry = lock(&self.inner.registry);
        if registry.services.contains_key(&name) {
            return Err(RegistrationError::AlreadyRegistered(name));
        }
        let port = Port::new(name, max_sessions)
            .map_err(|e| RegistrationError::Os(io::Error::from(e)))?;
        registry.services.insert(name, port.clone());
        drop(registry);

        self.inner.changed.notify_all();
        kinfo!("registered service {} ({} sessions)", name, max_sessions);
        Ok(port)
    }

    /// Take over `name` for the processes the query endpoint approves.
    ///
    /// The real service must already be registered. A previous
    /// registration whose main port was closed may be replaced.
    pub fn install_mitm(&self, name: &str, max_sessions: u32) -> Result<MitmEndpoints, RegistrationError> {
        let name = self.check_registration(name, max_sessions)?;
        let mut registry = lock(&self.inner.registry);
        if !registry.services.contains_key(&name) {
            return Err(RegistrationError::NotRegistered(name));
        }
        if let Some(existing) = registry.mitms.get(&name) {
            if !existing.port.is_closed() {
                return Err(RegistrationError::AlreadyIntercepted(name));
            }
        }

        let port = Port::new(name, max_sessions)
            .map_err(|e| RegistrationError::Os(io::Error::from(e)))?;
        let (broker_side, server_side) = UnixStream::pair().map_err(RegistrationError::Os)?;
        broker_side
            .set_write_timeout(Some(self.inner.config.query_timeout))
            .map_err(RegistrationError::Os)?;

        registry.mitms.insert(
            name,
            MitmEntry {
                port: port.clone(),
                query: Arc::new(Mutex::new(QueryChannel::new(
                    broker_side,
                    self.inner.config.decision_cache,
                ))),
            },
        );
        drop(registry);

        kinfo!("installed interception for {} ({} sessions)", name, max_sessions);
        Ok(MitmEndpoints {
            main: port,
            query: server_side,
        })
    }

    pub fn has_service(&self, name: &str) -> bool {
        match ServiceName::new(name) {
            Ok(name) => lock(&self.inner.registry).services.contains_key(&name),
            Err(_) => false,
        }
    }

    /// True while a live interception registration exists for `name`.
    pub fn has_mitm(&self, name: &str) -> bool {
        match ServiceName::new(name) {
            Ok(name) => lock(&self.inner.registry)
                .mitms
                .get(&name)
                .map_or(false, |m| !m.port.is_closed()),
            Err(_) => false,
        }
    }

    /// Block until `name` is registered, the broker closes, or `timeout`.
    pub fn wait_for_service(&self, name: &str, timeout: Duration) -> Result<(), ConnectError> {
        let name = ServiceName::new(name)?;
        let deadline = Instant::now() + timeout;
        let mut registry = lock(&self.inner.registry);
        loop {
            if !self.is_open() {
                return Err(ConnectError::BrokerClosed);
            }
            if registry.services.contains_key(&name) {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ConnectError::TimedOut(name));
            }
            registry = self
                .inner
                .changed
                .wait_timeout(registry, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Open a session to `name` on behalf of `client`.
    pub fn get_service(&self, name: &str, client: ClientInfo) -> Result<ServiceClient, ConnectError> {
        if !self.is_open() {
            return Err(ConnectError::BrokerClosed);
        }
        let name = ServiceName::new(name)?;
        let (real, mitm) = {
            let registry = lock(&self.inner.registry);
            let real = registry
                .services
                .get(&name)
                .cloned()
                .ok_or(ConnectError::NotRegistered(name))?;
            let mitm = registry
                .mitms
                .get(&name)
                .map(|m| (m.port.clone(), Arc::clone(&m.query)));
            (real, mitm)
        };

        if let Some((mitm_port, query)) = mitm {
            if mitm_port.is_closed() {
                self.forget_mitm(name, &mitm_port);
            } else if self.should_intercept(name, &query, client) {
                match self.connect_intercepted(&mitm_port, &real, client) {
                    Ok(session) => return Ok(session),
                    Err(ConnectError::PortClosed(_)) if mitm_port.is_closed() => {
                        kdebug!("{}: interception port closed, using original", name);
                        self.forget_mitm(name, &mitm_port);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        connect(&real, client, None)
    }

    fn forget_mitm(&self, name: ServiceName, port: &Port) {
        let mut registry = lock(&self.inner.registry);
        let same = registry
            .mitms
            .get(&name)
            .map_or(false, |m| m.port.same_port(port));
        if same {
            registry.mitms.remove(&name);
            kinfo!("interception for {} is gone", name);
        }
    }

    fn should_intercept(&self, name: ServiceName, query: &Mutex<QueryChannel>, client: ClientInfo) -> bool {
        let mut channel = lock(query);
        if let Some(decision) = channel.recall(client.process_id) {
            return decision;
        }
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        match channel.ask(token, client, self.inner.config.query_timeout) {
            Ok(decision) => {
                kdebug!("{}: intercept {} = {}", name, client, decision);
                channel.remember(client.process_id, decision);
                decision
            }
            Err(e) => {
                kwarn!("{}: interception query for {} failed ({}), not intercepting", name, client, e);
                false
            }
        }
    }

    fn connect_intercepted(
        &self,
        mitm_port: &Port,
        real: &Port,
        client: ClientInfo,
    ) -> Result<ServiceClient, ConnectError> {
        // Reserve the interception slot first so a full port costs nothing.
        let guard = reserve(mitm_port)?;
        let mut original = connect(real, client, None)?;
        original.set_timeout(Some(self.inner.config.forward_timeout));
        push(mitm_port, client, Some(ForwardHandle::new(original)), guard)
    }

    /// Stop routing: close every port, wake waiters.
    pub fn close(&self) {
        if !self.inner.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let registry = std::mem::take(&mut *lock(&self.inner.registry));
        for port in registry.services.values() {
            port.close();
        }
        for entry in registry.mitms.values() {
            entry.port.close();
        }
        self.inner.changed.notify_all();
        kinfo!("service broker closed");
    }
}

impl fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = lock(&self.inner.registry);
        f.debug_struct("ServiceManager")
            .field("services", &registry.services.len())
            .field("mitms", &registry.mitms.len())
            .field("open", &self.is_open())
            .finish()
    }
}

fn reserve(port: &Port) -> Result<crate::port::SessionGuard, ConnectError> {
    port.reserve().ok_or_else(|| {
        if port.is_closed() {
            ConnectError::PortClosed(port.name())
        } else {
            ConnectError::OutOfSessions(port.name())
        }
    })
}

fn push(
    port: &Port,
    client: ClientInfo,
    forward: Option<ForwardHandle>,
    guard: crate::port::SessionGuard,
) -> Result<ServiceClient, ConnectError> {
    let (client_side, server_side) = UnixStream::pair().map_err(ConnectError::Os)?;
    let session = PendingSession {
        stream: server_side,
        client: Some(client),
        forward,
        guard,
    };
    port.push(session)
        .map_err(|_| ConnectError::PortClosed(port.name()))?;
    Ok(ServiceClient::new(client_side, port.name()))
}

fn connect(port: &Port, client: ClientInfo, forward: Option<ForwardHandle>) -> Result<ServiceClient, ConnectError> {
    let guard = reserve(port)?;
    push(port, client, forward, guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mitm_core::message::{read_request, write_reply};
    use mitm_core::{CommandId, Forward, Reply, Request, ResultCode};
    use std::thread;

    fn broker() -> ServiceManager {
        ServiceManager::new(BrokerConfig::new().query_timeout(Duration::from_millis(200)))
    }

    const CLIENT: ClientInfo = ClientInfo::new(0x51, 0x0100_0000_0000_1000);

    /// Answer `n` queries with `decision`, echoing tokens.
    fn answer(mut query: UnixStream, n: usize, decision: bool) -> thread::JoinHandle<UnixStream> {
        thread::spawn(move || {
            for _ in 0..n {
                let req = read_request(&mut query).unwrap();
                let q = QueryRequest::decode(&req).unwrap();
                let reply = QueryReply { token: q.token, intercept: decision }.encode();
                write_reply(&mut query, &reply).unwrap();
            }
            query
        })
    }

    #[test]
    fn test_register_and_connect() {
        let sm = broker();
        let port = sm.register_service("svc-a", 4).unwrap();
        let _client = sm.get_service("svc-a", CLIENT).unwrap();
        let pending = port.accept().unwrap();
        assert_eq!(pending.client, Some(CLIENT));
        assert!(pending.forward.is_none());
    }

    #[test]
    fn test_registration_errors() {
        let sm = broker();
        sm.register_service("svc-a", 4).unwrap();
        assert!(matches!(
            sm.register_service("svc-a", 4),
            Err(RegistrationError::AlreadyRegistered(_))
        ));
        assert!(matches!(
            sm.install_mitm("svc-b", 4),
            Err(RegistrationError::NotRegistered(_))
        ));
        assert!(matches!(
            sm.install_mitm("svc-a", 0),
            Err(RegistrationError::InvalidSessionCount { requested: 0, limit: 64 })
        ));
        assert!(matches!(
            sm.install_mitm("svc-a", 65),
            Err(RegistrationError::InvalidSessionCount { .. })
        ));
        assert!(matches!(
            sm.install_mitm("much-too-long", 4),
            Err(RegistrationError::InvalidName(_))
        ));

        let _endpoints = sm.install_mitm("svc-a", 60).unwrap();
        let err = sm.install_mitm("svc-a", 60).err().unwrap();
        assert_eq!(err.result_code(), ResultCode::SM_ALREADY_REGISTERED);

        sm.close();
        assert!(matches!(
            sm.register_service("svc-c", 1),
            Err(RegistrationError::BrokerUnreachable)
        ));
    }

    #[test]
    fn test_intercepted_client_gets_forwarder() {
        let sm = broker();
        let real = sm.register_service("svc-a", 4).unwrap();
        let endpoints = sm.install_mitm("svc-a", 4).unwrap();
        let responder = answer(endpoints.query, 1, true);

        let _client = sm.get_service("svc-a", CLIENT).unwrap();
        responder.join().unwrap();

        let pending = endpoints.main.accept().unwrap();
        assert!(pending.forward.is_some());
        // The forward session occupies a slot on the real port.
        assert_eq!(real.active_sessions(), 1);
        assert!(real.accept().is_some());
    }

    #[test]
    fn test_decision_cached_per_process() {
        let sm = broker();
        let real = sm.register_service("svc-a", 8).unwrap();
        let endpoints = sm.install_mitm("svc-a", 8).unwrap();
        let responder = answer(endpoints.query, 1, true);

        // Only the first open is queried; an unanswered second query
        // would time out and route to the original instead.
        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(sm.get_service("svc-a", CLIENT).unwrap());
        }
        let _query = responder.join().unwrap();
        for _ in 0..3 {
            let pending = endpoints.main.accept().unwrap();
            assert!(pending.forward.is_some());
        }
        assert_eq!(real.active_sessions(), 3);

        // Another process gets its own query, which nobody answers.
        let other = ClientInfo::new(0x52, 0x0100_0000_0000_1000);
        let _c = sm.get_service("svc-a", other).unwrap();
        assert!(endpoints.main.accept().is_none());
    }

    #[test]
    fn test_query_timeout_fails_closed() {
        let sm = ServiceManager::new(BrokerConfig::new().query_timeout(Duration::from_millis(30)));
        let real = sm.register_service("svc-a", 4).unwrap();
        let endpoints = sm.install_mitm("svc-a", 4).unwrap();
        let _silent = endpoints.query;

        let _client = sm.get_service("svc-a", CLIENT).unwrap();
        assert!(real.accept().is_some());
        assert!(endpoints.main.accept().is_none());
    }

    #[test]
    fn test_stale_reply_discarded() {
        let sm = ServiceManager::new(BrokerConfig::new().query_timeout(Duration::from_millis(200)));
        let real = sm.register_service("svc-a", 4).unwrap();
        let endpoints = sm.install_mitm("svc-a", 4).unwrap();
        let mut query = endpoints.query;

        let responder = thread::spawn(move || {
            let req = read_request(&mut query).unwrap();
            let q = QueryRequest::decode(&req).unwrap();
            // An answer to an older token, then the real one.
            write_reply(&mut query, &QueryReply { token: q.token + 1000, intercept: false }.encode()).unwrap();
            write_reply(&mut query, &QueryReply { token: q.token, intercept: true }.encode()).unwrap();
            query
        });

        let _client = sm.get_service("svc-a", CLIENT).unwrap();
        let _query = responder.join().unwrap();
        assert!(endpoints.main.accept().is_some());
        // Only the forward session landed on the real port.
        assert_eq!(real.active_sessions(), 1);
    }

    #[test]
    fn test_error_reply_not_cached() {
        let sm = broker();
        let real = sm.register_service("svc-a", 4).unwrap();
        let endpoints = sm.install_mitm("svc-a", 4).unwrap();
        let mut query = endpoints.query;

        let responder = thread::spawn(move || {
            let _ = read_request(&mut query).unwrap();
            write_reply(&mut query, &Reply::error(ResultCode::SF_INVALID_IN_HEADER)).unwrap();
            let req = read_request(&mut query).unwrap();
            let q = QueryRequest::decode(&req).unwrap();
            write_reply(&mut query, &QueryReply { token: q.token, intercept: true }.encode()).unwrap();
            query
        });

        let _first = sm.get_service("svc-a", CLIENT).unwrap();
        assert!(real.accept().is_some());
        let _second = sm.get_service("svc-a", CLIENT).unwrap();
        responder.join().unwrap();
        assert!(endpoints.main.accept().is_some());
    }

    #[test]
    fn test_closed_mitm_falls_back() {
        let sm = broker();
        let real = sm.register_service("svc-a", 4).unwrap();
        let endpoints = sm.install_mitm("svc-a", 4).unwrap();
        endpoints.main.close();

        let _client = sm.get_service("svc-a", CLIENT).unwrap();
        assert!(real.accept().is_some());
        assert!(!sm.has_mitm("svc-a"));
        // The name can be intercepted again.
        assert!(sm.install_mitm("svc-a", 4).is_ok());
    }

    #[test]
    fn test_session_limit_enforced() {
        let sm = broker();
        let _port = sm.register_service("svc-a", 1).unwrap();
        let _first = sm.get_service("svc-a", CLIENT).unwrap();
        assert!(matches!(
            sm.get_service("svc-a", CLIENT),
            Err(ConnectError::OutOfSessions(_))
        ));
    }

    #[test]
    fn test_wait_for_service() {
        let sm = broker();
        assert!(matches!(
            sm.wait_for_service("set:sys", Duration::from_millis(10)),
            Err(ConnectError::TimedOut(_))
        ));

        let sm2 = sm.clone();
        let registrar = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sm2.register_service("set:sys", 4).unwrap()
        });
        sm.wait_for_service("set:sys", Duration::from_secs(5)).unwrap();
        registrar.join().unwrap();
        assert!(sm.has_service("set:sys"));
    }

    #[test]
    fn test_close_wakes_waiters() {
        let sm = broker();
        let sm2 = sm.clone();
        let waiter = thread::spawn(move || sm2.wait_for_service("set:sys", Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        sm.close();
        assert!(matches!(waiter.join().unwrap(), Err(ConnectError::BrokerClosed)));
        assert!(matches!(
            sm.get_service("svc-a", CLIENT),
            Err(ConnectError::BrokerClosed)
        ));
    }

    #[test]
    fn test_unregistered_name() {
        let sm = broker();
        let err = sm.get_service("svc-z", CLIENT).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::SM_NOT_REGISTERED);
    }

    #[test]
    fn test_decision_cache_is_bounded() {
        let sm = ServiceManager::new(
            BrokerConfig::new()
                .query_timeout(Duration::from_millis(200))
                .decision_cache(2),
        );
        let _real = sm.register_service("svc-a", 16).unwrap();
        let endpoints = sm.install_mitm("svc-a", 16).unwrap();
        let responder = answer(endpoints.query, 4, true);

        // Three processes decided; the first one is forgotten and asked again.
        let mut clients = Vec::new();
        for pid in [1, 2, 3, 1] {
            clients.push(sm.get_service("svc-a", ClientInfo::new(pid, 0x0100)).unwrap());
        }
        responder.join().unwrap();
        for _ in 0..4 {
            assert!(endpoints.main.accept().is_some());
        }

        let registry = lock(&sm.inner.registry);
        let query = lock(&registry.mitms[&ServiceName::new("svc-a").unwrap()].query);
        assert_eq!(query.decisions.len(), 2);
        assert_eq!(query.decided, [3, 1].map(ProcessId));
    }

    #[test]
    fn test_forward_to_hung_original_times_out() {
        let sm = ServiceManager::new(
            BrokerConfig::new()
                .query_timeout(Duration::from_millis(200))
                .forward_timeout(Duration::from_millis(100)),
        );
        let real = sm.register_service("svc-a", 4).unwrap();
        let endpoints = sm.install_mitm("svc-a", 4).unwrap();
        let responder = answer(endpoints.query, 1, true);

        let _client = sm.get_service("svc-a", CLIENT).unwrap();
        responder.join().unwrap();
        // Queued on the real port but never served.
        let _hung = real.accept().unwrap();

        let mut forward = endpoints.main.accept().unwrap().forward.unwrap();
        let started = Instant::now();
        let err = forward
            .forward(&Request::new(CommandId(1), Vec::new()))
            .unwrap_err();
        assert!(matches!(err, TransportError::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
