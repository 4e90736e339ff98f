//! Pass-through interception policies for `fsp-srv` and `set:sys`.
//!
//! Both relay every command to the original service unchanged and keep
//! traffic counters. The first session of each program queues a warm-up
//! job on the background worker so per-program state is prepared off the
//! dispatch threads.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use mitm_core::{
    kdebug, ktrace, ClientInfo, CommandId, ConnectionInfo, Handler, HandlerResult, ProgramId,
    QueryError, RequestContext, Response, Service, ServiceFactory, ServiceInitError,
};
use mitm_runtime::WorkerHandle;

/// Which client processes a policy intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Applications,
    Everyone,
}

impl Scope {
    fn covers(self, client: &ClientInfo) -> bool {
        match self {
            Scope::Applications => client.program_id.is_application(),
            Scope::Everyone => true,
        }
    }
}

#[derive(Debug, Default)]
pub struct TrafficStats {
    sessions: AtomicU64,
    requests: AtomicU64,
    warmed: Mutex<BTreeSet<ProgramId>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub sessions: u64,
    pub requests: u64,
    pub programs: usize,
}

impl TrafficStats {
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            sessions: self.sessions.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            programs: self.warmed.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }

    fn is_warm(&self, program: ProgramId) -> bool {
        self.warmed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&program)
    }

    fn mark_warm(&self, program: ProgramId) -> bool {
        self.warmed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(program)
    }
}

impl fmt::Display for TrafficSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sessions, {} requests, {} programs",
            self.sessions, self.requests, self.programs
        )
    }
}

pub struct PassthroughSession {
    stats: Arc<TrafficStats>,
}

impl PassthroughSession {
    fn relay(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        ktrace!("{}: relaying {}", ctx.connection().service, ctx.command());
        Ok(Response::Forward)
    }
}

impl Service for PassthroughSession {
    fn handler(&self, _command: CommandId) -> Option<Handler<Self>> {
        Some(Self::relay)
    }
}

pub struct PassthroughMitm {
    scope: Scope,
    stats: Arc<TrafficStats>,
    worker: WorkerHandle,
}

impl PassthroughMitm {
    pub fn new(scope: Scope, worker: WorkerHandle) -> Self {
        Self {
            scope,
            stats: Arc::new(TrafficStats::default()),
            worker,
        }
    }

    pub fn stats(&self) -> Arc<TrafficStats> {
        Arc::clone(&self.stats)
    }

    fn warm_up(&self, program: ProgramId) {
        if self.stats.is_warm(program) {
            return;
        }
        let stats = Arc::clone(&self.stats);
        let queued = self.worker.enqueue(move || {
            if stats.mark_warm(program) {
                kdebug!("warmed up state for {}", program);
            }
        });
        if queued.is_err() {
            kdebug!("worker closed, skipping warm-up for {}", program);
        }
    }
}

impl ServiceFactory for PassthroughMitm {
    type Service = PassthroughSession;

    fn on_connect(&self, connection: &ConnectionInfo) -> Result<PassthroughSession, ServiceInitError> {
        if !connection.intercepted {
            return Err(ServiceInitError::new("pass-through policy only serves intercepted sessions"));
        }
        self.stats.sessions.fetch_add(1, Ordering::Relaxed);
        if let Some(client) = connection.client {
            self.warm_up(client.program_id);
        }
        Ok(PassthroughSession {
            stats: Arc::clone(&self.stats),
        })
    }

    fn should_mitm(&self, client: &ClientInfo) -> Result<bool, QueryError> {
        Ok(self.scope.covers(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mitm_core::ServiceName;
    use mitm_runtime::{BackgroundWorker, WorkerConfig};
    use std::thread;
    use std::time::{Duration, Instant};

    const APP: u64 = 0x0100_0000_0001_0000;
    const SYSTEM: u64 = 0x0100_0000_0000_1000;

    fn connection(program: u64, intercepted: bool) -> ConnectionInfo {
        ConnectionInfo {
            service: ServiceName::new("fsp-srv").unwrap(),
            client: Some(ClientInfo::new(7, program)),
            intercepted,
        }
    }

    #[test]
    fn test_scope() {
        let worker = BackgroundWorker::start(&WorkerConfig::new()).unwrap();
        let apps = PassthroughMitm::new(Scope::Applications, worker.handle());
        let all = PassthroughMitm::new(Scope::Everyone, worker.handle());
        assert!(apps.should_mitm(&ClientInfo::new(1, APP)).unwrap());
        assert!(!apps.should_mitm(&ClientInfo::new(1, SYSTEM)).unwrap());
        assert!(all.should_mitm(&ClientInfo::new(1, SYSTEM)).unwrap());
        worker.shutdown();
    }

    #[test]
    fn test_every_command_is_relayed() {
        let worker = BackgroundWorker::start(&WorkerConfig::new()).unwrap();
        let policy = PassthroughMitm::new(Scope::Everyone, worker.handle());
        let session = policy.on_connect(&connection(APP, true)).unwrap();
        for command in [0u32, 1, 200, 65000] {
            assert!(session.handler(CommandId(command)).is_some());
        }
        worker.shutdown();
    }

    #[test]
    fn test_direct_sessions_refused() {
        let worker = BackgroundWorker::start(&WorkerConfig::new()).unwrap();
        let policy = PassthroughMitm::new(Scope::Everyone, worker.handle());
        assert!(policy.on_connect(&connection(APP, false)).is_err());
        assert_eq!(policy.stats().snapshot().sessions, 0);
        worker.shutdown();
    }

    #[test]
    fn test_warm_up_once_per_program() {
        let worker = BackgroundWorker::start(&WorkerConfig::new()).unwrap();
        let policy = PassthroughMitm::new(Scope::Everyone, worker.handle());
        for _ in 0..3 {
            policy.on_connect(&connection(APP, true)).unwrap();
        }
        policy.on_connect(&connection(APP + 1, true)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while policy.stats().snapshot().programs < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let stats = worker.shutdown();
        let snapshot = policy.stats().snapshot();
        assert_eq!(snapshot.sessions, 4);
        assert_eq!(snapshot.programs, 2);
        assert!(stats.executed >= 2);
    }

    #[test]
    fn test_closed_worker_does_not_refuse() {
        let worker = BackgroundWorker::start(&WorkerConfig::new()).unwrap();
        let policy = PassthroughMitm::new(Scope::Everyone, worker.handle());
        worker.shutdown();
        assert!(policy.on_connect(&connection(APP, true)).is_ok());
    }
}
