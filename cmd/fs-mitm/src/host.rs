//! Simulated rest of the system.
//!
//! Serves the real `fsp-srv` right away and `set:sys` after a delay, on a
//! manager of its own, and supplies stub bring-up collaborators and the
//! host release.

use std::fmt;
use std::marker::PhantomData;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mitm_broker::ServiceManager;
use mitm_core::{
    kdebug, kinfo, kwarn, CommandId, ConnectionInfo, Handler, HandlerResult, RequestContext,
    Response, Service, ServiceFactory, ServiceInitError,
};
use mitm_runtime::{ManagerConfig, ManagerError, ManagerHandle, TaskError, WaitableManager};
use mitm_server::ServiceServer;

use crate::supervisor::{
    Collaborators, FatalError, HostInfo, HostVersion, Initializer, FS_SERVICE, SETSYS_SERVICE,
    SUPPORTED_HOST,
};

pub const FIRMWARE_VERSION: &[u8] = b"19.0.0";

pub mod command {
    pub const FS_OPEN: u32 = 1;
    pub const FS_SIZE: u32 = 2;
    pub const SETSYS_FIRMWARE_VERSION: u32 = 3;
}

#[derive(Default)]
pub struct FileSystem;

impl FileSystem {
    fn open(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        let mut out = b"fs:".to_vec();
        out.extend_from_slice(ctx.payload());
        Ok(Response::ok(out))
    }

    fn size(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        Ok(Response::ok((ctx.payload().len() as u64).to_le_bytes().to_vec()))
    }
}

impl Service for FileSystem {
    fn handler(&self, command: CommandId) -> Option<Handler<Self>> {
        match command.0 {
            command::FS_OPEN => Some(Self::open),
            command::FS_SIZE => Some(Self::size),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct Settings;

impl Settings {
    fn firmware_version(&mut self, _ctx: &mut RequestContext<'_>) -> HandlerResult {
        Ok(Response::ok(FIRMWARE_VERSION.to_vec()))
    }
}

impl Service for Settings {
    fn handler(&self, command: CommandId) -> Option<Handler<Self>> {
        match command.0 {
            command::SETSYS_FIRMWARE_VERSION => Some(Self::firmware_version),
            _ => None,
        }
    }
}

/// Factory for services without per-connection state.
pub struct Stateless<S>(PhantomData<fn() -> S>);

impl<S> Stateless<S> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(PhantomData))
    }
}

impl<S: Service + Default> ServiceFactory for Stateless<S> {
    type Service = S;

    fn on_connect(&self, _connection: &ConnectionInfo) -> Result<S, ServiceInitError> {
        Ok(S::default())
    }
}

pub struct HostSystem {
    manager: ManagerHandle,
    runner: Option<JoinHandle<Result<(), ManagerError>>>,
    delayed: Option<(Sender<()>, JoinHandle<()>)>,
}

impl HostSystem {
    /// Start serving. `settings_delay` of `None` never registers `set:sys`.
    pub fn start(broker: &ServiceManager, settings_delay: Option<Duration>) -> Result<Self, FatalError> {
        let manager = WaitableManager::new(
            ManagerConfig::new()
                .num_threads(2)
                .wait_timeout(Some(Duration::from_millis(50))),
        )?;
        let sessions = broker.config().max_sessions;
        let fs = ServiceServer::register(broker, FS_SERVICE, sessions, Stateless::<FileSystem>::new())
            .map_err(|source| FatalError::Registration {
                service: FS_SERVICE,
                source,
            })?;
        manager.add(Box::new(fs));

        let handle = manager.handle();
        let delayed = match settings_delay {
            Some(delay) => Some(spawn_delayed_settings(broker.clone(), handle.clone(), delay)?),
            None => None,
        };

        let runner = thread::Builder::new()
            .name("host-system".into())
            .spawn(move || manager.process().map(|_| ()))
            .map_err(FatalError::Spawn)?;
        kinfo!("host system serving {}", FS_SERVICE);

        Ok(Self {
            manager: handle,
            runner: Some(runner),
            delayed,
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some((cancel, thread)) = self.delayed.take() {
            drop(cancel);
            let _ = thread.join();
        }
        self.manager.request_shutdown();
        if let Some(runner) = self.runner.take() {
            match runner.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => kwarn!("host system stopped with error: {}", e),
                Err(_) => kwarn!("host system thread panicked"),
            }
        }
    }
}

impl Drop for HostSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for HostSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSystem")
            .field("live", &self.manager.live_count())
            .finish()
    }
}

fn spawn_delayed_settings(
    broker: ServiceManager,
    manager: ManagerHandle,
    delay: Duration,
) -> Result<(Sender<()>, JoinHandle<()>), FatalError> {
    let (cancel, cancelled) = mpsc::channel::<()>();
    let thread = thread::Builder::new()
        .name("host-setsys".into())
        .spawn(move || {
            if !matches!(cancelled.recv_timeout(delay), Err(RecvTimeoutError::Timeout)) {
                kdebug!("{} registration cancelled", SETSYS_SERVICE);
                return;
            }
            let sessions = broker.config().max_sessions;
            match ServiceServer::register(&broker, SETSYS_SERVICE, sessions, Stateless::<Settings>::new()) {
                Ok(server) => {
                    manager.add(Box::new(server));
                    kinfo!("host system serving {}", SETSYS_SERVICE);
                }
                Err(e) => kwarn!("host system cannot serve {}: {}", SETSYS_SERVICE, e),
            }
        })
        .map_err(FatalError::Spawn)?;
    Ok((cancel, thread))
}

/// Bring-up collaborator that sleeps, then succeeds or fails.
pub struct StubInit {
    name: &'static str,
    delay: Duration,
    failure: Option<&'static str>,
}

impl StubInit {
    pub fn ok(name: &'static str, delay: Duration) -> Arc<dyn Initializer> {
        Arc::new(Self {
            name,
            delay,
            failure: None,
        })
    }

    #[cfg(test)]
    pub fn failing(name: &'static str, reason: &'static str) -> Arc<dyn Initializer> {
        Arc::new(Self {
            name,
            delay: Duration::ZERO,
            failure: Some(reason),
        })
    }
}

impl Initializer for StubInit {
    fn name(&self) -> &str {
        self.name
    }

    fn initialize(&self) -> Result<(), TaskError> {
        thread::sleep(self.delay);
        match self.failure {
            Some(reason) => Err(reason.into()),
            None => {
                kdebug!("{} initialised", self.name);
                Ok(())
            }
        }
    }
}

/// Host that always reports the same release, or always fails to.
pub struct FixedHost(Result<HostVersion, &'static str>);

impl FixedHost {
    pub fn running(version: HostVersion) -> Arc<dyn HostInfo> {
        Arc::new(Self(Ok(version)))
    }

    #[cfg(test)]
    pub fn unreadable(reason: &'static str) -> Arc<dyn HostInfo> {
        Arc::new(Self(Err(reason)))
    }
}

impl HostInfo for FixedHost {
    fn host_version(&self) -> Result<HostVersion, TaskError> {
        self.0.map_err(TaskError::from)
    }
}

pub fn collaborators() -> Collaborators {
    Collaborators {
        base_fs: StubInit::ok("base-fs", Duration::ZERO),
        storage: StubInit::ok("storage", Duration::from_millis(20)),
        input: StubInit::ok("input", Duration::from_millis(10)),
        host: FixedHost::running(SUPPORTED_HOST),
    }
}
