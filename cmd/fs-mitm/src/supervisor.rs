//! Process bring-up.
//!
//! [`Supervisor::start`] performs the startup sequence up to the point
//! where the manager can take over; [`Running::run`] blocks in the manager
//! and then tears everything down in order:
//!
//! 1. verify mandatory dependencies (broker, base filesystem, `fsp-srv`,
//!    host release)
//! 2. create the manager and start the background worker
//! 3. storage and input initialisers (detached, optional)
//! 4. `fsp-srv` interception, installed directly
//! 5. `set:sys` interception, deferred until `set:sys` exists (fatal)
//! 6. (caller) signal watcher
//! 7. process, stop the worker, join bring-up, report

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mitm_broker::{ConnectError, ServiceManager};
use mitm_core::env::{env_get, env_get_ms};
use mitm_core::{kdebug, kinfo, ServiceFactory, RegistrationError};
use mitm_runtime::{
    BackgroundWorker, BringUp, BringUpError, BringUpReport, ConfigError, Criticality,
    ManagerConfig, ManagerError, ManagerHandle, ManagerStats, Ownership, TaskError,
    WaitableManager, WorkerConfig, WorkerStats,
};
use mitm_server::{MitmRegistration, RegistrationState, RegistrationStatus};

use crate::services::{PassthroughMitm, Scope, TrafficSnapshot, TrafficStats};

pub const FS_SERVICE: &str = "fsp-srv";
pub const SETSYS_SERVICE: &str = "set:sys";

pub mod defaults {
    /// Longest wait for a service the daemon depends on.
    pub const DEPENDENCY_TIMEOUT_MS: u64 = 30_000;
    pub const FS_SESSIONS: u32 = 61;
    pub const SETSYS_SESSIONS: u32 = 60;
    /// Slice between shutdown checks while waiting for a dependency.
    pub const DEPENDENCY_POLL_MS: u64 = 50;
}

/// One-shot bring-up of a collaborating subsystem.
pub trait Initializer: Send + Sync {
    fn name(&self) -> &str;
    fn initialize(&self) -> Result<(), TaskError>;
}

/// Release of the host system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostVersion {
    pub major: u8,
    pub minor: u8,
    pub micro: u8,
}

impl HostVersion {
    pub const fn new(major: u8, minor: u8, micro: u8) -> Self {
        Self { major, minor, micro }
    }
}

impl fmt::Display for HostVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

/// The only host release this build talks to.
pub const SUPPORTED_HOST: HostVersion = HostVersion::new(0, 7, 1);

/// Reports which host release is running.
pub trait HostInfo: Send + Sync {
    fn host_version(&self) -> Result<HostVersion, TaskError>;
}

pub struct Collaborators {
    /// Mandatory; failure aborts startup.
    pub base_fs: Arc<dyn Initializer>,
    pub storage: Arc<dyn Initializer>,
    pub input: Arc<dyn Initializer>,
    /// Mandatory; a release other than [`SUPPORTED_HOST`] aborts startup.
    pub host: Arc<dyn HostInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub dependency_timeout: Duration,
    pub fs_sessions: u32,
    pub setsys_sessions: u32,
    pub manager: ManagerConfig,
    pub worker: WorkerConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SupervisorConfig {
    /// - `MITM_DEPENDENCY_TIMEOUT_MS`
    /// - `MITM_FS_SESSIONS`
    /// - `MITM_SETSYS_SESSIONS`
    ///
    /// plus the manager and worker variables.
    pub fn from_env() -> Self {
        Self {
            dependency_timeout: env_get_ms(
                "MITM_DEPENDENCY_TIMEOUT_MS",
                Duration::from_millis(defaults::DEPENDENCY_TIMEOUT_MS),
            ),
            fs_sessions: env_get("MITM_FS_SESSIONS", defaults::FS_SESSIONS),
            setsys_sessions: env_get("MITM_SETSYS_SESSIONS", defaults::SETSYS_SESSIONS),
            manager: ManagerConfig::from_env(),
            worker: WorkerConfig::from_env(),
        }
    }

    pub fn new() -> Self {
        Self {
            dependency_timeout: Duration::from_millis(defaults::DEPENDENCY_TIMEOUT_MS),
            fs_sessions: defaults::FS_SESSIONS,
            setsys_sessions: defaults::SETSYS_SESSIONS,
            manager: ManagerConfig::new(),
            worker: WorkerConfig::new(),
        }
    }

    pub fn dependency_timeout(mut self, d: Duration) -> Self {
        self.dependency_timeout = d;
        self
    }

    pub fn manager(mut self, config: ManagerConfig) -> Self {
        self.manager = config;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dependency_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("dependency_timeout must be > 0"));
        }
        if self.fs_sessions == 0 || self.setsys_sessions == 0 {
            return Err(ConfigError::InvalidValue("session counts must be > 0"));
        }
        self.manager.validate()?;
        self.worker.validate()
    }

    pub fn print(&self) {
        eprintln!("Supervisor configuration:");
        eprintln!("  dependency_timeout:  {:?}", self.dependency_timeout);
        eprintln!("  fs_sessions:         {}", self.fs_sessions);
        eprintln!("  setsys_sessions:     {}", self.setsys_sessions);
        self.manager.print();
        self.worker.print();
    }
}

#[derive(Debug)]
pub enum FatalError {
    Config(ConfigError),
    Dependency { name: String, reason: String },
    Registration {
        service: &'static str,
        source: RegistrationError,
    },
    Manager(ManagerError),
    Spawn(io::Error),
    Signal(io::Error),
    BringUp(BringUpError),
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{}", e),
            Self::Dependency { name, reason } => {
                write!(f, "required dependency {} unavailable: {}", name, reason)
            }
            Self::Registration { service, source } => {
                write!(f, "cannot intercept {}: {}", service, source)
            }
            Self::Manager(e) => write!(f, "waitable manager failed: {}", e),
            Self::Spawn(e) => write!(f, "thread spawn failed: {}", e),
            Self::Signal(e) => write!(f, "cannot install signal handling: {}", e),
            Self::BringUp(e) => write!(f, "bring-up failed: {}", e),
        }
    }
}

impl std::error::Error for FatalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Registration { source, .. } => Some(source),
            Self::Manager(e) => Some(e),
            Self::Spawn(e) | Self::Signal(e) => Some(e),
            Self::BringUp(e) => Some(e),
            Self::Dependency { .. } => None,
        }
    }
}

impl From<ConfigError> for FatalError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<ManagerError> for FatalError {
    fn from(e: ManagerError) -> Self {
        Self::Manager(e)
    }
}

impl From<BringUpError> for FatalError {
    fn from(e: BringUpError) -> Self {
        Self::BringUp(e)
    }
}

fn registration(service: &'static str) -> impl FnOnce(RegistrationError) -> FatalError {
    move |source| FatalError::Registration { service, source }
}

/// What a clean run leaves behind.
#[derive(Debug)]
pub struct ExitReport {
    pub manager: ManagerStats,
    pub worker: WorkerStats,
    pub bringup: BringUpReport,
    pub fs: RegistrationState,
    pub setsys: RegistrationState,
    pub fs_traffic: TrafficSnapshot,
    pub setsys_traffic: TrafficSnapshot,
}

impl ExitReport {
    pub fn print(&self) {
        kinfo!(
            "manager: {} dispatches, {} closes, {} panics, peak {} waitables",
            self.manager.dispatches,
            self.manager.closes,
            self.manager.panics,
            self.manager.peak_waitables
        );
        kinfo!(
            "worker: {} tasks, {} panicked",
            self.worker.executed,
            self.worker.panicked
        );
        kinfo!(
            "bring-up: {} completed, {} failed, {} detached",
            self.bringup.completed.len(),
            self.bringup.failures.len(),
            self.bringup.detached
        );
        kinfo!("{}: {:?}, {}", FS_SERVICE, self.fs, self.fs_traffic);
        kinfo!("{}: {:?}, {}", SETSYS_SERVICE, self.setsys, self.setsys_traffic);
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    broker: ServiceManager,
    collaborators: Collaborators,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, broker: ServiceManager, collaborators: Collaborators) -> Self {
        Self {
            config,
            broker,
            collaborators,
        }
    }

    pub fn run(self) -> Result<ExitReport, FatalError> {
        self.start()?.run()
    }

    pub fn start(self) -> Result<Running, FatalError> {
        let Self {
            config,
            broker,
            collaborators,
        } = self;
        config.validate()?;

        verify_dependencies(&broker, &collaborators, config.dependency_timeout)?;

        let manager = WaitableManager::new(config.manager.clone())?;
        let worker = BackgroundWorker::start(&config.worker).map_err(FatalError::Spawn)?;

        let shutdown = manager.handle();
        let mut bringup = BringUp::new(config.worker.stack_size)
            .on_fatal(Arc::new(move |_| shutdown.request_shutdown()));

        for init in [&collaborators.storage, &collaborators.input] {
            let init = Arc::clone(init);
            let name = init.name().to_string();
            bringup.spawn(&name, Ownership::Detached, Criticality::Optional, move || {
                init.initialize()
            })?;
        }

        let fs_policy = PassthroughMitm::new(Scope::Applications, worker.handle());
        let fs_traffic = fs_policy.stats();
        let mut fs = MitmRegistration::new(FS_SERVICE, config.fs_sessions, Arc::new(fs_policy))
            .map_err(registration(FS_SERVICE))?;
        fs.register(&broker).map_err(registration(FS_SERVICE))?;
        let fs_status = fs
            .install(&manager.handle())
            .map_err(registration(FS_SERVICE))?;
        kinfo!("intercepting {} ({} sessions)", FS_SERVICE, config.fs_sessions);

        let setsys_policy = PassthroughMitm::new(Scope::Everyone, worker.handle());
        let setsys_traffic = setsys_policy.stats();
        let setsys = MitmRegistration::new(
            SETSYS_SERVICE,
            config.setsys_sessions,
            Arc::new(setsys_policy),
        )
        .map_err(registration(SETSYS_SERVICE))?;
        let setsys_status = setsys.status();
        {
            let broker = broker.clone();
            let manager = manager.handle();
            let timeout = config.dependency_timeout;
            bringup.spawn(SETSYS_SERVICE, Ownership::Joined, Criticality::Fatal, move || {
                register_when_available(setsys, &broker, &manager, timeout)
            })?;
        }

        Ok(Running {
            manager,
            worker,
            bringup,
            fs_status,
            setsys_status,
            fs_traffic,
            setsys_traffic,
        })
    }
}

fn verify_dependencies(
    broker: &ServiceManager,
    collaborators: &Collaborators,
    timeout: Duration,
) -> Result<(), FatalError> {
    if !broker.is_open() {
        return Err(FatalError::Dependency {
            name: "sm".into(),
            reason: "service broker is closed".into(),
        });
    }
    let base_fs = &collaborators.base_fs;
    base_fs.initialize().map_err(|e| FatalError::Dependency {
        name: base_fs.name().to_string(),
        reason: e.to_string(),
    })?;
    broker
        .wait_for_service(FS_SERVICE, timeout)
        .map_err(|e| FatalError::Dependency {
            name: FS_SERVICE.into(),
            reason: e.to_string(),
        })?;
    check_host_version(collaborators.host.as_ref())?;
    kdebug!("dependencies verified");
    Ok(())
}

fn check_host_version(host: &dyn HostInfo) -> Result<(), FatalError> {
    let unusable = |reason: String| FatalError::Dependency {
        name: "host-version".into(),
        reason,
    };
    let running = host.host_version().map_err(|e| unusable(e.to_string()))?;
    if running != SUPPORTED_HOST {
        return Err(unusable(format!(
            "host runs {}, this build supports {}",
            running, SUPPORTED_HOST
        )));
    }
    kdebug!("host release {}", running);
    Ok(())
}

/// Wait for the real service, then intercept it.
///
/// Waits in short slices so a shutdown requested meanwhile ends the wait
/// without an error.
fn register_when_available<F: ServiceFactory>(
    mut registration: MitmRegistration<F>,
    broker: &ServiceManager,
    manager: &ManagerHandle,
    timeout: Duration,
) -> Result<(), TaskError> {
    let name = registration.name();
    let sessions = registration.max_sessions();
    let deadline = Instant::now() + timeout;
    let slice = Duration::from_millis(defaults::DEPENDENCY_POLL_MS);
    loop {
        if manager.is_shutdown() {
            kinfo!("shutdown before {} appeared, not intercepting it", name);
            return Ok(());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(format!("{} did not appear within {:?}", name, timeout).into());
        }
        match broker.wait_for_service(name.as_str(), remaining.min(slice)) {
            Ok(()) => break,
            Err(ConnectError::TimedOut(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    registration.register(broker)?;
    registration.install(manager)?;
    kinfo!("intercepting {} ({} sessions)", name, sessions);
    Ok(())
}

/// A started supervisor, ready to hand its thread to the manager.
pub struct Running {
    manager: WaitableManager,
    worker: BackgroundWorker,
    bringup: BringUp,
    fs_status: RegistrationStatus,
    setsys_status: RegistrationStatus,
    fs_traffic: Arc<TrafficStats>,
    setsys_traffic: Arc<TrafficStats>,
}

impl Running {
    pub fn handle(&self) -> ManagerHandle {
        self.manager.handle()
    }

    pub fn fs_status(&self) -> RegistrationStatus {
        self.fs_status.clone()
    }

    pub fn setsys_status(&self) -> RegistrationStatus {
        self.setsys_status.clone()
    }

    /// Stop without serving, reporting what the cut-short run left.
    pub fn abort(self) -> Result<ExitReport, FatalError> {
        self.manager.request_shutdown();
        self.run()
    }

    pub fn run(self) -> Result<ExitReport, FatalError> {
        let processed = self.manager.process();
        let worker = self.worker.shutdown();
        let mut bringup = self.bringup.join();

        let manager = processed?;
        if let Some(i) = bringup.failures.iter().position(BringUpError::is_fatal) {
            return Err(FatalError::BringUp(bringup.failures.swap_remove(i)));
        }
        Ok(ExitReport {
            manager,
            worker,
            bringup,
            fs: self.fs_status.get(),
            setsys: self.setsys_status.get(),
            fs_traffic: self.fs_traffic.snapshot(),
            setsys_traffic: self.setsys_traffic.snapshot(),
        })
    }
}
