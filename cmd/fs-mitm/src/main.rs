//! fs-mitm: filesystem and settings interception daemon
//!
//! Intercepts `fsp-srv` for application programs and, once it appears,
//! `set:sys` for everyone, relaying all traffic to the real services.
//! The rest of the system is simulated in-process (see `host`).
//!
//! Usage:
//!     cargo build --release -p fs-mitm
//!     MITM_LOG_LEVEL=debug ./target/release/fs-mitm
//!
//! Stop with Ctrl-C or SIGTERM. Tuning is through `MITM_*` environment
//! variables only.

mod host;
mod services;
mod signal;
mod supervisor;

use std::io;
use std::process::ExitCode;
use std::time::Duration;

use mitm_broker::{BrokerConfig, ServiceManager};
use mitm_core::kprint::{self, LogLevel};
use mitm_core::{kerror, kinfo, kwarn};

use host::HostSystem;
use supervisor::{ExitReport, FatalError, Supervisor, SupervisorConfig};

/// When the simulated `set:sys` comes up after start.
const SETSYS_DELAY: Duration = Duration::from_millis(250);

fn main() -> ExitCode {
    kprint::init();

    let config = SupervisorConfig::from_env();
    let broker_config = BrokerConfig::from_env();
    if let Err(e) = config.validate().and_then(|()| broker_config.validate()) {
        kerror!("fs-mitm: {}", e);
        return ExitCode::FAILURE;
    }
    if kprint::level_enabled(LogLevel::Debug) {
        config.print();
        broker_config.print();
    }

    let broker = ServiceManager::new(broker_config);
    let host = match HostSystem::start(&broker, Some(SETSYS_DELAY)) {
        Ok(host) => host,
        Err(e) => {
            kerror!("fs-mitm: host system: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let code = match run(config, broker.clone()) {
        Ok(report) => {
            report.print();
            ExitCode::SUCCESS
        }
        Err(e) => {
            kerror!("fs-mitm: {}", e);
            ExitCode::FAILURE
        }
    };

    host.stop();
    broker.close();
    kinfo!("fs-mitm: exited");
    code
}

fn run(config: SupervisorConfig, broker: ServiceManager) -> Result<ExitReport, FatalError> {
    let running = Supervisor::new(config, broker, host::collaborators()).start()?;

    let watcher = match signal::install()
        .map_err(io::Error::from)
        .and_then(|()| signal::spawn_watcher(running.handle()))
    {
        Ok(watcher) => watcher,
        Err(e) => {
            match running.abort() {
                Ok(report) => {
                    kwarn!("fs-mitm: stopped before serving");
                    report.print();
                }
                Err(aborted) => kwarn!("fs-mitm: aborted run also failed: {}", aborted),
            }
            return Err(FatalError::Signal(e));
        }
    };
    kinfo!(
        "fs-mitm: running ({}: {:?}, {}: {:?}), send SIGINT or SIGTERM to stop",
        supervisor::FS_SERVICE,
        running.fs_status().get(),
        supervisor::SETSYS_SERVICE,
        running.setsys_status().get()
    );

    let report = running.run();
    let _ = watcher.join();
    report
}
