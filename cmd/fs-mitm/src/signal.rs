//! SIGINT/SIGTERM → manager shutdown.
//!
//! The handler only sets a flag; a watcher thread turns it into a
//! shutdown request.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mitm_core::kinfo;
use mitm_runtime::ManagerHandle;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

const WATCH_INTERVAL: Duration = Duration::from_millis(50);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn install() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic.
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

pub fn requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Watch for the flag until the manager shuts down for any reason.
pub fn spawn_watcher(manager: ManagerHandle) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("signal-watch".into())
        .spawn(move || {
            while !manager.is_shutdown() {
                if requested() {
                    kinfo!("termination signal received, shutting down");
                    manager.request_shutdown();
                    break;
                }
                thread::sleep(WATCH_INTERVAL);
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mitm_runtime::{ManagerConfig, WaitableManager};

    #[test]
    fn test_sigterm_requests_shutdown() {
        let manager = WaitableManager::new(ManagerConfig::new().num_threads(1)).unwrap();
        let handle = manager.handle();
        install().unwrap();
        let watcher = spawn_watcher(handle.clone()).unwrap();

        nix::sys::signal::raise(Signal::SIGTERM).unwrap();
        watcher.join().unwrap();
        assert!(requested());
        assert!(handle.is_shutdown());
    }
}
