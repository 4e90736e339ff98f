//! Named port: a bounded queue of incoming sessions.
//!
//! The broker pushes one [`PendingSession`] per client open; the serving
//! side polls [`Port::as_fd`] and calls [`Port::accept`]. The readiness fd
//! is readable while the queue is non-empty: push and accept
//! update both under the queue lock.
//!
//! Closing a port leaves its fd readable for good so a listener polling
//! it notices and retires.
//!
//! Session slots are counted from `reserve` until the server drops the
//! session's [`SessionGuard`], so `max_sessions` bounds queued plus live
//! sessions together.

use std::collections::VecDeque;
use std::fmt;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mitm_core::{kdebug, kwarn, ClientInfo, ServiceName};
use mitm_runtime::Event;
use nix::errno::Errno;

use crate::client::ForwardHandle;

struct PortInner {
    name: ServiceName,
    max_sessions: u32,
    queue: Mutex<VecDeque<PendingSession>>,
    closed: AtomicBool,
    active: AtomicU32,
    ready: Event,
}

impl PortInner {
    fn queue(&self) -> MutexGuard<'_, VecDeque<PendingSession>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds one session slot of a port.
pub struct SessionGuard {
    port: Arc<PortInner>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.port.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionGuard({})", self.port.name)
    }
}

/// A connection waiting to be accepted by the serving side.
pub struct PendingSession {
    pub stream: UnixStream,
    /// Identity of the process that opened the session.
    pub client: Option<ClientInfo>,
    /// Present on interception ports: session to the original service.
    pub forward: Option<ForwardHandle>,
    pub guard: SessionGuard,
}

#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl Port {
    pub fn new(name: ServiceName, max_sessions: u32) -> Result<Self, Errno> {
        Ok(Self {
            inner: Arc::new(PortInner {
                name,
                max_sessions,
                queue: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
                active: AtomicU32::new(0),
                ready: Event::new()?,
            }),
        })
    }

    pub fn name(&self) -> ServiceName {
        self.inner.name
    }

    pub fn max_sessions(&self) -> u32 {
        self.inner.max_sessions
    }

    /// Claim a session slot. `None` when full or closed.
    pub fn reserve(&self) -> Option<SessionGuard> {
        let inner = &self.inner;
        let mut current = inner.active.load(Ordering::SeqCst);
        loop {
            if inner.closed.load(Ordering::SeqCst) || current >= inner.max_sessions {
                return None;
            }
            match inner.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(SessionGuard {
                        port: Arc::clone(inner),
                    })
                }
                Err(seen) => current = seen,
            }
        }
    }

    /// Queue a session. Hands it back if the port is closed.
    pub fn push(&self, session: PendingSession) -> Result<(), PendingSession> {
        let mut queue = self.inner.queue();
        if self.is_closed() {
            return Err(session);
        }
        queue.push_back(session);
        if let Err(e) = self.inner.ready.signal() {
            kwarn!("{}: failed to signal port readiness: {}", self.inner.name, e);
        }
        Ok(())
    }

    pub fn accept(&self) -> Option<PendingSession> {
        let mut queue = self.inner.queue();
        let session = queue.pop_front();
        if queue.is_empty() && !self.is_closed() {
            if let Err(e) = self.inner.ready.clear() {
                kwarn!("{}: failed to clear port readiness: {}", self.inner.name, e);
            }
        }
        session
    }

    /// Refuse new sessions and drop queued ones. Idempotent.
    pub fn close(&self) {
        let dropped: Vec<PendingSession> = {
            let mut queue = self.inner.queue();
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            // Wake the serving side so it can retire its listener.
            if let Err(e) = self.inner.ready.signal() {
                kwarn!("{}: failed to signal port close: {}", self.inner.name, e);
            }
            queue.drain(..).collect()
        };
        kdebug!(
            "{}: port closed, {} queued sessions dropped",
            self.inner.name,
            dropped.len()
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Reserved slots: queued plus accepted and still alive.
    pub fn active_sessions(&self) -> u32 {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn same_port(&self, other: &Port) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl AsFd for Port {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.ready.as_fd()
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.inner.name)
            .field("active", &self.active_sessions())
            .field("max", &self.inner.max_sessions)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    fn port(max: u32) -> Port {
        Port::new(ServiceName::new("svc-a").unwrap(), max).unwrap()
    }

    fn pending(port: &Port) -> (PendingSession, UnixStream) {
        let guard = port.reserve().unwrap();
        let (ours, theirs) = UnixStream::pair().unwrap();
        let session = PendingSession {
            stream: ours,
            client: Some(ClientInfo::new(1, 1)),
            forward: None,
            guard,
        };
        (session, theirs)
    }

    fn readable(port: &Port) -> bool {
        let mut fds = [PollFd::new(port.as_fd(), PollFlags::POLLIN)];
        poll(&mut fds, PollTimeout::ZERO).unwrap() == 1
    }

    #[test]
    fn test_readiness_tracks_queue() {
        let port = port(4);
        assert!(!readable(&port));

        let (a, _pa) = pending(&port);
        let (b, _pb) = pending(&port);
        port.push(a).ok().unwrap();
        port.push(b).ok().unwrap();
        assert!(readable(&port));

        assert!(port.accept().is_some());
        assert!(readable(&port));
        assert!(port.accept().is_some());
        assert!(!readable(&port));
        assert!(port.accept().is_none());
    }

    #[test]
    fn test_session_limit() {
        let port = port(2);
        let g1 = port.reserve().unwrap();
        let _g2 = port.reserve().unwrap();
        assert!(port.reserve().is_none());
        assert_eq!(port.active_sessions(), 2);

        drop(g1);
        assert_eq!(port.active_sessions(), 1);
        assert!(port.reserve().is_some());
    }

    #[test]
    fn test_close_drops_queue() {
        let port = port(4);
        let (a, mut peer) = pending(&port);
        port.push(a).ok().unwrap();

        port.close();
        assert!(port.is_closed());
        assert!(port.reserve().is_none());
        assert_eq!(port.active_sessions(), 0);

        // The queued session's server half is gone.
        use std::io::Read;
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_push_after_close_returns_session() {
        let port = port(4);
        let (a, _peer) = pending(&port);
        port.close();
        assert!(port.push(a).is_err());
    }
}
