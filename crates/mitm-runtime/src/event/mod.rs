//! Level-triggered readiness event
//!
//! An `Event` is a pollable fd that stays readable from `signal()` until
//! `clear()`. Several signals before a clear coalesce into one wakeup.
//! The manager uses one to interrupt its waiter when the set changes;
//! ports use one to report a queued connection.

use std::os::fd::{AsFd, BorrowedFd};

use nix::errno::Errno;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod eventfd;
        use eventfd::EventFdBackend as Backend;
    } else {
        mod pipe;
        use pipe::PipeBackend as Backend;
    }
}

pub struct Event {
    backend: Backend,
}

impl Event {
    pub fn new() -> Result<Self, Errno> {
        Ok(Self {
            backend: Backend::new()?,
        })
    }

    /// Make the fd readable. Idempotent until the next `clear`.
    #[inline]
    pub fn signal(&self) -> Result<(), Errno> {
        self.backend.signal()
    }

    /// Reset to non-readable.
    #[inline]
    pub fn clear(&self) -> Result<(), Errno> {
        self.backend.clear()
    }
}

impl AsFd for Event {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.backend.as_fd()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use std::os::fd::AsRawFd;
        f.debug_struct("Event")
            .field("fd", &self.as_fd().as_raw_fd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    fn readable(event: &Event) -> bool {
        let mut fds = [PollFd::new(event.as_fd(), PollFlags::POLLIN)];
        let n = poll(&mut fds, PollTimeout::ZERO).unwrap();
        n == 1 && fds[0].revents().unwrap().contains(PollFlags::POLLIN)
    }

    #[test]
    fn test_signal_then_clear() {
        let event = Event::new().unwrap();
        assert!(!readable(&event));

        event.signal().unwrap();
        assert!(readable(&event));
        // Stays readable until cleared.
        assert!(readable(&event));

        event.clear().unwrap();
        assert!(!readable(&event));
    }

    #[test]
    fn test_signals_coalesce() {
        let event = Event::new().unwrap();
        for _ in 0..100 {
            event.signal().unwrap();
        }
        event.clear().unwrap();
        assert!(!readable(&event));
        // Clearing an idle event is harmless.
        event.clear().unwrap();
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let event = std::sync::Arc::new(Event::new().unwrap());
        let e2 = event.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            e2.signal().unwrap();
        });
        let mut fds = [PollFd::new(event.as_fd(), PollFlags::POLLIN)];
        let n = poll(&mut fds, PollTimeout::from(2000u16)).unwrap();
        assert_eq!(n, 1);
        t.join().unwrap();
    }
}
