//! eventfd backend (Linux, Android)
//!
//! Counter semantics: any write makes the fd readable, one read resets it.

use std::os::fd::{AsFd, BorrowedFd};

use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};

pub(super) struct EventFdBackend {
    fd: EventFd,
}

impl EventFdBackend {
    pub(super) fn new() -> Result<Self, Errno> {
        let fd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        Ok(Self { fd })
    }

    pub(super) fn signal(&self) -> Result<(), Errno> {
        match self.fd.write(1) {
            Ok(_) => Ok(()),
            // Counter saturated: already signaled.
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(super) fn clear(&self) -> Result<(), Errno> {
        match self.fd.read() {
            Ok(_) => Ok(()),
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsFd for EventFdBackend {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
