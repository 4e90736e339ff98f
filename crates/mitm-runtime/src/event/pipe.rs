//! Self-pipe backend for platforms without eventfd.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::{pipe, read, write};

pub(super) struct PipeBackend {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl PipeBackend {
    pub(super) fn new() -> Result<Self, Errno> {
        let (rx, tx) = pipe()?;
        for fd in [&rx, &tx] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        }
        Ok(Self { rx, tx })
    }

    pub(super) fn signal(&self) -> Result<(), Errno> {
        match write(&self.tx, &[1u8]) {
            Ok(_) => Ok(()),
            // Pipe full: already signaled.
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(super) fn clear(&self) -> Result<(), Errno> {
        let mut buf = [0u8; 64];
        loop {
            match read(self.rx.as_raw_fd(), &mut buf) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl AsFd for PipeBackend {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.rx.as_fd()
    }
}
