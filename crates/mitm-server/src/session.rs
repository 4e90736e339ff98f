//! One accepted connection bound to one `Service`.
//!
//! A readiness event takes in whatever the client has sent so far without
//! blocking, then serves every request that is now complete: look up the
//! handler, reply (or relay to the original service). A client that sends
//! half a frame only costs buffered bytes, never a manager thread.
//! Requests on a session are served strictly in order.

use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::sys::socket::{recv, MsgFlags};

use mitm_broker::{ForwardHandle, SessionGuard};
use mitm_core::message::{write_reply, Deadline};
use mitm_core::{
    kdebug, ktrace, kwarn, ConnectionInfo, Forward, FrameError, HandleOutcome, Reply, Request,
    RequestBuffer, RequestContext, Response, ResultCode, Service, TransportError, Waitable,
    WaitableKind, WaitableSink,
};

/// Longest a client may take to accept one whole reply.
pub(crate) const REPLY_TIMEOUT: Duration = Duration::from_secs(1);
/// Most bytes taken in per readiness event.
const READ_CHUNK: usize = 16 * 1024;

/// One nonblocking read into `inbound`. A readiness event with nothing to
/// read is not an error; end of stream is `PeerClosed`.
pub(crate) fn receive(stream: &UnixStream, inbound: &mut RequestBuffer) -> Result<(), TransportError> {
    let fd = stream.as_raw_fd();
    let got = inbound.fill_with(READ_CHUNK, |buf| {
        recv(fd, buf, MsgFlags::MSG_DONTWAIT).map_err(io::Error::from)
    });
    match got {
        Ok(0) => Err(TransportError::PeerClosed),
        Ok(_) => Ok(()),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub struct ServiceSession<S: Service> {
    stream: UnixStream,
    inbound: RequestBuffer,
    service: S,
    connection: ConnectionInfo,
    forward: Option<ForwardHandle>,
    _guard: SessionGuard,
    served: u64,
}

impl<S: Service> ServiceSession<S> {
    pub fn new(
        stream: UnixStream,
        service: S,
        connection: ConnectionInfo,
        forward: Option<ForwardHandle>,
        guard: SessionGuard,
    ) -> Self {
        Self {
            stream,
            inbound: RequestBuffer::new(),
            service,
            connection,
            forward,
            _guard: guard,
            served: 0,
        }
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    /// Take in what the client sent and serve each request it completes.
    /// `Err` means the session is finished.
    pub fn process_ready(&mut self) -> Result<(), TransportError> {
        let received = receive(&self.stream, &mut self.inbound);
        loop {
            let request = match self.inbound.next_request() {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(FrameError::Protocol(e)) => {
                    kwarn!("{}: rejecting request: {}", self.connection.service, e);
                    self.reply(&Reply::error(e.result_code()))?;
                    continue;
                }
                Err(FrameError::Transport(e)) => return Err(e),
            };
            ktrace!("{}: {}", self.connection.service, request.command);

            let reply = self.dispatch(&request)?;
            self.served += 1;
            self.reply(&reply)?;
        }
        received
    }

    fn reply(&mut self, reply: &Reply) -> Result<(), TransportError> {
        match write_reply(&mut Deadline::new(&self.stream, REPLY_TIMEOUT), reply) {
            Ok(()) => Ok(()),
            Err(FrameError::Protocol(e)) => {
                kwarn!("{}: reply not sendable: {}", self.connection.service, e);
                let fallback = Reply::error(e.result_code());
                Ok(write_reply(&mut Deadline::new(&self.stream, REPLY_TIMEOUT), &fallback)?)
            }
            Err(FrameError::Transport(e)) => Err(e),
        }
    }

    fn dispatch(&mut self, request: &Request) -> Result<Reply, TransportError> {
        let handler = match self.service.handler(request.command) {
            Some(handler) => handler,
            None if self.forward.is_some() => return self.relay(request),
            None => return Ok(Reply::error(ResultCode::SF_UNKNOWN_COMMAND_ID)),
        };

        let forwarder = self.forward.as_mut().map(|f| f as &mut dyn Forward);
        let mut ctx = RequestContext::new(request, &self.connection, forwarder);
        match handler(&mut self.service, &mut ctx) {
            Ok(Response::Reply(reply)) => Ok(reply),
            Ok(Response::Forward) => self.relay(request),
            Err(code) => Ok(Reply::error(code)),
        }
    }

    /// Relay verbatim. Losing the original service ends the session.
    fn relay(&mut self, request: &Request) -> Result<Reply, TransportError> {
        let result = match self.forward.as_mut() {
            Some(forward) => forward.forward(request),
            None => Err(TransportError::NotConnected),
        };
        match result {
            Ok(reply) => Ok(reply),
            Err(e) => {
                kwarn!("{}: forwarding {} failed: {}", self.connection.service, request.command, e);
                let closed = Reply::error(ResultCode::KERNEL_SESSION_CLOSED);
                let _ = write_reply(&mut Deadline::new(&self.stream, REPLY_TIMEOUT), &closed);
                Err(e)
            }
        }
    }
}

impl<S: Service> Waitable for ServiceSession<S> {
    fn kind(&self) -> WaitableKind {
        WaitableKind::Session
    }

    fn handle(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }

    fn handle_signaled(&mut self, _sink: &dyn WaitableSink) -> HandleOutcome {
        match self.process_ready() {
            Ok(()) => HandleOutcome::Continue,
            Err(TransportError::PeerClosed) => {
                kdebug!(
                    "{}: session closed by peer after {} requests",
                    self.connection.service,
                    self.served
                );
                HandleOutcome::Close
            }
            Err(e) => {
                kwarn!("{}: closing session: {}", self.connection.service, e);
                HandleOutcome::Close
            }
        }
    }

    fn describe(&self) -> String {
        match self.connection.client {
            Some(client) => format!("{} session ({})", self.connection.service, client),
            None => format!("{} session", self.connection.service),
        }
    }
}

impl<S: Service> fmt::Debug for ServiceSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceSession")
            .field("connection", &self.connection)
            .field("served", &self.served)
            .field("buffered", &self.inbound.len())
            .finish()
    }
}
