//! Query endpoint of an interception registration.
//!
//! The broker asks `SHOULD_MITM` once per undecided process. The answer
//! comes from [`ServiceFactory::should_mitm`]; an error or a panic in it
//! answers "do not intercept".

use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use mitm_core::message::{write_reply, Deadline};
use mitm_core::query::{QueryReply, QueryRequest};
use mitm_core::{
    kdebug, kerror, kwarn, ClientInfo, FrameError, HandleOutcome, Reply, RequestBuffer,
    ServiceFactory, ServiceName, TransportError, Waitable, WaitableKind, WaitableSink,
};

use crate::session::{receive, REPLY_TIMEOUT};

pub struct MitmQuerySession<F: ServiceFactory> {
    stream: UnixStream,
    inbound: RequestBuffer,
    factory: Arc<F>,
    service: ServiceName,
}

impl<F: ServiceFactory> MitmQuerySession<F> {
    pub fn new(stream: UnixStream, factory: Arc<F>, service: ServiceName) -> Self {
        Self {
            stream,
            inbound: RequestBuffer::new(),
            factory,
            service,
        }
    }

    fn decide(&self, client: &ClientInfo) -> bool {
        match catch_unwind(AssertUnwindSafe(|| self.factory.should_mitm(client))) {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                kwarn!("{}: {} for {}, not intercepting", self.service, e, client);
                false
            }
            Err(_) => {
                kerror!("{}: interception decision panicked for {}", self.service, client);
                false
            }
        }
    }

    /// Answer every query received so far.
    fn answer_ready(&mut self) -> Result<(), TransportError> {
        let received = receive(&self.stream, &mut self.inbound);
        loop {
            let reply = match self.inbound.next_request() {
                Ok(Some(request)) => match QueryRequest::decode(&request) {
                    Ok(query) => {
                        let intercept = self.decide(&query.client);
                        kdebug!("{}: should_mitm({}) = {}", self.service, query.client, intercept);
                        QueryReply {
                            token: query.token,
                            intercept,
                        }
                        .encode()
                    }
                    Err(e) => Reply::error(e.result_code()),
                },
                Ok(None) => break,
                Err(FrameError::Protocol(e)) => Reply::error(e.result_code()),
                Err(FrameError::Transport(e)) => return Err(e),
            };
            write_reply(&mut Deadline::new(&self.stream, REPLY_TIMEOUT), &reply)?;
        }
        received
    }
}

impl<F: ServiceFactory> Waitable for MitmQuerySession<F> {
    fn kind(&self) -> WaitableKind {
        WaitableKind::Session
    }

    fn handle(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }

    fn handle_signaled(&mut self, _sink: &dyn WaitableSink) -> HandleOutcome {
        match self.answer_ready() {
            Ok(()) => HandleOutcome::Continue,
            Err(TransportError::PeerClosed) => {
                kdebug!("{}: broker closed the query session", self.service);
                HandleOutcome::Close
            }
            Err(e) => {
                kwarn!("{}: query session failed: {}", self.service, e);
                HandleOutcome::Close
            }
        }
    }

    fn describe(&self) -> String {
        format!("{} query", self.service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mitm_core::message::{read_reply, write_request};
    use mitm_core::{
        CommandId, ConnectionInfo, Handler, QueryError, Request, ResultCode, Service,
        ServiceInitError,
    };

    struct Nothing;

    impl Service for Nothing {
        fn handler(&self, _command: CommandId) -> Option<Handler<Self>> {
            None
        }
    }

    /// Intercepts application programs only; fails on process 0; panics on 13.
    struct Picky;

    impl ServiceFactory for Picky {
        type Service = Nothing;

        fn on_connect(&self, _c: &ConnectionInfo) -> Result<Nothing, ServiceInitError> {
            Ok(Nothing)
        }

        fn should_mitm(&self, client: &ClientInfo) -> Result<bool, QueryError> {
            match client.process_id.0 {
                0 => Err(QueryError::new("no such process")),
                13 => panic!("unlucky"),
                _ => Ok(client.program_id.is_application()),
            }
        }
    }

    struct NoSink;

    impl WaitableSink for NoSink {
        fn add(&self, _waitable: Box<dyn Waitable>) {}
    }

    fn ask(session: &mut MitmQuerySession<Picky>, broker: &mut UnixStream, pid: u64, program: u64) -> QueryReply {
        let query = QueryRequest {
            token: pid + 100,
            client: ClientInfo::new(pid, program),
        };
        write_request(broker, &query.encode()).unwrap();
        assert!(matches!(session.handle_signaled(&NoSink), HandleOutcome::Continue));
        let reply = QueryReply::decode(&read_reply(broker).unwrap()).unwrap();
        assert_eq!(reply.token, pid + 100);
        reply
    }

    fn session() -> (MitmQuerySession<Picky>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let name = ServiceName::new("fsp-srv").unwrap();
        (MitmQuerySession::new(ours, Arc::new(Picky), name), theirs)
    }

    #[test]
    fn test_policy_answers() {
        let (mut session, mut broker) = session();
        assert!(ask(&mut session, &mut broker, 5, 0x0100_0000_0001_0000).intercept);
        assert!(!ask(&mut session, &mut broker, 6, 0x0100_0000_0000_1000).intercept);
    }

    #[test]
    fn test_failures_answer_false() {
        let (mut session, mut broker) = session();
        assert!(!ask(&mut session, &mut broker, 0, 0x0100_0000_0001_0000).intercept);
        assert!(!ask(&mut session, &mut broker, 13, 0x0100_0000_0001_0000).intercept);
        // Still serving after the panic.
        assert!(ask(&mut session, &mut broker, 7, 0x0100_0000_0001_0000).intercept);
    }

    #[test]
    fn test_other_commands_rejected() {
        let (mut session, mut broker) = session();
        write_request(&mut broker, &Request::new(CommandId(1), Vec::new())).unwrap();
        assert!(matches!(session.handle_signaled(&NoSink), HandleOutcome::Continue));
        let reply = read_reply(&mut broker).unwrap();
        assert_eq!(reply.result, ResultCode::SF_UNKNOWN_COMMAND_ID);
    }

    #[test]
    fn test_broker_gone_closes() {
        let (mut session, broker) = session();
        drop(broker);
        assert!(matches!(session.handle_signaled(&NoSink), HandleOutcome::Close));
    }
}
