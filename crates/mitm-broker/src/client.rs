//! Client side of a session.

use std::fmt;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use mitm_core::message::{read_reply, write_request, Deadline};
use mitm_core::{CommandId, Forward, Reply, Request, ServiceName, TransportError};

/// A connected session to a named service.
pub struct ServiceClient {
    stream: UnixStream,
    service: ServiceName,
    timeout: Option<Duration>,
}

impl ServiceClient {
    pub(crate) fn new(stream: UnixStream, service: ServiceName) -> Self {
        Self {
            stream,
            service,
            timeout: None,
        }
    }

    pub fn service(&self) -> ServiceName {
        self.service
    }

    pub fn request(
        &mut self,
        command: CommandId,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Reply, TransportError> {
        self.send(&Request::new(command, payload))
    }

    /// One request, one reply. Error replies are returned as `Ok`.
    pub fn send(&mut self, request: &Request) -> Result<Reply, TransportError> {
        match self.timeout {
            Some(timeout) => {
                let mut bounded = Deadline::new(&self.stream, timeout);
                write_request(&mut bounded, request)?;
                Ok(read_reply(&mut bounded)?)
            }
            None => {
                write_request(&mut self.stream, request)?;
                Ok(read_reply(&mut self.stream)?)
            }
        }
    }

    /// Bound each request/reply exchange as a whole. `None` blocks.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceClient({})", self.service)
    }
}

/// Session to the original service, handed to an intercepting server.
pub struct ForwardHandle {
    client: ServiceClient,
}

impl ForwardHandle {
    pub(crate) fn new(client: ServiceClient) -> Self {
        Self { client }
    }

    pub fn service(&self) -> ServiceName {
        self.client.service()
    }
}

impl Forward for ForwardHandle {
    fn forward(&mut self, request: &Request) -> Result<Reply, TransportError> {
        self.client.send(request)
    }
}

impl fmt::Debug for ForwardHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForwardHandle({})", self.client.service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mitm_core::message::{read_request, write_reply};
    use std::thread;

    #[test]
    fn test_request_reply() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let server = thread::spawn(move || {
            let req = read_request(&mut theirs).unwrap();
            write_reply(&mut theirs, &Reply::ok(req.payload)).unwrap();
        });
        let mut client = ServiceClient::new(ours, ServiceName::new("svc-a").unwrap());
        let reply = client.request(CommandId(1), b"ping".to_vec()).unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.payload, b"ping");
        server.join().unwrap();
    }

    #[test]
    fn test_forward_reports_closed_peer() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        drop(theirs);
        let client = ServiceClient::new(ours, ServiceName::new("svc-a").unwrap());
        let mut forward = ForwardHandle::new(client);
        let err = forward
            .forward(&Request::new(CommandId(1), Vec::new()))
            .unwrap_err();
        assert!(matches!(err, TransportError::PeerClosed));
    }

    #[test]
    fn test_silent_server_times_out() {
        let (ours, _silent) = UnixStream::pair().unwrap();
        let mut client = ServiceClient::new(ours, ServiceName::new("svc-a").unwrap());
        client.set_timeout(Some(Duration::from_millis(50)));
        let started = std::time::Instant::now();
        let err = client.request(CommandId(1), Vec::new()).unwrap_err();
        assert!(matches!(err, TransportError::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
