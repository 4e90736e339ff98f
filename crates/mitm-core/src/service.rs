//! Pluggable service capability set.
//!
//! A redirection policy plugs into the core through two traits:
//!
//! - [`ServiceFactory`] lives as long as its registration. It answers the
//!   broker's interception query and builds one [`Service`] per accepted
//!   connection. State shared by all sessions of a policy (caches, counters)
//!   belongs here and must be `Sync`: sessions are dispatched on different
//!   worker threads at the same time and the core holds no lock around them.
//! - [`Service`] is per-connection state plus a handler table keyed by
//!   command id.
//!
//! Intercepted sessions also carry a [`Forward`] capability that relays a
//! request to the original service and returns its reply untouched.

use crate::error::{QueryError, ServiceInitError, TransportError};
use crate::id::{ClientInfo, ServiceName};
use crate::message::{CommandId, Reply, Request};
use crate::result::ResultCode;

/// What a handler asks the session to send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Reply(Reply),
    /// Relay the request verbatim to the original service.
    Forward,
}

impl Response {
    pub fn ok(payload: impl Into<Vec<u8>>) -> Self {
        Self::Reply(Reply::ok(payload))
    }
}

/// `Err` becomes an error reply carrying that result code.
pub type HandlerResult = Result<Response, ResultCode>;

pub type Handler<S> = fn(&mut S, &mut RequestContext<'_>) -> HandlerResult;

/// Relay to the original, non-intercepted service.
pub trait Forward: Send {
    fn forward(&mut self, request: &Request) -> Result<Reply, TransportError>;
}

/// Facts about one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub service: ServiceName,
    /// Broker-supplied identity of the connecting process.
    pub client: Option<ClientInfo>,
    /// Accepted on a MitM main endpoint.
    pub intercepted: bool,
}

/// Everything a handler can see for one request.
pub struct RequestContext<'a> {
    request: &'a Request,
    connection: &'a ConnectionInfo,
    forwarder: Option<&'a mut dyn Forward>,
}

impl<'a> RequestContext<'a> {
    pub fn new(
        request: &'a Request,
        connection: &'a ConnectionInfo,
        forwarder: Option<&'a mut dyn Forward>,
    ) -> Self {
        Self {
            request,
            connection,
            forwarder,
        }
    }

    #[inline]
    pub fn command(&self) -> CommandId {
        self.request.command
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.request.payload
    }

    #[inline]
    pub fn request(&self) -> &Request {
        self.request
    }

    #[inline]
    pub fn connection(&self) -> &ConnectionInfo {
        self.connection
    }

    #[inline]
    pub fn can_forward(&self) -> bool {
        self.forwarder.is_some()
    }

    /// Send `request` (usually a rewritten copy of the current one) to the
    /// original service.
    pub fn forward(&mut self, request: &Request) -> Result<Reply, TransportError> {
        match self.forwarder.as_mut() {
            Some(forwarder) => forwarder.forward(request),
            None => Err(TransportError::NotConnected),
        }
    }
}

pub trait Service: Sized + Send + 'static {
    /// Handler for `command`, if this service implements it.
    ///
    /// Commands without a handler are forwarded on intercepted sessions
    /// and answered with `SF_UNKNOWN_COMMAND_ID` otherwise.
    fn handler(&self, command: CommandId) -> Option<Handler<Self>>;
}

pub trait ServiceFactory: Send + Sync + 'static {
    type Service: Service;

    /// Build the per-connection service. An error closes the connection.
    fn on_connect(&self, connection: &ConnectionInfo) -> Result<Self::Service, ServiceInitError>;

    /// Interception decision for a process opening the service.
    /// Intercepts everything unless overridden.
    fn should_mitm(&self, client: &ClientInfo) -> Result<bool, QueryError> {
        let _ = client;
        Ok(true)
    }
}
