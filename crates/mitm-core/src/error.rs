//! Error taxonomy.
//!
//! | Error               | Scope                | Effect                              |
//! |---------------------|----------------------|-------------------------------------|
//! | `RegistrationError` | one registration     | that registration is not installed  |
//! | `ServiceInitError`  | one connection       | connection closed, no session       |
//! | `ProtocolError`     | one request          | error reply, session stays open     |
//! | `TransportError`    | one session          | session waitable destroyed          |
//! | `WorkerClosedError` | one enqueue          | returned to the late caller         |
//!
//! None of these escape the component that produced them.

use std::fmt;
use std::io;

use crate::id::ServiceName;
use crate::message::CommandId;
use crate::result::ResultCode;

/// Malformed service name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameError {
    Empty,
    TooLong(usize),
    InvalidByte(u8),
}

impl fmt::Display for NameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty service name"),
            Self::TooLong(n) => write!(
                f,
                "service name is {} bytes, limit is {}",
                n,
                ServiceName::MAX_LEN
            ),
            Self::InvalidByte(b) => write!(f, "invalid byte 0x{:02x} in service name", b),
        }
    }
}

impl std::error::Error for NameError {}

#[derive(Debug)]
pub enum RegistrationError {
    /// Another registration already intercepts this name.
    AlreadyIntercepted(ServiceName),
    /// A real service with this name is already registered.
    AlreadyRegistered(ServiceName),
    /// Interception requires the real service to exist.
    NotRegistered(ServiceName),
    /// The broker is gone or refuses requests.
    BrokerUnreachable,
    /// Session bound outside `1..=limit`.
    InvalidSessionCount { requested: u32, limit: u32 },
    InvalidName(NameError),
    /// The broker could not allocate an endpoint.
    Os(io::Error),
}

impl RegistrationError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::AlreadyIntercepted(_) | Self::AlreadyRegistered(_) => {
                ResultCode::SM_ALREADY_REGISTERED
            }
            Self::NotRegistered(_) => ResultCode::SM_NOT_REGISTERED,
            Self::InvalidName(_) => ResultCode::SM_INVALID_SERVICE_NAME,
            Self::BrokerUnreachable | Self::Os(_) => ResultCode::KERNEL_SESSION_CLOSED,
            Self::InvalidSessionCount { .. } => ResultCode::SF_INVALID_IN_HEADER,
        }
    }
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyIntercepted(name) => write!(f, "{} is already intercepted", name),
            Self::AlreadyRegistered(name) => write!(f, "{} is already registered", name),
            Self::NotRegistered(name) => write!(f, "{} is not registered", name),
            Self::BrokerUnreachable => write!(f, "service broker unreachable"),
            Self::InvalidSessionCount { requested, limit } => write!(
                f,
                "invalid max session count {} (must be 1..={})",
                requested, limit
            ),
            Self::InvalidName(e) => write!(f, "{}", e),
            Self::Os(e) => write!(f, "endpoint allocation failed: {}", e),
        }
    }
}

impl std::error::Error for RegistrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidName(e) => Some(e),
            Self::Os(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NameError> for RegistrationError {
    fn from(e: NameError) -> Self {
        Self::InvalidName(e)
    }
}

/// A `ServiceFactory` refused a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInitError {
    reason: String,
}

impl ServiceInitError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for ServiceInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service init failed: {}", self.reason)
    }
}

impl std::error::Error for ServiceInitError {}

/// Malformed or unserviceable request. Answered, not fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    InvalidHeader { magic: u32 },
    UnknownCommand(CommandId),
    PayloadTooLarge(usize),
    Malformed(&'static str),
}

impl ProtocolError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::UnknownCommand(_) => ResultCode::SF_UNKNOWN_COMMAND_ID,
            Self::InvalidHeader { .. } | Self::PayloadTooLarge(_) | Self::Malformed(_) => {
                ResultCode::SF_INVALID_IN_HEADER
            }
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHeader { magic } => write!(f, "invalid header magic 0x{:08x}", magic),
            Self::UnknownCommand(id) => write!(f, "unknown command {}", id),
            Self::PayloadTooLarge(n) => write!(f, "payload of {} bytes exceeds limit", n),
            Self::Malformed(what) => write!(f, "malformed request: {}", what),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// The session's stream is unusable.
#[derive(Debug)]
pub enum TransportError {
    /// Orderly or abrupt close by the peer.
    PeerClosed,
    /// No complete frame within the stream's timeout.
    TimedOut,
    /// Declared length exceeds the frame limit; the stream cannot resync.
    FrameTooLarge(usize),
    /// The peer answered with something that is not a reply frame.
    BadReply(ProtocolError),
    /// No forwarding session exists for this connection.
    NotConnected,
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed the session"),
            Self::TimedOut => write!(f, "session timed out"),
            Self::FrameTooLarge(n) => write!(f, "frame length {} exceeds limit", n),
            Self::BadReply(e) => write!(f, "bad reply: {}", e),
            Self::NotConnected => write!(f, "no forwarding session"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::BadReply(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => Self::PeerClosed,
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::TimedOut,
            _ => Self::Io(e),
        }
    }
}

/// Result of reading one frame: either the stream faulted or the frame
/// itself was bad.
#[derive(Debug)]
pub enum FrameError {
    Transport(TransportError),
    Protocol(ProtocolError),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{}", e),
            Self::Protocol(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<TransportError> for FrameError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<ProtocolError> for FrameError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        Self::Transport(e.into())
    }
}

impl From<FrameError> for TransportError {
    /// Client side view: a bad frame from a server is a broken transport.
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Transport(t) => t,
            FrameError::Protocol(p) => Self::BadReply(p),
        }
    }
}

/// The interception decision function failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryError {
    reason: String,
}

impl QueryError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interception decision failed: {}", self.reason)
    }
}

impl std::error::Error for QueryError {}

/// Enqueue attempted after the background worker began shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerClosedError;

impl fmt::Display for WorkerClosedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "background worker is shutting down")
    }
}

impl std::error::Error for WorkerClosedError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_mapping() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(TransportError::from(eof), TransportError::PeerClosed));

        let slow = io::Error::new(io::ErrorKind::WouldBlock, "slow");
        assert!(matches!(TransportError::from(slow), TransportError::TimedOut));

        let other = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(TransportError::from(other), TransportError::Io(_)));
    }

    #[test]
    fn test_protocol_codes() {
        assert_eq!(
            ProtocolError::UnknownCommand(CommandId(7)).result_code(),
            ResultCode::SF_UNKNOWN_COMMAND_ID
        );
        assert_eq!(
            ProtocolError::InvalidHeader { magic: 0 }.result_code(),
            ResultCode::SF_INVALID_IN_HEADER
        );
    }

    #[test]
    fn test_registration_display() {
        let name = ServiceName::new("fsp-srv").unwrap();
        let err = RegistrationError::AlreadyIntercepted(name);
        assert_eq!(err.to_string(), "fsp-srv is already intercepted");
        assert_eq!(err.result_code(), ResultCode::SM_ALREADY_REGISTERED);

        let err = RegistrationError::InvalidSessionCount { requested: 0, limit: 64 };
        assert!(err.to_string().contains("1..=64"));
    }
}
