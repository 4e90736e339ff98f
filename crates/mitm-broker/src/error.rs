//! Session-open errors

use std::fmt;
use std::io;

use mitm_core::{NameError, ResultCode, ServiceName};

#[derive(Debug)]
pub enum ConnectError {
    NotRegistered(ServiceName),
    InvalidName(NameError),
    /// Every session slot of the port is taken.
    OutOfSessions(ServiceName),
    /// The serving side closed its port.
    PortClosed(ServiceName),
    BrokerClosed,
    /// `wait_for_service` gave up.
    TimedOut(ServiceName),
    Os(io::Error),
}

impl ConnectError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::NotRegistered(_) => ResultCode::SM_NOT_REGISTERED,
            Self::InvalidName(_) => ResultCode::SM_INVALID_SERVICE_NAME,
            Self::TimedOut(_) => ResultCode::KERNEL_TIMED_OUT,
            Self::OutOfSessions(_) | Self::PortClosed(_) | Self::BrokerClosed | Self::Os(_) => {
                ResultCode::KERNEL_SESSION_CLOSED
            }
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRegistered(name) => write!(f, "{} is not registered", name),
            Self::InvalidName(e) => write!(f, "{}", e),
            Self::OutOfSessions(name) => write!(f, "{} has no free sessions", name),
            Self::PortClosed(name) => write!(f, "{} port is closed", name),
            Self::BrokerClosed => write!(f, "service broker is closed"),
            Self::TimedOut(name) => write!(f, "timed out waiting for {}", name),
            Self::Os(e) => write!(f, "session allocation failed: {}", e),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidName(e) => Some(e),
            Self::Os(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NameError> for ConnectError {
    fn from(e: NameError) -> Self {
        Self::InvalidName(e)
    }
}
