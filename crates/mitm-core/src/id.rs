//! Identifier types.

use std::fmt;

use crate::error::NameError;

/// Kernel process identifier of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// Program (title) identifier of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ProgramId(pub u64);

impl ProgramId {
    /// First program id in the application range. Everything below is a
    /// system module.
    pub const APPLICATION_START: Self = Self(0x0100_0000_0001_0000);

    #[inline]
    pub fn is_application(self) -> bool {
        self >= Self::APPLICATION_START
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identity the broker hands to a query endpoint for a connecting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientInfo {
    pub process_id: ProcessId,
    pub program_id: ProgramId,
}

impl ClientInfo {
    pub const fn new(process_id: u64, program_id: u64) -> Self {
        Self {
            process_id: ProcessId(process_id),
            program_id: ProgramId(program_id),
        }
    }
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.process_id, self.program_id)
    }
}

/// Identity of a waitable inside one manager. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct WaitableId(pub u64);

impl fmt::Display for WaitableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w#{}", self.0)
    }
}

/// A registered service name ("fsp-srv", "set:sys").
///
/// Stored inline: names are at most [`ServiceName::MAX_LEN`] printable
/// ASCII bytes, the same bound the console's service manager uses.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceName {
    bytes: [u8; ServiceName::MAX_LEN],
    len: u8,
}

impl ServiceName {
    pub const MAX_LEN: usize = 8;

    pub fn new(name: &str) -> Result<Self, NameError> {
        let raw = name.as_bytes();
        if raw.is_empty() {
            return Err(NameError::Empty);
        }
        if raw.len() > Self::MAX_LEN {
            return Err(NameError::TooLong(raw.len()));
        }
        if let Some(&bad) = raw.iter().find(|b| !b.is_ascii_graphic()) {
            return Err(NameError::InvalidByte(bad));
        }
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self {
            bytes,
            len: raw.len() as u8,
        })
    }

    pub fn as_str(&self) -> &str {
        // Constructor only admits printable ASCII.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceName({:?})", self.as_str())
    }
}

impl std::str::FromStr for ServiceName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_name_roundtrip() {
        let name = ServiceName::new("set:sys").unwrap();
        assert_eq!(name.as_str(), "set:sys");
        assert_eq!(name.to_string(), "set:sys");
        assert_eq!(name, "set:sys".parse().unwrap());
    }

    #[test]
    fn test_service_name_bounds() {
        assert_eq!(ServiceName::new(""), Err(NameError::Empty));
        assert_eq!(ServiceName::new("fsp-srv1"), Ok(ServiceName::new("fsp-srv1").unwrap()));
        assert_eq!(ServiceName::new("fsp-srv12"), Err(NameError::TooLong(9)));
        assert_eq!(ServiceName::new("a b"), Err(NameError::InvalidByte(b' ')));
    }

    #[test]
    fn test_program_range() {
        assert!(!ProgramId(0x0100_0000_0000_0032).is_application());
        assert!(ProgramId(0x0100_0000_0001_0000).is_application());
        assert!(ProgramId(0x0100_5D60_0000_0000).is_application());
    }
}
