//! Interception query exchange between the broker and a query endpoint.
//!
//! The broker sends one `SHOULD_MITM` request per undecided client:
//!
//! ```text
//! request payload:  token u64 | process_id u64 | program_id u64
//! reply payload:    token u64 | decision u8
//! ```
//!
//! The token is echoed so the broker can drop an answer that arrives
//! after it already gave up waiting for it.

use crate::error::ProtocolError;
use crate::id::{ClientInfo, ProcessId, ProgramId};
use crate::message::{CommandId, Reply, Request};

pub const SHOULD_MITM: CommandId = CommandId(65000);

const REQUEST_LEN: usize = 24;
const REPLY_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryRequest {
    pub token: u64,
    pub client: ClientInfo,
}

impl QueryRequest {
    pub fn encode(&self) -> Request {
        let mut payload = Vec::with_capacity(REQUEST_LEN);
        payload.extend_from_slice(&self.token.to_le_bytes());
        payload.extend_from_slice(&self.client.process_id.0.to_le_bytes());
        payload.extend_from_slice(&self.client.program_id.0.to_le_bytes());
        Request::new(SHOULD_MITM, payload)
    }

    pub fn decode(request: &Request) -> Result<Self, ProtocolError> {
        if request.command != SHOULD_MITM {
            return Err(ProtocolError::UnknownCommand(request.command));
        }
        if request.payload.len() != REQUEST_LEN {
            return Err(ProtocolError::Malformed("query payload length"));
        }
        let p = &request.payload;
        Ok(Self {
            token: read_u64(&p[0..8]),
            client: ClientInfo {
                process_id: ProcessId(read_u64(&p[8..16])),
                program_id: ProgramId(read_u64(&p[16..24])),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryReply {
    pub token: u64,
    pub intercept: bool,
}

impl QueryReply {
    pub fn encode(&self) -> Reply {
        let mut payload = Vec::with_capacity(REPLY_LEN);
        payload.extend_from_slice(&self.token.to_le_bytes());
        payload.push(self.intercept as u8);
        Reply::ok(payload)
    }

    pub fn decode(reply: &Reply) -> Result<Self, ProtocolError> {
        if reply.payload.len() != REPLY_LEN {
            return Err(ProtocolError::Malformed("query reply length"));
        }
        Ok(Self {
            token: read_u64(&reply.payload[0..8]),
            intercept: reply.payload[8] != 0,
        })
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}
