//! Request and reply frames.
//!
//! Every frame is a fixed 16-byte little-endian header followed by the
//! payload:
//!
//! ```text
//! request:  "SFCI" | command_id u32 | payload_len u32 | reserved u32 | payload
//! reply:    "SFCO" | result     u32 | payload_len u32 | reserved u32 | payload
//! ```
//!
//! Servers never block on a partial frame: they collect whatever bytes
//! have arrived in a [`RequestBuffer`] and serve a request once it is
//! complete. Blocking readers and writers bound a whole frame with
//! [`Deadline`]. A header with the wrong magic but a sane length is
//! consumed whole and reported as a `ProtocolError`; a length above
//! [`MAX_PAYLOAD`] leaves the stream unrecoverable and is reported as a
//! `TransportError`.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use crate::error::{FrameError, ProtocolError, TransportError};
use crate::result::ResultCode;

pub const REQUEST_MAGIC: u32 = u32::from_le_bytes(*b"SFCI");
pub const REPLY_MAGIC: u32 = u32::from_le_bytes(*b"SFCO");
pub const HEADER_SIZE: usize = 16;
pub const MAX_PAYLOAD: usize = 0x8000;

/// Command identifier selecting a handler on a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CommandId(pub u32);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd {}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: CommandId,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(command: CommandId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub result: ResultCode,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn ok(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            result: ResultCode::SUCCESS,
            payload: payload.into(),
        }
    }

    pub fn error(result: ResultCode) -> Self {
        Self {
            result,
            payload: Vec::new(),
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    magic: u32,
    word: u32,
    len: u32,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.magic.to_le_bytes());
        raw[4..8].copy_from_slice(&self.word.to_le_bytes());
        raw[8..12].copy_from_slice(&self.len.to_le_bytes());
        raw
    }

    fn decode(raw: &[u8; HEADER_SIZE]) -> Self {
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        Self {
            magic: word(0),
            word: word(4),
            len: word(8),
        }
    }
}

fn write_frame<W: Write>(w: &mut W, header: Header, payload: &[u8]) -> Result<(), FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(payload.len()).into());
    }
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(payload);
    w.write_all(&frame)?;
    w.flush()?;
    Ok(())
}

fn read_frame<R: Read>(r: &mut R, magic: u32) -> Result<(u32, Vec<u8>), FrameError> {
    let mut raw = [0u8; HEADER_SIZE];
    r.read_exact(&mut raw)?;
    let header = Header::decode(&raw);

    let len = header.len as usize;
    if len > MAX_PAYLOAD {
        return Err(TransportError::FrameTooLarge(len).into());
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;

    if header.magic != magic {
        return Err(ProtocolError::InvalidHeader {
            magic: header.magic,
        }
        .into());
    }
    Ok((header.word, payload))
}

/// Bytes received on a session that do not form a whole request yet.
#[derive(Debug, Default)]
pub struct RequestBuffer {
    buf: Vec<u8>,
}

impl RequestBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffered bytes not yet consumed by [`next_request`](Self::next_request).
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append what `read` puts into a scratch area of up to `max` bytes.
    pub fn fill_with<F>(&mut self, max: usize, read: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        let start = self.buf.len();
        self.buf.resize(start + max, 0);
        let got = read(&mut self.buf[start..]);
        self.buf.truncate(start + got.as_ref().map_or(0, |n| (*n).min(max)));
        got
    }

    /// Take the next complete request, or `Ok(None)` while it is partial.
    pub fn next_request(&mut self) -> Result<Option<Request>, FrameError> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&self.buf[..HEADER_SIZE]);
        let header = Header::decode(&raw);

        let len = header.len as usize;
        if len > MAX_PAYLOAD {
            return Err(TransportError::FrameTooLarge(len).into());
        }
        let end = HEADER_SIZE + len;
        if self.buf.len() < end {
            return Ok(None);
        }
        let payload = self.buf[HEADER_SIZE..end].to_vec();
        self.buf.drain(..end);

        if header.magic != REQUEST_MAGIC {
            return Err(ProtocolError::InvalidHeader {
                magic: header.magic,
            }
            .into());
        }
        Ok(Some(Request {
            command: CommandId(header.word),
            payload,
        }))
    }
}

/// Blocking stream access where one whole frame shares a single deadline.
///
/// Each `read`/`write` gets only the time left, so a peer trickling bytes
/// cannot stretch a frame past the deadline.
pub struct Deadline<'a> {
    stream: &'a UnixStream,
    deadline: Instant,
}

impl<'a> Deadline<'a> {
    pub fn new(stream: &'a UnixStream, timeout: Duration) -> Self {
        Self {
            stream,
            deadline: Instant::now() + timeout,
        }
    }

    fn remaining(&self) -> io::Result<Duration> {
        let left = self.deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        Ok(left)
    }
}

impl Read for Deadline<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.set_read_timeout(Some(self.remaining()?))?;
        let mut stream = self.stream;
        stream.read(buf)
    }
}

impl Write for Deadline<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.set_write_timeout(Some(self.remaining()?))?;
        let mut stream = self.stream;
        stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn write_request<W: Write>(w: &mut W, request: &Request) -> Result<(), FrameError> {
    let header = Header {
        magic: REQUEST_MAGIC,
        word: request.command.0,
        len: request.payload.len() as u32,
    };
    write_frame(w, header, &request.payload)
}

pub fn read_request<R: Read>(r: &mut R) -> Result<Request, FrameError> {
    let (command, payload) = read_frame(r, REQUEST_MAGIC)?;
    Ok(Request {
        command: CommandId(command),
        payload,
    })
}

pub fn write_reply<W: Write>(w: &mut W, reply: &Reply) -> Result<(), FrameError> {
    let header = Header {
        magic: REPLY_MAGIC,
        word: reply.result.0,
        len: reply.payload.len() as u32,
    };
    write_frame(w, header, &reply.payload)
}

pub fn read_reply<R: Read>(r: &mut R) -> Result<Reply, FrameError> {
    let (result, payload) = read_frame(r, REPLY_MAGIC)?;
    Ok(Reply {
        result: ResultCode(result),
        payload,
    })
}
