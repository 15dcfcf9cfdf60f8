//! Wire protocol for the TCP front-end.
//!
//! ## Frame format
//!
//! Both directions use the same framing: a tag byte, a big-endian u32
//! payload length, then the payload.
//!
//! ```text
//! Request:  | cmd (1)    | len (4) | payload |
//! Response: | status (1) | len (4) | payload |
//! ```
//!
//! Request payloads carry a big-endian u32 key length, the key, and (for
//! SET) the value:
//!
//! ```text
//! GET / DEL:  | key_len (4) | key |
//! SET:        | key_len (4) | key | value |
//! PING:       (empty)
//! ```
//!
//! Responses carry the value on a GET hit, an error message on ERR, and
//! nothing otherwise.

use std::io::{Read, Write};

use eyre::{bail, ensure, Result};

pub const FRAME_HEADER_SIZE: usize = 5;

/// Upper bound on a frame payload; far above anything a page-bounded entry
/// can produce, so it only guards against garbage lengths.
pub const MAX_PAYLOAD_SIZE: usize = 1 << 20;

pub const CMD_GET: u8 = 0x01;
pub const CMD_SET: u8 = 0x02;
pub const CMD_DEL: u8 = 0x03;
pub const CMD_PING: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { key: Vec<u8> },
    Set { key: Vec<u8>, value: Vec<u8> },
    Del { key: Vec<u8> },
    Ping,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0x00,
    NotFound = 0x01,
    Err = 0x02,
}

impl Status {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(Status::Ok),
            0x01 => Ok(Status::NotFound),
            0x02 => Ok(Status::Err),
            other => bail!("unknown status byte 0x{:02x}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            payload: Vec::new(),
        }
    }

    pub fn value(payload: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            payload,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: Status::NotFound,
            payload: Vec::new(),
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            status: Status::Err,
            payload: message.as_bytes().to_vec(),
        }
    }
}

/// Reads one `(tag, payload)` frame. Returns `None` on a clean end of
/// stream before any header byte.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<(u8, Vec<u8>)>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];

    if reader.read(&mut header[..1])? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..])?;

    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    ensure!(
        len <= MAX_PAYLOAD_SIZE,
        "frame payload of {} bytes exceeds the {} byte limit",
        len,
        MAX_PAYLOAD_SIZE
    );

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some((header[0], payload)))
}

pub fn write_frame<W: Write>(writer: &mut W, tag: u8, payload: &[u8]) -> Result<()> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.push(tag);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

pub fn decode_command(tag: u8, payload: &[u8]) -> Result<Command> {
    match tag {
        CMD_GET => {
            let (key, rest) = split_keyed(payload)?;
            ensure!(rest.is_empty(), "GET carries trailing bytes");
            Ok(Command::Get { key })
        }
        CMD_SET => {
            let (key, rest) = split_keyed(payload)?;
            Ok(Command::Set {
                key,
                value: rest.to_vec(),
            })
        }
        CMD_DEL => {
            let (key, rest) = split_keyed(payload)?;
            ensure!(rest.is_empty(), "DEL carries trailing bytes");
            Ok(Command::Del { key })
        }
        CMD_PING => {
            ensure!(payload.is_empty(), "PING carries a payload");
            Ok(Command::Ping)
        }
        other => bail!("unknown command byte 0x{:02x}", other),
    }
}

pub fn encode_command(command: &Command) -> (u8, Vec<u8>) {
    match command {
        Command::Get { key } => (CMD_GET, keyed_payload(key, &[])),
        Command::Set { key, value } => (CMD_SET, keyed_payload(key, value)),
        Command::Del { key } => (CMD_DEL, keyed_payload(key, &[])),
        Command::Ping => (CMD_PING, Vec::new()),
    }
}

fn keyed_payload(key: &[u8], rest: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + key.len() + rest.len());
    payload.extend_from_slice(&(key.len() as u32).to_be_bytes());
    payload.extend_from_slice(key);
    payload.extend_from_slice(rest);
    payload
}

fn split_keyed(payload: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    ensure!(payload.len() >= 4, "frame too short for a key length");
    let key_len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    ensure!(
        payload.len() >= 4 + key_len,
        "frame declares a {} byte key but carries {}",
        key_len,
        payload.len() - 4
    );
    Ok((payload[4..4 + key_len].to_vec(), &payload[4 + key_len..]))
}
