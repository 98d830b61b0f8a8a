//! Plugin Wire Protocol v1
//!
//! Wire format for Sentinel <-> remote plugin communication.
//!
//! # Wire Format
//!
//! Every message is a 16-byte big-endian header frame followed by a payload frame:
//! ```text
//! [VER:1][OP:1][RES:2][CORRELATION:8][LEN:4]
//! ```
//!
//! - VER (u8): Wire version (0x01)
//! - OP (u8): OpCode
//! - RES (u16): Reserved for future use
//! - CORRELATION (u64): Request correlation id, echoed in the reply
//! - LEN (u32): Payload length in bytes
//!
//! Payloads are JSON documents (see [`types`]).

pub mod defaults;
pub mod error;
pub mod naming;
pub mod transport;
pub mod types;

pub use error::{ProtocolError, Result};
pub use types::{
    domain_types, AckPayload, BootstrapRequest, CollectErrorKind, ErrorPayload, HeartbeatPayload,
    InvokeOutcome, InvokeRequest, PluginRegistration, RemoteFailure, SubTaskDescriptor,
    SubTaskStatus, TaskInfo, UnregisterPayload, PLUGIN_PROTOCOL_VERSION,
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Wire version carried in every header
pub const WIRE_VERSION: u8 = 0x01;

/// Encoded header length
pub const HEADER_LEN: usize = 16;

/// Plugin protocol OpCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Unknown = 0,

    // Plugin -> Sentinel (Handshake)
    Register = 1, // "I am plugin X at endpoint E. My subtasks are [A, B, C]."

    // Plugin -> Sentinel (Shutdown)
    Unregister = 2, // "Remove my dispatch entries."

    // Plugin -> Sentinel (Keep-alive)
    Heartbeat = 3, // "Still alive."

    // Sentinel -> Plugin (Command)
    Invoke = 4, // "Run subtask S with this task context."

    // Plugin -> Sentinel (Completion)
    Conclude = 5, // "Subtask finished. Here is the outcome."

    // Bidirectional
    Err = 6, // "Request refused: code + message."

    // Sentinel -> Launcher (Reverse handshake)
    Bootstrap = 7, // "I am listening on port P, register with me."

    // Generic acknowledgment
    Ack = 8,
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(raw: u8) -> Result<Self> {
        let op = match raw {
            0 => OpCode::Unknown,
            1 => OpCode::Register,
            2 => OpCode::Unregister,
            3 => OpCode::Heartbeat,
            4 => OpCode::Invoke,
            5 => OpCode::Conclude,
            6 => OpCode::Err,
            7 => OpCode::Bootstrap,
            8 => OpCode::Ack,
            other => return Err(ProtocolError::InvalidOpCode(other)),
        };
        Ok(op)
    }
}

/// Fixed-size frame preceding every payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub opcode: OpCode,
    pub reserved: u16,
    pub correlation_id: u64,
    pub payload_len: u32,
}

impl Header {
    pub fn new(opcode: OpCode, correlation_id: u64, payload_len: u32) -> Self {
        Self {
            version: WIRE_VERSION,
            opcode,
            reserved: 0,
            correlation_id,
            payload_len,
        }
    }

    /// Big-endian encoding, always [`HEADER_LEN`] bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.write_u8(self.version)?;
        out.write_u8(self.opcode as u8)?;
        out.write_u16::<BigEndian>(self.reserved)?;
        out.write_u64::<BigEndian>(self.correlation_id)?;
        out.write_u32::<BigEndian>(self.payload_len)?;
        Ok(out)
    }

    /// Decode the first [`HEADER_LEN`] bytes; trailing bytes are ignored.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_LEN {
            return Err(ProtocolError::HeaderTooShort {
                expected: HEADER_LEN,
                got: frame.len(),
            });
        }
        let mut rd = &frame[..HEADER_LEN];

        let version = rd.read_u8()?;
        if version != WIRE_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: WIRE_VERSION,
                got: version,
            });
        }
        let opcode = OpCode::try_from(rd.read_u8()?)?;

        Ok(Self {
            version,
            opcode,
            reserved: rd.read_u16::<BigEndian>()?,
            correlation_id: rd.read_u64::<BigEndian>()?,
            payload_len: rd.read_u32::<BigEndian>()?,
        })
    }
}

/// One protocol message: header plus JSON payload
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Message {
    /// Fails when the payload does not fit the header's u32 length field.
    pub fn new(opcode: OpCode, correlation_id: u64, payload: Vec<u8>) -> Result<Self> {
        let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;
        Ok(Self {
            header: Header::new(opcode, correlation_id, len),
            payload,
        })
    }

    pub fn json<T: Serialize>(opcode: OpCode, correlation_id: u64, payload: &T) -> Result<Self> {
        Self::new(opcode, correlation_id, serde_json::to_vec(payload)?)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    /// `(header frame, payload frame)`
    pub fn pack(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        Ok((self.header.encode()?, self.payload.clone()))
    }

    /// Rebuild from exactly two frames, checking the declared length.
    pub fn unpack(frames: &[Vec<u8>]) -> Result<Self> {
        let [header, payload] = frames else {
            return Err(ProtocolError::InvalidFrameCount {
                expected: 2,
                got: frames.len(),
            });
        };
        let header = Header::decode(header)?;
        if payload.len() != header.payload_len as usize {
            return Err(ProtocolError::PayloadLengthMismatch {
                expected: header.payload_len as usize,
                got: payload.len(),
            });
        }
        Ok(Self {
            header,
            payload: payload.clone(),
        })
    }

    /// `Err` reply carrying an [`ErrorPayload`]
    pub fn error(correlation_id: u64, code: &str, message: impl Into<String>) -> Result<Self> {
        Self::json(OpCode::Err, correlation_id, &ErrorPayload::new(code, message))
    }
}
