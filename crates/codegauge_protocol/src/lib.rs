//! Broker wire protocol for Control Plane <-> Worker communication.
//!
//! # Protocol Specification
//!
//! Header Format (16 bytes, Network Byte Order / Big Endian):
//! ```text
//! [VER:1][OP:1][RES:2][JOB_ID:8][LEN:4]
//! ```
//!
//! - VER (u8): Protocol version (0x01)
//! - OP (u8): OpCode
//! - RES (u16): Reserved for future use
//! - JOB_ID (u64): Job ID
//! - LEN (u32): Payload length in bytes
//!
//! Payloads are JSON; a message travels as two frames `[header, payload]`.

pub mod error;
pub mod prediction;
pub mod schema;
pub mod types;

pub use error::{ProtocolError, Result};
pub use prediction::{FilePrediction, PredictionPackage};
pub use schema::{
    validate_params, HyperparameterSpec, ParamRange, ParamType, ParamValidationError,
    SearchSpaceParam, SuggestType,
};
pub use types::{
    format_error, truncate_error, AbortCommand, CapabilityDescriptor, ConfigMap, DatasetStatus,
    DispatchCommand, ErrorPayload, HeartbeatPayload, IdentifyPayload, IngestionStatus, JobId,
    JobKind, JobReceipt, JobStatus, ProgressPayload, TaskId, TaskState, XaiType, MAX_ERROR_LEN,
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Broker OpCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Unknown = 0,

    // Worker -> Control (Handshake)
    Identify = 1, // "I am here. I handle job kinds [A, B, C]."

    // Control -> Worker (Command)
    Dispatch = 2, // "Run job N."

    // Control -> Worker (Revoke)
    Abort = 3, // "Cancel task T."

    // Worker -> Control (Keep-alive)
    Heartbeat = 4, // "Still alive, working on task T."

    // Worker -> Control (Completion)
    Conclude = 5, // "Job finished. Here is the receipt."

    // Bidirectional (Error)
    Err = 6, // "Something went wrong."

    // Worker -> Control (Status channel)
    Progress = 7, // "Task T is at step K/N, P percent."
}

impl OpCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(OpCode::Unknown),
            1 => Ok(OpCode::Identify),
            2 => Ok(OpCode::Dispatch),
            3 => Ok(OpCode::Abort),
            4 => Ok(OpCode::Heartbeat),
            5 => Ok(OpCode::Conclude),
            6 => Ok(OpCode::Err),
            7 => Ok(OpCode::Progress),
            _ => Err(ProtocolError::InvalidOpCode(value)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Protocol header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub opcode: OpCode,
    pub reserved: u16,
    pub job_id: JobId,
    pub payload_len: u32,
}

impl Header {
    pub fn new(opcode: OpCode, job_id: JobId, payload_len: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            opcode,
            reserved: 0,
            job_id,
            payload_len,
        }
    }

    /// Pack header into a 16-byte buffer (big endian).
    pub fn pack(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);

        cursor.write_u8(self.version)?;
        cursor.write_u8(self.opcode.as_u8())?;
        cursor.write_u16::<BigEndian>(self.reserved)?;
        cursor.write_u64::<BigEndian>(self.job_id.as_u64())?;
        cursor.write_u32::<BigEndian>(self.payload_len)?;

        Ok(buf)
    }

    /// Unpack header from a 16-byte buffer.
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::HeaderTooShort {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }

        let mut cursor = Cursor::new(&data[..HEADER_SIZE]);

        let version = cursor.read_u8()?;
        let op_raw = cursor.read_u8()?;
        let reserved = cursor.read_u16::<BigEndian>()?;
        let job_id = JobId::new(cursor.read_u64::<BigEndian>()?);
        let payload_len = cursor.read_u32::<BigEndian>()?;

        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        let opcode = OpCode::from_u8(op_raw)?;

        Ok(Self {
            version,
            opcode,
            reserved,
            job_id,
            payload_len,
        })
    }
}

/// Protocol message (header + payload)
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Maximum payload size (max value of u32)
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

impl Message {
    pub fn new(opcode: OpCode, job_id: JobId, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let header = Header::new(opcode, job_id, payload.len() as u32);
        Ok(Self { header, payload })
    }

    /// Convenience constructor serializing a JSON payload.
    pub fn with_json<T: serde::Serialize>(
        opcode: OpCode,
        job_id: JobId,
        payload: &T,
    ) -> Result<Self> {
        Self::new(opcode, job_id, serde_json::to_vec(payload)?)
    }

    /// Deserialize the JSON payload.
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Pack message into ZMQ frames (header, payload)
    pub fn pack(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let header_bytes = self.header.pack()?.to_vec();
        Ok((header_bytes, self.payload.clone()))
    }

    /// Unpack message from ZMQ frames
    pub fn unpack(frames: &[Vec<u8>]) -> Result<Self> {
        if frames.len() < 2 {
            return Err(ProtocolError::InvalidFrameCount {
                expected: 2,
                got: frames.len(),
            });
        }

        let header = Header::unpack(&frames[0])?;
        let payload = frames[1].clone();

        if payload.len() != header.payload_len as usize {
            return Err(ProtocolError::PayloadLengthMismatch {
                expected: header.payload_len as usize,
                got: payload.len(),
            });
        }

        Ok(Self { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_pack_unpack() {
        let header = Header::new(OpCode::Dispatch, JobId::new(12345), 1024);
        let packed = header.pack().unwrap();

        assert_eq!(packed.len(), HEADER_SIZE);

        let unpacked = Header::unpack(&packed).unwrap();
        assert_eq!(unpacked.version, PROTOCOL_VERSION);
        assert_eq!(unpacked.opcode, OpCode::Dispatch);
        assert_eq!(unpacked.job_id, JobId::new(12345));
        assert_eq!(unpacked.payload_len, 1024);
    }

    #[test]
    fn test_header_roundtrip() {
        for opcode in [
            OpCode::Identify,
            OpCode::Dispatch,
            OpCode::Abort,
            OpCode::Heartbeat,
            OpCode::Conclude,
            OpCode::Progress,
        ] {
            let header = Header::new(opcode, JobId::new(9999), 512);
            let packed = header.pack().unwrap();
            let unpacked = Header::unpack(&packed).unwrap();
            assert_eq!(header, unpacked);
        }
    }

    #[test]
    fn test_version_mismatch() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = 0xFF;

        let result = Header::unpack(&buf);
        assert!(matches!(result, Err(ProtocolError::VersionMismatch { .. })));
    }

    #[test]
    fn test_header_too_short() {
        let buf = [0u8; 8];
        let result = Header::unpack(&buf);
        assert!(matches!(result, Err(ProtocolError::HeaderTooShort { .. })));
    }

    #[test]
    fn test_message_pack_unpack() {
        let identify = IdentifyPayload {
            worker_id: "ml-worker-1".to_string(),
            capabilities: vec![JobKind::Training, JobKind::Inference],
        };
        let msg = Message::with_json(OpCode::Identify, JobId::new(0), &identify).unwrap();
        let (header_bytes, payload_bytes) = msg.pack().unwrap();

        assert_eq!(header_bytes[0], PROTOCOL_VERSION);
        assert_eq!(header_bytes[1], OpCode::Identify.as_u8());

        let frames = vec![header_bytes, payload_bytes];
        let unpacked = Message::unpack(&frames).unwrap();
        assert_eq!(unpacked.header.opcode, OpCode::Identify);

        let parsed: IdentifyPayload = unpacked.parse_payload().unwrap();
        assert_eq!(parsed.worker_id, "ml-worker-1");
        assert_eq!(parsed.capabilities.len(), 2);
    }

    #[test]
    fn test_payload_length_mismatch() {
        let msg = Message::new(OpCode::Err, JobId::new(1), b"abc".to_vec()).unwrap();
        let (header, _) = msg.pack().unwrap();
        let result = Message::unpack(&[header, b"abcd".to_vec()]);
        assert!(matches!(
            result,
            Err(ProtocolError::PayloadLengthMismatch { .. })
        ));
    }
}
