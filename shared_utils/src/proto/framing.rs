//! Stream framing protocol for the overlay server.
//!
//! Every message exchanged over a stream transport is wrapped in a frame so
//! that boundaries survive TCP segmentation and corruption is detected before
//! a payload reaches the control plane or the dispatcher.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+----------------+----------------+
//! |    Magic (1)   |  Version (1)   |    Type (1)    |   Flags (1)    |
//! +----------------+----------------+----------------+----------------+
//! |                        Length (4 bytes)                           |
//! +----------------+----------------+----------------+----------------+
//! |                        Payload (variable)                         |
//! +----------------+----------------+----------------+----------------+
//! |                        Checksum (4 bytes)                         |
//! +----------------+----------------+----------------+----------------+
//! ```
//!
//! - Magic: a fixed byte (0xC0) that marks the beginning of a frame
//! - Version: protocol version (currently 0x01)
//! - Type: data, control or keepalive
//! - Flags: reserved, always zero on send and ignored on receive
//! - Length: payload length in bytes (u32, big-endian)
//! - Checksum: CRC32 of header + payload (u32, big-endian)
//!
//! [`FrameCodec`] plugs into `tokio_util::codec::{FramedRead, FramedWrite}`.

use std::fmt;
use std::io::{self, Cursor};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use crc32fast::Hasher;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{error, trace};

const FRAME_MAGIC: u8 = 0xC0;
const FRAME_VERSION: u8 = 0x01;
const HEADER_SIZE: usize = 8; // Magic (1) + Version (1) + Type (1) + Flags (1) + Length (4)
const CHECKSUM_SIZE: usize = 4;
const MIN_FRAME_SIZE: usize = HEADER_SIZE + CHECKSUM_SIZE;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD_SIZE: usize = 65_535;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Invalid magic byte in frame header
    #[error("Invalid frame magic: expected 0x{expected:02X}, got 0x{actual:02X}")]
    InvalidMagic { expected: u8, actual: u8 },

    /// Unsupported protocol version
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Invalid frame type
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    /// Frame payload too large
    #[error("Frame payload too large: {size} bytes (max: {max} bytes)")]
    PayloadTooLarge { size: usize, max: usize },

    /// Checksum verification failed
    #[error("Checksum verification failed: expected 0x{expected:08X}, got 0x{actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Payload could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Frame type does not match its payload
    #[error("Unexpected frame: {0}")]
    Unexpected(String),

    /// I/O error during encoding/decoding
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Types of frames that can be sent/received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Tunnel traffic
    Data = 0x01,

    /// RPC requests and responses
    Control = 0x02,

    /// Empty frame keeping idle sessions alive
    Keepalive = 0x03,
}

impl FrameType {
    /// Convert a u8 to a FrameType
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x01 => Ok(FrameType::Data),
            0x02 => Ok(FrameType::Control),
            0x03 => Ok(FrameType::Keepalive),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }

    /// Convert a FrameType to a u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// A single frame on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    /// The type of frame
    pub frame_type: FrameType,

    /// The payload data
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame, rejecting oversized payloads.
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            error!(
                size = payload.len(),
                max = MAX_PAYLOAD_SIZE,
                "Frame payload too large"
            );
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Frame {
            frame_type,
            payload,
        })
    }

    /// Create a new data frame with the given payload
    pub fn new_data(payload: Vec<u8>) -> Result<Self, FrameError> {
        Self::new(FrameType::Data, payload)
    }

    /// Create a new control frame with the given payload
    pub fn new_control(payload: Vec<u8>) -> Result<Self, FrameError> {
        Self::new(FrameType::Control, payload)
    }

    /// Create a new keepalive frame
    pub fn new_keepalive() -> Self {
        Frame {
            frame_type: FrameType::Keepalive,
            payload: Vec::new(),
        }
    }

    /// Calculate the total size of the frame when encoded
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len() + CHECKSUM_SIZE
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("type", &self.frame_type)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Codec turning a byte stream into [`Frame`]s and back.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < MIN_FRAME_SIZE {
            return Ok(None);
        }

        if src[0] != FRAME_MAGIC {
            return Err(FrameError::InvalidMagic {
                expected: FRAME_MAGIC,
                actual: src[0],
            });
        }

        if src[1] != FRAME_VERSION {
            return Err(FrameError::UnsupportedVersion(src[1]));
        }

        let frame_type = FrameType::from_u8(src[2])?;

        let payload_len = Cursor::new(&src[4..8]).read_u32::<BigEndian>()? as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let total_size = HEADER_SIZE + payload_len + CHECKSUM_SIZE;
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        let raw = src.split_to(total_size);

        let mut hasher = Hasher::new();
        hasher.update(&raw[..HEADER_SIZE + payload_len]);
        let calculated = hasher.finalize();
        let carried = Cursor::new(&raw[HEADER_SIZE + payload_len..]).read_u32::<BigEndian>()?;
        if calculated != carried {
            return Err(FrameError::ChecksumMismatch {
                expected: carried,
                actual: calculated,
            });
        }

        trace!(frame_type = ?frame_type, payload_len, "Frame decoded");

        Ok(Some(Frame {
            frame_type,
            payload: raw[HEADER_SIZE..HEADER_SIZE + payload_len].to_vec(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        dst.reserve(frame.size());
        let start = dst.len();

        dst.put_u8(FRAME_MAGIC);
        dst.put_u8(FRAME_VERSION);
        dst.put_u8(frame.frame_type.to_u8());
        dst.put_u8(0);
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);

        let mut hasher = Hasher::new();
        hasher.update(&dst[start..]);
        let checksum = hasher.finalize();
        dst.put_u32(checksum);

        trace!(
            frame_type = ?frame.frame_type,
            payload_len = frame.payload.len(),
            checksum = format!("0x{:08X}", checksum),
            "Frame encoded"
        );

        Ok(())
    }
}
