//! Wire format encoding and decoding.
//!
//! Implements the 16-byte frame header:
//! ```text
//! ┌────────┬────────┬────────┬──────────┬──────────┬───────────┬─────────┬──────────┐
//! │ Magic  │ Frame  │ Stream │ Total    │ Envelope │ Stream /  │ Version │ Reserved │
//! │        │ type   │ frame  │ length   │ length   │ Req ID    │         │          │
//! │ 2 bytes│ 1 byte │ 1 byte │ 4 bytes  │ 2 bytes  │ 4 bytes   │ 1 byte  │ 1 byte   │
//! └────────┴────────┴────────┴──────────┴──────────┴───────────┴─────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. A frame on the wire is the header
//! followed by `[envelope][body][attachment]`.

use super::FrameError;

/// Header size in bytes (fixed, exactly 16).
pub const HEADER_SIZE: usize = 16;

/// Magic number identifying the protocol.
pub const MAGIC: u16 = 0x0930;

/// Default maximum frame size (10 MiB), header included.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Protocol version 0 (legacy peers).
pub const PROTOCOL_VERSION_0: u8 = 0;

/// Protocol version 1.
pub const PROTOCOL_VERSION_1: u8 = 1;

/// Version stamped on frames we originate.
pub const DEFAULT_PROTOCOL_VERSION: u8 = PROTOCOL_VERSION_1;

/// Top-level frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Unary request or response.
    Unary = 0,
    /// Streaming sub-protocol frame.
    Stream = 1,
}

impl FrameType {
    /// Parse from the wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameType::Unary),
            1 => Some(FrameType::Stream),
            _ => None,
        }
    }
}

/// Stream sub-frame type. Meaningful only when the frame type is `Stream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamFrameType {
    /// Not a stream frame.
    None = 0,
    /// Stream negotiation.
    Init = 1,
    /// Payload.
    Data = 2,
    /// Window increment.
    Feedback = 3,
    /// Graceful close or reset.
    Close = 4,
}

impl StreamFrameType {
    /// Parse from the wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(StreamFrameType::None),
            1 => Some(StreamFrameType::Init),
            2 => Some(StreamFrameType::Data),
            3 => Some(StreamFrameType::Feedback),
            4 => Some(StreamFrameType::Close),
            _ => None,
        }
    }
}

/// Decoded frame header.
///
/// `frame_type` and `stream_frame_type` are kept as raw bytes so that an
/// unknown value survives decoding and can be rejected by the codec that
/// understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type byte (see [`FrameType`]).
    pub frame_type: u8,
    /// Stream frame type byte (see [`StreamFrameType`]).
    pub stream_frame_type: u8,
    /// Total frame length, header included.
    pub total_len: u32,
    /// Length of the serialized envelope.
    pub header_len: u16,
    /// Request ID (unary) or stream ID (stream).
    pub stream_id: u32,
    /// Protocol version.
    pub version: u8,
    /// Reserved byte, always 0 on frames we build.
    pub reserved: u8,
}

impl Default for FrameHeader {
    fn default() -> Self {
        Self::unary(0)
    }
}

impl FrameHeader {
    /// Header for a unary frame with the default version.
    pub fn unary(request_id: u32) -> Self {
        Self {
            frame_type: FrameType::Unary as u8,
            stream_frame_type: StreamFrameType::None as u8,
            total_len: 0,
            header_len: 0,
            stream_id: request_id,
            version: DEFAULT_PROTOCOL_VERSION,
            reserved: 0,
        }
    }

    /// Header for a stream frame with the default version.
    pub fn stream(stream_frame_type: StreamFrameType, stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::Stream as u8,
            stream_frame_type: stream_frame_type as u8,
            total_len: 0,
            header_len: 0,
            stream_id,
            version: DEFAULT_PROTOCOL_VERSION,
            reserved: 0,
        }
    }

    /// Header for a reply to `inbound`.
    ///
    /// Echoes the inbound version and ID so that older peers can match the
    /// reply. Lengths are left at zero for `construct` to fill in.
    pub fn reply_to(inbound: &FrameHeader) -> Self {
        Self {
            frame_type: inbound.frame_type,
            stream_frame_type: inbound.stream_frame_type,
            total_len: 0,
            header_len: 0,
            stream_id: inbound.stream_id,
            version: inbound.version,
            reserved: 0,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use rpcwire::protocol::{FrameHeader, HEADER_SIZE};
    ///
    /// let header = FrameHeader::unary(42);
    /// assert_eq!(header.encode().len(), HEADER_SIZE);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (16 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..2].copy_from_slice(&MAGIC.to_be_bytes());
        buf[2] = self.frame_type;
        buf[3] = self.stream_frame_type;
        buf[4..8].copy_from_slice(&self.total_len.to_be_bytes());
        buf[8..10].copy_from_slice(&self.header_len.to_be_bytes());
        buf[10..14].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[14] = self.version;
        buf[15] = self.reserved;
    }

    /// Extract a header from the first 16 bytes of `buf`.
    ///
    /// The magic number is not checked here; the framer rejects foreign
    /// traffic before a header is ever extracted.
    pub fn extract(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }
        Ok(Self {
            frame_type: buf[2],
            stream_frame_type: buf[3],
            total_len: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            header_len: u16::from_be_bytes([buf[8], buf[9]]),
            stream_id: u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]),
            version: buf[14],
            reserved: buf[15],
        })
    }

    /// Read the magic number from a raw header.
    #[inline]
    pub fn magic_of(buf: &[u8]) -> Option<u16> {
        (buf.len() >= 2).then(|| u16::from_be_bytes([buf[0], buf[1]]))
    }

    /// Check if this is a unary frame.
    #[inline]
    pub fn is_unary(&self) -> bool {
        self.frame_type == FrameType::Unary as u8
    }

    /// Check if this is a stream frame.
    #[inline]
    pub fn is_stream(&self) -> bool {
        self.frame_type == FrameType::Stream as u8
    }

    /// Typed stream frame type, `None` if the byte is unknown.
    #[inline]
    pub fn stream_frame(&self) -> Option<StreamFrameType> {
        StreamFrameType::from_u8(self.stream_frame_type)
    }
}
