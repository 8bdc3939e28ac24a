//! Frame construction and the complete-frame wrapper.
//!
//! [`construct`] is the only place that writes a frame: it computes the total
//! length, checks every bound and lays out
//! `[header][envelope][body][attachment]` contiguously.
//!
//! # Example
//!
//! ```
//! use rpcwire::protocol::{construct, FrameHeader, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
//!
//! let frame = construct(&FrameHeader::unary(1), b"env", b"body", b"", DEFAULT_MAX_FRAME_SIZE)
//!     .unwrap();
//! assert_eq!(frame.len(), HEADER_SIZE + 3 + 4);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::wire_format::{FrameHeader, HEADER_SIZE, MAGIC};

/// Framing error.
///
/// The three `construct` overflow variants are distinct because the server
/// encoder recovers from each one differently.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Serialized envelope does not fit the 2-byte length field.
    #[error("envelope length {len} exceeds {max}", max = u16::MAX)]
    HeaderTooLarge {
        /// Envelope length.
        len: usize,
    },

    /// Frame is larger than the configured maximum.
    #[error("frame length {len} exceeds max frame size {max}")]
    FrameTooLarge {
        /// Total frame length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Total length does not fit the 4-byte length field.
    #[error("frame length {len} overflows u32")]
    LengthOverflow {
        /// Total frame length.
        len: usize,
    },

    /// Attachment does not fit the 4-byte attachment size field.
    #[error("attachment length {len} overflows u32")]
    AttachmentTooLarge {
        /// Attachment length.
        len: usize,
    },

    /// Magic number on the wire is not ours.
    #[error("magic {found:#06x} not match, expected {expected:#06x}", expected = MAGIC)]
    BadMagic {
        /// Magic read from the wire.
        found: u16,
    },

    /// Declared total length is outside `[16, max]`.
    #[error("total length {len} out of bounds [{min}, {max}]", min = HEADER_SIZE)]
    LengthOutOfBounds {
        /// Declared total length.
        len: u32,
        /// Configured maximum.
        max: usize,
    },

    /// Buffer is shorter than the structure being decoded.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        available: usize,
    },
}

impl FrameError {
    /// True for the envelope-length overflow.
    #[inline]
    pub fn is_header_overflow(&self) -> bool {
        matches!(self, FrameError::HeaderTooLarge { .. })
    }

    /// True for overflows of the total length (configured max or u32).
    #[inline]
    pub fn is_frame_overflow(&self) -> bool {
        matches!(
            self,
            FrameError::FrameTooLarge { .. } | FrameError::LengthOverflow { .. }
        )
    }
}

/// Build a complete frame.
///
/// `header` supplies type, ID and version; its length fields are ignored and
/// recomputed. The caller's header is not modified.
pub fn construct(
    header: &FrameHeader,
    envelope: &[u8],
    body: &[u8],
    attachment: &[u8],
    max_frame_size: usize,
) -> Result<Bytes, FrameError> {
    if envelope.len() > u16::MAX as usize {
        return Err(FrameError::HeaderTooLarge {
            len: envelope.len(),
        });
    }
    if attachment.len() > u32::MAX as usize {
        return Err(FrameError::AttachmentTooLarge {
            len: attachment.len(),
        });
    }

    let total = HEADER_SIZE + envelope.len() + body.len() + attachment.len();
    if total > max_frame_size {
        return Err(FrameError::FrameTooLarge {
            len: total,
            max: max_frame_size,
        });
    }
    if total > u32::MAX as usize {
        return Err(FrameError::LengthOverflow { len: total });
    }

    let mut head = *header;
    head.total_len = total as u32;
    head.header_len = envelope.len() as u16;

    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(&head.encode());
    buf.put_slice(envelope);
    buf.put_slice(body);
    buf.put_slice(attachment);
    Ok(buf.freeze())
}

/// A complete frame read off the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: FrameHeader,
    /// The whole frame, header included.
    pub data: Bytes,
}

impl Frame {
    /// Wrap raw frame bytes, extracting the header.
    pub fn from_bytes(data: Bytes) -> Result<Self, FrameError> {
        let header = FrameHeader::extract(&data)?;
        Ok(Self { header, data })
    }

    /// Request or stream ID.
    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.header.stream_id
    }

    /// Everything after the fixed header.
    #[inline]
    pub fn after_header(&self) -> Bytes {
        self.data.slice(HEADER_SIZE.min(self.data.len())..)
    }

    /// Total frame length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the frame holds no bytes at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{StreamFrameType, DEFAULT_MAX_FRAME_SIZE};

    #[test]
    fn test_construct_lays_out_parts() {
        let header = FrameHeader::stream(StreamFrameType::Data, 101);
        let frame = construct(&header, b"env", b"body", b"att", DEFAULT_MAX_FRAME_SIZE).unwrap();

        assert_eq!(frame.len(), HEADER_SIZE + 3 + 4 + 3);
        let parsed = FrameHeader::extract(&frame).unwrap();
        assert_eq!(parsed.total_len as usize, frame.len());
        assert_eq!(parsed.header_len, 3);
        assert_eq!(parsed.stream_id, 101);
        assert_eq!(&frame[HEADER_SIZE..HEADER_SIZE + 3], b"env");
        assert_eq!(&frame[HEADER_SIZE + 3..HEADER_SIZE + 7], b"body");
        assert_eq!(&frame[HEADER_SIZE + 7..], b"att");
    }

    #[test]
    fn test_construct_does_not_touch_caller_header() {
        let header = FrameHeader::unary(5);
        let _ = construct(&header, b"xx", b"yyyy", b"", DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(header.total_len, 0);
        assert_eq!(header.header_len, 0);
    }

    #[test]
    fn test_construct_header_too_large() {
        let envelope = vec![0u8; u16::MAX as usize + 1];
        let err = construct(&FrameHeader::unary(1), &envelope, b"", b"", usize::MAX).unwrap_err();
        assert!(err.is_header_overflow());
        assert!(!err.is_frame_overflow());
    }

    #[test]
    fn test_construct_envelope_at_limit_is_accepted() {
        let envelope = vec![0u8; u16::MAX as usize];
        let frame = construct(&FrameHeader::unary(1), &envelope, b"", b"", usize::MAX).unwrap();
        assert_eq!(FrameHeader::extract(&frame).unwrap().header_len, u16::MAX);
    }

    #[test]
    fn test_construct_frame_too_large() {
        let body = vec![0u8; 100];
        let err = construct(&FrameHeader::unary(1), b"", &body, b"", 64).unwrap_err();
        assert_eq!(err, FrameError::FrameTooLarge { len: 116, max: 64 });
        assert!(err.is_frame_overflow());
    }

    #[test]
    fn test_frame_wrapper() {
        let bytes = construct(
            &FrameHeader::stream(StreamFrameType::Data, 9),
            b"",
            b"payload",
            b"",
            DEFAULT_MAX_FRAME_SIZE,
        )
        .unwrap();
        let frame = Frame::from_bytes(bytes).unwrap();
        assert_eq!(frame.stream_id(), 9);
        assert_eq!(&frame.after_header()[..], b"payload");
        assert_eq!(frame.len(), HEADER_SIZE + 7);
    }

    #[test]
    fn test_bad_magic_message() {
        let err = FrameError::BadMagic { found: 0x1234 };
        let msg = err.to_string();
        assert!(msg.contains("magic"));
        assert!(msg.contains("not match"));
    }
}
