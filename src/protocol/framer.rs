//! Reading whole frames off a byte stream.
//!
//! The framer reads exactly one frame at a time:
//! - read the 16-byte header
//! - check the magic number
//! - check `16 <= total length <= max frame size`
//! - read the remaining `total length - 16` bytes
//!
//! There is no resynchronization. Any short read, foreign magic or bad
//! length is returned as an error and the caller is expected to drop the
//! connection.
//!
//! # Example
//!
//! ```ignore
//! use rpcwire::protocol::FrameParser;
//!
//! let mut parser = FrameParser::new(max_frame_size);
//! loop {
//!     let frame = parser.next_frame(&mut reader).await?;
//!     route(frame.stream_id(), frame);
//! }
//! ```

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::frame::{Frame, FrameError};
use super::wire_format::{FrameHeader, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE, MAGIC};
use crate::error::Result;

/// Read one complete frame from `reader`.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; HEADER_SIZE];
    reader.read_exact(&mut head).await?;

    let magic = u16::from_be_bytes([head[0], head[1]]);
    if magic != MAGIC {
        return Err(FrameError::BadMagic { found: magic }.into());
    }

    let header = FrameHeader::extract(&head)?;
    let total = header.total_len as usize;
    if total < HEADER_SIZE || total > max_frame_size {
        return Err(FrameError::LengthOutOfBounds {
            len: header.total_len,
            max: max_frame_size,
        }
        .into());
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.extend_from_slice(&head);
    buf.resize(total, 0);
    reader.read_exact(&mut buf[HEADER_SIZE..]).await?;

    Ok(Frame {
        header,
        data: buf.freeze(),
    })
}

/// Frame reader bound to a maximum frame size.
///
/// Used by connection-multiplexing transports: the returned [`Frame`] exposes
/// the request/stream ID from the header so the frame can be routed to its
/// logical call before any envelope is decoded.
#[derive(Debug, Clone, Copy)]
pub struct FrameParser {
    max_frame_size: usize,
}

impl FrameParser {
    /// Create a parser with a custom max frame size.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Maximum accepted frame size.
    #[inline]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Read the next frame.
    pub async fn next_frame<R>(&self, reader: &mut R) -> Result<Frame>
    where
        R: AsyncRead + Unpin,
    {
        read_frame(reader, self.max_frame_size).await
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}
