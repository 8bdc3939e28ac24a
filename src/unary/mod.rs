//! Unary codec - maps a call context onto request and response frames.
//!
//! A unary frame is `[header][envelope][body][attachment]`. The envelope is
//! mandatory and declares the attachment size, which is taken from the end
//! of the frame; everything between the envelope and the attachment is the
//! body.
//!
//! - [`ServerCodec`] decodes requests and encodes responses, downgrading
//!   oversized responses into a small error response.
//! - [`ClientCodec`] encodes requests with a fresh request ID and decodes
//!   responses, turning return codes into errors on the context.

mod client_codec;
mod server_codec;

pub use client_codec::{next_request_id, ClientCodec};
pub use server_codec::ServerCodec;

use bytes::Bytes;

use crate::error::{Result, RpcwireError};
use crate::protocol::{Frame, HEADER_SIZE};

/// Check a unary frame's lengths and return its envelope bytes.
pub(crate) fn unary_envelope(frame: &Frame) -> Result<Bytes> {
    let header = &frame.header;
    if !header.is_unary() {
        return Err(RpcwireError::Protocol(format!(
            "frame type {} is not a unary frame",
            header.frame_type
        )));
    }
    if header.total_len as usize != frame.len() {
        return Err(RpcwireError::Protocol(format!(
            "total length {} does not match frame length {}",
            header.total_len,
            frame.len()
        )));
    }
    if header.header_len == 0 {
        return Err(RpcwireError::Protocol("unary frame has no envelope".into()));
    }
    let envelope_end = HEADER_SIZE + header.header_len as usize;
    if envelope_end > frame.len() {
        return Err(RpcwireError::Protocol(format!(
            "envelope length {} exceeds frame length {}",
            header.header_len,
            frame.len()
        )));
    }
    Ok(frame.data.slice(HEADER_SIZE..envelope_end))
}

/// Split what follows the envelope into `(body, attachment)`.
pub(crate) fn body_and_attachment(frame: &Frame, attachment_size: u32) -> Result<(Bytes, Bytes)> {
    let envelope_end = HEADER_SIZE + frame.header.header_len as usize;
    let total = frame.len();
    let attachment_begin = total
        .checked_sub(attachment_size as usize)
        .filter(|begin| *begin >= envelope_end)
        .ok_or_else(|| {
            RpcwireError::Protocol(format!(
                "attachment size {} does not fit frame of {} bytes with {} byte envelope",
                attachment_size, total, frame.header.header_len
            ))
        })?;
    Ok((
        frame.data.slice(envelope_end..attachment_begin),
        frame.data.slice(attachment_begin..),
    ))
}
