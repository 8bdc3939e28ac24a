//! Transport module - the boundary between protocol code and a connection.
//!
//! - [`FrameSender`] - the "send serialized bytes" primitive stream and unary
//!   code writes through. Implemented by [`WriterHandle`](crate::writer::WriterHandle).
//! - [`ClientConn`] - client side of one multiplexed connection: a read task
//!   that parses frames and routes them by request/stream ID.
//!
//! Dialing, accepting and TLS stay with the caller; anything implementing
//! `AsyncRead`/`AsyncWrite` can carry the protocol.

mod conn;

pub use conn::{ClientConn, StreamEvent, StreamRoute, UnaryRoute};

use bytes::Bytes;

use crate::error::Result;
use crate::handler::BoxFuture;

/// Sends complete frames on a connection.
pub trait FrameSender: Send + Sync + 'static {
    /// Queue one complete frame for writing.
    fn send_frame(&self, frame: Bytes) -> BoxFuture<'_, Result<()>>;
}
