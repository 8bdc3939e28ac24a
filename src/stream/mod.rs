//! Streaming sub-protocol: INIT / DATA / CLOSE / FEEDBACK on top of the
//! frame header, with credit-based flow control.
//!
//! - [`codec`] - stream frame encode/decode, server INIT metadata store
//! - [`flow_control`] - send and receive windows
//! - [`StreamClient`] / [`ClientStream`] - the calling side
//! - [`StreamDispatcher`] / [`ServerStream`] - the serving side

pub mod codec;
pub mod flow_control;
pub mod queue;
pub mod registry;

mod client;
mod server;

pub use client::{ClientStream, Next, StreamClient, StreamDesc, StreamInterceptor};
pub use codec::{ClientStreamCodec, EncodedFrame, ServerStreamCodec, StreamMsg};
pub use flow_control::{
    negotiate_window, FeedbackFn, ReceiveControl, SendControl, DEFAULT_FEEDBACK_DIVISOR,
    DEFAULT_WINDOW_SIZE,
};
pub use queue::BlockingQueue;
pub use registry::StreamRegistry;
pub use server::{ServerStream, StreamDispatcher};

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Result, RpcError};
use crate::protocol::StreamFeedbackMeta;
use crate::transport::FrameSender;

/// Entry in a stream's receive queue.
#[derive(Debug, Clone)]
pub(crate) enum RecvItem {
    Data(Bytes),
    /// Peer closed gracefully.
    Eof,
    /// Peer reset the stream or the connection failed.
    Reset(RpcError),
}

/// FEEDBACK sender for a receive controller. `encode` builds the frame for
/// the owning stream.
pub(crate) fn feedback_fn<E>(sender: Arc<dyn FrameSender>, encode: E) -> FeedbackFn
where
    E: Fn(&StreamMsg) -> Result<EncodedFrame> + Send + Sync + 'static,
{
    let encode = Arc::new(encode);
    Arc::new(move |increment| {
        let sender = sender.clone();
        let encode = encode.clone();
        Box::pin(async move {
            let frame = encode(&StreamMsg::Feedback(StreamFeedbackMeta {
                window_size_increment: increment,
            }))?;
            sender.send_frame(frame.data).await
        })
    })
}

/// Length of a payload as counted against a window.
#[inline]
pub(crate) fn window_len(body: &[u8]) -> u32 {
    u32::try_from(body.len()).unwrap_or(u32::MAX)
}
