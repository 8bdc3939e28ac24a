//! Stream frame codec.
//!
//! Encodes and decodes the four stream sub-frames on top of the frame header.
//! The server side keeps the INIT metadata of every open stream, keyed by
//! `(remote address, stream ID)`, because DATA, CLOSE and FEEDBACK frames do
//! not repeat the method name.

use std::sync::Arc;

use bytes::Bytes;

use super::registry::StreamRegistry;
use crate::context::CallContext;
use crate::error::{ErrorKind, Result, RpcError, RpcwireError};
use crate::protocol::{
    construct, decode_envelope, encode_envelope, CloseType, Frame, FrameHeader, StreamCloseMeta,
    StreamFeedbackMeta, StreamFrameType, StreamInitMeta, StreamInitRequestMeta,
    DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE, MESSAGE_TYPE_DYEING,
};

/// Decoded content of one stream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMsg {
    /// Stream negotiation.
    Init(StreamInitMeta),
    /// Payload bytes.
    Data(Bytes),
    /// Graceful close or reset.
    Close(StreamCloseMeta),
    /// Window increment.
    Feedback(StreamFeedbackMeta),
}

impl StreamMsg {
    /// Sub-frame type of this message.
    pub fn frame_type(&self) -> StreamFrameType {
        match self {
            StreamMsg::Init(_) => StreamFrameType::Init,
            StreamMsg::Data(_) => StreamFrameType::Data,
            StreamMsg::Close(_) => StreamFrameType::Close,
            StreamMsg::Feedback(_) => StreamFrameType::Feedback,
        }
    }
}

/// An encoded frame and the sub-frame type actually produced.
///
/// The server encoder may turn a DATA frame into a RESET CLOSE, in which case
/// `kind` is [`StreamFrameType::Close`].
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Sub-frame type written.
    pub kind: StreamFrameType,
    /// Complete frame bytes.
    pub data: Bytes,
}

/// Error implied by a CLOSE frame, if it is a reset or carries a return code.
pub fn close_error(meta: &StreamCloseMeta) -> Option<RpcError> {
    let reset = CloseType::from_i32(meta.close_type) == CloseType::Reset;
    if !reset && meta.ret == 0 && meta.func_ret == 0 {
        return None;
    }
    Some(if meta.ret == 0 && meta.func_ret != 0 {
        RpcError::business(meta.func_ret, meta.msg.clone())
    } else {
        RpcError::callee_framework(meta.ret, meta.msg.clone())
    })
}

/// RESET CLOSE metadata reporting `err` to the peer.
pub fn reset_meta(err: &RpcError) -> StreamCloseMeta {
    let (ret, func_ret) = match err.kind {
        ErrorKind::Business => (0, err.code),
        ErrorKind::Framework | ErrorKind::CalleeFramework => (err.code, 0),
    };
    StreamCloseMeta {
        close_type: CloseType::Reset.as_i32(),
        ret,
        func_ret,
        msg: err.msg.clone(),
        ..StreamCloseMeta::default()
    }
}

fn unknown_frame_type(raw: u8) -> RpcwireError {
    RpcwireError::Protocol(format!("unknown stream frame type {raw}"))
}

/// Split a stream frame into `(envelope, body)`, checking the declared lengths.
fn split_frame(frame: &Frame) -> Result<(Bytes, Bytes)> {
    let header = &frame.header;
    if !header.is_stream() {
        return Err(RpcwireError::Protocol(format!(
            "frame type {} is not a stream frame",
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
    let body_start = HEADER_SIZE + header.header_len as usize;
    if body_start > frame.len() {
        return Err(RpcwireError::Protocol(format!(
            "envelope length {} exceeds frame length {}",
            header.header_len,
            frame.len()
        )));
    }
    Ok((
        frame.data.slice(HEADER_SIZE..body_start),
        frame.data.slice(body_start..),
    ))
}

fn frame_header(ctx: &CallContext, kind: StreamFrameType) -> FrameHeader {
    let mut header = FrameHeader::stream(kind, ctx.stream_id);
    header.version = ctx.version;
    header
}

fn build(
    ctx: &CallContext,
    kind: StreamFrameType,
    envelope: &[u8],
    body: &[u8],
    max_frame_size: usize,
) -> Result<EncodedFrame> {
    let data = construct(&frame_header(ctx, kind), envelope, body, b"", max_frame_size)?;
    Ok(EncodedFrame { kind, data })
}

fn encode_msg(ctx: &CallContext, msg: &StreamMsg, max_frame_size: usize) -> Result<EncodedFrame> {
    let kind = msg.frame_type();
    match msg {
        StreamMsg::Init(meta) => build(ctx, kind, &encode_envelope(meta)?, b"", max_frame_size),
        StreamMsg::Data(body) => build(ctx, kind, b"", body, max_frame_size),
        StreamMsg::Close(meta) => build(ctx, kind, &encode_envelope(meta)?, b"", max_frame_size),
        StreamMsg::Feedback(meta) => {
            build(ctx, kind, &encode_envelope(meta)?, b"", max_frame_size)
        }
    }
}

/// Stamp the header fields of `frame` onto the context.
fn record_header(ctx: &mut CallContext, frame: &Frame) {
    ctx.frame_head = Some(frame.header);
    ctx.version = frame.header.version;
    ctx.stream_id = frame.header.stream_id;
}

/// Apply INIT request metadata to the context.
fn apply_init(ctx: &mut CallContext, meta: &StreamInitMeta) {
    ctx.serialization_type = meta.content_type;
    ctx.compress_type = meta.content_encoding;
    if let Some(req) = &meta.request_meta {
        ctx.caller.clone_from(&req.caller);
        ctx.callee.clone_from(&req.callee);
        ctx.method.clone_from(&req.func);
        ctx.dyeing = req.message_type & MESSAGE_TYPE_DYEING != 0;
        ctx.absorb_trans_info(&req.trans_info);
    }
}

/// INIT request metadata describing the call in `ctx`.
fn request_meta(ctx: &CallContext) -> StreamInitRequestMeta {
    StreamInitRequestMeta {
        caller: ctx.caller.clone(),
        callee: ctx.callee.clone(),
        func: ctx.method.clone(),
        message_type: if ctx.dyeing { MESSAGE_TYPE_DYEING } else { 0 },
        trans_info: ctx.outbound_trans_info(),
    }
}

/// Client side of the stream codec.
#[derive(Debug, Clone, Copy)]
pub struct ClientStreamCodec {
    max_frame_size: usize,
}

impl ClientStreamCodec {
    /// Create with a maximum frame size.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Largest frame this codec accepts or produces.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a frame for the stream in `ctx`.
    ///
    /// INIT request metadata and content types are filled in from the context.
    pub fn encode(&self, ctx: &CallContext, msg: &StreamMsg) -> Result<EncodedFrame> {
        match msg {
            StreamMsg::Init(meta) => {
                let mut meta = meta.clone();
                if meta.request_meta.is_none() {
                    meta.request_meta = Some(request_meta(ctx));
                }
                meta.content_type = ctx.serialization_type;
                meta.content_encoding = ctx.compress_type;
                encode_msg(ctx, &StreamMsg::Init(meta), self.max_frame_size)
            }
            other => encode_msg(ctx, other, self.max_frame_size),
        }
    }

    /// Decode a frame received for the stream in `ctx`.
    ///
    /// An INIT response with a non-zero return code, or a reset CLOSE, leaves
    /// an error on the context.
    pub fn decode(&self, ctx: &mut CallContext, frame: &Frame) -> Result<StreamMsg> {
        let kind = frame
            .header
            .stream_frame()
            .ok_or_else(|| unknown_frame_type(frame.header.stream_frame_type))?;
        let (envelope, body) = split_frame(frame)?;
        record_header(ctx, frame);

        match kind {
            StreamFrameType::Init => {
                let meta: StreamInitMeta = decode_envelope(&envelope)?;
                if let Some(rsp) = &meta.response_meta {
                    if rsp.ret != 0 {
                        ctx.error = Some(RpcError::callee_framework(rsp.ret, rsp.error_msg.clone()));
                    }
                }
                Ok(StreamMsg::Init(meta))
            }
            StreamFrameType::Data => Ok(StreamMsg::Data(body)),
            StreamFrameType::Close => {
                let meta: StreamCloseMeta = decode_envelope(&envelope)?;
                ctx.error = close_error(&meta);
                Ok(StreamMsg::Close(meta))
            }
            StreamFrameType::Feedback => Ok(StreamMsg::Feedback(decode_envelope(&envelope)?)),
            StreamFrameType::None => Err(unknown_frame_type(frame.header.stream_frame_type)),
        }
    }
}

impl Default for ClientStreamCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

/// Server side of the stream codec, with the INIT metadata store.
#[derive(Debug, Clone)]
pub struct ServerStreamCodec {
    max_frame_size: usize,
    init_meta: Arc<StreamRegistry<Arc<StreamInitMeta>>>,
}

impl ServerStreamCodec {
    /// Create with a maximum frame size and an empty metadata store.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            init_meta: Arc::new(StreamRegistry::new()),
        }
    }

    /// Largest frame this codec accepts or produces.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Decode a frame from `ctx.remote_addr`.
    ///
    /// INIT stores its metadata; DATA, CLOSE and FEEDBACK recover it or fail
    /// with [`RpcwireError::UninitializedMeta`]. A RESET forgets it. A
    /// graceful CLOSE only half-closes the stream, so the metadata stays
    /// until the server's own CLOSE and FEEDBACK keeps decoding.
    pub fn decode(&self, ctx: &mut CallContext, frame: &Frame) -> Result<StreamMsg> {
        let kind = frame
            .header
            .stream_frame()
            .ok_or_else(|| unknown_frame_type(frame.header.stream_frame_type))?;
        let (envelope, body) = split_frame(frame)?;
        record_header(ctx, frame);

        if kind == StreamFrameType::Init {
            let meta: StreamInitMeta = decode_envelope(&envelope)?;
            apply_init(ctx, &meta);
            self.init_meta
                .store(&ctx.remote_addr, ctx.stream_id, Arc::new(meta.clone()));
            return Ok(StreamMsg::Init(meta));
        }
        if kind == StreamFrameType::None {
            return Err(unknown_frame_type(frame.header.stream_frame_type));
        }

        let stored = self
            .init_meta
            .load(&ctx.remote_addr, ctx.stream_id)
            .map_err(|_| RpcwireError::UninitializedMeta {
                addr: ctx.remote_addr.clone(),
                stream_id: ctx.stream_id,
            })?;
        apply_init(ctx, &stored);

        match kind {
            StreamFrameType::Data => Ok(StreamMsg::Data(body)),
            StreamFrameType::Close => {
                let meta: StreamCloseMeta = decode_envelope(&envelope)?;
                ctx.error = close_error(&meta);
                if ctx.error.is_some() {
                    self.forget(&ctx.remote_addr, ctx.stream_id);
                }
                Ok(StreamMsg::Close(meta))
            }
            StreamFrameType::Feedback => Ok(StreamMsg::Feedback(decode_envelope(&envelope)?)),
            StreamFrameType::Init | StreamFrameType::None => {
                Err(unknown_frame_type(frame.header.stream_frame_type))
            }
        }
    }

    /// Encode a frame for the stream in `ctx`.
    ///
    /// A DATA frame encoded while `ctx.error` is set becomes a RESET CLOSE
    /// carrying that error. CLOSE forgets the stored metadata.
    pub fn encode(&self, ctx: &CallContext, msg: &StreamMsg) -> Result<EncodedFrame> {
        match msg {
            StreamMsg::Data(_) if ctx.error.is_some() => {
                let meta = ctx.error.as_ref().map(reset_meta).unwrap_or_default();
                tracing::debug!(
                    "stream {} from {} has error, sending reset instead of data",
                    ctx.stream_id,
                    ctx.remote_addr
                );
                self.forget(&ctx.remote_addr, ctx.stream_id);
                encode_msg(ctx, &StreamMsg::Close(meta), self.max_frame_size)
            }
            StreamMsg::Close(_) => {
                self.forget(&ctx.remote_addr, ctx.stream_id);
                encode_msg(ctx, msg, self.max_frame_size)
            }
            other => encode_msg(ctx, other, self.max_frame_size),
        }
    }

    /// Drop the stored INIT metadata for one stream.
    pub fn forget(&self, addr: &str, stream_id: u32) {
        self.init_meta.remove(addr, stream_id);
    }

    /// Drop the stored INIT metadata for every stream of `addr`.
    pub fn forget_addr(&self, addr: &str) {
        self.init_meta.remove_addr(addr);
    }

    /// Whether INIT metadata is stored for this stream.
    pub fn has_meta(&self, addr: &str, stream_id: u32) -> bool {
        self.init_meta.contains(addr, stream_id)
    }
}

impl Default for ServerStreamCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}
