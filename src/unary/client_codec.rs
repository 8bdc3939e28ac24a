//! Client side of the unary codec.

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;

use super::{body_and_attachment, unary_envelope};
use crate::context::CallContext;
use crate::error::{Result, RpcError, RpcwireError};
use crate::protocol::{
    construct, decode_envelope, encode_envelope, Frame, FrameError, FrameHeader, RequestEnvelope,
    ResponseEnvelope, DEFAULT_MAX_FRAME_SIZE, MESSAGE_TYPE_DYEING,
};

static REQUEST_ID: AtomicU32 = AtomicU32::new(0);

/// Allocate a process-wide request ID. Wraps at `u32::MAX` and skips 0.
pub fn next_request_id() -> u32 {
    loop {
        let id = REQUEST_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if id != 0 {
            return id;
        }
    }
}

/// Encodes unary requests and decodes their responses.
#[derive(Debug, Clone, Copy)]
pub struct ClientCodec {
    max_frame_size: usize,
}

impl ClientCodec {
    /// Create with a maximum frame size.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Largest frame this codec accepts or produces.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode the request in `ctx` with a newly allocated request ID.
    ///
    /// The frame header is built fresh; `ctx.frame_head` is never read or
    /// modified here.
    pub fn encode(&self, ctx: &mut CallContext, body: &[u8]) -> Result<Bytes> {
        let request_id = next_request_id();
        let mut req = ctx.req_envelope.take().unwrap_or_else(|| RequestEnvelope {
            version: ctx.version as u32,
            ..RequestEnvelope::default()
        });

        req.request_id = request_id;
        req.call_type = ctx.call_type.as_u32();
        req.timeout = ctx.timeout_ms();
        req.caller.clone_from(&ctx.caller);
        req.callee.clone_from(&ctx.callee);
        req.func.clone_from(&ctx.method);
        if ctx.dyeing {
            req.message_type |= MESSAGE_TYPE_DYEING;
        } else {
            req.message_type &= !MESSAGE_TYPE_DYEING;
        }
        req.trans_info = ctx.outbound_trans_info();
        req.content_type = ctx.serialization_type;
        req.content_encoding = ctx.compress_type;
        req.attachment_size =
            u32::try_from(ctx.req_attachment.len()).map_err(|_| FrameError::AttachmentTooLarge {
                len: ctx.req_attachment.len(),
            })?;

        let mut header = FrameHeader::unary(request_id);
        header.version = ctx.version;
        let envelope = encode_envelope(&req)?;

        ctx.request_id = request_id;
        ctx.req_envelope = Some(req);
        Ok(construct(
            &header,
            &envelope,
            body,
            &ctx.req_attachment,
            self.max_frame_size,
        )?)
    }

    /// Decode the response to the request in `ctx` and return its body.
    ///
    /// A response for another request ID is an error. A non-zero `ret` leaves
    /// a callee framework error on the context; otherwise a non-zero
    /// `func_ret` leaves a business error.
    pub fn decode(&self, ctx: &mut CallContext, frame: &Frame) -> Result<Bytes> {
        let envelope = unary_envelope(frame)?;
        let rsp: ResponseEnvelope = decode_envelope(&envelope)?;
        if rsp.request_id != ctx.request_id {
            return Err(RpcwireError::Protocol(format!(
                "response mismatch: got request id {}, expected {}",
                rsp.request_id, ctx.request_id
            )));
        }
        let (body, attachment) = body_and_attachment(frame, rsp.attachment_size)?;

        ctx.serialization_type = rsp.content_type;
        ctx.compress_type = rsp.content_encoding;
        ctx.rsp_attachment = attachment;
        if rsp.ret != 0 {
            ctx.error = Some(RpcError::callee_framework(rsp.ret, rsp.error_msg.clone()));
        } else if rsp.func_ret != 0 {
            ctx.error = Some(RpcError::business(rsp.func_ret, rsp.error_msg.clone()));
        }
        ctx.rsp_envelope = Some(rsp);
        Ok(body)
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{codes, ErrorKind};
    use crate::protocol::{CallType, PROTOCOL_VERSION_0};
    use crate::unary::ServerCodec;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn roundtrip(server_ctx_setup: impl FnOnce(&mut CallContext), body: &[u8]) -> (CallContext, Bytes) {
        let client = ClientCodec::default();
        let server = ServerCodec::default();

        let mut cctx = CallContext::new("/pkg.Service/Echo");
        let req = Frame::from_bytes(client.encode(&mut cctx, b"ping").unwrap()).unwrap();

        let mut sctx = CallContext::default();
        server.decode(&mut sctx, &req).unwrap();
        server_ctx_setup(&mut sctx);
        let rsp = Frame::from_bytes(server.encode(&mut sctx, body).unwrap()).unwrap();

        let body = client.decode(&mut cctx, &rsp).unwrap();
        (cctx, body)
    }

    #[test]
    fn test_request_response_roundtrip() {
        let (ctx, body) = roundtrip(
            |s| s.rsp_attachment = Bytes::from_static(b"att"),
            b"pong",
        );
        assert_eq!(&body[..], b"pong");
        assert_eq!(&ctx.rsp_attachment[..], b"att");
        assert!(ctx.error.is_none());
    }

    #[test]
    fn test_ret_becomes_callee_framework_error() {
        let (ctx, _) = roundtrip(
            |s| s.error = Some(RpcError::framework(codes::SERVER_NO_FUNC, "no func")),
            b"",
        );
        let err = ctx.error.unwrap();
        assert_eq!(err.kind, ErrorKind::CalleeFramework);
        assert_eq!(err.code, codes::SERVER_NO_FUNC);
        assert_eq!(err.msg, "no func");
    }

    #[test]
    fn test_func_ret_becomes_business_error() {
        let (ctx, _) = roundtrip(|s| s.error = Some(RpcError::business(3, "nope")), b"");
        assert_eq!(ctx.error, Some(RpcError::business(3, "nope")));
    }

    #[test]
    fn test_request_id_mismatch_is_error() {
        let client = ClientCodec::default();
        let server = ServerCodec::default();

        let mut cctx = CallContext::new("/a/b");
        let req = Frame::from_bytes(client.encode(&mut cctx, b"").unwrap()).unwrap();
        let mut sctx = CallContext::default();
        server.decode(&mut sctx, &req).unwrap();
        let rsp = Frame::from_bytes(server.encode(&mut sctx, b"").unwrap()).unwrap();

        cctx.request_id = cctx.request_id.wrapping_add(1);
        let err = client.decode(&mut cctx, &rsp).unwrap_err();
        assert!(err.to_string().contains("response mismatch"));
    }

    #[test]
    fn test_caller_header_is_never_modified() {
        let client = ClientCodec::default();
        let mut shared_head = FrameHeader::unary(0xFFFF_FFF0);
        shared_head.version = PROTOCOL_VERSION_0;

        let mut ctx = CallContext::new("/a/b");
        ctx.frame_head = Some(shared_head);
        let bytes = client.encode(&mut ctx, b"").unwrap();

        assert_eq!(ctx.frame_head, Some(shared_head));
        let sent = FrameHeader::extract(&bytes).unwrap();
        assert_ne!(sent.stream_id, 0xFFFF_FFF0);
        assert_eq!(sent.stream_id, ctx.request_id);
    }

    #[test]
    fn test_one_way_call_type_is_sent() {
        let client = ClientCodec::default();
        let mut ctx = CallContext::new("/a/b");
        ctx.call_type = CallType::OneWay;
        let frame = Frame::from_bytes(client.encode(&mut ctx, b"").unwrap()).unwrap();
        let mut sctx = CallContext::default();
        ServerCodec::default().decode(&mut sctx, &frame).unwrap();
        assert_eq!(sctx.call_type, CallType::OneWay);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_encodes_get_distinct_ids() {
        let codec = Arc::new(ClientCodec::default());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let codec = codec.clone();
            tasks.push(tokio::spawn(async move {
                let mut ids = Vec::with_capacity(500);
                for _ in 0..500 {
                    let mut ctx = CallContext::new("/a/b");
                    codec.encode(&mut ctx, b"").unwrap();
                    ids.push(ctx.request_id);
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(id > 0);
                assert!(seen.insert(id), "duplicate request id {id}");
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
