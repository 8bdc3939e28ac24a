//! Server side of the unary codec.

use bytes::Bytes;

use super::{body_and_attachment, unary_envelope};
use crate::context::CallContext;
use crate::error::{codes, ErrorKind, Result};
use crate::protocol::{
    construct, decode_envelope, encode_envelope, CallType, Frame, FrameError, FrameHeader,
    RequestEnvelope, ResponseEnvelope, DEFAULT_MAX_FRAME_SIZE, MESSAGE_TYPE_DYEING,
};

/// Decodes unary requests and encodes their responses.
#[derive(Debug, Clone, Copy)]
pub struct ServerCodec {
    max_frame_size: usize,
}

impl ServerCodec {
    /// Create with a maximum frame size.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode a request frame into `ctx` and return the body.
    ///
    /// The header is recorded on the context before anything can fail, so a
    /// decode error can still be answered.
    pub fn decode(&self, ctx: &mut CallContext, frame: &Frame) -> Result<Bytes> {
        ctx.frame_head = Some(frame.header);
        ctx.version = frame.header.version;
        ctx.request_id = frame.header.stream_id;

        let envelope = unary_envelope(frame)?;
        let req: RequestEnvelope = decode_envelope(&envelope)?;
        let (body, attachment) = body_and_attachment(frame, req.attachment_size)?;

        ctx.request_id = req.request_id;
        ctx.caller.clone_from(&req.caller);
        ctx.callee.clone_from(&req.callee);
        ctx.method.clone_from(&req.func);
        ctx.set_timeout(std::time::Duration::from_millis(req.timeout as u64));
        ctx.serialization_type = req.content_type;
        ctx.compress_type = req.content_encoding;
        ctx.call_type = CallType::from_u32(req.call_type);
        ctx.dyeing = req.message_type & MESSAGE_TYPE_DYEING != 0;
        ctx.absorb_trans_info(&req.trans_info);
        ctx.req_attachment = attachment;
        ctx.req_envelope = Some(req);
        Ok(body)
    }

    /// Encode the response for the request in `ctx`.
    ///
    /// If the envelope overflows its length field the response is re-encoded
    /// without metadata and with `SERVER_ENCODE_FAIL`; if the whole frame is
    /// too large the body is dropped as well. A failing retry is returned as
    /// an error and the response is abandoned.
    pub fn encode(&self, ctx: &mut CallContext, body: &[u8]) -> Result<Bytes> {
        let mut rsp = match ctx.rsp_envelope.take() {
            Some(rsp) => rsp,
            None => match &ctx.req_envelope {
                Some(req) => ResponseEnvelope::for_request(req),
                None => ResponseEnvelope {
                    version: ctx.version as u32,
                    call_type: ctx.call_type.as_u32(),
                    request_id: ctx.request_id,
                    ..ResponseEnvelope::default()
                },
            },
        };
        rsp.content_type = ctx.effective_serialization_type();
        rsp.content_encoding = ctx.effective_compress_type();
        if let Some(err) = &ctx.error {
            match err.kind {
                ErrorKind::Business => rsp.func_ret = err.code,
                ErrorKind::Framework | ErrorKind::CalleeFramework => rsp.ret = err.code,
            }
            rsp.error_msg.clone_from(&err.msg);
        }
        rsp.attachment_size =
            u32::try_from(ctx.rsp_attachment.len()).map_err(|_| FrameError::AttachmentTooLarge {
                len: ctx.rsp_attachment.len(),
            })?;

        let header = self.reply_header(ctx);
        let envelope = encode_envelope(&rsp)?;
        let result = construct(
            &header,
            &envelope,
            body,
            &ctx.rsp_attachment,
            self.max_frame_size,
        );
        ctx.rsp_envelope = Some(rsp);

        match result {
            Ok(frame) => Ok(frame),
            Err(e) if e.is_header_overflow() => self.encode_fallback(ctx, &header, body, &e),
            Err(e) if e.is_frame_overflow() => self.encode_fallback(ctx, &header, b"", &e),
            Err(e) => Err(e.into()),
        }
    }

    fn reply_header(&self, ctx: &CallContext) -> FrameHeader {
        match &ctx.frame_head {
            Some(inbound) => FrameHeader::reply_to(inbound),
            None => {
                let mut header = FrameHeader::unary(ctx.request_id);
                header.version = ctx.version;
                header
            }
        }
    }

    fn encode_fallback(
        &self,
        ctx: &CallContext,
        header: &FrameHeader,
        body: &[u8],
        cause: &FrameError,
    ) -> Result<Bytes> {
        tracing::warn!(
            "response to {} (request {}) did not fit: {}, sending encode failure",
            ctx.method,
            ctx.request_id,
            cause
        );
        let rsp = ctx.rsp_envelope.as_ref();
        let fallback = ResponseEnvelope {
            version: rsp.map_or(ctx.version as u32, |r| r.version),
            call_type: rsp.map_or(ctx.call_type.as_u32(), |r| r.call_type),
            request_id: ctx.request_id,
            ret: codes::SERVER_ENCODE_FAIL,
            error_msg: format!("encode response failed: {cause}"),
            content_type: ctx.effective_serialization_type(),
            content_encoding: ctx.effective_compress_type(),
            ..ResponseEnvelope::default()
        };
        let envelope = encode_envelope(&fallback)?;
        construct(header, &envelope, body, b"", self.max_frame_size).map_err(|e| {
            tracing::error!(
                "fallback response to request {} failed too, abandoning: {}",
                ctx.request_id,
                e
            );
            e.into()
        })
    }
}

impl Default for ServerCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use crate::protocol::{TransInfo, DYEING_KEY, HEADER_SIZE, PROTOCOL_VERSION_0};
    use crate::unary::ClientCodec;
    use serde_bytes::ByteBuf;

    fn request_frame(codec: &ClientCodec, ctx: &mut CallContext, body: &[u8]) -> Frame {
        Frame::from_bytes(codec.encode(ctx, body).unwrap()).unwrap()
    }

    fn client_ctx() -> CallContext {
        let mut ctx = CallContext::new("/pkg.Service/Echo")
            .with_timeout(std::time::Duration::from_millis(1500));
        ctx.caller = "caller.app".into();
        ctx.callee = "pkg.Service".into();
        ctx.serialization_type = 2;
        ctx.compress_type = 1;
        ctx.dyeing = true;
        ctx.dyeing_key = "uid-7".into();
        ctx.req_attachment = Bytes::from_static(b"ATTACH");
        ctx
    }

    #[test]
    fn test_decode_populates_context() {
        let client = ClientCodec::default();
        let mut cctx = client_ctx();
        let frame = request_frame(&client, &mut cctx, b"body-bytes");

        let mut sctx = CallContext::default();
        let body = ServerCodec::default().decode(&mut sctx, &frame).unwrap();

        assert_eq!(&body[..], b"body-bytes");
        assert_eq!(&sctx.req_attachment[..], b"ATTACH");
        assert_eq!(sctx.request_id, cctx.request_id);
        assert_eq!(sctx.method, "/pkg.Service/Echo");
        assert_eq!(sctx.caller, "caller.app");
        assert_eq!(sctx.callee, "pkg.Service");
        assert_eq!(sctx.timeout_ms(), 1500);
        assert_eq!(sctx.serialization_type, 2);
        assert_eq!(sctx.compress_type, 1);
        assert!(sctx.dyeing);
        assert_eq!(sctx.dyeing_key, "uid-7");
        assert_eq!(sctx.call_type, CallType::Normal);
    }

    #[test]
    fn test_decode_rejects_missing_envelope() {
        let bytes = construct(&FrameHeader::unary(1), b"", b"body", b"", DEFAULT_MAX_FRAME_SIZE)
            .unwrap();
        let frame = Frame::from_bytes(bytes).unwrap();
        let mut ctx = CallContext::default();
        let err = ServerCodec::default().decode(&mut ctx, &frame).unwrap_err();
        assert!(err.to_string().contains("no envelope"));
        // The header is still recorded for the error reply.
        assert_eq!(ctx.request_id, 1);
    }

    #[test]
    fn test_decode_rejects_bad_attachment_size() {
        let req = RequestEnvelope {
            attachment_size: 1000,
            ..Default::default()
        };
        let env = encode_envelope(&req).unwrap();
        let bytes = construct(&FrameHeader::unary(3), &env, b"tiny", b"", DEFAULT_MAX_FRAME_SIZE)
            .unwrap();
        let frame = Frame::from_bytes(bytes).unwrap();
        assert!(ServerCodec::default()
            .decode(&mut CallContext::default(), &frame)
            .is_err());
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let env = encode_envelope(&RequestEnvelope::default()).unwrap();
        let bytes = construct(&FrameHeader::unary(3), &env, b"abc", b"", DEFAULT_MAX_FRAME_SIZE)
            .unwrap();
        let mut frame = Frame::from_bytes(bytes).unwrap();
        frame.header.total_len += 1;
        assert!(ServerCodec::default()
            .decode(&mut CallContext::default(), &frame)
            .is_err());
    }

    #[test]
    fn test_response_echoes_version_and_id() {
        let mut header = FrameHeader::unary(4242);
        header.version = PROTOCOL_VERSION_0;
        let req = RequestEnvelope {
            request_id: 4242,
            ..Default::default()
        };
        let bytes = construct(&header, &encode_envelope(&req).unwrap(), b"", b"", DEFAULT_MAX_FRAME_SIZE)
            .unwrap();

        let codec = ServerCodec::default();
        let mut ctx = CallContext::default();
        codec.decode(&mut ctx, &Frame::from_bytes(bytes).unwrap()).unwrap();
        let rsp = codec.encode(&mut ctx, b"ok").unwrap();

        let rsp_header = FrameHeader::extract(&rsp).unwrap();
        assert_eq!(rsp_header.version, PROTOCOL_VERSION_0);
        assert_eq!(rsp_header.stream_id, 4242);
    }

    #[test]
    fn test_error_codes_on_response() {
        let codec = ServerCodec::default();
        let mut ctx = CallContext::default();
        ctx.request_id = 1;
        ctx.error = Some(RpcError::business(77, "out of stock"));
        let frame = Frame::from_bytes(codec.encode(&mut ctx, b"").unwrap()).unwrap();
        let rsp: ResponseEnvelope = decode_envelope(&unary_envelope(&frame).unwrap()).unwrap();
        assert_eq!(rsp.ret, 0);
        assert_eq!(rsp.func_ret, 77);
        assert_eq!(rsp.error_msg, "out of stock");

        let mut ctx = CallContext::default();
        ctx.error = Some(RpcError::framework(codes::SERVER_NO_FUNC, "missing"));
        let frame = Frame::from_bytes(codec.encode(&mut ctx, b"").unwrap()).unwrap();
        let rsp: ResponseEnvelope = decode_envelope(&unary_envelope(&frame).unwrap()).unwrap();
        assert_eq!(rsp.ret, codes::SERVER_NO_FUNC);
    }

    #[test]
    fn test_envelope_overflow_falls_back() {
        let codec = ServerCodec::default();
        let mut ctx = CallContext::default();
        ctx.request_id = 9;
        let mut trans_info = TransInfo::new();
        trans_info.insert(DYEING_KEY.into(), ByteBuf::from(vec![b'x'; 70_000]));
        ctx.rsp_envelope = Some(ResponseEnvelope {
            request_id: 9,
            trans_info,
            ..Default::default()
        });

        let frame = Frame::from_bytes(codec.encode(&mut ctx, b"keep-body").unwrap()).unwrap();
        let rsp: ResponseEnvelope = decode_envelope(&unary_envelope(&frame).unwrap()).unwrap();
        assert_eq!(rsp.ret, codes::SERVER_ENCODE_FAIL);
        assert!(rsp.trans_info.is_empty());
        assert_eq!(rsp.request_id, 9);
        let (body, _) = body_and_attachment(&frame, rsp.attachment_size).unwrap();
        assert_eq!(&body[..], b"keep-body");
    }

    #[test]
    fn test_frame_overflow_drops_body() {
        let codec = ServerCodec::new(1024);
        let mut ctx = CallContext::default();
        ctx.request_id = 10;
        let body = vec![0u8; 4096];

        let bytes = codec.encode(&mut ctx, &body).unwrap();
        assert!(bytes.len() <= 1024);
        let frame = Frame::from_bytes(bytes).unwrap();
        let rsp: ResponseEnvelope = decode_envelope(&unary_envelope(&frame).unwrap()).unwrap();
        assert_eq!(rsp.ret, codes::SERVER_ENCODE_FAIL);
        assert_eq!(frame.len(), HEADER_SIZE + frame.header.header_len as usize);
    }

    #[test]
    fn test_fallback_that_still_fails_is_error() {
        // Too small for even the fallback envelope.
        let codec = ServerCodec::new(HEADER_SIZE + 4);
        let mut ctx = CallContext::default();
        assert!(codec.encode(&mut ctx, b"").is_err());
    }
}
