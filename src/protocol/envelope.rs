//! Envelopes: the serialized metadata block that follows the frame header.
//!
//! Unary frames carry a [`RequestEnvelope`] or [`ResponseEnvelope`]. Stream
//! frames carry one of [`StreamInitMeta`], [`StreamCloseMeta`] or
//! [`StreamFeedbackMeta`]; DATA frames carry none.
//!
//! Envelopes are MessagePack maps (`rmp_serde::to_vec_named`), so absent
//! fields decode to their defaults and peers may add fields freely.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::codec::{from_msgpack, to_msgpack};
use crate::error::Result;

/// Free-form metadata carried with a call.
pub type TransInfo = HashMap<String, ByteBuf>;

/// Trans-info key holding the dyeing (trace marking) key.
pub const DYEING_KEY: &str = "rpcwire-dyeing-key";

/// Trans-info key holding the environment propagation value.
pub const ENV_TRANSFER_KEY: &str = "rpcwire-env";

/// Message type bit: the call is dyed.
pub const MESSAGE_TYPE_DYEING: u32 = 0x01;

/// Call type on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallType {
    /// Request expects a response.
    #[default]
    Normal,
    /// Send-only: the server never replies.
    OneWay,
}

impl CallType {
    /// Wire value.
    pub fn as_u32(self) -> u32 {
        match self {
            CallType::Normal => 0,
            CallType::OneWay => 1,
        }
    }

    /// Parse from the wire value. Unknown values are treated as normal calls.
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => CallType::OneWay,
            _ => CallType::Normal,
        }
    }
}

/// Close type carried in CLOSE frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CloseType {
    /// Graceful end of stream.
    #[default]
    Close,
    /// Abnormal termination.
    Reset,
}

impl CloseType {
    /// Wire value.
    pub fn as_i32(self) -> i32 {
        match self {
            CloseType::Close => 0,
            CloseType::Reset => 1,
        }
    }

    /// Parse from the wire value; anything but 0 is a reset.
    pub fn from_i32(value: i32) -> Self {
        if value == 0 {
            CloseType::Close
        } else {
            CloseType::Reset
        }
    }
}

/// Unary request envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestEnvelope {
    /// Protocol version.
    pub version: u32,
    /// Call type (see [`CallType`]).
    pub call_type: u32,
    /// Request correlation ID.
    pub request_id: u32,
    /// Timeout in milliseconds (0 = none).
    pub timeout: u32,
    /// Calling service name.
    pub caller: String,
    /// Called service name.
    pub callee: String,
    /// Method name, e.g. `/pkg.Service/Method`.
    pub func: String,
    /// Message type flags (see [`MESSAGE_TYPE_DYEING`]).
    pub message_type: u32,
    /// Free-form metadata.
    pub trans_info: TransInfo,
    /// Serialization type of the body.
    pub content_type: u32,
    /// Compression type of the body.
    pub content_encoding: u32,
    /// Attachment length in bytes.
    pub attachment_size: u32,
}

/// Unary response envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseEnvelope {
    /// Protocol version.
    pub version: u32,
    /// Call type copied from the request.
    pub call_type: u32,
    /// Request correlation ID copied from the request.
    pub request_id: u32,
    /// Framework return code.
    pub ret: i32,
    /// Business return code.
    pub func_ret: i32,
    /// Error message for `ret`/`func_ret`.
    pub error_msg: String,
    /// Message type flags.
    pub message_type: u32,
    /// Free-form metadata.
    pub trans_info: TransInfo,
    /// Serialization type of the body.
    pub content_type: u32,
    /// Compression type of the body.
    pub content_encoding: u32,
    /// Attachment length in bytes.
    pub attachment_size: u32,
}

impl ResponseEnvelope {
    /// Seed a response from its request: version, call type, request ID,
    /// message type and body types are carried forward.
    pub fn for_request(req: &RequestEnvelope) -> Self {
        Self {
            version: req.version,
            call_type: req.call_type,
            request_id: req.request_id,
            message_type: req.message_type,
            content_type: req.content_type,
            content_encoding: req.content_encoding,
            ..Self::default()
        }
    }
}

/// Caller side of INIT metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamInitRequestMeta {
    /// Calling service name.
    pub caller: String,
    /// Called service name.
    pub callee: String,
    /// Method name.
    pub func: String,
    /// Message type flags.
    pub message_type: u32,
    /// Free-form metadata.
    pub trans_info: TransInfo,
}

/// Callee side of INIT metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamInitResponseMeta {
    /// Framework return code.
    pub ret: i32,
    /// Error message.
    pub error_msg: String,
}

/// INIT frame metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamInitMeta {
    /// Present on client -> server INIT.
    pub request_meta: Option<StreamInitRequestMeta>,
    /// Present on server -> client INIT.
    pub response_meta: Option<StreamInitResponseMeta>,
    /// Window size; `None` means the default, `Some(0)` disables flow control.
    pub init_window_size: Option<u32>,
    /// Serialization type of DATA payloads.
    pub content_type: u32,
    /// Compression type of DATA payloads.
    pub content_encoding: u32,
}

/// CLOSE frame metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamCloseMeta {
    /// Close type (see [`CloseType`]).
    pub close_type: i32,
    /// Framework return code.
    pub ret: i32,
    /// Error message.
    pub msg: String,
    /// Message type flags.
    pub message_type: u32,
    /// Free-form metadata.
    pub trans_info: TransInfo,
    /// Business return code.
    pub func_ret: i32,
}

/// FEEDBACK frame metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamFeedbackMeta {
    /// Bytes the receiver has consumed since its last feedback.
    pub window_size_increment: u32,
}

/// Serialize an envelope.
#[inline]
pub fn encode_envelope<T: Serialize>(envelope: &T) -> Result<Vec<u8>> {
    to_msgpack(envelope).map(Vec::from)
}

/// Deserialize an envelope.
#[inline]
pub fn decode_envelope<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    from_msgpack(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_envelope_roundtrip() {
        let mut trans_info = TransInfo::new();
        trans_info.insert(DYEING_KEY.to_string(), ByteBuf::from(b"user-1".to_vec()));

        let req = RequestEnvelope {
            version: 1,
            call_type: CallType::OneWay.as_u32(),
            request_id: 9,
            timeout: 500,
            caller: "svc.a".into(),
            callee: "svc.b".into(),
            func: "/pkg.Service/Method".into(),
            message_type: MESSAGE_TYPE_DYEING,
            trans_info,
            content_type: 2,
            content_encoding: 1,
            attachment_size: 3,
        };
        let bytes = encode_envelope(&req).unwrap();
        let decoded: RequestEnvelope = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_missing_fields_default() {
        // A peer that only knows about the increment field.
        #[derive(Serialize)]
        struct Minimal {
            window_size_increment: u32,
        }
        let bytes = encode_envelope(&Minimal {
            window_size_increment: 1024,
        })
        .unwrap();
        let meta: StreamFeedbackMeta = decode_envelope(&bytes).unwrap();
        assert_eq!(meta.window_size_increment, 1024);

        let init: StreamInitMeta = decode_envelope(&encode_envelope(&Minimal {
            window_size_increment: 1,
        })
        .unwrap())
        .unwrap();
        assert_eq!(init.init_window_size, None);
        assert!(init.request_meta.is_none());
    }

    #[test]
    fn test_response_seeded_from_request() {
        let req = RequestEnvelope {
            version: 0,
            call_type: 0,
            request_id: 77,
            message_type: MESSAGE_TYPE_DYEING,
            content_type: 2,
            content_encoding: 1,
            func: "/a/b".into(),
            ..Default::default()
        };
        let rsp = ResponseEnvelope::for_request(&req);
        assert_eq!(rsp.request_id, 77);
        assert_eq!(rsp.version, 0);
        assert_eq!(rsp.message_type, MESSAGE_TYPE_DYEING);
        assert_eq!(rsp.content_type, 2);
        assert_eq!(rsp.content_encoding, 1);
        assert_eq!(rsp.ret, 0);
    }

    #[test]
    fn test_close_type_wire_values() {
        assert_eq!(CloseType::Close.as_i32(), 0);
        assert_eq!(CloseType::Reset.as_i32(), 1);
        assert_eq!(CloseType::from_i32(0), CloseType::Close);
        assert_eq!(CloseType::from_i32(1), CloseType::Reset);
        assert_eq!(CloseType::from_i32(-3), CloseType::Reset);
    }

    #[test]
    fn test_call_type_wire_values() {
        assert_eq!(CallType::from_u32(CallType::OneWay.as_u32()), CallType::OneWay);
        assert_eq!(CallType::from_u32(42), CallType::Normal);
    }
}
