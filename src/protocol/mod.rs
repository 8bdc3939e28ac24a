//! Protocol module - wire format, framing, and envelopes.
//!
//! This module implements the binary protocol shared by unary and stream
//! calls:
//! - 16-byte header encoding/decoding
//! - Frame construction with length validation
//! - Framer for reading whole frames off a connection
//! - Envelope types serialized after the header

mod envelope;
mod frame;
mod framer;
mod wire_format;

pub use envelope::{
    decode_envelope, encode_envelope, CallType, CloseType, RequestEnvelope, ResponseEnvelope,
    StreamCloseMeta, StreamFeedbackMeta, StreamInitMeta, StreamInitRequestMeta,
    StreamInitResponseMeta, TransInfo, DYEING_KEY, ENV_TRANSFER_KEY, MESSAGE_TYPE_DYEING,
};
pub use frame::{construct, Frame, FrameError};
pub use framer::{read_frame, FrameParser};
pub use wire_format::{
    FrameHeader, FrameType, StreamFrameType, DEFAULT_MAX_FRAME_SIZE, DEFAULT_PROTOCOL_VERSION,
    HEADER_SIZE, MAGIC, PROTOCOL_VERSION_0, PROTOCOL_VERSION_1,
};
