//! Payload serialization selected by the type code carried in envelopes.
//!
//! | code | format |
//! |---|---|
//! | 0 | MessagePack |
//! | 2 | JSON |
//! | 4 | no-op (payload is already bytes) |
//! | `u32::MAX` | unset: the stage is skipped entirely |
//!
//! Typed values go through [`marshal`]/[`unmarshal`]. Raw byte payloads
//! (no-op serialization, or a proxy that leaves the type unset) bypass this
//! module and are framed as they are.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{from_msgpack, to_msgpack};
use crate::error::{Result, RpcwireError};

/// MessagePack.
pub const SERIALIZATION_MSGPACK: u32 = 0;
/// JSON.
pub const SERIALIZATION_JSON: u32 = 2;
/// Payload is raw bytes.
pub const SERIALIZATION_NOOP: u32 = 4;
/// Not set: (de)serialization is skipped.
pub const SERIALIZATION_UNSET: u32 = u32::MAX;

/// True if values of this type code are carried as raw bytes.
#[inline]
pub fn is_passthrough(serialization_type: u32) -> bool {
    matches!(serialization_type, SERIALIZATION_NOOP | SERIALIZATION_UNSET)
}

/// Serialize `value` with the given type code.
pub fn marshal<T: Serialize>(serialization_type: u32, value: &T) -> Result<Bytes> {
    match serialization_type {
        SERIALIZATION_MSGPACK => to_msgpack(value),
        SERIALIZATION_JSON => Ok(Bytes::from(serde_json::to_vec(value)?)),
        t if is_passthrough(t) => Err(RpcwireError::Protocol(format!(
            "serialization type {t} carries raw bytes, send bytes instead of a value"
        ))),
        t => Err(RpcwireError::Protocol(format!(
            "unsupported serialization type {t}"
        ))),
    }
}

/// Deserialize `data` with the given type code.
pub fn unmarshal<T: DeserializeOwned>(serialization_type: u32, data: &[u8]) -> Result<T> {
    match serialization_type {
        SERIALIZATION_MSGPACK => from_msgpack(data),
        SERIALIZATION_JSON => Ok(serde_json::from_slice(data)?),
        t if is_passthrough(t) => Err(RpcwireError::Protocol(format!(
            "serialization type {t} carries raw bytes, receive bytes instead of a value"
        ))),
        t => Err(RpcwireError::Protocol(format!(
            "unsupported serialization type {t}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Ping {
        seq: u32,
        text: String,
    }

    #[test]
    fn test_msgpack_and_json_dispatch() {
        let ping = Ping {
            seq: 7,
            text: "hi".into(),
        };

        let mp = marshal(SERIALIZATION_MSGPACK, &ping).unwrap();
        assert_eq!(unmarshal::<Ping>(SERIALIZATION_MSGPACK, &mp).unwrap(), ping);

        let json = marshal(SERIALIZATION_JSON, &ping).unwrap();
        assert_eq!(&json[..], br#"{"seq":7,"text":"hi"}"#);
        assert_eq!(unmarshal::<Ping>(SERIALIZATION_JSON, &json).unwrap(), ping);
    }

    #[test]
    fn test_passthrough_types_refuse_values() {
        assert!(is_passthrough(SERIALIZATION_NOOP));
        assert!(is_passthrough(SERIALIZATION_UNSET));
        assert!(!is_passthrough(SERIALIZATION_JSON));

        assert!(marshal(SERIALIZATION_NOOP, &1u8).is_err());
        assert!(unmarshal::<u8>(SERIALIZATION_UNSET, b"\x01").is_err());
    }

    #[test]
    fn test_unknown_type_is_error() {
        let err = marshal(99, &1u8).unwrap_err();
        assert!(err.to_string().contains("unsupported serialization type 99"));
    }
}
