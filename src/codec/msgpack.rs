//! MessagePack helpers shared by envelopes and payloads.
//!
//! Structs are always written as maps keyed by field name
//! (`rmp_serde::to_vec_named`), so a peer that adds or drops optional fields
//! can still read what we send.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Encode `value` as MessagePack with named fields.
pub fn to_msgpack<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
}

/// Decode a MessagePack value.
pub fn from_msgpack<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(data)?)
}
