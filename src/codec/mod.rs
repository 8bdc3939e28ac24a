//! Codec module - payload serialization and compression.
//!
//! - [`to_msgpack`]/[`from_msgpack`] - MessagePack using `rmp-serde`, also used for envelopes
//! - [`marshal`]/[`unmarshal`] - serialization chosen by the envelope's type code
//! - [`compress`]/[`decompress`] - pluggable compression chosen by type code
//!
//! # Design
//!
//! Serializers are plain generic functions picked by a `match` on the type
//! code, so typed values never pass through dynamic dispatch. Compression
//! works on plain bytes and is a trait-object registry that applications can
//! extend.
//!
//! # Example
//!
//! ```
//! use rpcwire::codec::{compress, decompress, marshal, unmarshal, COMPRESS_GZIP, SERIALIZATION_JSON};
//!
//! let body = marshal(SERIALIZATION_JSON, &vec![1, 2, 3]).unwrap();
//! let packed = compress(COMPRESS_GZIP, body).unwrap();
//! let body = decompress(COMPRESS_GZIP, packed, 1024).unwrap();
//! let value: Vec<i32> = unmarshal(SERIALIZATION_JSON, &body).unwrap();
//! assert_eq!(value, vec![1, 2, 3]);
//! ```

mod compression;
mod msgpack;
mod serialization;

pub use compression::{
    compress, decompress, register_compressor, Compressor, GzipCompressor, COMPRESS_GZIP,
    COMPRESS_NONE, COMPRESS_UNSET,
};
pub use msgpack::{from_msgpack, to_msgpack};
pub use serialization::{
    is_passthrough, marshal, unmarshal, SERIALIZATION_JSON, SERIALIZATION_MSGPACK,
    SERIALIZATION_NOOP, SERIALIZATION_UNSET,
};
