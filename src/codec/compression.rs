//! Pluggable payload compression, selected by type code.
//!
//! Built in: `0` none, `1` gzip. Additional algorithms are plugged in with
//! [`register_compressor`]. [`COMPRESS_UNSET`] skips the stage, like
//! [`COMPRESS_NONE`], and is what transparent proxies use to forward
//! payloads untouched.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;

use crate::error::{Result, RpcwireError};

/// No compression.
pub const COMPRESS_NONE: u32 = 0;
/// Gzip.
pub const COMPRESS_GZIP: u32 = 1;
/// Not set: compression is skipped.
pub const COMPRESS_UNSET: u32 = u32::MAX;

/// A compression algorithm.
pub trait Compressor: Send + Sync + 'static {
    /// Compress `data`.
    fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>>;
    /// Decompress `data`, producing at most `limit` bytes. Output past the
    /// limit must fail rather than be allocated.
    fn decompress(&self, data: &[u8], limit: usize) -> std::io::Result<Vec<u8>>;
}

/// Gzip via `flate2`.
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn decompress(&self, data: &[u8], limit: usize) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(limit));
        GzDecoder::new(data)
            .take((limit as u64).saturating_add(1))
            .read_to_end(&mut out)?;
        if out.len() > limit {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("gzip payload inflates past {limit} bytes"),
            ));
        }
        Ok(out)
    }
}

fn registry() -> &'static RwLock<HashMap<u32, Arc<dyn Compressor>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<u32, Arc<dyn Compressor>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<u32, Arc<dyn Compressor>> = HashMap::new();
        map.insert(COMPRESS_GZIP, Arc::new(GzipCompressor));
        RwLock::new(map)
    })
}

/// Register (or replace) the compressor for a type code.
///
/// `COMPRESS_NONE` and `COMPRESS_UNSET` are reserved and cannot be replaced.
pub fn register_compressor(compress_type: u32, compressor: Arc<dyn Compressor>) -> Result<()> {
    if is_skipped(compress_type) {
        return Err(RpcwireError::Protocol(format!(
            "compress type {compress_type} is reserved"
        )));
    }
    registry().write().insert(compress_type, compressor);
    Ok(())
}

#[inline]
fn is_skipped(compress_type: u32) -> bool {
    matches!(compress_type, COMPRESS_NONE | COMPRESS_UNSET)
}

fn lookup(compress_type: u32) -> Result<Arc<dyn Compressor>> {
    registry()
        .read()
        .get(&compress_type)
        .cloned()
        .ok_or_else(|| RpcwireError::Protocol(format!("unsupported compress type {compress_type}")))
}

/// Compress `data` with the given type code.
pub fn compress(compress_type: u32, data: Bytes) -> Result<Bytes> {
    if is_skipped(compress_type) || data.is_empty() {
        return Ok(data);
    }
    Ok(Bytes::from(lookup(compress_type)?.compress(&data)?))
}

/// Decompress `data` with the given type code. Output longer than `limit`
/// bytes is an error.
pub fn decompress(compress_type: u32, data: Bytes, limit: usize) -> Result<Bytes> {
    if is_skipped(compress_type) || data.is_empty() {
        return Ok(data);
    }
    let out = lookup(compress_type)?.decompress(&data, limit)?;
    if out.len() > limit {
        return Err(RpcwireError::Protocol(format!(
            "decompressed payload of {} bytes exceeds {limit}",
            out.len()
        )));
    }
    Ok(Bytes::from(out))
}
