//! Two-level `remote address -> stream ID -> value` map.
//!
//! Used by the server side for both the INIT metadata store and the live
//! stream table. The map is never exposed; callers go through store, load
//! and remove so the two-level key stays encapsulated.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Result, RpcwireError};

/// Concurrency-safe map keyed by `(remote address, stream ID)`.
#[derive(Debug)]
pub struct StreamRegistry<T> {
    inner: RwLock<HashMap<String, HashMap<u32, T>>>,
}

impl<T: Clone> StreamRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a value.
    pub fn store(&self, addr: &str, stream_id: u32, value: T) {
        self.inner
            .write()
            .entry(addr.to_string())
            .or_default()
            .insert(stream_id, value);
    }

    /// Look up a value, telling an unknown address apart from an unknown stream.
    pub fn load(&self, addr: &str, stream_id: u32) -> Result<T> {
        let inner = self.inner.read();
        let streams = inner
            .get(addr)
            .ok_or_else(|| RpcwireError::NoSuchAddr(addr.to_string()))?;
        streams
            .get(&stream_id)
            .cloned()
            .ok_or_else(|| RpcwireError::NoSuchStream {
                addr: addr.to_string(),
                stream_id,
            })
    }

    /// Remove one value. Drops the address entry when it becomes empty.
    pub fn remove(&self, addr: &str, stream_id: u32) -> Option<T> {
        let mut inner = self.inner.write();
        let streams = inner.get_mut(addr)?;
        let value = streams.remove(&stream_id);
        if streams.is_empty() {
            inner.remove(addr);
        }
        value
    }

    /// Remove every value under `addr`.
    pub fn remove_addr(&self, addr: &str) -> Vec<(u32, T)> {
        self.inner
            .write()
            .remove(addr)
            .map(|streams| streams.into_iter().collect())
            .unwrap_or_default()
    }

    /// Whether a value is present.
    pub fn contains(&self, addr: &str, stream_id: u32) -> bool {
        self.inner
            .read()
            .get(addr)
            .is_some_and(|streams| streams.contains_key(&stream_id))
    }

    /// Number of values under `addr`.
    pub fn count(&self, addr: &str) -> usize {
        self.inner.read().get(addr).map_or(0, HashMap::len)
    }
}

impl<T: Clone> Default for StreamRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
