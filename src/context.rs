//! Per-call context and its pool.
//!
//! A [`CallContext`] carries everything the codecs and stream objects read or
//! write for one call: names, types, timeouts, trans-info, the envelopes, the
//! attached error and, for streams, the stream ID. It is passed explicitly by
//! `&mut` through every codec function.
//!
//! Contexts are recycled through a [`ContextPool`]. [`ContextPool::acquire`]
//! hands out a [`PooledContext`] that resets and returns itself to the pool
//! when dropped, so whoever owns the guard owns the release.
//!
//! [`DoneSignal`] is the do-once broadcast used for cancellation and stream
//! teardown.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::codec::{COMPRESS_NONE, SERIALIZATION_MSGPACK};
use crate::error::RpcError;
use crate::protocol::{
    CallType, FrameHeader, RequestEnvelope, ResponseEnvelope, TransInfo, DEFAULT_PROTOCOL_VERSION,
    DYEING_KEY, ENV_TRANSFER_KEY,
};

/// Default number of idle contexts kept by a pool.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// One-shot broadcast signal.
///
/// Firing is idempotent: only the first [`fire`](Self::fire) changes state and
/// wakes waiters, later calls are no-ops. Clones share the same signal.
#[derive(Debug, Clone)]
pub struct DoneSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl DoneSignal {
    /// Create an unfired signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    /// Whether the signal has fired.
    #[inline]
    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for DoneSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata and state of one call, unary or stream.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Header of the frame being processed, if one has been read.
    pub frame_head: Option<FrameHeader>,
    /// Protocol version to stamp on replies.
    pub version: u8,
    /// Unary request ID.
    pub request_id: u32,
    /// Stream ID (stream calls only).
    pub stream_id: u32,
    /// Calling service name.
    pub caller: String,
    /// Called service name.
    pub callee: String,
    /// Method name, e.g. `/pkg.Service/Method`.
    pub method: String,
    /// Serialization type code of the payload.
    pub serialization_type: u32,
    /// Compression type code of the payload.
    pub compress_type: u32,
    /// Server-side serialization override. `Some(SERIALIZATION_UNSET)` skips
    /// (de)serialization.
    pub current_serialization_type: Option<u32>,
    /// Server-side compression override. `Some(COMPRESS_UNSET)` skips
    /// (de)compression.
    pub current_compress_type: Option<u32>,
    /// Call timeout as carried on the wire.
    pub timeout: Option<Duration>,
    /// Local deadline derived from `timeout`.
    pub deadline: Option<Instant>,
    /// Normal or one-way.
    pub call_type: CallType,
    /// Whether the call is dyed.
    pub dyeing: bool,
    /// Dyeing key.
    pub dyeing_key: String,
    /// Environment propagation value.
    pub env_transfer: String,
    /// Free-form metadata.
    pub trans_info: TransInfo,
    /// Unary request envelope.
    pub req_envelope: Option<RequestEnvelope>,
    /// Unary response envelope.
    pub rsp_envelope: Option<ResponseEnvelope>,
    /// Request attachment.
    pub req_attachment: Bytes,
    /// Response attachment.
    pub rsp_attachment: Bytes,
    /// Error attached by a codec or handler.
    pub error: Option<RpcError>,
    /// Remote address of the connection.
    pub remote_addr: String,
    /// Cancellation signal for the call.
    pub cancel: DoneSignal,
}

impl Default for CallContext {
    fn default() -> Self {
        Self {
            frame_head: None,
            version: DEFAULT_PROTOCOL_VERSION,
            request_id: 0,
            stream_id: 0,
            caller: String::new(),
            callee: String::new(),
            method: String::new(),
            serialization_type: SERIALIZATION_MSGPACK,
            compress_type: COMPRESS_NONE,
            current_serialization_type: None,
            current_compress_type: None,
            timeout: None,
            deadline: None,
            call_type: CallType::Normal,
            dyeing: false,
            dyeing_key: String::new(),
            env_transfer: String::new(),
            trans_info: TransInfo::new(),
            req_envelope: None,
            rsp_envelope: None,
            req_attachment: Bytes::new(),
            rsp_attachment: Bytes::new(),
            error: None,
            remote_addr: String::new(),
            cancel: DoneSignal::new(),
        }
    }
}

impl CallContext {
    /// Context for calling `method`.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Self::default()
        }
    }

    /// Set the timeout and derive the local deadline from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.set_timeout(timeout);
        self
    }

    /// Set the timeout and derive the local deadline from now. Zero clears both.
    pub fn set_timeout(&mut self, timeout: Duration) {
        if timeout.is_zero() {
            self.timeout = None;
            self.deadline = None;
        } else {
            self.timeout = Some(timeout);
            self.deadline = Some(Instant::now() + timeout);
        }
    }

    /// Timeout in whole milliseconds as carried in envelopes.
    pub fn timeout_ms(&self) -> u32 {
        self.timeout
            .map(|t| t.as_millis().min(u32::MAX as u128) as u32)
            .unwrap_or(0)
    }

    /// Serialization type actually used for payloads.
    #[inline]
    pub fn effective_serialization_type(&self) -> u32 {
        self.current_serialization_type
            .unwrap_or(self.serialization_type)
    }

    /// Compression type actually used for payloads.
    #[inline]
    pub fn effective_compress_type(&self) -> u32 {
        self.current_compress_type.unwrap_or(self.compress_type)
    }

    /// Trans-info to send: the context's map plus the dyeing key and
    /// environment value under their reserved keys.
    pub fn outbound_trans_info(&self) -> TransInfo {
        let mut trans_info = self.trans_info.clone();
        if self.dyeing && !self.dyeing_key.is_empty() {
            trans_info.insert(DYEING_KEY.to_string(), self.dyeing_key.as_bytes().to_vec().into());
        }
        if !self.env_transfer.is_empty() {
            trans_info.insert(
                ENV_TRANSFER_KEY.to_string(),
                self.env_transfer.as_bytes().to_vec().into(),
            );
        }
        trans_info
    }

    /// Pick the dyeing key and environment value out of received trans-info.
    pub fn absorb_trans_info(&mut self, trans_info: &TransInfo) {
        self.trans_info.clone_from(trans_info);
        if let Some(key) = trans_info.get(DYEING_KEY) {
            self.dyeing_key = String::from_utf8_lossy(key).into_owned();
        }
        if let Some(env) = trans_info.get(ENV_TRANSFER_KEY) {
            self.env_transfer = String::from_utf8_lossy(env).into_owned();
        }
    }

    /// Minimal context addressing one stream, for frames sent outside the
    /// owning task (feedback, final close).
    pub fn for_stream(remote_addr: &str, stream_id: u32, version: u8) -> Self {
        Self {
            remote_addr: remote_addr.to_string(),
            stream_id,
            version,
            ..Self::default()
        }
    }

    /// Wait until the call is canceled or its deadline passes, and report which.
    pub async fn done(&self) -> RpcError {
        use crate::error::codes;

        let deadline = self.deadline;
        tokio::select! {
            _ = self.cancel.wait() => {
                RpcError::framework(codes::CLIENT_CANCELED, "call canceled")
            }
            _ = sleep_until_opt(deadline) => {
                RpcError::framework(codes::CLIENT_INVOKE_TIMEOUT, "call timed out")
            }
        }
    }

    /// Clear every field back to the defaults, with a fresh cancel signal.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Pool of reusable contexts.
#[derive(Debug)]
pub struct ContextPool {
    idle: Mutex<Vec<CallContext>>,
    capacity: usize,
}

impl ContextPool {
    /// Create a pool keeping at most `capacity` idle contexts.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::with_capacity(capacity.min(64))),
            capacity,
        })
    }

    /// Take a reset context from the pool, allocating if it is empty.
    pub fn acquire(self: &Arc<Self>) -> PooledContext {
        let ctx = self.idle.lock().pop().unwrap_or_default();
        PooledContext {
            ctx: Some(ctx),
            pool: Arc::clone(self),
        }
    }

    /// Number of idle contexts.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, mut ctx: CallContext) {
        ctx.reset();
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push(ctx);
        }
    }
}

/// A context on loan from a [`ContextPool`]; returned on drop.
#[derive(Debug)]
pub struct PooledContext {
    ctx: Option<CallContext>,
    pool: Arc<ContextPool>,
}

impl Deref for PooledContext {
    type Target = CallContext;

    fn deref(&self) -> &CallContext {
        // Only `Drop` takes the context out.
        self.ctx.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledContext {
    fn deref_mut(&mut self) -> &mut CallContext {
        self.ctx.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.pool.release(ctx);
        }
    }
}
