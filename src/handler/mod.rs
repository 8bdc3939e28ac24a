//! Handler module - method-keyed dispatch targets.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps method names to unary and stream handlers
//! - [`CallInfo`] - the call metadata a unary handler sees
//! - [`Reply`] - what the server sends back for one inbound frame
//!
//! # Example
//!
//! ```ignore
//! use rpcwire::handler::HandlerRegistry;
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.register_unary("/pkg.Echo/Say", |_info, msg: String| async move { Ok(msg) });
//!
//! registry.register_stream("/pkg.Echo/Chat", |mut stream| async move {
//!     while let Some(msg) = stream.recv_msg::<String>().await? {
//!         stream.send_msg(&msg).await?;
//!     }
//!     Ok(())
//! });
//! ```

mod registry;

pub use registry::{
    BoxFuture, HandlerRegistry, RawUnaryHandler, StreamHandler, TypedUnaryHandler, UnaryHandler,
};

use bytes::Bytes;
use tokio::time::Instant;

use crate::context::CallContext;
use crate::protocol::TransInfo;

/// Result of handling one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Nothing to send back (one-way calls, stream frames, anything already
    /// sent by the dispatcher).
    None,
    /// A complete frame to write.
    Frame(Bytes),
}

/// Call metadata handed to unary handlers.
#[derive(Debug, Clone, Default)]
pub struct CallInfo {
    /// Method name.
    pub method: String,
    /// Calling service.
    pub caller: String,
    /// Called service.
    pub callee: String,
    /// Received trans-info.
    pub trans_info: TransInfo,
    /// Peer address.
    pub remote_addr: String,
    /// Deadline derived from the request timeout.
    pub deadline: Option<Instant>,
}

impl CallInfo {
    /// Snapshot of the metadata in `ctx`.
    pub fn from_context(ctx: &CallContext) -> Self {
        Self {
            method: ctx.method.clone(),
            caller: ctx.caller.clone(),
            callee: ctx.callee.clone(),
            trans_info: ctx.trans_info.clone(),
            remote_addr: ctx.remote_addr.clone(),
            deadline: ctx.deadline,
        }
    }
}
