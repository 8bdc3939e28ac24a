//! Handler registry for dispatching calls by method name.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::CallInfo;
use crate::codec::{is_passthrough, marshal, unmarshal};
use crate::error::{codes, Result, RpcwireError};
use crate::stream::ServerStream;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A unary method implementation working on serialized bodies.
pub trait UnaryHandler: Send + Sync + 'static {
    /// Handle one request body encoded with `serialization_type` and return
    /// the response body in the same encoding.
    fn call(
        &self,
        info: CallInfo,
        serialization_type: u32,
        body: Bytes,
    ) -> BoxFuture<'static, Result<Bytes>>;
}

/// Wrapper that deserializes the request and serializes the response.
pub struct TypedUnaryHandler<F, Req, Rsp, Fut> {
    handler: F,
    _phantom: PhantomData<fn(Req) -> (Rsp, Fut)>,
}

impl<F, Req, Rsp, Fut> TypedUnaryHandler<F, Req, Rsp, Fut>
where
    F: Fn(CallInfo, Req) -> Fut + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Rsp: Serialize + Send + 'static,
    Fut: Future<Output = Result<Rsp>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Req, Rsp, Fut> UnaryHandler for TypedUnaryHandler<F, Req, Rsp, Fut>
where
    F: Fn(CallInfo, Req) -> Fut + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Rsp: Serialize + Send + 'static,
    Fut: Future<Output = Result<Rsp>> + Send + 'static,
{
    fn call(
        &self,
        info: CallInfo,
        serialization_type: u32,
        body: Bytes,
    ) -> BoxFuture<'static, Result<Bytes>> {
        if is_passthrough(serialization_type) {
            let err: RpcwireError = RpcwireError::Protocol(format!(
                "typed handler for {} cannot take serialization type {serialization_type}",
                info.method
            ))
            .into_rpc(codes::SERVER_DECODE_FAIL)
            .into();
            return Box::pin(async move { Err::<Bytes, _>(err) });
        }
        let req: Req = match unmarshal(serialization_type, &body) {
            Ok(v) => v,
            Err(e) => {
                let err: RpcwireError = e.into_rpc(codes::SERVER_DECODE_FAIL).into();
                return Box::pin(async move { Err::<Bytes, _>(err) });
            }
        };

        let fut = (self.handler)(info, req);
        Box::pin(async move {
            let rsp = fut.await?;
            marshal(serialization_type, &rsp)
                .map_err(|e| RpcwireError::from(e.into_rpc(codes::SERVER_ENCODE_FAIL)))
        })
    }
}

/// Wrapper for handlers that work on raw body bytes.
pub struct RawUnaryHandler<F, Fut> {
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> RawUnaryHandler<F, Fut>
where
    F: Fn(CallInfo, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    /// Create a new raw handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> UnaryHandler for RawUnaryHandler<F, Fut>
where
    F: Fn(CallInfo, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    fn call(&self, info: CallInfo, _: u32, body: Bytes) -> BoxFuture<'static, Result<Bytes>> {
        Box::pin((self.handler)(info, body))
    }
}

/// A stream method implementation. Owns the stream for its lifetime.
pub trait StreamHandler: Send + Sync + 'static {
    /// Run the handler. The returned result decides how the stream is closed.
    fn call(&self, stream: ServerStream) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> StreamHandler for F
where
    F: Fn(ServerStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, stream: ServerStream) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(stream))
    }
}

/// Registry mapping method names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    unary: HashMap<String, Arc<dyn UnaryHandler>>,
    streams: HashMap<String, Arc<dyn StreamHandler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed unary handler.
    pub fn register_unary<F, Req, Rsp, Fut>(&mut self, method: &str, handler: F)
    where
        F: Fn(CallInfo, Req) -> Fut + Send + Sync + 'static,
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        self.unary
            .insert(method.to_string(), Arc::new(TypedUnaryHandler::new(handler)));
    }

    /// Register a unary handler on raw body bytes.
    pub fn register_unary_raw<F, Fut>(&mut self, method: &str, handler: F)
    where
        F: Fn(CallInfo, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.unary
            .insert(method.to_string(), Arc::new(RawUnaryHandler::new(handler)));
    }

    /// Register a stream handler.
    pub fn register_stream<F, Fut>(&mut self, method: &str, handler: F)
    where
        F: Fn(ServerStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.streams.insert(method.to_string(), Arc::new(handler));
    }

    /// Unary handler for `method`.
    pub fn unary(&self, method: &str) -> Option<Arc<dyn UnaryHandler>> {
        self.unary.get(method).cloned()
    }

    /// Stream handler for `method`.
    pub fn stream(&self, method: &str) -> Option<Arc<dyn StreamHandler>> {
        self.streams.get(method).cloned()
    }

    /// Every registered method name, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .unary
            .keys()
            .chain(self.streams.keys())
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names
    }
}
