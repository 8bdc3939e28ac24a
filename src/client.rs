//! Client builder and call API.
//!
//! The [`ClientBuilder`] collects configuration and stream interceptors and
//! attaches a [`Client`] to one connection. The client multiplexes unary
//! calls and streams over that connection:
//! - unary calls are matched to responses by request ID
//! - streams are matched by stream ID and get their own dispatch task
//!
//! # Example
//!
//! ```ignore
//! use rpcwire::{CallContext, Client, StreamDesc};
//!
//! let (read, write) = socket.into_split();
//! let client = Client::builder().caller("demo.client").connect(read, write);
//!
//! let mut ctx = CallContext::new("/pkg.Echo/Say").with_timeout(Duration::from_secs(1));
//! let reply: String = client.invoke(&mut ctx, &"hi".to_string()).await?;
//!
//! let mut ctx = CallContext::new("/pkg.Echo/Chat");
//! let stream = client.new_stream(&mut ctx, &StreamDesc::bidi("/pkg.Echo/Chat")).await?;
//! stream.send_msg(&"hello".to_string()).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{compress, decompress, marshal, unmarshal};
use crate::config::Config;
use crate::context::CallContext;
use crate::error::{codes, Result, RpcError};
use crate::protocol::CallType;
use crate::stream::{ClientStream, StreamClient, StreamDesc, StreamInterceptor};
use crate::transport::ClientConn;
use crate::unary::ClientCodec;

/// Builder for configuring and creating a [`Client`].
pub struct ClientBuilder {
    config: Config,
    caller: String,
    interceptors: Vec<Arc<dyn StreamInterceptor>>,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            caller: String::new(),
            interceptors: Vec::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Service name sent as the caller when a context does not set one.
    pub fn caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }

    /// Append a stream interceptor. Interceptors run in the order added.
    pub fn interceptor(mut self, interceptor: impl StreamInterceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Set the maximum frame size.
    ///
    /// Default: 10 MiB
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the receive window requested for each stream. `0` disables flow
    /// control.
    ///
    /// Default: 65535
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.config.stream.initial_window_size = size;
        self
    }

    /// Set the fraction of the window consumed before a FEEDBACK is sent.
    ///
    /// Default: 4
    pub fn feedback_divisor(mut self, divisor: u32) -> Self {
        self.config.stream.feedback_divisor = divisor;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Attach to a connection. Must be called inside a tokio runtime.
    pub fn connect<R, W>(self, reader: R, writer: W) -> Client
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let conn = ClientConn::spawn(reader, writer, &self.config);
        let streams = StreamClient::new(
            conn.clone(),
            &self.config,
            self.caller.clone(),
            self.interceptors,
        );
        Client {
            codec: ClientCodec::new(self.config.max_frame_size),
            conn,
            streams,
            caller: self.caller,
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Client end of one connection.
pub struct Client {
    conn: Arc<ClientConn>,
    codec: ClientCodec,
    streams: StreamClient,
    caller: String,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Call a unary method with typed messages.
    pub async fn invoke<Req, Rsp>(&self, ctx: &mut CallContext, req: &Req) -> Result<Rsp>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        let body = marshal(ctx.serialization_type, req)
            .map_err(|e| e.into_rpc(codes::CLIENT_ENCODE_FAIL))?;
        let rsp = self.invoke_raw(ctx, body).await?;
        Ok(unmarshal(ctx.serialization_type, &rsp)
            .map_err(|e| e.into_rpc(codes::CLIENT_DECODE_FAIL))?)
    }

    /// Call a unary method with an already-serialized body.
    ///
    /// A non-zero return code in the response comes back as an
    /// [`RpcError`] and is also left on `ctx.error`.
    pub async fn invoke_raw(&self, ctx: &mut CallContext, body: Bytes) -> Result<Bytes> {
        self.fill_caller(ctx);
        ctx.call_type = CallType::Normal;
        let body = compress(ctx.compress_type, body)
            .map_err(|e| e.into_rpc(codes::CLIENT_ENCODE_FAIL))?;
        let frame = self
            .codec
            .encode(ctx, &body)
            .map_err(|e| e.into_rpc(codes::CLIENT_ENCODE_FAIL))?;

        let (route, rx) = self.conn.register_unary(ctx.request_id)?;
        self.conn.send(frame).await?;

        let frame = tokio::select! {
            rsp = rx => rsp.map_err(|_| {
                RpcError::framework(codes::CLIENT_NET_ERR, "connection closed before response")
            })?,
            err = ctx.done() => return Err(err.into()),
        };
        drop(route);

        let body = self
            .codec
            .decode(ctx, &frame)
            .map_err(|e| e.into_rpc(codes::CLIENT_DECODE_FAIL))?;
        if let Some(err) = ctx.error.clone() {
            return Err(err.into());
        }
        Ok(decompress(ctx.compress_type, body, self.codec.max_frame_size())
            .map_err(|e| e.into_rpc(codes::CLIENT_DECODE_FAIL))?)
    }

    /// Send a one-way request. No response is expected or awaited.
    pub async fn send_oneway(&self, ctx: &mut CallContext, body: Bytes) -> Result<()> {
        self.fill_caller(ctx);
        ctx.call_type = CallType::OneWay;
        let body = compress(ctx.compress_type, body)?;
        let frame = self
            .codec
            .encode(ctx, &body)
            .map_err(|e| e.into_rpc(codes::CLIENT_ENCODE_FAIL))?;
        self.conn.send(frame).await
    }

    /// Open a stream. Returns once the server has accepted it.
    pub async fn new_stream(&self, ctx: &mut CallContext, desc: &StreamDesc) -> Result<ClientStream> {
        self.streams.new_stream(ctx, desc).await
    }

    /// Whether the connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Stop reading from the connection and fail everything in flight.
    pub fn close(&self) {
        self.conn.close();
    }

    fn fill_caller(&self, ctx: &mut CallContext) {
        if ctx.caller.is_empty() {
            ctx.caller.clone_from(&self.caller);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcwireError;
    use crate::protocol::read_frame;
    use crate::unary::ServerCodec;
    use tokio::io::{duplex, AsyncWriteExt};

    #[test]
    fn test_builder_method_chaining() {
        let builder = Client::builder()
            .caller("svc.a")
            .max_frame_size(1 << 16)
            .initial_window_size(0)
            .feedback_divisor(8)
            .max_pending_frames(16)
            .backpressure_timeout(Duration::from_millis(100));
        assert_eq!(builder.caller, "svc.a");
        assert_eq!(builder.config.max_frame_size, 1 << 16);
        assert_eq!(builder.config.stream.initial_window_size, 0);
        assert_eq!(builder.config.stream.feedback_divisor, 8);
        assert_eq!(builder.config.writer.max_pending_frames, 16);
        assert_eq!(builder.config.writer.backpressure_timeout_ms, 100);
    }

    #[tokio::test]
    async fn test_invoke_timeout() {
        let (client_io, _server_io) = duplex(1 << 16);
        let (read, write) = tokio::io::split(client_io);
        let client = Client::builder().connect(read, write);

        let mut ctx = CallContext::new("/pkg.S/Slow").with_timeout(Duration::from_millis(20));
        let err = client
            .invoke::<_, String>(&mut ctx, &"x".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.as_rpc().map(|e| e.code), Some(codes::CLIENT_INVOKE_TIMEOUT));
    }

    #[tokio::test]
    async fn test_invoke_cancel() {
        let (client_io, _server_io) = duplex(1 << 16);
        let (read, write) = tokio::io::split(client_io);
        let client = Client::builder().connect(read, write);

        let mut ctx = CallContext::new("/pkg.S/Slow");
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.fire();
        });
        let err = client.invoke_raw(&mut ctx, Bytes::new()).await.unwrap_err();
        assert_eq!(err.as_rpc().map(|e| e.code), Some(codes::CLIENT_CANCELED));
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending_call() {
        let (client_io, server_io) = duplex(1 << 16);
        let (read, write) = tokio::io::split(client_io);
        let client = Client::builder().connect(read, write);

        let (mut sread, swrite) = tokio::io::split(server_io);
        let call = tokio::spawn(async move {
            let mut ctx = CallContext::new("/pkg.S/M");
            client.invoke_raw(&mut ctx, Bytes::new()).await
        });
        read_frame(&mut sread, 1 << 20).await.unwrap();
        drop(sread);
        drop(swrite);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            RpcwireError::Rpc(RpcError { code: codes::CLIENT_NET_ERR, .. })
        ));
    }

    #[tokio::test]
    async fn test_oneway_carries_call_type() {
        let (client_io, server_io) = duplex(1 << 16);
        let (read, write) = tokio::io::split(client_io);
        let client = Client::builder().caller("svc.a").connect(read, write);

        let mut ctx = CallContext::new("/pkg.S/Notify");
        client
            .send_oneway(&mut ctx, Bytes::from_static(b"ping"))
            .await
            .unwrap();

        let (mut sread, mut swrite) = tokio::io::split(server_io);
        let frame = read_frame(&mut sread, 1 << 20).await.unwrap();
        let mut sctx = CallContext::default();
        let body = ServerCodec::default().decode(&mut sctx, &frame).unwrap();
        assert_eq!(&body[..], b"ping");
        assert_eq!(sctx.call_type, CallType::OneWay);
        assert_eq!(sctx.caller, "svc.a");
        swrite.shutdown().await.unwrap();
    }
}
