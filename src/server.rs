//! Server builder and per-connection loop.
//!
//! The [`ServerBuilder`] registers unary and stream handlers and collects
//! configuration. [`Server::serve_connection`] then runs one connection:
//! 1. Spawn the writer task
//! 2. Read frames with the framer
//! 3. Stream frames go through the stream dispatcher in arrival order
//! 4. Unary requests run as tasks, bounded by a semaphore
//! 5. On EOF or error, every stream of the connection is reset
//!
//! # Example
//!
//! ```ignore
//! use rpcwire::Server;
//!
//! let server = Server::builder()
//!     .unary("/pkg.Echo/Say", |_info, msg: String| async move { Ok(msg) })
//!     .stream("/pkg.Echo/Chat", |mut stream| async move {
//!         while let Some(msg) = stream.recv_msg::<String>().await? {
//!             stream.send_msg(&msg).await?;
//!         }
//!         Ok(())
//!     })
//!     .build();
//!
//! let (read, write) = socket.into_split();
//! server.serve_connection(read, write, peer.to_string()).await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;

use crate::codec::{compress, decompress};
use crate::config::Config;
use crate::context::{sleep_until_opt, ContextPool, DEFAULT_POOL_CAPACITY};
use crate::error::{codes, Result, RpcError, RpcwireError};
use crate::handler::{CallInfo, HandlerRegistry, Reply};
use crate::protocol::{CallType, Frame, FrameParser};
use crate::stream::{ServerStream, StreamDispatcher};
use crate::transport::FrameSender;
use crate::unary::ServerCodec;
use crate::writer::spawn_writer_task;

/// Builder for configuring and creating a [`Server`].
pub struct ServerBuilder {
    registry: HandlerRegistry,
    config: Config,
}

impl ServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            config: Config::default(),
        }
    }

    /// Register a unary handler on typed messages.
    pub fn unary<F, Req, Rsp, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(CallInfo, Req) -> Fut + Send + Sync + 'static,
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        self.registry.register_unary(method, handler);
        self
    }

    /// Register a unary handler on raw body bytes.
    pub fn unary_raw<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(CallInfo, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.registry.register_unary_raw(method, handler);
        self
    }

    /// Register a stream handler.
    pub fn stream<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(ServerStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.registry.register_stream(method, handler);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum frame size.
    ///
    /// Default: 10 MiB
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the receive window granted to each stream. `0` disables flow
    /// control.
    ///
    /// Default: 65535
    pub fn max_window_size(mut self, size: u32) -> Self {
        self.config.stream.max_window_size = size;
        self
    }

    /// Set the fraction of the window consumed before a FEEDBACK is sent.
    ///
    /// Default: 4
    pub fn feedback_divisor(mut self, divisor: u32) -> Self {
        self.config.stream.feedback_divisor = divisor;
        self
    }

    /// Set the maximum number of unary handlers running at once per
    /// connection. Requests beyond it are answered with an overload error.
    ///
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Build the server.
    pub fn build(self) -> Server {
        let handlers = Arc::new(self.registry);
        let dispatcher = StreamDispatcher::new(handlers.clone(), &self.config);
        Server {
            inner: Arc::new(ServerInner {
                unary_codec: ServerCodec::new(self.config.max_frame_size),
                handlers,
                dispatcher,
                pool: ContextPool::new(DEFAULT_POOL_CAPACITY),
                config: self.config,
            }),
        }
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ServerInner {
    handlers: Arc<HandlerRegistry>,
    dispatcher: StreamDispatcher,
    unary_codec: ServerCodec,
    pool: Arc<ContextPool>,
    config: Config,
}

/// A server that can run any number of connections. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Number of open streams from `remote_addr`.
    pub fn active_streams(&self, remote_addr: &str) -> usize {
        self.inner.dispatcher.active_streams(remote_addr)
    }

    /// Serve one connection until the peer goes away.
    ///
    /// `remote_addr` identifies the connection; stream state is keyed by it,
    /// so it must be unique among concurrently served connections. A clean
    /// close by the peer returns `Ok(())`.
    pub async fn serve_connection<R, W>(
        &self,
        mut reader: R,
        writer: W,
        remote_addr: impl Into<String>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let remote_addr = remote_addr.into();
        let (writer, _writer_task) = spawn_writer_task(writer, self.inner.config.writer.into());
        let sender: Arc<dyn FrameSender> = Arc::new(writer);
        let semaphore = Arc::new(Semaphore::new(self.inner.config.max_concurrent_handlers));
        let parser = FrameParser::new(self.inner.config.max_frame_size);

        tracing::debug!("serving connection from {}", remote_addr);
        let err = self
            .read_loop(&mut reader, &parser, &remote_addr, &sender, &semaphore)
            .await;

        let (reason, result) = match err {
            RpcwireError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!("connection from {} closed by peer", remote_addr);
                ("connection closed by peer".to_string(), Ok(()))
            }
            other => {
                tracing::error!("connection from {} failed: {}", remote_addr, other);
                (other.to_string(), Err(other))
            }
        };
        self.inner.dispatcher.handle_conn_error(
            &remote_addr,
            RpcError::framework(codes::STREAM_SERVER_NETWORK_ERR, reason),
        );
        result
    }

    /// Read and dispatch frames until the connection fails.
    async fn read_loop<R>(
        &self,
        reader: &mut R,
        parser: &FrameParser,
        remote_addr: &str,
        sender: &Arc<dyn FrameSender>,
        semaphore: &Arc<Semaphore>,
    ) -> RpcwireError
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = match parser.next_frame(reader).await {
                Ok(frame) => frame,
                Err(e) => return e,
            };

            if frame.header.is_stream() {
                let mut ctx = self.inner.pool.acquire();
                ctx.remote_addr = remote_addr.to_string();
                if let Err(e) = self
                    .inner
                    .dispatcher
                    .handle_frame(&mut ctx, &frame, sender)
                    .await
                {
                    tracing::error!(
                        "dropping stream frame {} from {}: {}",
                        frame.stream_id(),
                        remote_addr,
                        e
                    );
                }
            } else if frame.header.is_unary() {
                self.dispatch_unary(frame, remote_addr, sender, semaphore)
                    .await;
            } else {
                tracing::error!(
                    "dropping frame of unknown type {} from {}",
                    frame.header.frame_type,
                    remote_addr
                );
            }
        }
    }

    /// Run one unary request as a task, or answer with an overload error.
    async fn dispatch_unary(
        &self,
        frame: Frame,
        remote_addr: &str,
        sender: &Arc<dyn FrameSender>,
        semaphore: &Arc<Semaphore>,
    ) {
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!(
                    "handler capacity reached, rejecting request {} from {}",
                    frame.stream_id(),
                    remote_addr
                );
                if let Some(reply) = self.inner.overloaded(&frame, remote_addr) {
                    if let Err(e) = sender.send_frame(reply).await {
                        tracing::error!("failed to send overload response: {}", e);
                    }
                }
                return;
            }
        };

        let inner = self.inner.clone();
        let sender = sender.clone();
        let remote_addr = remote_addr.to_string();
        tokio::spawn(async move {
            let _permit = permit;
            match inner.handle_unary(&frame, &remote_addr).await {
                Ok(Reply::Frame(reply)) => {
                    if let Err(e) = sender.send_frame(reply).await {
                        tracing::error!("failed to send response to {}: {}", remote_addr, e);
                    }
                }
                Ok(Reply::None) => {}
                Err(e) => tracing::error!("dropping response to {}: {}", remote_addr, e),
            }
        });
    }
}

impl ServerInner {
    /// Decode, run and answer one unary request.
    async fn handle_unary(&self, frame: &Frame, remote_addr: &str) -> Result<Reply> {
        let mut ctx = self.pool.acquire();
        ctx.remote_addr = remote_addr.to_string();

        let body = match self.unary_codec.decode(&mut ctx, frame) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("bad request {} from {}: {}", ctx.request_id, remote_addr, e);
                ctx.error = Some(e.into_rpc(codes::SERVER_DECODE_FAIL));
                return Ok(Reply::Frame(self.unary_codec.encode(&mut ctx, b"")?));
            }
        };

        let result = match self.handlers.unary(&ctx.method) {
            None => Err(RpcError::framework(
                codes::SERVER_NO_FUNC,
                format!("no such method: {}", ctx.method),
            )
            .into()),
            Some(handler) => match decompress(
                ctx.effective_compress_type(),
                body,
                self.config.max_frame_size,
            ) {
                Err(e) => Err(e.into_rpc(codes::SERVER_DECODE_FAIL).into()),
                Ok(body) => {
                    let call = handler.call(
                        CallInfo::from_context(&ctx),
                        ctx.effective_serialization_type(),
                        body,
                    );
                    tokio::select! {
                        result = call => result,
                        _ = sleep_until_opt(ctx.deadline) => Err(RpcError::framework(
                            codes::SERVER_TIMEOUT,
                            format!("{} timed out", ctx.method),
                        )
                        .into()),
                    }
                }
            },
        };

        if ctx.call_type == CallType::OneWay {
            if let Err(e) = result {
                tracing::debug!("one-way call {} failed: {}", ctx.method, e);
            }
            return Ok(Reply::None);
        }

        let body = match result.and_then(|body| compress(ctx.effective_compress_type(), body)) {
            Ok(body) => body,
            Err(e) => {
                ctx.error = Some(e.into_rpc(codes::SERVER_SYSTEM_ERR));
                Bytes::new()
            }
        };
        Ok(Reply::Frame(self.unary_codec.encode(&mut ctx, &body)?))
    }

    /// Overload response for a request that will not be run, unless it is
    /// one-way or cannot be decoded at all.
    fn overloaded(&self, frame: &Frame, remote_addr: &str) -> Option<Bytes> {
        let mut ctx = self.pool.acquire();
        ctx.remote_addr = remote_addr.to_string();
        let _ = self.unary_codec.decode(&mut ctx, frame);
        if ctx.call_type == CallType::OneWay {
            return None;
        }
        ctx.error = Some(RpcError::framework(
            codes::SERVER_OVERLOAD,
            "server overloaded",
        ));
        match self.unary_codec.encode(&mut ctx, b"") {
            Ok(reply) => Some(reply),
            Err(e) => {
                tracing::error!("failed to encode overload response: {}", e);
                None
            }
        }
    }
}
