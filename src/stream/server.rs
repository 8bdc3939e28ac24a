//! Server side of streams.
//!
//! [`StreamDispatcher`] receives decoded stream frames for a connection and
//! owns the live stream table. Every INIT spawns one handler task that owns a
//! [`ServerStream`]; DATA and CLOSE are pushed onto that stream's receive
//! queue, FEEDBACK refills its send window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::codec::{reset_meta, ServerStreamCodec, StreamMsg};
use super::flow_control::{
    negotiate_window, ReceiveControl, SendControl, DEFAULT_WINDOW_SIZE,
};
use super::queue::BlockingQueue;
use super::registry::StreamRegistry;
use super::{feedback_fn, window_len, RecvItem};
use crate::codec::{compress, decompress, marshal, unmarshal};
use crate::config::{Config, StreamConfig};
use crate::context::{CallContext, ContextPool, DoneSignal, PooledContext, DEFAULT_POOL_CAPACITY};
use crate::error::{codes, Result, RpcError, RpcwireError};
use crate::handler::{HandlerRegistry, Reply, StreamHandler};
use crate::protocol::{
    CloseType, Frame, StreamCloseMeta, StreamFeedbackMeta, StreamFrameType, StreamInitMeta,
    StreamInitResponseMeta,
};
use crate::transport::FrameSender;

/// State of one live stream shared by the dispatcher and the handler task.
struct StreamShared {
    stream_id: u32,
    remote_addr: String,
    version: u8,
    queue: BlockingQueue<RecvItem>,
    send_ctl: Option<SendControl>,
    recv_ctl: Option<ReceiveControl>,
    done: DoneSignal,
    close_sent: AtomicBool,
    error: Mutex<Option<RpcError>>,
}

impl StreamShared {
    fn closed_error(&self) -> RpcwireError {
        self.error
            .lock()
            .clone()
            .map_or(RpcwireError::StreamClosed, RpcwireError::Rpc)
    }

    fn fail(&self, err: RpcError) {
        self.error.lock().get_or_insert(err.clone());
        self.queue.push(RecvItem::Reset(err));
        self.done.fire();
    }
}

type StreamTable = StreamRegistry<Arc<StreamShared>>;

/// Routes stream frames of every connection of a server to their streams.
pub struct StreamDispatcher {
    streams: Arc<StreamTable>,
    codec: ServerStreamCodec,
    handlers: Arc<HandlerRegistry>,
    config: StreamConfig,
    pool: Arc<ContextPool>,
}

impl StreamDispatcher {
    /// Create a dispatcher over `handlers`.
    pub fn new(handlers: Arc<HandlerRegistry>, config: &Config) -> Self {
        Self {
            streams: Arc::new(StreamRegistry::new()),
            codec: ServerStreamCodec::new(config.max_frame_size),
            handlers,
            config: config.stream,
            pool: ContextPool::new(DEFAULT_POOL_CAPACITY),
        }
    }

    /// The codec frames must be decoded with before [`handle`](Self::handle).
    pub fn codec(&self) -> &ServerStreamCodec {
        &self.codec
    }

    /// Decode a stream frame from `ctx.remote_addr` and handle it.
    pub async fn handle_frame(
        &self,
        ctx: &mut CallContext,
        frame: &Frame,
        sender: &Arc<dyn FrameSender>,
    ) -> Result<Reply> {
        let kind = frame.header.stream_frame();
        if kind == Some(StreamFrameType::Init) {
            self.check_not_open(&ctx.remote_addr, frame.stream_id())?;
        }
        let msg = match self.codec.decode(ctx, frame) {
            Ok(msg) => msg,
            // The server's own CLOSE can cross the client's CLOSE or FEEDBACK
            // on the wire.
            Err(RpcwireError::UninitializedMeta { addr, stream_id })
                if matches!(kind, Some(StreamFrameType::Close | StreamFrameType::Feedback)) =>
            {
                tracing::debug!(
                    "{:?} for stream {} from {} after it finished",
                    kind,
                    stream_id,
                    addr
                );
                return Ok(Reply::None);
            }
            Err(e) => return Err(e),
        };
        self.handle(ctx, msg, sender).await
    }

    /// Handle one decoded stream message. Replies are written through
    /// `sender` by the dispatcher itself, so the result is always
    /// [`Reply::None`] on success.
    pub async fn handle(
        &self,
        ctx: &mut CallContext,
        msg: StreamMsg,
        sender: &Arc<dyn FrameSender>,
    ) -> Result<Reply> {
        match msg {
            StreamMsg::Init(meta) => self.handle_init(ctx, meta, sender).await,
            StreamMsg::Data(body) => self.handle_data(ctx, body),
            StreamMsg::Close(_) => self.handle_close(ctx),
            StreamMsg::Feedback(meta) => self.handle_feedback(ctx, meta),
        }
    }

    async fn handle_init(
        &self,
        ctx: &mut CallContext,
        meta: StreamInitMeta,
        sender: &Arc<dyn FrameSender>,
    ) -> Result<Reply> {
        let addr = ctx.remote_addr.clone();
        let stream_id = ctx.stream_id;

        let Some(handler) = self.handlers.stream(&ctx.method) else {
            tracing::warn!(
                "no stream handler for {} (stream {} from {})",
                ctx.method,
                stream_id,
                addr
            );
            let rsp = StreamInitMeta {
                response_meta: Some(StreamInitResponseMeta {
                    ret: codes::SERVER_NO_FUNC,
                    error_msg: format!("no such stream method: {}", ctx.method),
                }),
                ..StreamInitMeta::default()
            };
            let frame = self.codec.encode(ctx, &StreamMsg::Init(rsp))?;
            self.codec.forget(&addr, stream_id);
            sender.send_frame(frame.data).await?;
            return Ok(Reply::None);
        };

        self.check_not_open(&addr, stream_id)?;

        let mut stream_ctx = self.pool.acquire();
        *stream_ctx = ctx.clone();

        let requested = meta
            .init_window_size
            .map_or(DEFAULT_WINDOW_SIZE as u64, u64::from);
        let send_window = negotiate_window(requested);
        let recv_window = negotiate_window(self.config.max_window_size as u64);
        let flow = send_window != 0 && recv_window != 0;

        let done = DoneSignal::new();
        let send_ctl =
            flow.then(|| SendControl::new(send_window, done.clone(), stream_ctx.cancel.clone()));
        let recv_ctl = flow.then(|| {
            let codec = self.codec.clone();
            let feedback_ctx = CallContext::for_stream(&addr, stream_id, ctx.version);
            ReceiveControl::new(
                recv_window,
                self.config.feedback_divisor,
                feedback_fn(sender.clone(), move |msg| codec.encode(&feedback_ctx, msg)),
            )
        });

        let shared = Arc::new(StreamShared {
            stream_id,
            remote_addr: addr.clone(),
            version: ctx.version,
            queue: BlockingQueue::new(done.clone()),
            send_ctl,
            recv_ctl,
            done,
            close_sent: AtomicBool::new(false),
            error: Mutex::new(None),
        });
        self.streams.store(&addr, stream_id, shared.clone());

        let rsp = StreamInitMeta {
            response_meta: Some(StreamInitResponseMeta::default()),
            init_window_size: Some(if flow { recv_window } else { 0 }),
            content_type: ctx.serialization_type,
            content_encoding: ctx.compress_type,
            ..StreamInitMeta::default()
        };
        let sent = match self.codec.encode(ctx, &StreamMsg::Init(rsp)) {
            Ok(frame) => sender.send_frame(frame.data).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            if remove_if_same(&self.streams, &shared) {
                self.codec.forget(&addr, stream_id);
            }
            return Err(e);
        }

        tracing::debug!(
            "stream {} from {} opened for {} (send window {}, recv window {})",
            stream_id,
            addr,
            ctx.method,
            send_window,
            recv_window
        );

        let stream = ServerStream {
            ctx: stream_ctx,
            shared: shared.clone(),
            codec: self.codec.clone(),
            sender: sender.clone(),
            terminal: None,
        };
        tokio::spawn(run_handler(
            handler,
            stream,
            self.streams.clone(),
            self.codec.clone(),
            sender.clone(),
            shared,
        ));
        Ok(Reply::None)
    }

    fn check_not_open(&self, addr: &str, stream_id: u32) -> Result<()> {
        if self.streams.contains(addr, stream_id) {
            return Err(RpcwireError::Protocol(format!(
                "stream {stream_id} from {addr} is already open"
            )));
        }
        Ok(())
    }

    fn handle_data(&self, ctx: &CallContext, body: Bytes) -> Result<Reply> {
        let stream = self.streams.load(&ctx.remote_addr, ctx.stream_id)?;
        stream.queue.push(RecvItem::Data(body));
        Ok(Reply::None)
    }

    fn handle_close(&self, ctx: &mut CallContext) -> Result<Reply> {
        let stream = match self.streams.load(&ctx.remote_addr, ctx.stream_id) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!("close for a stream that is already gone: {}", e);
                return Ok(Reply::None);
            }
        };
        match ctx.error.take() {
            Some(err) => {
                tracing::debug!(
                    "stream {} from {} reset by client: {}",
                    ctx.stream_id,
                    ctx.remote_addr,
                    err
                );
                stream.fail(err);
            }
            None => stream.queue.push(RecvItem::Eof),
        }
        Ok(Reply::None)
    }

    fn handle_feedback(&self, ctx: &CallContext, meta: StreamFeedbackMeta) -> Result<Reply> {
        let stream = self.streams.load(&ctx.remote_addr, ctx.stream_id)?;
        if let Some(ctl) = &stream.send_ctl {
            ctl.update_window(meta.window_size_increment);
        }
        Ok(Reply::None)
    }

    /// Tear down every stream of `addr` after its connection failed.
    pub fn handle_conn_error(&self, addr: &str, err: RpcError) {
        let streams = self.streams.remove_addr(addr);
        if !streams.is_empty() {
            tracing::debug!("connection {} lost, resetting {} streams: {}", addr, streams.len(), err);
        }
        for (_, stream) in streams {
            stream.close_sent.store(true, Ordering::Release);
            stream.fail(err.clone());
        }
        self.codec.forget_addr(addr);
    }

    /// Number of live streams from `addr`.
    pub fn active_streams(&self, addr: &str) -> usize {
        self.streams.count(addr)
    }
}

fn remove_if_same(streams: &StreamTable, shared: &Arc<StreamShared>) -> bool {
    let same = streams
        .load(&shared.remote_addr, shared.stream_id)
        .is_ok_and(|s| Arc::ptr_eq(&s, shared));
    if same {
        streams.remove(&shared.remote_addr, shared.stream_id);
    }
    same
}

/// Unregisters the stream and fires its done signal however the handler
/// task ends.
struct Teardown {
    streams: Arc<StreamTable>,
    codec: ServerStreamCodec,
    shared: Arc<StreamShared>,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if remove_if_same(&self.streams, &self.shared) {
            self.codec.forget(&self.shared.remote_addr, self.shared.stream_id);
        }
        self.shared.done.fire();
    }
}

async fn run_handler(
    handler: Arc<dyn StreamHandler>,
    stream: ServerStream,
    streams: Arc<StreamTable>,
    codec: ServerStreamCodec,
    sender: Arc<dyn FrameSender>,
    shared: Arc<StreamShared>,
) {
    let _teardown = Teardown {
        streams: streams.clone(),
        codec: codec.clone(),
        shared: shared.clone(),
    };

    let result = handler.call(stream).await;
    remove_if_same(&streams, &shared);

    if shared.close_sent.swap(true, Ordering::AcqRel) {
        codec.forget(&shared.remote_addr, shared.stream_id);
        return;
    }

    let meta = match result {
        Ok(()) => StreamCloseMeta {
            close_type: CloseType::Close.as_i32(),
            ..StreamCloseMeta::default()
        },
        Err(RpcwireError::Rpc(err)) => reset_meta(&err),
        Err(other) => StreamCloseMeta {
            close_type: CloseType::Reset.as_i32(),
            ret: 0,
            msg: other.to_string(),
            ..StreamCloseMeta::default()
        },
    };

    let ctx = CallContext::for_stream(&shared.remote_addr, shared.stream_id, shared.version);
    let sent = match codec.encode(&ctx, &StreamMsg::Close(meta)) {
        Ok(frame) => sender.send_frame(frame.data).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        tracing::error!(
            "failed to send close for stream {} to {}: {}",
            shared.stream_id,
            shared.remote_addr,
            e
        );
        shared
            .error
            .lock()
            .get_or_insert(e.into_rpc(codes::STREAM_SERVER_NETWORK_ERR));
    }
}

/// The server end of one stream, owned by its handler.
pub struct ServerStream {
    ctx: PooledContext,
    shared: Arc<StreamShared>,
    codec: ServerStreamCodec,
    sender: Arc<dyn FrameSender>,
    terminal: Option<Option<RpcError>>,
}

impl ServerStream {
    /// Call metadata of the stream.
    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    /// Mutable call metadata, e.g. to override the serialization or
    /// compression type used for sending and receiving.
    pub fn context_mut(&mut self) -> &mut CallContext {
        &mut self.ctx
    }

    /// Stream ID.
    pub fn stream_id(&self) -> u32 {
        self.shared.stream_id
    }

    /// Method name from INIT.
    pub fn method(&self) -> &str {
        &self.ctx.method
    }

    /// Whether the stream has ended.
    pub fn is_closed(&self) -> bool {
        self.shared.done.is_fired() || self.shared.close_sent.load(Ordering::Acquire)
    }

    /// Serialize and send one message.
    pub async fn send_msg<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let body = marshal(self.ctx.effective_serialization_type(), msg)?;
        self.send_bytes(body).await
    }

    /// Send one already-serialized message.
    ///
    /// Fails with the stream's error if the context carries one; the peer
    /// then receives a RESET instead of the data and the stream is closed.
    pub async fn send_bytes(&mut self, body: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(self.shared.closed_error());
        }
        let body = compress(self.ctx.effective_compress_type(), body)?;
        if let Some(ctl) = &self.shared.send_ctl {
            ctl.get_window(window_len(&body)).await?;
        }

        let frame = self.codec.encode(&self.ctx, &StreamMsg::Data(body))?;
        if frame.kind == StreamFrameType::Close {
            self.shared.close_sent.store(true, Ordering::Release);
            self.sender.send_frame(frame.data).await?;
            return Err(self
                .ctx
                .error
                .clone()
                .map_or(RpcwireError::StreamClosed, RpcwireError::Rpc));
        }
        self.sender.send_frame(frame.data).await
    }

    /// Reset the stream with `err`. The handler should return afterwards.
    pub async fn abort(&mut self, err: RpcError) -> Result<()> {
        if self.shared.close_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.ctx.error = Some(err);
        let frame = self.codec.encode(&self.ctx, &StreamMsg::Data(Bytes::new()))?;
        self.sender.send_frame(frame.data).await
    }

    /// Receive and deserialize one message. `Ok(None)` once the client has
    /// closed its side.
    pub async fn recv_msg<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.recv_bytes().await? {
            Some(body) => Ok(Some(unmarshal(
                self.ctx.effective_serialization_type(),
                &body,
            )?)),
            None => Ok(None),
        }
    }

    /// Receive one message without deserializing it.
    pub async fn recv_bytes(&mut self) -> Result<Option<Bytes>> {
        if let Some(terminal) = &self.terminal {
            return match terminal {
                None => Ok(None),
                Some(err) => Err(err.clone().into()),
            };
        }

        match self.shared.queue.pop().await {
            Some(RecvItem::Data(body)) => {
                if let Some(ctl) = &self.shared.recv_ctl {
                    ctl.on_recv(window_len(&body)).await?;
                }
                let limit = self.codec.max_frame_size();
                Ok(Some(decompress(self.ctx.effective_compress_type(), body, limit)?))
            }
            Some(RecvItem::Eof) => {
                self.terminal = Some(None);
                Ok(None)
            }
            Some(RecvItem::Reset(err)) => {
                self.terminal = Some(Some(err.clone()));
                Err(err.into())
            }
            None => Err(self.shared.closed_error()),
        }
    }
}
