//! Client side of streams.
//!
//! [`StreamClient::new_stream`] runs the interceptor chain, allocates a
//! stream ID, and completes the INIT round trip before returning. A dispatch
//! task per stream then moves frames from the connection route onto the
//! stream's receive queue until the server closes the stream or the
//! connection fails.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use super::codec::{ClientStreamCodec, StreamMsg};
use super::flow_control::{negotiate_window, ReceiveControl, SendControl, DEFAULT_WINDOW_SIZE};
use super::queue::BlockingQueue;
use super::{feedback_fn, window_len, RecvItem};
use crate::codec::{compress, decompress, marshal, unmarshal};
use crate::config::{Config, StreamConfig};
use crate::context::{CallContext, DoneSignal};
use crate::error::{codes, Result, RpcError, RpcwireError};
use crate::handler::BoxFuture;
use crate::protocol::{CloseType, StreamCloseMeta, StreamInitMeta};
use crate::transport::{ClientConn, FrameSender, StreamEvent, StreamRoute};

/// First stream ID handed out on a connection.
const FIRST_STREAM_ID: u32 = 100;

/// IDs below [`FIRST_STREAM_ID`] are never handed out, also after wrapping.
fn following_stream_id(id: u32) -> u32 {
    id.checked_add(1).unwrap_or(FIRST_STREAM_ID)
}

/// Shape of a stream method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDesc {
    /// Method name, used when the context does not name one.
    pub method: String,
    /// The client sends more than one message.
    pub client_streams: bool,
    /// The server sends more than one message.
    pub server_streams: bool,
}

impl StreamDesc {
    /// Both sides stream.
    pub fn bidi(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            client_streams: true,
            server_streams: true,
        }
    }

    /// Only the client streams; the server answers once.
    pub fn client_streaming(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            client_streams: true,
            server_streams: false,
        }
    }

    /// Only the server streams.
    pub fn server_streaming(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            client_streams: false,
            server_streams: true,
        }
    }
}

/// Wraps stream creation. Call `next.run(ctx, desc)` to continue the chain.
pub trait StreamInterceptor: Send + Sync + 'static {
    /// Intercept one `new_stream` call.
    fn intercept<'a>(
        &'a self,
        ctx: &'a mut CallContext,
        desc: &'a StreamDesc,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<ClientStream>>;
}

/// The rest of an interceptor chain.
pub struct Next<'a> {
    client: &'a StreamClient,
    rest: &'a [Arc<dyn StreamInterceptor>],
}

impl<'a> Next<'a> {
    /// Run the remaining interceptors, then open the stream.
    pub fn run(
        self,
        ctx: &'a mut CallContext,
        desc: &'a StreamDesc,
    ) -> BoxFuture<'a, Result<ClientStream>> {
        match self.rest.split_first() {
            Some((first, rest)) => first.intercept(
                ctx,
                desc,
                Next {
                    client: self.client,
                    rest,
                },
            ),
            None => Box::pin(self.client.invoke(ctx, desc)),
        }
    }
}

/// Opens streams on one connection.
pub struct StreamClient {
    conn: Arc<ClientConn>,
    codec: ClientStreamCodec,
    config: StreamConfig,
    caller: String,
    interceptors: Vec<Arc<dyn StreamInterceptor>>,
    next_id: AtomicU32,
}

impl StreamClient {
    /// Create a stream client over `conn`.
    pub fn new(
        conn: Arc<ClientConn>,
        config: &Config,
        caller: impl Into<String>,
        interceptors: Vec<Arc<dyn StreamInterceptor>>,
    ) -> Self {
        Self {
            conn,
            codec: ClientStreamCodec::new(config.max_frame_size),
            config: config.stream,
            caller: caller.into(),
            interceptors,
            next_id: AtomicU32::new(FIRST_STREAM_ID),
        }
    }

    /// Open a stream. Returns once the server has answered INIT.
    pub async fn new_stream(
        &self,
        ctx: &mut CallContext,
        desc: &StreamDesc,
    ) -> Result<ClientStream> {
        Next {
            client: self,
            rest: &self.interceptors,
        }
        .run(ctx, desc)
        .await
    }

    fn next_stream_id(&self) -> u32 {
        match self
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(following_stream_id(id))
            }) {
            Ok(id) | Err(id) => id,
        }
    }

    async fn invoke(&self, ctx: &mut CallContext, desc: &StreamDesc) -> Result<ClientStream> {
        let stream_id = self.next_stream_id();
        ctx.stream_id = stream_id;
        if ctx.method.is_empty() {
            ctx.method.clone_from(&desc.method);
        }
        if ctx.caller.is_empty() {
            ctx.caller.clone_from(&self.caller);
        }

        let (route, mut rx) = self.conn.register_stream(stream_id)?;
        let recv_window = negotiate_window(self.config.initial_window_size as u64);
        let init = StreamMsg::Init(StreamInitMeta {
            init_window_size: Some(recv_window),
            ..StreamInitMeta::default()
        });
        let frame = self
            .codec
            .encode(ctx, &init)
            .map_err(|e| e.into_rpc(codes::CLIENT_ENCODE_FAIL))?;
        self.conn.send(frame.data).await?;

        let event = tokio::select! {
            event = rx.recv() => event,
            err = ctx.done() => return Err(err.into()),
        };
        let frame = match event {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => return Err(err.into()),
            None => return Err(RpcwireError::ConnectionClosed),
        };
        let server_window = match self.codec.decode(ctx, &frame)? {
            StreamMsg::Init(meta) => meta.init_window_size,
            other => {
                return Err(RpcwireError::Protocol(format!(
                    "expected INIT response on stream {stream_id}, got {:?}",
                    other.frame_type()
                )))
            }
        };
        if let Some(err) = ctx.error.clone() {
            return Err(err.into());
        }

        let send_window = server_window.map_or(DEFAULT_WINDOW_SIZE, |w| negotiate_window(w as u64));
        let flow = recv_window != 0 && send_window != 0;

        let done = DoneSignal::new();
        let sender = self.conn.sender();
        let recv_ctl = flow.then(|| {
            let codec = self.codec;
            let feedback_ctx = CallContext::for_stream("", stream_id, ctx.version);
            ReceiveControl::new(
                recv_window,
                self.config.feedback_divisor,
                feedback_fn(sender.clone(), move |msg| codec.encode(&feedback_ctx, msg)),
            )
        });
        let shared = Arc::new(ClientShared {
            stream_id,
            queue: BlockingQueue::new(done.clone()),
            send_ctl: flow.then(|| SendControl::new(send_window, done.clone(), ctx.cancel.clone())),
            recv_ctl,
            done,
        });

        tracing::debug!(
            "stream {} opened for {} (send window {}, recv window {})",
            stream_id,
            ctx.method,
            send_window,
            recv_window
        );

        tokio::spawn(dispatch(route, rx, self.codec, ctx.clone(), shared.clone()));

        Ok(ClientStream {
            ctx: ctx.clone(),
            desc: desc.clone(),
            shared,
            codec: self.codec,
            sender,
            send_lock: tokio::sync::Mutex::new(()),
            recv_lock: tokio::sync::Mutex::new(()),
            send_closed: AtomicBool::new(false),
            terminal: Mutex::new(None),
        })
    }
}

struct ClientShared {
    stream_id: u32,
    queue: BlockingQueue<RecvItem>,
    send_ctl: Option<SendControl>,
    recv_ctl: Option<ReceiveControl>,
    done: DoneSignal,
}

fn read_end(detail: impl std::fmt::Display) -> RpcError {
    RpcError::framework(
        codes::STREAM_CLIENT_READ_END,
        format!("stream read end: {detail}"),
    )
}

/// Move frames for one stream onto its queue until it ends.
async fn dispatch(
    route: StreamRoute,
    mut rx: mpsc::UnboundedReceiver<StreamEvent>,
    codec: ClientStreamCodec,
    mut ctx: CallContext,
    shared: Arc<ClientShared>,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = shared.done.wait() => break,
        };
        let frame = match event {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                shared.queue.push(RecvItem::Reset(read_end(&err.msg)));
                break;
            }
            None => {
                shared.queue.push(RecvItem::Reset(read_end("connection closed")));
                break;
            }
        };

        match codec.decode(&mut ctx, &frame) {
            Ok(StreamMsg::Data(body)) => shared.queue.push(RecvItem::Data(body)),
            Ok(StreamMsg::Close(_)) => {
                let item = match ctx.error.take() {
                    Some(err) => RecvItem::Reset(err),
                    None => RecvItem::Eof,
                };
                shared.queue.push(item);
                break;
            }
            Ok(StreamMsg::Feedback(meta)) => {
                if let Some(ctl) = &shared.send_ctl {
                    ctl.update_window(meta.window_size_increment);
                }
            }
            Ok(StreamMsg::Init(_)) => {
                tracing::warn!("unexpected INIT on open stream {}", shared.stream_id);
            }
            Err(e) => {
                shared.queue.push(RecvItem::Reset(read_end(&e)));
                break;
            }
        }
    }

    drop(route);
    shared.done.fire();
    tracing::debug!("stream {} dispatch finished", shared.stream_id);
}

/// The client end of one stream.
///
/// Sending and receiving take `&self` and may run concurrently from
/// different tasks; each direction allows one operation at a time.
pub struct ClientStream {
    ctx: CallContext,
    desc: StreamDesc,
    shared: Arc<ClientShared>,
    codec: ClientStreamCodec,
    sender: Arc<dyn FrameSender>,
    send_lock: tokio::sync::Mutex<()>,
    recv_lock: tokio::sync::Mutex<()>,
    send_closed: AtomicBool,
    terminal: Mutex<Option<Option<RpcError>>>,
}

impl ClientStream {
    /// Call metadata of the stream.
    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    /// Stream ID.
    pub fn stream_id(&self) -> u32 {
        self.shared.stream_id
    }

    /// Whether the server side has ended the stream.
    pub fn is_closed(&self) -> bool {
        self.shared.done.is_fired()
    }

    /// Serialize and send one message.
    pub async fn send_msg<T: Serialize>(&self, msg: &T) -> Result<()> {
        let body = marshal(self.ctx.serialization_type, msg)
            .map_err(|e| e.into_rpc(codes::CLIENT_ENCODE_FAIL))?;
        self.send_bytes(body).await
    }

    /// Send one already-serialized message.
    pub async fn send_bytes(&self, body: Bytes) -> Result<()> {
        let _guard = self.send_lock.lock().await;
        if self.send_closed.load(Ordering::Acquire) {
            return Err(RpcwireError::StreamClosed);
        }
        if self.shared.done.is_fired() {
            return Err(self.terminal_error());
        }

        let body = compress(self.ctx.compress_type, body)?;
        if let Some(ctl) = &self.shared.send_ctl {
            tokio::select! {
                reserved = ctl.get_window(window_len(&body)) => reserved?,
                err = self.ctx.done() => return Err(err.into()),
            }
        }
        let frame = self.codec.encode(&self.ctx, &StreamMsg::Data(body))?;
        self.sender.send_frame(frame.data).await
    }

    /// Close the sending side. Receiving continues until the server closes.
    pub async fn close_send(&self) -> Result<()> {
        let _guard = self.send_lock.lock().await;
        if self.send_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let meta = StreamCloseMeta {
            close_type: CloseType::Close.as_i32(),
            ..StreamCloseMeta::default()
        };
        let frame = self.codec.encode(&self.ctx, &StreamMsg::Close(meta))?;
        self.sender.send_frame(frame.data).await
    }

    /// Receive and deserialize one message. `Ok(None)` at the end of the
    /// stream.
    pub async fn recv_msg<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.recv_bytes().await? {
            Some(body) => Ok(Some(
                unmarshal(self.ctx.serialization_type, &body)
                    .map_err(|e| e.into_rpc(codes::CLIENT_DECODE_FAIL))?,
            )),
            None => Ok(None),
        }
    }

    /// Receive one message without deserializing it.
    ///
    /// When the server does not stream, its single message must be followed
    /// by the end of the stream, which is consumed here as well.
    pub async fn recv_bytes(&self) -> Result<Option<Bytes>> {
        let _guard = self.recv_lock.lock().await;
        if let Some(terminal) = self.terminal.lock().clone() {
            return match terminal {
                None => Ok(None),
                Some(err) => Err(err.into()),
            };
        }

        let body = match self.next_item().await? {
            RecvItem::Data(body) => body,
            RecvItem::Eof => return Ok(None),
            RecvItem::Reset(err) => return Err(err.into()),
        };
        if let Some(ctl) = &self.shared.recv_ctl {
            ctl.on_recv(window_len(&body)).await?;
        }
        let body = decompress(self.ctx.compress_type, body, self.codec.max_frame_size())?;

        if !self.desc.server_streams {
            match self.next_item().await? {
                RecvItem::Eof => {}
                RecvItem::Reset(err) => return Err(err.into()),
                RecvItem::Data(_) => {
                    return Err(RpcwireError::Protocol(format!(
                        "stream {} sent more than one response",
                        self.shared.stream_id
                    )))
                }
            }
        }
        Ok(Some(body))
    }

    /// Next queue entry, racing the call's cancellation and deadline.
    /// Terminal entries are remembered so later receives repeat them.
    async fn next_item(&self) -> Result<RecvItem> {
        let item = tokio::select! {
            item = self.shared.queue.pop() => item,
            err = self.ctx.done() => return Err(err.into()),
        };
        match item {
            Some(RecvItem::Eof) => {
                *self.terminal.lock() = Some(None);
                Ok(RecvItem::Eof)
            }
            Some(RecvItem::Reset(err)) => {
                *self.terminal.lock() = Some(Some(err.clone()));
                Ok(RecvItem::Reset(err))
            }
            Some(data) => Ok(data),
            None => Err(self.terminal_error()),
        }
    }

    fn terminal_error(&self) -> RpcwireError {
        match self.terminal.lock().clone() {
            Some(Some(err)) => err.into(),
            _ => RpcwireError::StreamClosed,
        }
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        self.shared.done.fire();
    }
}
