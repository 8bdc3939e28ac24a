//! Client side of a multiplexed connection.
//!
//! One read task per connection reads frames with the framer and hands each
//! one to whoever registered its ID: a oneshot for a pending unary call, an
//! unbounded channel for a stream. When the read side fails every stream
//! route receives the error and every pending unary call sees the connection
//! close.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use super::FrameSender;
use crate::config::Config;
use crate::context::DoneSignal;
use crate::error::{codes, Result, RpcError, RpcwireError};
use crate::protocol::{Frame, FrameParser};
use crate::writer::{spawn_writer_task, WriterHandle};

/// What a stream route receives: a frame, or the error that ended the
/// connection.
pub type StreamEvent = std::result::Result<Frame, RpcError>;

#[derive(Default)]
struct Routes {
    streams: Mutex<HashMap<u32, mpsc::UnboundedSender<StreamEvent>>>,
    unary: Mutex<HashMap<u32, oneshot::Sender<Frame>>>,
}

/// Client end of one connection.
pub struct ClientConn {
    writer: WriterHandle,
    routes: Arc<Routes>,
    closed: DoneSignal,
    shutdown: DoneSignal,
}

impl ClientConn {
    /// Start the read and writer tasks for a connection.
    pub fn spawn<R, W>(reader: R, writer: W, config: &Config) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, _writer_task) = spawn_writer_task(writer, config.writer.into());
        let routes = Arc::new(Routes::default());
        let closed = DoneSignal::new();
        let shutdown = DoneSignal::new();

        tokio::spawn(read_task(
            reader,
            FrameParser::new(config.max_frame_size),
            routes.clone(),
            closed.clone(),
            shutdown.clone(),
        ));

        Arc::new(Self {
            writer,
            routes,
            closed,
            shutdown,
        })
    }

    /// Route frames for `stream_id` to the returned receiver until the route
    /// is dropped.
    pub fn register_stream(
        &self,
        stream_id: u32,
    ) -> Result<(StreamRoute, mpsc::UnboundedReceiver<StreamEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut streams = self.routes.streams.lock();
            if self.closed.is_fired() {
                return Err(RpcwireError::ConnectionClosed);
            }
            if streams.contains_key(&stream_id) {
                return Err(RpcwireError::Protocol(format!(
                    "stream id {stream_id} is already in use"
                )));
            }
            streams.insert(stream_id, tx);
        }
        let route = StreamRoute {
            stream_id,
            routes: self.routes.clone(),
        };
        Ok((route, rx))
    }

    /// Route the response to `request_id` to the returned receiver.
    pub fn register_unary(&self, request_id: u32) -> Result<(UnaryRoute, oneshot::Receiver<Frame>)> {
        let (tx, rx) = oneshot::channel();
        {
            let mut unary = self.routes.unary.lock();
            if self.closed.is_fired() {
                return Err(RpcwireError::ConnectionClosed);
            }
            unary.insert(request_id, tx);
        }
        let route = UnaryRoute {
            request_id,
            routes: self.routes.clone(),
        };
        Ok((route, rx))
    }

    /// Queue a frame for writing.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        if self.closed.is_fired() {
            return Err(RpcwireError::ConnectionClosed);
        }
        self.writer.send(frame).await
    }

    /// A sender that outlives borrows of the connection.
    pub fn sender(&self) -> Arc<dyn FrameSender> {
        Arc::new(self.writer.clone())
    }

    /// Whether the read side has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }

    /// Signal that fires once the read side has ended.
    pub fn closed(&self) -> &DoneSignal {
        &self.closed
    }

    /// Stop reading. Routes are failed as if the peer had gone away.
    pub fn close(&self) {
        self.shutdown.fire();
    }

    /// Number of registered stream routes.
    pub fn stream_count(&self) -> usize {
        self.routes.streams.lock().len()
    }
}

impl Drop for ClientConn {
    fn drop(&mut self) {
        self.shutdown.fire();
    }
}

impl FrameSender for ClientConn {
    fn send_frame(&self, frame: Bytes) -> crate::handler::BoxFuture<'_, Result<()>> {
        Box::pin(self.send(frame))
    }
}

/// Registration of a stream route; unregisters on drop.
pub struct StreamRoute {
    stream_id: u32,
    routes: Arc<Routes>,
}

impl StreamRoute {
    /// Routed stream ID.
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }
}

impl Drop for StreamRoute {
    fn drop(&mut self) {
        self.routes.streams.lock().remove(&self.stream_id);
    }
}

/// Registration of a pending unary call; unregisters on drop.
pub struct UnaryRoute {
    request_id: u32,
    routes: Arc<Routes>,
}

impl Drop for UnaryRoute {
    fn drop(&mut self) {
        self.routes.unary.lock().remove(&self.request_id);
    }
}

async fn read_task<R>(
    reader: R,
    parser: FrameParser,
    routes: Arc<Routes>,
    closed: DoneSignal,
    shutdown: DoneSignal,
) where
    R: AsyncRead + Unpin,
{
    let err = tokio::select! {
        e = read_loop(reader, parser, &routes) => e,
        _ = shutdown.wait() => RpcwireError::ConnectionClosed,
    };
    let reason = match &err {
        RpcwireError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            tracing::debug!("connection closed by peer");
            "connection closed by peer".to_string()
        }
        RpcwireError::ConnectionClosed => "connection closed".to_string(),
        other => {
            tracing::error!("client read loop error: {}", other);
            other.to_string()
        }
    };
    let err = RpcError::framework(codes::STREAM_CLIENT_NETWORK_ERR, reason);

    closed.fire();
    let streams = std::mem::take(&mut *routes.streams.lock());
    for (_, tx) in streams {
        let _ = tx.send(Err(err.clone()));
    }
    routes.unary.lock().clear();
}

/// Read and route frames until the connection fails.
async fn read_loop<R>(mut reader: R, parser: FrameParser, routes: &Routes) -> RpcwireError
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match parser.next_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => return e,
        };
        let id = frame.stream_id();

        if frame.header.is_stream() {
            let route = routes.streams.lock().get(&id).cloned();
            match route {
                Some(tx) => {
                    if tx.send(Ok(frame)).is_err() {
                        tracing::debug!("stream {} receiver gone, dropping frame", id);
                    }
                }
                None => tracing::debug!("no route for stream {}, dropping frame", id),
            }
        } else if frame.header.is_unary() {
            match routes.unary.lock().remove(&id) {
                Some(tx) => {
                    let _ = tx.send(frame);
                }
                None => tracing::warn!("response for unknown request {}, dropping", id),
            }
        } else {
            tracing::warn!("unknown frame type {}, dropping", frame.header.frame_type);
        }
    }
}
