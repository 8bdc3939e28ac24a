//! Per-connection writer task.
//!
//! Every frame leaving a connection goes through one task that owns the write
//! half. Senders (unary handlers, stream handlers, feedback and the read loop
//! itself) push complete frames into a channel; the task drains whatever is
//! ready and writes it with vectored writes.
//!
//! ```text
//! unary handler ─┐
//! stream task   ─┼─► WriterHandle ─► mpsc ─► writer task ─► AsyncWrite
//! read loop     ─┘
//! ```
//!
//! Frames are written whole and in channel order, so frames of one stream
//! never interleave and keep their relative order.
//!
//! Pending frames are bounded by a semaphore. A sender takes a permit before
//! queueing, and the writer task hands permits back once a batch is on the
//! wire. When the writer task stops, the semaphore is closed and waiting
//! senders fail with [`RpcwireError::ConnectionClosed`].

use std::io::IoSlice;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;

use crate::error::{Result, RpcwireError};
use crate::handler::BoxFuture;
use crate::transport::FrameSender;

/// Default maximum pending frames before senders wait.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames drained per batch.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task. Cheap to clone.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
    permits: Arc<Semaphore>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue a frame, waiting up to the backpressure timeout for room.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        let permit = match tokio::time::timeout(self.timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(RpcwireError::ConnectionClosed),
            Err(_) => {
                tracing::warn!(
                    "writer backpressure did not clear within {:?} ({} frames pending)",
                    self.timeout,
                    self.pending_count()
                );
                return Err(RpcwireError::BackpressureTimeout);
            }
        };
        self.tx
            .send(frame)
            .await
            .map_err(|_| RpcwireError::ConnectionClosed)?;
        // Returned by the writer task after the write.
        permit.forget();
        Ok(())
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, frame: Bytes) -> Result<()> {
        let permit = self.permits.try_acquire().map_err(|e| match e {
            TryAcquireError::NoPermits => RpcwireError::BackpressureTimeout,
            TryAcquireError::Closed => RpcwireError::ConnectionClosed,
        })?;
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RpcwireError::BackpressureTimeout,
            mpsc::error::TrySendError::Closed(_) => RpcwireError::ConnectionClosed,
        })?;
        permit.forget();
        Ok(())
    }

    /// Frames queued but not yet written.
    pub fn pending_count(&self) -> usize {
        self.max_pending
            .saturating_sub(self.permits.available_permits())
    }

    /// Whether senders are currently being held back.
    pub fn is_backpressure_active(&self) -> bool {
        self.permits.available_permits() == 0
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.permits.is_closed()
    }
}

impl FrameSender for WriterHandle {
    fn send_frame(&self, frame: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.send(frame))
    }
}

/// Spawn the writer task for `writer`.
///
/// The task ends when every handle is dropped or a write fails.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let max_pending = config.max_pending_frames.max(1);
    let permits = Arc::new(Semaphore::new(max_pending));

    let handle = WriterHandle {
        tx,
        permits: permits.clone(),
        max_pending,
        timeout: config.backpressure_timeout,
    };
    let task = tokio::spawn(async move {
        let result = writer_loop(rx, writer, &permits).await;
        permits.close();
        if let Err(e) = &result {
            tracing::error!("writer task stopped: {}", e);
        }
        result
    });

    (handle, task)
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W, permits: &Semaphore) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
    while rx.recv_many(&mut batch, MAX_BATCH_SIZE).await > 0 {
        let count = batch.len();
        write_all_vectored(&mut writer, &mut batch).await?;
        permits.add_permits(count);
        batch.clear();
    }
    let _ = writer.shutdown().await;
    Ok(())
}

/// Write every buffer in `frames`, consuming them as bytes go out.
async fn write_all_vectored<W>(writer: &mut W, frames: &mut [Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut start = 0;
    loop {
        while start < frames.len() && frames[start].is_empty() {
            start += 1;
        }
        if start == frames.len() {
            break;
        }

        let mut written = {
            let slices: Vec<IoSlice<'_>> = frames[start..].iter().map(|f| IoSlice::new(f)).collect();
            writer.write_vectored(&slices).await?
        };
        if written == 0 {
            return Err(RpcwireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "connection accepted no bytes",
            )));
        }

        while written > 0 {
            let head = &mut frames[start];
            let n = written.min(head.len());
            head.advance(n);
            written -= n;
            if head.is_empty() {
                start += 1;
            }
        }
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{construct, read_frame, FrameHeader, StreamFrameType, HEADER_SIZE};
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::duplex;

    fn frame(stream_id: u32, body: &[u8]) -> Bytes {
        let header = FrameHeader::stream(StreamFrameType::Data, stream_id);
        construct(&header, b"", body, b"", usize::MAX).unwrap()
    }

    /// Accepts at most three bytes per write call.
    struct Trickle(Vec<u8>);

    impl AsyncWrite for Trickle {
        fn poll_write(mut self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
            let n = buf.len().min(3);
            self.0.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (client, mut server) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        for i in 0..10u32 {
            handle.send(frame(i, &i.to_be_bytes())).await.unwrap();
        }
        for i in 0..10u32 {
            let f = read_frame(&mut server, usize::MAX).await.unwrap();
            assert_eq!(f.stream_id(), i);
            assert_eq!(&f.after_header()[..], &i.to_be_bytes());
        }
    }

    #[tokio::test]
    async fn test_frame_sender_impl() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());
        let sender: Arc<dyn FrameSender> = Arc::new(handle);

        sender.send_frame(frame(5, b"abc")).await.unwrap();
        let f = read_frame(&mut server, usize::MAX).await.unwrap();
        assert_eq!(f.stream_id(), 5);
    }

    #[tokio::test]
    async fn test_permits_return_after_write() {
        let (client, mut server) = duplex(64 * 1024);
        let config = WriterConfig {
            max_pending_frames: 4,
            ..WriterConfig::default()
        };
        let (handle, _task) = spawn_writer_task(client, config);

        for i in 0..12u32 {
            handle.send(frame(i, b"x")).await.unwrap();
        }
        for _ in 0..12 {
            read_frame(&mut server, usize::MAX).await.unwrap();
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_times_out_under_backpressure() {
        // A tiny duplex that nobody reads: the first frame fills it.
        let (client, _server) = duplex(8);
        let config = WriterConfig {
            max_pending_frames: 1,
            channel_capacity: 1,
            backpressure_timeout: Duration::from_millis(20),
        };
        let (handle, _task) = spawn_writer_task(client, config);

        handle.send(frame(1, b"stuck")).await.unwrap();
        assert!(handle.is_backpressure_active());
        assert!(matches!(
            handle.try_send(frame(2, b"")),
            Err(RpcwireError::BackpressureTimeout)
        ));
        assert!(matches!(
            handle.send(frame(3, b"")).await,
            Err(RpcwireError::BackpressureTimeout)
        ));
    }

    #[tokio::test]
    async fn test_waiters_fail_when_writer_dies() {
        let (client, server) = duplex(8);
        let config = WriterConfig {
            max_pending_frames: 1,
            ..WriterConfig::default()
        };
        let (handle, task) = spawn_writer_task(client, config);

        handle.send(frame(1, b"doomed")).await.unwrap();
        drop(server);
        assert!(task.await.unwrap().is_err());
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send(frame(2, b"")).await,
            Err(RpcwireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_partial_writes_resume() {
        let mut out = Trickle(Vec::new());
        let mut frames = vec![frame(1, b"hello"), Bytes::new(), frame(2, b"world")];
        write_all_vectored(&mut out, &mut frames).await.unwrap();

        assert_eq!(out.0.len(), 2 * (HEADER_SIZE + 5));
        assert!(frames.iter().all(Bytes::is_empty));
        let mut cursor = Cursor::new(out.0);
        assert_eq!(read_frame(&mut cursor, usize::MAX).await.unwrap().stream_id(), 1);
        assert_eq!(read_frame(&mut cursor, usize::MAX).await.unwrap().stream_id(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_on_handle_drop() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());
        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }
}
