//! Credit-based flow control for streams.
//!
//! Each direction of a stream has its own controller:
//!
//! - [`SendControl`] holds the credit the peer has granted us. Reserving
//!   credit never fails while the window is positive and may drive it
//!   negative; the overdraft is repaid by later FEEDBACK increments.
//! - [`ReceiveControl`] counts bytes we have consumed and grants them back to
//!   the peer in FEEDBACK frames, one per `window / divisor` bytes.
//!
//! A window of `0` turns both controllers off for the stream, for peers that
//! do not speak flow control.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::context::DoneSignal;
use crate::error::{Result, RpcwireError};
use crate::handler::BoxFuture;

/// Protocol minimum (and default) window.
pub const DEFAULT_WINDOW_SIZE: u32 = 65535;

/// Default fraction of the window consumed before a FEEDBACK is sent.
pub const DEFAULT_FEEDBACK_DIVISOR: u32 = 4;

/// Clamp a requested window into `[DEFAULT_WINDOW_SIZE, u32::MAX]`.
///
/// `0` is passed through unchanged: it means flow control is disabled.
pub fn negotiate_window(requested: u64) -> u32 {
    if requested == 0 {
        return 0;
    }
    requested.clamp(DEFAULT_WINDOW_SIZE as u64, u32::MAX as u64) as u32
}

/// Sender-side window.
#[derive(Debug)]
pub struct SendControl {
    window: AtomicI64,
    updated: Notify,
    stream_done: DoneSignal,
    call_done: DoneSignal,
}

impl SendControl {
    /// Create with the peer's initial window. Waits give up when either
    /// signal fires.
    pub fn new(window: u32, stream_done: DoneSignal, call_done: DoneSignal) -> Self {
        Self {
            window: AtomicI64::new(window as i64),
            updated: Notify::new(),
            stream_done,
            call_done,
        }
    }

    /// Reserve `n` bytes of credit, waiting while the window is exhausted.
    pub async fn get_window(&self, n: u32) -> Result<()> {
        loop {
            let reserved = self
                .window
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                    (w > 0).then(|| w - n as i64)
                })
                .is_ok();
            if reserved {
                return Ok(());
            }
            if self.stream_done.is_fired() || self.call_done.is_fired() {
                return Err(RpcwireError::StreamClosed);
            }

            tokio::select! {
                _ = self.updated.notified() => {}
                _ = self.stream_done.wait() => return Err(RpcwireError::StreamClosed),
                _ = self.call_done.wait() => return Err(RpcwireError::StreamClosed),
            }
        }
    }

    /// Add credit granted by the peer.
    pub fn update_window(&self, increment: u32) {
        let prev = self.window.fetch_add(increment as i64, Ordering::AcqRel);
        if prev <= 0 && prev + increment as i64 > 0 {
            self.updated.notify_one();
        }
    }

    /// Current window, possibly negative.
    #[inline]
    pub fn available(&self) -> i64 {
        self.window.load(Ordering::Acquire)
    }
}

/// Sends one FEEDBACK frame carrying the given increment.
pub type FeedbackFn = Arc<dyn Fn(u32) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Receiver-side accounting.
pub struct ReceiveControl {
    buffer: u32,
    threshold: u32,
    unacked: AtomicU32,
    feedback: FeedbackFn,
}

impl std::fmt::Debug for ReceiveControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveControl")
            .field("buffer", &self.buffer)
            .field("threshold", &self.threshold)
            .field("unacked", &self.unacked.load(Ordering::Relaxed))
            .finish()
    }
}

impl ReceiveControl {
    /// Create for a receive window of `buffer` bytes.
    pub fn new(buffer: u32, divisor: u32, feedback: FeedbackFn) -> Self {
        Self {
            buffer,
            threshold: (buffer / divisor.max(1)).max(1),
            unacked: AtomicU32::new(0),
            feedback,
        }
    }

    /// Record `n` consumed bytes, sending FEEDBACK once the threshold is reached.
    pub async fn on_recv(&self, n: u32) -> Result<()> {
        let prev = self
            .unacked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| {
                Some(u.saturating_add(n))
            })
            .unwrap_or_else(|u| u);
        if prev.saturating_add(n) < self.threshold {
            return Ok(());
        }
        let increment = self.unacked.swap(0, Ordering::AcqRel);
        if increment == 0 {
            return Ok(());
        }
        tracing::trace!("sending window feedback of {} bytes", increment);
        (self.feedback)(increment).await
    }

    /// Receive window size.
    #[inline]
    pub fn buffer(&self) -> u32 {
        self.buffer
    }

    /// Bytes consumed but not yet granted back.
    #[inline]
    pub fn unacked(&self) -> u32 {
        self.unacked.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn test_negotiate_window() {
        assert_eq!(negotiate_window(0), 0);
        assert_eq!(negotiate_window(1), DEFAULT_WINDOW_SIZE);
        assert_eq!(negotiate_window(65535), 65535);
        assert_eq!(negotiate_window(1 << 20), 1 << 20);
        assert_eq!(negotiate_window(u64::MAX), u32::MAX);
    }

    #[tokio::test]
    async fn test_reserve_may_overdraw() {
        let ctl = SendControl::new(10, DoneSignal::new(), DoneSignal::new());
        ctl.get_window(25).await.unwrap();
        assert_eq!(ctl.available(), -15);
    }

    #[tokio::test]
    async fn test_blocks_until_update() {
        let ctl = Arc::new(SendControl::new(1, DoneSignal::new(), DoneSignal::new()));
        ctl.get_window(100).await.unwrap();

        let updater = {
            let ctl = ctl.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                ctl.update_window(50);
                tokio::time::sleep(Duration::from_millis(50)).await;
                ctl.update_window(100);
            })
        };

        let start = tokio::time::Instant::now();
        ctl.get_window(10).await.unwrap();
        // -99 + 50 is still not positive, so only the second update releases us.
        assert!(start.elapsed() >= Duration::from_millis(90));
        assert_eq!(ctl.available(), 41);
        updater.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_done_unblocks_waiter() {
        let stream_done = DoneSignal::new();
        let ctl = Arc::new(SendControl::new(1, stream_done.clone(), DoneSignal::new()));
        ctl.get_window(1).await.unwrap();

        let waiter = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.get_window(1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        stream_done.fire();

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "stream is already closed");
    }

    #[tokio::test]
    async fn test_call_cancel_unblocks_waiter() {
        let call_done = DoneSignal::new();
        let ctl = SendControl::new(1, DoneSignal::new(), call_done.clone());
        ctl.get_window(1).await.unwrap();
        call_done.fire();
        assert!(matches!(
            ctl.get_window(1).await,
            Err(RpcwireError::StreamClosed)
        ));
    }

    fn recording_feedback() -> (FeedbackFn, Arc<Mutex<Vec<u32>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let feedback: FeedbackFn = Arc::new(move |inc| {
            sink.lock().push(inc);
            Box::pin(async { Ok(()) })
        });
        (feedback, sent)
    }

    #[tokio::test]
    async fn test_feedback_at_quarter_window() {
        let (feedback, sent) = recording_feedback();
        let ctl = ReceiveControl::new(1000, DEFAULT_FEEDBACK_DIVISOR, feedback);

        ctl.on_recv(100).await.unwrap();
        ctl.on_recv(100).await.unwrap();
        assert!(sent.lock().is_empty());
        assert_eq!(ctl.unacked(), 200);

        ctl.on_recv(60).await.unwrap();
        assert_eq!(*sent.lock(), vec![260]);
        assert_eq!(ctl.unacked(), 0);
    }

    #[tokio::test]
    async fn test_feedback_divisor_is_tunable() {
        let (feedback, sent) = recording_feedback();
        let ctl = ReceiveControl::new(1000, 10, feedback);
        for _ in 0..5 {
            ctl.on_recv(50).await.unwrap();
        }
        assert_eq!(*sent.lock(), vec![100, 100]);
        assert_eq!(ctl.unacked(), 50);
    }
}
