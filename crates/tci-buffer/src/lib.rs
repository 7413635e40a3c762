//! IngestionBuffer + AdaptiveBatchSizer.
//!
//! Single producer (the stream handler), single consumer (the flush loop),
//! running on one dedicated `tokio::task` so enqueue order is preserved
//! exactly as source-stream offset order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tci_schemas::PendingMessage;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Raised by [`IngestionBuffer::try_enqueue`] when the bounded wait `Tw` elapses
/// and shutdown is in progress: the caller quarantines the message directly
/// with reason "buffer-full shutdown" instead of blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueTimedOutDuringShutdown;

pub struct IngestionBuffer {
    tx: mpsc::Sender<PendingMessage>,
    enqueue_wait: Duration,
}

pub struct IngestionBufferReceiver {
    rx: mpsc::Receiver<PendingMessage>,
}

impl IngestionBuffer {
    /// `capacity` is `C`; `enqueue_wait` is `Tw`.
    pub fn new(capacity: usize, enqueue_wait: Duration) -> (Self, IngestionBufferReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self { tx, enqueue_wait },
            IngestionBufferReceiver { rx },
        )
    }

    /// Bounded-wait enqueue (`Tw`). On timeout, returns `msg` back to the
    /// caller: if shutdown is in progress the caller quarantines it directly
    /// with reason "buffer-full shutdown"; otherwise the caller keeps
    /// retrying, and this blocking is what drives the stream adapter's
    /// `pause()` — the stream handler task observes repeated timeouts and
    /// pauses the transport before calling again.
    pub async fn try_enqueue(
        &self,
        msg: PendingMessage,
    ) -> Result<(), (PendingMessage, EnqueueTimedOutDuringShutdown)> {
        match tokio::time::timeout(self.enqueue_wait, self.tx.reserve()).await {
            Ok(Ok(permit)) => {
                permit.send(msg);
                Ok(())
            }
            Ok(Err(_)) => {
                // Receiver dropped: the flush task has shut down terminally.
                Err((msg, EnqueueTimedOutDuringShutdown))
            }
            Err(_elapsed) => {
                warn!("ingestion buffer enqueue wait exceeded");
                Err((msg, EnqueueTimedOutDuringShutdown))
            }
        }
    }
}

impl IngestionBufferReceiver {
    /// Drain up to `max` messages, triggered by the caller when either the
    /// adaptive batch target has been reached or the flush timer elapsed.
    /// Blocks for at least one message unless `deadline` elapses first.
    pub async fn drain_batch(&mut self, max: usize, deadline: Instant) -> Vec<PendingMessage> {
        let mut batch = Vec::with_capacity(max.min(64));

        let first = tokio::time::timeout_at(deadline, self.rx.recv()).await;
        match first {
            Ok(Some(msg)) => batch.push(msg),
            Ok(None) => return batch, // sender side dropped, buffer closing
            Err(_) => return batch,   // flush timer fired with nothing queued
        }

        while batch.len() < max {
            match self.rx.try_recv() {
                Ok(msg) => batch.push(msg),
                Err(_) => break,
            }
        }
        batch
    }
}

/// Feedback controller mapping observed batch latency to the next batch
/// size. `current_size` is bounded to `[min, max]` and nudged toward
/// `target_latency` after each flush.
pub struct AdaptiveBatchSizer {
    current: AtomicUsize,
    min: usize,
    max: usize,
    target_latency: Duration,
}

impl AdaptiveBatchSizer {
    pub fn new(min: usize, max: usize, target_latency: Duration) -> Self {
        assert!(min >= 1 && min <= max, "batch sizer bounds must satisfy 1 <= min <= max");
        Self {
            current: AtomicUsize::new(min),
            min,
            max,
            target_latency,
        }
    }

    pub fn current_size(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Feed the observed flush latency and actual batch size, adjusting the
    /// next target against 0.5x / 1.5x bands of the configured target.
    pub fn record_flush(&self, observed_latency: Duration, _actual_batch_size: usize) {
        let target = self.target_latency;
        let half = target / 2;
        let one_and_half = target + target / 2;

        let current = self.current.load(Ordering::Relaxed);
        let next = if observed_latency < half {
            (current.saturating_mul(2)).min(self.max)
        } else if observed_latency > one_and_half {
            (current / 2).max(self.min)
        } else {
            current
        };

        if next != current {
            info!(from = current, to = next, "adaptive batch size adjusted");
        }
        self.current.store(next, Ordering::Relaxed);
    }

    /// Return `currentSize` to `min`. Invoked when the buffer is idle
    /// (empty fetch on a dispatch/flush cycle).
    pub fn reset(&self) {
        self.current.store(self.min, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_when_fast() {
        let sizer = AdaptiveBatchSizer::new(10, 1000, Duration::from_millis(100));
        sizer.record_flush(Duration::from_millis(10), 10);
        assert_eq!(sizer.current_size(), 20);
    }

    #[test]
    fn halves_when_slow() {
        let sizer = AdaptiveBatchSizer::new(10, 1000, Duration::from_millis(100));
        sizer.current.store(400, Ordering::Relaxed);
        sizer.record_flush(Duration::from_millis(200), 400);
        assert_eq!(sizer.current_size(), 200);
    }

    #[test]
    fn unchanged_within_band() {
        let sizer = AdaptiveBatchSizer::new(10, 1000, Duration::from_millis(100));
        sizer.current.store(64, Ordering::Relaxed);
        sizer.record_flush(Duration::from_millis(110), 64);
        assert_eq!(sizer.current_size(), 64);
    }

    #[test]
    fn respects_bounds() {
        let sizer = AdaptiveBatchSizer::new(10, 100, Duration::from_millis(100));
        sizer.current.store(90, Ordering::Relaxed);
        sizer.record_flush(Duration::from_millis(1), 90);
        assert_eq!(sizer.current_size(), 100);

        sizer.current.store(12, Ordering::Relaxed);
        sizer.record_flush(Duration::from_millis(1000), 12);
        assert_eq!(sizer.current_size(), 10);
    }

    #[test]
    fn reset_returns_to_min() {
        let sizer = AdaptiveBatchSizer::new(10, 1000, Duration::from_millis(100));
        sizer.current.store(500, Ordering::Relaxed);
        sizer.reset();
        assert_eq!(sizer.current_size(), 10);
    }

    #[tokio::test]
    async fn enqueue_then_drain_preserves_order() {
        let (buf, mut rx) = IngestionBuffer::new(8, Duration::from_millis(50));
        for i in 0..3i64 {
            let msg = PendingMessage {
                classified: tci_schemas::PendingClassified::Invalid(
                    tci_schemas::InvalidReason::MissingField("x"),
                ),
                raw_bytes: vec![],
                offset: i,
                ack_handle: None,
            };
            buf.try_enqueue(msg).await.unwrap();
        }
        let batch = rx
            .drain_batch(10, Instant::now() + Duration::from_millis(50))
            .await;
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].offset, 0);
        assert_eq!(batch[2].offset, 2);
    }

    #[tokio::test]
    async fn try_enqueue_times_out_when_full() {
        let (buf, _rx) = IngestionBuffer::new(1, Duration::from_millis(20));
        let msg1 = PendingMessage {
            classified: tci_schemas::PendingClassified::Invalid(
                tci_schemas::InvalidReason::MissingField("x"),
            ),
            raw_bytes: vec![],
            offset: 0,
            ack_handle: None,
        };
        buf.try_enqueue(msg1).await.unwrap();

        let msg2 = PendingMessage {
            classified: tci_schemas::PendingClassified::Invalid(
                tci_schemas::InvalidReason::MissingField("x"),
            ),
            raw_bytes: vec![],
            offset: 1,
            ack_handle: None,
        };
        let err = buf.try_enqueue(msg2).await.unwrap_err();
        assert_eq!(err.0.offset, 1);
    }
}
