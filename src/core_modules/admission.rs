// THEORY:
// The `admission` module converts an unbounded, possibly overwhelming frame
// source into a rate- and resource-controlled stream. It is deliberately
// lossy: a camera produces frames far faster than reflectivity analysis can
// consume them, and a fresh frame is always worth more than a queued stale
// one, so excess frames are dropped at the door instead of buffered.
//
// Two gates, in order:
// 1.  **Throttle**: a frame is rejected unless the processing interval has
//     elapsed since the last *admitted* frame's arrival. A non-blocking
//     timestamp comparison; a throttled frame returns immediately.
// 2.  **Concurrency permits**: admission requires one of K semaphore
//     permits within a short timeout. The permit rides inside an
//     `AdmissionPermit` guard and is released exactly once, when the guard
//     drops at the end of the owning pipeline stage, on every exit path.
//
// All counters live in `BufferStats` as atomics, since producer-side
// admission and worker-side completion mutate them concurrently.

use crate::core_modules::frame_buffer::{self, OwnedBuffer, RawFrame};
use crate::error::DropReason;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::debug;

/// Monotonically accumulating pipeline counters.
///
/// Mutated from both the producer side and the worker side; every field is
/// atomic. Reset only on explicit request.
#[derive(Debug, Default)]
pub struct BufferStats {
    total_received: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    queue_depth: AtomicU64,
    processing_time_total_us: AtomicU64,
    peak_processing_time_us: AtomicU64,
}

/// A point-in-time copy of the counters, as delivered alongside metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStatsSnapshot {
    pub total_received: u64,
    pub processed: u64,
    pub dropped: u64,
    pub queue_depth: u64,
    pub avg_processing_time: Duration,
    pub peak_processing_time: Duration,
}

impl BufferStatsSnapshot {
    /// Fraction of delivered frames that were dropped, in [0, 1].
    pub fn drop_rate(&self) -> f64 {
        if self.total_received == 0 {
            0.0
        } else {
            self.dropped as f64 / self.total_received as f64
        }
    }
}

impl BufferStats {
    pub fn record_received(&self) {
        self.total_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let us = elapsed.as_micros() as u64;
        self.processing_time_total_us.fetch_add(us, Ordering::Relaxed);
        self.peak_processing_time_us.fetch_max(us, Ordering::Relaxed);
    }

    fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BufferStatsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let total_us = self.processing_time_total_us.load(Ordering::Relaxed);
        let avg_us = if processed == 0 { 0 } else { total_us / processed };
        BufferStatsSnapshot {
            total_received: self.total_received.load(Ordering::Relaxed),
            processed,
            dropped: self.dropped.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            avg_processing_time: Duration::from_micros(avg_us),
            peak_processing_time: Duration::from_micros(
                self.peak_processing_time_us.load(Ordering::Relaxed),
            ),
        }
    }

    /// Clears every counter. Explicit-request-only.
    pub fn reset(&self) {
        self.total_received.store(0, Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.processing_time_total_us.store(0, Ordering::Relaxed);
        self.peak_processing_time_us.store(0, Ordering::Relaxed);
    }
}

/// RAII guard for one concurrency permit.
///
/// Holding the permit inside a guard makes double-release and
/// release-without-acquire unrepresentable: the permit goes back exactly
/// once, when the guard drops, whether the owning stage succeeded or
/// failed.
#[derive(Debug)]
pub struct AdmissionPermit {
    inner: Option<tokio::sync::OwnedSemaphorePermit>,
    semaphore: Arc<Semaphore>,
    concurrency_limit: usize,
    stats: Arc<BufferStats>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        drop(self.inner.take());
        let outstanding = self.concurrency_limit - self.semaphore.available_permits();
        self.stats.set_queue_depth(outstanding as u64);
    }
}

/// Gates frames into the analysis pipeline.
///
/// Designed for a single producer delivering frames serially; admission
/// never blocks that producer beyond the bounded permit wait.
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    concurrency_limit: usize,
    processing_interval: Duration,
    admission_timeout: Duration,
    last_admitted: std::sync::Mutex<Option<Instant>>,
    stats: Arc<BufferStats>,
}

impl AdmissionController {
    pub fn new(
        concurrency_limit: usize,
        processing_interval: Duration,
        admission_timeout: Duration,
        stats: Arc<BufferStats>,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency_limit)),
            concurrency_limit,
            processing_interval,
            admission_timeout,
            last_admitted: std::sync::Mutex::new(None),
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<BufferStats> {
        &self.stats
    }

    /// Admits or drops one frame.
    ///
    /// On admission the frame has already been deep-copied into an
    /// `OwnedBuffer` and one concurrency permit is held by the returned
    /// guard. Every failure path has already been counted by the time this
    /// returns.
    pub async fn admit(
        &self,
        frame: &RawFrame<'_>,
    ) -> Result<(OwnedBuffer, AdmissionPermit), DropReason> {
        self.stats.record_received();

        let throttled = {
            let last = self.last_admitted.lock().expect("last_admitted poisoned");
            matches!(*last, Some(t) if t.elapsed() < self.processing_interval)
        };
        if throttled {
            self.stats.record_dropped();
            debug!(reason = DropReason::Throttled.as_str(), "frame dropped");
            return Err(DropReason::Throttled);
        }

        let permit = match tokio::time::timeout(
            self.admission_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            // Timed out or semaphore closed: all permits are busy.
            _ => {
                self.stats.record_dropped();
                debug!(reason = DropReason::SaturatedBuffer.as_str(), "frame dropped");
                return Err(DropReason::SaturatedBuffer);
            }
        };

        let buffer = match frame_buffer::copy_frame(frame) {
            Ok(buffer) => buffer,
            Err(err) => {
                // The permit guard has not been built yet; dropping the raw
                // permit here is the single release.
                drop(permit);
                self.stats.record_dropped();
                let reason = err.drop_reason();
                debug!(reason = reason.as_str(), %err, "frame dropped");
                return Err(reason);
            }
        };

        *self.last_admitted.lock().expect("last_admitted poisoned") = Some(Instant::now());

        let outstanding = self.concurrency_limit - self.semaphore.available_permits();
        self.stats.set_queue_depth(outstanding as u64);

        Ok((
            buffer,
            AdmissionPermit {
                inner: Some(permit),
                semaphore: Arc::clone(&self.semaphore),
                concurrency_limit: self.concurrency_limit,
                stats: Arc::clone(&self.stats),
            },
        ))
    }

    /// Number of permits currently held by in-flight frames.
    pub fn outstanding_permits(&self) -> usize {
        self.concurrency_limit - self.semaphore.available_permits()
    }

    /// Non-blocking probe used by shutdown to wait for in-flight work.
    pub fn is_idle(&self) -> bool {
        match self.semaphore.try_acquire_many(self.concurrency_limit as u32) {
            Ok(all) => {
                drop(all);
                true
            }
            Err(TryAcquireError::NoPermits) => false,
            Err(TryAcquireError::Closed) => true,
        }
    }
}
