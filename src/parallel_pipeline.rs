// THEORY:
// The `parallel_pipeline` module is the concurrent front door of the
// engine. It wires the admission controller, a small fixed worker pool, and
// the single-owner analysis core into one rate- and resource-controlled
// stream:
//
//     source frame -> admit (throttle + permit) -> copy -> worker:
//         extract features (lock-free, per-buffer)
//         finalize (smooth/classify/calibrate, serialized)
//     -> event channel -> consumer
//
// Key architectural principles:
// 1.  **Bounded everything**: the semaphore permits are the only
//     concurrency primitive; no task is spawned per frame, and the worker
//     pool is sized to the permit count at construction.
// 2.  **Expensive work outside the lock**: feature extraction touches only
//     its own buffer and runs without synchronization. Only the short
//     finalize step is serialized, which keeps the smoothing history and
//     calibration engine single-writer.
// 3.  **Push, don't call back**: results leave through a bounded event
//     channel the consumer owns the receiving end of, decoupling producer
//     cadence from consumer cadence. Metrics carry their capture timestamp
//     because completion order may differ from arrival order.

use crate::core_modules::admission::{AdmissionController, AdmissionPermit, BufferStats, BufferStatsSnapshot};
use crate::core_modules::calibration::{CalibrationProfile, CalibrationState, DriftSignal};
use crate::core_modules::feature_extractor;
use crate::core_modules::frame_buffer::{OwnedBuffer, RawFrame};
use crate::core_modules::mode_profile::ModeProfile;
use crate::core_modules::persistence::CalibrationStore;
use crate::error::DropReason;
use crate::pipeline::{ReflectivityMetrics, ReflectivityPipeline, ScannerConfig};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

/// One admitted frame on its way to a worker. The permit rides along and is
/// released when the worker finishes the frame, success or error.
struct FrameTask {
    buffer: OwnedBuffer,
    permit: AdmissionPermit,
}

/// Everything the pipeline pushes to its consumer.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// One analyzed frame's metrics, with a stats snapshot taken at
    /// completion.
    Metrics {
        metrics: ReflectivityMetrics,
        stats: BufferStatsSnapshot,
    },
    /// The environment has drifted from the calibrated baseline; the
    /// consumer decides whether to prompt for recalibration.
    Drift(DriftSignal),
    /// A calibration run finished and its profile was persisted.
    CalibrationCompleted(CalibrationProfile),
    /// An admitted frame failed during analysis and was counted as
    /// processed-with-error.
    FrameError { reason: DropReason },
}

/// Outcome of delivering one frame, returned to the producer immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The frame was copied and handed to a worker; its results will
    /// arrive on the event channel.
    Admitted,
    Dropped(DropReason),
}

/// The admission-controlled concurrent analysis pipeline.
pub struct ParallelPipeline {
    admission: AdmissionController,
    task_sender: mpsc::Sender<FrameTask>,
    core: Arc<Mutex<ReflectivityPipeline>>,
    stats: Arc<BufferStats>,
    dispatcher: tokio::task::JoinHandle<()>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl ParallelPipeline {
    /// Builds the pipeline and returns the receiving end of its event
    /// channel. Spawns `config.concurrency_limit` workers plus one
    /// dispatcher; nothing else is ever spawned.
    pub fn new(
        config: ScannerConfig,
        store: Arc<dyn CalibrationStore>,
    ) -> (Self, mpsc::Receiver<ScanEvent>) {
        let worker_count = config.concurrency_limit.max(1);
        let profile = config.detection_mode.profile();

        let stats = Arc::new(BufferStats::default());
        let admission = AdmissionController::new(
            worker_count,
            config.processing_interval,
            config.admission_timeout,
            Arc::clone(&stats),
        );
        let core = Arc::new(Mutex::new(ReflectivityPipeline::new(&config, store)));

        let (event_sender, event_receiver) = mpsc::channel::<ScanEvent>(config.event_capacity);
        let (task_sender, mut task_receiver) = mpsc::channel::<FrameTask>(worker_count);

        // One dispatcher fans tasks out round-robin to the workers.
        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) = (0..worker_count)
            .map(|_| mpsc::channel::<FrameTask>(worker_count))
            .unzip();

        let dispatcher = tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                if worker_senders[worker_idx].send(task).await.is_err() {
                    break;
                }
                worker_idx = (worker_idx + 1) % worker_senders.len();
            }
        });

        let mut workers = Vec::with_capacity(worker_count);
        for mut worker_receiver in worker_receivers {
            let core = Arc::clone(&core);
            let stats = Arc::clone(&stats);
            let events = event_sender.clone();

            workers.push(tokio::spawn(async move {
                while let Some(task) = worker_receiver.recv().await {
                    Self::process_frame_worker(task, profile, &core, &stats, &events).await;
                }
            }));
        }

        (
            Self {
                admission,
                task_sender,
                core,
                stats,
                dispatcher,
                workers,
            },
            event_receiver,
        )
    }

    async fn process_frame_worker(
        task: FrameTask,
        profile: &'static ModeProfile,
        core: &Arc<Mutex<ReflectivityPipeline>>,
        stats: &Arc<BufferStats>,
        events: &mpsc::Sender<ScanEvent>,
    ) {
        let FrameTask { buffer, permit } = task;
        let started = Instant::now();

        let extracted = feature_extractor::extract(&buffer, profile);
        // The owned copy is only needed for extraction; release it before
        // the serialized tail.
        drop(buffer);

        match extracted {
            Ok(features) => {
                let result = {
                    let mut core = core.lock().expect("analysis core poisoned");
                    core.finalize(features)
                };
                stats.record_processed(started.elapsed());
                drop(permit);

                if let Some(profile) = result.calibration_completed {
                    let _ = events.send(ScanEvent::CalibrationCompleted(profile)).await;
                }
                if let Some(drift) = result.drift {
                    let _ = events.send(ScanEvent::Drift(drift)).await;
                }
                let _ = events
                    .send(ScanEvent::Metrics {
                        metrics: result.metrics,
                        stats: stats.snapshot(),
                    })
                    .await;
            }
            Err(err) => {
                // Processed-with-error: the frame is counted, the pipeline
                // keeps running.
                stats.record_processed(started.elapsed());
                drop(permit);
                warn!(%err, "frame analysis failed");
                let _ = events
                    .send(ScanEvent::FrameError {
                        reason: err.drop_reason(),
                    })
                    .await;
            }
        }
    }

    /// Delivers one source frame. Returns immediately: either the frame
    /// was admitted (copied, permit held, queued to a worker) or it was
    /// dropped and counted.
    pub async fn submit_frame(&self, frame: RawFrame<'_>) -> SubmitOutcome {
        let (buffer, permit) = match self.admission.admit(&frame).await {
            Ok(admitted) => admitted,
            Err(reason) => return SubmitOutcome::Dropped(reason),
        };

        // Capacity equals the permit count, so an admitted frame always
        // queues without waiting on analysis.
        if self
            .task_sender
            .send(FrameTask { buffer, permit })
            .await
            .is_err()
        {
            self.stats.record_dropped();
            return SubmitOutcome::Dropped(DropReason::SaturatedBuffer);
        }
        SubmitOutcome::Admitted
    }

    pub fn stats(&self) -> BufferStatsSnapshot {
        self.stats.snapshot()
    }

    /// Clears the accumulated counters.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    pub fn calibration_state(&self) -> CalibrationState {
        self.core.lock().expect("analysis core poisoned").calibration_state()
    }

    /// `(collected, target)` while a calibration run is active.
    pub fn calibration_progress(&self) -> (usize, usize) {
        self.core.lock().expect("analysis core poisoned").calibration_progress()
    }

    /// Begins collecting calibration samples from subsequent frames.
    pub fn start_calibration(&self) {
        self.core.lock().expect("analysis core poisoned").start_calibration();
    }

    /// Re-enters calibration after a drift prompt was accepted; any
    /// partially collected samples are discarded.
    pub fn request_recalibration(&self) {
        self.start_calibration();
    }

    /// Completes calibration immediately with whatever was collected.
    pub fn force_complete_calibration(&self) -> CalibrationProfile {
        self.core
            .lock()
            .expect("analysis core poisoned")
            .force_complete_calibration()
    }

    /// Stops accepting frames, drains in-flight work, and joins the pool.
    pub async fn shutdown(self) {
        drop(self.task_sender);
        let _ = self.dispatcher.await;
        let _ = futures::future::join_all(self.workers).await;
        debug_assert!(self.admission.is_idle());
    }
}
