// THEORY:
// The `pipeline` module is the single-owner analysis core. It holds every
// piece of cross-frame state the analyzer has: the mode profile, the
// bounded temporal-smoothing histories, and the calibration engine. Feeding
// it one owned frame runs the full sequence
//
//     extract features -> smooth -> classify -> calibration observe
//
// and yields the frame's `ReflectivityMetrics` plus any calibration
// signals. It is deliberately synchronous and `&mut self`: concurrency
// lives one layer up in `parallel_pipeline`, which runs the expensive
// extraction outside any lock and serializes only this core.

use crate::core_modules::calibration::{
    CalibrationEngine, CalibrationProfile, CalibrationState, DriftSignal, MetricSample,
};
use crate::core_modules::classifier::{self, SurfaceType};
use crate::core_modules::feature_extractor::{self, RawFeatures};
use crate::core_modules::frame_buffer::OwnedBuffer;
use crate::core_modules::mode_profile::{DetectionMode, ModeProfile};
use crate::core_modules::persistence::CalibrationStore;
use crate::error::ScanError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Configuration for the analysis pipeline, passed in at construction.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub detection_mode: DetectionMode,
    pub required_calibration_samples: usize,
    /// Minimum spacing between admitted frames.
    pub processing_interval: Duration,
    /// Maximum frames in flight at once.
    pub concurrency_limit: usize,
    /// Bounded wait for a concurrency permit before a frame is dropped.
    pub admission_timeout: Duration,
    /// Run an environment drift check every this many analyzed frames.
    pub environment_check_frequency: u32,
    /// Weighted relative deviation above which drift is signalled.
    pub environment_change_threshold: f64,
    /// Capacity of the output event channel.
    pub event_capacity: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            detection_mode: DetectionMode::Standard,
            required_calibration_samples: 10,
            processing_interval: Duration::from_millis(300),
            concurrency_limit: 3,
            admission_timeout: Duration::from_millis(10),
            environment_check_frequency: 30,
            environment_change_threshold: 0.3,
            event_capacity: 32,
        }
    }
}

/// The primary output of the pipeline for a single analyzed frame.
///
/// Scores are conventionally in [0, 1] but not hard-clamped by
/// construction; consumers must not assume strict bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReflectivityMetrics {
    pub specular_score: f64,
    pub diffuse_score: f64,
    pub brightness_variance: f64,
    pub average_brightness: f64,
    /// The variance threshold that was in effect for this classification.
    pub variance_threshold: f64,
    pub surface_type: SurfaceType,
    /// Capture timestamp; completion order is not guaranteed to match
    /// arrival order, so consumers should order by this.
    pub timestamp: Duration,
}

/// Everything one frame produced: the metrics plus any calibration signals
/// that fired on this frame.
#[derive(Debug, Clone)]
pub struct FrameResult {
    pub metrics: ReflectivityMetrics,
    pub drift: Option<DriftSignal>,
    pub calibration_completed: Option<CalibrationProfile>,
}

/// Exponential blend of the current score against the history mean.
///
/// With an empty history the current score passes through unsmoothed.
fn smoothed(current: f64, history: &VecDeque<f64>, alpha: f64) -> f64 {
    if history.is_empty() {
        return current;
    }
    let mean = history.iter().sum::<f64>() / history.len() as f64;
    alpha * current + (1.0 - alpha) * mean
}

fn push_bounded(history: &mut VecDeque<f64>, value: f64, capacity: usize) {
    history.push_back(value);
    if history.len() > capacity {
        history.pop_front();
    }
}

/// The single-owner reflectivity analysis core.
pub struct ReflectivityPipeline {
    profile: &'static ModeProfile,
    // One bounded smoothing history per metric: the specular history feeds
    // classification, the brightness history is a diagnostic window.
    specular_history: VecDeque<f64>,
    brightness_history: VecDeque<f64>,
    calibration: CalibrationEngine,
    store: Arc<dyn CalibrationStore>,
}

impl ReflectivityPipeline {
    /// Builds the core, resuming from a persisted calibration profile when
    /// one exists. A store that fails to load degrades to starting
    /// uncalibrated.
    pub fn new(config: &ScannerConfig, store: Arc<dyn CalibrationStore>) -> Self {
        let persisted = store.load().unwrap_or_else(|err| {
            warn!(%err, "failed to load calibration profile; starting uncalibrated");
            None
        });
        let profile = config.detection_mode.profile();
        Self {
            profile,
            specular_history: VecDeque::with_capacity(profile.history_capacity + 1),
            brightness_history: VecDeque::with_capacity(profile.history_capacity + 1),
            calibration: CalibrationEngine::new(
                config.required_calibration_samples,
                config.environment_check_frequency,
                config.environment_change_threshold,
                persisted,
            ),
            store,
        }
    }

    pub fn mode_profile(&self) -> &'static ModeProfile {
        self.profile
    }

    pub fn calibration_state(&self) -> CalibrationState {
        self.calibration.state()
    }

    pub fn calibration_progress(&self) -> (usize, usize) {
        self.calibration.progress()
    }

    /// Runs the full analysis sequence on one owned frame.
    pub fn analyze(&mut self, buffer: &OwnedBuffer) -> Result<FrameResult, ScanError> {
        let features = feature_extractor::extract(buffer, self.profile)?;
        Ok(self.finalize(features))
    }

    /// The serialized tail of the analysis: temporal smoothing,
    /// classification, and the calibration observation. Feature extraction
    /// has already happened, possibly on another worker.
    pub fn finalize(&mut self, features: RawFeatures) -> FrameResult {
        let stable_specular = smoothed(
            features.specular_score,
            &self.specular_history,
            self.profile.smoothing_alpha,
        );
        push_bounded(
            &mut self.specular_history,
            features.specular_score,
            self.profile.history_capacity,
        );
        push_bounded(
            &mut self.brightness_history,
            features.average_brightness,
            self.profile.history_capacity,
        );

        let thresholds = self.calibration.thresholds(self.profile);
        let surface_type = classifier::classify(
            stable_specular,
            features.diffuse_score,
            features.brightness_variance,
            &thresholds,
        );

        let metrics = ReflectivityMetrics {
            specular_score: features.specular_score,
            diffuse_score: features.diffuse_score,
            brightness_variance: features.brightness_variance,
            average_brightness: features.average_brightness,
            variance_threshold: thresholds.variance_threshold,
            surface_type,
            timestamp: features.timestamp,
        };

        let update = self.calibration.observe(MetricSample {
            specular: metrics.specular_score,
            diffuse: metrics.diffuse_score,
            variance: metrics.brightness_variance,
            brightness: metrics.average_brightness,
        });
        if let Some(profile) = &update.completed {
            self.persist(profile);
        }

        FrameResult {
            metrics,
            drift: update.drift,
            calibration_completed: update.completed,
        }
    }

    /// Begins (or restarts) calibration sample collection.
    pub fn start_calibration(&mut self) {
        self.calibration.start_calibration();
    }

    /// Completes calibration immediately with whatever samples were
    /// collected, persisting the resulting profile.
    pub fn force_complete_calibration(&mut self) -> CalibrationProfile {
        let profile = self.calibration.complete_calibration();
        self.persist(&profile);
        profile
    }

    fn persist(&self, profile: &CalibrationProfile) {
        if let Err(err) = self.store.save(profile) {
            // Persistence failure is not allowed to stall analysis.
            warn!(%err, "failed to persist calibration profile");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::persistence::MemoryStore;
    use image::{Rgba, RgbaImage};

    fn uniform_buffer(level: u8) -> OwnedBuffer {
        OwnedBuffer {
            data: RgbaImage::from_pixel(64, 48, Rgba([level, level, level, 255])).into_raw(),
            width: 64,
            height: 48,
            timestamp: Duration::from_millis(16),
        }
    }

    fn pipeline(config: &ScannerConfig) -> (ReflectivityPipeline, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        (
            ReflectivityPipeline::new(config, Arc::clone(&store) as Arc<dyn CalibrationStore>),
            store,
        )
    }

    #[test]
    fn smoothing_passes_through_on_an_empty_history() {
        let history = VecDeque::new();
        assert_eq!(smoothed(0.4, &history, 0.3), 0.4);
    }

    #[test]
    fn smoothing_blends_against_the_history_mean() {
        let history: VecDeque<f64> = [0.0, 0.2].into_iter().collect();
        // 0.3 * 0.5 + 0.7 * 0.1
        assert!((smoothed(0.5, &history, 0.3) - 0.22).abs() < 1e-9);
    }

    #[test]
    fn histories_stay_bounded() {
        let config = ScannerConfig::default();
        let (mut pipeline, _) = pipeline(&config);
        for _ in 0..20 {
            pipeline.analyze(&uniform_buffer(128)).unwrap();
        }
        let cap = pipeline.profile.history_capacity;
        assert_eq!(pipeline.specular_history.len(), cap);
        assert_eq!(pipeline.brightness_history.len(), cap);
    }

    #[test]
    fn uniform_bright_frame_classifies_matte() {
        let config = ScannerConfig::default();
        let (mut pipeline, _) = pipeline(&config);
        let result = pipeline.analyze(&uniform_buffer(220)).unwrap();

        assert_eq!(result.metrics.surface_type, SurfaceType::Matte);
        assert_eq!(result.metrics.diffuse_score, 1.0);
        assert_eq!(result.metrics.brightness_variance, 0.0);
        // Uncalibrated: variance floor times the Standard multiplier.
        assert!((result.metrics.variance_threshold - 0.02).abs() < 1e-9);
    }

    #[test]
    fn calibration_run_completes_and_persists() {
        let config = ScannerConfig {
            required_calibration_samples: 3,
            ..ScannerConfig::default()
        };
        let (mut pipeline, store) = pipeline(&config);
        pipeline.start_calibration();

        let mut completed = None;
        for _ in 0..3 {
            let result = pipeline.analyze(&uniform_buffer(200)).unwrap();
            if result.calibration_completed.is_some() {
                completed = result.calibration_completed;
            }
        }

        let profile = completed.expect("third sample completes the run");
        assert!(profile.calibrated);
        // Uniform frames: no specular, fully diffuse.
        assert_eq!(profile.specular_adjustment, 0.8);
        assert_eq!(profile.diffuse_adjustment, 0.9);
        assert_eq!(store.load().unwrap(), Some(profile));
        assert_eq!(pipeline.calibration_state(), CalibrationState::Calibrated);
    }

    #[test]
    fn resumes_from_a_persisted_profile() {
        let config = ScannerConfig {
            required_calibration_samples: 1,
            ..ScannerConfig::default()
        };
        let (mut first, store) = pipeline(&config);
        first.start_calibration();
        first.analyze(&uniform_buffer(200)).unwrap();

        let second =
            ReflectivityPipeline::new(&config, Arc::clone(&store) as Arc<dyn CalibrationStore>);
        assert_eq!(second.calibration_state(), CalibrationState::Calibrated);
    }

    #[test]
    fn failure_on_one_frame_leaves_the_pipeline_usable() {
        let config = ScannerConfig::default();
        let (mut pipeline, _) = pipeline(&config);

        let empty = OwnedBuffer {
            data: Vec::new(),
            width: 0,
            height: 0,
            timestamp: Duration::ZERO,
        };
        assert!(pipeline.analyze(&empty).is_err());
        assert!(pipeline.analyze(&uniform_buffer(128)).is_ok());
    }
}
