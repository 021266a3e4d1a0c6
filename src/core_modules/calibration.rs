// THEORY:
// The `CalibrationEngine` adapts the detector to the ambient lighting of a
// working site. It is a small state machine:
//
//     Uncalibrated -> Calibrating -> Calibrated <-> (recalibration request)
//
// While `Calibrating` it collects the metrics of every analyzed frame until
// a target count is reached, then averages them into an environment
// baseline and derives per-threshold adjustment factors. While `Calibrated`
// it periodically compares live metrics against that baseline; a large
// weighted deviation raises a drift signal, but the engine never
// recalibrates on its own. Re-entering `Calibrating` is an explicit request
// from the operator, which clears any partially collected samples.

use crate::core_modules::classifier::ActiveThresholds;
use crate::core_modules::mode_profile::ModeProfile;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const MIN_VARIANCE_BASELINE: f64 = 0.01;

// Relative weight of each metric in the combined drift score.
const DRIFT_WEIGHT_SPECULAR: f64 = 0.3;
const DRIFT_WEIGHT_DIFFUSE: f64 = 0.3;
const DRIFT_WEIGHT_VARIANCE: f64 = 0.2;
const DRIFT_WEIGHT_BRIGHTNESS: f64 = 0.2;

/// The persisted result of a completed calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    pub baseline_specular: f64,
    pub baseline_diffuse: f64,
    pub baseline_variance: f64,
    pub baseline_brightness: f64,
    pub specular_adjustment: f64,
    pub diffuse_adjustment: f64,
    pub variance_baseline: f64,
    pub calibrated: bool,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            baseline_specular: 0.0,
            baseline_diffuse: 0.0,
            baseline_variance: 0.0,
            baseline_brightness: 0.0,
            specular_adjustment: 1.0,
            diffuse_adjustment: 1.0,
            variance_baseline: 0.0,
            calibrated: false,
        }
    }
}

/// One frame's worth of metrics, as consumed by the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSample {
    pub specular: f64,
    pub diffuse: f64,
    pub variance: f64,
    pub brightness: f64,
}

/// Current phase of the calibration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Uncalibrated,
    Calibrating,
    Calibrated,
}

/// Raised when live metrics have moved far from the calibrated baseline.
///
/// Carries the combined weighted relative deviation. Signalling does not
/// change engine state; acting on it is the operator's decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftSignal {
    pub magnitude: f64,
}

/// What changed as a result of feeding one sample to the engine.
#[derive(Debug, Clone, Default)]
pub struct CalibrationUpdate {
    /// Present when this sample completed a calibration run.
    pub completed: Option<CalibrationProfile>,
    /// Present when a periodic environment check detected drift.
    pub drift: Option<DriftSignal>,
}

/// Owns the threshold-adjustment and environment-baseline state machine.
pub struct CalibrationEngine {
    state: CalibrationState,
    samples: Vec<MetricSample>,
    target_samples: usize,
    profile: CalibrationProfile,
    frames_since_check: u32,
    check_frequency: u32,
    change_threshold: f64,
}

impl CalibrationEngine {
    /// Builds the engine, resuming from a persisted profile when one exists.
    pub fn new(
        target_samples: usize,
        check_frequency: u32,
        change_threshold: f64,
        persisted: Option<CalibrationProfile>,
    ) -> Self {
        let (state, profile) = match persisted {
            Some(profile) if profile.calibrated => (CalibrationState::Calibrated, profile),
            _ => (CalibrationState::Uncalibrated, CalibrationProfile::default()),
        };
        Self {
            state,
            samples: Vec::with_capacity(target_samples),
            target_samples,
            profile,
            frames_since_check: 0,
            check_frequency,
            change_threshold,
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn profile(&self) -> &CalibrationProfile {
        &self.profile
    }

    /// `(collected, target)` while calibrating.
    pub fn progress(&self) -> (usize, usize) {
        (self.samples.len(), self.target_samples)
    }

    /// Begins collecting samples. Safe to call from any state; any
    /// partially collected samples are discarded and progress restarts at
    /// zero.
    pub fn start_calibration(&mut self) {
        self.samples.clear();
        self.frames_since_check = 0;
        self.state = CalibrationState::Calibrating;
        info!(target_samples = self.target_samples, "calibration started");
    }

    /// Feeds one analyzed frame's metrics through the state machine.
    pub fn observe(&mut self, sample: MetricSample) -> CalibrationUpdate {
        let mut update = CalibrationUpdate::default();
        match self.state {
            CalibrationState::Uncalibrated => {}
            CalibrationState::Calibrating => {
                self.samples.push(sample);
                if self.samples.len() >= self.target_samples {
                    update.completed = Some(self.complete_calibration());
                }
            }
            CalibrationState::Calibrated => {
                self.frames_since_check += 1;
                if self.frames_since_check >= self.check_frequency {
                    self.frames_since_check = 0;
                    update.drift = self.check_drift(&sample);
                }
            }
        }
        update
    }

    /// Averages the collected samples into a baseline, derives adjustment
    /// factors, and transitions to `Calibrated`.
    ///
    /// Forcing completion with zero samples still transitions, but the
    /// adjustment factors stay at their defaults and a diagnostic is
    /// recorded.
    pub fn complete_calibration(&mut self) -> CalibrationProfile {
        if self.samples.is_empty() {
            warn!("calibration completed without samples; keeping default thresholds");
            self.profile = CalibrationProfile {
                calibrated: true,
                variance_baseline: MIN_VARIANCE_BASELINE,
                ..CalibrationProfile::default()
            };
        } else {
            let count = self.samples.len() as f64;
            let mean = |f: fn(&MetricSample) -> f64| -> f64 {
                self.samples.iter().map(f).sum::<f64>() / count
            };
            let baseline_specular = mean(|s| s.specular);
            let baseline_diffuse = mean(|s| s.diffuse);
            let baseline_variance = mean(|s| s.variance);
            let baseline_brightness = mean(|s| s.brightness);

            self.profile = CalibrationProfile {
                baseline_specular,
                baseline_diffuse,
                baseline_variance,
                baseline_brightness,
                specular_adjustment: derive_specular_adjustment(baseline_specular),
                diffuse_adjustment: derive_diffuse_adjustment(baseline_diffuse),
                variance_baseline: baseline_variance.max(MIN_VARIANCE_BASELINE),
                calibrated: true,
            };
        }

        self.samples.clear();
        self.frames_since_check = 0;
        self.state = CalibrationState::Calibrated;
        info!(
            specular_adjustment = self.profile.specular_adjustment,
            diffuse_adjustment = self.profile.diffuse_adjustment,
            variance_baseline = self.profile.variance_baseline,
            "calibration complete"
        );
        self.profile.clone()
    }

    /// Resolves the thresholds in effect for one classification: the mode's
    /// defaults with this engine's adjustment factors multiplied in.
    pub fn thresholds(&self, mode: &ModeProfile) -> ActiveThresholds {
        ActiveThresholds {
            specular_cutoff: mode.specular_cutoff * self.profile.specular_adjustment,
            diffuse_threshold: mode.diffuse_threshold * self.profile.diffuse_adjustment,
            variance_threshold: self.profile.variance_baseline.max(MIN_VARIANCE_BASELINE)
                * mode.variance_threshold_multiplier,
        }
    }

    fn check_drift(&self, sample: &MetricSample) -> Option<DriftSignal> {
        let magnitude = weighted_change(&self.profile, sample);
        if magnitude > self.change_threshold {
            warn!(magnitude, threshold = self.change_threshold, "environment drift detected");
            Some(DriftSignal { magnitude })
        } else {
            None
        }
    }
}

/// Relative deviation of one metric from its baseline.
fn relative_change(current: f64, baseline: f64) -> f64 {
    (current - baseline).abs() / baseline.max(MIN_VARIANCE_BASELINE)
}

/// Combined weighted deviation of a live sample from the stored baseline.
pub fn weighted_change(profile: &CalibrationProfile, sample: &MetricSample) -> f64 {
    DRIFT_WEIGHT_SPECULAR * relative_change(sample.specular, profile.baseline_specular)
        + DRIFT_WEIGHT_DIFFUSE * relative_change(sample.diffuse, profile.baseline_diffuse)
        + DRIFT_WEIGHT_VARIANCE * relative_change(sample.variance, profile.baseline_variance)
        + DRIFT_WEIGHT_BRIGHTNESS * relative_change(sample.brightness, profile.baseline_brightness)
}

/// Piecewise specular sensitivity: very dark environments get a lower
/// cutoff, highlight-rich environments a higher one.
fn derive_specular_adjustment(baseline: f64) -> f64 {
    if baseline < 0.02 {
        0.8
    } else if baseline > 0.1 {
        1.2
    } else {
        1.0
    }
}

/// Piecewise diffuse sensitivity, mirrored: strongly diffuse environments
/// tighten the Matte test, weakly diffuse ones loosen it.
fn derive_diffuse_adjustment(baseline: f64) -> f64 {
    if baseline > 0.8 {
        0.9
    } else if baseline < 0.5 {
        1.1
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::mode_profile::DetectionMode;

    fn sample(specular: f64, diffuse: f64, variance: f64, brightness: f64) -> MetricSample {
        MetricSample {
            specular,
            diffuse,
            variance,
            brightness,
        }
    }

    fn engine() -> CalibrationEngine {
        CalibrationEngine::new(10, 30, 0.3, None)
    }

    #[test]
    fn uncalibrated_engine_uses_default_factors() {
        let engine = engine();
        assert_eq!(engine.state(), CalibrationState::Uncalibrated);
        let t = engine.thresholds(DetectionMode::Standard.profile());
        assert!((t.specular_cutoff - 0.12).abs() < 1e-9);
        assert!((t.diffuse_threshold - 0.80).abs() < 1e-9);
        // No baseline yet: the variance floor times the mode multiplier.
        assert!((t.variance_threshold - 0.01 * 2.0).abs() < 1e-9);
    }

    #[test]
    fn resumes_calibrated_from_persisted_profile() {
        let persisted = CalibrationProfile {
            calibrated: true,
            specular_adjustment: 1.2,
            ..CalibrationProfile::default()
        };
        let engine = CalibrationEngine::new(10, 30, 0.3, Some(persisted));
        assert_eq!(engine.state(), CalibrationState::Calibrated);
        assert_eq!(engine.profile().specular_adjustment, 1.2);
    }

    #[test]
    fn completion_averages_each_field() {
        let mut engine = CalibrationEngine::new(4, 30, 0.3, None);
        engine.start_calibration();
        engine.observe(sample(0.00, 0.4, 0.00, 0.2));
        engine.observe(sample(0.04, 0.6, 0.02, 0.4));
        engine.observe(sample(0.08, 0.8, 0.04, 0.6));
        let update = engine.observe(sample(0.12, 1.0, 0.06, 0.8));

        let profile = update.completed.expect("target reached");
        assert!((profile.baseline_specular - 0.06).abs() < 1e-9);
        assert!((profile.baseline_diffuse - 0.7).abs() < 1e-9);
        assert!((profile.baseline_variance - 0.03).abs() < 1e-9);
        assert!((profile.baseline_brightness - 0.5).abs() < 1e-9);
        assert!((profile.variance_baseline - 0.03).abs() < 1e-9);
        assert_eq!(engine.state(), CalibrationState::Calibrated);
    }

    #[test]
    fn variance_baseline_has_a_floor() {
        let mut engine = CalibrationEngine::new(1, 30, 0.3, None);
        engine.start_calibration();
        let update = engine.observe(sample(0.05, 0.7, 0.0, 0.5));
        assert_eq!(update.completed.unwrap().variance_baseline, 0.01);
    }

    #[test]
    fn specular_adjustment_is_piecewise() {
        assert_eq!(derive_specular_adjustment(0.01), 0.8);
        assert_eq!(derive_specular_adjustment(0.019999), 0.8);
        assert_eq!(derive_specular_adjustment(0.02), 1.0);
        assert_eq!(derive_specular_adjustment(0.05), 1.0);
        assert_eq!(derive_specular_adjustment(0.1), 1.0);
        assert_eq!(derive_specular_adjustment(0.100001), 1.2);
        assert_eq!(derive_specular_adjustment(0.15), 1.2);
    }

    #[test]
    fn diffuse_adjustment_is_piecewise() {
        assert_eq!(derive_diffuse_adjustment(0.9), 0.9);
        assert_eq!(derive_diffuse_adjustment(0.8), 1.0);
        assert_eq!(derive_diffuse_adjustment(0.6), 1.0);
        assert_eq!(derive_diffuse_adjustment(0.5), 1.0);
        assert_eq!(derive_diffuse_adjustment(0.4), 1.1);
    }

    #[test]
    fn forced_completion_without_samples_keeps_defaults() {
        let mut engine = engine();
        engine.start_calibration();
        let profile = engine.complete_calibration();
        assert!(profile.calibrated);
        assert_eq!(profile.specular_adjustment, 1.0);
        assert_eq!(profile.diffuse_adjustment, 1.0);
        assert_eq!(profile.variance_baseline, 0.01);
        assert_eq!(engine.state(), CalibrationState::Calibrated);
    }

    #[test]
    fn adjustments_scale_mode_thresholds() {
        let mut engine = CalibrationEngine::new(1, 30, 0.3, None);
        engine.start_calibration();
        // Bright, highlight-rich baseline: specular 0.15 -> 1.2,
        // diffuse 0.9 -> 0.9.
        engine.observe(sample(0.15, 0.9, 0.05, 0.6));

        let mode = DetectionMode::Standard.profile();
        let t = engine.thresholds(mode);
        assert!((t.specular_cutoff - 0.12 * 1.2).abs() < 1e-9);
        assert!((t.diffuse_threshold - 0.80 * 0.9).abs() < 1e-9);
        assert!((t.variance_threshold - 0.05 * 2.0).abs() < 1e-9);
    }

    fn calibrated_engine() -> CalibrationEngine {
        let profile = CalibrationProfile {
            baseline_specular: 0.05,
            baseline_diffuse: 0.6,
            baseline_variance: 0.02,
            baseline_brightness: 0.5,
            specular_adjustment: 1.0,
            diffuse_adjustment: 1.0,
            variance_baseline: 0.02,
            calibrated: true,
        };
        CalibrationEngine::new(10, 30, 0.3, Some(profile))
    }

    #[test]
    fn drift_at_exactly_the_threshold_does_not_fire() {
        let mut engine = calibrated_engine();
        // Doubling specular alone: relative change 1.0, weighted 0.3,
        // exactly at the default threshold.
        let doubled = sample(0.10, 0.6, 0.02, 0.5);
        assert!((weighted_change(engine.profile(), &doubled) - 0.3).abs() < 1e-9);

        let mut last = CalibrationUpdate::default();
        for _ in 0..30 {
            last = engine.observe(doubled);
        }
        assert!(last.drift.is_none());
    }

    #[test]
    fn drift_above_the_threshold_fires_on_the_check_frame() {
        let mut engine = calibrated_engine();
        let shifted = sample(0.11, 0.6, 0.02, 0.5);

        for i in 1..=29 {
            let update = engine.observe(shifted);
            assert!(update.drift.is_none(), "no check until frame 30 (got one at {i})");
        }
        let update = engine.observe(shifted);
        let drift = update.drift.expect("check frame should fire");
        assert!(drift.magnitude > 0.3);
    }

    #[test]
    fn drift_does_not_change_state() {
        let mut engine = calibrated_engine();
        let shifted = sample(0.5, 0.1, 0.2, 0.9);
        for _ in 0..30 {
            engine.observe(shifted);
        }
        assert_eq!(engine.state(), CalibrationState::Calibrated);
    }

    #[test]
    fn recalibration_clears_partial_samples() {
        let mut engine = engine();
        engine.start_calibration();
        engine.observe(sample(0.05, 0.7, 0.02, 0.5));
        engine.observe(sample(0.05, 0.7, 0.02, 0.5));
        assert_eq!(engine.progress(), (2, 10));

        engine.start_calibration();
        assert_eq!(engine.progress(), (0, 10));
    }

    #[test]
    fn progress_is_monotonic_while_calibrating() {
        let mut engine = engine();
        engine.start_calibration();
        let mut last = 0;
        for i in 1..=10 {
            engine.observe(sample(0.05, 0.7, 0.02, 0.5));
            let (collected, target) = engine.progress();
            assert_eq!(target, 10);
            // Collection resets only once the run completes.
            if i < 10 {
                assert!(collected > last);
                last = collected;
            }
        }
        assert_eq!(engine.state(), CalibrationState::Calibrated);
    }
}
