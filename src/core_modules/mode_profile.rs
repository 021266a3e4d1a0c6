// THEORY:
// All mode-dependent behavior in the analysis pipeline reads from a single
// data-driven `ModeProfile` record instead of branching on the mode at every
// call site. The table below is constructed once, is immutable, and is the
// only place where the three detection modes differ.

/// Selects one of the built-in analysis tuning profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectionMode {
    /// Balanced defaults for handheld scanning.
    Standard,
    /// Finer sampling and faster smoothing for faint, shallow relief.
    HighSensitivity,
    /// Tuned for weathered stone and patinated metal in field conditions.
    Archaeological,
}

/// The full tuning bundle for one detection mode.
///
/// Immutable after construction; looked up by value, never mutated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeProfile {
    /// Fraction of native resolution to downsample to, in (0, 1].
    pub scale: f64,
    /// The variance grid is `grid_size` x `grid_size` cells.
    pub grid_size: u32,
    /// Floor of the adaptive specular binarization threshold.
    pub specular_base_threshold: f64,
    /// Offset added to average brightness to form the adaptive threshold.
    pub specular_adaptive_offset: f64,
    /// Multiplier mapping brightness variance into the diffuse score.
    pub diffuse_variance_multiplier: f64,
    /// Sample every n-th pixel when counting specular pixels.
    pub pixel_stride: usize,
    /// Temporal smoothing factor alpha in (0, 1).
    pub smoothing_alpha: f64,
    /// Smoothed specular score above which a surface can be Shiny.
    pub specular_cutoff: f64,
    /// Multiplier applied to the calibrated variance baseline.
    pub variance_threshold_multiplier: f64,
    /// Diffuse score above which a surface is Matte.
    pub diffuse_threshold: f64,
    /// Length of each bounded temporal smoothing history.
    pub history_capacity: usize,
}

const STANDARD: ModeProfile = ModeProfile {
    scale: 0.5,
    grid_size: 8,
    specular_base_threshold: 0.75,
    specular_adaptive_offset: 0.18,
    diffuse_variance_multiplier: 18.0,
    pixel_stride: 2,
    smoothing_alpha: 0.30,
    specular_cutoff: 0.12,
    variance_threshold_multiplier: 2.0,
    diffuse_threshold: 0.80,
    history_capacity: 5,
};

const HIGH_SENSITIVITY: ModeProfile = ModeProfile {
    scale: 0.75,
    grid_size: 12,
    specular_base_threshold: 0.68,
    specular_adaptive_offset: 0.12,
    diffuse_variance_multiplier: 22.0,
    pixel_stride: 1,
    smoothing_alpha: 0.45,
    specular_cutoff: 0.08,
    variance_threshold_multiplier: 1.5,
    diffuse_threshold: 0.75,
    history_capacity: 8,
};

const ARCHAEOLOGICAL: ModeProfile = ModeProfile {
    scale: 0.6,
    grid_size: 10,
    specular_base_threshold: 0.72,
    specular_adaptive_offset: 0.15,
    diffuse_variance_multiplier: 25.0,
    pixel_stride: 1,
    smoothing_alpha: 0.35,
    specular_cutoff: 0.10,
    variance_threshold_multiplier: 1.8,
    diffuse_threshold: 0.82,
    history_capacity: 6,
};

impl DetectionMode {
    /// Resolves the static tuning profile for this mode.
    pub fn profile(&self) -> &'static ModeProfile {
        match self {
            DetectionMode::Standard => &STANDARD,
            DetectionMode::HighSensitivity => &HIGH_SENSITIVITY,
            DetectionMode::Archaeological => &ARCHAEOLOGICAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_MODES: [DetectionMode; 3] = [
        DetectionMode::Standard,
        DetectionMode::HighSensitivity,
        DetectionMode::Archaeological,
    ];

    #[test]
    fn profiles_are_well_formed() {
        for mode in ALL_MODES {
            let p = mode.profile();
            assert!(p.scale > 0.0 && p.scale <= 1.0, "{mode:?} scale");
            assert!(p.smoothing_alpha > 0.0 && p.smoothing_alpha < 1.0, "{mode:?} alpha");
            assert!(p.grid_size > 0);
            assert!(p.pixel_stride >= 1);
            assert!((5..=8).contains(&p.history_capacity), "{mode:?} history");
        }
    }

    #[test]
    fn lookup_is_stable() {
        assert_eq!(
            DetectionMode::Archaeological.profile(),
            DetectionMode::Archaeological.profile()
        );
    }
}
