// THEORY:
// The classifier is a pure threshold cascade: given the smoothed specular
// score and the raw per-frame features, it assigns one of three closed
// surface categories. Order matters and is part of the contract: the Shiny
// test runs strictly before the Matte test, so a glossy surface that also
// happens to score high on diffuseness classifies as Shiny.

/// The closed surface classification produced for every analyzed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceType {
    /// Specular highlights plus uneven brightness: polished stone, glaze,
    /// metal.
    Shiny,
    /// Evenly scattered reflection: unpolished stone, clay, plaster.
    Matte,
    /// Neither test passed with confidence.
    Unknown,
}

impl SurfaceType {
    pub fn label(&self) -> &'static str {
        match self {
            SurfaceType::Shiny => "Reflective surface",
            SurfaceType::Matte => "Matte surface",
            SurfaceType::Unknown => "Analyzing...",
        }
    }

    /// Fixed overlay color (RGB) for this surface category.
    pub fn display_color(&self) -> [u8; 3] {
        match self {
            SurfaceType::Shiny => [255, 214, 64],
            SurfaceType::Matte => [96, 160, 255],
            SurfaceType::Unknown => [160, 160, 160],
        }
    }
}

/// The fully resolved thresholds in effect for one classification: mode
/// defaults with the calibration adjustments already multiplied in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveThresholds {
    /// Smoothed specular score above which a surface can be Shiny.
    pub specular_cutoff: f64,
    /// Brightness variance a Shiny surface must also exceed.
    pub variance_threshold: f64,
    /// Diffuse score above which a surface is Matte.
    pub diffuse_threshold: f64,
}

/// Assigns a surface category from smoothed and raw features.
///
/// Pure function: identical inputs always produce the identical category.
pub fn classify(
    stable_specular: f64,
    diffuse_score: f64,
    brightness_variance: f64,
    thresholds: &ActiveThresholds,
) -> SurfaceType {
    if stable_specular > thresholds.specular_cutoff
        && brightness_variance > thresholds.variance_threshold
    {
        SurfaceType::Shiny
    } else if diffuse_score > thresholds.diffuse_threshold {
        SurfaceType::Matte
    } else {
        SurfaceType::Unknown
    }
}
