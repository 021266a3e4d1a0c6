// THEORY:
// The `feature_extractor` module is the numeric heart of the analyzer. It
// turns one owned frame into four reflectivity features, in a fixed order:
//
// 1.  Downsample to the mode's working resolution. Every later step reads
//     the downsampled image only, which makes per-frame cost independent of
//     the camera's native resolution.
// 2.  Average brightness: Rec. 709 luminance of the whole-frame average
//     color, normalized to [0, 1]. Computed exactly once per frame and
//     threaded through to the specular step.
// 3.  Brightness variance: spatial unevenness, measured as the population
//     variance of mean brightness across an N x N cell grid.
// 4.  Specular score: the fraction of pixels at or above an adaptive
//     highlight threshold derived from the average brightness.
// 5.  Diffuse score: the inverse image of the variance; an evenly-lit
//     surface with near-zero spatial variance scores near 1.
//
// Everything in this module is a pure function of its inputs. Statefulness
// (smoothing histories, calibration) lives in the pipeline above.

use crate::core_modules::frame_buffer::OwnedBuffer;
use crate::core_modules::mode_profile::ModeProfile;
use crate::error::ScanError;
use image::{ImageBuffer, Rgba, RgbaImage, imageops};
use std::time::Duration;

/// Ceiling of the adaptive specular threshold; a fully blown-out frame must
/// still leave headroom for highlights to register.
const ADAPTIVE_THRESHOLD_CEILING: f64 = 0.95;

/// Rec. 709 luma weights.
const LUMA_R: f64 = 0.2126;
const LUMA_G: f64 = 0.7152;
const LUMA_B: f64 = 0.0722;

/// The unsmoothed per-frame feature set, before temporal stabilization and
/// classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawFeatures {
    pub average_brightness: f64,
    pub brightness_variance: f64,
    pub specular_score: f64,
    pub diffuse_score: f64,
    /// Capture timestamp carried through from the source frame.
    pub timestamp: Duration,
}

/// Runs the full extraction sequence on one owned frame.
pub fn extract(buffer: &OwnedBuffer, profile: &ModeProfile) -> Result<RawFeatures, ScanError> {
    let sample = downsample(buffer, profile.scale)?;

    let average_brightness = average_brightness(&sample);
    let brightness_variance = grid_variance(&sample, profile.grid_size);

    let threshold = adaptive_threshold(
        average_brightness,
        profile.specular_base_threshold,
        profile.specular_adaptive_offset,
    );
    let specular_score = specular_fraction(&sample, threshold, profile.pixel_stride);
    let diffuse_score = diffuse_score(brightness_variance, profile.diffuse_variance_multiplier);

    Ok(RawFeatures {
        average_brightness,
        brightness_variance,
        specular_score,
        diffuse_score,
        timestamp: buffer.timestamp,
    })
}

/// Resamples the owned frame down to `scale` of its native resolution.
fn downsample(buffer: &OwnedBuffer, scale: f64) -> Result<RgbaImage, ScanError> {
    if buffer.width == 0 || buffer.height == 0 {
        return Err(ScanError::analysis("cannot analyze an empty frame"));
    }
    let source: ImageBuffer<Rgba<u8>, &[u8]> =
        ImageBuffer::from_raw(buffer.width, buffer.height, buffer.data.as_slice())
            .ok_or_else(|| ScanError::analysis("frame buffer does not match its geometry"))?;

    let target_w = ((buffer.width as f64 * scale).round() as u32).max(1);
    let target_h = ((buffer.height as f64 * scale).round() as u32).max(1);
    if target_w == buffer.width && target_h == buffer.height {
        // scale = 1.0: keep the pixels as-is.
        return RgbaImage::from_raw(buffer.width, buffer.height, buffer.data.clone())
            .ok_or_else(|| ScanError::analysis("frame buffer does not match its geometry"));
    }
    Ok(imageops::resize(
        &source,
        target_w,
        target_h,
        imageops::FilterType::Triangle,
    ))
}

fn luminance(r: u8, g: u8, b: u8) -> f64 {
    (LUMA_R * r as f64 + LUMA_G * g as f64 + LUMA_B * b as f64) / 255.0
}

/// Rec. 709 luminance of the whole-frame average color, in [0, 1].
pub fn average_brightness(sample: &RgbaImage) -> f64 {
    let num_pixels = sample.pixels().len();
    if num_pixels == 0 {
        return 0.0;
    }

    let mut sum_r = 0u64;
    let mut sum_g = 0u64;
    let mut sum_b = 0u64;
    for px in sample.pixels() {
        sum_r += px.0[0] as u64;
        sum_g += px.0[1] as u64;
        sum_b += px.0[2] as u64;
    }

    let n = num_pixels as f64;
    (LUMA_R * (sum_r as f64 / n) + LUMA_G * (sum_g as f64 / n) + LUMA_B * (sum_b as f64 / n))
        / 255.0
}

/// Population variance of mean brightness across an N x N cell grid.
///
/// Cells that fall outside the image at small resolutions are skipped; the
/// variance is taken over the cells that actually contain pixels.
pub fn grid_variance(sample: &RgbaImage, grid_size: u32) -> f64 {
    let (w, h) = sample.dimensions();
    if w == 0 || h == 0 || grid_size == 0 {
        return 0.0;
    }

    let mut cell_means = Vec::with_capacity((grid_size * grid_size) as usize);
    for cy in 0..grid_size {
        for cx in 0..grid_size {
            let x0 = cx * w / grid_size;
            let x1 = (cx + 1) * w / grid_size;
            let y0 = cy * h / grid_size;
            let y1 = (cy + 1) * h / grid_size;
            if x1 <= x0 || y1 <= y0 {
                continue;
            }

            let mut sum = 0.0;
            for y in y0..y1 {
                for x in x0..x1 {
                    let px = sample.get_pixel(x, y);
                    sum += luminance(px.0[0], px.0[1], px.0[2]);
                }
            }
            cell_means.push(sum / ((x1 - x0) * (y1 - y0)) as f64);
        }
    }

    if cell_means.is_empty() {
        return 0.0;
    }
    let count = cell_means.len() as f64;
    let mean = cell_means.iter().sum::<f64>() / count;
    cell_means.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / count
}

/// The brightness level above which a pixel counts as a specular highlight.
pub fn adaptive_threshold(average_brightness: f64, base: f64, offset: f64) -> f64 {
    base.max((average_brightness + offset).min(ADAPTIVE_THRESHOLD_CEILING))
}

/// Fraction of sampled pixels at or above the highlight threshold.
///
/// Sampling every `stride`-th pixel trades exactness for speed; at stride 1
/// the result is the exact fraction.
pub fn specular_fraction(sample: &RgbaImage, threshold: f64, stride: usize) -> f64 {
    let stride = stride.max(1);
    let mut sampled = 0u64;
    let mut bright = 0u64;
    for px in sample.pixels().step_by(stride) {
        sampled += 1;
        if luminance(px.0[0], px.0[1], px.0[2]) >= threshold {
            bright += 1;
        }
    }
    if sampled == 0 {
        return 0.0;
    }
    bright as f64 / sampled as f64
}

/// Inverse spatial-variance score: near-zero variance reads as maximally
/// diffuse, saturating at 0 once `variance * multiplier` reaches 1.
pub fn diffuse_score(brightness_variance: f64, multiplier: f64) -> f64 {
    1.0 - (brightness_variance * multiplier).min(1.0)
}
