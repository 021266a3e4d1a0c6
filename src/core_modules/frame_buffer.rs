// THEORY:
// The `frame_buffer` module draws the ownership boundary between the camera
// source and the analysis pipeline. A camera delivers frames out of a small
// ring of reusable buffers and is free to recycle the memory the moment the
// delivering call returns, so the pipeline must never hold a reference into
// source-owned storage across any suspension point.
//
// Key architectural principles:
// 1.  **Explicit Ownership Transfer**: `copy_frame` is the single mandatory
//     step that turns a borrowed `RawFrame` into an independently-owned
//     `OwnedBuffer`. Nothing downstream ever sees the borrowed data.
// 2.  **Fallible Allocation**: the copy can fail under memory pressure. That
//     failure is an ordinary per-frame drop, not a crash; the caller counts
//     the frame and moves on.
// 3.  **Format Normalization**: camera stacks commonly deliver BGRA. The
//     swizzle to RGBA happens here, once, so every downstream consumer can
//     assume a single channel layout.

use crate::error::ScanError;
use std::time::Duration;

const BYTES_PER_PIXEL: usize = 4;

/// Channel layout of the pixel data delivered by the frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8,
    Bgra8,
}

/// A single frame as delivered by the camera source.
///
/// The pixel data is borrowed; the source may recycle the underlying
/// storage as soon as the delivering call returns. The pipeline never
/// retains this reference past `copy_frame`.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub pixel_data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Capture time on the source's clock.
    pub timestamp: Duration,
}

/// A pipeline-private, independently-owned copy of one frame.
///
/// Always RGBA regardless of the source format. Deliberately not `Clone`:
/// exactly one pipeline stage owns the buffer at a time, and dropping it
/// at the end of that stage is the release.
#[derive(Debug)]
pub struct OwnedBuffer {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Duration,
}

/// Deep-copies a source frame into a pipeline-owned RGBA buffer.
///
/// Fails with `BufferAllocation` when the destination cannot be allocated
/// and `InvalidFrame` when the payload does not match the declared
/// geometry. Both are per-frame drops for the caller.
pub fn copy_frame(frame: &RawFrame<'_>) -> Result<OwnedBuffer, ScanError> {
    let expected = frame.width as usize * frame.height as usize * BYTES_PER_PIXEL;
    if frame.pixel_data.len() != expected {
        return Err(ScanError::InvalidFrame {
            width: frame.width,
            height: frame.height,
            expected,
            actual: frame.pixel_data.len(),
        });
    }

    let mut data = Vec::new();
    data.try_reserve_exact(expected)
        .map_err(|_| ScanError::BufferAllocation {
            requested_bytes: expected,
        })?;
    data.extend_from_slice(frame.pixel_data);

    if frame.format == PixelFormat::Bgra8 {
        for px in data.chunks_exact_mut(BYTES_PER_PIXEL) {
            px.swap(0, 2);
        }
    }

    Ok(OwnedBuffer {
        data,
        width: frame.width,
        height: frame.height,
        timestamp: frame.timestamp,
    })
}
