// THEORY:
// This file is the main entry point for the `reliefscan` library crate.
// It follows the standard Rust convention of using `lib.rs` to define the
// public API that will be exposed to external consumers (the capture layer
// and the overlay UI).
//
// The primary goal is to export the two pipeline flavors and their data
// structures as the clean, high-level interface for the reflectivity
// engine: `ReflectivityPipeline` for single-owner synchronous use and
// `ParallelPipeline` for the admission-controlled concurrent stream. The
// internal modules (`core_modules`) stay encapsulated behind re-exports.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use core_modules::admission::{BufferStats, BufferStatsSnapshot};
pub use core_modules::calibration::{
    CalibrationProfile, CalibrationState, DriftSignal,
};
pub use core_modules::classifier::SurfaceType;
pub use core_modules::frame_buffer::{PixelFormat, RawFrame};
pub use core_modules::mode_profile::{DetectionMode, ModeProfile};
pub use core_modules::persistence::{CalibrationStore, JsonFileStore, MemoryStore};
pub use error::{DropReason, ScanError};
pub use parallel_pipeline::{ParallelPipeline, ScanEvent, SubmitOutcome};
pub use pipeline::{FrameResult, ReflectivityMetrics, ReflectivityPipeline, ScannerConfig};
