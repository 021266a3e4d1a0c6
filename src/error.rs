//! Error types for the reliefscan analysis pipeline.

use thiserror::Error;

/// Result type alias for reliefscan operations
pub type Result<T> = std::result::Result<T, ScanError>;

/// Why a frame delivered to the pipeline was not analyzed.
///
/// These are admission outcomes, not errors: every variant degrades to
/// "this frame is skipped and a counter is incremented," and the next
/// frame is processed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Less than the configured processing interval has elapsed since the
    /// last admitted frame.
    Throttled,
    /// All concurrency permits were held for the full admission timeout.
    SaturatedBuffer,
    /// The pipeline-owned copy of the frame could not be allocated.
    AllocationFailed,
    /// Feature extraction failed after the frame was admitted.
    AnalysisFailed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Throttled => "throttled",
            DropReason::SaturatedBuffer => "saturated_buffer",
            DropReason::AllocationFailed => "allocation_failed",
            DropReason::AnalysisFailed => "analysis_failed",
        }
    }
}

/// Error types for frame analysis and calibration persistence.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The pipeline-owned frame copy could not be allocated.
    #[error("Failed to allocate frame buffer of {requested_bytes} bytes")]
    BufferAllocation { requested_bytes: usize },

    /// The delivered frame does not match its declared geometry.
    #[error("Invalid frame: expected {expected} bytes for {width}x{height}, got {actual}")]
    InvalidFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    /// Downsampling or feature extraction failed.
    #[error("Analysis failed: {reason}")]
    Analysis { reason: String },

    /// The calibration profile could not be loaded or saved.
    #[error("Calibration persistence error: {message}")]
    Persistence {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ScanError {
    /// Create an analysis error from a reason string.
    pub fn analysis(reason: impl Into<String>) -> Self {
        Self::Analysis {
            reason: reason.into(),
        }
    }

    /// Create a persistence error with context.
    pub fn persistence<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Persistence {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this error indicates a per-frame recoverable condition.
    ///
    /// Recoverable errors drop one frame and leave the pipeline running.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ScanError::BufferAllocation { .. }
                | ScanError::InvalidFrame { .. }
                | ScanError::Analysis { .. }
        )
    }

    /// The drop reason to record when this error aborts a frame.
    pub fn drop_reason(&self) -> DropReason {
        match self {
            ScanError::BufferAllocation { .. } => DropReason::AllocationFailed,
            _ => DropReason::AnalysisFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_errors_are_recoverable() {
        assert!(ScanError::BufferAllocation { requested_bytes: 1 }.is_recoverable());
        assert!(ScanError::analysis("resample failed").is_recoverable());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert!(!ScanError::persistence("save failed", io).is_recoverable());
    }

    #[test]
    fn drop_reason_maps_allocation_separately() {
        let alloc = ScanError::BufferAllocation { requested_bytes: 64 };
        assert_eq!(alloc.drop_reason(), DropReason::AllocationFailed);
        assert_eq!(
            ScanError::analysis("x").drop_reason(),
            DropReason::AnalysisFailed
        );
    }
}
