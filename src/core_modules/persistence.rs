//! Calibration profile persistence.
//!
//! The pipeline itself only ever calls `load` at construction and `save` at
//! calibration completion; where the profile actually lives is the
//! collaborator's concern. Two implementations are provided: a JSON file
//! store for the field tool and an in-memory store for tests and headless
//! runs.

use crate::core_modules::calibration::CalibrationProfile;
use crate::error::ScanError;
use std::path::PathBuf;
use std::sync::Mutex;

/// The only persistence contract the pipeline requires.
pub trait CalibrationStore: Send + Sync {
    /// Returns the stored profile, or `None` when the device has never
    /// been calibrated.
    fn load(&self) -> Result<Option<CalibrationProfile>, ScanError>;
    fn save(&self, profile: &CalibrationProfile) -> Result<(), ScanError>;
}

/// Stores the profile as pretty-printed JSON at a fixed path.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CalibrationStore for JsonFileStore {
    fn load(&self) -> Result<Option<CalibrationProfile>, ScanError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| ScanError::persistence("failed to read calibration file", e))?;
        let profile = serde_json::from_str(&content)
            .map_err(|e| ScanError::persistence("failed to parse calibration file", e))?;
        Ok(Some(profile))
    }

    fn save(&self, profile: &CalibrationProfile) -> Result<(), ScanError> {
        let json = serde_json::to_string_pretty(profile)
            .map_err(|e| ScanError::persistence("failed to serialize calibration profile", e))?;
        std::fs::write(&self.path, json)
            .map_err(|e| ScanError::persistence("failed to write calibration file", e))
    }
}

/// Keeps the profile in memory for the lifetime of the process.
#[derive(Default)]
pub struct MemoryStore {
    profile: Mutex<Option<CalibrationProfile>>,
}

impl CalibrationStore for MemoryStore {
    fn load(&self) -> Result<Option<CalibrationProfile>, ScanError> {
        Ok(self.profile.lock().expect("store poisoned").clone())
    }

    fn save(&self, profile: &CalibrationProfile) -> Result<(), ScanError> {
        *self.profile.lock().expect("store poisoned") = Some(profile.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> CalibrationProfile {
        CalibrationProfile {
            baseline_specular: 0.06,
            baseline_diffuse: 0.7,
            baseline_variance: 0.03,
            baseline_brightness: 0.5,
            specular_adjustment: 1.0,
            diffuse_adjustment: 0.9,
            variance_baseline: 0.03,
            calibrated: true,
        }
    }

    #[test]
    fn json_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("calibration.json"));

        assert!(store.load().unwrap().is_none());
        store.save(&profile()).unwrap();
        assert_eq!(store.load().unwrap(), Some(profile()));
    }

    #[test]
    fn json_store_rejects_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        std::fs::write(&path, "not json").unwrap();

        let store = JsonFileStore::new(path);
        assert!(store.load().is_err());
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryStore::default();
        assert!(store.load().unwrap().is_none());
        store.save(&profile()).unwrap();
        assert_eq!(store.load().unwrap(), Some(profile()));
    }
}
