pub mod admission;
pub mod calibration;
pub mod classifier;
pub mod feature_extractor;
pub mod frame_buffer;
pub mod mode_profile;
pub mod persistence;
