// Calibration module - personal reference levels and applied offsets

pub mod persistence;
pub mod record;
pub mod store;

// Re-export commonly used types for convenience
pub use persistence::{CalibrationPersistence, InMemoryCalibration, JsonFileCalibration};
pub use record::CalibrationRecord;
pub use store::CalibrationStore;
