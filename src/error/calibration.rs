// Calibration error types and constants

use crate::error::ErrorCode;
use crate::protocol::Frequency;
use log::error;
use std::fmt;

/// Calibration error code constants
///
/// Error code range: 2001-2005
pub struct CalibrationErrorCodes {}

impl CalibrationErrorCodes {
    /// One or more test frequencies have no reference level
    pub const NOT_CALIBRATED: i32 = 2001;

    /// Calibration state RwLock was poisoned
    pub const STATE_POISONED: i32 = 2002;

    /// Persisting or loading calibration failed
    pub const PERSISTENCE_FAILED: i32 = 2003;

    /// Calibration edits are locked while a screening run is active
    pub const SESSION_ACTIVE: i32 = 2004;

    /// Raw frequency value is not one of the test frequencies
    pub const UNSUPPORTED_FREQUENCY: i32 = 2005;
}

/// Log a calibration error with structured context
///
/// This function logs calibration errors with structured fields including:
/// - error_code: Numeric error code for programmatic handling
/// - component: The component where the error occurred
/// - message: Human-readable error message
/// - context: Additional contextual information
pub fn log_calibration_error(err: &CalibrationError, context: &str) {
    error!(
        "Calibration error in {}: code={}, component=CalibrationStore, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Calibration-related errors
///
/// Error code ranges: 2001-2005
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationError {
    /// Screening cannot start until every frequency has a reference
    NotCalibrated { missing: Vec<Frequency> },

    /// Calibration state RwLock was poisoned
    StatePoisoned,

    /// Calibration persistence failed; the in-memory value is still applied
    PersistenceFailed { reason: String },

    /// Calibration cannot be edited during an active screening run
    SessionActive,

    /// Raw frequency value is not a test frequency
    UnsupportedFrequency { hz: u32 },
}

impl ErrorCode for CalibrationError {
    fn code(&self) -> i32 {
        match self {
            CalibrationError::NotCalibrated { .. } => CalibrationErrorCodes::NOT_CALIBRATED,
            CalibrationError::StatePoisoned => CalibrationErrorCodes::STATE_POISONED,
            CalibrationError::PersistenceFailed { .. } => {
                CalibrationErrorCodes::PERSISTENCE_FAILED
            }
            CalibrationError::SessionActive => CalibrationErrorCodes::SESSION_ACTIVE,
            CalibrationError::UnsupportedFrequency { .. } => {
                CalibrationErrorCodes::UNSUPPORTED_FREQUENCY
            }
        }
    }

    fn message(&self) -> String {
        match self {
            CalibrationError::NotCalibrated { missing } => {
                let list: Vec<String> = missing.iter().map(|f| f.to_string()).collect();
                format!("Calibration missing for: {}", list.join(", "))
            }
            CalibrationError::StatePoisoned => "Calibration state lock poisoned".to_string(),
            CalibrationError::PersistenceFailed { reason } => {
                format!("Failed to persist calibration: {}", reason)
            }
            CalibrationError::SessionActive => {
                "Calibration is locked while a screening is running".to_string()
            }
            CalibrationError::UnsupportedFrequency { hz } => {
                format!("Unsupported test frequency: {} Hz", hz)
            }
        }
    }
}

impl fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CalibrationError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for CalibrationError {}

impl From<std::io::Error> for CalibrationError {
    fn from(err: std::io::Error) -> Self {
        CalibrationError::PersistenceFailed {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CalibrationError {
    fn from(err: serde_json::Error) -> Self {
        CalibrationError::PersistenceFailed {
            reason: err.to_string(),
        }
    }
}
