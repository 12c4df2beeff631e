// Error types for the hearing screener
//
// This module defines error types for tone playback, calibration and the
// screening state machine, each carrying a stable numeric code so operator
// front-ends can react without string matching.

mod audio;
mod calibration;
mod screening;

pub use audio::{log_tone_error, ToneError, ToneErrorCodes};
pub use calibration::{log_calibration_error, CalibrationError, CalibrationErrorCodes};
pub use screening::{log_screening_error, EngineStatus, ScreeningError, ScreeningErrorCodes};

/// Error codes for structured error reporting
///
/// This trait provides a standard way to get error codes and messages
/// from custom error types, enabling consistent error handling across
/// the operator interface.
pub trait ErrorCode {
    /// Get the numeric error code
    fn code(&self) -> i32;

    /// Get the human-readable error message
    fn message(&self) -> String;
}
