// Screening state machine error types

use crate::error::{CalibrationError, ErrorCode, ToneError};
use crate::protocol::{Ear, Frequency};
use log::error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Screening error code constants
///
/// Wrapped calibration and tone errors keep their own codes.
///
/// Error code range: 3001-3002
pub struct ScreeningErrorCodes {}

impl ScreeningErrorCodes {
    /// Operation not valid in the current engine state
    pub const INVALID_STATE: i32 = 3001;

    /// A result for this (ear, frequency) pair already exists, or results are sealed
    pub const DUPLICATE_RESULT: i32 = 3002;
}

/// Coarse engine state, without the trial payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    NotStarted,
    Presenting,
    AwaitingResponse,
    PresentationFailed,
    Complete,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineStatus::NotStarted => "not started",
            EngineStatus::Presenting => "presenting",
            EngineStatus::AwaitingResponse => "awaiting response",
            EngineStatus::PresentationFailed => "presentation failed",
            EngineStatus::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Log a screening error with structured context
pub fn log_screening_error(err: &ScreeningError, context: &str) {
    error!(
        "Screening error in {}: code={}, component=ScreeningEngine, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Screening engine errors
///
/// None of these are fatal: the engine keeps its state and the operator can
/// retry or correct the input.
#[derive(Debug, Clone, PartialEq)]
pub enum ScreeningError {
    /// Operation requested in a state that does not allow it
    InvalidState {
        operation: &'static str,
        state: EngineStatus,
    },

    /// Result already recorded for this pair, or results are sealed
    DuplicateResult { ear: Ear, frequency: Frequency },

    /// Calibration precondition or store failure
    Calibration(CalibrationError),

    /// Tone playback failure
    Tone(ToneError),
}

impl ScreeningError {
    pub(crate) fn invalid(operation: &'static str, state: EngineStatus) -> Self {
        ScreeningError::InvalidState { operation, state }
    }
}

impl ErrorCode for ScreeningError {
    fn code(&self) -> i32 {
        match self {
            ScreeningError::InvalidState { .. } => ScreeningErrorCodes::INVALID_STATE,
            ScreeningError::DuplicateResult { .. } => ScreeningErrorCodes::DUPLICATE_RESULT,
            ScreeningError::Calibration(err) => err.code(),
            ScreeningError::Tone(err) => err.code(),
        }
    }

    fn message(&self) -> String {
        match self {
            ScreeningError::InvalidState { operation, state } => {
                format!("Cannot {} while {}", operation, state)
            }
            ScreeningError::DuplicateResult { ear, frequency } => {
                format!("Result for {} ear at {} cannot be recorded", ear, frequency)
            }
            ScreeningError::Calibration(err) => err.message(),
            ScreeningError::Tone(err) => err.message(),
        }
    }
}

impl fmt::Display for ScreeningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScreeningError (code {}): {}", self.code(), self.message())
    }
}

impl std::error::Error for ScreeningError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScreeningError::Calibration(err) => Some(err),
            ScreeningError::Tone(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CalibrationError> for ScreeningError {
    fn from(err: CalibrationError) -> Self {
        ScreeningError::Calibration(err)
    }
}

impl From<ToneError> for ScreeningError {
    fn from(err: ToneError) -> Self {
        ScreeningError::Tone(err)
    }
}
