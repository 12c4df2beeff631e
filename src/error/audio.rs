// Tone playback error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Tone playback error code constants
///
/// Single source of truth for the codes reported to operator front-ends.
///
/// Error code range: 1001-1005
pub struct ToneErrorCodes {}

impl ToneErrorCodes {
    /// Output device could not be resumed
    pub const AUDIO_UNAVAILABLE: i32 = 1001;

    /// A tone is already in flight
    pub const ALREADY_PLAYING: i32 = 1002;

    /// Replay requested before any tone was presented
    pub const NO_STIMULUS: i32 = 1003;

    /// Failed to open the output stream
    pub const STREAM_OPEN_FAILED: i32 = 1004;

    /// Mutex/RwLock was poisoned
    pub const LOCK_POISONED: i32 = 1005;
}

/// Log a tone playback error with structured context
///
/// This function logs playback errors with structured fields including:
/// - error_code: Numeric error code for programmatic handling
/// - component: The component where the error occurred
/// - message: Human-readable error message
/// - context: Additional contextual information
pub fn log_tone_error(err: &ToneError, context: &str) {
    error!(
        "Tone error in {}: code={}, component=ToneSynthesizer, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Tone playback errors
///
/// These errors cover the output device lifecycle and the single in-flight
/// stimulus guard.
///
/// Error code ranges: 1001-1005
#[derive(Debug, Clone, PartialEq)]
pub enum ToneError {
    /// Output device is unavailable and could not be resumed
    AudioUnavailable { reason: String },

    /// A stimulus is already playing
    AlreadyPlaying,

    /// Nothing has been presented yet, so there is nothing to replay
    NoStimulus,

    /// Failed to open the output stream
    StreamOpenFailed { reason: String },

    /// Mutex/RwLock was poisoned
    LockPoisoned { component: String },
}

impl ErrorCode for ToneError {
    fn code(&self) -> i32 {
        match self {
            ToneError::AudioUnavailable { .. } => ToneErrorCodes::AUDIO_UNAVAILABLE,
            ToneError::AlreadyPlaying => ToneErrorCodes::ALREADY_PLAYING,
            ToneError::NoStimulus => ToneErrorCodes::NO_STIMULUS,
            ToneError::StreamOpenFailed { .. } => ToneErrorCodes::STREAM_OPEN_FAILED,
            ToneError::LockPoisoned { .. } => ToneErrorCodes::LOCK_POISONED,
        }
    }

    fn message(&self) -> String {
        match self {
            ToneError::AudioUnavailable { reason } => {
                format!("Audio output unavailable: {}. Retry.", reason)
            }
            ToneError::AlreadyPlaying => {
                "A tone is already playing. Wait for it to finish.".to_string()
            }
            ToneError::NoStimulus => "No tone has been presented yet".to_string(),
            ToneError::StreamOpenFailed { reason } => {
                format!("Failed to open audio stream: {}", reason)
            }
            ToneError::LockPoisoned { component } => {
                format!("Lock poisoned for component: {}", component)
            }
        }
    }
}

impl fmt::Display for ToneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ToneError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for ToneError {}
