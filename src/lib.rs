// Hearing Screener Core - pediatric pure-tone screening engine
// Calibrated tone presentation and an adaptive threshold search per ear and frequency

// Module declarations
pub mod audio;
pub mod calibration;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod session;

// Re-exports for convenience
pub use calibration::{
    CalibrationPersistence, CalibrationRecord, CalibrationStore, InMemoryCalibration,
    JsonFileCalibration,
};
pub use config::AppConfig;
pub use engine::{
    AudioOutput, EngineState, PatientInfo, ScreeningEngine, ScreeningEvent, ScreeningOutcome,
    ScreeningReport, SimulatedOutput, ToneSynthesizer,
};
pub use error::{CalibrationError, ErrorCode, ScreeningError, ToneError};
pub use protocol::{Ear, Frequency, ThresholdResult, TrialPhase, TrialState};
pub use session::ScreeningSession;

use tracing::Level;

/// Initialize logging for binaries and tests
///
/// Installs a `tracing` fmt subscriber and bridges `log` records into it.
/// Calling it more than once is harmless.
pub fn init_logging(level: Level) {
    if tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok()
    {
        log::debug!("Logging initialized at {}", level);
    }
}
