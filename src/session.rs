// ScreeningSession: explicitly owned session-wide context
//
// Owns the calibration store, the tone synthesizer and the persistence
// collaborator for the lifetime of the app, and hands out one screening
// engine per run. Calibration survives across runs; results do not.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::calibration::{CalibrationPersistence, CalibrationRecord, CalibrationStore};
use crate::config::AppConfig;
use crate::engine::{AudioOutput, ScreeningEngine, ToneSynthesizer};
use crate::error::{
    log_calibration_error, log_screening_error, CalibrationError, EngineStatus, ErrorCode,
    ScreeningError,
};
use crate::protocol::Frequency;

/// Session-wide screening context
///
/// # Example
/// ```ignore
/// let session = ScreeningSession::new(config, output, persistence);
/// session.load_calibration()?;
/// session.save_calibration(Frequency::Hz1000, 25)?;
/// let engine = session.begin_screening().await?;
/// engine.record_response(true).await?;
/// ```
pub struct ScreeningSession {
    config: AppConfig,
    calibration: Arc<CalibrationStore>,
    synth: Arc<ToneSynthesizer>,
    persistence: Arc<dyn CalibrationPersistence>,
    engine: RwLock<Option<ScreeningEngine>>,
}

impl ScreeningSession {
    pub fn new(
        config: AppConfig,
        output: Arc<dyn AudioOutput>,
        persistence: Arc<dyn CalibrationPersistence>,
    ) -> Self {
        let calibration = Arc::new(CalibrationStore::new(config.calibration.clone()));
        let synth = Arc::new(ToneSynthesizer::new(
            Arc::clone(&calibration),
            output,
            config.tone.clone(),
        ));
        Self {
            config,
            calibration,
            synth,
            persistence,
            engine: RwLock::new(None),
        }
    }

    /// Install persisted calibration into the store
    ///
    /// # Returns
    /// * `Ok(usize)` - Number of calibrated frequencies after loading
    /// * `Err(CalibrationError)` - Load failed; the store is left empty
    pub fn load_calibration(&self) -> Result<usize, CalibrationError> {
        let records = match self.persistence.load_calibration() {
            Ok(records) => records,
            Err(err) => {
                log_calibration_error(&err, "load_calibration");
                self.calibration.clear()?;
                return Err(err);
            }
        };

        self.calibration.load_records(records)?;
        let calibrated = Frequency::ALL
            .iter()
            .filter(|f| self.calibration.is_calibrated(**f))
            .count();
        log::info!(
            "[ScreeningSession] Loaded calibration, {}/{} frequencies calibrated",
            calibrated,
            Frequency::ALL.len()
        );
        Ok(calibrated)
    }

    /// Save an operator-entered reference level
    ///
    /// The in-memory store is updated first and stays updated even if the
    /// persistence collaborator then fails.
    ///
    /// # Errors
    /// - `SessionActive` while a screening run is in progress
    /// - `PersistenceFailed` when the reference could not be stored
    pub fn save_calibration(
        &self,
        frequency: Frequency,
        level_db: i32,
    ) -> Result<CalibrationRecord, CalibrationError> {
        if self.is_running() {
            let err = CalibrationError::SessionActive;
            log_calibration_error(&err, "save_calibration");
            return Err(err);
        }

        let record = self.calibration.record_reference(frequency, level_db)?;

        self.persistence
            .save_calibration_reference(frequency, level_db)
            .map_err(|err| match err {
                CalibrationError::PersistenceFailed { .. } => err,
                other => CalibrationError::PersistenceFailed {
                    reason: other.message(),
                },
            })
            .inspect_err(|err| {
                log::warn!(
                    "[ScreeningSession] {} reference kept in memory only: {}",
                    frequency,
                    err
                );
            })?;

        Ok(record)
    }

    /// Start a fresh screening run
    ///
    /// Any previous finished run is discarded. The returned engine is
    /// awaiting the first response.
    pub async fn begin_screening(&self) -> Result<ScreeningEngine, ScreeningError> {
        let engine = {
            let mut slot = self.write_engine();
            if let Some(current) = slot.as_ref() {
                let status = current.state().status();
                if is_active(status) {
                    let err = ScreeningError::invalid("begin screening", status);
                    log_screening_error(&err, "begin_screening");
                    return Err(err);
                }
            }
            let engine = ScreeningEngine::new(self.config.protocol.clone(), Arc::clone(&self.synth));
            *slot = Some(engine.clone());
            engine
        };

        if let Err(err) = engine.start().await {
            let mut slot = self.write_engine();
            if slot
                .as_ref()
                .is_some_and(|current| current.is_same_run(&engine))
            {
                *slot = None;
            }
            return Err(err);
        }

        Ok(engine)
    }

    /// Cancel any active run and discard the engine
    ///
    /// Calibration is untouched.
    pub fn reset(&self) {
        let previous = self.write_engine().take();
        if let Some(engine) = previous {
            if !engine.state().is_complete() && engine.complete_test().is_ok() {
                log::info!("[ScreeningSession] Active run cancelled by reset");
            }
        }
    }

    /// Engine of the current (or last) run
    pub fn engine(&self) -> Option<ScreeningEngine> {
        self.read_engine().clone()
    }

    /// Whether a run is between start and completion
    pub fn is_running(&self) -> bool {
        self.read_engine()
            .as_ref()
            .is_some_and(|engine| is_active(engine.state().status()))
    }

    pub fn calibration(&self) -> &Arc<CalibrationStore> {
        &self.calibration
    }

    pub fn synthesizer(&self) -> &Arc<ToneSynthesizer> {
        &self.synth
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    // ========================================================================
    // HELPER METHODS
    // ========================================================================

    // The slot only holds a cloneable handle, so a poisoned lock is still usable
    fn read_engine(&self) -> RwLockReadGuard<'_, Option<ScreeningEngine>> {
        self.engine.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_engine(&self) -> RwLockWriteGuard<'_, Option<ScreeningEngine>> {
        self.engine.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_active(status: EngineStatus) -> bool {
    !matches!(status, EngineStatus::NotStarted | EngineStatus::Complete)
}
