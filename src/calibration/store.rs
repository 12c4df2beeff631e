// CalibrationStore - per-frequency references and applied offsets
//
// Histories live behind an RwLock and are written only by explicit save
// actions. The derived offsets are mirrored into per-frequency atomics so the
// tone synthesizer can read them on every presentation without locking.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::calibration::record::{now_unix_ms, CalibrationRecord};
use crate::config::CalibrationConfig;
use crate::error::{log_calibration_error, CalibrationError};
use crate::protocol::Frequency;

const FREQUENCY_COUNT: usize = Frequency::ALL.len();

/// Calibration state for every test frequency
pub struct CalibrationStore {
    records: RwLock<Vec<CalibrationRecord>>,
    offsets: [AtomicI32; FREQUENCY_COUNT],
    calibrated: [AtomicBool; FREQUENCY_COUNT],
    config: CalibrationConfig,
}

impl CalibrationStore {
    /// Create an empty store (no frequency calibrated)
    pub fn new(config: CalibrationConfig) -> Self {
        Self {
            records: RwLock::new(Frequency::ALL.into_iter().map(CalibrationRecord::new).collect()),
            offsets: std::array::from_fn(|_| AtomicI32::new(0)),
            calibrated: std::array::from_fn(|_| AtomicBool::new(false)),
            config,
        }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Record an operator-entered reference level
    ///
    /// Appends to the frequency's history (evicting the oldest entry at
    /// capacity), recomputes the applied offset and stamps the save time.
    /// Levels outside the usual 0..=max range are accepted but logged.
    ///
    /// # Returns
    /// * `Ok(CalibrationRecord)` - Updated record
    /// * `Err(CalibrationError)` - Lock poisoning
    pub fn record_reference(
        &self,
        frequency: Frequency,
        level_db: i32,
    ) -> Result<CalibrationRecord, CalibrationError> {
        if !(0..=self.config.max_reference_db).contains(&level_db) {
            log::warn!(
                "[CalibrationStore] Reference {} dB at {} is outside 0..={} dB",
                level_db,
                frequency,
                self.config.max_reference_db
            );
        }

        let mut records = self.write_records().inspect_err(|err| {
            log_calibration_error(err, "record_reference");
        })?;

        let record = &mut records[frequency.index()];
        record.push_reference(level_db, self.config.history_capacity, now_unix_ms());
        self.publish(record);

        log::info!(
            "[CalibrationStore] {} reference {} dB, history {:?}, offset {} dB",
            frequency,
            level_db,
            record.history(),
            self.applied_offset(frequency)
        );

        Ok(record.clone())
    }

    /// Offset added to nominal levels at this frequency
    ///
    /// Returns 0 for uncalibrated frequencies, which then play at nominal level.
    pub fn applied_offset(&self, frequency: Frequency) -> i32 {
        self.offsets[frequency.index()].load(Ordering::Acquire)
    }

    pub fn is_calibrated(&self, frequency: Frequency) -> bool {
        self.calibrated[frequency.index()].load(Ordering::Acquire)
    }

    /// Whether every test frequency has at least one reference
    pub fn is_fully_calibrated(&self) -> bool {
        Frequency::ALL.iter().all(|f| self.is_calibrated(*f))
    }

    /// Frequencies without any reference, in traversal order
    pub fn missing_frequencies(&self) -> Vec<Frequency> {
        Frequency::ALL
            .into_iter()
            .filter(|f| !self.is_calibrated(*f))
            .collect()
    }

    /// Fail with `NotCalibrated` unless every frequency is calibrated
    pub fn ensure_fully_calibrated(&self) -> Result<(), CalibrationError> {
        let missing = self.missing_frequencies();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CalibrationError::NotCalibrated { missing })
        }
    }

    /// Snapshot of one frequency's record
    pub fn record(&self, frequency: Frequency) -> Result<CalibrationRecord, CalibrationError> {
        let records = self.read_records()?;
        Ok(records[frequency.index()].clone())
    }

    /// Snapshot of every record in frequency order
    pub fn records(&self) -> Result<Vec<CalibrationRecord>, CalibrationError> {
        Ok(self.read_records()?.clone())
    }

    /// Replace the store contents with persisted records
    ///
    /// Frequencies missing from `loaded` become uncalibrated. Histories longer
    /// than the configured capacity keep their newest entries.
    pub fn load_records(&self, loaded: Vec<CalibrationRecord>) -> Result<(), CalibrationError> {
        let mut records = self.write_records().inspect_err(|err| {
            log_calibration_error(err, "load_records");
        })?;

        for (slot, frequency) in records.iter_mut().zip(Frequency::ALL) {
            *slot = CalibrationRecord::new(frequency);
        }
        for mut record in loaded {
            record.trim_to(self.config.history_capacity);
            let index = record.frequency.index();
            records[index] = record;
        }
        for record in records.iter() {
            self.publish(record);
        }

        Ok(())
    }

    /// Forget every reference
    pub fn clear(&self) -> Result<(), CalibrationError> {
        self.load_records(Vec::new())
    }

    // ========================================================================
    // HELPER METHODS
    // ========================================================================

    /// Mirror a record's derived values into the lock-free tables
    fn publish(&self, record: &CalibrationRecord) {
        let index = record.frequency.index();
        let offset = record
            .applied_offset(self.config.reference_floor_db)
            .unwrap_or(0);
        self.offsets[index].store(offset, Ordering::Release);
        self.calibrated[index].store(record.is_calibrated(), Ordering::Release);
    }

    fn read_records(
        &self,
    ) -> Result<RwLockReadGuard<'_, Vec<CalibrationRecord>>, CalibrationError> {
        self.records
            .read()
            .map_err(|_| CalibrationError::StatePoisoned)
    }

    fn write_records(
        &self,
    ) -> Result<RwLockWriteGuard<'_, Vec<CalibrationRecord>>, CalibrationError> {
        self.records
            .write()
            .map_err(|_| CalibrationError::StatePoisoned)
    }
}

impl Default for CalibrationStore {
    fn default() -> Self {
        Self::new(CalibrationConfig::default())
    }
}
