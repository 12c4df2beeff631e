// Calibration persistence collaborators
//
// The store is the source of truth during a session; persistence only loads
// it at session start and receives each saved reference afterwards.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::calibration::record::{now_unix_ms, CalibrationRecord};
use crate::error::CalibrationError;
use crate::protocol::Frequency;

/// Boundary to wherever calibration is stored between sessions
pub trait CalibrationPersistence: Send + Sync {
    /// Load every stored record (frequencies never calibrated may be absent)
    fn load_calibration(&self) -> Result<Vec<CalibrationRecord>, CalibrationError>;

    /// Persist one newly entered reference level
    fn save_calibration_reference(
        &self,
        frequency: Frequency,
        level_db: i32,
    ) -> Result<(), CalibrationError>;
}

/// On-disk layout of the calibration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CalibrationFile {
    #[serde(default)]
    records: Vec<CalibrationRecord>,
    #[serde(default)]
    last_calibration_ms: Option<u64>,
}

/// Apply one saved reference to a list of records, creating the record if needed
fn apply_reference(
    records: &mut Vec<CalibrationRecord>,
    frequency: Frequency,
    level_db: i32,
    capacity: usize,
    timestamp_ms: u64,
) {
    match records.iter_mut().find(|r| r.frequency == frequency) {
        Some(record) => record.push_reference(level_db, capacity, timestamp_ms),
        None => {
            let mut record = CalibrationRecord::new(frequency);
            record.push_reference(level_db, capacity, timestamp_ms);
            records.push(record);
            records.sort_by_key(|r| r.frequency);
        }
    }
}

/// JSON file persistence
///
/// Each save is a read-modify-write of the whole file, written through a
/// temporary sibling and renamed into place.
pub struct JsonFileCalibration {
    path: PathBuf,
    history_capacity: usize,
}

impl JsonFileCalibration {
    pub fn new<P: AsRef<Path>>(path: P, history_capacity: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            history_capacity,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<CalibrationFile, CalibrationError> {
        if !self.path.exists() {
            return Ok(CalibrationFile::default());
        }
        let contents = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn write_file(&self, file: &CalibrationFile) -> Result<(), CalibrationError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl CalibrationPersistence for JsonFileCalibration {
    fn load_calibration(&self) -> Result<Vec<CalibrationRecord>, CalibrationError> {
        let file = self.read_file()?;
        log::info!(
            "[CalibrationFile] Loaded {} record(s) from {:?}",
            file.records.len(),
            self.path
        );
        Ok(file.records)
    }

    fn save_calibration_reference(
        &self,
        frequency: Frequency,
        level_db: i32,
    ) -> Result<(), CalibrationError> {
        let mut file = self.read_file()?;
        let timestamp_ms = now_unix_ms();
        apply_reference(
            &mut file.records,
            frequency,
            level_db,
            self.history_capacity,
            timestamp_ms,
        );
        file.last_calibration_ms = Some(timestamp_ms);
        self.write_file(&file)?;
        log::debug!(
            "[CalibrationFile] Saved {} dB at {} to {:?}",
            level_db,
            frequency,
            self.path
        );
        Ok(())
    }
}

/// Volatile persistence, useful for kiosks and tests
pub struct InMemoryCalibration {
    records: Mutex<Vec<CalibrationRecord>>,
    history_capacity: usize,
}

impl InMemoryCalibration {
    pub fn new(history_capacity: usize) -> Self {
        Self::with_records(Vec::new(), history_capacity)
    }

    pub fn with_records(records: Vec<CalibrationRecord>, history_capacity: usize) -> Self {
        Self {
            records: Mutex::new(records),
            history_capacity,
        }
    }

    fn lock_records(&self) -> Result<MutexGuard<'_, Vec<CalibrationRecord>>, CalibrationError> {
        self.records
            .lock()
            .map_err(|_| CalibrationError::StatePoisoned)
    }
}

impl CalibrationPersistence for InMemoryCalibration {
    fn load_calibration(&self) -> Result<Vec<CalibrationRecord>, CalibrationError> {
        Ok(self.lock_records()?.clone())
    }

    fn save_calibration_reference(
        &self,
        frequency: Frequency,
        level_db: i32,
    ) -> Result<(), CalibrationError> {
        let mut records = self.lock_records()?;
        apply_reference(
            &mut records,
            frequency,
            level_db,
            self.history_capacity,
            now_unix_ms(),
        );
        Ok(())
    }
}
