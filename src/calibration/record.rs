// CalibrationRecord - bounded reference history for one test frequency
//
// The operator plays a tone and lowers it until the listener reports it as
// just audible; that level is the reference. The applied offset is derived
// from the smallest of the most recent references, which favours the most
// sensitive report over a single conservative trial.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::protocol::Frequency;

/// Reference history and derived offset for one frequency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub frequency: Frequency,
    /// Most recent reference levels in dB, oldest first
    #[serde(default)]
    history: VecDeque<i32>,
    /// Unix timestamp of the last saved reference
    #[serde(default)]
    pub last_calibrated_ms: Option<u64>,
}

impl CalibrationRecord {
    /// Create an empty (uncalibrated) record
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            history: VecDeque::new(),
            last_calibrated_ms: None,
        }
    }

    /// Create a record from existing history, keeping the newest `capacity` values
    pub fn with_history(frequency: Frequency, history: &[i32], capacity: usize) -> Self {
        let mut record = Self::new(frequency);
        record.history.extend(history.iter().copied());
        record.trim_to(capacity);
        record
    }

    /// Append a reference level, evicting the oldest values beyond `capacity`
    ///
    /// # Arguments
    /// * `level_db` - Operator-entered just-audible level
    /// * `capacity` - Maximum history length
    /// * `timestamp_ms` - Unix time of the save
    pub fn push_reference(&mut self, level_db: i32, capacity: usize, timestamp_ms: u64) {
        self.history.push_back(level_db);
        self.trim_to(capacity);
        self.last_calibrated_ms = Some(timestamp_ms);
    }

    /// Drop the oldest entries until at most `capacity` remain (never below one)
    pub fn trim_to(&mut self, capacity: usize) {
        let capacity = capacity.max(1);
        while self.history.len() > capacity {
            self.history.pop_front();
        }
    }

    /// Reference history, oldest first
    pub fn history(&self) -> &VecDeque<i32> {
        &self.history
    }

    pub fn is_calibrated(&self) -> bool {
        !self.history.is_empty()
    }

    /// Smallest reference in the history
    pub fn min_reference_db(&self) -> Option<i32> {
        self.history.iter().copied().min()
    }

    /// Offset added to nominal levels: `min(history) - reference_floor_db`
    ///
    /// # Returns
    /// `None` when no reference has been recorded
    pub fn applied_offset(&self, reference_floor_db: i32) -> Option<i32> {
        self.min_reference_db()
            .map(|min_db| min_db - reference_floor_db)
    }
}

/// Current unix time in milliseconds
pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_is_uncalibrated() {
        let record = CalibrationRecord::new(Frequency::Hz1000);
        assert!(!record.is_calibrated());
        assert_eq!(record.applied_offset(15), None);
        assert_eq!(record.last_calibrated_ms, None);
    }

    #[test]
    fn test_push_evicts_oldest() {
        let mut record = CalibrationRecord::new(Frequency::Hz1000);
        for (i, level) in [20, 25, 30, 35].into_iter().enumerate() {
            record.push_reference(level, 3, i as u64);
        }
        assert_eq!(record.history().iter().copied().collect::<Vec<_>>(), vec![25, 30, 35]);
        assert_eq!(record.last_calibrated_ms, Some(3));
    }

    #[test]
    fn test_applied_offset_uses_minimum() {
        let mut record = CalibrationRecord::new(Frequency::Hz500);
        record.push_reference(30, 3, 0);
        assert_eq!(record.applied_offset(15), Some(15));
        record.push_reference(20, 3, 0);
        assert_eq!(record.applied_offset(15), Some(5));
        record.push_reference(40, 3, 0);
        assert_eq!(record.applied_offset(15), Some(5));
        // 30 and 20 are evicted, leaving 40 and two newer values
        record.push_reference(25, 3, 0);
        record.push_reference(35, 3, 0);
        assert_eq!(record.applied_offset(15), Some(10));
    }

    #[test]
    fn test_offset_can_be_negative() {
        let mut record = CalibrationRecord::new(Frequency::Hz4000);
        record.push_reference(5, 3, 0);
        assert_eq!(record.applied_offset(15), Some(-10));
    }

    #[test]
    fn test_zero_capacity_keeps_latest_reference() {
        let mut record = CalibrationRecord::new(Frequency::Hz500);
        record.push_reference(30, 0, 0);
        record.push_reference(20, 0, 1);
        assert!(record.is_calibrated());
        assert_eq!(record.history().iter().copied().collect::<Vec<_>>(), vec![20]);
        assert_eq!(record.applied_offset(15), Some(5));
    }

    #[test]
    fn test_with_history_keeps_newest() {
        let record = CalibrationRecord::with_history(Frequency::Hz2000, &[10, 20, 30, 40, 50], 3);
        assert_eq!(record.history().iter().copied().collect::<Vec<_>>(), vec![30, 40, 50]);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut record = CalibrationRecord::new(Frequency::Hz2000);
        record.push_reference(22, 3, 1_700_000_000_000);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"frequency\":2000"));
        let parsed: CalibrationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
