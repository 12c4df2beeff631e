// Result accumulator and report types
//
// Results are appended in traversal order as each pair resolves and sealed
// when the run completes. Clones share the same storage, so the reporting
// side can hold a read handle while the engine keeps appending.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::error::ScreeningError;
use crate::protocol::{all_pairs, ThresholdResult};

/// Overall screening outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreeningOutcome {
    /// Every pair was tested and passed
    Pass,
    /// At least one recorded pair failed
    Refer,
    /// Ended early with no failure among the recorded pairs
    Incomplete,
}

#[derive(Debug, Default)]
struct Inner {
    results: Vec<ThresholdResult>,
    sealed: bool,
}

/// Ordered, append-only collection of threshold results
#[derive(Debug, Clone, Default)]
pub struct ResultAccumulator {
    inner: Arc<RwLock<Inner>>,
}

impl ResultAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a resolved threshold
    ///
    /// # Returns
    /// * `Err(ScreeningError::DuplicateResult)` - Pair already recorded, or
    ///   the accumulator is sealed
    pub fn append(&self, result: ThresholdResult) -> Result<(), ScreeningError> {
        let mut inner = self.write();
        let duplicate = inner
            .results
            .iter()
            .any(|r| r.ear == result.ear && r.frequency == result.frequency);
        if inner.sealed || duplicate {
            return Err(ScreeningError::DuplicateResult {
                ear: result.ear,
                frequency: result.frequency,
            });
        }
        inner.results.push(result);
        Ok(())
    }

    /// Reject all further appends
    pub fn seal(&self) {
        self.write().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.read().sealed
    }

    pub fn snapshot(&self) -> Vec<ThresholdResult> {
        self.read().results.clone()
    }

    pub fn len(&self) -> usize {
        self.read().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().results.is_empty()
    }

    /// Whether every (ear, frequency) pair has a result
    pub fn is_complete(&self) -> bool {
        let inner = self.read();
        all_pairs().all(|(ear, frequency)| {
            inner
                .results
                .iter()
                .any(|r| r.ear == ear && r.frequency == frequency)
        })
    }

    pub fn outcome(&self) -> ScreeningOutcome {
        if self.read().results.iter().any(|r| !r.passed) {
            ScreeningOutcome::Refer
        } else if self.is_complete() {
            ScreeningOutcome::Pass
        } else {
            ScreeningOutcome::Incomplete
        }
    }

    // The accumulator holds plain data, so a poisoned lock is still consistent
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Patient details carried through to the report unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub age: String,
    #[serde(default)]
    pub notes: String,
}

/// Everything the reporting side needs after a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningReport {
    pub patient: PatientInfo,
    pub remarks: String,
    pub results: Vec<ThresholdResult>,
    pub outcome: ScreeningOutcome,
    /// False when the run was ended early
    pub completed_normally: bool,
    pub elapsed_ms: u64,
}
