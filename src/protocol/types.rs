// Core screening vocabulary: ears, test frequencies, trial cursor and results.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;

/// Ear under test
///
/// Right is always tested before left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ear {
    Right,
    Left,
}

impl Ear {
    /// Traversal order across ears
    pub const ALL: [Ear; 2] = [Ear::Right, Ear::Left];

    /// Get the next ear in the traversal order
    ///
    /// # Returns
    /// * `Some(Ear)` - Next ear to test
    /// * `None` - Both ears done
    pub fn next(&self) -> Option<Ear> {
        match self {
            Ear::Right => Some(Ear::Left),
            Ear::Left => None,
        }
    }

    /// Get human-readable name for display
    pub fn display_name(&self) -> &'static str {
        match self {
            Ear::Right => "RIGHT",
            Ear::Left => "LEFT",
        }
    }
}

impl fmt::Display for Ear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Pure-tone test frequency
///
/// The declaration order is the traversal order within an ear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Frequency {
    Hz500,
    Hz1000,
    Hz2000,
    Hz4000,
}

impl Frequency {
    /// Traversal order within an ear
    pub const ALL: [Frequency; 4] = [
        Frequency::Hz500,
        Frequency::Hz1000,
        Frequency::Hz2000,
        Frequency::Hz4000,
    ];

    /// Frequency in Hz
    pub fn hz(&self) -> u32 {
        match self {
            Frequency::Hz500 => 500,
            Frequency::Hz1000 => 1000,
            Frequency::Hz2000 => 2000,
            Frequency::Hz4000 => 4000,
        }
    }

    /// Position in [`Frequency::ALL`], used for per-frequency tables
    pub fn index(&self) -> usize {
        match self {
            Frequency::Hz500 => 0,
            Frequency::Hz1000 => 1,
            Frequency::Hz2000 => 2,
            Frequency::Hz4000 => 3,
        }
    }

    /// Get the next frequency within the same ear
    pub fn next(&self) -> Option<Frequency> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Parse a raw Hz value coming from a boundary (CLI, JSON)
    pub fn from_hz(hz: u32) -> Result<Self, CalibrationError> {
        Self::ALL
            .into_iter()
            .find(|frequency| frequency.hz() == hz)
            .ok_or(CalibrationError::UnsupportedFrequency { hz })
    }
}

impl TryFrom<u32> for Frequency {
    type Error = CalibrationError;

    fn try_from(hz: u32) -> Result<Self, Self::Error> {
        Self::from_hz(hz)
    }
}

impl From<Frequency> for u32 {
    fn from(frequency: Frequency) -> Self {
        frequency.hz()
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz", self.hz())
    }
}

/// Direction of the staircase for the current pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialPhase {
    Descending,
    Ascending,
}

/// Live cursor of the threshold search
///
/// Replaced on every transition, never mutated in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialState {
    pub ear: Ear,
    pub frequency: Frequency,
    /// Nominal level in dB HL, before the calibration offset is applied
    pub nominal_level_db: i32,
    pub phase: TrialPhase,
}

impl TrialState {
    /// First trial for a pair: start level, descending
    pub fn initial(ear: Ear, frequency: Frequency, start_level_db: i32) -> Self {
        Self {
            ear,
            frequency,
            nominal_level_db: start_level_db,
            phase: TrialPhase::Descending,
        }
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ear, {}, {} dB HL ({:?})",
            self.ear, self.frequency, self.nominal_level_db, self.phase
        )
    }
}

/// Resolved threshold for one (ear, frequency) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub ear: Ear,
    pub frequency: Frequency,
    pub threshold_db: i32,
    pub passed: bool,
}

/// Next (ear, frequency) pair in traversal order: frequencies within an ear,
/// then the next ear.
pub fn next_pair(ear: Ear, frequency: Frequency) -> Option<(Ear, Frequency)> {
    match frequency.next() {
        Some(next_frequency) => Some((ear, next_frequency)),
        None => ear.next().map(|next_ear| (next_ear, Frequency::ALL[0])),
    }
}

/// Every (ear, frequency) pair in traversal order
pub fn all_pairs() -> impl Iterator<Item = (Ear, Frequency)> {
    Ear::ALL
        .into_iter()
        .flat_map(|ear| Frequency::ALL.into_iter().map(move |frequency| (ear, frequency)))
}
