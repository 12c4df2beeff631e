// Protocol module - screening vocabulary and the staircase rules

pub mod staircase;
pub mod types;

pub use staircase::{next_step, StaircaseStep};
pub use types::{all_pairs, next_pair, Ear, Frequency, ThresholdResult, TrialPhase, TrialState};
