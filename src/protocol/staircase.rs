// Bracketing staircase - pure transition rules for one (ear, frequency) pair
//
// Start loud and step down on every "heard" until the descent floor or the
// first "not heard", then step up until the next "heard". The level of that
// reversal is the threshold. No response at the ceiling resolves the pair
// with the no-response sentinel.

use crate::config::ProtocolConfig;
use crate::protocol::types::{ThresholdResult, TrialPhase, TrialState};

/// Outcome of applying one operator response to the live trial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaircaseStep {
    /// Same pair, present this trial next
    Continue(TrialState),
    /// Pair resolved with this result
    Resolved(ThresholdResult),
}

/// Apply a response to the live trial
///
/// # Arguments
/// * `trial` - Trial the response refers to
/// * `heard` - Whether the child responded to the tone
/// * `config` - Protocol levels
pub fn next_step(trial: TrialState, heard: bool, config: &ProtocolConfig) -> StaircaseStep {
    let level = trial.nominal_level_db;

    if heard {
        if trial.phase == TrialPhase::Descending && level > config.descent_floor_db {
            return StaircaseStep::Continue(TrialState {
                nominal_level_db: level - config.step_db,
                ..trial
            });
        }

        return StaircaseStep::Resolved(ThresholdResult {
            ear: trial.ear,
            frequency: trial.frequency,
            threshold_db: level,
            passed: level <= config.pass_threshold_db,
        });
    }

    if level >= config.start_level_db {
        return StaircaseStep::Resolved(ThresholdResult {
            ear: trial.ear,
            frequency: trial.frequency,
            threshold_db: config.no_response_threshold_db,
            passed: false,
        });
    }

    StaircaseStep::Continue(TrialState {
        nominal_level_db: level + config.step_db,
        phase: TrialPhase::Ascending,
        ..trial
    })
}
