//! Screening events broadcast to operator front-ends and loggers.

use serde::{Deserialize, Serialize};

use crate::calibration::record::now_unix_ms;
use crate::protocol::{ThresholdResult, TrialState};

/// What happened during a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ScreeningEventKind {
    StimulusPresented {
        trial: TrialState,
        physical_level_db: i32,
        replay: bool,
    },
    ResponseRecorded {
        trial: TrialState,
        heard: bool,
    },
    PairResolved {
        result: ThresholdResult,
    },
    Completed {
        early: bool,
        results: usize,
    },
    Warning {
        message: String,
    },
}

/// Timestamped screening event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreeningEvent {
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: ScreeningEventKind,
}

impl ScreeningEvent {
    pub fn now(kind: ScreeningEventKind) -> Self {
        Self {
            timestamp_ms: now_unix_ms(),
            kind,
        }
    }
}
