//! Engine module housing the screening core.
//!
//! This module exposes trait-based output backends (`backend`), the
//! calibrated tone presenter (`synthesizer`) and the threshold-seeking state
//! machine (`screening`) with its results and events.

pub mod backend;
pub mod events;
pub mod results;
pub mod screening;
pub mod synthesizer;

#[cfg(feature = "cpal_output")]
pub use backend::CpalOutput;
pub use backend::{default_output, AudioOutput, PlaybackCompletion, PlaybackEnd, SimulatedOutput};
pub use events::{ScreeningEvent, ScreeningEventKind};
pub use results::{PatientInfo, ResultAccumulator, ScreeningOutcome, ScreeningReport};
pub use screening::{EngineState, ScreeningEngine};
pub use synthesizer::{PlaybackHandle, Stimulus, ToneSynthesizer};
