//! ScreeningEngine: the threshold-seeking state machine.
//!
//! The engine walks every (ear, frequency) pair with a bracketing staircase,
//! presenting tones through the [`ToneSynthesizer`] and collecting one
//! [`ThresholdResult`] per pair. State lives in a `watch` channel; every
//! transition is a check-and-replace on that channel, so a late playback
//! completion or a pause that outlives an early end can never move the
//! engine out of `Complete`.
//!
//! Suspension points (the inter-trial pause and tone playback) are raced
//! against the engine reaching `Complete`, which is how `complete_test`
//! cancels work already in flight. They run on a task owned by the engine,
//! so a caller that stops waiting never leaves the engine in `Presenting`.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::calibration::CalibrationStore;
use crate::config::ProtocolConfig;
use crate::engine::backend::PlaybackEnd;
use crate::engine::events::{ScreeningEvent, ScreeningEventKind};
use crate::engine::results::{PatientInfo, ResultAccumulator, ScreeningReport};
use crate::engine::synthesizer::{PlaybackHandle, ToneSynthesizer};
use crate::error::{log_screening_error, EngineStatus, ScreeningError};
use crate::protocol::{
    next_pair, next_step, Ear, Frequency, StaircaseStep, ThresholdResult, TrialState,
};

const EVENT_CAPACITY: usize = 64;

/// Observable engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "trial", rename_all = "snake_case")]
pub enum EngineState {
    NotStarted,
    /// Inter-trial pause or tone playback for this trial
    Presenting(TrialState),
    AwaitingResponse(TrialState),
    /// The response was applied but the next tone could not be played
    PresentationFailed(TrialState),
    Complete,
}

impl EngineState {
    pub fn status(&self) -> EngineStatus {
        match self {
            EngineState::NotStarted => EngineStatus::NotStarted,
            EngineState::Presenting(_) => EngineStatus::Presenting,
            EngineState::AwaitingResponse(_) => EngineStatus::AwaitingResponse,
            EngineState::PresentationFailed(_) => EngineStatus::PresentationFailed,
            EngineState::Complete => EngineStatus::Complete,
        }
    }

    /// Live trial, if any
    pub fn trial(&self) -> Option<TrialState> {
        match self {
            EngineState::Presenting(trial)
            | EngineState::AwaitingResponse(trial)
            | EngineState::PresentationFailed(trial) => Some(*trial),
            EngineState::NotStarted | EngineState::Complete => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, EngineState::Complete)
    }
}

/// Result of applying one response, decided under the state lock
enum Advance {
    Step {
        from: TrialState,
        next: TrialState,
    },
    NextPair {
        from: TrialState,
        result: ThresholdResult,
        next: TrialState,
    },
    Finished {
        from: TrialState,
        result: ThresholdResult,
    },
}

struct Shared {
    config: ProtocolConfig,
    synth: Arc<ToneSynthesizer>,
    state_tx: watch::Sender<EngineState>,
    events_tx: broadcast::Sender<ScreeningEvent>,
    results: ResultAccumulator,
    started_at: Mutex<Option<Instant>>,
    finished_at: Mutex<Option<Instant>>,
    presentation: Mutex<Option<AbortHandle>>,
}

/// Handle to one screening run. Clones share the same run.
#[derive(Clone)]
pub struct ScreeningEngine {
    shared: Arc<Shared>,
}

impl ScreeningEngine {
    pub fn new(config: ProtocolConfig, synth: Arc<ToneSynthesizer>) -> Self {
        let (state_tx, _) = watch::channel(EngineState::NotStarted);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                synth,
                state_tx,
                events_tx,
                results: ResultAccumulator::new(),
                started_at: Mutex::new(None),
                finished_at: Mutex::new(None),
                presentation: Mutex::new(None),
            }),
        }
    }

    // ========================================================================
    // OPERATOR COMMANDS
    // ========================================================================

    /// Begin the run with the right ear at the first frequency.
    ///
    /// Requires every frequency to be calibrated. The first tone is presented
    /// without a pause; the call returns once it has played and the engine
    /// awaits a response. If the tone cannot be played the engine stays
    /// `NotStarted`.
    pub async fn start(&self) -> Result<EngineState, ScreeningError> {
        let state = self.state();
        if state != EngineState::NotStarted {
            return Err(self.reject("start", state.status()));
        }
        self.calibration()
            .ensure_fully_calibrated()
            .map_err(ScreeningError::from)
            .inspect_err(|err| log_screening_error(err, "start"))?;

        let trial = TrialState::initial(
            Ear::ALL[0],
            Frequency::ALL[0],
            self.shared.config.start_level_db,
        );
        if !self.transition(EngineState::NotStarted, EngineState::Presenting(trial)) {
            return Err(self.reject("start", self.state().status()));
        }
        *self.shared.started_at.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Instant::now());
        info!(%trial, "Screening started");

        let engine = self.clone();
        self.run_presentation(async move {
            engine
                .present_trial(trial, false, EngineState::NotStarted)
                .await
        })
        .await
    }

    /// Apply the operator's judgement of the last tone.
    ///
    /// Only valid while awaiting a response. Returns the state after the next
    /// tone has played (or `Complete` after the last pair).
    pub async fn record_response(&self, heard: bool) -> Result<EngineState, ScreeningError> {
        let config = &self.shared.config;
        let results = &self.shared.results;
        let mut outcome: Result<Advance, ScreeningError> =
            Err(ScreeningError::invalid("record response", EngineStatus::NotStarted));

        self.shared.state_tx.send_if_modified(|state| {
            let trial = match *state {
                EngineState::AwaitingResponse(trial) => trial,
                other => {
                    outcome = Err(ScreeningError::invalid("record response", other.status()));
                    return false;
                }
            };
            match next_step(trial, heard, config) {
                StaircaseStep::Continue(next) => {
                    *state = EngineState::Presenting(next);
                    outcome = Ok(Advance::Step { from: trial, next });
                }
                StaircaseStep::Resolved(result) => {
                    if let Err(err) = results.append(result) {
                        outcome = Err(err);
                        return false;
                    }
                    match next_pair(trial.ear, trial.frequency) {
                        Some((ear, frequency)) => {
                            let next = TrialState::initial(ear, frequency, config.start_level_db);
                            *state = EngineState::Presenting(next);
                            outcome = Ok(Advance::NextPair {
                                from: trial,
                                result,
                                next,
                            });
                        }
                        None => {
                            *state = EngineState::Complete;
                            outcome = Ok(Advance::Finished {
                                from: trial,
                                result,
                            });
                        }
                    }
                }
            }
            true
        });

        let advance = outcome.inspect_err(|err| log_screening_error(err, "record_response"))?;

        match advance {
            Advance::Step { from, next } => {
                self.emit(ScreeningEventKind::ResponseRecorded { trial: from, heard });
                debug!(%from, %next, heard, "Staircase step");
                self.spawn_after_pause(next).await
            }
            Advance::NextPair { from, result, next } => {
                self.emit(ScreeningEventKind::ResponseRecorded { trial: from, heard });
                self.resolved(result);
                self.spawn_after_pause(next).await
            }
            Advance::Finished { from, result } => {
                self.emit(ScreeningEventKind::ResponseRecorded { trial: from, heard });
                self.resolved(result);
                self.finish(false);
                Ok(EngineState::Complete)
            }
        }
    }

    /// Play the current stimulus again without changing the trial.
    pub async fn replay(&self) -> Result<EngineState, ScreeningError> {
        let trial = self.claim("replay", |state| match state {
            EngineState::AwaitingResponse(trial) => Some(trial),
            _ => None,
        })?;
        debug!(%trial, "Replaying stimulus");
        let engine = self.clone();
        self.run_presentation(async move {
            engine
                .present_trial(trial, true, EngineState::AwaitingResponse(trial))
                .await
        })
        .await
    }

    /// Present the pending trial again after a failed presentation.
    ///
    /// No inter-trial pause is applied; the operator has already waited.
    pub async fn retry_presentation(&self) -> Result<EngineState, ScreeningError> {
        let trial = self.claim("retry presentation", |state| match state {
            EngineState::PresentationFailed(trial) => Some(trial),
            _ => None,
        })?;
        info!(%trial, "Retrying presentation");
        let engine = self.clone();
        self.run_presentation(async move {
            engine
                .present_trial(trial, false, EngineState::PresentationFailed(trial))
                .await
        })
        .await
    }

    /// End the run now.
    ///
    /// Cancels any pending pause and in-flight tone, moves to `Complete` and
    /// seals the results. Valid from any state except `Complete`.
    pub fn complete_test(&self) -> Result<(), ScreeningError> {
        let mut previous = EngineState::Complete;
        let changed = self.shared.state_tx.send_if_modified(|state| {
            previous = *state;
            if state.is_complete() {
                false
            } else {
                *state = EngineState::Complete;
                true
            }
        });
        if !changed {
            return Err(self.reject("complete test", previous.status()));
        }

        if let Some(task) = self
            .shared
            .presentation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.shared.synth.stop();
        info!(from = %previous.status(), "Screening ended early");
        self.finish(true);
        Ok(())
    }

    // ========================================================================
    // OBSERVATION
    // ========================================================================

    pub fn state(&self) -> EngineState {
        *self.shared.state_tx.borrow()
    }

    /// Receiver that observes every state change
    pub fn state_changes(&self) -> watch::Receiver<EngineState> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ScreeningEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Event stream that skips over lagged gaps
    pub fn event_stream(&self) -> impl Stream<Item = ScreeningEvent> {
        BroadcastStream::new(self.subscribe_events())
            .filter_map(|event| futures::future::ready(event.ok()))
    }

    /// Shared read handle on the results
    pub fn results(&self) -> ResultAccumulator {
        self.shared.results.clone()
    }

    pub fn synthesizer(&self) -> &Arc<ToneSynthesizer> {
        &self.shared.synth
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.shared.config
    }

    /// Whether both handles refer to the same run
    pub fn is_same_run(&self, other: &ScreeningEngine) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Build the report for a completed run
    pub fn report(
        &self,
        patient: PatientInfo,
        remarks: impl Into<String>,
    ) -> Result<ScreeningReport, ScreeningError> {
        let state = self.state();
        if !state.is_complete() {
            return Err(self.reject("build report", state.status()));
        }

        let results = self.shared.results.snapshot();
        let started = *self
            .shared
            .started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let finished = *self
            .shared
            .finished_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let elapsed_ms = match (started, finished) {
            (Some(started), Some(finished)) => {
                finished.saturating_duration_since(started).as_millis() as u64
            }
            _ => 0,
        };

        Ok(ScreeningReport {
            patient,
            remarks: remarks.into(),
            completed_normally: self.shared.results.is_complete(),
            outcome: self.shared.results.outcome(),
            results,
            elapsed_ms,
        })
    }

    // ========================================================================
    // HELPER METHODS
    // ========================================================================

    fn calibration(&self) -> &Arc<CalibrationStore> {
        self.shared.synth.calibration()
    }

    /// Replace `from` with `to` if the state is still `from`
    fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.shared.state_tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Atomically move an eligible state to `Presenting` and return its trial
    fn claim(
        &self,
        operation: &'static str,
        eligible: impl Fn(EngineState) -> Option<TrialState>,
    ) -> Result<TrialState, ScreeningError> {
        let mut outcome = Err(ScreeningError::invalid(operation, EngineStatus::NotStarted));
        self.shared.state_tx.send_if_modified(|state| match eligible(*state) {
            Some(trial) => {
                *state = EngineState::Presenting(trial);
                outcome = Ok(trial);
                true
            }
            None => {
                outcome = Err(ScreeningError::invalid(operation, state.status()));
                false
            }
        });
        outcome.inspect_err(|err| log_screening_error(err, operation))
    }

    fn reject(&self, operation: &'static str, state: EngineStatus) -> ScreeningError {
        let err = ScreeningError::invalid(operation, state);
        log_screening_error(&err, operation);
        err
    }

    /// Drive a presentation to completion on an engine-owned task.
    ///
    /// The returned future only observes the task: dropping it leaves the
    /// presentation running, and the engine still settles in
    /// `AwaitingResponse` or the failure state. `complete_test` aborts it.
    async fn run_presentation<F>(&self, work: F) -> Result<EngineState, ScreeningError>
    where
        F: Future<Output = Result<EngineState, ScreeningError>> + Send + 'static,
    {
        let task = tokio::spawn(work);
        *self
            .shared
            .presentation
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task.abort_handle());

        match task.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => {
                debug!("Presentation task aborted");
                Err(ScreeningError::invalid("present", self.state().status()))
            }
        }
    }

    async fn spawn_after_pause(&self, trial: TrialState) -> Result<EngineState, ScreeningError> {
        let engine = self.clone();
        self.run_presentation(async move { engine.present_after_pause(trial).await })
            .await
    }

    /// Wait out the inter-trial pause, then present `trial`
    async fn present_after_pause(&self, trial: TrialState) -> Result<EngineState, ScreeningError> {
        let pause = self.shared.config.inter_trial_pause();
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = self.completed() => {
                debug!(%trial, "Pending presentation cancelled");
                return Err(ScreeningError::invalid("present", EngineStatus::Complete));
            }
        }
        let state = self.state();
        if state != EngineState::Presenting(trial) {
            return Err(ScreeningError::invalid("present", state.status()));
        }
        self.present_trial(trial, false, EngineState::PresentationFailed(trial))
            .await
    }

    /// Play the stimulus for a trial already in `Presenting`.
    ///
    /// On playback failure the engine moves to `on_failure`.
    async fn present_trial(
        &self,
        trial: TrialState,
        replay: bool,
        on_failure: EngineState,
    ) -> Result<EngineState, ScreeningError> {
        let synth = &self.shared.synth;
        let presented = if replay {
            synth.replay()
        } else {
            synth.present(
                trial.ear,
                trial.frequency,
                trial.nominal_level_db,
                self.shared.config.tone_duration(),
            )
        };

        let handle = match presented {
            Ok(handle) => handle,
            Err(err) => {
                self.transition(EngineState::Presenting(trial), on_failure);
                warn!(%trial, error = %err, "Presentation failed");
                self.emit(ScreeningEventKind::Warning {
                    message: format!("Presentation failed for {}: {}", trial, err),
                });
                let err = ScreeningError::from(err);
                log_screening_error(&err, "present");
                return Err(err);
            }
        };

        self.emit(ScreeningEventKind::StimulusPresented {
            trial,
            physical_level_db: handle.stimulus().physical_level_db,
            replay,
        });
        self.await_playback(trial, handle).await?;

        let awaiting = EngineState::AwaitingResponse(trial);
        if self.transition(EngineState::Presenting(trial), awaiting) {
            Ok(awaiting)
        } else {
            Err(ScreeningError::invalid("present", self.state().status()))
        }
    }

    async fn await_playback(
        &self,
        trial: TrialState,
        handle: PlaybackHandle,
    ) -> Result<(), ScreeningError> {
        tokio::select! {
            end = handle => {
                if end == PlaybackEnd::Cancelled {
                    if self.state().is_complete() {
                        return Err(ScreeningError::invalid("present", EngineStatus::Complete));
                    }
                    warn!(%trial, "Playback ended early");
                }
                Ok(())
            }
            _ = self.completed() => {
                self.shared.synth.stop();
                Err(ScreeningError::invalid("present", EngineStatus::Complete))
            }
        }
    }

    /// Resolves once the engine is `Complete`
    async fn completed(&self) {
        let mut state_rx = self.shared.state_tx.subscribe();
        let _ = state_rx.wait_for(EngineState::is_complete).await;
    }

    fn resolved(&self, result: ThresholdResult) {
        info!(
            ear = %result.ear,
            frequency = %result.frequency,
            threshold_db = result.threshold_db,
            passed = result.passed,
            "Pair resolved"
        );
        self.emit(ScreeningEventKind::PairResolved { result });
    }

    fn finish(&self, early: bool) {
        self.shared.results.seal();
        *self
            .shared
            .finished_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        let results = self.shared.results.len();
        info!(early, results, "Screening complete");
        self.emit(ScreeningEventKind::Completed { early, results });
    }

    fn emit(&self, kind: ScreeningEventKind) {
        // No subscribers is fine
        let _ = self.shared.events_tx.send(ScreeningEvent::now(kind));
    }
}

#[cfg(test)]
mod tests;
