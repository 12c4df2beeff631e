use super::*;

use std::time::Duration;

use crate::config::{CalibrationConfig, ToneConfig};
use crate::engine::backend::{AudioOutput, SimulatedOutput};
use crate::engine::results::ScreeningOutcome;
use crate::error::{CalibrationError, ToneError};
use crate::protocol::{all_pairs, TrialPhase};

struct Harness {
    engine: ScreeningEngine,
    output: Arc<SimulatedOutput>,
    calibration: Arc<CalibrationStore>,
}

fn harness_with(calibrate: &[Frequency]) -> Harness {
    let calibration = Arc::new(CalibrationStore::new(CalibrationConfig::default()));
    for frequency in calibrate {
        calibration.record_reference(*frequency, 20).unwrap();
    }
    let output = Arc::new(SimulatedOutput::new());
    let synth = Arc::new(ToneSynthesizer::new(
        Arc::clone(&calibration),
        output.clone() as Arc<dyn AudioOutput>,
        ToneConfig::default(),
    ));
    Harness {
        engine: ScreeningEngine::new(ProtocolConfig::default(), synth),
        output,
        calibration,
    }
}

fn harness() -> Harness {
    harness_with(&Frequency::ALL)
}

fn awaiting(ear: Ear, frequency: Frequency, level: i32, phase: TrialPhase) -> EngineState {
    EngineState::AwaitingResponse(TrialState {
        ear,
        frequency,
        nominal_level_db: level,
        phase,
    })
}

/// Answer as a listener whose true threshold is `threshold_for(ear, frequency)`
async fn run_listener(
    engine: &ScreeningEngine,
    threshold_for: impl Fn(Ear, Frequency) -> i32,
) -> Vec<ThresholdResult> {
    let mut state = engine.start().await.unwrap();
    while let EngineState::AwaitingResponse(trial) = state {
        let heard = trial.nominal_level_db >= threshold_for(trial.ear, trial.frequency);
        state = engine.record_response(heard).await.unwrap();
    }
    assert_eq!(state, EngineState::Complete);
    engine.results().snapshot()
}

#[tokio::test(start_paused = true)]
async fn test_start_requires_calibration() {
    let h = harness_with(&[Frequency::Hz500, Frequency::Hz1000]);
    let err = h.engine.start().await.unwrap_err();
    assert_eq!(
        err,
        ScreeningError::Calibration(CalibrationError::NotCalibrated {
            missing: vec![Frequency::Hz2000, Frequency::Hz4000]
        })
    );
    assert_eq!(h.engine.state(), EngineState::NotStarted);
    assert_eq!(h.output.play_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_presents_first_trial_immediately() {
    let h = harness();
    let started = Instant::now();
    let state = h.engine.start().await.unwrap();

    assert_eq!(
        state,
        awaiting(Ear::Right, Frequency::Hz500, 50, TrialPhase::Descending)
    );
    // Tone only, no pause before the first stimulus
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1500) && elapsed < Duration::from_millis(1600));

    let played = h.output.played();
    assert_eq!(played.len(), 1);
    assert_eq!(played[0].frequency_hz, 500.0);
    // Offset 20 - 15 = 5 dB on top of 50 dB nominal
    assert_eq!(
        h.engine.synthesizer().last_stimulus().unwrap().physical_level_db,
        55
    );
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_rejected() {
    let h = harness();
    h.engine.start().await.unwrap();
    assert_eq!(
        h.engine.start().await.unwrap_err(),
        ScreeningError::InvalidState {
            operation: "start",
            state: EngineStatus::AwaitingResponse
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_start_with_unavailable_output_stays_not_started() {
    let h = harness();
    h.output.set_available(false);
    let err = h.engine.start().await.unwrap_err();
    assert!(matches!(
        err,
        ScreeningError::Tone(ToneError::AudioUnavailable { .. })
    ));
    assert_eq!(h.engine.state(), EngineState::NotStarted);

    h.output.set_available(true);
    assert!(h.engine.start().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_bracketing_sequence() {
    let h = harness();
    h.engine.start().await.unwrap();

    // 50 heard, 40 heard, 30 heard, 20 not heard, 30 heard
    let expected = [
        (true, awaiting(Ear::Right, Frequency::Hz500, 40, TrialPhase::Descending)),
        (true, awaiting(Ear::Right, Frequency::Hz500, 30, TrialPhase::Descending)),
        (true, awaiting(Ear::Right, Frequency::Hz500, 20, TrialPhase::Descending)),
        (false, awaiting(Ear::Right, Frequency::Hz500, 30, TrialPhase::Ascending)),
        (true, awaiting(Ear::Right, Frequency::Hz1000, 50, TrialPhase::Descending)),
    ];
    for (heard, next_state) in expected {
        assert_eq!(h.engine.record_response(heard).await.unwrap(), next_state);
    }

    assert_eq!(
        h.engine.results().snapshot(),
        vec![ThresholdResult {
            ear: Ear::Right,
            frequency: Frequency::Hz500,
            threshold_db: 30,
            passed: true,
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_pause_precedes_every_next_stimulus() {
    let h = harness();
    h.engine.start().await.unwrap();

    let before = Instant::now();
    h.engine.record_response(true).await.unwrap();
    let elapsed = before.elapsed();
    assert!(elapsed >= Duration::from_millis(4500) && elapsed < Duration::from_millis(4600));
    assert_eq!(h.output.play_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_no_response_at_start_level() {
    let h = harness();
    h.engine.start().await.unwrap();
    let state = h.engine.record_response(false).await.unwrap();

    assert_eq!(
        state,
        awaiting(Ear::Right, Frequency::Hz1000, 50, TrialPhase::Descending)
    );
    let result = h.engine.results().snapshot()[0];
    assert_eq!(result.threshold_db, 60);
    assert!(!result.passed);
}

#[tokio::test(start_paused = true)]
async fn test_full_run_normal_hearing() {
    let h = harness();
    let results = run_listener(&h.engine, |_, _| 15).await;

    assert_eq!(results.len(), 8);
    let pairs: Vec<_> = results.iter().map(|r| (r.ear, r.frequency)).collect();
    assert_eq!(pairs, all_pairs().collect::<Vec<_>>());
    assert!(results.iter().all(|r| r.passed && r.threshold_db == 20));
    assert!(h.engine.results().is_sealed());
    assert_eq!(h.engine.results().outcome(), ScreeningOutcome::Pass);
}

#[tokio::test(start_paused = true)]
async fn test_full_run_mixed_hearing() {
    let h = harness();
    let results = run_listener(&h.engine, |ear, frequency| match (ear, frequency) {
        (Ear::Left, Frequency::Hz4000) => 70,
        (Ear::Left, _) => 35,
        _ => 25,
    })
    .await;

    for result in &results {
        match (result.ear, result.frequency) {
            (Ear::Left, Frequency::Hz4000) => {
                assert_eq!(result.threshold_db, 60);
                assert!(!result.passed);
            }
            (Ear::Left, _) => {
                assert_eq!(result.threshold_db, 40);
                assert!(!result.passed);
            }
            _ => {
                assert_eq!(result.threshold_db, 30);
                assert!(result.passed);
            }
        }
    }

    let report = h.engine.report(PatientInfo::default(), "").unwrap();
    assert_eq!(report.outcome, ScreeningOutcome::Refer);
    assert!(report.completed_normally);
    assert!(report.elapsed_ms > 0);
}

#[tokio::test(start_paused = true)]
async fn test_replay_keeps_trial_and_results() {
    let h = harness();
    h.engine.start().await.unwrap();
    h.engine.record_response(true).await.unwrap();

    let before = h.engine.state();
    for _ in 0..3 {
        assert_eq!(h.engine.replay().await.unwrap(), before);
    }
    assert_eq!(h.engine.state(), before);
    assert!(h.engine.results().is_empty());

    let played = h.output.played();
    assert_eq!(played.len(), 5);
    assert!(played[1..].iter().all(|request| *request == played[1]));
}

#[tokio::test(start_paused = true)]
async fn test_replay_resumes_suspended_output() {
    let h = harness();
    h.engine.start().await.unwrap();
    h.output.suspend();
    h.engine.replay().await.unwrap();
    assert_eq!(h.output.resume_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_replay_failure_keeps_awaiting() {
    let h = harness();
    let state = h.engine.start().await.unwrap();
    h.output.set_available(false);
    assert!(h.engine.replay().await.is_err());
    assert_eq!(h.engine.state(), state);
}

#[tokio::test(start_paused = true)]
async fn test_operations_rejected_before_start() {
    let h = harness();
    assert_eq!(
        h.engine.record_response(true).await.unwrap_err(),
        ScreeningError::InvalidState {
            operation: "record response",
            state: EngineStatus::NotStarted
        }
    );
    assert!(matches!(
        h.engine.replay().await,
        Err(ScreeningError::InvalidState { .. })
    ));
    assert!(matches!(
        h.engine.retry_presentation().await,
        Err(ScreeningError::InvalidState { .. })
    ));
    assert!(h.engine.report(PatientInfo::default(), "").is_err());
}

#[tokio::test(start_paused = true)]
async fn test_response_while_presenting_rejected() {
    let h = harness();
    let engine = h.engine.clone();
    let task = tokio::spawn(async move { engine.start().await });

    let mut states = h.engine.state_changes();
    states
        .wait_for(|state| matches!(state, EngineState::Presenting(_)))
        .await
        .unwrap();

    assert_eq!(
        h.engine.record_response(true).await.unwrap_err(),
        ScreeningError::InvalidState {
            operation: "record response",
            state: EngineStatus::Presenting
        }
    );
    assert!(h.engine.results().is_empty());
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_presentation_failure_parks_and_retries() {
    let h = harness();
    h.engine.start().await.unwrap();
    h.output.set_available(false);

    let err = h.engine.record_response(true).await.unwrap_err();
    assert!(matches!(
        err,
        ScreeningError::Tone(ToneError::AudioUnavailable { .. })
    ));
    let pending = TrialState {
        ear: Ear::Right,
        frequency: Frequency::Hz500,
        nominal_level_db: 40,
        phase: TrialPhase::Descending,
    };
    assert_eq!(h.engine.state(), EngineState::PresentationFailed(pending));
    assert!(h.engine.record_response(true).await.is_err());

    h.output.set_available(true);
    let before = Instant::now();
    let state = h.engine.retry_presentation().await.unwrap();
    assert_eq!(state, EngineState::AwaitingResponse(pending));
    // No pause on retry
    assert!(before.elapsed() < Duration::from_millis(1600));
}

#[tokio::test(start_paused = true)]
async fn test_complete_during_pause_cancels_presentation() {
    let h = harness();
    h.engine.start().await.unwrap();
    assert_eq!(h.output.play_count(), 1);

    let engine = h.engine.clone();
    let task = tokio::spawn(async move { engine.record_response(true).await });

    // Inside the 3 s pause
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.engine.complete_test().unwrap();

    assert_eq!(
        task.await.unwrap().unwrap_err(),
        ScreeningError::InvalidState {
            operation: "present",
            state: EngineStatus::Complete
        }
    );

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.output.play_count(), 1);
    assert_eq!(h.engine.state(), EngineState::Complete);
    assert!(h.engine.results().is_sealed());
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_response_still_presents_next_trial() {
    let h = harness();
    h.engine.start().await.unwrap();

    // Caller gives up during the pause
    let waited =
        tokio::time::timeout(Duration::from_millis(100), h.engine.record_response(true)).await;
    assert!(waited.is_err());

    tokio::time::sleep(Duration::from_secs(30)).await;
    let next = awaiting(Ear::Right, Frequency::Hz500, 40, TrialPhase::Descending);
    assert_eq!(h.engine.state(), next);
    assert_eq!(h.output.play_count(), 2);

    // The run carries on normally
    h.engine.replay().await.unwrap();
    assert_eq!(
        h.engine.record_response(true).await.unwrap(),
        awaiting(Ear::Right, Frequency::Hz500, 30, TrialPhase::Descending)
    );
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_replay_returns_to_awaiting() {
    let h = harness();
    let first = h.engine.start().await.unwrap();

    let waited = tokio::time::timeout(Duration::from_millis(200), h.engine.replay()).await;
    assert!(waited.is_err());
    assert!(matches!(h.engine.state(), EngineState::Presenting(_)));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.engine.state(), first);
    assert_eq!(h.output.play_count(), 2);
    assert!(h.engine.results().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_complete_during_tone_stops_playback() {
    let h = harness();
    let engine = h.engine.clone();
    let task = tokio::spawn(async move { engine.start().await });

    let mut states = h.engine.state_changes();
    states
        .wait_for(|state| matches!(state, EngineState::Presenting(_)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    h.engine.complete_test().unwrap();

    assert!(task.await.unwrap().is_err());
    assert!(!h.output.is_sounding());
    assert!(!h.engine.synthesizer().is_playing());
    assert_eq!(h.engine.state(), EngineState::Complete);
}

#[tokio::test(start_paused = true)]
async fn test_early_completion_report() {
    let h = harness();
    h.engine.start().await.unwrap();
    // Resolve the first pair at 20 dB
    for heard in [true, true, true, true] {
        h.engine.record_response(heard).await.unwrap();
    }
    h.engine.complete_test().unwrap();

    let results = h.engine.results();
    assert_eq!(results.len(), 1);
    assert!(results
        .append(ThresholdResult {
            ear: Ear::Right,
            frequency: Frequency::Hz1000,
            threshold_db: 20,
            passed: true,
        })
        .is_err());

    let report = h
        .engine
        .report(
            PatientInfo {
                name: "Test Child".to_string(),
                ..PatientInfo::default()
            },
            "Ended early",
        )
        .unwrap();
    assert_eq!(report.outcome, ScreeningOutcome::Incomplete);
    assert!(!report.completed_normally);
    assert_eq!(report.remarks, "Ended early");
    assert_eq!(report.patient.name, "Test Child");
}

#[tokio::test(start_paused = true)]
async fn test_everything_rejected_after_complete() {
    let h = harness();
    h.engine.start().await.unwrap();
    h.engine.complete_test().unwrap();

    let complete = EngineStatus::Complete;
    assert!(matches!(
        h.engine.record_response(true).await,
        Err(ScreeningError::InvalidState { state, .. }) if state == complete
    ));
    assert!(matches!(
        h.engine.replay().await,
        Err(ScreeningError::InvalidState { state, .. }) if state == complete
    ));
    assert!(matches!(
        h.engine.start().await,
        Err(ScreeningError::InvalidState { state, .. }) if state == complete
    ));
    assert!(matches!(
        h.engine.retry_presentation().await,
        Err(ScreeningError::InvalidState { state, .. }) if state == complete
    ));
    assert!(matches!(
        h.engine.complete_test(),
        Err(ScreeningError::InvalidState { state, .. }) if state == complete
    ));
}

#[tokio::test(start_paused = true)]
async fn test_calibration_offset_applies_per_frequency() {
    let h = harness_with(&[Frequency::Hz500, Frequency::Hz2000, Frequency::Hz4000]);
    h.calibration.record_reference(Frequency::Hz1000, 35).unwrap();
    h.engine.start().await.unwrap();
    h.engine.record_response(false).await.unwrap();

    // 1000 Hz: 50 nominal + (35 - 15)
    let stimulus = h.engine.synthesizer().last_stimulus().unwrap();
    assert_eq!(stimulus.frequency, Frequency::Hz1000);
    assert_eq!(stimulus.physical_level_db, 70);
}

#[tokio::test(start_paused = true)]
async fn test_events_are_broadcast() {
    let h = harness();
    let mut events = h.engine.subscribe_events();
    h.engine.start().await.unwrap();
    h.engine.record_response(false).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }

    assert!(matches!(
        kinds[0],
        ScreeningEventKind::StimulusPresented {
            replay: false,
            physical_level_db: 55,
            ..
        }
    ));
    assert!(matches!(
        kinds[1],
        ScreeningEventKind::ResponseRecorded { heard: false, .. }
    ));
    assert!(matches!(
        kinds[2],
        ScreeningEventKind::PairResolved { result } if result.threshold_db == 60
    ));
    assert!(matches!(
        kinds[3],
        ScreeningEventKind::StimulusPresented { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_event_stream_sees_completion() {
    let h = harness();
    let stream = h.engine.event_stream();
    futures::pin_mut!(stream);

    h.engine.start().await.unwrap();
    h.engine.complete_test().unwrap();

    let mut completed = None;
    while let Some(event) = stream.next().await {
        if let ScreeningEventKind::Completed { early, results } = event.kind {
            completed = Some((early, results));
            break;
        }
    }
    assert_eq!(completed, Some((true, 0)));
}
