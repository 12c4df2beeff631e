// ToneSynthesizer - turns a trial into a calibrated stimulus on the output
//
// Physical level is the nominal level plus the per-frequency applied offset,
// read lock-free from the calibration store on every presentation. Only one
// stimulus may be in flight; the flag is released when the returned handle
// resolves or is dropped.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;

use crate::audio::{amplitude_for_level, Pan, PlaybackRequest};
use crate::calibration::CalibrationStore;
use crate::config::ToneConfig;
use crate::engine::backend::{AudioOutput, PlaybackCompletion, PlaybackEnd};
use crate::error::{log_tone_error, ErrorCode, ToneError};
use crate::protocol::{Ear, Frequency};

/// A stimulus as it was sent to the output
#[derive(Debug, Clone, PartialEq)]
pub struct Stimulus {
    pub ear: Ear,
    pub frequency: Frequency,
    pub nominal_level_db: i32,
    /// Nominal level plus the applied calibration offset
    pub physical_level_db: i32,
    pub request: PlaybackRequest,
}

/// Clears the in-flight flag when dropped
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Awaitable playback of one stimulus
///
/// Resolves to [`PlaybackEnd::Finished`] when the tone has fully played, or
/// [`PlaybackEnd::Cancelled`] when it was stopped.
pub struct PlaybackHandle {
    completion: PlaybackCompletion,
    guard: Option<InFlightGuard>,
    stimulus: Stimulus,
}

impl PlaybackHandle {
    pub fn stimulus(&self) -> &Stimulus {
        &self.stimulus
    }
}

impl Future for PlaybackHandle {
    type Output = PlaybackEnd;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let poll = this.completion.poll_unpin(cx);
        if poll.is_ready() {
            this.guard.take();
        }
        poll
    }
}

/// Calibrated pure-tone presenter
pub struct ToneSynthesizer {
    calibration: Arc<CalibrationStore>,
    output: Arc<dyn AudioOutput>,
    config: ToneConfig,
    in_flight: Arc<AtomicBool>,
    last: Mutex<Option<Stimulus>>,
}

impl ToneSynthesizer {
    pub fn new(
        calibration: Arc<CalibrationStore>,
        output: Arc<dyn AudioOutput>,
        config: ToneConfig,
    ) -> Self {
        Self {
            calibration,
            output,
            config,
            in_flight: Arc::new(AtomicBool::new(false)),
            last: Mutex::new(None),
        }
    }

    /// Present a tone at a nominal level to one ear
    ///
    /// # Arguments
    /// * `ear` - Ear to route the tone to (full pan)
    /// * `frequency` - Test frequency
    /// * `nominal_level_db` - Level before calibration offset
    /// * `duration` - Total tone length including ramps
    ///
    /// # Returns
    /// * `Ok(PlaybackHandle)` - Playback started
    /// * `Err(ToneError::AlreadyPlaying)` - Another stimulus is in flight
    /// * `Err(ToneError::AudioUnavailable)` - Output could not be resumed
    pub fn present(
        &self,
        ear: Ear,
        frequency: Frequency,
        nominal_level_db: i32,
        duration: Duration,
    ) -> Result<PlaybackHandle, ToneError> {
        let physical_level_db = nominal_level_db + self.calibration.applied_offset(frequency);

        let stimulus = Stimulus {
            ear,
            frequency,
            nominal_level_db,
            physical_level_db,
            request: PlaybackRequest {
                frequency_hz: frequency.hz() as f32,
                amplitude: amplitude_for_level(
                    physical_level_db,
                    self.config.full_scale_reference_db,
                ),
                pan: Pan::from(ear),
                duration,
                ramp: self.config.ramp(),
            },
        };

        self.play(stimulus).inspect_err(|err| {
            log_tone_error(err, "present");
        })
    }

    /// Re-present the most recent stimulus unchanged
    ///
    /// # Returns
    /// * `Err(ToneError::NoStimulus)` - Nothing has been presented yet
    pub fn replay(&self) -> Result<PlaybackHandle, ToneError> {
        let stimulus = self.lock_last()?.clone().ok_or(ToneError::NoStimulus)?;
        self.play(stimulus).inspect_err(|err| {
            log_tone_error(err, "replay");
        })
    }

    /// Cancel the in-flight stimulus, if any
    pub fn stop(&self) {
        if self.is_playing() {
            log::debug!("[ToneSynthesizer] Stopping in-flight stimulus");
        }
        self.output.stop();
    }

    pub fn is_playing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn last_stimulus(&self) -> Option<Stimulus> {
        self.lock_last().ok().and_then(|last| last.clone())
    }

    pub fn output(&self) -> &Arc<dyn AudioOutput> {
        &self.output
    }

    pub fn calibration(&self) -> &Arc<CalibrationStore> {
        &self.calibration
    }

    pub fn config(&self) -> &ToneConfig {
        &self.config
    }

    // ========================================================================
    // HELPER METHODS
    // ========================================================================

    fn play(&self, stimulus: Stimulus) -> Result<PlaybackHandle, ToneError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ToneError::AlreadyPlaying);
        }
        // Released on every early return below
        let guard = InFlightGuard(Arc::clone(&self.in_flight));

        self.ensure_active()?;
        let completion = self.output.play(stimulus.request)?;
        *self.lock_last()? = Some(stimulus.clone());

        log::debug!(
            "[ToneSynthesizer] {} {} nominal {} dB, physical {} dB, amplitude {:.5}",
            stimulus.ear,
            stimulus.frequency,
            stimulus.nominal_level_db,
            stimulus.physical_level_db,
            stimulus.request.amplitude
        );

        Ok(PlaybackHandle {
            completion,
            guard: Some(guard),
            stimulus,
        })
    }

    fn ensure_active(&self) -> Result<(), ToneError> {
        if self.output.is_active() {
            return Ok(());
        }
        log::info!(
            "[ToneSynthesizer] Output '{}' inactive, resuming",
            self.output.name()
        );
        self.output
            .resume()
            .map_err(|err| ToneError::AudioUnavailable {
                reason: err.message(),
            })
    }

    fn lock_last(&self) -> Result<MutexGuard<'_, Option<Stimulus>>, ToneError> {
        self.last.lock().map_err(|_| ToneError::LockPoisoned {
            component: "ToneSynthesizer".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backend::SimulatedOutput;

    const TONE: Duration = Duration::from_millis(1500);

    fn synthesizer() -> (ToneSynthesizer, Arc<SimulatedOutput>, Arc<CalibrationStore>) {
        let calibration = Arc::new(CalibrationStore::default());
        let output = Arc::new(SimulatedOutput::new());
        let synth = ToneSynthesizer::new(
            Arc::clone(&calibration),
            output.clone() as Arc<dyn AudioOutput>,
            ToneConfig::default(),
        );
        (synth, output, calibration)
    }

    #[tokio::test(start_paused = true)]
    async fn test_present_applies_offset() {
        let (synth, output, calibration) = synthesizer();
        calibration.record_reference(Frequency::Hz1000, 25).unwrap();

        let handle = synth.present(Ear::Left, Frequency::Hz1000, 50, TONE).unwrap();
        assert_eq!(handle.stimulus().physical_level_db, 60);
        assert_eq!(handle.await, PlaybackEnd::Finished);

        let played = output.played();
        assert_eq!(played.len(), 1);
        assert_eq!(played[0].pan, Pan::Left);
        assert_eq!(played[0].frequency_hz, 1000.0);
        assert!((played[0].amplitude - 0.01).abs() < 1e-6);
        assert_eq!(played[0].duration, TONE);
        assert_eq!(played[0].ramp, Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncalibrated_plays_nominal() {
        let (synth, _, _) = synthesizer();
        let handle = synth.present(Ear::Right, Frequency::Hz500, 40, TONE).unwrap();
        assert_eq!(handle.stimulus().physical_level_db, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_in_flight() {
        let (synth, _, _) = synthesizer();
        let handle = synth.present(Ear::Right, Frequency::Hz500, 50, TONE).unwrap();
        assert!(synth.is_playing());
        assert!(matches!(
            synth.present(Ear::Right, Frequency::Hz500, 40, TONE),
            Err(ToneError::AlreadyPlaying)
        ));
        handle.await;
        assert!(!synth.is_playing());
        assert!(synth.present(Ear::Right, Frequency::Hz500, 40, TONE).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_releases_flag() {
        let (synth, _, _) = synthesizer();
        let handle = synth.present(Ear::Right, Frequency::Hz500, 50, TONE).unwrap();
        drop(handle);
        assert!(!synth.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_repeats_last_stimulus() {
        let (synth, output, calibration) = synthesizer();
        assert!(matches!(synth.replay(), Err(ToneError::NoStimulus)));

        synth
            .present(Ear::Right, Frequency::Hz2000, 30, TONE)
            .unwrap()
            .await;
        // Offset changes after presentation do not alter the replayed stimulus
        calibration.record_reference(Frequency::Hz2000, 40).unwrap();
        synth.replay().unwrap().await;

        let played = output.played();
        assert_eq!(played.len(), 2);
        assert_eq!(played[0], played[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_and_releases() {
        let (synth, _, _) = synthesizer();
        let handle = synth.present(Ear::Left, Frequency::Hz4000, 50, TONE).unwrap();
        synth.stop();
        assert_eq!(handle.await, PlaybackEnd::Cancelled);
        assert!(!synth.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_output_is_resumed() {
        let (synth, output, _) = synthesizer();
        output.suspend();
        let handle = synth.present(Ear::Left, Frequency::Hz500, 50, TONE).unwrap();
        assert_eq!(output.resume_count(), 1);
        assert_eq!(handle.await, PlaybackEnd::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_output() {
        let (synth, output, _) = synthesizer();
        output.set_available(false);
        assert!(matches!(
            synth.present(Ear::Left, Frequency::Hz500, 50, TONE),
            Err(ToneError::AudioUnavailable { .. })
        ));
        assert!(!synth.is_playing());
        assert!(synth.last_stimulus().is_none());
        assert_eq!(output.play_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loud_levels_are_clamped() {
        let (synth, output, calibration) = synthesizer();
        calibration.record_reference(Frequency::Hz4000, 80).unwrap();
        // 90 + 65 = 155 dB physical
        synth.present(Ear::Right, Frequency::Hz4000, 90, TONE).unwrap();
        assert_eq!(output.played()[0].amplitude, 1.0);
    }
}
