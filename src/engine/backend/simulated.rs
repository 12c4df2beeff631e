use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::audio::PlaybackRequest;
use crate::error::ToneError;

use super::{AudioOutput, PlaybackCompletion, PlaybackEnd};

type ActiveSlot = Option<(u64, oneshot::Sender<PlaybackEnd>)>;

/// Timed output without sound, used for CLI dry runs and tests.
///
/// Each stimulus completes after its nominal duration on the tokio clock, so
/// paused-time tests run instantly. The output can be made unavailable or
/// suspended to exercise device failure paths.
pub struct SimulatedOutput {
    available: AtomicBool,
    active: AtomicBool,
    generation: AtomicU64,
    current: Arc<Mutex<ActiveSlot>>,
    played: Mutex<Vec<PlaybackRequest>>,
    resume_count: AtomicU64,
}

impl SimulatedOutput {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            active: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            current: Arc::new(Mutex::new(None)),
            played: Mutex::new(Vec::new()),
            resume_count: AtomicU64::new(0),
        }
    }

    /// Make the device (un)available; an unavailable device also goes inactive
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.active.store(false, Ordering::SeqCst);
        }
    }

    /// Suspend the output as a platform would after an interruption
    pub fn suspend(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Every request passed to `play`, in order
    pub fn played(&self) -> Vec<PlaybackRequest> {
        self.played
            .lock()
            .map(|played| played.clone())
            .unwrap_or_default()
    }

    pub fn play_count(&self) -> usize {
        self.played.lock().map(|played| played.len()).unwrap_or(0)
    }

    /// Number of successful `resume` calls
    pub fn resume_count(&self) -> u64 {
        self.resume_count.load(Ordering::SeqCst)
    }

    /// Whether a stimulus is currently sounding
    pub fn is_sounding(&self) -> bool {
        self.current
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    fn lock_current(&self) -> Result<MutexGuard<'_, ActiveSlot>, ToneError> {
        self.current.lock().map_err(|_| ToneError::LockPoisoned {
            component: "SimulatedOutput".to_string(),
        })
    }
}

impl Default for SimulatedOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for SimulatedOutput {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn is_audible(&self) -> bool {
        false
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn resume(&self) -> Result<(), ToneError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ToneError::AudioUnavailable {
                reason: "simulated device unavailable".to_string(),
            });
        }
        self.active.store(true, Ordering::SeqCst);
        self.resume_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn play(&self, request: PlaybackRequest) -> Result<PlaybackCompletion, ToneError> {
        if !self.is_active() {
            return Err(ToneError::AudioUnavailable {
                reason: "simulated device is not active".to_string(),
            });
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|err| ToneError::AudioUnavailable {
                reason: format!("no async runtime for playback timer: {}", err),
            })?;

        let (tx, completion) = PlaybackCompletion::channel();
        let id = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut slot = self.lock_current()?;
            if let Some((_, previous)) = slot.replace((id, tx)) {
                let _ = previous.send(PlaybackEnd::Cancelled);
            }
        }
        if let Ok(mut played) = self.played.lock() {
            played.push(request);
        }

        let current = Arc::clone(&self.current);
        runtime.spawn(async move {
            tokio::time::sleep(request.duration).await;
            if let Ok(mut slot) = current.lock() {
                if matches!(slot.as_ref(), Some((active, _)) if *active == id) {
                    if let Some((_, tx)) = slot.take() {
                        let _ = tx.send(PlaybackEnd::Finished);
                    }
                }
            }
        });

        Ok(completion)
    }

    fn stop(&self) {
        if let Ok(mut slot) = self.current.lock() {
            if let Some((_, tx)) = slot.take() {
                let _ = tx.send(PlaybackEnd::Cancelled);
            }
        }
    }
}
