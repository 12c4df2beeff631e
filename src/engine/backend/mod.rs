//! Output backends for stimulus playback.
//!
//! The synthesizer only talks to an [`AudioOutput`]; whether that is a real
//! headphone stream or a timed simulation is chosen once at session setup.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio::sync::oneshot;

use crate::audio::PlaybackRequest;
use crate::error::ToneError;

/// How a playback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    /// The full tone was rendered
    Finished,
    /// Playback was stopped early, or the output went away
    Cancelled,
}

/// Resolves once the output has finished (or abandoned) a stimulus.
///
/// Backends keep the sending half and fire it from wherever they learn the
/// tone is done. A dropped sender counts as [`PlaybackEnd::Cancelled`].
#[derive(Debug)]
pub struct PlaybackCompletion {
    rx: oneshot::Receiver<PlaybackEnd>,
}

impl PlaybackCompletion {
    /// Create a completion and the sender that resolves it
    pub fn channel() -> (oneshot::Sender<PlaybackEnd>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A completion that is already resolved
    pub fn resolved(end: PlaybackEnd) -> Self {
        let (tx, completion) = Self::channel();
        let _ = tx.send(end);
        completion
    }
}

impl Future for PlaybackCompletion {
    type Output = PlaybackEnd;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx
            .poll_unpin(cx)
            .map(|result| result.unwrap_or(PlaybackEnd::Cancelled))
    }
}

/// Trait implemented by stimulus output devices.
///
/// An output renders at most one stimulus at a time; `play` while another
/// stimulus is sounding replaces it.
pub trait AudioOutput: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Whether stimuli reach a real transducer
    fn is_audible(&self) -> bool {
        true
    }

    /// Whether the output is currently able to render
    fn is_active(&self) -> bool;

    /// Bring a suspended output back to the active state
    fn resume(&self) -> Result<(), ToneError>;

    /// Start rendering a stimulus
    fn play(&self, request: PlaybackRequest) -> Result<PlaybackCompletion, ToneError>;

    /// Stop the current stimulus, resolving its completion as cancelled
    fn stop(&self);
}

mod simulated;
pub use simulated::SimulatedOutput;

#[cfg(feature = "cpal_output")]
mod cpal;
#[cfg(feature = "cpal_output")]
pub use self::cpal::CpalOutput;

/// Open the default output for this build.
///
/// With the `cpal_output` feature (on by default) this is the system's
/// default output device; otherwise a simulated output that times stimuli
/// without sound and reports itself as not audible.
pub fn default_output() -> Result<Arc<dyn AudioOutput>, ToneError> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "cpal_output")] {
            Ok(Arc::new(CpalOutput::open()?))
        } else {
            log::warn!("[AudioOutput] Built without cpal_output, using simulated output");
            Ok(Arc::new(SimulatedOutput::new()))
        }
    }
}
