//! CPAL output for desktop headphones (Linux, macOS, Windows)
//!
//! `cpal::Stream` is not `Send`, so the stream lives on a dedicated thread
//! that owns it for the whole session. The control side hands voices to the
//! output callback through a lock-free SPSC ring; the callback renders them
//! and resolves each stimulus's completion when its last frame is written.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::oneshot;

use crate::audio::{PlaybackRequest, StereoFrame, ToneVoice};
use crate::error::ToneError;

use super::{AudioOutput, PlaybackCompletion, PlaybackEnd};

const COMMAND_CAPACITY: usize = 16;

/// Messages from the control thread to the output callback
enum OutputCommand {
    Play {
        voice: ToneVoice,
        done: oneshot::Sender<PlaybackEnd>,
    },
    Stop,
}

/// Messages to the thread that owns the stream
enum StreamControl {
    Resume(mpsc::Sender<Result<(), ToneError>>),
    Shutdown,
}

/// Headphone output through the system's default output device
pub struct CpalOutput {
    commands: Mutex<rtrb::Producer<OutputCommand>>,
    control: Mutex<mpsc::Sender<StreamControl>>,
    active: Arc<AtomicBool>,
    sample_rate: u32,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalOutput {
    /// Open the default output device and start its stream
    pub fn open() -> Result<Self, ToneError> {
        let (producer, consumer) = rtrb::RingBuffer::new(COMMAND_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let active = Arc::new(AtomicBool::new(false));

        let thread_active = Arc::clone(&active);
        let thread = std::thread::Builder::new()
            .name("tone-output".to_string())
            .spawn(move || run_stream_thread(consumer, thread_active, control_rx, ready_tx))
            .map_err(|e| ToneError::StreamOpenFailed {
                reason: format!("Failed to spawn output thread: {}", e),
            })?;

        let sample_rate = ready_rx.recv().map_err(|_| ToneError::StreamOpenFailed {
            reason: "Output thread exited during startup".to_string(),
        })??;

        log::info!("[CpalOutput] Output stream running at {} Hz", sample_rate);

        Ok(Self {
            commands: Mutex::new(producer),
            control: Mutex::new(control_tx),
            active,
            sample_rate,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn push_command(&self, command: OutputCommand) -> Result<(), ToneError> {
        let mut commands = self.commands.lock().map_err(|_| ToneError::LockPoisoned {
            component: "CpalOutput".to_string(),
        })?;
        commands
            .push(command)
            .map_err(|_| ToneError::AudioUnavailable {
                reason: "output command queue is full".to_string(),
            })
    }
}

impl AudioOutput for CpalOutput {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn resume(&self) -> Result<(), ToneError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.control
            .lock()
            .map_err(|_| ToneError::LockPoisoned {
                component: "CpalOutput".to_string(),
            })?
            .send(StreamControl::Resume(reply_tx))
            .map_err(|_| ToneError::AudioUnavailable {
                reason: "output thread has stopped".to_string(),
            })?;
        reply_rx.recv().map_err(|_| ToneError::AudioUnavailable {
            reason: "output thread has stopped".to_string(),
        })?
    }

    fn play(&self, request: PlaybackRequest) -> Result<PlaybackCompletion, ToneError> {
        let (done, completion) = PlaybackCompletion::channel();
        let voice = ToneVoice::new(request, self.sample_rate);
        self.push_command(OutputCommand::Play { voice, done })?;
        Ok(completion)
    }

    fn stop(&self) {
        if let Err(err) = self.push_command(OutputCommand::Stop) {
            log::warn!("[CpalOutput] Failed to queue stop: {}", err);
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Ok(control) = self.control.lock() {
            let _ = control.send(StreamControl::Shutdown);
        }
        if let Ok(mut thread) = self.thread.lock() {
            if let Some(handle) = thread.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Body of the stream-owning thread
fn run_stream_thread(
    consumer: rtrb::Consumer<OutputCommand>,
    active: Arc<AtomicBool>,
    control: mpsc::Receiver<StreamControl>,
    ready: mpsc::Sender<Result<u32, ToneError>>,
) {
    let (stream, sample_rate) = match build_stream(consumer, Arc::clone(&active)) {
        Ok(built) => built,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(ToneError::StreamOpenFailed {
            reason: format!("Failed to start output stream: {:?}", e),
        }));
        return;
    }
    active.store(true, Ordering::Release);
    let _ = ready.send(Ok(sample_rate));

    while let Ok(message) = control.recv() {
        match message {
            StreamControl::Resume(reply) => {
                let result = stream
                    .play()
                    .map(|_| active.store(true, Ordering::Release))
                    .map_err(|e| ToneError::AudioUnavailable {
                        reason: format!("Failed to resume output stream: {:?}", e),
                    });
                let _ = reply.send(result);
            }
            StreamControl::Shutdown => break,
        }
    }

    active.store(false, Ordering::Release);
    log::debug!("[CpalOutput] Output thread exiting");
}

fn build_stream(
    mut consumer: rtrb::Consumer<OutputCommand>,
    active: Arc<AtomicBool>,
) -> Result<(cpal::Stream, u32), ToneError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| ToneError::StreamOpenFailed {
            reason: "No default output device found".to_string(),
        })?;

    let config = device
        .default_output_config()
        .map_err(|e| ToneError::StreamOpenFailed {
            reason: format!("Failed to get default output config: {:?}", e),
        })?;

    if config.sample_format() != cpal::SampleFormat::F32 {
        return Err(ToneError::StreamOpenFailed {
            reason: "Only F32 sample format is currently supported for output".to_string(),
        });
    }

    let stream_config: cpal::StreamConfig = config.into();
    let channels_count = stream_config.channels as usize;
    let sample_rate = stream_config.sample_rate.0;

    let mut current: Option<(ToneVoice, oneshot::Sender<PlaybackEnd>)> = None;
    let err_fn = move |err| {
        log::error!("[CpalOutput] Output stream error: {}", err);
        active.store(false, Ordering::Release);
    };

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                while let Ok(command) = consumer.pop() {
                    if let Some((_, done)) = current.take() {
                        let _ = done.send(PlaybackEnd::Cancelled);
                    }
                    if let OutputCommand::Play { voice, done } = command {
                        current = Some((voice, done));
                    }
                }

                for frame in data.chunks_mut(channels_count) {
                    let out = match current.as_mut() {
                        Some((voice, _)) => voice.next_frame().unwrap_or_default(),
                        None => StereoFrame::default(),
                    };
                    write_frame(frame, out);

                    if matches!(current.as_ref(), Some((voice, _)) if voice.is_finished()) {
                        if let Some((_, done)) = current.take() {
                            let _ = done.send(PlaybackEnd::Finished);
                        }
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| ToneError::StreamOpenFailed {
            reason: format!("{:?}", e),
        })?;

    Ok((stream, sample_rate))
}

/// Write one stereo frame into an interleaved device frame
#[inline]
fn write_frame(frame: &mut [f32], out: StereoFrame) {
    match frame.len() {
        0 => {}
        1 => frame[0] = out.left + out.right,
        _ => {
            frame[0] = out.left;
            frame[1] = out.right;
            for sample in frame.iter_mut().skip(2) {
                *sample = 0.0;
            }
        }
    }
}
