//! Pure-tone generation with a linear attack/release envelope
//!
//! This module holds the sample-level rendering shared by the real-time
//! output callback and offline rendering. Key properties:
//! - Sine tone at the stimulus frequency, hard-panned to one ear
//! - Linear fade-in and fade-out to avoid onset clicks
//! - Exact duration in frames (`duration * sample_rate`)
//! - Pure functions, no allocation per frame

use std::f32::consts::TAU;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::Ear;

/// Stereo routing of a stimulus
///
/// The signal is never split between ears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pan {
    Left,
    Right,
}

impl From<Ear> for Pan {
    fn from(ear: Ear) -> Self {
        match ear {
            Ear::Left => Pan::Left,
            Ear::Right => Pan::Right,
        }
    }
}

/// Everything the output device needs to sound one stimulus
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaybackRequest {
    pub frequency_hz: f32,
    /// Linear amplitude in [0, 1]
    pub amplitude: f32,
    pub pan: Pan,
    pub duration: Duration,
    /// Fade-in and fade-out length
    pub ramp: Duration,
}

/// Convert a physical level to a linear amplitude
///
/// `amplitude = 10^((level_db - full_scale_reference_db) / 20)`, clamped to
/// [0, 1]. With the default 100 dB reference, 100 dB maps to 1.0 and 80 dB to
/// 0.1.
///
/// # Examples
/// ```
/// use hearing_screener::audio::tone::amplitude_for_level;
///
/// assert!((amplitude_for_level(80, 100.0) - 0.1).abs() < 1e-6);
/// assert_eq!(amplitude_for_level(120, 100.0), 1.0);
/// ```
pub fn amplitude_for_level(level_db: i32, full_scale_reference_db: f32) -> f32 {
    let (amplitude, clamped) = clamped_amplitude(level_db, full_scale_reference_db);
    if clamped {
        log::warn!(
            "[Tone] {} dB exceeds full scale ({} dB), clamping",
            level_db,
            full_scale_reference_db
        );
    }
    amplitude
}

/// Amplitude for a level and whether it had to be clamped to full scale
pub fn clamped_amplitude(level_db: i32, full_scale_reference_db: f32) -> (f32, bool) {
    let amplitude = 10f32.powf((level_db as f32 - full_scale_reference_db) / 20.0);
    (amplitude.clamp(0.0, 1.0), amplitude > 1.0)
}

/// Linear attack/sustain/release gain curve over a fixed frame count
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneEnvelope {
    total_frames: u64,
    ramp_frames: u64,
}

impl ToneEnvelope {
    /// Build the envelope for a request at a given sample rate
    ///
    /// Ramps longer than half the tone are shortened to half the tone.
    pub fn new(duration: Duration, ramp: Duration, sample_rate: u32) -> Self {
        let total_frames = frames_for(duration, sample_rate);
        let ramp_frames = frames_for(ramp, sample_rate).min(total_frames / 2);
        Self {
            total_frames,
            ramp_frames,
        }
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn ramp_frames(&self) -> u64 {
        self.ramp_frames
    }

    /// Gain in [0, 1] at a frame index; 0 past the end
    #[inline]
    pub fn gain_at(&self, frame: u64) -> f32 {
        if frame >= self.total_frames {
            return 0.0;
        }
        if self.ramp_frames == 0 {
            return 1.0;
        }
        let remaining = self.total_frames - frame;
        if frame < self.ramp_frames {
            frame as f32 / self.ramp_frames as f32
        } else if remaining <= self.ramp_frames {
            (remaining - 1) as f32 / self.ramp_frames as f32
        } else {
            1.0
        }
    }
}

/// Number of frames covering `duration` at `sample_rate`
#[inline]
pub fn frames_for(duration: Duration, sample_rate: u32) -> u64 {
    (duration.as_secs_f64() * sample_rate as f64).round() as u64
}

/// One stereo output frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StereoFrame {
    pub left: f32,
    pub right: f32,
}

/// Stateful renderer for a single stimulus
///
/// Produces frames until the envelope ends, then returns `None`.
#[derive(Debug, Clone)]
pub struct ToneVoice {
    request: PlaybackRequest,
    envelope: ToneEnvelope,
    phase: f32,
    phase_increment: f32,
    frame: u64,
}

impl ToneVoice {
    pub fn new(request: PlaybackRequest, sample_rate: u32) -> Self {
        Self {
            request,
            envelope: ToneEnvelope::new(request.duration, request.ramp, sample_rate),
            phase: 0.0,
            phase_increment: TAU * request.frequency_hz / sample_rate as f32,
            frame: 0,
        }
    }

    pub fn request(&self) -> &PlaybackRequest {
        &self.request
    }

    pub fn is_finished(&self) -> bool {
        self.frame >= self.envelope.total_frames()
    }

    /// Render the next frame
    #[inline]
    pub fn next_frame(&mut self) -> Option<StereoFrame> {
        if self.is_finished() {
            return None;
        }

        let sample =
            self.request.amplitude * self.envelope.gain_at(self.frame) * self.phase.sin();
        self.phase = (self.phase + self.phase_increment) % TAU;
        self.frame += 1;

        Some(match self.request.pan {
            Pan::Left => StereoFrame {
                left: sample,
                right: 0.0,
            },
            Pan::Right => StereoFrame {
                left: 0.0,
                right: sample,
            },
        })
    }
}

/// Render a whole stimulus offline
pub fn render_tone(request: PlaybackRequest, sample_rate: u32) -> Vec<StereoFrame> {
    let mut voice = ToneVoice::new(request, sample_rate);
    let mut frames = Vec::with_capacity(voice.envelope.total_frames() as usize);
    while let Some(frame) = voice.next_frame() {
        frames.push(frame);
    }
    frames
}

/// Split rendered frames into (left, right) channel buffers
pub fn split_channels(frames: &[StereoFrame]) -> (Vec<f32>, Vec<f32>) {
    frames.iter().map(|f| (f.left, f.right)).unzip()
}
