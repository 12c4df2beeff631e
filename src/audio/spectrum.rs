// Spectrum check for rendered stimuli
//
// Used to confirm that a rendered tone sits at the intended frequency, at the
// intended level, and only in the intended channel before it is trusted for
// screening. Applies a Hann window and reads the strongest FFT bin.

use rustfft::{num_complex::Complex, FftPlanner};

/// Measured properties of one channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneAnalysis {
    /// Frequency of the strongest bin
    pub peak_hz: f32,
    /// Width of one FFT bin
    pub bin_width_hz: f32,
    pub rms: f32,
    pub peak_amplitude: f32,
}

impl ToneAnalysis {
    /// Whether the measured peak lies within one bin of `target_hz`
    pub fn matches_frequency(&self, target_hz: f32) -> bool {
        (self.peak_hz - target_hz).abs() <= self.bin_width_hz
    }
}

/// Analyze a mono channel
///
/// # Returns
/// `None` for an empty buffer
pub fn analyze(samples: &[f32], sample_rate: u32) -> Option<ToneAnalysis> {
    if samples.is_empty() {
        return None;
    }

    let n = samples.len();
    let mut buffer: Vec<Complex<f32>> = samples
        .iter()
        .enumerate()
        .map(|(i, &sample)| {
            let window = if n > 1 {
                0.5 * (1.0 - ((2.0 * std::f32::consts::PI * i as f32) / (n as f32 - 1.0)).cos())
            } else {
                1.0
            };
            Complex::new(sample * window, 0.0)
        })
        .collect();

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n);
    fft.process(&mut buffer);

    // Skip DC, positive frequencies only
    let (peak_bin, _) = buffer
        .iter()
        .take(n / 2 + 1)
        .enumerate()
        .skip(1)
        .map(|(bin, c)| (bin, c.norm_sqr()))
        .fold((0usize, f32::MIN), |best, candidate| {
            if candidate.1 > best.1 {
                candidate
            } else {
                best
            }
        });

    let bin_width_hz = sample_rate as f32 / n as f32;
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();

    Some(ToneAnalysis {
        peak_hz: peak_bin as f32 * bin_width_hz,
        bin_width_hz,
        rms: (sum_squares / n as f32).sqrt(),
        peak_amplitude: samples.iter().fold(0.0f32, |max, s| max.max(s.abs())),
    })
}

/// Signal energy of a channel (sum of squares)
pub fn energy(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s * s).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::tone::{render_tone, split_channels, Pan, PlaybackRequest};
    use std::time::Duration;

    fn rendered(frequency_hz: f32, pan: Pan) -> (Vec<f32>, Vec<f32>) {
        let frames = render_tone(
            PlaybackRequest {
                frequency_hz,
                amplitude: 0.25,
                pan,
                duration: Duration::from_millis(500),
                ramp: Duration::from_millis(50),
            },
            48_000,
        );
        split_channels(&frames)
    }

    #[test]
    fn test_empty_buffer() {
        assert!(analyze(&[], 48_000).is_none());
    }

    #[test]
    fn test_peak_at_each_test_frequency() {
        for hz in [500.0, 1000.0, 2000.0, 4000.0] {
            let (left, _) = rendered(hz, Pan::Left);
            let analysis = analyze(&left, 48_000).unwrap();
            assert!(
                analysis.matches_frequency(hz),
                "expected {} Hz, measured {} Hz",
                hz,
                analysis.peak_hz
            );
        }
    }

    #[test]
    fn test_level_measurement() {
        let (_, right) = rendered(1000.0, Pan::Right);
        let analysis = analyze(&right, 48_000).unwrap();
        assert!((analysis.peak_amplitude - 0.25).abs() < 0.01);
        // Sine RMS is amplitude / sqrt(2), reduced slightly by the ramps
        assert!(analysis.rms > 0.15 && analysis.rms < 0.18);
    }

    #[test]
    fn test_silent_channel_has_no_energy() {
        let (left, right) = rendered(2000.0, Pan::Right);
        assert_eq!(energy(&left), 0.0);
        assert!(energy(&right) > 0.0);
    }
}
