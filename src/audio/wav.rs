// WAV export of rendered stimuli
//
// Lets an operator capture exactly what a stimulus sounds like (for example to
// check it with an external sound level meter) without the output device.

use std::path::Path;

use anyhow::{anyhow, Context, Result};

use crate::audio::tone::StereoFrame;

/// Write stereo frames as a 32-bit float WAV file
pub fn write_wav(path: &Path, frames: &[StereoFrame], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("creating {}", path.display()))?;
    for frame in frames {
        writer.write_sample(frame.left)?;
        writer.write_sample(frame.right)?;
    }
    writer
        .finalize()
        .with_context(|| format!("finalizing {}", path.display()))?;

    log::debug!(
        "[wav] Wrote {} frames at {} Hz to {}",
        frames.len(),
        sample_rate,
        path.display()
    );
    Ok(())
}

/// Read a stereo WAV file written by [`write_wav`] (or any 16-bit stereo WAV)
pub fn read_wav(path: &Path) -> Result<(Vec<StereoFrame>, u32)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    if spec.channels != 2 {
        return Err(anyhow!(
            "{} must be stereo (found {} channels)",
            path.display(),
            spec.channels
        ));
    }

    let samples = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .map(|sample| sample.map_err(|err| anyhow!(err)))
            .collect::<Result<Vec<f32>>>()?,
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|sample| {
                sample
                    .map(|value| value as f32 / i16::MAX as f32)
                    .map_err(|err| anyhow!(err))
            })
            .collect::<Result<Vec<f32>>>()?,
        (format, bits) => {
            return Err(anyhow!(
                "Unsupported WAV format {:?} with {} bits per sample",
                format,
                bits
            ))
        }
    };

    let frames = samples
        .chunks_exact(2)
        .map(|pair| StereoFrame {
            left: pair[0],
            right: pair[1],
        })
        .collect();

    Ok((frames, spec.sample_rate))
}
