use std::path::Path;

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader};
use rayon::prelude::*;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use tracing::debug;

/// Sample rate whisper expects.
pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// Read a WAV chunk into mono, peak-normalized samples at 16 kHz.
///
/// Chunks produced by the chunker are already 16 kHz mono, in which case
/// this is only a decode + normalize.
pub fn read_samples(path: &Path) -> Result<Vec<f32>> {
    let (samples, num_channels, sample_rate) = read_wav_file(path)?;
    let mono_samples = convert_to_mono(&samples, num_channels);
    let normalized_samples = normalize_audio(&mono_samples);

    if sample_rate == TARGET_SAMPLE_RATE {
        Ok(normalized_samples)
    } else {
        resample_audio(&normalized_samples, sample_rate)
    }
}

fn read_wav_file(path: &Path) -> Result<(Vec<f32>, usize, u32)> {
    let mut reader = WavReader::open(path)
        .with_context(|| format!("Failed to read WAV file {}", path.display()))?;
    let spec = reader.spec();
    let num_channels = usize::from(spec.channels);

    if num_channels == 0 {
        anyhow::bail!("WAV file {} has no channels", path.display());
    }

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(f32::from))
            .collect::<std::result::Result<Vec<f32>, _>>()?,
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<f32>, _>>()?,
        (format, bits) => anyhow::bail!(
            "Unsupported sample format {:?} with {} bits per sample",
            format,
            bits
        ),
    };

    debug!(
        "Read {} samples from {} ({} channels, {} Hz)",
        samples.len(),
        path.display(),
        num_channels,
        spec.sample_rate
    );
    Ok((samples, num_channels, spec.sample_rate))
}

/// Average interleaved channels into one.
fn convert_to_mono(samples: &[f32], num_channels: usize) -> Vec<f32> {
    if num_channels == 1 {
        return samples.to_vec();
    }
    samples
        .par_chunks(num_channels)
        .map(|frame| frame.iter().sum::<f32>() / num_channels as f32)
        .collect()
}

/// Scale into [-1, 1]. Silence is left untouched.
fn normalize_audio(samples: &[f32]) -> Vec<f32> {
    let max_abs = samples
        .par_iter()
        .map(|s| s.abs())
        .reduce(|| 0.0, f32::max);
    if max_abs == 0.0 {
        return samples.to_vec();
    }
    samples.par_iter().map(|&s| s / max_abs).collect()
}

fn resample_audio(samples: &[f32], original_sample_rate: u32) -> Result<Vec<f32>> {
    if samples.is_empty() {
        return Ok(Vec::new());
    }
    debug!("Resampling from {} Hz to {} Hz", original_sample_rate, TARGET_SAMPLE_RATE);

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        f64::from(TARGET_SAMPLE_RATE) / f64::from(original_sample_rate),
        2.0,
        params,
        samples.len(),
        1,
    )
    .context("Failed to create resampler")?;

    let mut resampled = resampler
        .process(&[samples], None)
        .context("Resampling failed")?;

    Ok(resampled.pop().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};
    use tempfile::TempDir;

    fn write_wav(path: &Path, channels: u16, sample_rate: u32, frames: &[i16]) {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for &sample in frames {
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn stereo_is_averaged_to_mono() {
        let mono = convert_to_mono(&[1.0, 3.0, -2.0, 2.0], 2);
        assert_eq!(mono, vec![2.0, 0.0]);
    }

    #[test]
    fn silence_survives_normalization() {
        assert_eq!(normalize_audio(&[0.0, 0.0]), vec![0.0, 0.0]);
        assert_eq!(normalize_audio(&[0.5, -0.25]), vec![1.0, -0.5]);
    }

    #[test]
    fn reads_16k_mono_without_resampling() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("chunk.wav");
        write_wav(&path, 1, TARGET_SAMPLE_RATE, &[0, 8000, -16000, 4000]);

        let samples = read_samples(&path)?;
        assert_eq!(samples, vec![0.0, 0.5, -1.0, 0.25]);
        Ok(())
    }

    #[test]
    fn other_rates_are_resampled() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("stereo.wav");
        // one second of 8 kHz stereo
        let frames: Vec<i16> = (0..16000).map(|i| ((i % 64) * 100) as i16).collect();
        write_wav(&path, 2, 8000, &frames);

        let samples = read_samples(&path)?;
        let expected = TARGET_SAMPLE_RATE as usize;
        assert!(samples.len().abs_diff(expected) < expected / 50, "got {}", samples.len());
        Ok(())
    }

    #[test]
    fn corrupt_file_is_an_error() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("broken.wav");
        std::fs::write(&path, b"not a wav")?;
        assert!(read_samples(&path).is_err());
        Ok(())
    }
}
