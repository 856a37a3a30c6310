//! Waveform container and WAV input/output.

use crate::{ColloquyError, Result};
use candle_core::{DType, Device, Tensor};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::path::Path;
use tracing::{debug, info};

/// Loudness reference audio is normalized to before encoding.
pub const REFERENCE_DB_FS: f32 = -25.0;

/// Mono audio samples in [-1.0, 1.0] with their sample rate.
#[derive(Clone, PartialEq)]
pub struct AudioData {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioData {
    /// Flatten any `[.., samples]` tensor into mono audio.
    pub fn from_tensor(tensor: &Tensor, sample_rate: u32) -> Result<Self> {
        let samples = tensor
            .to_dtype(DType::F32)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| ColloquyError::AudioError(e.to_string()))?;

        Ok(Self {
            samples,
            sample_rate,
        })
    }

    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn empty(sample_rate: u32) -> Self {
        Self::from_samples(Vec::new(), sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut Vec<f32> {
        &mut self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// `[1, 1, samples]` tensor for the encoders
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            &self.samples,
            (1, 1, self.samples.len()),
            device,
        )?)
    }

    /// Write 16-bit PCM mono WAV.
    pub fn save_wav(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut writer = hound::WavWriter::create(path, spec)
            .map_err(|e| ColloquyError::IoError(e.to_string()))?;

        for &sample in &self.samples {
            let amplitude = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(amplitude)
                .map_err(|e| ColloquyError::IoError(e.to_string()))?;
        }

        writer
            .finalize()
            .map_err(|e| ColloquyError::IoError(e.to_string()))?;

        info!(
            "💾 Saved {:.2}s of audio to {}",
            self.duration_secs(),
            path.display()
        );
        Ok(())
    }

    /// Concatenate chunks that share a sample rate.
    pub fn concat(chunks: &[AudioData]) -> Result<Self> {
        let Some(first) = chunks.first() else {
            return Err(ColloquyError::AudioError(
                "No audio chunks to concatenate".to_string(),
            ));
        };
        let sample_rate = first.sample_rate;

        if let Some(bad) = chunks.iter().find(|c| c.sample_rate != sample_rate) {
            return Err(ColloquyError::AudioError(format!(
                "Sample rate mismatch: {} vs {}",
                bad.sample_rate, sample_rate
            )));
        }

        let total_samples: usize = chunks.iter().map(|c| c.samples.len()).sum();
        let mut samples = Vec::with_capacity(total_samples);
        for chunk in chunks {
            samples.extend_from_slice(&chunk.samples);
        }

        Ok(Self {
            samples,
            sample_rate,
        })
    }

    /// Peak-preserving loudness normalization to `target_db_fs`.
    pub fn normalize_db_fs(&mut self, target_db_fs: f32) {
        normalize_db_fs(&mut self.samples, target_db_fs);
    }
}

impl std::fmt::Debug for AudioData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioData")
            .field("samples", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .field("duration_secs", &self.duration_secs())
            .finish()
    }
}

/// Scale to the target RMS level, then pull the peak back under 1.0.
pub fn normalize_db_fs(samples: &mut [f32], target_db_fs: f32) {
    const EPS: f32 = 1e-6;
    if samples.is_empty() {
        return;
    }

    let mean_sq = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    let rms = mean_sq.sqrt();
    let target_amplitude = 10.0_f32.powf(target_db_fs / 20.0);
    let scale = target_amplitude / (rms + EPS);
    samples.iter_mut().for_each(|s| *s *= scale);

    let max_abs = samples.iter().fold(0.0_f32, |m, s| m.max(s.abs()));
    if max_abs > 1.0 {
        let clip_scale = 1.0 / (max_abs + EPS);
        samples.iter_mut().for_each(|s| *s *= clip_scale);
    }
}

/// Read a WAV file as mono at `target_sample_rate`, normalized to [`REFERENCE_DB_FS`].
pub fn load_wav(path: impl AsRef<Path>, target_sample_rate: u32) -> Result<AudioData> {
    let path = path.as_ref();
    debug!("Loading audio from: {}", path.display());

    let mut reader = hound::WavReader::open(path).map_err(|e| {
        ColloquyError::AudioError(format!("Failed to open WAV {}: {}", path.display(), e))
    })?;

    let spec = reader.spec();
    debug!(
        "WAV spec: channels={}, sample_rate={}, bits_per_sample={}",
        spec.channels, spec.sample_rate, spec.bits_per_sample
    );

    let read_err = |e: hound::Error| ColloquyError::AudioError(format!("Failed to read WAV: {}", e));
    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<std::result::Result<_, _>>()
            .map_err(read_err)?,
        (hound::SampleFormat::Int, 32) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 2147483648.0))
            .collect::<std::result::Result<_, _>>()
            .map_err(read_err)?,
        (hound::SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(read_err)?,
        (format, bits) => {
            return Err(ColloquyError::AudioError(format!(
                "Unsupported WAV format: {:?} {} bits",
                format, bits
            )));
        }
    };

    let channels = spec.channels.max(1) as usize;
    let mono: Vec<f32> = if channels == 1 {
        samples
    } else {
        samples
            .chunks(channels)
            .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
            .collect()
    };

    let mut samples = resample(&mono, spec.sample_rate, target_sample_rate)?;
    normalize_db_fs(&mut samples, REFERENCE_DB_FS);

    info!(
        "✓ Loaded audio: {} samples @ {}Hz",
        samples.len(),
        target_sample_rate
    );
    Ok(AudioData::from_samples(samples, target_sample_rate))
}

/// Band-limited sinc resampling. The output is padded or trimmed to
/// `round(len * target / source)` samples.
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    if source_rate == target_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    debug!("Resampling from {} Hz to {} Hz", source_rate, target_rate);

    let resample_ratio = target_rate as f64 / source_rate as f64;
    let expected_len = (samples.len() as f64 * resample_ratio).round() as usize;

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(resample_ratio, 2.0, params, samples.len(), 1)
        .map_err(|e| ColloquyError::AudioError(format!("Failed to create resampler: {}", e)))?;

    let input_channels = vec![samples.to_vec()];
    let output = resampler
        .process(&input_channels, None)
        .map_err(|e| ColloquyError::AudioError(format!("Resampling failed: {}", e)))?;

    let mut resampled = output
        .into_iter()
        .next()
        .ok_or_else(|| ColloquyError::AudioError("No output channel from resampler".to_string()))?;
    resampled.resize(expected_len, 0.0);

    Ok(resampled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(n: usize, freq: f32, rate: u32, amp: f32) -> Vec<f32> {
        (0..n)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_wav_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let audio = AudioData::from_samples(sine(2400, 440.0, 24000, 0.5), 24000);
        audio.save_wav(&path).unwrap();

        let loaded = load_wav(&path, 24000).unwrap();
        assert_eq!(loaded.num_samples(), 2400);
        assert_eq!(loaded.sample_rate(), 24000);

        // -25 dBFS RMS after loading
        let rms = (loaded.samples().iter().map(|s| s * s).sum::<f32>() / 2400.0).sqrt();
        let db = 20.0 * rms.log10();
        assert!((db - REFERENCE_DB_FS).abs() < 0.1, "got {} dBFS", db);
    }

    #[test]
    fn test_stereo_is_mixed_and_resampled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for s in sine(1600, 300.0, 16000, 0.3) {
            let v = (s * i16::MAX as f32) as i16;
            writer.write_sample(v).unwrap();
            writer.write_sample(v).unwrap();
        }
        writer.finalize().unwrap();

        let loaded = load_wav(&path, 24000).unwrap();
        assert_eq!(loaded.num_samples(), 2400);
    }

    #[test]
    fn test_normalize_avoids_clipping() {
        let mut samples = vec![0.0; 100];
        samples[0] = 1.0;
        normalize_db_fs(&mut samples, -3.0);
        let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak <= 1.0);

        let mut silence: Vec<f32> = Vec::new();
        normalize_db_fs(&mut silence, -25.0);
        assert!(silence.is_empty());
    }

    #[test]
    fn test_concat_rejects_mixed_rates() {
        let a = AudioData::from_samples(vec![0.1; 10], 24000);
        let b = AudioData::from_samples(vec![0.2; 5], 16000);
        assert!(AudioData::concat(&[a.clone(), b]).is_err());
        assert!(AudioData::concat(&[]).is_err());

        let joined = AudioData::concat(&[a.clone(), a]).unwrap();
        assert_eq!(joined.num_samples(), 20);
    }
}
