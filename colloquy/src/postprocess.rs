//! Stages applied to the finished waveform before delivery: an audible
//! disclaimer, a keyed inaudible watermark and a hashed request log.

use sha2::{Digest, Sha256};
use tracing::info;

use crate::audio::AudioData;
use crate::{ColloquyError, Result};

/// What a post-processor may know about the request that produced the audio.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub request_text: String,
    pub seed: u64,
}

/// A pure transform over a finished waveform.
pub trait WaveformPostProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(&self, audio: AudioData, request: &RequestContext) -> Result<AudioData>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisclaimerPlacement {
    Prepend,
    #[default]
    Append,
}

/// Joins a fixed spoken notice to the output, separated by silence.
pub struct DisclaimerMixer {
    clip: AudioData,
    placement: DisclaimerPlacement,
    gap_secs: f32,
}

impl DisclaimerMixer {
    pub fn new(clip: AudioData, placement: DisclaimerPlacement, gap_secs: f32) -> Self {
        Self {
            clip,
            placement,
            gap_secs: gap_secs.max(0.0),
        }
    }
}

impl WaveformPostProcessor for DisclaimerMixer {
    fn name(&self) -> &'static str {
        "disclaimer"
    }

    fn process(&self, audio: AudioData, _request: &RequestContext) -> Result<AudioData> {
        if self.clip.sample_rate() != audio.sample_rate() {
            return Err(ColloquyError::AudioError(format!(
                "Disclaimer is {} Hz but audio is {} Hz",
                self.clip.sample_rate(),
                audio.sample_rate()
            )));
        }
        let gap_samples = (self.gap_secs * audio.sample_rate() as f32).round() as usize;
        let gap = AudioData::from_samples(vec![0.0; gap_samples], audio.sample_rate());

        match self.placement {
            DisclaimerPlacement::Prepend => AudioData::concat(&[self.clip.clone(), gap, audio]),
            DisclaimerPlacement::Append => AudioData::concat(&[audio, gap, self.clip.clone()]),
        }
    }
}

/// Adds a low-amplitude ±1 chip sequence derived from a secret key.
///
/// Chips come from SHA-256 over `key || block index`, 256 per block.
/// [`WatermarkEmbedder::detect`] correlates against the same sequence.
pub struct WatermarkEmbedder {
    key: Vec<u8>,
    strength: f32,
}

impl WatermarkEmbedder {
    pub const DEFAULT_STRENGTH: f32 = 1e-3;

    pub fn new(key: impl AsRef<[u8]>, strength: f32) -> Self {
        Self {
            key: key.as_ref().to_vec(),
            strength,
        }
    }

    fn chips(&self, len: usize) -> impl Iterator<Item = f32> + '_ {
        (0u64..)
            .flat_map(move |block| {
                let mut hasher = Sha256::new();
                hasher.update(&self.key);
                hasher.update(block.to_le_bytes());
                let digest = hasher.finalize();
                (0..256).map(move |bit| {
                    if digest[bit / 8] >> (bit % 8) & 1 == 1 {
                        1.0
                    } else {
                        -1.0
                    }
                })
            })
            .take(len)
    }

    /// Normalized correlation with this key's sequence: about 1 for audio
    /// marked with this key, about 0 otherwise.
    pub fn detect(&self, audio: &AudioData) -> f32 {
        let n = audio.num_samples();
        if n == 0 || self.strength == 0.0 {
            return 0.0;
        }
        let corr: f64 = audio
            .samples()
            .iter()
            .zip(self.chips(n))
            .map(|(s, c)| (*s * c) as f64)
            .sum();
        (corr / n as f64 / self.strength as f64) as f32
    }
}

impl WaveformPostProcessor for WatermarkEmbedder {
    fn name(&self) -> &'static str {
        "watermark"
    }

    fn process(&self, mut audio: AudioData, _request: &RequestContext) -> Result<AudioData> {
        let n = audio.num_samples();
        let chips: Vec<f32> = self.chips(n).collect();
        for (s, c) in audio.samples_mut().iter_mut().zip(chips) {
            *s = (*s + self.strength * c).clamp(-1.0, 1.0);
        }
        Ok(audio)
    }
}

/// Logs a digest of the request instead of its text.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestLogger;

impl RequestLogger {
    pub fn digest(request: &RequestContext) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.request_text.as_bytes());
        hasher.update(request.seed.to_le_bytes());
        hex::encode(hasher.finalize())
    }
}

impl WaveformPostProcessor for RequestLogger {
    fn name(&self) -> &'static str {
        "request-log"
    }

    fn process(&self, audio: AudioData, request: &RequestContext) -> Result<AudioData> {
        info!(
            request = %Self::digest(request),
            samples = audio.num_samples(),
            duration_secs = audio.duration_secs(),
            "📝 Synthesis request completed"
        );
        Ok(audio)
    }
}

/// Stages applied in insertion order.
#[derive(Default)]
pub struct PostProcessChain {
    stages: Vec<Box<dyn WaveformPostProcessor>>,
}

impl PostProcessChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, stage: impl WaveformPostProcessor + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn apply(&self, audio: AudioData, request: &RequestContext) -> Result<AudioData> {
        self.stages
            .iter()
            .try_fold(audio, |audio, stage| stage.process(audio, request))
    }
}
