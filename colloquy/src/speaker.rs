//! Speaker identity: profiles built from reference audio or presets, and the
//! read-only library sessions draw them from.

use candle_core::{Device, Tensor};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audio::{AudioData, load_wav};
use crate::config::{MAX_SPEAKERS, SAMPLE_RATE};
use crate::model::ModelWeights;
use crate::rng::SessionRng;
use crate::{ColloquyError, Result};

/// Reference clip encoded once, already projected into the backbone space.
#[derive(Debug, Clone)]
pub struct VoicePrompt {
    acoustic_embeds: Tensor,
    semantic_embeds: Tensor,
}

impl VoicePrompt {
    pub fn frames(&self) -> usize {
        self.acoustic_embeds.dim(1).unwrap_or(0)
    }

    /// `[1, frames, hidden]` acoustic part
    pub fn acoustic_embeds(&self) -> &Tensor {
        &self.acoustic_embeds
    }

    /// `[1, frames, hidden]` semantic part
    pub fn semantic_embeds(&self) -> &Tensor {
        &self.semantic_embeds
    }

    /// Context embeddings for priming: acoustic and semantic streams summed.
    pub fn embeds(&self) -> Result<Tensor> {
        Ok((&self.acoustic_embeds + &self.semantic_embeds)?)
    }
}

/// One voice: a fixed embedding `[1, hidden]` plus an optional voice prompt.
#[derive(Debug, Clone)]
pub struct SpeakerProfile {
    speaker_id: u8,
    embedding: Tensor,
    voice_prompt: Option<VoicePrompt>,
}

fn check_speaker_id(speaker_id: u8) -> Result<()> {
    if speaker_id == 0 || speaker_id as usize > MAX_SPEAKERS {
        return Err(ColloquyError::ConfigError(format!(
            "Speaker id must be in 1..={}, got {}",
            MAX_SPEAKERS, speaker_id
        )));
    }
    Ok(())
}

impl SpeakerProfile {
    pub fn new(speaker_id: u8, embedding: Tensor, voice_prompt: Option<VoicePrompt>) -> Result<Self> {
        check_speaker_id(speaker_id)?;
        let embedding = match embedding.rank() {
            1 => embedding.unsqueeze(0)?,
            2 if embedding.dim(0)? == 1 => embedding,
            _ => {
                return Err(ColloquyError::VoiceError(format!(
                    "Speaker embedding must be [hidden] or [1, hidden], got {:?}",
                    embedding.dims()
                )));
            }
        };
        Ok(Self {
            speaker_id,
            embedding,
            voice_prompt,
        })
    }

    /// Encode a reference clip. The acoustic path uses the variational encode
    /// so the prompt matches what the backbone saw in training.
    pub fn from_reference_audio(
        weights: &ModelWeights,
        speaker_id: u8,
        audio: &AudioData,
        rng: &mut SessionRng,
    ) -> Result<Self> {
        check_speaker_id(speaker_id)?;
        if audio.is_empty() {
            return Err(ColloquyError::VoiceError(format!(
                "Reference audio for speaker {} is empty",
                speaker_id
            )));
        }
        if audio.sample_rate() != SAMPLE_RATE {
            return Err(ColloquyError::VoiceError(format!(
                "Reference audio must be {} Hz, got {} Hz",
                SAMPLE_RATE,
                audio.sample_rate()
            )));
        }

        let waveform = audio.to_tensor(weights.device())?;
        let acoustic = weights.codec.encode_sampled(&waveform, rng)?;
        let semantic = weights.semantic.encode(&waveform)?;

        let acoustic_embeds = weights.acoustic_connector.forward(&acoustic)?;
        let semantic_embeds = weights.semantic_connector.forward(&semantic)?;
        if acoustic_embeds.dims() != semantic_embeds.dims() {
            return Err(ColloquyError::ConfigError(format!(
                "Acoustic prompt {:?} and semantic prompt {:?} disagree",
                acoustic_embeds.dims(),
                semantic_embeds.dims()
            )));
        }

        let prompt = VoicePrompt {
            acoustic_embeds,
            semantic_embeds,
        };
        let embedding = prompt.embeds()?.mean(1)?;
        debug!(
            "Speaker {} profile from {:.2}s of audio ({} prompt frames)",
            speaker_id,
            audio.duration_secs(),
            prompt.frames()
        );

        Self::new(speaker_id, embedding, Some(prompt))
    }

    /// Deterministic preset without a voice prompt.
    pub fn from_seed(speaker_id: u8, seed: u64, hidden_size: usize, device: &Device) -> Result<Self> {
        let mut rng = SessionRng::new(seed);
        let embedding = rng.randn(&[1, hidden_size], device)?;
        Self::new(speaker_id, embedding, None)
    }

    /// Same voice under another script speaker id.
    pub fn with_speaker_id(&self, speaker_id: u8) -> Result<Self> {
        check_speaker_id(speaker_id)?;
        Ok(Self {
            speaker_id,
            ..self.clone()
        })
    }

    pub fn speaker_id(&self) -> u8 {
        self.speaker_id
    }

    pub fn embedding(&self) -> &Tensor {
        &self.embedding
    }

    pub fn voice_prompt(&self) -> Option<&VoicePrompt> {
        self.voice_prompt.as_ref()
    }
}

/// Named voices, loaded once and shared read-only across sessions.
#[derive(Debug, Clone, Default)]
pub struct SpeakerLibrary {
    voices: BTreeMap<String, Arc<SpeakerProfile>>,
}

impl SpeakerLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prime every `*.wav` in `dir`, keyed by file stem.
    pub fn load_dir(weights: &ModelWeights, dir: &Path, rng: &mut SessionRng) -> Result<Self> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "wav"))
            .collect();
        paths.sort();

        let mut library = Self::new();
        for path in paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                warn!("⚠️  Skipping voice with non UTF-8 name: {:?}", path);
                continue;
            };
            let audio = load_wav(&path, SAMPLE_RATE)?;
            let profile = SpeakerProfile::from_reference_audio(weights, 1, &audio, rng)?;
            library.insert(name, profile);
        }
        info!("🎙️  Loaded {} voice(s) from {}", library.len(), dir.display());
        Ok(library)
    }

    pub fn insert(&mut self, name: impl Into<String>, profile: SpeakerProfile) {
        self.voices.insert(name.into(), Arc::new(profile));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<SpeakerProfile>> {
        self.voices.get(name)
    }

    /// The named voice bound to `speaker_id`.
    pub fn profile_for(&self, name: &str, speaker_id: u8) -> Result<Arc<SpeakerProfile>> {
        let profile = self.get(name).ok_or_else(|| {
            ColloquyError::VoiceError(format!(
                "Voice '{}' not in library (available: {:?})",
                name,
                self.names().collect::<Vec<_>>()
            ))
        })?;
        if profile.speaker_id() == speaker_id {
            return Ok(Arc::clone(profile));
        }
        Ok(Arc::new(profile.with_speaker_id(speaker_id)?))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.voices.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }
}
