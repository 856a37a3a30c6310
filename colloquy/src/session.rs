//! The per-session generation loop.
//!
//! A session owns everything that changes while it runs: the backbone cache,
//! the latent arena, the control state and the RNG. Model weights and speaker
//! profiles are shared read-only.
//!
//! ```text
//! prefill [speaker, text] → h_t → control event ─┬─ continue ─→ sample frame → append
//!                                                  └─ end ──→ flush, prefill next utterance
//! every `summary_window` frames: commit connector(mean pool) + speaker embedding
//! ```

use candle_core::Tensor;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace, warn};

use crate::audio::AudioData;
use crate::backbone::BackboneCache;
use crate::config::{RetryPolicy, SAMPLE_RATE, SessionConfig};
use crate::control::{ControlEvent, ControlState};
use crate::diffusion::Denoiser;
use crate::latent::{LatentFrame, LatentSequence};
use crate::model::ModelWeights;
use crate::rng::SessionRng;
use crate::sampler::{GuidanceConfig, NoiseSchedule, sample_frame};
use crate::script::Script;
use crate::speaker::SpeakerProfile;
use crate::tokenizer::{ByteTokenizer, TextTokenizer};
use crate::utils::tensor_stats;
use crate::{ColloquyError, Result, SessionFailure};

/// Longest run of tokens pushed through the backbone in one call.
const PREFILL_CHUNK: usize = 512;

/// Cooperative cancellation, checked once per frame boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Every utterance in the script was spoken.
    SessionEnd,
    /// The backbone context reached `max_context_tokens`.
    ContextExhausted,
    Cancelled,
    /// A fatal error stopped generation.
    Failed,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TerminationReason::SessionEnd => "session end",
            TerminationReason::ContextExhausted => "context exhausted",
            TerminationReason::Cancelled => "cancelled",
            TerminationReason::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Frames one utterance produced and how it ended.
#[derive(Debug, Clone, PartialEq)]
pub struct UtteranceRecord {
    pub position: usize,
    pub speaker_id: u8,
    pub frames: Range<usize>,
    /// `None` while open, or when the session stopped mid-utterance.
    pub end_event: Option<ControlEvent>,
    /// The frame budget ran out before the control head ended the utterance.
    pub forced: bool,
}

#[derive(Debug, Clone)]
pub struct SessionMetadata {
    pub termination_reason: TerminationReason,
    pub total_frames: usize,
    pub per_speaker_utterance_boundaries: BTreeMap<u8, Vec<Range<usize>>>,
    pub utterances: Vec<UtteranceRecord>,
    /// Active speaker for every frame.
    pub frame_speakers: Vec<u8>,
    pub context_tokens_used: usize,
}

#[derive(Debug, Clone)]
pub struct SessionOutput {
    pub audio: AudioData,
    pub metadata: SessionMetadata,
    pub latents: LatentSequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub index: usize,
    pub speaker_id: u8,
    /// Control event decided before this frame.
    pub event: ControlEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Frame(FrameInfo),
    Finished(TerminationReason),
}

/// Backbone text for one utterance.
pub(crate) fn utterance_prompt(speaker_id: u8, text: &str) -> String {
    format!(" Speaker {}: {}\n", speaker_id, text.trim())
}

/// Sample one frame, resampling from fresh noise while the result is
/// non-finite and the policy allows.
#[allow(clippy::too_many_arguments)]
pub(crate) fn sample_with_retry(
    denoiser: &dyn Denoiser,
    condition: &Tensor,
    null_condition: &Tensor,
    schedule: &NoiseSchedule,
    guidance: GuidanceConfig,
    rng: &mut SessionRng,
    frame: usize,
    policy: RetryPolicy,
) -> Result<LatentFrame> {
    let attempts = policy.max_attempts.saturating_add(1);
    for attempt in 1..=attempts {
        let latent = sample_frame(denoiser, condition, null_condition, schedule, guidance, rng)?;
        if latent.is_finite() {
            return Ok(latent);
        }
        warn!(
            "⚠️  Frame {} came out non-finite (attempt {}/{})",
            frame, attempt, attempts
        );
    }
    Err(ColloquyError::NonFiniteFrame { frame, attempts })
}

pub struct Session {
    weights: Arc<ModelWeights>,
    config: SessionConfig,
    guidance: GuidanceConfig,
    schedule: NoiseSchedule,
    null_condition: Tensor,
    profiles: BTreeMap<u8, Arc<SpeakerProfile>>,
    tokenizer: Arc<dyn TextTokenizer>,
    cancel: CancellationToken,
    rng: SessionRng,

    cache: BackboneCache,
    latents: LatentSequence,
    state: ControlState,
    script: Option<Script>,
    current: usize,
    active: Option<Arc<SpeakerProfile>>,
    /// First frame of the current utterance.
    utterance_start: usize,
    /// First frame not yet summarized into the backbone context.
    pending_start: usize,
    budget: usize,
    records: Vec<UtteranceRecord>,
    frame_speakers: Vec<u8>,
    termination: Option<TerminationReason>,
}

impl Session {
    pub fn new(
        weights: Arc<ModelWeights>,
        config: SessionConfig,
        profiles: Vec<Arc<SpeakerProfile>>,
    ) -> Result<Self> {
        let guidance = config.validate(&weights.config)?;

        if profiles.is_empty() || profiles.len() > config.max_speakers {
            return Err(ColloquyError::ConfigError(format!(
                "Expected 1..={} speaker profiles, got {}",
                config.max_speakers,
                profiles.len()
            )));
        }
        let hidden = weights.hidden_size();
        let mut by_id = BTreeMap::new();
        for profile in profiles {
            if profile.embedding().dims() != [1, hidden] {
                return Err(ColloquyError::ConfigError(format!(
                    "Speaker {} embedding {:?} does not match backbone hidden size {}",
                    profile.speaker_id(),
                    profile.embedding().dims(),
                    hidden
                )));
            }
            if let Some(dup) = by_id.insert(profile.speaker_id(), profile) {
                return Err(ColloquyError::ConfigError(format!(
                    "Duplicate profile for speaker {}",
                    dup.speaker_id()
                )));
            }
        }

        let schedule = NoiseSchedule::from_config(
            &weights.config.diffusion_head_config,
            config.sampler_steps,
        )?;
        let null_condition = Tensor::zeros((1, hidden), candle_core::DType::F32, weights.device())?;
        let rng = SessionRng::new(config.seed);
        let cache = weights.backbone.new_cache();
        let latents = LatentSequence::new(weights.codec.vae_dim());

        let session = Self {
            weights,
            config,
            guidance,
            schedule,
            null_condition,
            profiles: by_id,
            tokenizer: Arc::new(ByteTokenizer),
            cancel: CancellationToken::new(),
            rng,
            cache,
            latents,
            state: ControlState::Generating,
            script: None,
            current: 0,
            active: None,
            utterance_start: 0,
            pending_start: 0,
            budget: 0,
            records: Vec::new(),
            frame_speakers: Vec::new(),
            termination: None,
        };
        session.check_tokenizer()?;
        Ok(session)
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn TextTokenizer>) -> Result<Self> {
        self.tokenizer = tokenizer;
        self.check_tokenizer()?;
        Ok(self)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn check_tokenizer(&self) -> Result<()> {
        let vocab = self.weights.config.backbone_config.vocab_size;
        if self.tokenizer.vocab_size() > vocab {
            return Err(ColloquyError::ConfigError(format!(
                "Tokenizer emits ids up to {} but the backbone vocabulary has {}",
                self.tokenizer.vocab_size(),
                vocab
            )));
        }
        Ok(())
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    pub fn latents(&self) -> &LatentSequence {
        &self.latents
    }

    pub fn frames_generated(&self) -> usize {
        self.latents.len()
    }

    /// Tokens committed to the backbone context so far.
    pub fn context_position(&self) -> usize {
        self.cache.position()
    }

    pub fn active_speaker(&self) -> Option<u8> {
        self.active.as_ref().map(|p| p.speaker_id())
    }

    /// Generate the whole script and decode it. A session already started on
    /// `script` is driven on from where it stands.
    pub fn run(&mut self, script: &Script) -> std::result::Result<SessionOutput, SessionFailure> {
        match &self.script {
            None => {
                if let Err(e) = self.start(script) {
                    return Err(self.fail(e));
                }
            }
            Some(started) if started != script => {
                let error = ColloquyError::ConfigError(
                    "Session already started on a different script".to_string(),
                );
                return Err(self.failure(error));
            }
            Some(_) => {}
        }
        while self.termination.is_none() {
            if let Err(e) = self.step() {
                return Err(self.fail(e));
            }
        }
        self.finish().map_err(|e| self.fail(e))
    }

    /// Prime voice prompts and prefill the first utterance.
    pub fn start(&mut self, script: &Script) -> Result<()> {
        if let Some(reason) = self.termination {
            return Err(ColloquyError::SessionEnded(reason));
        }
        if self.script.is_some() {
            return Err(ColloquyError::ConfigError(
                "Session already started".to_string(),
            ));
        }
        if let Some(missing) = script.speakers().into_iter().find(|id| !self.profiles.contains_key(id)) {
            return Err(ColloquyError::ConfigError(format!(
                "Script uses speaker {} but no profile was given for it",
                missing
            )));
        }

        info!(
            "🎬 Starting session: {} utterance(s), {} speaker(s), seed {}",
            script.len(),
            self.profiles.len(),
            self.config.seed
        );
        self.script = Some(script.clone());

        let result = self.prime_and_begin();
        if result.is_err() {
            self.termination = Some(TerminationReason::Failed);
        }
        result
    }

    fn prime_and_begin(&mut self) -> Result<()> {
        if self.config.prime_voice_prompts {
            let profiles: Vec<_> = self.profiles.values().cloned().collect();
            for profile in profiles {
                let Some(prompt) = profile.voice_prompt() else {
                    continue;
                };
                let embeds = Tensor::cat(
                    &[&profile.embedding().unsqueeze(1)?, &prompt.embeds()?],
                    1,
                )?;
                if !self.commit(&embeds)? {
                    return Ok(());
                }
                debug!(
                    "🎤 Primed speaker {} with {} prompt frame(s)",
                    profile.speaker_id(),
                    prompt.frames()
                );
            }
        }
        self.begin_utterance(0)
    }

    /// Append `embeds` `[1, n, hidden]` to the context. Returns `false` and
    /// terminates when the cap is reached.
    fn commit(&mut self, embeds: &Tensor) -> Result<bool> {
        let n = embeds.dim(1)?;
        let cap = self.config.max_context_tokens;
        if self.cache.position() + n > cap {
            debug!(
                "Context cap {} reached at {} (+{} needed)",
                cap,
                self.cache.position(),
                n
            );
            self.terminate(TerminationReason::ContextExhausted);
            return Ok(false);
        }
        let mut offset = 0;
        while offset < n {
            let len = PREFILL_CHUNK.min(n - offset);
            self.weights
                .backbone
                .commit(&embeds.narrow(1, offset, len)?, &mut self.cache)?;
            offset += len;
        }
        if self.cache.position() >= cap {
            self.terminate(TerminationReason::ContextExhausted);
            return Ok(false);
        }
        Ok(true)
    }

    fn begin_utterance(&mut self, index: usize) -> Result<()> {
        let utterance = self
            .script
            .as_ref()
            .and_then(|s| s.get(index))
            .cloned()
            .ok_or_else(|| {
                ColloquyError::GenerationError(format!("No utterance at position {}", index))
            })?;
        let profile = self
            .profiles
            .get(&utterance.speaker_id)
            .cloned()
            .ok_or_else(|| {
                ColloquyError::ConfigError(format!("No profile for speaker {}", utterance.speaker_id))
            })?;

        let ids = self
            .tokenizer
            .encode(&utterance_prompt(utterance.speaker_id, &utterance.text))?;
        let text_embeds = self.weights.backbone.embed_tokens(&ids)?;
        let prefill = Tensor::cat(&[&profile.embedding().unsqueeze(1)?, &text_embeds], 1)?;

        self.current = index;
        self.active = Some(profile);
        self.utterance_start = self.latents.len();
        self.pending_start = self.latents.len();
        self.budget = self
            .config
            .min_utterance_frames
            .max((ids.len() as f32 * self.config.frames_per_token).ceil() as usize);
        self.records.push(UtteranceRecord {
            position: index,
            speaker_id: utterance.speaker_id,
            frames: self.latents.len()..self.latents.len(),
            end_event: None,
            forced: false,
        });

        debug!(
            "🗣️  Utterance {} (speaker {}): {} tokens, budget {} frames",
            index,
            utterance.speaker_id,
            ids.len(),
            self.budget
        );
        self.commit(&prefill)?;
        Ok(())
    }

    fn active_profile(&self) -> Result<&Arc<SpeakerProfile>> {
        self.active
            .as_ref()
            .ok_or_else(|| ColloquyError::GenerationError("Session not started".to_string()))
    }

    /// Context token for frames `range`: the pooled latent through the acoustic
    /// connector plus the active speaker embedding, `[1, 1, hidden]`.
    fn summary_embed(&self, range: Range<usize>) -> Result<Tensor> {
        let pooled = self.latents.mean_pool(range.clone()).ok_or_else(|| {
            ColloquyError::GenerationError(format!("Cannot pool frames {:?}", range))
        })?;
        let dim = pooled.len();
        let pooled = Tensor::from_vec(pooled, (1, 1, dim), self.weights.device())?;
        let acoustic = self.weights.acoustic_connector.forward(&pooled)?;
        let speaker = self.active_profile()?.embedding().unsqueeze(1)?;
        Ok(acoustic.broadcast_add(&speaker)?)
    }

    /// Conditioning for the next frame. A partial window is attended to
    /// speculatively without entering the cache.
    fn current_hidden(&self) -> Result<Tensor> {
        let end = self.latents.len();
        if self.pending_start < end {
            let embed = self.summary_embed(self.pending_start..end)?;
            return Ok(self.weights.backbone.speculate(&embed, &self.cache)?);
        }
        self.cache
            .last_hidden()
            .cloned()
            .ok_or_else(|| ColloquyError::GenerationError("Backbone context is empty".to_string()))
    }

    /// Commit whatever is pending, full window or not.
    fn flush_pending(&mut self) -> Result<bool> {
        let end = self.latents.len();
        if self.pending_start >= end {
            return Ok(true);
        }
        let embed = self.summary_embed(self.pending_start..end)?;
        self.pending_start = end;
        self.commit(&embed)
    }

    fn terminate(&mut self, reason: TerminationReason) {
        if self.termination.is_none() {
            info!("🏁 Session terminated: {} after {} frame(s)", reason, self.latents.len());
            self.termination = Some(reason);
            self.state = ControlState::SessionEnd;
        }
    }

    /// Generate one frame, or finish.
    pub fn step(&mut self) -> Result<StepOutcome> {
        if let Some(reason) = self.termination {
            return Err(ColloquyError::SessionEnded(reason));
        }
        if self.script.is_none() {
            return Err(ColloquyError::ConfigError(
                "Session not started".to_string(),
            ));
        }
        if self.cancel.is_cancelled() {
            self.terminate(TerminationReason::Cancelled);
            return Ok(StepOutcome::Finished(TerminationReason::Cancelled));
        }

        let result = self.step_inner();
        if result.is_err() {
            self.terminate(TerminationReason::Failed);
        }
        result
    }

    fn step_inner(&mut self) -> Result<StepOutcome> {
        let mut hidden = self.current_hidden()?;
        trace!("Frame {} condition {}", self.latents.len(), tensor_stats(&hidden));

        let frames_in_utterance = self.latents.len() - self.utterance_start;
        let forced = frames_in_utterance >= self.budget;
        let event = if forced {
            ControlEvent::EndOfUtterance
        } else {
            let dist = self.weights.control_head.distribution(&hidden)?;
            let dist = if frames_in_utterance < self.config.min_utterance_frames {
                dist.mask_end_events()
            } else {
                dist
            };
            dist.decide(self.config.control_decoding, &mut self.rng)
        };

        if event.ends_utterance() {
            let next = self.current + 1;
            let next_speaker = self
                .script
                .as_ref()
                .and_then(|s| s.get(next))
                .map(|u| u.speaker_id);
            let current_speaker = self.active_profile()?.speaker_id();
            let differs = next_speaker.is_some_and(|id| id != current_speaker);
            self.state = self.state.on_event(event, differs);

            if let Some(record) = self.records.last_mut() {
                record.end_event = Some(event);
                record.forced = forced;
            }
            if forced {
                debug!(
                    "Utterance {} hit its {} frame budget",
                    self.current, self.budget
                );
            }

            if next_speaker.is_none() {
                self.terminate(TerminationReason::SessionEnd);
                return Ok(StepOutcome::Finished(TerminationReason::SessionEnd));
            }
            if !self.flush_pending()? {
                return Ok(StepOutcome::Finished(TerminationReason::ContextExhausted));
            }
            self.begin_utterance(next)?;
            if let Some(reason) = self.termination {
                return Ok(StepOutcome::Finished(reason));
            }
            self.state = self.state.resolve();
            hidden = self.current_hidden()?;
        }

        let index = self.latents.len();
        let latent = sample_with_retry(
            &self.weights.prediction_head,
            &hidden,
            &self.null_condition,
            &self.schedule,
            self.guidance,
            &mut self.rng,
            index,
            self.config.retry,
        )?;
        self.latents.push(&latent)?;

        let speaker_id = self.active_profile()?.speaker_id();
        self.frame_speakers.push(speaker_id);
        if let Some(record) = self.records.last_mut() {
            record.frames.end = self.latents.len();
        }

        if self.latents.len() - self.pending_start >= self.config.summary_window {
            self.flush_pending()?;
        }
        if self.latents.len() >= self.config.max_context_tokens {
            self.terminate(TerminationReason::ContextExhausted);
        }

        Ok(StepOutcome::Frame(FrameInfo {
            index,
            speaker_id,
            event,
        }))
    }

    fn metadata(&self) -> SessionMetadata {
        let mut per_speaker: BTreeMap<u8, Vec<Range<usize>>> = BTreeMap::new();
        for record in &self.records {
            per_speaker
                .entry(record.speaker_id)
                .or_default()
                .push(record.frames.clone());
        }
        SessionMetadata {
            termination_reason: self.termination.unwrap_or(TerminationReason::Cancelled),
            total_frames: self.latents.len(),
            per_speaker_utterance_boundaries: per_speaker,
            utterances: self.records.clone(),
            frame_speakers: self.frame_speakers.clone(),
            context_tokens_used: self.cache.position(),
        }
    }

    /// Decode everything generated so far. A session still running is
    /// cancelled first.
    pub fn finish(&mut self) -> Result<SessionOutput> {
        if self.termination.is_none() {
            self.terminate(TerminationReason::Cancelled);
        }
        let audio = self.weights.codec.decode(&self.latents)?;
        info!(
            "✓ Decoded {} frame(s) into {:.2}s of audio",
            self.latents.len(),
            audio.duration_secs()
        );
        Ok(SessionOutput {
            audio,
            metadata: self.metadata(),
            latents: self.latents.clone(),
        })
    }

    fn fail(&mut self, error: ColloquyError) -> SessionFailure {
        if !matches!(error, ColloquyError::SessionEnded(_)) {
            self.terminate(TerminationReason::Failed);
        }
        self.failure(error)
    }

    /// Error plus everything decoded so far, leaving the session state alone.
    fn failure(&self, error: ColloquyError) -> SessionFailure {
        let audio = match self.weights.codec.decode(&self.latents) {
            Ok(audio) => audio,
            Err(e) => {
                warn!("⚠️  Partial decode failed: {}", e);
                AudioData::empty(SAMPLE_RATE)
            }
        };
        SessionFailure {
            error,
            partial: Box::new(SessionOutput {
                audio,
                metadata: self.metadata(),
                latents: self.latents.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_SPEAKERS;
    use crate::testing::{tiny_profile, tiny_weights};
    use std::cell::Cell;

    const HOP: usize = 3200;

    fn config() -> SessionConfig {
        SessionConfig {
            max_context_tokens: 4096,
            sampler_steps: 4,
            guidance_weight: 1.5,
            frames_per_token: 0.1,
            ..SessionConfig::default()
        }
    }

    fn session(config: SessionConfig, speakers: &[(u8, u64)]) -> Session {
        let profiles = speakers.iter().map(|&(id, seed)| tiny_profile(id, seed)).collect();
        Session::new(tiny_weights(), config, profiles).unwrap()
    }

    #[test]
    fn test_hello_there() {
        let config = SessionConfig {
            sampler_steps: 10,
            ..config()
        };
        let mut s = session(config, &[(1, 11)]);
        let output = s.run(&Script::single(1, "Hello there").unwrap()).unwrap();

        let meta = &output.metadata;
        assert_eq!(meta.termination_reason, TerminationReason::SessionEnd);
        assert!(meta.total_frames >= 1);
        assert_eq!(output.audio.sample_rate(), SAMPLE_RATE);
        assert_eq!(output.audio.num_samples(), meta.total_frames * HOP);
        let expected_secs = meta.total_frames as f32 / 7.5;
        assert!((output.audio.duration_secs() - expected_secs).abs() <= 1.0 / 7.5);
        assert_eq!(meta.per_speaker_utterance_boundaries[&1], vec![0..meta.total_frames]);
    }

    #[test]
    fn test_one_frame_per_step() {
        let config = SessionConfig {
            min_utterance_frames: 50,
            ..config()
        };
        let mut s = session(config, &[(1, 1)]);
        s.start(&Script::single(1, "A long enough line of text").unwrap())
            .unwrap();

        for n in 1..=12 {
            match s.step().unwrap() {
                StepOutcome::Frame(info) => assert_eq!(info.index, n - 1),
                other => panic!("unexpected {:?}", other),
            }
            assert_eq!(s.frames_generated(), n);
            assert_eq!(s.latents().len(), n);
        }
    }

    #[test]
    fn test_summaries_feed_back_into_context() {
        let config = SessionConfig {
            min_utterance_frames: 20,
            summary_window: 3,
            ..config()
        };
        let mut s = session(config, &[(1, 1)]);
        s.start(&Script::single(1, "Pooling").unwrap()).unwrap();
        let after_prefill = s.context_position();

        for _ in 0..7 {
            s.step().unwrap();
        }
        assert_eq!(s.context_position(), after_prefill + 2);
    }

    #[test]
    fn test_speaker_isolation_and_determinism() {
        let script = Script::single(1, "Same words").unwrap();
        let run = |seed: u64| {
            let mut s = session(config(), &[(1, seed)]);
            s.run(&script).unwrap().latents
        };
        let a = run(100);
        let b = run(100);
        let c = run(200);
        assert_eq!(a.as_slice(), b.as_slice());
        assert!(!a.is_empty());
        let n = a.len().min(c.len());
        assert_ne!(a.window(0..n), c.window(0..n));
    }

    #[test]
    fn test_context_exhausted_at_prefill() {
        let mut s = session(config(), &[(1, 1)]);
        let output = s.run(&Script::single(1, "a".repeat(5000)).unwrap()).unwrap();
        assert_eq!(output.metadata.termination_reason, TerminationReason::ContextExhausted);
        assert_eq!(output.metadata.total_frames, 0);
        assert!(output.audio.is_empty());
    }

    #[test]
    fn test_context_exhausted_between_utterances() {
        let config = SessionConfig {
            min_utterance_frames: 2,
            frames_per_token: 0.001,
            ..config()
        };
        let text = "a".repeat(1400);
        let prefill = utterance_prompt(1, &text).len() + 1;
        let script = Script::new([(1, text.clone()), (1, text.clone()), (1, text)]).unwrap();

        let mut s = session(config, &[(1, 1)]);
        let output = s.run(&script).unwrap();

        // Two utterances of two frames fit, each flushed as one summary token
        let meta = &output.metadata;
        assert_eq!(meta.termination_reason, TerminationReason::ContextExhausted);
        assert_eq!(meta.total_frames, 4);
        assert_eq!(meta.context_tokens_used, 2 * (prefill + 1));
        assert_eq!(meta.utterances.len(), 3);
        assert!(meta.utterances[2].frames.is_empty());
        assert_eq!(meta.utterances[2].end_event, None);
        assert_eq!(output.audio.num_samples(), 4 * HOP);
    }

    #[test]
    fn test_context_exhausted_mid_utterance() {
        // Prefill leaves room for exactly three summary tokens
        let overhead = utterance_prompt(1, "").len() + 1;
        let text = "a".repeat(4096 - 3 - overhead);
        let config = SessionConfig {
            summary_window: 3,
            min_utterance_frames: 100,
            frames_per_token: 3.0,
            ..config()
        };
        let mut s = session(config, &[(1, 1)]);
        let output = s.run(&Script::single(1, text).unwrap()).unwrap();

        assert_eq!(output.metadata.termination_reason, TerminationReason::ContextExhausted);
        assert_eq!(output.metadata.total_frames, 9);
        assert_eq!(output.metadata.context_tokens_used, 4096);
        assert_eq!(output.audio.num_samples(), 9 * HOP);
    }

    #[test]
    fn test_speaker_switch_happens_once() {
        let config = SessionConfig {
            min_utterance_frames: 2,
            frames_per_token: 0.01,
            ..config()
        };
        let mut s = session(config, &[(1, 1), (2, 2)]);
        let output = s
            .run(&Script::new([(1, "Hi"), (2, "Yo")]).unwrap())
            .unwrap();

        let speakers = &output.metadata.frame_speakers;
        assert_eq!(speakers, &vec![1, 1, 2, 2]);
        let switches = speakers.windows(2).filter(|w| w[0] != w[1]).count();
        assert_eq!(switches, 1);
        assert_eq!(output.metadata.per_speaker_utterance_boundaries[&2], vec![2..4]);
    }

    #[test]
    fn test_frame_budget_forces_utterance_end() {
        let config = SessionConfig {
            min_utterance_frames: 2,
            frames_per_token: 0.01,
            ..config()
        };
        let mut s = session(config, &[(1, 1)]);
        let output = s
            .run(&Script::new([(1, "one"), (1, "two"), (1, "three")]).unwrap())
            .unwrap();

        assert_eq!(output.metadata.total_frames, 6);
        for record in &output.metadata.utterances {
            assert_eq!(record.frames.len(), 2);
            assert!(record.forced);
            assert_eq!(record.end_event, Some(ControlEvent::EndOfUtterance));
        }
    }

    #[test]
    fn test_cancellation_keeps_audio_decodable() {
        let config = SessionConfig {
            min_utterance_frames: 50,
            ..config()
        };
        let token = CancellationToken::new();
        let mut s = session(config, &[(1, 1)]).with_cancellation(token.clone());
        s.start(&Script::single(1, "Interrupted speech").unwrap())
            .unwrap();

        for _ in 0..4 {
            assert!(matches!(s.step().unwrap(), StepOutcome::Frame(_)));
        }
        token.cancel();
        assert_eq!(
            s.step().unwrap(),
            StepOutcome::Finished(TerminationReason::Cancelled)
        );

        let output = s.finish().unwrap();
        assert_eq!(output.metadata.termination_reason, TerminationReason::Cancelled);
        assert_eq!(output.audio.num_samples(), 4 * HOP);
    }

    #[test]
    fn test_calls_after_end_are_rejected() {
        let mut s = session(config(), &[(1, 1)]);
        let script = Script::single(1, "Done").unwrap();
        s.run(&script).unwrap();

        assert!(matches!(
            s.step(),
            Err(ColloquyError::SessionEnded(TerminationReason::SessionEnd))
        ));
        let failure = s.run(&script).unwrap_err();
        assert!(matches!(failure.error, ColloquyError::SessionEnded(_)));
    }

    #[test]
    fn test_run_continues_a_started_session() {
        let config = SessionConfig {
            min_utterance_frames: 2,
            frames_per_token: 0.01,
            ..config()
        };
        let script = Script::new([(1, "Hi"), (2, "Yo")]).unwrap();
        let mut s = session(config, &[(1, 1), (2, 2)]);
        s.start(&script).unwrap();
        assert!(matches!(s.step().unwrap(), StepOutcome::Frame(_)));

        let other = Script::single(1, "Something else").unwrap();
        let failure = s.run(&other).unwrap_err();
        assert!(matches!(failure.error, ColloquyError::ConfigError(_)));
        assert_eq!(failure.partial.metadata.total_frames, 1);
        assert_eq!(s.termination(), None);

        let output = s.run(&script).unwrap();
        assert_eq!(output.metadata.termination_reason, TerminationReason::SessionEnd);
        assert_eq!(output.metadata.frame_speakers, vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_rejects_bad_setup() {
        let weights = tiny_weights();
        assert!(matches!(
            Session::new(weights.clone(), config(), vec![]),
            Err(ColloquyError::ConfigError(_))
        ));
        assert!(matches!(
            Session::new(weights.clone(), config(), vec![tiny_profile(1, 1), tiny_profile(1, 2)]),
            Err(ColloquyError::ConfigError(_))
        ));
        let too_many = (1..=MAX_SPEAKERS as u8 + 1).map(|id| tiny_profile(id.min(4), id as u64)).collect();
        assert!(Session::new(weights.clone(), config(), too_many).is_err());
        assert!(matches!(
            Session::new(
                weights.clone(),
                SessionConfig {
                    guidance_weight: -1.0,
                    ..config()
                },
                vec![tiny_profile(1, 1)]
            ),
            Err(ColloquyError::DegenerateGuidance(_))
        ));
        assert!(matches!(
            Session::new(
                weights.clone(),
                SessionConfig {
                    max_context_tokens: 5000,
                    ..config()
                },
                vec![tiny_profile(1, 1)]
            ),
            Err(ColloquyError::ConfigError(_))
        ));

        let mut s = session(config(), &[(1, 1)]);
        assert!(matches!(s.step(), Err(ColloquyError::ConfigError(_))));
        assert!(matches!(
            s.start(&Script::single(2, "who?").unwrap()),
            Err(ColloquyError::ConfigError(_))
        ));
    }

    #[test]
    fn test_voice_prompts_prime_context() {
        let weights = tiny_weights();
        let mut rng = SessionRng::new(5);
        let clip = AudioData::from_samples(
            (0..HOP * 4).map(|i| 0.2 * (i as f32 * 0.02).sin()).collect(),
            SAMPLE_RATE,
        );
        let profile = Arc::new(
            SpeakerProfile::from_reference_audio(&weights, 1, &clip, &mut rng).unwrap(),
        );
        let text = "Primed";
        let prefill = ByteTokenizer.encode(&utterance_prompt(1, text)).unwrap().len() + 1;

        let mut primed = Session::new(weights.clone(), config(), vec![profile.clone()]).unwrap();
        primed.start(&Script::single(1, text).unwrap()).unwrap();
        assert_eq!(primed.context_position(), 1 + 4 + prefill);

        let unprimed_config = SessionConfig {
            prime_voice_prompts: false,
            ..config()
        };
        let mut unprimed = Session::new(weights, unprimed_config, vec![profile]).unwrap();
        unprimed.start(&Script::single(1, text).unwrap()).unwrap();
        assert_eq!(unprimed.context_position(), prefill);
    }

    struct FlakyDenoiser {
        latent: usize,
        nan_calls: Cell<usize>,
    }

    impl Denoiser for FlakyDenoiser {
        fn latent_dim(&self) -> usize {
            self.latent
        }

        fn denoise(
            &self,
            noisy: &Tensor,
            _timesteps: &Tensor,
            _condition: &Tensor,
        ) -> anyhow::Result<Tensor> {
            let remaining = self.nan_calls.get();
            if remaining > 0 {
                self.nan_calls.set(remaining - 1);
                return Ok((noisy.zeros_like()? + f64::NAN)?);
            }
            Ok(noisy.zeros_like()?)
        }
    }

    #[test]
    fn test_retry_resamples_non_finite_frames() {
        let schedule = NoiseSchedule::new(1000, 4).unwrap();
        let condition = Tensor::zeros((1, 4), candle_core::DType::F32, &candle_core::Device::Cpu).unwrap();
        let guidance = GuidanceConfig::disabled();
        let mut rng = SessionRng::new(0);

        // One full frame worth of NaN output, then clean
        let flaky = FlakyDenoiser {
            latent: 4,
            nan_calls: Cell::new(4),
        };
        let frame = sample_with_retry(
            &flaky,
            &condition,
            &condition,
            &schedule,
            guidance,
            &mut rng,
            0,
            RetryPolicy { max_attempts: 1 },
        )
        .unwrap();
        assert!(frame.is_finite());

        let broken = FlakyDenoiser {
            latent: 4,
            nan_calls: Cell::new(usize::MAX),
        };
        let err = sample_with_retry(
            &broken,
            &condition,
            &condition,
            &schedule,
            guidance,
            &mut rng,
            7,
            RetryPolicy { max_attempts: 2 },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ColloquyError::NonFiniteFrame { frame: 7, attempts: 3 }
        ));
    }
}
