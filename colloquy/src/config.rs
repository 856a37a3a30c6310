use anyhow::{Error as AnyErr, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, warn};

use crate::control::ControlDecoding;
use crate::error::ColloquyError;
use crate::sampler::GuidanceConfig;

/// Output sample rate of the acoustic codec.
pub const SAMPLE_RATE: u32 = 24_000;

/// Context lengths the backbone is deployed with.
pub const SUPPORTED_CONTEXT_LENGTHS: [usize; 4] = [4096, 16384, 32768, 65536];

/// Upper bound on distinct voices in one session.
pub const MAX_SPEAKERS: usize = 4;

/// Top-level checkpoint config (`config.json` next to the safetensors shards)
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(alias = "decoder_config", alias = "llm_config")]
    pub backbone_config: BackboneConfig,
    pub diffusion_head_config: DiffusionHeadConfig,
    pub acoustic_tokenizer_config: TokenizerConfig,
    pub semantic_tokenizer_config: TokenizerConfig,
    #[serde(default = "default_acoustic_vae_dim")]
    pub acoustic_vae_dim: usize,
    #[serde(default = "default_semantic_vae_dim")]
    pub semantic_vae_dim: usize,
}
fn default_model_type() -> String {
    "colloquy".to_string()
}
fn default_acoustic_vae_dim() -> usize {
    64
}
fn default_semantic_vae_dim() -> usize {
    128
}

impl ModelConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| AnyErr::msg(format!("Failed to parse config: {}", e)))?;
        config.validate()?;

        debug!("✓ Loaded {} configuration", config.model_type);
        debug!(
            "  Backbone: hidden={}, vocab={}, heads={}, kv_heads={}, layers={}",
            config.backbone_config.hidden_size,
            config.backbone_config.vocab_size,
            config.backbone_config.num_attention_heads,
            config.backbone_config.num_key_value_heads,
            config.backbone_config.num_hidden_layers
        );
        debug!(
            "  VAE: acoustic={}, semantic={}, hop={}",
            config.acoustic_tokenizer_config.vae_dim,
            config.semantic_tokenizer_config.vae_dim,
            config.hop_length()
        );
        debug!(
            "  Diffusion: {} layers, {} inference steps",
            config.diffusion_head_config.head_layers,
            config.diffusion_head_config.ddpm_num_inference_steps
        );

        Ok(config)
    }

    /// Cross-component checks. Dimension disagreements between the codec, the
    /// connectors and the backbone are fatal.
    pub fn validate(&self) -> Result<()> {
        self.backbone_config.validate()?;
        self.acoustic_tokenizer_config.depths()?;
        self.semantic_tokenizer_config.depths()?;

        let hidden = self.backbone_config.hidden_size;
        if self.diffusion_head_config.hidden_size != hidden {
            return Err(AnyErr::msg(format!(
                "Diffusion head hidden size {} does not match backbone hidden size {}",
                self.diffusion_head_config.hidden_size, hidden
            )));
        }
        if self.diffusion_head_config.latent_size != self.acoustic_vae_dim {
            return Err(AnyErr::msg(format!(
                "Diffusion latent size {} does not match acoustic_vae_dim {}",
                self.diffusion_head_config.latent_size, self.acoustic_vae_dim
            )));
        }
        if self.acoustic_tokenizer_config.vae_dim != self.acoustic_vae_dim {
            return Err(AnyErr::msg(format!(
                "Acoustic codec vae_dim {} does not match acoustic_vae_dim {}",
                self.acoustic_tokenizer_config.vae_dim, self.acoustic_vae_dim
            )));
        }
        if self.semantic_tokenizer_config.vae_dim != self.semantic_vae_dim {
            return Err(AnyErr::msg(format!(
                "Semantic encoder vae_dim {} does not match semantic_vae_dim {}",
                self.semantic_tokenizer_config.vae_dim, self.semantic_vae_dim
            )));
        }
        if self.acoustic_tokenizer_config.hop_length()
            != self.semantic_tokenizer_config.hop_length()
        {
            return Err(AnyErr::msg(format!(
                "Acoustic hop {} and semantic hop {} differ",
                self.acoustic_tokenizer_config.hop_length(),
                self.semantic_tokenizer_config.hop_length()
            )));
        }

        let head = &self.diffusion_head_config;
        if head.prediction_type != "v_prediction" {
            return Err(AnyErr::msg(format!(
                "Unsupported prediction type '{}', only v_prediction is implemented",
                head.prediction_type
            )));
        }
        if head.ddpm_beta_schedule != "cosine" {
            return Err(AnyErr::msg(format!(
                "Unsupported beta schedule '{}', only cosine is implemented",
                head.ddpm_beta_schedule
            )));
        }
        if head.ddpm_num_steps < 2 {
            return Err(AnyErr::msg("ddpm_num_steps must be at least 2"));
        }

        if self.hop_length() != 3200 {
            warn!(
                "  ⚠️  Warning: Codec hop length is {}, frame rate will be {:.2} Hz instead of 7.5 Hz",
                self.hop_length(),
                self.frame_rate()
            );
        }
        if self.acoustic_vae_dim != 64 {
            warn!(
                "  ⚠️  Warning: Expected acoustic_vae_dim=64, got {}",
                self.acoustic_vae_dim
            );
        }
        Ok(())
    }

    /// Samples per latent frame.
    pub fn hop_length(&self) -> usize {
        self.acoustic_tokenizer_config.hop_length()
    }

    /// Latent frames per second of audio.
    pub fn frame_rate(&self) -> f64 {
        SAMPLE_RATE as f64 / self.hop_length() as f64
    }
}

/// Causal transformer parameters
#[derive(Debug, Clone, Deserialize)]
pub struct BackboneConfig {
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub rope_theta: f64,
    pub rms_norm_eps: f64,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default)]
    pub head_dim: Option<usize>,
}
fn default_hidden_act() -> String {
    "silu".to_string()
}
impl BackboneConfig {
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.num_key_value_heads == 0 {
            return Err(AnyErr::msg("Attention head counts must be non-zero"));
        }
        if self.head_dim.is_none() && self.hidden_size % self.num_attention_heads != 0 {
            return Err(AnyErr::msg(format!(
                "hidden_size {} is not divisible by {} attention heads",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(AnyErr::msg(format!(
                "{} attention heads cannot be grouped over {} KV heads",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(AnyErr::msg(format!(
                "RoPE needs an even head_dim, got {}",
                self.head_dim()
            )));
        }

        if (self.rms_norm_eps - 1e-6).abs() > 1e-9 {
            warn!(
                "⚠️  RMS norm eps is {}, expected 1e-06",
                self.rms_norm_eps
            );
        }
        if self.rope_theta < 10000.0 {
            warn!("⚠️  RoPE theta is unusually small: {}", self.rope_theta);
        }
        if self.hidden_act != "silu" {
            warn!(
                "⚠️  Hidden activation is '{}', only 'silu' is implemented",
                self.hidden_act
            );
        }
        Ok(())
    }
}

/// Diffusion head and noise schedule parameters
#[derive(Debug, Clone, Deserialize)]
pub struct DiffusionHeadConfig {
    pub hidden_size: usize,
    pub latent_size: usize,
    pub head_layers: usize,
    #[serde(default = "default_head_ffn_ratio")]
    pub head_ffn_ratio: f64,
    #[serde(default = "default_head_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_ddpm_num_steps")]
    pub ddpm_num_steps: usize,
    #[serde(default = "default_ddpm_inference_steps")]
    pub ddpm_num_inference_steps: usize,
    #[serde(default = "default_beta_schedule")]
    pub ddpm_beta_schedule: String,
    #[serde(default = "default_prediction_type")]
    pub prediction_type: String,
}
fn default_head_ffn_ratio() -> f64 {
    3.0
}
fn default_head_eps() -> f64 {
    1e-5
}
fn default_ddpm_num_steps() -> usize {
    1000
}
fn default_ddpm_inference_steps() -> usize {
    10
}
fn default_beta_schedule() -> String {
    "cosine".to_string()
}
fn default_prediction_type() -> String {
    "v_prediction".to_string()
}

/// Codec / semantic encoder configuration. Both share the encoder layout; the
/// decoder fields are only read for the acoustic codec.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default = "default_true")]
    pub causal: bool,
    pub vae_dim: usize,
    #[serde(default)]
    pub fix_std: f64,
    #[serde(default = "default_std_dist_type")]
    pub std_dist_type: String,
    #[serde(default = "default_mixer_layer")]
    pub mixer_layer: String,
    #[serde(default = "default_pad_mode")]
    pub pad_mode: String,
    #[serde(default = "default_true")]
    pub disable_last_norm: bool,
    #[serde(default = "default_layernorm_eps")]
    pub layernorm_eps: f64,
    #[serde(default = "default_true")]
    pub layernorm_elementwise_affine: bool,
    #[serde(default = "default_true")]
    pub conv_bias: bool,
    #[serde(default = "default_layer_scale")]
    pub layer_scale_init_value: f64,
    pub encoder_n_filters: usize,
    pub encoder_ratios: Vec<usize>,
    pub encoder_depths: String,
    #[serde(default)]
    pub decoder_n_filters: Option<usize>,
    #[serde(default)]
    pub decoder_ratios: Option<Vec<usize>>,
    #[serde(default)]
    pub decoder_depths: Option<String>,
}
fn default_channels() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_std_dist_type() -> String {
    "none".to_string()
}
fn default_mixer_layer() -> String {
    "depthwise_conv".to_string()
}
fn default_pad_mode() -> String {
    "constant".to_string()
}
fn default_layernorm_eps() -> f64 {
    1e-5
}
fn default_layer_scale() -> f64 {
    1e-6
}

/// Parse "3-3-3-3-3-3-8" into [3, 3, 3, 3, 3, 3, 8]
pub fn parse_depths(depths: &str) -> Result<Vec<usize>> {
    depths
        .split('-')
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|e| AnyErr::msg(format!("Invalid depth '{}' in '{}': {}", s, depths, e)))
        })
        .collect()
}

impl TokenizerConfig {
    /// Encoder stage depths. There is one stage per downsample layer (stem included).
    pub fn depths(&self) -> Result<Vec<usize>> {
        let depths = parse_depths(&self.encoder_depths)?;
        if depths.len() != self.encoder_ratios.len() + 1 {
            return Err(AnyErr::msg(format!(
                "Expected {} encoder depths for {} ratios, got {}",
                self.encoder_ratios.len() + 1,
                self.encoder_ratios.len(),
                depths.len()
            )));
        }
        Ok(depths)
    }

    pub fn hop_length(&self) -> usize {
        self.encoder_ratios.iter().product()
    }

    pub fn is_variational(&self) -> bool {
        self.std_dist_type == "gaussian" && self.fix_std > 0.0
    }
}

/// VAE decoder configuration derived from the acoustic [`TokenizerConfig`]
#[derive(Debug, Clone)]
pub struct VAEDecoderConfig {
    /// Number of audio channels (1 for mono)
    pub channels: usize,
    /// VAE latent dimension
    pub vae_dim: usize,
    /// Base number of filters
    pub n_filters: usize,
    /// Upsampling ratios for each stage
    pub ratios: Vec<usize>,
    /// Number of blocks in each stage
    pub depths: Vec<usize>,
    pub causal: bool,
    pub kernel_size: usize,
    pub last_kernel_size: usize,
    pub pad_mode: String,
    pub conv_bias: bool,
    pub layernorm_eps: f64,
    pub layernorm_elementwise_affine: bool,
    pub mixer_layer: String,
    pub layer_scale_init_value: f64,
    pub disable_last_norm: bool,
    /// Trim right ratio for transposed convolutions
    pub trim_right_ratio: f64,
    pub ffn_expansion: usize,
}

impl VAEDecoderConfig {
    pub fn from_tokenizer_config(tc: &TokenizerConfig) -> Result<Self> {
        let encoder_depths = tc.depths()?;

        // Decoder depths: explicit config or reversed encoder depths
        let depths = match &tc.decoder_depths {
            Some(s) => parse_depths(s)?,
            None => encoder_depths.iter().rev().cloned().collect(),
        };

        // Decoder walks the ratios in config order (the encoder reverses them)
        let ratios = tc
            .decoder_ratios
            .clone()
            .unwrap_or_else(|| tc.encoder_ratios.clone());

        if depths.len() != ratios.len() + 1 {
            return Err(AnyErr::msg(format!(
                "Expected {} decoder depths for {} ratios, got {}",
                ratios.len() + 1,
                ratios.len(),
                depths.len()
            )));
        }

        Ok(Self {
            channels: tc.channels,
            vae_dim: tc.vae_dim,
            n_filters: tc.decoder_n_filters.unwrap_or(tc.encoder_n_filters),
            ratios,
            depths,
            causal: tc.causal,
            kernel_size: 7,
            last_kernel_size: 7,
            pad_mode: tc.pad_mode.clone(),
            conv_bias: tc.conv_bias,
            layernorm_eps: tc.layernorm_eps,
            layernorm_elementwise_affine: tc.layernorm_elementwise_affine,
            mixer_layer: tc.mixer_layer.clone(),
            layer_scale_init_value: tc.layer_scale_init_value,
            disable_last_norm: tc.disable_last_norm,
            trim_right_ratio: 1.0,
            ffn_expansion: 4,
        })
    }

    /// Channel count of each decoder stage, widest first
    pub fn stage_channels(&self) -> Vec<usize> {
        let num_stages = self.depths.len();
        (0..num_stages)
            .map(|i| self.n_filters * 2_usize.pow((num_stages - 1 - i) as u32))
            .collect()
    }

    /// Total upsampling factor
    pub fn hop_length(&self) -> usize {
        self.ratios.iter().product()
    }
}

/// Bounded resampling of a frame whose denoised values came out non-finite.
/// `max_attempts == 0` disables retries.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

/// Per-session settings. Everything here is read-only once the session starts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_context_tokens: usize,
    pub sampler_steps: usize,
    pub guidance_weight: f32,
    pub max_speakers: usize,
    pub seed: u64,
    /// Frames pooled into one backbone context token.
    pub summary_window: usize,
    /// Frame budget per text token before an utterance is force-ended.
    pub frames_per_token: f32,
    /// End events are masked until an utterance has this many frames.
    pub min_utterance_frames: usize,
    pub control_decoding: ControlDecoding,
    pub retry: RetryPolicy,
    /// Inject each speaker's voice prompt into the context before the script.
    pub prime_voice_prompts: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 32768,
            sampler_steps: 10,
            guidance_weight: 1.3,
            max_speakers: MAX_SPEAKERS,
            seed: 524242,
            summary_window: 3,
            frames_per_token: 3.0,
            min_utterance_frames: 1,
            control_decoding: ControlDecoding::Greedy,
            retry: RetryPolicy::default(),
            prime_voice_prompts: true,
        }
    }
}

impl SessionConfig {
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| ColloquyError::ConfigError(format!("Failed to parse session config: {}", e)))
    }

    /// Reject settings no session may start with and derive the guidance setup.
    pub fn validate(&self, model: &ModelConfig) -> crate::Result<GuidanceConfig> {
        if !SUPPORTED_CONTEXT_LENGTHS.contains(&self.max_context_tokens) {
            return Err(ColloquyError::ConfigError(format!(
                "max_context_tokens must be one of {:?}, got {}",
                SUPPORTED_CONTEXT_LENGTHS, self.max_context_tokens
            )));
        }
        if self.max_speakers == 0 || self.max_speakers > MAX_SPEAKERS {
            return Err(ColloquyError::ConfigError(format!(
                "max_speakers must be in 1..={}, got {}",
                MAX_SPEAKERS, self.max_speakers
            )));
        }
        if self.sampler_steps == 0 || self.sampler_steps > model.diffusion_head_config.ddpm_num_steps
        {
            return Err(ColloquyError::ConfigError(format!(
                "sampler_steps must be in 1..={}, got {}",
                model.diffusion_head_config.ddpm_num_steps, self.sampler_steps
            )));
        }
        if self.summary_window == 0 {
            return Err(ColloquyError::ConfigError(
                "summary_window must be at least 1".to_string(),
            ));
        }
        if !(self.frames_per_token.is_finite() && self.frames_per_token > 0.0) {
            return Err(ColloquyError::ConfigError(format!(
                "frames_per_token must be positive, got {}",
                self.frames_per_token
            )));
        }
        if self.min_utterance_frames == 0 {
            return Err(ColloquyError::ConfigError(
                "min_utterance_frames must be at least 1".to_string(),
            ));
        }
        if let ControlDecoding::Sampled { temperature } = self.control_decoding
            && !(temperature.is_finite() && temperature > 0.0)
        {
            return Err(ColloquyError::ConfigError(format!(
                "Control sampling temperature must be positive, got {}",
                temperature
            )));
        }
        if self.max_context_tokens > model.backbone_config.max_position_embeddings {
            warn!(
                "⚠️  max_context_tokens {} exceeds the backbone's trained positions ({})",
                self.max_context_tokens, model.backbone_config.max_position_embeddings
            );
        }

        GuidanceConfig::new(self.guidance_weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_config;

    #[test]
    fn test_parse_depths() {
        assert_eq!(parse_depths("3-3-3-3-3-3-8").unwrap(), vec![3, 3, 3, 3, 3, 3, 8]);
        assert!(parse_depths("3-x-3").is_err());
    }

    #[test]
    fn test_decoder_config_reverses_depths() {
        let config = tiny_config();
        let mut tc = config.acoustic_tokenizer_config.clone();
        tc.encoder_depths = "1-1-1-1-1-1-2".to_string();
        let dec = VAEDecoderConfig::from_tokenizer_config(&tc).unwrap();
        assert_eq!(dec.depths, vec![2, 1, 1, 1, 1, 1, 1]);
        assert_eq!(dec.ratios, tc.encoder_ratios);
        assert_eq!(dec.hop_length(), 3200);
        assert_eq!(dec.stage_channels()[0], tc.encoder_n_filters * 64);
    }

    #[test]
    fn test_tiny_config_is_valid() {
        let config = tiny_config();
        config.validate().unwrap();
        assert_eq!(config.hop_length(), 3200);
        assert!((config.frame_rate() - 7.5).abs() < 1e-9);
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let mut config = tiny_config();
        config.diffusion_head_config.latent_size += 1;
        assert!(config.validate().is_err());

        let mut config = tiny_config();
        config.diffusion_head_config.hidden_size *= 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_config_rejects_bad_values() {
        let model = tiny_config();

        let cfg = SessionConfig {
            max_context_tokens: 5000,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(&model), Err(ColloquyError::ConfigError(_))));

        let cfg = SessionConfig {
            max_speakers: 5,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(&model), Err(ColloquyError::ConfigError(_))));

        let cfg = SessionConfig {
            guidance_weight: -0.5,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(&model),
            Err(ColloquyError::DegenerateGuidance(_))
        ));

        let cfg = SessionConfig::default();
        let guidance = cfg.validate(&model).unwrap();
        assert!(guidance.needs_unconditional_pass());
    }

    #[test]
    fn test_session_config_deserializes_with_defaults() {
        let cfg: SessionConfig =
            serde_json::from_str(r#"{"max_context_tokens": 4096, "guidance_weight": 1.0}"#)
                .unwrap();
        assert_eq!(cfg.max_context_tokens, 4096);
        assert_eq!(cfg.sampler_steps, 10);
        assert_eq!(cfg.control_decoding, ControlDecoding::Greedy);
        assert_eq!(cfg.retry.max_attempts, 0);
    }
}
