use anyhow::Result;
use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::info;

use crate::config::ModelConfig;
use crate::vae_encoder::VAEEncoder;

/// Encoder-only mirror of the acoustic codec encoder, with no variational step.
/// Only consulted when priming a speaker's voice prompt.
pub struct SemanticEncoder {
    encoder: VAEEncoder,
    vae_dim: usize,
}

impl SemanticEncoder {
    /// `vb` points at `semantic_tokenizer.encoder`.
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let cfg = &config.semantic_tokenizer_config;
        info!(
            "🔧 Initializing semantic encoder (vae_dim={}, ratios={:?}, depths={})",
            cfg.vae_dim, cfg.encoder_ratios, cfg.encoder_depths
        );

        Ok(Self {
            encoder: VAEEncoder::new(vb, cfg, "semantic")?,
            vae_dim: cfg.vae_dim,
        })
    }

    pub fn vae_dim(&self) -> usize {
        self.vae_dim
    }

    /// Audio `[batch, 1, samples]` → semantic latents `[batch, frames, vae_dim]`
    pub fn encode(&self, audio: &Tensor) -> Result<Tensor> {
        let latents = self.encoder.encode(audio)?;
        Ok(latents.transpose(1, 2)?.contiguous()?)
    }
}
