use anyhow::Result;
use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::{debug, info};

use crate::config::TokenizerConfig;
use crate::vae_layers::{BlockParams, ConvRMSNorm, SConv1d, VAEStage};

/// Convolutional encoder (audio → latents), shared by the acoustic codec and
/// the semantic encoder.
pub struct VAEEncoder {
    downsample_layers: Vec<SConv1d>,
    stages: Vec<VAEStage>,
    norm: Option<ConvRMSNorm>,
    head: SConv1d,
    hop_length: usize,
}

impl VAEEncoder {
    pub fn new(vb: VarBuilder, config: &TokenizerConfig, name: &str) -> Result<Self> {
        info!("🔧 Initializing {} VAE encoder...", name);

        let depths = config.depths()?;
        let num_stages = depths.len();
        // Downsampling runs the ratios back to front
        let ratios: Vec<usize> = config.encoder_ratios.iter().rev().cloned().collect();
        debug!("  Encoder depths: {:?}", depths);
        debug!("  Encoder ratios (reversed): {:?}", ratios);

        let channels_at = |i: usize| config.encoder_n_filters * 2_usize.pow(i as u32);

        let mut downsample_layers = Vec::with_capacity(num_stages);
        downsample_layers.push(SConv1d::new(
            vb.pp("downsample_layers.0.0"),
            config.channels,
            config.encoder_n_filters,
            7,
            1,
            1,
            1,
            config.conv_bias,
            config.causal,
            &config.pad_mode,
        )?);

        for (i, &ratio) in ratios.iter().enumerate() {
            downsample_layers.push(SConv1d::new(
                vb.pp(format!("downsample_layers.{}.0", i + 1)),
                channels_at(i),
                channels_at(i + 1),
                ratio * 2,
                ratio,
                1,
                1,
                config.conv_bias,
                config.causal,
                &config.pad_mode,
            )?);
        }

        let params = BlockParams::from_tokenizer_config(config);
        let stages = depths
            .iter()
            .enumerate()
            .map(|(i, &num_blocks)| {
                VAEStage::new(vb.pp(format!("stages.{}", i)), channels_at(i), num_blocks, &params)
            })
            .collect::<Result<Vec<_>>>()?;

        let head_channels = channels_at(num_stages - 1);
        let norm = if !config.disable_last_norm {
            Some(ConvRMSNorm::new(
                vb.pp("norm"),
                head_channels,
                config.layernorm_eps,
                true,
            )?)
        } else {
            None
        };

        let head = SConv1d::new(
            vb.pp("head"),
            head_channels,
            config.vae_dim,
            7,
            1,
            1,
            1,
            config.conv_bias,
            config.causal,
            &config.pad_mode,
        )?;

        Ok(Self {
            downsample_layers,
            stages,
            norm,
            head,
            hop_length: config.hop_length(),
        })
    }

    /// Input: audio `[batch, 1, samples]`. Output: `[batch, vae_dim, ceil(samples / hop)]`.
    pub fn encode(&self, audio: &Tensor) -> Result<Tensor> {
        let mut x = audio.clone();
        for (i, (down, stage)) in self.downsample_layers.iter().zip(&self.stages).enumerate() {
            x = down.forward(&x)?;
            x = stage.forward(&x)?;
            debug!("  After stage_{}: {:?}", i, x.dims());
        }

        if let Some(ref norm) = self.norm {
            x = norm.forward(&x)?;
        }

        let latents = self.head.forward(&x)?;
        debug!(
            "  Encoded {:?} -> {:?} (hop {})",
            audio.dims(),
            latents.dims(),
            self.hop_length
        );
        Ok(latents)
    }

    pub fn hop_length(&self) -> usize {
        self.hop_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_config;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_encoder_compresses_by_hop_length() {
        let config = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = VAEEncoder::new(vb, &config.semantic_tokenizer_config, "semantic").unwrap();

        let audio = Tensor::randn(0f32, 0.1, (1, 1, 3200 * 2 + 17), &Device::Cpu).unwrap();
        let latents = encoder.encode(&audio).unwrap();
        assert_eq!(
            latents.dims(),
            &[1, config.semantic_tokenizer_config.vae_dim, 3]
        );
    }
}
