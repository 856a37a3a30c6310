use anyhow::Result;
use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::{debug, info};

use crate::config::VAEDecoderConfig;
use crate::streaming_cache::StreamingCache;
use crate::vae_layers::{BlockParams, ConvRMSNorm, SConv1d, SConvTranspose1d, VAEStage};

/// `upsample_layers.{i}.0`: a stem conv followed by transposed-conv upsamplers
enum UpsampleLayer {
    Stem(SConv1d),
    Upsample(SConvTranspose1d),
}

impl UpsampleLayer {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            UpsampleLayer::Stem(conv) => conv.forward(x),
            UpsampleLayer::Upsample(convtr) => convtr.forward(x),
        }
    }

    fn forward_with_cache(
        &self,
        x: &Tensor,
        cache: &mut StreamingCache,
        layer_id: &str,
    ) -> Result<Tensor> {
        match self {
            UpsampleLayer::Stem(conv) => conv.forward_with_cache(x, cache, layer_id),
            UpsampleLayer::Upsample(convtr) => convtr.forward_with_cache(x, cache, layer_id),
        }
    }
}

/// Mirror of [`crate::vae_encoder::VAEEncoder`]: latents `[b, vae_dim, t]` to audio `[b, 1, t * hop]`
pub struct VAEDecoder {
    config: VAEDecoderConfig,
    upsample_layers: Vec<UpsampleLayer>,
    stages: Vec<VAEStage>,
    norm: Option<ConvRMSNorm>,
    head: SConv1d,
}

impl VAEDecoder {
    pub fn new(vb: VarBuilder, config: VAEDecoderConfig) -> Result<Self> {
        info!("🔧 Initializing VAE decoder...");
        debug!(
            "  Config: depths={:?}, ratios={:?}",
            config.depths, config.ratios
        );

        let channels = config.stage_channels();
        let num_stages = channels.len();
        let mut upsample_layers = Vec::with_capacity(num_stages);

        upsample_layers.push(UpsampleLayer::Stem(SConv1d::new(
            vb.pp("upsample_layers.0.0"),
            config.vae_dim,
            channels[0],
            config.kernel_size,
            1,
            1,
            1,
            config.conv_bias,
            config.causal,
            &config.pad_mode,
        )?));

        for i in 1..num_stages {
            let ratio = config.ratios[i - 1];
            debug!(
                "  Stage {}: Upsample {} -> {} (ratio={})",
                i,
                channels[i - 1],
                channels[i],
                ratio
            );
            upsample_layers.push(UpsampleLayer::Upsample(SConvTranspose1d::new(
                vb.pp(format!("upsample_layers.{}.0", i)),
                channels[i - 1],
                channels[i],
                ratio * 2,
                ratio,
                config.conv_bias,
                config.causal,
                config.trim_right_ratio,
            )?));
        }

        let params = BlockParams::from_decoder_config(&config);
        let stages = channels
            .iter()
            .zip(&config.depths)
            .enumerate()
            .map(|(i, (&ch, &depth))| VAEStage::new(vb.pp(format!("stages.{}", i)), ch, depth, &params))
            .collect::<Result<Vec<_>>>()?;

        let final_channels = channels[num_stages - 1];
        let norm = if !config.disable_last_norm {
            Some(ConvRMSNorm::new(
                vb.pp("norm"),
                final_channels,
                config.layernorm_eps,
                config.layernorm_elementwise_affine,
            )?)
        } else {
            None
        };

        let head = SConv1d::new(
            vb.pp("head"),
            final_channels,
            config.channels,
            config.last_kernel_size,
            1,
            1,
            1,
            config.conv_bias,
            config.causal,
            &config.pad_mode,
        )?;

        info!("✓ VAE decoder initialized ({} stages)", num_stages);

        Ok(Self {
            config,
            upsample_layers,
            stages,
            norm,
            head,
        })
    }

    pub fn decode(&self, x: &Tensor) -> Result<Tensor> {
        debug!("🔍 VAE decode: input {:?}", x.dims());
        let mut x = x.clone();
        for (up, stage) in self.upsample_layers.iter().zip(&self.stages) {
            x = up.forward(&x)?;
            x = stage.forward(&x)?;
        }
        if let Some(ref norm) = self.norm {
            x = norm.forward(&x)?;
        }
        let audio = self.head.forward(&x)?.tanh()?;
        debug!("🔍 VAE decode: output {:?}", audio.dims());
        Ok(audio)
    }

    /// Chunked decode. Feeding a sequence in consecutive pieces through the same
    /// cache yields the same samples as one [`VAEDecoder::decode`] call.
    pub fn decode_with_cache(&self, x: &Tensor, cache: &mut StreamingCache) -> Result<Tensor> {
        let frames = x.dim(2)?;
        let mut x = x.clone();
        for (i, (up, stage)) in self.upsample_layers.iter().zip(&self.stages).enumerate() {
            x = up.forward_with_cache(&x, cache, &format!("upsample_{}", i))?;
            x = stage.forward_with_cache(&x, cache, &format!("stage_{}", i))?;
        }
        if let Some(ref norm) = self.norm {
            x = norm.forward(&x)?;
        }
        let audio = self.head.forward_with_cache(&x, cache, "head")?.tanh()?;
        cache.advance(frames);
        debug!(
            "🔍 VAE chunk decode: {} frames -> {:?} ({} total)",
            frames,
            audio.dims(),
            cache.frames_decoded()
        );
        Ok(audio)
    }

    pub fn hop_length(&self) -> usize {
        self.config.hop_length()
    }

    pub fn vae_dim(&self) -> usize {
        self.config.vae_dim
    }
}
