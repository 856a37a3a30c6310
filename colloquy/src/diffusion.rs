use crate::{config::DiffusionHeadConfig, utils::timestep_embedding};
use anyhow::Result;
use candle_core::{D, DType, Tensor};
use candle_nn::{Linear, Module, RmsNorm, VarBuilder, linear_no_bias, rms_norm};
use tracing::info;

/// Sinusoidal width fed to the timestep MLP
const FREQUENCY_EMBEDDING_SIZE: usize = 256;

/// One denoiser evaluation: `(noisy latents, timesteps, conditions) → v-prediction`.
///
/// Rows are independent, so conditional and unconditional inputs can share a
/// single call. The sampler only talks to this trait.
pub trait Denoiser {
    fn latent_dim(&self) -> usize;

    /// `noisy` `[batch, latent]`, `timesteps` `[batch]`, `condition` `[batch, cond]`
    fn denoise(&self, noisy: &Tensor, timesteps: &Tensor, condition: &Tensor) -> Result<Tensor>;
}

/// SwiGLU activation (used in feed-forward networks)
struct SwiGLU {
    w1: Linear,
    w2: Linear,
    w3: Linear,
}

impl SwiGLU {
    fn new(vb: VarBuilder, hidden_size: usize, intermediate_size: usize) -> Result<Self> {
        Ok(Self {
            w1: linear_no_bias(hidden_size, intermediate_size, vb.pp("gate_proj"))?,
            w2: linear_no_bias(hidden_size, intermediate_size, vb.pp("up_proj"))?,
            w3: linear_no_bias(intermediate_size, hidden_size, vb.pp("down_proj"))?,
        })
    }
}

impl Module for SwiGLU {
    fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
        let swish = candle_nn::ops::silu(&self.w1.forward(x)?)?;
        let up = self.w2.forward(x)?;
        self.w3.forward(&(swish * up)?)
    }
}

/// `x + gate · ffn(norm(x) · (1 + scale) + shift)`, modulation from `silu(c)`
struct DiffusionLayer {
    norm: RmsNorm,
    ada_ln_modulation: Linear,
    ffn: SwiGLU,
}

impl DiffusionLayer {
    fn new(vb: VarBuilder, hidden_size: usize, ffn_size: usize, eps: f64) -> Result<Self> {
        Ok(Self {
            norm: rms_norm(hidden_size, eps, vb.pp("norm"))?,
            ada_ln_modulation: linear_no_bias(
                hidden_size,
                3 * hidden_size,
                vb.pp("adaLN_modulation.1"),
            )?,
            ffn: SwiGLU::new(vb.pp("ffn"), hidden_size, ffn_size)?,
        })
    }

    fn forward(&self, x: &Tensor, c: &Tensor) -> Result<Tensor> {
        let modulation = self
            .ada_ln_modulation
            .forward(&candle_nn::ops::silu(c)?)?;
        let chunks = modulation.chunk(3, D::Minus1)?;
        let (shift, scale, gate) = (&chunks[0], &chunks[1], &chunks[2]);

        let modulated = self
            .norm
            .forward(x)?
            .broadcast_mul(&(scale + 1.0)?)?
            .broadcast_add(shift)?;
        let gated = self.ffn.forward(&modulated)?.broadcast_mul(gate)?;
        Ok((x + gated)?)
    }
}

/// RMSNorm without learnable weights
struct RmsNormNoWeight {
    eps: f64,
}

impl RmsNormNoWeight {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_f32 = x.to_dtype(DType::F32)?;
        let norm = x_f32.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = x_f32.broadcast_div(&(norm + self.eps)?.sqrt()?)?;
        Ok(normed.to_dtype(x.dtype())?)
    }
}

struct FinalLayer {
    norm_final: RmsNormNoWeight,
    ada_ln_modulation: Linear,
    linear: Linear,
}

impl FinalLayer {
    fn new(
        vb: VarBuilder,
        hidden_size: usize,
        output_size: usize,
        cond_size: usize,
        eps: f64,
    ) -> Result<Self> {
        Ok(Self {
            norm_final: RmsNormNoWeight { eps },
            ada_ln_modulation: linear_no_bias(
                cond_size,
                2 * hidden_size,
                vb.pp("adaLN_modulation.1"),
            )?,
            linear: linear_no_bias(hidden_size, output_size, vb.pp("linear"))?,
        })
    }

    fn forward(&self, x: &Tensor, c: &Tensor) -> Result<Tensor> {
        let modulation = self
            .ada_ln_modulation
            .forward(&candle_nn::ops::silu(c)?)?;
        let chunks = modulation.chunk(2, D::Minus1)?;
        let (shift, scale) = (&chunks[0], &chunks[1]);

        let x = self
            .norm_final
            .forward(x)?
            .broadcast_mul(&(scale + 1.0)?)?
            .broadcast_add(shift)?;
        Ok(self.linear.forward(&x)?)
    }
}

/// adaLN-modulated MLP denoiser (`prediction_head.*`)
pub struct DiffusionHead {
    noisy_images_proj: Linear,
    cond_proj: Linear,
    t_embedder_mlp: [Linear; 2],
    layers: Vec<DiffusionLayer>,
    final_layer: FinalLayer,
    latent_size: usize,
}

impl DiffusionHead {
    /// `cond_dim` is the backbone hidden size feeding `h_t`.
    pub fn new(vb: VarBuilder, config: &DiffusionHeadConfig, cond_dim: usize) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let latent_size = config.latent_size;
        let ffn_size = (hidden_size as f64 * config.head_ffn_ratio).round() as usize;
        let eps = config.rms_norm_eps;

        info!("\n🔧 Initializing Diffusion Head:");
        info!("   Layers: {}", config.head_layers);
        info!("   Hidden size: {}", hidden_size);
        info!("   Latent size: {}", latent_size);

        let noisy_images_proj =
            linear_no_bias(latent_size, hidden_size, vb.pp("noisy_images_proj"))?;
        let cond_proj = linear_no_bias(cond_dim, hidden_size, vb.pp("cond_proj"))?;
        let t_embedder_mlp = [
            linear_no_bias(
                FREQUENCY_EMBEDDING_SIZE,
                hidden_size,
                vb.pp("t_embedder.mlp.0"),
            )?,
            linear_no_bias(hidden_size, hidden_size, vb.pp("t_embedder.mlp.2"))?,
        ];
        let layers = (0..config.head_layers)
            .map(|i| DiffusionLayer::new(vb.pp(format!("layers.{}", i)), hidden_size, ffn_size, eps))
            .collect::<Result<Vec<_>>>()?;
        let final_layer = FinalLayer::new(
            vb.pp("final_layer"),
            hidden_size,
            latent_size,
            hidden_size,
            eps,
        )?;

        Ok(Self {
            noisy_images_proj,
            cond_proj,
            t_embedder_mlp,
            layers,
            final_layer,
            latent_size,
        })
    }

    pub fn forward(
        &self,
        noisy_images: &Tensor,
        timesteps: &Tensor,
        condition: &Tensor,
    ) -> Result<Tensor> {
        let mut x = self.noisy_images_proj.forward(noisy_images)?;

        let t_freq = timestep_embedding(timesteps, FREQUENCY_EMBEDDING_SIZE)?;
        let t_emb = candle_nn::ops::silu(&self.t_embedder_mlp[0].forward(&t_freq)?)?;
        let t_emb = self.t_embedder_mlp[1].forward(&t_emb)?;

        let c = (self.cond_proj.forward(condition)? + t_emb)?;
        for layer in &self.layers {
            x = layer.forward(&x, &c)?;
        }
        self.final_layer.forward(&x, &c)
    }
}

impl Denoiser for DiffusionHead {
    fn latent_dim(&self) -> usize {
        self.latent_size
    }

    fn denoise(&self, noisy: &Tensor, timesteps: &Tensor, condition: &Tensor) -> Result<Tensor> {
        self.forward(noisy, timesteps, condition)
    }
}
