use anyhow::{Error as AnyErr, Result};
use candle_core::Tensor;
use candle_nn::{Linear, Module, RmsNorm, VarBuilder, linear};
use tracing::info;

/// Projects codec latents into the backbone embedding space: fc1 → RMSNorm → fc2.
///
/// One instance maps acoustic frames (pooled summaries and voice prompts), a
/// second maps semantic latents during voice priming.
/// Input `[batch, seq_len, input_dim]`, output `[batch, seq_len, hidden_size]`.
pub struct SpeechConnector {
    fc1: Linear,
    norm: RmsNorm,
    fc2: Linear,
    input_dim: usize,
    output_dim: usize,
}

impl SpeechConnector {
    pub fn new(vb: VarBuilder, input_dim: usize, output_dim: usize, name: &str) -> Result<Self> {
        info!(
            "🔧 Initializing {} speech connector: {} -> {}",
            name, input_dim, output_dim
        );

        Ok(Self {
            fc1: linear(input_dim, output_dim, vb.pp("fc1"))?,
            norm: candle_nn::rms_norm(output_dim, 1e-6, vb.pp("norm"))?,
            fc2: linear(output_dim, output_dim, vb.pp("fc2"))?,
            input_dim,
            output_dim,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_batch, _seq_len, input_dim) = x.dims3()?;
        if input_dim != self.input_dim {
            return Err(AnyErr::msg(format!(
                "Input dimension mismatch: expected {}, got {}",
                self.input_dim, input_dim
            )));
        }

        let x = self.fc1.forward(x)?;
        let x = self.norm.forward(&x)?;
        Ok(self.fc2.forward(&x)?)
    }
}
