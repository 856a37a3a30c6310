//! Convolutional building blocks shared by the acoustic codec and the semantic encoder.
use anyhow::Result;
use candle_core::{D, DType, Module, Tensor};
use candle_nn::{
    Conv1d, Conv1dConfig, ConvTranspose1d, ConvTranspose1dConfig, Init, Linear, VarBuilder, linear,
};
use tracing::{debug, warn};

use crate::config::{TokenizerConfig, VAEDecoderConfig};
use crate::streaming_cache::StreamingCache;

/// Extra right padding so the last window of a strided conv is complete.
fn get_extra_padding_for_conv1d(
    input_length: usize,
    kernel_size: usize,
    stride: usize,
    padding_total: usize,
) -> usize {
    let n_frames =
        (input_length as f64 - kernel_size as f64 + padding_total as f64) / stride as f64 + 1.0;
    let ideal_length =
        (n_frames.ceil() - 1.0) * stride as f64 + (kernel_size as f64 - padding_total as f64);
    (ideal_length.max(0.0) as usize).saturating_sub(input_length)
}

/// Pad the time axis. `reflect` handles inputs shorter than the pad by zero
/// pre-padding, `replicate` repeats the edge sample, anything else pads zeros.
pub fn pad1d(x: &Tensor, paddings: (usize, usize), mode: &str) -> Result<Tensor> {
    let (padding_left, padding_right) = paddings;
    match mode {
        "reflect" => {
            let length = x.dim(D::Minus1)?;
            let max_pad = padding_left.max(padding_right);
            let mut x = x.clone();
            let mut extra_pad = 0;

            if length <= max_pad {
                extra_pad = max_pad - length + 1;
                x = x.pad_with_zeros(D::Minus1, 0, extra_pad)?;
                debug!(
                    "pad1d: Input length {} <= max_pad {}, adding zero padding of {}",
                    length, max_pad, extra_pad
                );
            }

            let last_dim = x.dims().len() - 1;
            let padded_length = x.dim(D::Minus1)?;
            let mut parts = Vec::with_capacity(3);

            if padding_left > 0 {
                let left_slice = x.narrow(D::Minus1, 1, padding_left)?.contiguous()?;
                let indices: Vec<u32> = (0..padding_left as u32).rev().collect();
                let indices = Tensor::from_vec(indices, (padding_left,), x.device())?;
                parts.push(left_slice.index_select(&indices, last_dim)?.contiguous()?);
            }

            parts.push(x.clone());

            if padding_right > 0 {
                let start = padded_length - padding_right - 1;
                let right_slice = x.narrow(D::Minus1, start, padding_right)?.contiguous()?;
                let indices: Vec<u32> = (0..padding_right as u32).rev().collect();
                let indices = Tensor::from_vec(indices, (padding_right,), x.device())?;
                parts.push(right_slice.index_select(&indices, last_dim)?.contiguous()?);
            }

            let padded = Tensor::cat(&parts, D::Minus1)?.contiguous()?;
            if extra_pad > 0 {
                let end = padded.dim(D::Minus1)? - extra_pad;
                Ok(padded.narrow(D::Minus1, 0, end)?.contiguous()?)
            } else {
                Ok(padded)
            }
        }
        "replicate" => Ok(x.pad_with_same(D::Minus1, padding_left, padding_right)?),
        _ => Ok(x.pad_with_zeros(D::Minus1, padding_left, padding_right)?),
    }
}

/// Remove padding from the time axis
pub fn unpad1d(x: &Tensor, paddings: (usize, usize)) -> Result<Tensor> {
    let (padding_left, padding_right) = paddings;
    let length = x.dim(D::Minus1)?;

    if padding_left + padding_right > length {
        anyhow::bail!(
            "Cannot unpad: padding ({} + {}) > length ({})",
            padding_left,
            padding_right,
            length
        );
    }

    let end = length - padding_right;
    Ok(x.narrow(D::Minus1, padding_left, end - padding_left)?)
}

/// RMSNorm over the channel axis of a `[b, c, t]` tensor
pub struct ConvRMSNorm {
    pub eps: f64,
    pub weight: Option<Tensor>,
}

impl ConvRMSNorm {
    pub fn new(vb: VarBuilder, dim: usize, eps: f64, elementwise_affine: bool) -> Result<Self> {
        let weight = if elementwise_affine {
            Some(vb.get_with_hints(dim, "weight", Init::Const(1.0))?)
        } else {
            None
        };

        Ok(Self { eps, weight })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // b c t -> b t c
        let x_t = x.transpose(1, 2)?;
        let x_f32 = x_t.to_dtype(DType::F32)?;

        let norm = x_f32.sqr()?.mean_keepdim(D::Minus1)?;
        let mut normed = x_f32.broadcast_div(&(norm + self.eps)?.sqrt()?)?;

        if let Some(ref weight) = self.weight {
            normed = normed.broadcast_mul(&weight.to_dtype(DType::F32)?)?;
        }

        let normed = normed.to_dtype(x.dtype())?;
        Ok(normed.transpose(1, 2)?.contiguous()?)
    }
}

/// Conv1d with built-in causal (left) or symmetric padding.
///
/// Weights live under `<prefix>.conv.conv.weight`.
pub struct SConv1d {
    pub conv: Conv1d,
    pub causal: bool,
    pub pad_mode: String,
    pub kernel_size: usize,
    pub dilation: usize,
    pub stride: usize,
    pub padding_total: usize,
}

impl SConv1d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        dilation: usize,
        groups: usize,
        bias: bool,
        causal: bool,
        pad_mode: &str,
    ) -> Result<Self> {
        if stride == 0 || kernel_size * dilation < stride {
            anyhow::bail!(
                "SConv1d needs kernel_size * dilation >= stride > 0 (k={}, d={}, s={})",
                kernel_size,
                dilation,
                stride
            );
        }
        let padding_total = (kernel_size - 1) * dilation - (stride - 1);

        let config = Conv1dConfig {
            padding: 0,
            stride,
            dilation,
            groups,
            cudnn_fwd_algo: None,
        };

        let conv_vb = vb.pp("conv").pp("conv");
        let conv = if bias {
            candle_nn::conv1d(in_channels, out_channels, kernel_size, config, conv_vb)?
        } else {
            candle_nn::conv1d_no_bias(in_channels, out_channels, kernel_size, config, conv_vb)?
        };

        Ok(Self {
            conv,
            causal,
            pad_mode: pad_mode.to_string(),
            kernel_size,
            dilation,
            stride,
            padding_total,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let input_length = x.dim(D::Minus1)?;
        let extra_padding = get_extra_padding_for_conv1d(
            input_length,
            self.kernel_size,
            self.stride,
            self.padding_total,
        );

        let x_padded = if self.causal {
            pad1d(x, (self.padding_total, extra_padding), &self.pad_mode)?
        } else {
            let padding_right = self.padding_total / 2;
            let padding_left = self.padding_total - padding_right;
            pad1d(x, (padding_left, padding_right + extra_padding), &self.pad_mode)?
        };

        Ok(self.conv.forward(&x_padded)?)
    }

    /// Incremental forward. The last `padding_total` input samples are carried
    /// over in `cache` so consecutive chunks see the same left context a single
    /// full-length pass would.
    pub fn forward_with_cache(
        &self,
        x: &Tensor,
        cache: &mut StreamingCache,
        layer_id: &str,
    ) -> Result<Tensor> {
        if !self.causal {
            return self.forward(x);
        }

        let context_size = self.padding_total;
        let (b, c, _) = x.dims3()?;
        let cached_states = match cache.get(layer_id) {
            Some(cached) => cached.clone(),
            None => Tensor::zeros((b, c, context_size), x.dtype(), x.device())?,
        };

        let input_with_context = if cached_states.dim(D::Minus1)? > 0 {
            Tensor::cat(&[&cached_states, x], D::Minus1)?.contiguous()?
        } else {
            x.clone()
        };
        debug!(
            "[CACHE {}] cache {:?} + input {:?}",
            layer_id,
            cached_states.dims(),
            x.dims()
        );

        let output = self.conv.forward(&input_with_context)?;

        if context_size > 0 {
            let total_length = input_with_context.dim(D::Minus1)?;
            let new_cache = if total_length >= context_size {
                input_with_context
                    .narrow(D::Minus1, total_length - context_size, context_size)?
                    .contiguous()?
            } else {
                input_with_context.contiguous()?
            };
            cache.set(layer_id.to_string(), new_cache);
        }

        Ok(output)
    }
}

/// ConvTranspose1d that trims `kernel_size - stride` samples after upsampling.
///
/// Weights live under `<prefix>.convtr.convtr.weight`.
pub struct SConvTranspose1d {
    pub convtr: ConvTranspose1d,
    pub causal: bool,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding_total: usize,
    pub trim_right_ratio: f64,
}

impl SConvTranspose1d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        bias: bool,
        causal: bool,
        trim_right_ratio: f64,
    ) -> Result<Self> {
        if kernel_size < stride {
            anyhow::bail!(
                "SConvTranspose1d kernel {} smaller than stride {}",
                kernel_size,
                stride
            );
        }
        let padding_total = kernel_size - stride;

        let config = ConvTranspose1dConfig {
            padding: 0,
            output_padding: 0,
            stride,
            dilation: 1,
            groups: 1,
        };

        let convtr_vb = vb.pp("convtr").pp("convtr");
        let convtr = if bias {
            candle_nn::conv_transpose1d(in_channels, out_channels, kernel_size, config, convtr_vb)?
        } else {
            candle_nn::conv_transpose1d_no_bias(
                in_channels,
                out_channels,
                kernel_size,
                config,
                convtr_vb,
            )?
        };

        Ok(Self {
            convtr,
            causal,
            kernel_size,
            stride,
            padding_total,
            trim_right_ratio,
        })
    }

    fn paddings(&self) -> (usize, usize) {
        if self.causal {
            let pr = (self.padding_total as f64 * self.trim_right_ratio).ceil() as usize;
            (self.padding_total - pr, pr)
        } else {
            let pr = self.padding_total / 2;
            (self.padding_total - pr, pr)
        }
    }

    /// Full-length forward: `t` frames in, `t * stride` samples out.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = self.convtr.forward(x)?;
        let (padding_left, padding_right) = self.paddings();
        if padding_left + padding_right > 0 {
            unpad1d(&y, (padding_left, padding_right))
        } else {
            Ok(y)
        }
    }

    /// Incremental forward. The first chunk returns everything; later chunks
    /// return only the `t * stride` samples their new inputs produced.
    pub fn forward_with_cache(
        &self,
        x: &Tensor,
        cache: &mut StreamingCache,
        layer_id: &str,
    ) -> Result<Tensor> {
        let t = x.dim(D::Minus1)?;

        // Transposed convs start from an empty history, not a zero-filled one
        let cached_input = cache.get(layer_id).cloned();
        let is_first_chunk = cached_input
            .as_ref()
            .map(|c| c.dim(D::Minus1))
            .transpose()?
            .is_none_or(|len| len == 0);

        let full_input = match cached_input {
            Some(cached) if !is_first_chunk => Tensor::cat(&[&cached, x], D::Minus1)?.contiguous()?,
            _ => x.clone(),
        };

        let full_output = self.forward(&full_input)?;

        let output = if is_first_chunk {
            full_output
        } else {
            let expected_new_output = t * self.stride;
            let output_len = full_output.dim(D::Minus1)?;
            if output_len >= expected_new_output {
                full_output.narrow(
                    D::Minus1,
                    output_len - expected_new_output,
                    expected_new_output,
                )?
            } else {
                warn!(
                    "[CACHE {}] Output shorter than expected: {} < {}",
                    layer_id, output_len, expected_new_output
                );
                full_output
            }
        };

        let context_size = self.kernel_size - 1;
        let full_input_len = full_input.dim(D::Minus1)?;
        let new_cache = if full_input_len > context_size {
            full_input
                .narrow(D::Minus1, full_input_len - context_size, context_size)?
                .contiguous()?
        } else {
            full_input.contiguous()?
        };
        cache.set(layer_id.to_string(), new_cache);

        Ok(output)
    }
}

/// Position-wise feed-forward with exact (erf) GELU
pub struct FFN {
    pub linear1: Linear,
    pub linear2: Linear,
}

impl FFN {
    pub fn new(vb: VarBuilder, embed_dim: usize, ffn_dim: usize) -> Result<Self> {
        Ok(Self {
            linear1: linear(embed_dim, ffn_dim, vb.pp("linear1"))?,
            linear2: linear(ffn_dim, embed_dim, vb.pp("linear2"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.linear1.forward(x)?.gelu_erf()?;
        Ok(self.linear2.forward(&x)?)
    }
}

/// Hyper-parameters shared by every [`Block1D`] of one encoder or decoder
#[derive(Debug, Clone)]
pub struct BlockParams {
    pub kernel_size: usize,
    pub causal: bool,
    pub pad_mode: String,
    pub layernorm_eps: f64,
    pub layer_scale_init_value: f64,
    pub ffn_expansion: usize,
    pub depthwise: bool,
}

impl BlockParams {
    pub fn from_tokenizer_config(tc: &TokenizerConfig) -> Self {
        Self {
            kernel_size: 7,
            causal: tc.causal,
            pad_mode: tc.pad_mode.clone(),
            layernorm_eps: tc.layernorm_eps,
            layer_scale_init_value: tc.layer_scale_init_value,
            ffn_expansion: 4,
            depthwise: tc.mixer_layer == "depthwise_conv",
        }
    }

    pub fn from_decoder_config(dc: &VAEDecoderConfig) -> Self {
        Self {
            kernel_size: dc.kernel_size,
            causal: dc.causal,
            pad_mode: dc.pad_mode.clone(),
            layernorm_eps: dc.layernorm_eps,
            layer_scale_init_value: dc.layer_scale_init_value,
            ffn_expansion: dc.ffn_expansion,
            depthwise: dc.mixer_layer == "depthwise_conv",
        }
    }
}

/// Conv-mixer block: norm → mixer conv → γ residual, then norm → FFN → γ residual
pub struct Block1D {
    pub norm: ConvRMSNorm,
    pub mixer: SConv1d,
    pub gamma: Option<Tensor>,
    pub ffn_norm: ConvRMSNorm,
    pub ffn: FFN,
    pub ffn_gamma: Option<Tensor>,
}

impl Block1D {
    pub fn new(vb: VarBuilder, dim: usize, params: &BlockParams) -> Result<Self> {
        let norm = ConvRMSNorm::new(vb.pp("norm"), dim, params.layernorm_eps, true)?;
        let ffn_norm = ConvRMSNorm::new(vb.pp("ffn_norm"), dim, params.layernorm_eps, true)?;

        // stages.X.Y.mixer.conv.conv.conv.weight
        let mixer = SConv1d::new(
            vb.pp("mixer").pp("conv"),
            dim,
            dim,
            params.kernel_size,
            1,
            1,
            if params.depthwise { dim } else { 1 },
            true,
            params.causal,
            &params.pad_mode,
        )?;

        let ffn = FFN::new(vb.pp("ffn"), dim, params.ffn_expansion * dim)?;

        let (gamma, ffn_gamma) = if params.layer_scale_init_value > 0.0 {
            let init = Init::Const(params.layer_scale_init_value);
            (
                Some(vb.get_with_hints(dim, "gamma", init)?),
                Some(vb.get_with_hints(dim, "ffn_gamma", init)?),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            norm,
            mixer,
            gamma,
            ffn_norm,
            ffn,
            ffn_gamma,
        })
    }

    fn scale(x: Tensor, gamma: Option<&Tensor>) -> Result<Tensor> {
        match gamma {
            Some(g) => Ok(x.broadcast_mul(&g.reshape((1, g.dims()[0], 1))?)?),
            None => Ok(x),
        }
    }

    fn ffn_residual(&self, x: Tensor) -> Result<Tensor> {
        let h = self.ffn_norm.forward(&x)?;
        // FFN runs channels-last
        let h = h.transpose(1, 2)?.contiguous()?;
        let h = self.ffn.forward(&h)?;
        let h = h.transpose(1, 2)?.contiguous()?;
        let h = Self::scale(h, self.ffn_gamma.as_ref())?;
        Ok((x + h)?)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.mixer.forward(&self.norm.forward(x)?)?;
        let h = Self::scale(h, self.gamma.as_ref())?;
        self.ffn_residual((x + h)?)
    }

    /// Like [`Block1D::forward`], with the mixer conv carrying causal context in `cache`
    pub fn forward_with_cache(
        &self,
        x: &Tensor,
        cache: &mut StreamingCache,
        layer_id: &str,
    ) -> Result<Tensor> {
        let h = self
            .mixer
            .forward_with_cache(&self.norm.forward(x)?, cache, layer_id)?;
        let h = Self::scale(h, self.gamma.as_ref())?;
        self.ffn_residual((x + h)?)
    }
}

/// A run of [`Block1D`]s at one channel width (`stages.{i}.{j}`)
pub struct VAEStage {
    blocks: Vec<Block1D>,
}

impl VAEStage {
    pub fn new(vb: VarBuilder, dim: usize, num_blocks: usize, params: &BlockParams) -> Result<Self> {
        let blocks = (0..num_blocks)
            .map(|j| Block1D::new(vb.pp(j.to_string()), dim, params))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { blocks })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        Ok(x)
    }

    pub fn forward_with_cache(
        &self,
        x: &Tensor,
        cache: &mut StreamingCache,
        stage_id: &str,
    ) -> Result<Tensor> {
        let mut x = x.clone();
        for (i, block) in self.blocks.iter().enumerate() {
            x = block.forward_with_cache(&x, cache, &format!("{}.block{}", stage_id, i))?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn vb(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_extra_padding_aligns_stride() {
        // k=4, s=2, padding_total=2 over 5 samples needs one extra sample
        assert_eq!(get_extra_padding_for_conv1d(5, 4, 2, 2), 1);
        assert_eq!(get_extra_padding_for_conv1d(6, 4, 2, 2), 0);
        assert_eq!(get_extra_padding_for_conv1d(10, 7, 1, 6), 0);
    }

    #[test]
    fn test_pad1d_reflect_short_input() {
        let x = Tensor::new(&[[[1f32, 2.0]]], &Device::Cpu).unwrap();
        let y = pad1d(&x, (3, 0), "reflect").unwrap();
        assert_eq!(y.dims(), &[1, 1, 5]);

        let x = Tensor::new(&[[[1f32, 2.0, 3.0, 4.0]]], &Device::Cpu).unwrap();
        let y = pad1d(&x, (2, 1), "reflect").unwrap();
        assert_eq!(
            y.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0]
        );
    }

    #[test]
    fn test_unpad1d_rejects_oversized_padding() {
        let x = Tensor::zeros((1, 1, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(unpad1d(&x, (2, 2)).is_err());
        assert_eq!(unpad1d(&x, (1, 1)).unwrap().dims(), &[1, 1, 1]);
    }

    #[test]
    fn test_sconv1d_downsample_length() {
        let varmap = VarMap::new();
        let conv = SConv1d::new(vb(&varmap), 1, 4, 8, 4, 1, 1, true, true, "constant").unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 1, 17), &Device::Cpu).unwrap();
        // ceil(17 / 4)
        assert_eq!(conv.forward(&x).unwrap().dims(), &[1, 4, 5]);
    }

    #[test]
    fn test_conv_transpose_upsamples_exactly() {
        let varmap = VarMap::new();
        let convtr = SConvTranspose1d::new(vb(&varmap), 4, 2, 10, 5, true, true, 1.0).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 4, 3), &Device::Cpu).unwrap();
        assert_eq!(convtr.forward(&x).unwrap().dims(), &[1, 2, 15]);
    }

    #[test]
    fn test_streaming_conv_matches_full_pass() {
        let varmap = VarMap::new();
        let conv = SConv1d::new(vb(&varmap), 3, 3, 7, 1, 1, 3, true, true, "constant").unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 3, 12), &Device::Cpu).unwrap();
        let full = conv.forward(&x).unwrap();

        let mut cache = StreamingCache::new(Device::Cpu);
        let a = conv
            .forward_with_cache(&x.narrow(2, 0, 5).unwrap(), &mut cache, "c")
            .unwrap();
        let b = conv
            .forward_with_cache(&x.narrow(2, 5, 7).unwrap(), &mut cache, "c")
            .unwrap();
        let streamed = Tensor::cat(&[a, b], 2).unwrap();

        let diff = (full - streamed)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5, "streamed output diverged by {}", diff);
    }

    #[test]
    fn test_block_initializes_layer_scale() {
        let varmap = VarMap::new();
        let params = BlockParams {
            kernel_size: 7,
            causal: true,
            pad_mode: "constant".to_string(),
            layernorm_eps: 1e-5,
            layer_scale_init_value: 1e-6,
            ffn_expansion: 4,
            depthwise: true,
        };
        let block = Block1D::new(vb(&varmap), 8, &params).unwrap();
        let gamma = block.gamma.as_ref().unwrap().to_vec1::<f32>().unwrap();
        assert!(gamma.iter().all(|&g| (g - 1e-6).abs() < 1e-12));

        // With a tiny layer scale the block is close to identity
        let x = Tensor::randn(0f32, 1.0, (1, 8, 6), &Device::Cpu).unwrap();
        let y = block.forward(&x).unwrap();
        let diff = (y - &x).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-2);
    }
}
