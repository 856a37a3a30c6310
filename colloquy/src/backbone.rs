//! Causal transformer backbone.
//!
//! A Qwen2-style decoder (RoPE, grouped-query attention, SwiGLU MLP, RMSNorm)
//! over a single interleaved context of text tokens, speaker embeddings and
//! pooled acoustic summaries. Everything enters as embeddings; the backbone
//! never sees audio directly.
//!
//! Context is advanced two ways:
//! - [`Backbone::commit`] runs new positions and appends their keys/values to
//!   the per-session [`BackboneCache`].
//! - [`Backbone::speculate`] runs one position against the cache without
//!   storing it, used for the partially filled summary window.

use anyhow::{Error as AnyErr, Result};
use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{
    Embedding, Linear, RmsNorm, VarBuilder, embedding, linear, linear_no_bias, rms_norm,
};
use tracing::info;

use crate::config::BackboneConfig;

/// Rotary position embedding, evaluated for the requested positions only so
/// the context can run to any configured length.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    inv_freq: Vec<f32>,
    device: Device,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, theta: f64, device: &Device) -> Self {
        let inv_freq = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / (theta as f32).powf(i as f32 / head_dim as f32))
            .collect();
        Self {
            inv_freq,
            device: device.clone(),
        }
    }

    /// `(cos, sin)`, each `[seq_len, head_dim / 2]`
    fn tables(&self, offset: usize, seq_len: usize) -> Result<(Tensor, Tensor)> {
        let half = self.inv_freq.len();
        let mut freqs = Vec::with_capacity(seq_len * half);
        for pos in offset..offset + seq_len {
            freqs.extend(self.inv_freq.iter().map(|f| pos as f32 * f));
        }
        let freqs = Tensor::from_vec(freqs, (seq_len, half), &self.device)?;
        Ok((freqs.cos()?, freqs.sin()?))
    }

    pub fn apply(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let (cos, sin) = self.tables(offset, seq_len)?;
        let cos = cos.to_dtype(q.dtype())?;
        let sin = sin.to_dtype(q.dtype())?;
        Ok((rotate(q, &cos, &sin)?, rotate(k, &cos, &sin)?))
    }
}

fn rotate(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let d = x.dim(D::Minus1)?;
    let x1 = x.narrow(D::Minus1, 0, d / 2)?;
    let x2 = x.narrow(D::Minus1, d / 2, d / 2)?;

    let cos = cos.unsqueeze(0)?.unsqueeze(0)?;
    let sin = sin.unsqueeze(0)?.unsqueeze(0)?;

    let rotated = Tensor::cat(
        &[
            &(x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?,
            &(x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?,
        ],
        D::Minus1,
    )?;
    Ok(rotated)
}

/// Per-layer key/value history, `[batch, kv_heads, positions, head_dim]`.
#[derive(Debug, Clone, Default)]
pub struct KVCache {
    k: Option<Tensor>,
    v: Option<Tensor>,
}

impl KVCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached history followed by `k`/`v`, without storing them.
    fn extended(&self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        match (&self.k, &self.v) {
            (Some(pk), Some(pv)) => Ok((Tensor::cat(&[pk, k], 2)?, Tensor::cat(&[pv, v], 2)?)),
            _ => Ok((k.clone(), v.clone())),
        }
    }

    fn store(&mut self, k: Tensor, v: Tensor) {
        self.k = Some(k);
        self.v = Some(v);
    }

    pub fn len(&self) -> usize {
        self.k.as_ref().and_then(|k| k.dim(2).ok()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&mut self) {
        self.k = None;
        self.v = None;
    }
}

/// Multi-head attention with grouped-query attention support
pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    pub fn new(config: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_key_value_heads;
        let head_dim = config.head_dim();

        Ok(Self {
            q_proj: linear(hidden_size, num_heads * head_dim, vb.pp("q_proj"))?,
            k_proj: linear(hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?,
            v_proj: linear(hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(num_heads * head_dim, hidden_size, vb.pp("o_proj"))?,
            num_heads,
            num_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// Returns the attention output together with the full key/value history
    /// including the new positions; the caller decides whether to keep it.
    fn forward(
        &self,
        hidden_states: &Tensor,
        rope: &RotaryEmbedding,
        attention_mask: Option<&Tensor>,
        cache: &KVCache,
        offset: usize,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let (batch, seq_len, _) = hidden_states.dims3()?;

        let q = self.q_proj.forward(hidden_states)?;
        let k = self.k_proj.forward(hidden_states)?;
        let v = self.v_proj.forward(hidden_states)?;

        // [batch, heads, seq, head_dim]
        let q = q
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = rope.apply(&q, &k, offset)?;
        let (k_all, v_all) = cache.extended(&k, &v)?;

        let k = self.repeat_kv(&k_all)?;
        let v = self.repeat_kv(&v_all)?;

        let attn_weights = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?
            * self.scale)?;
        let attn_weights = match attention_mask {
            Some(mask) => attn_weights.broadcast_add(mask)?,
            None => attn_weights,
        };
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;

        Ok((self.o_proj.forward(&attn_output)?, k_all, v_all))
    }

    fn repeat_kv(&self, x: &Tensor) -> Result<Tensor> {
        let n_rep = self.num_heads / self.num_kv_heads;
        if n_rep == 1 {
            return Ok(x.clone());
        }

        let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;
        Ok(x.unsqueeze(2)?
            .expand((batch, num_kv_heads, n_rep, seq_len, head_dim))?
            .reshape((batch, num_kv_heads * n_rep, seq_len, head_dim))?)
    }
}

/// MLP block with SwiGLU activation
pub struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    pub fn new(config: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let intermediate_size = config.intermediate_size;

        Ok(Self {
            gate_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(intermediate_size, hidden_size, vb.pp("down_proj"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

pub struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    pub fn new(config: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(config, vb.pp("self_attn"))?,
            mlp: Mlp::new(config, vb.pp("mlp"))?,
            input_layernorm: rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(
        &self,
        hidden_states: &Tensor,
        rope: &RotaryEmbedding,
        attention_mask: Option<&Tensor>,
        cache: &KVCache,
        offset: usize,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let residual = hidden_states;
        let normed = self.input_layernorm.forward(hidden_states)?;
        let (attn, k, v) = self
            .self_attn
            .forward(&normed, rope, attention_mask, cache, offset)?;
        let hidden_states = (residual + attn)?;

        let residual = &hidden_states;
        let normed = self.post_attention_layernorm.forward(&hidden_states)?;
        let hidden_states = (residual + self.mlp.forward(&normed)?)?;

        Ok((hidden_states, k, v))
    }
}

/// Additive causal mask `[1, 1, seq_len, offset + seq_len]`.
pub fn create_causal_mask(
    seq_len: usize,
    offset: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let total = offset + seq_len;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total).map(move |j| {
                if j <= i + offset {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (1, 1, seq_len, total), device)?.to_dtype(dtype)?)
}

/// Per-session backbone state: one [`KVCache`] per layer, the number of
/// committed positions and the hidden state of the last committed position.
#[derive(Debug, Clone)]
pub struct BackboneCache {
    layers: Vec<KVCache>,
    position: usize,
    last_hidden: Option<Tensor>,
}

impl BackboneCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![KVCache::new(); num_layers],
            position: 0,
            last_hidden: None,
        }
    }

    /// Committed context positions.
    pub fn position(&self) -> usize {
        self.position
    }

    /// `[1, hidden]` output at the last committed position.
    pub fn last_hidden(&self) -> Option<&Tensor> {
        self.last_hidden.as_ref()
    }

    pub fn reset(&mut self) {
        self.layers.iter_mut().for_each(KVCache::reset);
        self.position = 0;
        self.last_hidden = None;
    }
}

pub struct Backbone {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    rope: RotaryEmbedding,
    hidden_size: usize,
    vocab_size: usize,
    device: Device,
}

impl Backbone {
    /// `vb` points at `language_model`.
    pub fn new(vb: VarBuilder, config: &BackboneConfig) -> Result<Self> {
        info!(
            "🔧 Initializing backbone: {} layers, hidden={}, heads={}/{} (q/kv)",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.num_key_value_heads
        );
        config.validate()?;

        let device = vb.device().clone();
        let embed_tokens = embedding(config.vocab_size, config.hidden_size, vb.pp("embed_tokens"))?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(DecoderLayer::new(config, vb.pp(format!("layers.{}", i)))?);
        }

        let norm = rms_norm(config.hidden_size, config.rms_norm_eps, vb.pp("norm"))?;
        let rope = RotaryEmbedding::new(config.head_dim(), config.rope_theta, &device);

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            rope,
            hidden_size: config.hidden_size,
            vocab_size: config.vocab_size,
            device,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn new_cache(&self) -> BackboneCache {
        BackboneCache::new(self.layers.len())
    }

    /// Token ids → `[1, n, hidden]`
    pub fn embed_tokens(&self, ids: &[u32]) -> Result<Tensor> {
        if let Some(bad) = ids.iter().find(|&&id| id as usize >= self.vocab_size) {
            return Err(AnyErr::msg(format!(
                "Token id {} outside vocabulary of {}",
                bad, self.vocab_size
            )));
        }
        let ids = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        Ok(self.embed_tokens.forward(&ids)?)
    }

    /// Runs `embeds` on top of the cached context. Returns the normed hidden
    /// states and each layer's key/value history including the new positions.
    fn run(&self, embeds: &Tensor, cache: &BackboneCache) -> Result<(Tensor, Vec<(Tensor, Tensor)>)> {
        let (batch, seq_len, hidden) = embeds.dims3()?;
        if batch != 1 || hidden != self.hidden_size || seq_len == 0 {
            return Err(AnyErr::msg(format!(
                "Backbone expects [1, n>0, {}] embeddings, got {:?}",
                self.hidden_size,
                embeds.dims()
            )));
        }

        let offset = cache.position;
        let mask = if seq_len > 1 {
            Some(create_causal_mask(
                seq_len,
                offset,
                embeds.dtype(),
                &self.device,
            )?)
        } else {
            None
        };

        let mut hidden_states = embeds.clone();
        let mut kv = Vec::with_capacity(self.layers.len());
        for (layer, layer_cache) in self.layers.iter().zip(&cache.layers) {
            let (h, k, v) =
                layer.forward(&hidden_states, &self.rope, mask.as_ref(), layer_cache, offset)?;
            hidden_states = h;
            kv.push((k, v));
        }

        Ok((self.norm.forward(&hidden_states)?, kv))
    }

    /// Append `embeds` `[1, n, hidden]` to the context. Returns the hidden
    /// state of the last new position, `[1, hidden]`.
    pub fn commit(&self, embeds: &Tensor, cache: &mut BackboneCache) -> Result<Tensor> {
        let seq_len = embeds.dim(1)?;
        let (hidden, kv) = self.run(embeds, cache)?;
        for (layer_cache, (k, v)) in cache.layers.iter_mut().zip(kv) {
            layer_cache.store(k, v);
        }
        cache.position += seq_len;

        let last = hidden.narrow(1, seq_len - 1, 1)?.squeeze(1)?;
        cache.last_hidden = Some(last.clone());
        Ok(last)
    }

    /// Hidden state `[1, hidden]` for `embed` `[1, 1, hidden]` placed after
    /// the committed context, leaving the cache untouched.
    pub fn speculate(&self, embed: &Tensor, cache: &BackboneCache) -> Result<Tensor> {
        let (hidden, _) = self.run(embed, cache)?;
        let seq_len = hidden.dim(1)?;
        Ok(hidden.narrow(1, seq_len - 1, 1)?.squeeze(1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_config;
    use candle_nn::VarMap;

    fn tiny_backbone() -> Backbone {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Backbone::new(vb, &tiny_config().backbone_config).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_causal_mask_layout() {
        let mask = create_causal_mask(2, 1, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 2, 3]);
        let rows = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows[0][..2], [0.0, 0.0]);
        assert!(rows[0][2].is_infinite());
        assert_eq!(rows[1], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_incremental_commit_matches_prefill() {
        let backbone = tiny_backbone();
        let embeds = backbone.embed_tokens(&[5, 17, 42, 99]).unwrap();

        let mut full = backbone.new_cache();
        let h_full = backbone.commit(&embeds, &mut full).unwrap();

        let mut step = backbone.new_cache();
        let mut h_step = None;
        for i in 0..4 {
            let e = embeds.narrow(1, i, 1).unwrap();
            h_step = Some(backbone.commit(&e, &mut step).unwrap());
        }

        assert_eq!(full.position(), 4);
        assert_eq!(step.position(), 4);
        assert!(max_abs_diff(&h_full, &h_step.unwrap()) < 1e-4);
    }

    #[test]
    fn test_speculate_leaves_cache_untouched() {
        let backbone = tiny_backbone();
        let mut cache = backbone.new_cache();
        backbone
            .commit(&backbone.embed_tokens(&[1, 2, 3]).unwrap(), &mut cache)
            .unwrap();

        let next = backbone.embed_tokens(&[7]).unwrap();
        let speculated = backbone.speculate(&next, &cache).unwrap();
        assert_eq!(speculated.dims(), &[1, backbone.hidden_size()]);
        assert_eq!(cache.position(), 3);

        let committed = backbone.commit(&next, &mut cache).unwrap();
        assert!(max_abs_diff(&speculated, &committed) < 1e-5);
        assert_eq!(cache.position(), 4);
        assert!(cache.last_hidden().is_some());
    }

    #[test]
    fn test_rejects_bad_input() {
        let backbone = tiny_backbone();
        assert!(backbone.embed_tokens(&[100_000]).is_err());

        let cache = backbone.new_cache();
        let wrong = Tensor::zeros((1, 1, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(backbone.speculate(&wrong, &cache).is_err());
    }

    #[test]
    fn test_reset_clears_context() {
        let backbone = tiny_backbone();
        let mut cache = backbone.new_cache();
        backbone
            .commit(&backbone.embed_tokens(&[1, 2]).unwrap(), &mut cache)
            .unwrap();
        cache.reset();
        assert_eq!(cache.position(), 0);
        assert!(cache.last_hidden().is_none());
    }
}
