//! σ-VAE acoustic codec: 24 kHz waveform ⇄ 7.5 Hz continuous latents.

use candle_core::{Device, Tensor};
use candle_nn::{Init, VarBuilder};
use std::ops::Range;
use tracing::{debug, info};

use crate::audio::AudioData;
use crate::config::{ModelConfig, SAMPLE_RATE, VAEDecoderConfig};
use crate::latent::{LatentFrame, LatentSequence};
use crate::rng::SessionRng;
use crate::streaming_cache::StreamingCache;
use crate::vae_decoder::VAEDecoder;
use crate::vae_encoder::VAEEncoder;
use crate::{ColloquyError, Result};

/// Read a scalar stored either as `[]` or `[1]`.
fn load_scalar(vb: &VarBuilder, name: &str, init: f64) -> anyhow::Result<f32> {
    let t = vb
        .get_with_hints(1, name, Init::Const(init))
        .or_else(|_| vb.get((), name))?;
    t.flatten_all()?
        .to_vec1::<f32>()?
        .first()
        .copied()
        .ok_or_else(|| anyhow::Error::msg(format!("{} is empty", name)))
}

/// Encoder/decoder pair plus the latent normalization the backbone was trained with.
///
/// Latents handed out by the codec are always normalized, `(z + bias) * scale`;
/// decoding undoes it before the decoder runs.
pub struct AcousticCodec {
    encoder: VAEEncoder,
    decoder: VAEDecoder,
    scaling_factor: f32,
    bias_factor: f32,
    fix_std: f64,
    variational: bool,
    vae_dim: usize,
    device: Device,
}

impl AcousticCodec {
    /// `vb` points at the model root: weights under `acoustic_tokenizer.{encoder,decoder}`
    /// and the normalization scalars `speech_scaling_factor` / `speech_bias_factor`.
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> anyhow::Result<Self> {
        let tc = &config.acoustic_tokenizer_config;
        info!("🔧 Initializing acoustic codec (vae_dim={})", tc.vae_dim);

        let encoder = VAEEncoder::new(vb.pp("acoustic_tokenizer.encoder"), tc, "acoustic")?;
        let decoder = VAEDecoder::new(
            vb.pp("acoustic_tokenizer.decoder"),
            VAEDecoderConfig::from_tokenizer_config(tc)?,
        )?;

        let scaling_factor = load_scalar(&vb, "speech_scaling_factor", 1.0)?;
        let bias_factor = load_scalar(&vb, "speech_bias_factor", 0.0)?;
        debug!(
            "📊 Speech normalization: scaling={:.6}, bias={:.6}",
            scaling_factor, bias_factor
        );
        if scaling_factor == 0.0 {
            anyhow::bail!("speech_scaling_factor must be non-zero");
        }

        Ok(Self {
            encoder,
            decoder,
            scaling_factor,
            bias_factor,
            fix_std: tc.fix_std,
            variational: tc.is_variational(),
            vae_dim: tc.vae_dim,
            device: vb.device().clone(),
        })
    }

    pub fn vae_dim(&self) -> usize {
        self.vae_dim
    }

    pub fn hop_length(&self) -> usize {
        self.decoder.hop_length()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn normalize(&self, z: &Tensor) -> Result<Tensor> {
        Ok(((z + self.bias_factor as f64)? * self.scaling_factor as f64)?)
    }

    fn denormalize(&self, z: &Tensor) -> Result<Tensor> {
        Ok(z.affine(1.0 / self.scaling_factor as f64, -(self.bias_factor as f64))?)
    }

    fn encode_raw(&self, waveform: &Tensor) -> Result<Tensor> {
        let (_b, channels, samples) = waveform.dims3()?;
        if channels != 1 {
            return Err(ColloquyError::AudioError(format!(
                "Codec expects mono audio [B, 1, samples], got {} channels",
                channels
            )));
        }
        if samples == 0 {
            return Err(ColloquyError::AudioError(
                "Cannot encode an empty waveform".to_string(),
            ));
        }
        // [B, vae_dim, T] -> [B, T, vae_dim]
        let z = self.encoder.encode(waveform)?;
        Ok(z.transpose(1, 2)?.contiguous()?)
    }

    /// Posterior mean, normalized. `[B, 1, samples]` → `[B, ceil(samples / hop), vae_dim]`.
    pub fn encode_mean(&self, waveform: &Tensor) -> Result<Tensor> {
        let z = self.encode_raw(waveform)?;
        self.normalize(&z)
    }

    /// Variational encode: `mean + (fix_std / 0.8) · n_b · ε` with one `n_b` per batch
    /// item, then normalized. Falls back to the mean when the codec is not variational.
    pub fn encode_sampled(&self, waveform: &Tensor, rng: &mut SessionRng) -> Result<Tensor> {
        let mean = self.encode_raw(waveform)?;
        if !self.variational {
            return self.normalize(&mean);
        }

        let batch = mean.dim(0)?;
        let value = self.fix_std / 0.8;
        let std_per_batch = (rng.randn(&[batch], mean.device())? * value)?;
        let noise = rng.randn(mean.dims(), mean.device())?;
        let sampled = mean.broadcast_add(
            &std_per_batch
                .reshape((batch, 1, 1))?
                .broadcast_mul(&noise)?,
        )?;
        self.normalize(&sampled)
    }

    /// Deterministic encode of one clip into a fresh sequence.
    pub fn encode(&self, audio: &AudioData) -> Result<LatentSequence> {
        let z = self.encode_mean(&audio.to_tensor(&self.device)?)?;
        let frames = z.squeeze(0)?;
        let (t, _) = frames.dims2()?;
        let mut seq = LatentSequence::with_capacity(self.vae_dim, t);
        for i in 0..t {
            seq.push(&LatentFrame::from_tensor(&frames.get(i)?)?)?;
        }
        Ok(seq)
    }

    /// Normalized latents `[B, vae_dim, T]` → waveform `[B, 1, T * hop]` in [-1, 1].
    pub fn decode_tensor(&self, latents: &Tensor) -> Result<Tensor> {
        let dims = latents.dims();
        if dims.len() != 3 {
            return Err(ColloquyError::CodecDecodeFailure(format!(
                "Expected latents of rank 3 [B, vae_dim, T], got shape {:?}",
                dims
            )));
        }
        if dims[1] != self.vae_dim {
            return Err(ColloquyError::CodecDecodeFailure(format!(
                "Latent channel dim {} does not match codec vae_dim {}",
                dims[1], self.vae_dim
            )));
        }
        if dims[2] == 0 {
            return Ok(Tensor::zeros((dims[0], 1, 0), latents.dtype(), latents.device())?);
        }

        let z = self.denormalize(latents)?;
        self.decoder
            .decode(&z)
            .map_err(|e| ColloquyError::CodecDecodeFailure(e.to_string()))
    }

    /// Decode a whole sequence. An empty sequence yields an empty waveform.
    pub fn decode(&self, seq: &LatentSequence) -> Result<AudioData> {
        if seq.dim() != self.vae_dim {
            return Err(ColloquyError::CodecDecodeFailure(format!(
                "Sequence dim {} does not match codec vae_dim {}",
                seq.dim(),
                self.vae_dim
            )));
        }
        if seq.is_empty() {
            return Ok(AudioData::empty(SAMPLE_RATE));
        }
        let latents = seq.to_tensor(0..seq.len(), &self.device)?;
        let audio = self.decode_tensor(&latents)?;
        AudioData::from_tensor(&audio, SAMPLE_RATE)
    }

    /// Incrementally decode `range` of `seq`, continuing from `cache`.
    /// Returns exactly `range.len() * hop_length` samples.
    pub fn decode_chunk(
        &self,
        seq: &LatentSequence,
        range: Range<usize>,
        cache: &mut StreamingCache,
    ) -> Result<AudioData> {
        if range.is_empty() {
            return Ok(AudioData::empty(SAMPLE_RATE));
        }
        let latents = seq.to_tensor(range, &self.device)?;
        let z = self.denormalize(&latents)?;
        let audio = self
            .decoder
            .decode_with_cache(&z, cache)
            .map_err(|e| ColloquyError::CodecDecodeFailure(e.to_string()))?;
        AudioData::from_tensor(&audio, SAMPLE_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tiny_config, tiny_weights};

    fn tone(samples: usize) -> AudioData {
        AudioData::from_samples(
            (0..samples)
                .map(|i| 0.3 * (i as f32 * 0.05).sin())
                .collect(),
            SAMPLE_RATE,
        )
    }

    #[test]
    fn test_round_trip_length_and_range() {
        let weights = tiny_weights();
        let codec = &weights.codec;
        let audio = tone(3200 * 3);

        let seq = codec.encode(&audio).unwrap();
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.dim(), tiny_config().acoustic_vae_dim);

        let decoded = codec.decode(&seq).unwrap();
        assert_eq!(decoded.num_samples(), audio.num_samples());
        // Random weights give no fidelity, only the length and range contract
        assert!(
            decoded
                .samples()
                .iter()
                .all(|s| s.is_finite() && (-1.0..=1.0).contains(s))
        );
        assert_eq!(codec.decode(&seq).unwrap().samples(), decoded.samples());
    }

    #[test]
    fn test_partial_hop_rounds_up() {
        let weights = tiny_weights();
        let seq = weights.codec.encode(&tone(3200 + 1)).unwrap();
        assert_eq!(seq.len(), 2);
    }

    #[test]
    fn test_decode_empty_sequence() {
        let weights = tiny_weights();
        let seq = LatentSequence::new(weights.codec.vae_dim());
        let audio = weights.codec.decode(&seq).unwrap();
        assert!(audio.is_empty());
        assert_eq!(audio.sample_rate(), SAMPLE_RATE);
    }

    #[test]
    fn test_decode_rejects_wrong_channel_dim() {
        let weights = tiny_weights();
        let codec = &weights.codec;
        let bad = Tensor::zeros((1, codec.vae_dim() + 1, 2), candle_core::DType::F32, &Device::Cpu)
            .unwrap();
        assert!(matches!(
            codec.decode_tensor(&bad),
            Err(ColloquyError::CodecDecodeFailure(_))
        ));

        let seq = LatentSequence::new(codec.vae_dim() + 1);
        assert!(matches!(
            codec.decode(&seq),
            Err(ColloquyError::CodecDecodeFailure(_))
        ));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let weights = tiny_weights();
        let seq = weights.codec.encode(&tone(6400)).unwrap();
        let a = weights.codec.decode(&seq).unwrap();
        let b = weights.codec.decode(&seq).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_chunked_decode_matches_full_decode() {
        let weights = tiny_weights();
        let codec = &weights.codec;
        let seq = codec.encode(&tone(3200 * 4)).unwrap();
        let full = codec.decode(&seq).unwrap();

        let mut cache = StreamingCache::new(Device::Cpu);
        let first = codec.decode_chunk(&seq, 0..2, &mut cache).unwrap();
        let second = codec.decode_chunk(&seq, 2..4, &mut cache).unwrap();
        assert_eq!(first.num_samples(), 2 * 3200);
        assert_eq!(second.num_samples(), 2 * 3200);
        assert_eq!(cache.frames_decoded(), 4);

        let streamed = AudioData::concat(&[first, second]).unwrap();
        let max_diff = streamed
            .samples()
            .iter()
            .zip(full.samples())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_diff < 1e-4, "chunked decode diverged by {}", max_diff);
    }

    #[test]
    fn test_sampled_encode_is_seeded() {
        let weights = tiny_weights();
        let codec = &weights.codec;
        let x = tone(3200 * 2).to_tensor(&Device::Cpu).unwrap();

        let mean = codec.encode_mean(&x).unwrap();
        let a = codec.encode_sampled(&x, &mut SessionRng::new(9)).unwrap();
        let b = codec.encode_sampled(&x, &mut SessionRng::new(9)).unwrap();
        let to_vec = |t: &Tensor| t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(to_vec(&a), to_vec(&b));
        assert_ne!(to_vec(&a), to_vec(&mean));
    }
}
