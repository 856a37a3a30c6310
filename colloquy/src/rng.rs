//! PyTorch-compatible random number generation.
//!
//! Reproduces `torch.randn()` bit for bit given the same MT19937 seed, so a
//! session seeded here draws the same diffusion noise as the reference stack.
//!
//! PyTorch picks one of two Box-Muller variants by tensor size:
//! - **Scalar path**: 53-bit double uniforms, the second value of each pair is cached.
//! - **Vectorized path** (multiples of 16): 24-bit float uniforms in chunks of 16,
//!   emitted as eight cosines followed by eight sines.
//!
//! Each [`crate::Session`] owns its own [`SessionRng`]; there is no global generator.

use anyhow::Result;
use candle_core::{Device, Tensor};
// MT19937 (32-bit). Mt64 produces a different sequence.
use rand_mt::Mt;
use tracing::trace;

/// Box-Muller normal sampler matching PyTorch's CPU kernels
#[derive(Debug, Clone, Default)]
pub struct PyTorchNormal {
    cached_value: Option<f32>,
    u32_consumed: u64,
}

impl PyTorchNormal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total u32 values drawn from MT19937 so far
    pub fn u32_consumed(&self) -> u64 {
        self.u32_consumed
    }

    /// Two u32 draws combined into a 53-bit uniform double in [0, 1)
    #[inline]
    fn mt_to_uniform_double(lo: u32, hi: u32) -> f64 {
        let combined = ((lo as u64) << 32) | (hi as u64);
        const MASK_53BIT: u64 = 0x001F_FFFF_FFFF_FFFF;
        const DIVISOR: f64 = 9_007_199_254_740_992.0; // 2^53
        (combined & MASK_53BIT) as f64 / DIVISOR
    }

    /// One u32 draw as a 24-bit uniform float in [0, 1)
    #[inline]
    fn mt_to_uniform_float(val: u32) -> f32 {
        const MASK_24BIT: u32 = 0x00FF_FFFF;
        const DIVISOR: f32 = 16_777_216.0; // 2^24
        (val & MASK_24BIT) as f32 / DIVISOR
    }

    fn uniform_double(&mut self, rng: &mut Mt) -> f64 {
        let lo = rng.next_u32();
        let hi = rng.next_u32();
        self.u32_consumed += 2;
        Self::mt_to_uniform_double(lo, hi)
    }

    /// One N(0, 1) sample. Odd calls draw a fresh pair, even calls return the cached sine.
    pub fn sample(&mut self, rng: &mut Mt) -> f32 {
        if let Some(cached) = self.cached_value.take() {
            return cached;
        }

        let u1 = self.uniform_double(rng);
        let u2 = self.uniform_double(rng);

        // log(1 - u2) keeps the argument in (0, 1]
        let r = (-2.0_f64 * (1.0_f64 - u2).ln()).sqrt();
        let theta = 2.0_f64 * std::f64::consts::PI * u1;

        self.cached_value = Some((r * theta.sin()) as f32);
        (r * theta.cos()) as f32
    }

    /// `count` samples through the chunked path. `count` must be a multiple of 16.
    pub fn sample_vectorized(&mut self, rng: &mut Mt, count: usize) -> Result<Vec<f32>> {
        if !count.is_multiple_of(16) {
            anyhow::bail!(
                "Vectorized normal sampling needs a multiple of 16 values, got {}",
                count
            );
        }

        let mut output = Vec::with_capacity(count);
        for _ in 0..count / 16 {
            let mut uniforms = [0.0_f32; 16];
            for u in uniforms.iter_mut() {
                *u = Self::mt_to_uniform_float(rng.next_u32());
            }

            let mut cos_vals = [0.0_f32; 8];
            let mut sin_vals = [0.0_f32; 8];
            for i in 0..8 {
                // second half drives the angle, first half the radius
                let r = (-2.0_f32 * (1.0_f32 - uniforms[i]).ln()).sqrt();
                let theta = 2.0_f32 * std::f32::consts::PI * uniforms[8 + i];
                cos_vals[i] = r * theta.cos();
                sin_vals[i] = r * theta.sin();
            }
            output.extend_from_slice(&cos_vals);
            output.extend_from_slice(&sin_vals);
        }
        self.u32_consumed += count as u64;

        Ok(output)
    }
}

/// Seeded generator owned by one session: diffusion noise, variational
/// encoding noise and control-event sampling all draw from it in call order.
#[derive(Debug, Clone)]
pub struct SessionRng {
    seed: u64,
    rng: Mt,
    normal: PyTorchNormal,
}

impl SessionRng {
    /// Seeds are truncated to 32 bits, as `torch.manual_seed` does for MT19937.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: Mt::new(seed as u32),
            normal: PyTorchNormal::new(),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn u32_consumed(&self) -> u64 {
        self.normal.u32_consumed()
    }

    /// Standard normal values, choosing PyTorch's path for this element count.
    pub fn randn_vec(&mut self, count: usize) -> Result<Vec<f32>> {
        if count >= 16 && count.is_multiple_of(16) {
            self.normal.sample_vectorized(&mut self.rng, count)
        } else {
            Ok((0..count)
                .map(|_| self.normal.sample(&mut self.rng))
                .collect())
        }
    }

    /// Standard normal tensor. Generated on CPU and moved, so every device sees
    /// the same noise for the same seed.
    pub fn randn(&mut self, shape: &[usize], device: &Device) -> Result<Tensor> {
        let count = shape.iter().product::<usize>();
        let before = self.u32_consumed();
        let data = self.randn_vec(count)?;
        trace!(
            "🎲 randn({:?}): u32_consumed {} -> {}",
            shape,
            before,
            self.u32_consumed()
        );

        let cpu_tensor = Tensor::from_vec(data, shape, &Device::Cpu)?;
        if matches!(device, Device::Cpu) {
            Ok(cpu_tensor)
        } else {
            Ok(cpu_tensor.to_device(device)?)
        }
    }

    /// Uniform double in [0, 1)
    pub fn uniform(&mut self) -> f64 {
        self.normal.uniform_double(&mut self.rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_float_conversion() {
        assert_eq!(PyTorchNormal::mt_to_uniform_float(0), 0.0);
        assert_eq!(
            PyTorchNormal::mt_to_uniform_float(0x00FF_FFFF),
            16_777_215.0 / 16_777_216.0
        );
        // bits above 24 are masked off
        assert_eq!(
            PyTorchNormal::mt_to_uniform_float(0xFFFF_FFFF),
            16_777_215.0 / 16_777_216.0
        );
        assert_eq!(PyTorchNormal::mt_to_uniform_float(0xFF00_0000), 0.0);
    }

    #[test]
    fn test_scalar_path_for_small_tensors() {
        let mut rng = SessionRng::new(524242);
        let values = rng.randn_vec(4).unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
        // two Box-Muller pairs
        assert_eq!(rng.u32_consumed(), 8);

        // 20 is not a multiple of 16, so it stays on the scalar path
        let mut rng = SessionRng::new(524242);
        let mut first = rng.randn_vec(20).unwrap();
        first.truncate(4);
        assert_eq!(first, values);
    }

    #[test]
    fn test_scalar_path_caches_second_value() {
        let mut rng = Mt::new(7);
        let mut normal = PyTorchNormal::new();
        normal.sample(&mut rng);
        assert_eq!(normal.u32_consumed(), 4);
        normal.sample(&mut rng);
        assert_eq!(normal.u32_consumed(), 4);
    }

    #[test]
    fn test_vectorized_rejects_partial_chunks() {
        let mut rng = Mt::new(7);
        let mut normal = PyTorchNormal::new();
        assert!(normal.sample_vectorized(&mut rng, 20).is_err());
        let values = normal.sample_vectorized(&mut rng, 32).unwrap();
        assert_eq!(values.len(), 32);
        assert!(values.iter().all(|v| v.is_finite()));
        assert_eq!(normal.u32_consumed(), 32);
    }

    #[test]
    fn test_same_seed_same_noise() {
        let mut a = SessionRng::new(524242);
        let mut b = SessionRng::new(524242);
        let ta = a.randn(&[1, 64], &Device::Cpu).unwrap();
        let tb = b.randn(&[1, 64], &Device::Cpu).unwrap();
        assert_eq!(
            ta.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            tb.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );

        let mut c = SessionRng::new(1);
        let tc = c.randn(&[1, 64], &Device::Cpu).unwrap();
        assert_ne!(
            ta.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            tc.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }
}
