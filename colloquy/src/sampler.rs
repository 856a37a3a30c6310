//! Noise schedule, classifier-free guidance and the DPM-Solver++ integrator
//! that turns Gaussian noise into one latent frame.

use candle_core::Tensor;
use tracing::debug;

use crate::config::DiffusionHeadConfig;
use crate::diffusion::Denoiser;
use crate::latent::LatentFrame;
use crate::rng::SessionRng;
use crate::{ColloquyError, Result};

/// Solver order; the second-order update needs one previous x0 estimate.
const SOLVER_ORDER: usize = 2;

/// Below this many steps the final update falls back to first order.
const LOWER_ORDER_FINAL_BELOW: usize = 15;

/// Squared-cosine variance schedule expressed as `σ = sqrt((1 − ᾱ) / ᾱ)` per
/// training timestep.
pub fn compute_sigmas_schedule(num_train_timesteps: usize) -> Vec<f32> {
    use std::f64::consts::PI;

    let alpha_bar_fn = |t: f64| -> f64 { ((t + 0.008) / 1.008 * PI / 2.0).cos().powi(2) };

    let max_beta: f64 = 0.999;
    let mut running_product = 1.0f64;
    (0..num_train_timesteps)
        .map(|i| {
            let t1 = i as f64 / num_train_timesteps as f64;
            let t2 = (i + 1) as f64 / num_train_timesteps as f64;
            let beta = (1.0 - alpha_bar_fn(t2) / alpha_bar_fn(t1)).min(max_beta);
            running_product *= 1.0 - beta;
            ((1.0 - running_product) / running_product.max(1e-20)).sqrt() as f32
        })
        .collect()
}

/// `σ → (α_t, σ_t)` with `α_t² + σ_t² = 1`
fn sigma_to_alpha_sigma(sigma: f32) -> (f32, f32) {
    let alpha_t = 1.0 / (sigma.powi(2) + 1.0).sqrt();
    (alpha_t, sigma * alpha_t)
}

/// Training and inference step tables, shared read-only by every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    num_train_steps: usize,
    train_sigmas: Vec<f32>,
    timesteps: Vec<usize>,
    sigmas: Vec<f32>,
}

impl NoiseSchedule {
    pub fn new(num_train_steps: usize, num_inference_steps: usize) -> Result<Self> {
        if num_train_steps < 2 {
            return Err(ColloquyError::ConfigError(format!(
                "Noise schedule needs at least 2 training steps, got {}",
                num_train_steps
            )));
        }
        if num_inference_steps == 0 || num_inference_steps > num_train_steps {
            return Err(ColloquyError::ConfigError(format!(
                "Sampler steps must be in 1..={}, got {}",
                num_train_steps, num_inference_steps
            )));
        }

        let train_sigmas = compute_sigmas_schedule(num_train_steps);

        // linspace(0, T - 1, n + 1).round(), reversed, final 0 dropped
        let n_points = num_inference_steps + 1;
        let timesteps: Vec<usize> = (0..n_points)
            .map(|i| {
                let t = (i as f64 / (n_points - 1) as f64) * (num_train_steps - 1) as f64;
                t.round() as usize
            })
            .rev()
            .take(num_inference_steps)
            .collect();

        let mut sigmas: Vec<f32> = timesteps.iter().map(|&t| train_sigmas[t]).collect();
        sigmas.push(0.0);

        Ok(Self {
            num_train_steps,
            train_sigmas,
            timesteps,
            sigmas,
        })
    }

    pub fn from_config(config: &DiffusionHeadConfig, sampler_steps: usize) -> Result<Self> {
        Self::new(config.ddpm_num_steps, sampler_steps)
    }

    pub fn num_train_steps(&self) -> usize {
        self.num_train_steps
    }

    pub fn num_inference_steps(&self) -> usize {
        self.timesteps.len()
    }

    /// Descending inference timesteps.
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Sigma per inference step plus the terminal 0.
    pub fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }

    /// Sigma at a training timestep.
    pub fn train_sigma(&self, timestep: usize) -> Option<f32> {
        self.train_sigmas.get(timestep).copied()
    }
}

/// Classifier-free guidance weight. The unconditional pass is skipped when
/// the blend would discard it (w = 1) or use it alone (w = 0).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuidanceConfig {
    weight: f32,
}

impl GuidanceConfig {
    pub fn new(weight: f32) -> Result<Self> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(ColloquyError::DegenerateGuidance(weight));
        }
        Ok(Self { weight })
    }

    /// Plain conditional generation.
    pub fn disabled() -> Self {
        Self { weight: 1.0 }
    }

    pub fn weight(&self) -> f32 {
        self.weight
    }

    pub fn needs_unconditional_pass(&self) -> bool {
        self.weight != 0.0 && self.weight != 1.0
    }
}

/// `u + w · (c − u)`, returning `c` or `u` untouched for w = 1 or w = 0.
pub fn blend_guidance(
    unconditional: &Tensor,
    conditional: &Tensor,
    weight: f32,
) -> candle_core::Result<Tensor> {
    if weight == 1.0 {
        return Ok(conditional.clone());
    }
    if weight == 0.0 {
        return Ok(unconditional.clone());
    }
    unconditional + (conditional - unconditional)?.affine(weight as f64, 0.0)?
}

/// Guided model output for one solver step, fusing both passes into one call.
fn guided_prediction<M: Denoiser + ?Sized>(
    denoiser: &M,
    sample: &Tensor,
    timestep: usize,
    condition: &Tensor,
    null_condition: &Tensor,
    guidance: GuidanceConfig,
) -> Result<Tensor> {
    let device = sample.device();
    if !guidance.needs_unconditional_pass() {
        let cond = if guidance.weight() == 0.0 {
            null_condition
        } else {
            condition
        };
        let t = Tensor::new(&[timestep as f32], device)?;
        return Ok(denoiser.denoise(sample, &t, cond)?);
    }

    let combined = Tensor::cat(&[sample, sample], 0)?.contiguous()?;
    let conditions = Tensor::cat(&[condition, null_condition], 0)?.contiguous()?;
    let t = Tensor::new(&[timestep as f32, timestep as f32], device)?;
    let output = denoiser.denoise(&combined, &t, &conditions)?;

    let chunks = output.chunk(2, 0)?;
    Ok(blend_guidance(&chunks[1], &chunks[0], guidance.weight())?)
}

/// Draw one latent frame conditioned on `condition` `[1, cond]`.
///
/// Starts from `N(0, I)` noise out of `rng` and runs the multistep
/// DPM-Solver++ over `schedule` on v-predictions.
pub fn sample_frame<M: Denoiser + ?Sized>(
    denoiser: &M,
    condition: &Tensor,
    null_condition: &Tensor,
    schedule: &NoiseSchedule,
    guidance: GuidanceConfig,
    rng: &mut SessionRng,
) -> Result<LatentFrame> {
    if condition.dims() != null_condition.dims() {
        return Err(ColloquyError::ConfigError(format!(
            "Condition {:?} and null condition {:?} differ in shape",
            condition.dims(),
            null_condition.dims()
        )));
    }

    let device = condition.device();
    let latent_dim = denoiser.latent_dim();
    let mut sample = rng
        .randn(&[1, latent_dim], device)?
        .to_dtype(condition.dtype())?;

    let timesteps = schedule.timesteps();
    let sigmas = schedule.sigmas();
    let num_steps = timesteps.len();

    let mut model_outputs: [Option<Tensor>; SOLVER_ORDER] = [None, None];
    let mut lower_order_nums = 0usize;

    for step_index in 0..num_steps {
        let sigma_s = sigmas[step_index];
        let sigma_t = sigmas[step_index + 1];
        let (alpha_s, sigma_s_actual) = sigma_to_alpha_sigma(sigma_s);
        let (alpha_t, sigma_t_actual) = sigma_to_alpha_sigma(sigma_t);

        let v = guided_prediction(
            denoiser,
            &sample,
            timesteps[step_index],
            condition,
            null_condition,
            guidance,
        )?;

        // v-prediction: x0 = α_s · x − σ_s · v
        let x0_pred = (sample.affine(alpha_s as f64, 0.0)?
            - v.affine(sigma_s_actual as f64, 0.0)?)?;

        model_outputs[0] = model_outputs[1].take();
        model_outputs[1] = Some(x0_pred.clone());

        let lower_order_final = step_index == num_steps - 1
            && (num_steps < LOWER_ORDER_FINAL_BELOW || sigma_t == 0.0);
        let use_first_order = lower_order_nums < 1 || lower_order_final;

        let lambda_s = alpha_s.ln() - sigma_s_actual.ln();
        let lambda_t = alpha_t.ln() - sigma_t_actual.ln();
        let h = lambda_t - lambda_s;

        let coeff1 = sigma_t_actual / sigma_s_actual;
        let coeff2 = alpha_t * ((-h).exp() - 1.0);

        sample = match (&model_outputs[0], use_first_order) {
            (Some(m1), false) => {
                let sigma_s1 = sigmas[step_index - 1];
                let (alpha_s1, sigma_s1_actual) = sigma_to_alpha_sigma(sigma_s1);
                let lambda_s1 = alpha_s1.ln() - sigma_s1_actual.ln();
                let r0 = (lambda_s - lambda_s1) / h;

                let d1 = ((&x0_pred - m1)? * (1.0 / r0 as f64))?;
                ((sample.affine(coeff1 as f64, 0.0)? - x0_pred.affine(coeff2 as f64, 0.0)?)?
                    - d1.affine(0.5 * coeff2 as f64, 0.0)?)?
            }
            _ => (sample.affine(coeff1 as f64, 0.0)? - x0_pred.affine(coeff2 as f64, 0.0)?)?,
        };

        if lower_order_nums < SOLVER_ORDER {
            lower_order_nums += 1;
        }
    }

    debug!(
        "Sampled frame in {} steps (guidance w={})",
        num_steps,
        guidance.weight()
    );
    LatentFrame::from_tensor(&sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    /// Exact v-prediction for data concentrated on the condition vector, so
    /// every x0 estimate equals the condition.
    struct OracleDenoiser {
        schedule: NoiseSchedule,
        dim: usize,
    }

    impl Denoiser for OracleDenoiser {
        fn latent_dim(&self) -> usize {
            self.dim
        }

        fn denoise(
            &self,
            noisy: &Tensor,
            timesteps: &Tensor,
            condition: &Tensor,
        ) -> anyhow::Result<Tensor> {
            let ts = timesteps.to_vec1::<f32>()?;
            let rows = ts
                .iter()
                .enumerate()
                .map(|(i, &t)| {
                    let sigma = self.schedule.train_sigma(t.round() as usize).unwrap();
                    let (alpha, sigma) = sigma_to_alpha_sigma(sigma);
                    let x = noisy.narrow(0, i, 1)?;
                    let x0 = condition.narrow(0, i, 1)?;
                    // ε = (x − α·x0) / σ, v = α·ε − σ·x0
                    let eps = (x - x0.affine(alpha as f64, 0.0)?)?.affine(1.0 / sigma as f64, 0.0)?;
                    Ok((eps.affine(alpha as f64, 0.0)? - x0.affine(sigma as f64, 0.0)?)?)
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(Tensor::cat(&rows, 0)?)
        }
    }

    /// Depends on every input so guidance changes are visible.
    struct MixingDenoiser;

    impl Denoiser for MixingDenoiser {
        fn latent_dim(&self) -> usize {
            4
        }

        fn denoise(&self, noisy: &Tensor, t: &Tensor, condition: &Tensor) -> anyhow::Result<Tensor> {
            let t = t.affine(1e-3, 0.0)?.unsqueeze(1)?;
            Ok((noisy.affine(0.5, 0.0)? + condition.tanh()?)?.broadcast_mul(&t)?)
        }
    }

    fn oracle() -> (OracleDenoiser, NoiseSchedule) {
        let schedule = NoiseSchedule::new(1000, 10).unwrap();
        (
            OracleDenoiser {
                schedule: schedule.clone(),
                dim: 4,
            },
            schedule,
        )
    }

    fn row(values: &[f32]) -> Tensor {
        Tensor::from_slice(values, (1, values.len()), &Device::Cpu).unwrap()
    }

    fn close(a: &[f32], b: &[f32], tol: f32) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() <= tol)
    }

    #[test]
    fn test_schedule_tables() {
        let schedule = NoiseSchedule::new(1000, 10).unwrap();
        assert_eq!(
            schedule.timesteps(),
            &[999, 899, 799, 699, 599, 500, 400, 300, 200, 100]
        );
        assert_eq!(schedule.sigmas().len(), 11);
        assert_eq!(*schedule.sigmas().last().unwrap(), 0.0);
        assert!(schedule.sigmas().windows(2).all(|w| w[0] > w[1]));

        assert!(NoiseSchedule::new(1000, 0).is_err());
        assert!(NoiseSchedule::new(1, 1).is_err());
    }

    #[test]
    fn test_guidance_config() {
        assert!(matches!(
            GuidanceConfig::new(-0.1),
            Err(ColloquyError::DegenerateGuidance(_))
        ));
        assert!(GuidanceConfig::new(f32::NAN).is_err());
        assert!(!GuidanceConfig::new(0.0).unwrap().needs_unconditional_pass());
        assert!(!GuidanceConfig::new(1.0).unwrap().needs_unconditional_pass());
        assert!(GuidanceConfig::new(1.5).unwrap().needs_unconditional_pass());
    }

    #[test]
    fn test_blend_endpoints_are_exact() {
        let u = row(&[0.1, -2.0, 3.3]);
        let c = row(&[1.7, 0.25, -0.5]);
        let at = |w| blend_guidance(&u, &c, w).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(at(1.0), vec![1.7, 0.25, -0.5]);
        assert_eq!(at(0.0), vec![0.1, -2.0, 3.3]);
        assert!(close(&at(2.0), &[3.3, 2.5, -4.3], 1e-5));
    }

    #[test]
    fn test_oracle_converges_to_condition() {
        let (denoiser, schedule) = oracle();
        let target = [0.5, -0.25, 1.0, 0.0];
        let mut rng = SessionRng::new(3);
        let frame = sample_frame(
            &denoiser,
            &row(&target),
            &row(&[0.0; 4]),
            &schedule,
            GuidanceConfig::disabled(),
            &mut rng,
        )
        .unwrap();
        assert!(frame.is_finite());
        assert!(close(frame.values(), &target, 1e-3), "{:?}", frame.values());
    }

    #[test]
    fn test_guidance_degeneracy() {
        let schedule = NoiseSchedule::new(1000, 10).unwrap();
        let cond = row(&[0.3, -0.7, 1.1, 0.2]);
        let null = row(&[0.0; 4]);
        let other_null = row(&[9.0, 9.0, -9.0, 1.0]);
        let run = |c: &Tensor, n: &Tensor, w: f32| {
            let mut rng = SessionRng::new(11);
            sample_frame(&MixingDenoiser, c, n, &schedule, GuidanceConfig::new(w).unwrap(), &mut rng)
                .unwrap()
                .values()
                .to_vec()
        };

        // w = 1 ignores the null condition entirely
        assert_eq!(run(&cond, &null, 1.0), run(&cond, &other_null, 1.0));
        // w = 0 is the null-conditioned run
        assert_eq!(run(&cond, &null, 0.0), run(&null, &cond, 1.0));
        // anything else mixes both
        assert_ne!(run(&cond, &null, 1.5), run(&cond, &null, 1.0));
    }

    #[test]
    fn test_sampling_is_seeded() {
        let (denoiser, schedule) = oracle();
        let cond = Tensor::zeros((1, 4), DType::F32, &Device::Cpu).unwrap();
        let draw = |seed| {
            let mut rng = SessionRng::new(seed);
            sample_frame(&MixingDenoiser, &cond, &cond, &schedule, GuidanceConfig::disabled(), &mut rng)
                .unwrap()
        };
        assert_eq!(draw(1), draw(1));
        assert_ne!(draw(1), draw(2));

        let mismatched = Tensor::zeros((1, 5), DType::F32, &Device::Cpu).unwrap();
        let mut rng = SessionRng::new(1);
        assert!(matches!(
            sample_frame(&denoiser, &cond, &mismatched, &schedule, GuidanceConfig::disabled(), &mut rng),
            Err(ColloquyError::ConfigError(_))
        ));
    }
}
