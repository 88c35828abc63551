//! # Forward diffusion
//!
//! The training side of a DDPM scheduler: it only needs to know how much
//! noise to add to a clean latent at a given timestep.
use rand::Rng;
use serde::{Deserialize, Serialize};
use tch::{kind, Device, Kind, Tensor};

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
    /// Glide cosine schedule
    SquaredcosCapV2,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseSchedulerConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// Number of diffusion steps used to train the model.
    pub train_timesteps: usize,
}

impl Default for NoiseSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.0001,
            beta_end: 0.02,
            beta_schedule: BetaSchedule::Linear,
            train_timesteps: 1000,
        }
    }
}

/// Betas discretizing the squared cosine `alpha_bar` function of
/// https://arxiv.org/abs/2102.09672, capped at `max_beta`.
fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f64) -> Tensor {
    let alpha_bar = |t: f64| f64::cos((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2);
    let n = num_diffusion_timesteps as f64;
    let betas: Vec<f64> = (0..num_diffusion_timesteps)
        .map(|i| {
            let t1 = i as f64 / n;
            let t2 = (i + 1) as f64 / n;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect();
    Tensor::from_slice(&betas)
}

#[derive(Debug)]
pub struct NoiseScheduler {
    sqrt_alphas_cumprod: Tensor,
    sqrt_one_minus_alphas_cumprod: Tensor,
    pub config: NoiseSchedulerConfig,
}

impl NoiseScheduler {
    pub fn new(config: NoiseSchedulerConfig, device: Device) -> Self {
        let n = config.train_timesteps as i64;
        let betas = match config.beta_schedule {
            BetaSchedule::ScaledLinear => {
                Tensor::linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n, kind::DOUBLE_CPU)
                    .square()
            }
            BetaSchedule::Linear => {
                Tensor::linspace(config.beta_start, config.beta_end, n, kind::DOUBLE_CPU)
            }
            BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(config.train_timesteps, 0.999),
        };
        let alphas_cumprod = (1f64 - betas.to_kind(Kind::Double)).cumprod(0, Kind::Double);
        let sqrt_alphas_cumprod = alphas_cumprod.sqrt().to_kind(Kind::Float).to(device);
        let sqrt_one_minus_alphas_cumprod =
            (1f64 - &alphas_cumprod).sqrt().to_kind(Kind::Float).to(device);
        Self { sqrt_alphas_cumprod, sqrt_one_minus_alphas_cumprod, config }
    }

    pub fn train_timesteps(&self) -> usize {
        self.config.train_timesteps
    }

    /// The cumulative product of `1 - beta` up to `timestep`.
    pub fn alpha_cumprod(&self, timestep: usize) -> f64 {
        self.sqrt_alphas_cumprod.double_value(&[timestep as i64]).powi(2)
    }

    /// One uniformly drawn timestep in `[0, train_timesteps)` per sample.
    pub fn sample_timesteps<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Vec<i64> {
        let n = self.config.train_timesteps as i64;
        (0..batch_size).map(|_| rng.gen_range(0..n)).collect()
    }

    /// Forward diffusion process, noises each sample of `original_samples` to
    /// the level of its own timestep.
    pub fn add_noise(&self, original_samples: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Tensor {
        let bsize = original_samples.size()[0];
        let device = original_samples.device();
        let timesteps = timesteps.to_device(self.sqrt_alphas_cumprod.device());
        let sqrt_alpha_prod = self.sqrt_alphas_cumprod.index_select(0, &timesteps);
        let sqrt_one_minus_alpha_prod =
            self.sqrt_one_minus_alphas_cumprod.index_select(0, &timesteps);
        let sqrt_alpha_prod = sqrt_alpha_prod.view([bsize, 1, 1, 1]).to(device);
        let sqrt_one_minus_alpha_prod = sqrt_one_minus_alpha_prod.view([bsize, 1, 1, 1]).to(device);
        sqrt_alpha_prod * original_samples.to_kind(Kind::Float)
            + sqrt_one_minus_alpha_prod * noise.to_kind(Kind::Float)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cumprod_decreases() {
        let scheduler = NoiseScheduler::new(Default::default(), Device::Cpu);
        let first = scheduler.alpha_cumprod(0);
        let last = scheduler.alpha_cumprod(999);
        assert!((first - 0.9999).abs() < 1e-6);
        assert!(last < 1e-4 && last > 0.);
        for t in [10, 100, 500] {
            assert!(scheduler.alpha_cumprod(t) > scheduler.alpha_cumprod(t + 1));
        }
    }

    #[test]
    fn cosine_schedule_is_capped() {
        let config = NoiseSchedulerConfig {
            beta_schedule: BetaSchedule::SquaredcosCapV2,
            ..Default::default()
        };
        let scheduler = NoiseScheduler::new(config, Device::Cpu);
        let last = scheduler.alpha_cumprod(999);
        assert!(last >= 0. && last < 1e-3);
        assert!(scheduler.alpha_cumprod(0) > 0.99);
    }

    #[test]
    fn noise_level_follows_each_timestep() {
        let scheduler = NoiseScheduler::new(Default::default(), Device::Cpu);
        let latents = Tensor::ones([2, 4, 2, 2], kind::FLOAT_CPU);
        let noise = Tensor::zeros([2, 4, 2, 2], kind::FLOAT_CPU);
        let timesteps = Tensor::from_slice(&[0i64, 999]);
        let noisy = scheduler.add_noise(&latents, &noise, &timesteps);
        assert_eq!(noisy.size(), [2, 4, 2, 2]);
        let a0 = noisy.double_value(&[0, 0, 0, 0]);
        let a1 = noisy.double_value(&[1, 3, 1, 1]);
        assert!((a0 - scheduler.alpha_cumprod(0).sqrt()).abs() < 1e-5);
        assert!((a1 - scheduler.alpha_cumprod(999).sqrt()).abs() < 1e-5);

        let latents = Tensor::zeros([1, 4, 2, 2], kind::FLOAT_CPU);
        let noise = Tensor::ones([1, 4, 2, 2], kind::FLOAT_CPU);
        let noisy = scheduler.add_noise(&latents, &noise, &Tensor::from_slice(&[999i64]));
        let expected = (1. - scheduler.alpha_cumprod(999)).sqrt();
        assert!((noisy.double_value(&[0, 0, 0, 0]) - expected).abs() < 1e-5);
    }

    #[test]
    fn timesteps_are_in_range() {
        use rand::{rngs::StdRng, SeedableRng};
        let scheduler = NoiseScheduler::new(Default::default(), Device::Cpu);
        let mut rng = StdRng::seed_from_u64(42);
        let timesteps = scheduler.sample_timesteps(512, &mut rng);
        assert_eq!(timesteps.len(), 512);
        assert!(timesteps.iter().all(|t| (0..1000).contains(t)));
        // Both halves of the range get sampled.
        assert!(timesteps.iter().any(|&t| t < 500) && timesteps.iter().any(|&t| t >= 500));
    }
}
