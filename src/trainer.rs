//! # Noise prediction training
//!
//! The training step follows the text-to-image fine-tuning recipe of
//! diffusers:
//! https://github.com/huggingface/diffusers/blob/main/examples/text_to_image/train_text_to_image.py
//!
//! Images are projected in the latent space of the frozen auto-encoder, noised
//! to a random timestep and the UNet learns to predict the added noise.
use crate::loader::Batch;
use crate::models::{FrozenModel, VAE_SCALING_FACTOR};
use crate::noise_scheduler::NoiseScheduler;
use diffusers::models::{unet_2d::UNet2DConditionModel, vae::AutoEncoderKL};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tch::{nn, nn::OptimizerConfig, Device, Kind, Reduction, Tensor};

/// Optimizer settings, the defaults come from
/// https://huggingface.co/docs/diffusers/training/text2image
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub weight_decay: f64,
    pub epsilon: f64,
    /// Each gradient tensor is rescaled so that its norm does not exceed this.
    pub max_grad_norm: f64,
    pub use_mixed_precision: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-5,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 1e-2,
            epsilon: 1e-8,
            max_grad_norm: 1.0,
            use_mixed_precision: false,
        }
    }
}

/// Dynamic loss scaling for half precision training. The loss is multiplied
/// by `scale` before back-propagation so that small gradients do not flush to
/// zero, gradients are divided by the same factor before the update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    good_steps: usize,
}

impl Default for LossScaler {
    fn default() -> Self {
        Self {
            scale: 32768.,
            growth_factor: 2.,
            backoff_factor: 0.5,
            growth_interval: 2000,
            good_steps: 0,
        }
    }
}

impl LossScaler {
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Updates the scale after a step, returns whether the step should be
    /// applied.
    pub fn update(&mut self, found_inf: bool) -> bool {
        if found_inf {
            self.scale = (self.scale * self.backoff_factor).max(1.);
            self.good_steps = 0;
            false
        } else {
            self.good_steps += 1;
            if self.good_steps >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.good_steps = 0;
            }
            true
        }
    }
}

/// Groups the batch indexes by timestep, the UNet takes a single timestep
/// per call. Also returns the permutation that restores the batch order
/// once the groups are concatenated.
fn group_by_timestep(timesteps: &[i64]) -> (Vec<(i64, Vec<i64>)>, Vec<i64>) {
    let mut groups: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for (index, &timestep) in timesteps.iter().enumerate() {
        groups.entry(timestep).or_default().push(index as i64)
    }
    let groups: Vec<(i64, Vec<i64>)> = groups.into_iter().collect();
    let mut inverse = vec![0i64; timesteps.len()];
    let mut position = 0;
    for (_, indexes) in groups.iter() {
        for &index in indexes.iter() {
            inverse[index as usize] = position;
            position += 1;
        }
    }
    (groups, inverse)
}

pub struct Trainer {
    unet: UNet2DConditionModel,
    unet_vs: nn::VarStore,
    vae: FrozenModel<AutoEncoderKL>,
    noise_scheduler: NoiseScheduler,
    optimizer: nn::Optimizer,
    scaler: Option<LossScaler>,
    rng: StdRng,
    config: TrainerConfig,
    steps: usize,
}

impl Trainer {
    pub fn new(
        unet: UNet2DConditionModel,
        unet_vs: nn::VarStore,
        vae: FrozenModel<AutoEncoderKL>,
        noise_scheduler: NoiseScheduler,
        config: TrainerConfig,
        seed: u64,
    ) -> anyhow::Result<Self> {
        let optimizer = nn::AdamW {
            beta1: config.beta1,
            beta2: config.beta2,
            wd: config.weight_decay,
            eps: config.epsilon,
            amsgrad: false,
        }
        .build(&unet_vs, config.learning_rate)?;
        let scaler = if config.use_mixed_precision { Some(LossScaler::default()) } else { None };
        tracing::info!(
            "training {} unet variables with lr {}, mixed precision: {}",
            unet_vs.trainable_variables().len(),
            config.learning_rate,
            config.use_mixed_precision
        );
        Ok(Self {
            unet,
            unet_vs,
            vae,
            noise_scheduler,
            optimizer,
            scaler,
            rng: StdRng::seed_from_u64(seed),
            config,
            steps: 0,
        })
    }

    pub fn device(&self) -> Device {
        self.unet_vs.device()
    }

    /// The number of optimizer updates applied so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn loss_scaler(&self) -> Option<&LossScaler> {
        self.scaler.as_ref()
    }

    /// Projects the images in the latent space and samples from the
    /// resulting distribution.
    fn latents(&self, images: &Tensor) -> Tensor {
        tch::no_grad(|| {
            let images = images.to(self.vae.device());
            let latents = self.vae.model.encode(&images).sample() * VAE_SCALING_FACTOR;
            latents.to(self.device())
        })
    }

    fn predict_noise(&self, noisy_latents: &Tensor, timesteps: &[i64], encoded_text: &Tensor) -> Tensor {
        let device = self.device();
        let (groups, inverse) = group_by_timestep(timesteps);
        let predictions: Vec<Tensor> = groups
            .iter()
            .map(|(timestep, indexes)| {
                let indexes = Tensor::from_slice(indexes).to(device);
                let xs = noisy_latents.index_select(0, &indexes);
                let context = encoded_text.index_select(0, &indexes);
                self.unet.forward(&xs, *timestep as f64, &context)
            })
            .collect();
        let inverse = Tensor::from_slice(&inverse).to(device);
        Tensor::cat(&predictions, 0).index_select(0, &inverse)
    }

    /// Mean squared error between the sampled noise and the UNet prediction.
    fn compute_loss(&mut self, batch: &Batch) -> Tensor {
        let device = self.device();
        let latents = self.latents(&batch.images);
        let noise = latents.randn_like();
        let timesteps = self.noise_scheduler.sample_timesteps(batch.size() as usize, &mut self.rng);
        let timesteps_t = Tensor::from_slice(&timesteps).to(device);
        let noisy_latents = self.noise_scheduler.add_noise(&latents, &noise, &timesteps_t);
        let encoded_text = batch.encoded_text.to(device);
        let enabled = self.config.use_mixed_precision;
        let prediction =
            tch::autocast(enabled, || self.predict_noise(&noisy_latents, &timesteps, &encoded_text));
        prediction.to_kind(Kind::Float).mse_loss(&noise, Reduction::Mean)
    }

    /// Rescales each gradient to a norm of at most `max_grad_norm`. When a
    /// loss scaler is used the gradients are unscaled first, returns `false`
    /// if some gradient is not finite.
    fn unscale_and_clip_gradients(&self, inv_scale: f64) -> bool {
        let max_norm = self.config.max_grad_norm;
        tch::no_grad(|| {
            let mut finite = true;
            for var in self.unet_vs.trainable_variables().iter() {
                let mut grad = var.grad();
                if !grad.defined() {
                    continue;
                }
                if inv_scale != 1. {
                    let unscaled = &grad * inv_scale;
                    grad.copy_(&unscaled);
                }
                let norm = grad.norm().double_value(&[]);
                if !norm.is_finite() {
                    finite = false;
                    continue;
                }
                if norm > max_norm {
                    let clipped = &grad * (max_norm / norm);
                    grad.copy_(&clipped);
                }
            }
            finite
        })
    }

    /// Runs a single optimization step on the UNet and returns the loss.
    pub fn train_step(&mut self, batch: &Batch) -> anyhow::Result<f64> {
        let loss = self.compute_loss(batch);
        let loss_value = loss.double_value(&[]);
        if !loss_value.is_finite() && self.scaler.is_none() {
            anyhow::bail!("non finite loss {loss_value} at step {}", self.steps)
        }
        self.optimizer.zero_grad();
        let inv_scale = match &self.scaler {
            Some(scaler) => {
                (&loss * scaler.scale()).backward();
                1. / scaler.scale()
            }
            None => {
                loss.backward();
                1.
            }
        };
        let finite = self.unscale_and_clip_gradients(inv_scale);
        let apply = match &mut self.scaler {
            Some(scaler) => scaler.update(!finite),
            None => finite,
        };
        if apply {
            self.optimizer.step();
            self.steps += 1;
        } else {
            tracing::warn!("skipping update with non finite gradients, loss {loss_value}");
        }
        Ok(loss_value)
    }

    /// Evaluates the loss on a batch without updating the weights.
    pub fn test_step(&mut self, batch: &Batch) -> f64 {
        let loss = tch::no_grad(|| self.compute_loss(batch));
        loss.double_value(&[])
    }

    /// Saves the UNet weights, the only model being fine-tuned. The format
    /// is picked from the extension (`.safetensors` or `.ot`).
    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        crate::utils::create_parent_dir(&path)?;
        self.unet_vs.save(path.as_ref())?;
        tracing::info!("saved unet weights to {:?}", path.as_ref().to_string_lossy());
        Ok(())
    }
}
