//! # Fine-tuning configuration
//!
//! All the settings of a run, loadable from a TOML file. Every section and
//! field is optional, missing values fall back to the defaults below.
//!
//! ```toml
//! [data]
//! data_dir = "dataset"
//!
//! [training]
//! epochs = 5
//! batch_size = 4
//!
//! [trainer]
//! learning_rate = 2e-5
//! ```
use crate::fit::Monitor;
use crate::loader::LoaderConfig;
use crate::noise_scheduler::NoiseSchedulerConfig;
use crate::trainer::TrainerConfig;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory holding the csv file, image paths are relative to it.
    pub data_dir: String,
    pub csv_name: String,
    pub image_column: String,
    pub caption_column: String,
    /// The CLIP BPE vocabulary file.
    pub vocab_file: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: "dataset".to_string(),
            csv_name: "data_1.csv".to_string(),
            image_column: "image".to_string(),
            caption_column: "caption".to_string(),
            vocab_file: "data/bpe_simple_vocab_16e6.txt".to_string(),
        }
    }
}

/// Where to find the pretrained weights, a local file takes precedence over
/// the hub repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightsConfig {
    pub repo: String,
    pub clip_weights: Option<String>,
    pub vae_weights: Option<String>,
    pub unet_weights: Option<String>,
    pub sliced_attention_size: Option<i64>,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            repo: crate::weights::DEFAULT_REPO.to_string(),
            clip_weights: None,
            vae_weights: None,
            unet_weights: None,
            sliced_attention_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Side of the square training images, in pixels.
    pub resolution: u32,
    pub random_flip: bool,
    /// Flips the validation images as well, so that the validation loss is
    /// measured on the same distribution as the training loss.
    pub val_random_flip: bool,
    /// Share of the records held out for validation.
    pub test_fraction: f64,
    pub split_seed: u64,
    /// Seeds the shuffling, the flips, the timesteps and the noise.
    pub seed: u64,
    /// Defaults to ten batches.
    pub shuffle_buffer: Option<usize>,
    pub prefetch: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            batch_size: 6,
            resolution: 256,
            random_flip: true,
            val_random_flip: true,
            test_fraction: 0.1,
            split_seed: 42,
            seed: 42,
            shuffle_buffer: None,
            prefetch: 2,
        }
    }
}

impl TrainingConfig {
    /// The loader settings of the training split.
    pub fn loader_config(&self, seed: u64) -> LoaderConfig {
        let mut config = LoaderConfig::new(self.batch_size, self.resolution, seed);
        if let Some(shuffle_buffer) = self.shuffle_buffer {
            config.shuffle_buffer = shuffle_buffer
        }
        config.prefetch = self.prefetch;
        config.random_flip = self.random_flip;
        config
    }

    pub fn val_loader_config(&self, seed: u64) -> LoaderConfig {
        LoaderConfig { random_flip: self.val_random_flip, ..self.loader_config(seed) }
    }

    /// Seeds of the training and validation loaders, drawn from a generator
    /// seeded with `seed` so that the two loaders never share a stream.
    pub fn loader_seeds(&self) -> (u64, u64) {
        let mut rng = StdRng::seed_from_u64(self.seed);
        (rng.gen(), rng.gen())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Where the fine-tuned UNet weights are written, `{epoch}` gets
    /// replaced by the epoch number.
    pub checkpoint: String,
    pub monitor: Monitor,
    pub save_best_only: bool,
    pub metrics: String,
    pub loss_curve: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            checkpoint: "checkpoints/finetuned_riffusion_itt_s20.safetensors".to_string(),
            monitor: Monitor::ValLoss,
            save_best_only: false,
            metrics: "logs/fit/metrics.csv".to_string(),
            loss_curve: "loss_curve.png".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinetuneConfig {
    pub data: DataConfig,
    pub weights: WeightsConfig,
    pub training: TrainingConfig,
    pub trainer: TrainerConfig,
    pub noise_scheduler: NoiseSchedulerConfig,
    pub output: OutputConfig,
}

impl FinetuneConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path.as_ref()).map_err(|e| {
            let context = format!("error reading {:?}", path.as_ref().to_string_lossy());
            anyhow::Error::new(e).context(context)
        })?;
        let cfg: FinetuneConfig = toml::from_str(&file)?;
        Ok(cfg)
    }

    /// Checks the values that would otherwise only fail deep into a run.
    pub fn validate(&self) -> anyhow::Result<()> {
        let training = &self.training;
        if training.epochs == 0 {
            anyhow::bail!("epochs must be positive")
        }
        if training.batch_size == 0 {
            anyhow::bail!("batch_size must be positive")
        }
        if training.resolution == 0 || training.resolution % 8 != 0 {
            anyhow::bail!("resolution must be a positive multiple of 8, got {}", training.resolution)
        }
        if !(training.test_fraction > 0. && training.test_fraction < 1.) {
            anyhow::bail!("test_fraction must be in (0, 1), got {}", training.test_fraction)
        }
        if training.prefetch == 0 {
            anyhow::bail!("prefetch must be positive")
        }
        let trainer = &self.trainer;
        if !(trainer.learning_rate > 0.) {
            anyhow::bail!("learning_rate must be positive, got {}", trainer.learning_rate)
        }
        if !(trainer.max_grad_norm > 0.) {
            anyhow::bail!("max_grad_norm must be positive, got {}", trainer.max_grad_norm)
        }
        let scheduler = &self.noise_scheduler;
        if scheduler.train_timesteps == 0 {
            anyhow::bail!("train_timesteps must be positive")
        }
        if !(0. < scheduler.beta_start && scheduler.beta_start <= scheduler.beta_end) {
            anyhow::bail!(
                "invalid beta range [{}, {}]",
                scheduler.beta_start,
                scheduler.beta_end
            )
        }
        Ok(())
    }
}
