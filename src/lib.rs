//! # Riffusion fine-tuning
//!
//! Fine-tunes the UNet of a pretrained [Riffusion](https://huggingface.co/riffusion/riffusion-model-v1)
//! model on captioned spectrogram images, using Torch via [tch-rs](https://github.com/LaurentMazare/tch-rs)
//! and the model implementations of the [diffusers](https://github.com/LaurentMazare/diffusers-rs) crate.
//!
//! This library includes:
//! - A data pipeline: caption metadata, CLIP tokenization, image augmentation
//!   and a prefetching batch loader.
//! - The forward diffusion process and the noise prediction training step.
//! - An epoch loop with checkpointing, metrics logging and a loss curve.
//!
//! The text encoder and the auto-encoder stay frozen, only the UNet weights
//! are updated and saved.

pub mod augment;
pub mod config;
pub mod dataset;
pub mod fit;
pub mod loader;
pub mod metadata;
pub mod models;
pub mod noise_scheduler;
pub mod plot;
pub mod text_encoder;
pub mod trainer;
pub mod utils;
pub mod weights;
