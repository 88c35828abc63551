//! Frozen CLIP text encoder used to precompute the prompt conditioning.
use crate::models::{FrozenModel, StableDiffusionConfig};
use diffusers::transformers::clip;
use std::path::Path;
use tch::{nn::Module, Device, Tensor};

#[derive(Debug)]
pub struct TextEncoder {
    clip: FrozenModel<clip::ClipTextTransformer>,
}

impl TextEncoder {
    pub fn new<P: AsRef<Path>>(
        config: &StableDiffusionConfig,
        clip_weights: P,
        device: Device,
    ) -> anyhow::Result<Self> {
        tracing::info!("building the clip transformer on {device:?}");
        let clip = config.build_clip_transformer(clip_weights, device)?;
        Ok(Self { clip })
    }
}

impl Module for TextEncoder {
    /// Maps `[batch, 77]` token ids to `[batch, 77, hidden]` embeddings.
    fn forward(&self, tokens: &Tensor) -> Tensor {
        let tokens = tokens.to(self.clip.device());
        tch::no_grad(|| tokens.apply(&self.clip.model))
    }
}
