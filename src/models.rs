//! # Pretrained models
//!
//! Riffusion shares the Stable Diffusion v1.5 architecture: a CLIP ViT-L/14
//! text encoder, a KL auto-encoder with 4 latent channels and a conditional
//! 2D UNet. Only the UNet is trained, the other two models live in frozen
//! variable stores.
use diffusers::models::{unet_2d, vae};
use diffusers::transformers::clip;
use std::path::Path;
use tch::{nn, Device};

/// Latents are scaled by this factor so that they have roughly unit variance.
/// https://huggingface.co/runwayml/stable-diffusion-v1-5/blob/main/vae/config.json
pub const VAE_SCALING_FACTOR: f64 = 0.18215;

#[derive(Clone, Debug)]
pub struct StableDiffusionConfig {
    pub clip: clip::Config,
    pub autoencoder: vae::AutoEncoderKLConfig,
    pub unet: unet_2d::UNet2DConditionModelConfig,
}

impl StableDiffusionConfig {
    pub fn v1_5(sliced_attention_size: Option<i64>) -> Self {
        let bc = |out_channels, use_cross_attn, attention_head_dim| unet_2d::BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim,
        };
        // https://huggingface.co/riffusion/riffusion-model-v1/blob/main/unet/config.json
        let unet = unet_2d::UNet2DConditionModelConfig {
            blocks: vec![bc(320, true, 8), bc(640, true, 8), bc(1280, true, 8), bc(1280, false, 8)],
            center_input_sample: false,
            cross_attention_dim: 768,
            downsample_padding: 1,
            flip_sin_to_cos: true,
            freq_shift: 0.,
            layers_per_block: 2,
            mid_block_scale_factor: 1.,
            norm_eps: 1e-5,
            norm_num_groups: 32,
            sliced_attention_size,
            use_linear_projection: false,
        };
        let autoencoder = vae::AutoEncoderKLConfig {
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            latent_channels: 4,
            norm_num_groups: 32,
        };
        Self { clip: clip::Config::v1_5(), autoencoder, unet }
    }

    /// The spatial down-sampling factor between images and latents.
    pub fn vae_scale_factor(&self) -> i64 {
        1 << (self.autoencoder.block_out_channels.len() - 1)
    }

    pub fn latent_channels(&self) -> i64 {
        self.autoencoder.latent_channels
    }

    pub fn build_vae<P: AsRef<Path>>(
        &self,
        vae_weights: P,
        device: Device,
    ) -> anyhow::Result<FrozenModel<vae::AutoEncoderKL>> {
        let mut vs = nn::VarStore::new(device);
        let autoencoder = vae::AutoEncoderKL::new(vs.root(), 3, 3, self.autoencoder.clone());
        load_weights(&mut vs, vae_weights)?;
        Ok(FrozenModel::new(autoencoder, vs))
    }

    /// Builds the UNet, its variables stay trainable.
    pub fn build_unet<P: AsRef<Path>>(
        &self,
        unet_weights: P,
        device: Device,
    ) -> anyhow::Result<(unet_2d::UNet2DConditionModel, nn::VarStore)> {
        let mut vs = nn::VarStore::new(device);
        let latent_channels = self.latent_channels();
        let unet = unet_2d::UNet2DConditionModel::new(
            vs.root(),
            latent_channels,
            latent_channels,
            self.unet.clone(),
        );
        load_weights(&mut vs, unet_weights)?;
        Ok((unet, vs))
    }

    pub fn build_clip_transformer<P: AsRef<Path>>(
        &self,
        clip_weights: P,
        device: Device,
    ) -> anyhow::Result<FrozenModel<clip::ClipTextTransformer>> {
        let mut vs = nn::VarStore::new(device);
        let text_model = clip::ClipTextTransformer::new(vs.root(), &self.clip);
        load_weights(&mut vs, clip_weights)?;
        Ok(FrozenModel::new(text_model, vs))
    }
}

/// A model whose variables do not require gradients.
#[derive(Debug)]
pub struct FrozenModel<M> {
    pub model: M,
    vs: nn::VarStore,
}

impl<M> FrozenModel<M> {
    /// Wraps a model built in `vs`, freezing its variables.
    pub fn new(model: M, mut vs: nn::VarStore) -> Self {
        vs.freeze();
        Self { model, vs }
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn is_frozen(&self) -> bool {
        self.vs.trainable_variables().iter().all(|v| !v.requires_grad())
    }
}

fn load_weights<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    tracing::info!("loading {} variables from {:?}", vs.len(), path.to_string_lossy());
    vs.load(path).map_err(|e| {
        anyhow::Error::new(e).context(format!("error loading {:?}", path.to_string_lossy()))
    })
}
