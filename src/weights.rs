//! Resolution of pretrained weight files, either local or from the hub.
use std::path::PathBuf;

/// The Riffusion v1 checkpoint, a fine-tuned Stable Diffusion v1.5.
pub const DEFAULT_REPO: &str = "riffusion/riffusion-model-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFile {
    Clip,
    Vae,
    Unet,
}

impl ModelFile {
    /// The path of the weight file inside a diffusers style repository.
    pub fn repo_path(&self) -> &'static str {
        match self {
            Self::Clip => "text_encoder/model.safetensors",
            Self::Vae => "vae/diffusion_pytorch_model.safetensors",
            Self::Unet => "unet/diffusion_pytorch_model.safetensors",
        }
    }

    /// Uses `filename` when set, otherwise downloads the file from `repo` (or
    /// reuses the hub cache).
    pub fn get(&self, filename: Option<String>, repo: &str) -> anyhow::Result<PathBuf> {
        use hf_hub::api::sync::Api;
        match filename {
            Some(filename) => Ok(PathBuf::from(filename)),
            None => {
                tracing::info!("fetching {} from {repo}", self.repo_path());
                let filename = Api::new()?.model(repo.to_string()).get(self.repo_path())?;
                Ok(filename)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_files_take_precedence() {
        let path = ModelFile::Unet.get(Some("data/unet.ot".to_string()), DEFAULT_REPO).unwrap();
        assert_eq!(path, PathBuf::from("data/unet.ot"));
    }

    #[test]
    fn repo_layout() {
        assert!(ModelFile::Clip.repo_path().starts_with("text_encoder/"));
        assert!(ModelFile::Vae.repo_path().starts_with("vae/"));
        assert!(ModelFile::Unet.repo_path().starts_with("unet/"));
    }
}
