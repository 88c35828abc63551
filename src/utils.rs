// Small helpers shared by the data pipeline and the binaries.
use std::path::Path;
use tch::Device;

/// Opens a file, adding the problematic path to the error.
pub(crate) fn file_open<P: AsRef<Path>>(path: P) -> anyhow::Result<std::fs::File> {
    std::fs::File::open(path.as_ref()).map_err(|e| {
        let context = format!("error opening {:?}", path.as_ref().to_string_lossy());
        anyhow::Error::new(e).context(context)
    })
}

/// Creates the parent directory of `path` when it does not exist yet.
pub(crate) fn create_parent_dir<P: AsRef<Path>>(path: P) -> anyhow::Result<()> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                let context = format!("error creating {:?}", parent.to_string_lossy());
                anyhow::Error::new(e).context(context)
            })?;
        }
    }
    Ok(())
}

/// Picks a device per model component. Components listed in `cpu`, or all of
/// them when `cpu` contains "all", are placed on the CPU.
pub struct DeviceSetup {
    accelerator_device: Device,
    cpu: Vec<String>,
}

impl DeviceSetup {
    pub fn new(cpu: Vec<String>) -> Self {
        let accelerator_device =
            if tch::utils::has_mps() { Device::Mps } else { Device::cuda_if_available() };
        Self { accelerator_device, cpu }
    }

    pub fn get(&self, name: &str) -> Device {
        if self.cpu.iter().any(|c| c == "all" || c == name) {
            Device::Cpu
        } else {
            self.accelerator_device
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    /// A fresh scratch directory for a single test.
    pub(crate) fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("riffusion-finetune-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    static TORCH_RNG: std::sync::Mutex<()> = std::sync::Mutex::new(());

    /// Serializes the tests that draw from the global torch generator, the
    /// tests of a crate run on concurrent threads.
    pub(crate) fn torch_rng() -> std::sync::MutexGuard<'static, ()> {
        TORCH_RNG.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn cpu_override() {
        let setup = DeviceSetup::new(vec!["vae".to_string()]);
        assert_eq!(setup.get("vae"), Device::Cpu);
        let setup = DeviceSetup::new(vec!["all".to_string()]);
        assert_eq!(setup.get("unet"), Device::Cpu);
        assert_eq!(setup.get("clip"), Device::Cpu);
    }

    #[test]
    fn parent_dir_is_created() {
        let dir = scratch_dir("parent");
        let file = dir.join("a").join("b").join("ckpt.safetensors");
        create_parent_dir(&file).unwrap();
        assert!(dir.join("a").join("b").is_dir());
        create_parent_dir("relative.txt").unwrap();
    }

    #[test]
    fn missing_file_mentions_path() {
        let err = file_open("/definitely/not/here.csv").unwrap_err();
        assert!(format!("{err:#}").contains("here.csv"));
    }
}
