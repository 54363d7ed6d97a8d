mod animatediff;
mod scheduler;

use std::{fs, str::FromStr, sync::Mutex};

use anyhow::Result;
use animatediff::AnimateDiffLoader;
use candle_core::Device;
use image::{DynamicImage, RgbImage};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use tracing::info;

use crate::config::PipelineConfig;

pub use scheduler::SchedulerKind;

/// Generation parameters for one video request.
#[derive(Debug, Clone)]
pub struct VideoGenerationParams {
    pub width: usize,
    pub height: usize,
    pub num_frames: usize,
    /// The number of denoising steps. Lightning-distilled adapters need very
    /// few; the pipeline's default reflects the loaded checkpoint.
    pub num_steps: usize,
    /// Higher guidance scale ties the frames closer to the text prompt at the
    /// expense of visual quality. Values of 1.0 and below disable
    /// classifier-free guidance.
    pub guidance_scale: f64,
    pub seed: Option<u64>,
}

/// Where to place the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Use an accelerator when one is available, otherwise the CPU.
    #[default]
    Auto,
    /// Force CPU execution.
    Cpu,
}

impl DevicePreference {
    pub fn device(&self) -> candle_core::Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Auto => {
                #[cfg(feature = "metal")]
                {
                    Device::new_metal(0)
                }
                #[cfg(not(feature = "metal"))]
                {
                    Device::cuda_if_available(0)
                }
            }
        }
    }
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            other => Err(format!("unknown device preference `{other}`")),
        }
    }
}

pub(crate) trait Loader {
    fn name(&self) -> &'static str;
    /// Files (relative to the base directory) that must exist before loading
    /// is attempted.
    fn required_files(&self) -> Vec<&'static str>;
    fn load(&self, config: &PipelineConfig, device: &Device) -> Result<Box<dyn ModelPipeline>>;
}

pub trait ModelPipeline: Send {
    /// Step count to use when a request does not specify one.
    fn default_steps(&self) -> usize;
    fn forward(
        &mut self,
        prompt: &str,
        negative_prompt: &str,
        seed_image: Option<&DynamicImage>,
        params: &VideoGenerationParams,
    ) -> Result<Vec<RgbImage>>;
}

#[derive(Clone, Debug, Deserialize)]
struct ModelIndex {
    #[serde(rename = "_class_name")]
    name: String,
}

/// The loaded model; one per process, shared across requests.
pub struct Pipeline {
    model: Mutex<Box<dyn ModelPipeline>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Load the model described by `config`. The architecture is picked from
    /// the `_class_name` of the base directory's `model_index.json`.
    pub fn load(config: &PipelineConfig) -> Result<Self> {
        info!("loading pipeline from {}", config.base_dir.display());

        let index_path = config.base_dir.join("model_index.json");
        if !index_path.exists() {
            anyhow::bail!(
                "expected `model_index.json` in {}; run the fetch command first",
                config.base_dir.display()
            );
        }
        let ModelIndex { name } = serde_json::from_str(&fs::read_to_string(&index_path)?)?;

        let loader: Box<dyn Loader> = match name.as_str() {
            "StableDiffusionPipeline" | "AnimateDiffPipeline" => Box::new(AnimateDiffLoader),
            other => anyhow::bail!("unexpected loader type `{other:?}`"),
        };
        info!("model architecture is: {}", loader.name());

        let missing: Vec<&str> = loader
            .required_files()
            .into_iter()
            .filter(|file| !config.base_dir.join(file).exists())
            .collect();
        if !missing.is_empty() {
            anyhow::bail!(
                "base model at {} is missing {missing:?}",
                config.base_dir.display()
            );
        }

        let device = config.device.device()?;
        let model = loader.load(config, &device)?;

        Ok(Self {
            model: Mutex::new(model),
        })
    }

    pub fn default_steps(&self) -> usize {
        self.model
            .lock()
            .map(|model| model.default_steps())
            .unwrap_or(1)
    }

    /// Run one generation. Requests are serialized on the internal lock; each
    /// runs to completion before the next starts.
    pub fn forward(
        &self,
        prompt: &str,
        negative_prompt: &str,
        seed_image: Option<&DynamicImage>,
        params: &VideoGenerationParams,
    ) -> Result<Vec<RgbImage>> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow::anyhow!("pipeline lock poisoned"))?;
        model.forward(prompt, negative_prompt, seed_image, params)
    }
}

/// Process-wide pipeline slot. Initialization happens at most once and is
/// mutex-guarded, so concurrent first calls cannot race; a failed load leaves
/// the cell empty and is retried on the next call.
pub struct PipelineCell {
    cell: OnceCell<Pipeline>,
}

impl PipelineCell {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    pub fn get_or_load(&self, config: &PipelineConfig) -> Result<&Pipeline> {
        self.cell.get_or_try_init(|| Pipeline::load(config))
    }

    pub fn get(&self) -> Option<&Pipeline> {
        self.cell.get()
    }
}

impl Default for PipelineCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config(base_dir: PathBuf, adapter_dir: PathBuf) -> PipelineConfig {
        PipelineConfig {
            base_dir,
            adapter_dir,
            scheduler: SchedulerKind::Ddim,
            device: DevicePreference::Cpu,
            vae_slicing: true,
            flash_attention: false,
            latent_correlation: 0.85,
        }
    }

    #[test]
    fn load_requires_a_model_index() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().join("sd_base"), dir.path().join("ad"));
        let err = Pipeline::load(&config).unwrap_err();
        assert!(err.to_string().contains("model_index.json"));
    }

    #[test]
    fn load_rejects_unknown_architectures() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("sd_base");
        fs::create_dir_all(&base).unwrap();
        fs::write(
            base.join("model_index.json"),
            r#"{ "_class_name": "FluxPipeline" }"#,
        )
        .unwrap();
        let config = test_config(base, dir.path().join("ad"));
        let err = Pipeline::load(&config).unwrap_err();
        assert!(err.to_string().contains("unexpected loader type"));
    }

    #[test]
    fn load_reports_missing_components() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("sd_base");
        fs::create_dir_all(&base).unwrap();
        fs::write(
            base.join("model_index.json"),
            r#"{ "_class_name": "StableDiffusionPipeline" }"#,
        )
        .unwrap();
        let config = test_config(base, dir.path().join("ad"));
        let err = Pipeline::load(&config).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn failed_cell_initialization_is_retried_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().join("sd_base"), dir.path().join("ad"));
        let cell = PipelineCell::new();
        assert!(cell.get_or_load(&config).is_err());
        assert!(cell.get().is_none());
        assert!(cell.get_or_load(&config).is_err());
        assert!(cell.get().is_none());
    }
}
