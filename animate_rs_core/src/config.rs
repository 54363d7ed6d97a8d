use std::{env, path::PathBuf, time::Duration};

use crate::pipelines::{DevicePreference, SchedulerKind};
use crate::tokens::TokenSource;

pub const BASE_SUBDIR: &str = "sd_base";
pub const ADAPTER_SUBDIR: &str = "ad_lightning";

const DEFAULT_BASE_REPO: &str = "runwayml/stable-diffusion-v1-5";
const DEFAULT_ADAPTER_REPO: &str = "ByteDance/AnimateDiff-Lightning";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

/// Process-wide settings, read once from the environment with baked-in
/// defaults. Every knob is overridable without rebuilding.
#[derive(Debug, Clone)]
pub struct Settings {
    pub models_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub inputs_dir: PathBuf,
    pub base_repo: String,
    pub adapter_repo: String,
    pub token: TokenSource,
    pub max_retries: usize,
    pub retry_wait: Duration,
    pub bind_addr: String,
    pub scheduler: SchedulerKind,
    pub device: DevicePreference,
    pub vae_slicing: bool,
    pub flash_attention: bool,
    pub latent_correlation: f64,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let token = match lookup("HF_TOKEN_SOURCE") {
            Some(spec) => spec.parse().unwrap_or(TokenSource::CacheToken),
            None if lookup("HF_TOKEN").is_some() => TokenSource::EnvVar("HF_TOKEN".to_string()),
            None => TokenSource::CacheToken,
        };

        Self {
            models_dir: PathBuf::from(get("MODELS_DIR", "models")),
            outputs_dir: PathBuf::from(get("OUTPUTS_DIR", "outputs")),
            inputs_dir: PathBuf::from(get("INPUTS_DIR", "inputs")),
            base_repo: get("BASE_REPO", DEFAULT_BASE_REPO),
            adapter_repo: get("ADAPTER_REPO", DEFAULT_ADAPTER_REPO),
            token,
            max_retries: get("FETCH_MAX_RETRIES", "3").parse().unwrap_or(3),
            retry_wait: Duration::from_secs(
                get("FETCH_RETRY_WAIT_SECS", "10").parse().unwrap_or(10),
            ),
            bind_addr: get("BIND_ADDR", DEFAULT_BIND_ADDR),
            scheduler: get("SCHEDULER", "ddim").parse().unwrap_or_default(),
            device: get("DEVICE", "auto").parse().unwrap_or_default(),
            vae_slicing: get("VAE_SLICING", "true").parse().unwrap_or(true),
            flash_attention: get("FLASH_ATTENTION", "false").parse().unwrap_or(false),
            latent_correlation: get("LATENT_CORRELATION", "0.85").parse().unwrap_or(0.85),
        }
    }

    pub fn base_dir(&self) -> PathBuf {
        self.models_dir.join(BASE_SUBDIR)
    }

    pub fn adapter_dir(&self) -> PathBuf {
        self.models_dir.join(ADAPTER_SUBDIR)
    }

    /// The typed pipeline configuration, built in memory and handed straight
    /// to the loader.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            base_dir: self.base_dir(),
            adapter_dir: self.adapter_dir(),
            scheduler: self.scheduler,
            device: self.device,
            vae_slicing: self.vae_slicing,
            flash_attention: self.flash_attention,
            latent_correlation: self.latent_correlation.clamp(0.0, 0.99),
        }
    }
}

/// Everything the pipeline loader needs. Set once, immutable afterwards.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub base_dir: PathBuf,
    pub adapter_dir: PathBuf,
    pub scheduler: SchedulerKind,
    pub device: DevicePreference,
    pub vae_slicing: bool,
    pub flash_attention: bool,
    /// Share of a common base noise mixed into every frame's initial latent,
    /// in `[0, 1)`. Higher values yield smoother motion.
    pub latent_correlation: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_baked_in() {
        let settings = Settings::from_lookup(|_| None);
        assert_eq!(settings.models_dir, PathBuf::from("models"));
        assert_eq!(settings.base_repo, DEFAULT_BASE_REPO);
        assert_eq!(settings.adapter_repo, DEFAULT_ADAPTER_REPO);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.retry_wait, Duration::from_secs(10));
        assert_eq!(settings.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(settings.scheduler, SchedulerKind::Ddim);
        assert_eq!(settings.device, DevicePreference::Auto);
        assert!(settings.vae_slicing);
        assert!(!settings.flash_attention);
        assert!(matches!(settings.token, TokenSource::CacheToken));
    }

    #[test]
    fn environment_overrides_take_effect() {
        let settings = Settings::from_lookup(|key| match key {
            "MODELS_DIR" => Some("/srv/models".to_string()),
            "BASE_REPO" => Some("emilianJR/epiCRealism".to_string()),
            "FETCH_MAX_RETRIES" => Some("5".to_string()),
            "SCHEDULER" => Some("euler-ancestral".to_string()),
            "DEVICE" => Some("cpu".to_string()),
            "HF_TOKEN" => Some("hf_secret".to_string()),
            _ => None,
        });
        assert_eq!(settings.models_dir, PathBuf::from("/srv/models"));
        assert_eq!(settings.base_repo, "emilianJR/epiCRealism");
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.scheduler, SchedulerKind::EulerAncestral);
        assert_eq!(settings.device, DevicePreference::Cpu);
        assert!(matches!(settings.token, TokenSource::EnvVar(ref v) if v == "HF_TOKEN"));
    }

    #[test]
    fn pipeline_config_points_into_models_dir() {
        let settings = Settings::from_lookup(|key| match key {
            "MODELS_DIR" => Some("/app/models".to_string()),
            _ => None,
        });
        let config = settings.pipeline_config();
        assert_eq!(config.base_dir, PathBuf::from("/app/models/sd_base"));
        assert_eq!(config.adapter_dir, PathBuf::from("/app/models/ad_lightning"));
    }

    #[test]
    fn malformed_numeric_overrides_fall_back() {
        let settings = Settings::from_lookup(|key| match key {
            "FETCH_MAX_RETRIES" => Some("lots".to_string()),
            "LATENT_CORRELATION" => Some("very".to_string()),
            _ => None,
        });
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.latent_correlation, 0.85);
    }
}
