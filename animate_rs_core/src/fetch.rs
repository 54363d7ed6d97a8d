use std::{
    cmp::Reverse,
    fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use hf_hub::{
    api::sync::{Api, ApiBuilder, ApiError, ApiRepo},
    Repo, RepoType,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ADAPTER_SUBDIR, BASE_SUBDIR};
use crate::tokens::{get_token, TokenSource};

/// Repository holding the tokenizer file the CLIP text encoder needs; the
/// diffusers layout ships vocab/merges only.
pub const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

/// Descriptor file name expected next to the motion-adapter weight.
pub const ADAPTER_DESCRIPTOR: &str = "config.json";

const BASE_COMPONENT_DIRS: &[&str] = &[
    "feature_extractor",
    "scheduler",
    "text_encoder",
    "tokenizer",
    "unet",
    "vae",
];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("preflight for `{repo}` failed: {source}")]
    Preflight { repo: String, source: ApiError },
    #[error("`{what}` failed with a non-retryable hub error: {source}")]
    Permanent { what: String, source: ApiError },
    #[error("`{what}` still failing after {attempts} attempts: {source}")]
    RetriesExhausted {
        what: String,
        attempts: usize,
        source: ApiError,
    },
    #[error("model directory `{dir}` is missing required components: {missing:?}")]
    MissingComponents { dir: PathBuf, missing: Vec<String> },
    #[error("no motion-adapter weight candidates found in `{0}`")]
    NoAdapterWeights(PathBuf),
    #[error("descriptor in `{dir}` references missing weight file `{weight}`")]
    DanglingDescriptor { dir: PathBuf, weight: String },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Minimal descriptor telling the loader which weight file belongs to the
/// motion adapter. Synthesized after download when the hub artifact ships
/// without one.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AdapterDescriptor {
    #[serde(rename = "_class_name")]
    pub class_name: String,
    pub weight_file: String,
}

/// Downloads model artifacts from the Hugging Face hub into the fixed local
/// layout, retrying transient failures with bounded backoff.
pub struct ModelFetcher {
    api: Api,
    max_retries: usize,
    retry_wait: Duration,
    silent: bool,
}

impl ModelFetcher {
    pub fn new(
        token: &TokenSource,
        max_retries: usize,
        retry_wait: Duration,
        silent: bool,
    ) -> anyhow::Result<Self> {
        let api = ApiBuilder::new()
            .with_progress(!silent)
            .with_token(get_token(token)?)
            .build()?;
        Ok(Self {
            api,
            max_retries: max_retries.max(1),
            retry_wait,
            silent,
        })
    }

    fn repo(&self, repo_id: &str) -> ApiRepo {
        self.api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            "main".to_string(),
        ))
    }

    /// Resolves a single known-present file so token, permission and 404
    /// problems surface before the bulk download starts.
    pub fn preflight(&self, repo_id: &str, file: &str) -> Result<(), FetchError> {
        match self.repo(repo_id).get(file) {
            Ok(path) => {
                debug!("preflight ok: {repo_id}:{file} -> {}", path.display());
                Ok(())
            }
            Err(source) => Err(FetchError::Preflight {
                repo: repo_id.to_string(),
                source,
            }),
        }
    }

    /// Downloads the base-model components into `<models>/sd_base/`.
    pub fn fetch_base(&self, repo_id: &str, models_dir: &Path) -> Result<(), FetchError> {
        let target = models_dir.join(BASE_SUBDIR);
        let files = self.list_files(repo_id)?;
        let wanted: Vec<String> = files.into_iter().filter(|f| wanted_base_file(f)).collect();
        info!(
            "fetching {} base files from {repo_id} into {}",
            wanted.len(),
            target.display()
        );
        self.pull(repo_id, &wanted, &target)?;
        self.fetch_clip_tokenizer(&target)?;
        Ok(())
    }

    /// Downloads the motion-adapter artifacts into `<models>/ad_lightning/`
    /// and makes sure a descriptor exists afterwards.
    pub fn fetch_adapter(&self, repo_id: &str, models_dir: &Path) -> Result<PathBuf, FetchError> {
        let target = models_dir.join(ADAPTER_SUBDIR);
        let files = self.list_files(repo_id)?;
        let wanted: Vec<String> = files
            .into_iter()
            .filter(|f| wanted_adapter_file(f))
            .collect();
        info!(
            "fetching {} adapter files from {repo_id} into {}",
            wanted.len(),
            target.display()
        );
        self.pull(repo_id, &wanted, &target)?;
        ensure_descriptor(&target)
    }

    /// The SD v1.5 layout has no `tokenizer.json`; fetch the matching CLIP
    /// tokenizer separately.
    fn fetch_clip_tokenizer(&self, base_dir: &Path) -> Result<(), FetchError> {
        let dst = base_dir.join("tokenizer").join("tokenizer.json");
        if is_present(&dst) {
            debug!("tokenizer already present at {}", dst.display());
            return Ok(());
        }
        let src = self.with_retry(&format!("{CLIP_TOKENIZER_REPO}:tokenizer.json"), || {
            self.repo(CLIP_TOKENIZER_REPO).get("tokenizer.json")
        })?;
        install(&src, &dst)?;
        Ok(())
    }

    fn list_files(&self, repo_id: &str) -> Result<Vec<String>, FetchError> {
        let info = self.with_retry(&format!("list files of {repo_id}"), || {
            self.repo(repo_id).info()
        })?;
        Ok(info
            .siblings
            .into_iter()
            .map(|sibling| sibling.rfilename)
            .collect())
    }

    fn pull(&self, repo_id: &str, files: &[String], target: &Path) -> Result<(), FetchError> {
        fs::create_dir_all(target)?;
        let bar = if self.silent {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new(files.len() as u64);
            bar.set_style(
                ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar.set_message(repo_id.to_string());
            bar
        };
        for file in files {
            let dst = target.join(file);
            if is_present(&dst) {
                debug!("skipping `{file}`, already present");
                bar.inc(1);
                continue;
            }
            let src = self.with_retry(&format!("{repo_id}:{file}"), || {
                self.repo(repo_id).get(file)
            })?;
            install(&src, &dst)?;
            bar.inc(1);
        }
        bar.finish_and_clear();
        Ok(())
    }

    fn with_retry<T>(
        &self,
        what: &str,
        operation: impl Fn() -> Result<T, ApiError>,
    ) -> Result<T, FetchError> {
        let mut last = None;
        for attempt in 1..=self.max_retries {
            match operation() {
                Ok(value) => return Ok(value),
                Err(source) if is_permanent(&source) => {
                    return Err(FetchError::Permanent {
                        what: what.to_string(),
                        source,
                    })
                }
                Err(source) => {
                    warn!("`{what}` failed (try {attempt}/{}): {source}", self.max_retries);
                    last = Some(source);
                    if attempt < self.max_retries {
                        thread::sleep(self.retry_wait * attempt as u32);
                    }
                }
            }
        }
        Err(FetchError::RetriesExhausted {
            what: what.to_string(),
            attempts: self.max_retries,
            source: last.expect("at least one attempt was made"),
        })
    }
}

/// Permission and not-found responses will not get better on retry.
fn is_permanent(err: &ApiError) -> bool {
    let msg = err.to_string();
    ["status code 401", "status code 403", "status code 404"]
        .iter()
        .any(|needle| msg.contains(needle))
}

fn wanted_base_file(name: &str) -> bool {
    if name == "model_index.json" {
        return true;
    }
    let in_component = BASE_COMPONENT_DIRS
        .iter()
        .any(|dir| name.starts_with(&format!("{dir}/")));
    in_component
        && (name.ends_with(".json") || name.ends_with(".txt") || name.ends_with(".safetensors"))
}

fn wanted_adapter_file(name: &str) -> bool {
    if name.ends_with(".json") && !name.contains('/') {
        return true;
    }
    name.ends_with(".safetensors") && name.to_ascii_lowercase().contains("diffusers")
}

fn is_present(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn install(src: &Path, dst: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)?;
    Ok(())
}

/// Ensures the adapter directory carries a descriptor; when absent, the best
/// weight candidate is chosen by keyword scoring and a minimal descriptor is
/// synthesized referencing exactly that file.
pub fn ensure_descriptor(adapter_dir: &Path) -> Result<PathBuf, FetchError> {
    let descriptor_path = adapter_dir.join(ADAPTER_DESCRIPTOR);
    if descriptor_path.exists() {
        let descriptor: AdapterDescriptor =
            serde_json::from_str(&fs::read_to_string(&descriptor_path)?)?;
        if !adapter_dir.join(&descriptor.weight_file).exists() {
            return Err(FetchError::DanglingDescriptor {
                dir: adapter_dir.to_path_buf(),
                weight: descriptor.weight_file,
            });
        }
        return Ok(descriptor_path);
    }

    let mut candidates: Vec<String> = fs::read_dir(adapter_dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(".safetensors"))
        .collect();
    if candidates.is_empty() {
        return Err(FetchError::NoAdapterWeights(adapter_dir.to_path_buf()));
    }
    candidates.sort_by_key(|name| (Reverse(score_variant(name)), name.clone()));
    let chosen = candidates.remove(0);
    info!("synthesizing adapter descriptor for `{chosen}`");

    let descriptor = AdapterDescriptor {
        class_name: "MotionAdapter".to_string(),
        weight_file: chosen,
    };
    fs::write(
        &descriptor_path,
        serde_json::to_string_pretty(&descriptor)?,
    )?;
    Ok(descriptor_path)
}

/// Keyword scoring over candidate weight names: diffusers-format checkpoints
/// beat UI-specific exports, and fewer distillation steps rank higher.
fn score_variant(name: &str) -> i64 {
    let lower = name.to_ascii_lowercase();
    let mut score = 0;
    if lower.contains("diffusers") {
        score += 40;
    }
    if lower.contains("lightning") {
        score += 10;
    }
    if lower.contains("comfyui") {
        score -= 40;
    }
    if let Some(steps) = lightning_steps(&lower) {
        score += 20 - steps.min(20) as i64;
    }
    score
}

/// Parses the distillation step count out of names like
/// `animatediff_lightning_4step_diffusers.safetensors`.
pub(crate) fn lightning_steps(name: &str) -> Option<usize> {
    let lower = name.to_ascii_lowercase();
    let idx = lower.find("step")?;
    let digits: Vec<char> = lower[..idx]
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.into_iter().rev().collect::<String>().parse().ok()
}

/// Checks that every component the pipeline needs exists on disk. The missing
/// list names everything at once so one fetch pass can repair it all.
pub fn verify_layout(models_dir: &Path) -> Result<(), FetchError> {
    let base = models_dir.join(BASE_SUBDIR);
    let adapter = models_dir.join(ADAPTER_SUBDIR);
    let mut missing = Vec::new();

    for required in [
        "model_index.json",
        "tokenizer/tokenizer.json",
        "scheduler/scheduler_config.json",
    ] {
        if !base.join(required).exists() {
            missing.push(format!("{BASE_SUBDIR}/{required}"));
        }
    }
    for (dir, stem) in [
        ("text_encoder", "model"),
        ("unet", "diffusion_pytorch_model"),
        ("vae", "diffusion_pytorch_model"),
    ] {
        let fp32 = base.join(dir).join(format!("{stem}.safetensors"));
        let fp16 = base.join(dir).join(format!("{stem}.fp16.safetensors"));
        if !fp32.exists() && !fp16.exists() {
            missing.push(format!("{BASE_SUBDIR}/{dir}/{stem}.safetensors"));
        }
    }

    let descriptor_path = adapter.join(ADAPTER_DESCRIPTOR);
    if !descriptor_path.exists() {
        missing.push(format!("{ADAPTER_SUBDIR}/{ADAPTER_DESCRIPTOR}"));
    } else {
        let descriptor: AdapterDescriptor =
            serde_json::from_str(&fs::read_to_string(&descriptor_path)?)?;
        if !adapter.join(&descriptor.weight_file).exists() {
            return Err(FetchError::DanglingDescriptor {
                dir: adapter,
                weight: descriptor.weight_file,
            });
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(FetchError::MissingComponents {
            dir: models_dir.to_path_buf(),
            missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lightning_step_counts() {
        assert_eq!(
            lightning_steps("animatediff_lightning_4step_diffusers.safetensors"),
            Some(4)
        );
        assert_eq!(
            lightning_steps("animatediff_lightning_8step_comfyui.safetensors"),
            Some(8)
        );
        assert_eq!(lightning_steps("motion_adapter.safetensors"), None);
    }

    #[test]
    fn scoring_prefers_diffusers_low_step_variants() {
        let four = score_variant("animatediff_lightning_4step_diffusers.safetensors");
        let eight = score_variant("animatediff_lightning_8step_diffusers.safetensors");
        let comfy = score_variant("animatediff_lightning_4step_comfyui.safetensors");
        assert!(four > eight);
        assert!(four > comfy);
        assert!(eight > comfy);
    }

    #[test]
    fn base_file_filter_keeps_components_only() {
        assert!(wanted_base_file("model_index.json"));
        assert!(wanted_base_file("unet/diffusion_pytorch_model.safetensors"));
        assert!(wanted_base_file("tokenizer/merges.txt"));
        assert!(!wanted_base_file("unet/diffusion_pytorch_model.bin"));
        assert!(!wanted_base_file("README.md"));
        assert!(!wanted_base_file("safety_checker/model.safetensors"));
    }

    #[test]
    fn synthesizes_descriptor_for_best_candidate() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "animatediff_lightning_8step_diffusers.safetensors",
            "animatediff_lightning_4step_diffusers.safetensors",
            "animatediff_lightning_4step_comfyui.safetensors",
        ] {
            fs::write(dir.path().join(name), b"weights").unwrap();
        }

        let path = ensure_descriptor(dir.path()).unwrap();
        let descriptor: AdapterDescriptor =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(descriptor.class_name, "MotionAdapter");
        assert_eq!(
            descriptor.weight_file,
            "animatediff_lightning_4step_diffusers.safetensors"
        );
    }

    #[test]
    fn descriptor_synthesis_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("animatediff_lightning_4step_diffusers.safetensors"),
            b"weights",
        )
        .unwrap();

        let first = ensure_descriptor(dir.path()).unwrap();
        let before = fs::read_to_string(&first).unwrap();
        let second = ensure_descriptor(dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(before, fs::read_to_string(&second).unwrap());
    }

    #[test]
    fn existing_descriptor_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("custom.safetensors"), b"weights").unwrap();
        let hand_written =
            r#"{ "_class_name": "MotionAdapter", "weight_file": "custom.safetensors" }"#;
        fs::write(dir.path().join(ADAPTER_DESCRIPTOR), hand_written).unwrap();

        ensure_descriptor(dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join(ADAPTER_DESCRIPTOR)).unwrap(),
            hand_written
        );
    }

    #[test]
    fn dangling_descriptor_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(ADAPTER_DESCRIPTOR),
            r#"{ "_class_name": "MotionAdapter", "weight_file": "gone.safetensors" }"#,
        )
        .unwrap();

        assert!(matches!(
            ensure_descriptor(dir.path()),
            Err(FetchError::DanglingDescriptor { .. })
        ));
    }

    #[test]
    fn missing_weights_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ensure_descriptor(dir.path()),
            Err(FetchError::NoAdapterWeights(_))
        ));
    }

    #[test]
    fn verify_layout_names_every_missing_component() {
        let dir = tempfile::tempdir().unwrap();
        let err = verify_layout(dir.path()).unwrap_err();
        match err {
            FetchError::MissingComponents { missing, .. } => {
                assert!(missing.iter().any(|m| m.contains("model_index.json")));
                assert!(missing.iter().any(|m| m.contains("unet")));
                assert!(missing.iter().any(|m| m.contains(ADAPTER_DESCRIPTOR)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
