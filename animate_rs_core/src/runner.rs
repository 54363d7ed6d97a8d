use std::{path::PathBuf, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{PipelineConfig, Settings};
use crate::encode::{encode_frames, OutputFormat};
use crate::pipelines::{PipelineCell, VideoGenerationParams};

/// One generation request, fully resolved: any remote or encoded image input
/// has already been materialized to a local file.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    /// Local path of the seed image, when one was supplied.
    pub image: Option<PathBuf>,
    pub width: usize,
    pub height: usize,
    pub num_frames: usize,
    pub fps: u16,
    /// Denoising steps; `None` defers to the loaded checkpoint's default.
    pub num_steps: Option<usize>,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
    pub format: OutputFormat,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: None,
            negative_prompt: None,
            image: None,
            width: 512,
            height: 512,
            num_frames: 16,
            fps: 8,
            num_steps: None,
            guidance_scale: 1.0,
            seed: None,
            format: OutputFormat::Gif,
        }
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("either a prompt or a seed image is required")]
    MissingSource,
    #[error("width and height must be nonzero multiples of 8, got {width}x{height}")]
    BadDimensions { width: usize, height: usize },
    #[error("frame count must be nonzero")]
    ZeroFrames,
    #[error("frame rate must be nonzero")]
    ZeroRate,
    #[error("step count must be nonzero")]
    ZeroSteps,
}

impl GenerationRequest {
    pub fn validate(&self) -> Result<(), RequestError> {
        let has_prompt = self
            .prompt
            .as_deref()
            .map(|p| !p.trim().is_empty())
            .unwrap_or(false);
        if !has_prompt && self.image.is_none() {
            return Err(RequestError::MissingSource);
        }
        if self.width == 0 || self.height == 0 || self.width % 8 != 0 || self.height % 8 != 0 {
            return Err(RequestError::BadDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.num_frames == 0 {
            return Err(RequestError::ZeroFrames);
        }
        if self.fps == 0 {
            return Err(RequestError::ZeroRate);
        }
        if self.num_steps == Some(0) {
            return Err(RequestError::ZeroSteps);
        }
        Ok(())
    }
}

/// The one result shape every caller sees: an output path on success, a
/// human-readable reason on failure, never both.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub output: Option<PathBuf>,
    pub error: Option<String>,
}

impl GenerationOutcome {
    pub fn success(output: PathBuf) -> Self {
        Self {
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            output: None,
            error: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.output.is_some()
    }
}

/// Runs generations against the shared pipeline. Every engine failure is
/// captured into the outcome; nothing escapes to the caller.
pub struct Runner {
    cell: Arc<PipelineCell>,
    config: PipelineConfig,
    outputs_dir: PathBuf,
}

impl Runner {
    pub fn new(settings: &Settings, cell: Arc<PipelineCell>) -> Self {
        Self {
            cell,
            config: settings.pipeline_config(),
            outputs_dir: settings.outputs_dir.clone(),
        }
    }

    pub fn run(&self, request: &GenerationRequest) -> GenerationOutcome {
        if let Err(err) = request.validate() {
            return GenerationOutcome::failure(err.to_string());
        }
        match self.generate(request) {
            Ok(path) => GenerationOutcome::success(path),
            Err(err) => {
                error!("generation failed: {err:#}");
                GenerationOutcome::failure(format!("{err:#}"))
            }
        }
    }

    fn generate(&self, request: &GenerationRequest) -> Result<PathBuf> {
        let pipeline = self.cell.get_or_load(&self.config)?;

        let seed_image = request
            .image
            .as_ref()
            .map(|path| {
                image::open(path)
                    .with_context(|| format!("failed to read seed image {}", path.display()))
            })
            .transpose()?;

        let params = VideoGenerationParams {
            width: request.width,
            height: request.height,
            num_frames: request.num_frames,
            num_steps: request
                .num_steps
                .unwrap_or_else(|| pipeline.default_steps()),
            guidance_scale: request.guidance_scale,
            seed: request.seed,
        };
        info!(
            "starting generation: {}x{} frames={} fps={} steps={} guidance={}",
            params.width,
            params.height,
            params.num_frames,
            request.fps,
            params.num_steps,
            params.guidance_scale,
        );

        let start = Instant::now();
        let frames = pipeline.forward(
            request.prompt.as_deref().unwrap_or(""),
            request.negative_prompt.as_deref().unwrap_or(""),
            seed_image.as_ref(),
            &params,
        )?;
        info!(
            "pipeline forward took {:.2}s",
            start.elapsed().as_secs_f32()
        );

        let output = self
            .outputs_dir
            .join(format!("{}.{}", Uuid::new_v4(), request.format.extension()));
        encode_frames(&frames, request.fps, request.format, &output)?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_in(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::from_env();
        settings.models_dir = dir.join("models");
        settings.outputs_dir = dir.join("outputs");
        settings.inputs_dir = dir.join("inputs");
        settings
    }

    #[test]
    fn validation_rejects_missing_sources() {
        let request = GenerationRequest::default();
        assert!(matches!(
            request.validate(),
            Err(RequestError::MissingSource)
        ));

        let blank = GenerationRequest {
            prompt: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(matches!(blank.validate(), Err(RequestError::MissingSource)));
    }

    #[test]
    fn validation_checks_dimensions_and_rates() {
        let request = GenerationRequest {
            prompt: Some("a robot".to_string()),
            width: 500,
            ..Default::default()
        };
        assert!(matches!(
            request.validate(),
            Err(RequestError::BadDimensions { .. })
        ));

        let request = GenerationRequest {
            prompt: Some("a robot".to_string()),
            num_frames: 0,
            ..Default::default()
        };
        assert!(matches!(request.validate(), Err(RequestError::ZeroFrames)));

        let request = GenerationRequest {
            prompt: Some("a robot".to_string()),
            fps: 0,
            ..Default::default()
        };
        assert!(matches!(request.validate(), Err(RequestError::ZeroRate)));
    }

    #[test]
    fn invalid_requests_never_touch_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let cell = Arc::new(PipelineCell::new());
        let runner = Runner::new(&settings_in(dir.path()), cell.clone());

        let outcome = runner.run(&GenerationRequest::default());
        assert!(!outcome.is_success());
        assert!(outcome.error.unwrap().contains("prompt"));
        assert!(cell.get().is_none());
    }

    #[test]
    fn engine_failures_become_outcomes_not_panics() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        let runner = Runner::new(&settings, Arc::new(PipelineCell::new()));

        // No model weights exist under the temp dir, so the pipeline load
        // fails; the failure must surface as a structured outcome.
        let outcome = runner.run(&GenerationRequest {
            prompt: Some("a rusty robot".to_string()),
            ..Default::default()
        });
        assert!(!outcome.is_success());
        assert!(outcome.output.is_none());
        assert!(outcome.error.is_some());

        // And no partial artifact may be left behind.
        let leftovers = std::fs::read_dir(&settings.outputs_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }
}
