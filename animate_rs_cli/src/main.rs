use std::{
    fs,
    io::Read,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use animate_rs_core::{
    materialize_input, verify_layout, GenerationRequest, ModelFetcher, OutputFormat, PipelineCell,
    Runner, Settings, TokenSource,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(author, version, about = "animate_rs command line")]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// Hugging Face token. Useful for accessing gated repositories.
    /// By default, $HF_TOKEN or the cached hub token is used.
    #[arg(long)]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Download the base model and motion adapter into the models directory.
    Fetch {
        /// Base model repository, overriding $BASE_REPO.
        #[arg(long)]
        base_repo: Option<String>,

        /// Motion-adapter repository, overriding $ADAPTER_REPO.
        #[arg(long)]
        adapter_repo: Option<String>,

        /// Target directory, overriding $MODELS_DIR.
        #[arg(long)]
        models_dir: Option<PathBuf>,
    },

    /// Generate a clip locally and print the artifact path.
    Generate {
        /// Prompt to use.
        #[arg(short, long)]
        prompt: Option<String>,

        /// Negative prompt.
        #[arg(long)]
        negative_prompt: Option<String>,

        /// Seed image path.
        #[arg(long)]
        image: Option<PathBuf>,

        #[arg(long, default_value_t = 512)]
        width: usize,

        #[arg(long, default_value_t = 512)]
        height: usize,

        /// Number of frames to generate.
        #[arg(long, default_value_t = 16)]
        frames: usize,

        /// Frame rate of the encoded artifact.
        #[arg(long, default_value_t = 8)]
        fps: u16,

        /// Denoising steps; defaults to the loaded checkpoint's step count.
        #[arg(long)]
        steps: Option<usize>,

        /// Guidance scale; 1.0 disables classifier-free guidance.
        #[arg(long, default_value_t = 1.0)]
        guidance: f64,

        /// Seed for deterministic generation.
        #[arg(long)]
        seed: Option<u64>,

        #[arg(long, value_enum, default_value = "gif")]
        format: OutputFormat,

        /// Move the artifact here instead of leaving it in the outputs
        /// directory.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Run one serverless-style job: JSON on stdin (or --input), JSON result
    /// on stdout.
    Job {
        /// Job file; stdin is read when omitted.
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JobInput {
    input: JobParams,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JobParams {
    image_url: Option<String>,
    image_b64: Option<String>,
    prompt: Option<String>,
    negative_prompt: Option<String>,
    width: Option<usize>,
    height: Option<usize>,
    frames: Option<usize>,
    fps: Option<u16>,
    steps: Option<usize>,
    guidance: Option<f64>,
    seed: Option<u64>,
    format: Option<String>,
    output_presigned_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct JobResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    video_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl JobResult {
    fn error(reason: impl Into<String>) -> Self {
        Self {
            video_path: None,
            video_url: None,
            error: Some(reason.into()),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let mut settings = Settings::from_env();
    if let Some(token) = args.token {
        settings.token = TokenSource::Literal(token);
    }

    match args.command {
        Command::Fetch {
            base_repo,
            adapter_repo,
            models_dir,
        } => {
            if let Some(dir) = models_dir {
                settings.models_dir = dir;
            }
            if let Some(repo) = base_repo {
                settings.base_repo = repo;
            }
            if let Some(repo) = adapter_repo {
                settings.adapter_repo = repo;
            }
            run_fetch(&settings)
        }
        Command::Generate {
            prompt,
            negative_prompt,
            image,
            width,
            height,
            frames,
            fps,
            steps,
            guidance,
            seed,
            format,
            out,
        } => run_generate(
            &settings,
            GenerationRequest {
                prompt,
                negative_prompt,
                image,
                width,
                height,
                num_frames: frames,
                fps,
                num_steps: steps,
                guidance_scale: guidance,
                seed,
                format,
            },
            out,
        ),
        Command::Job { input } => run_job(&settings, input),
    }
}

fn run_fetch(settings: &Settings) -> anyhow::Result<()> {
    info!("token source: {}", settings.token);
    info!(
        "fetching {} and {} into {}",
        settings.base_repo,
        settings.adapter_repo,
        settings.models_dir.display()
    );

    let fetcher = ModelFetcher::new(
        &settings.token,
        settings.max_retries,
        settings.retry_wait,
        false,
    )?;

    fetcher.preflight(&settings.base_repo, "model_index.json")?;
    fetcher.preflight(&settings.adapter_repo, ".gitattributes")?;

    fetcher.fetch_base(&settings.base_repo, &settings.models_dir)?;
    fetcher.fetch_adapter(&settings.adapter_repo, &settings.models_dir)?;

    verify_layout(&settings.models_dir)?;
    info!("models ready at {}", settings.models_dir.display());
    Ok(())
}

fn run_generate(
    settings: &Settings,
    request: GenerationRequest,
    out: Option<PathBuf>,
) -> anyhow::Result<()> {
    let runner = Runner::new(settings, Arc::new(PipelineCell::new()));
    let outcome = runner.run(&request);
    let artifact = match outcome.output {
        Some(path) => path,
        None => anyhow::bail!(
            "generation failed: {}",
            outcome.error.unwrap_or_else(|| "unknown".to_string())
        ),
    };

    let final_path = match out {
        Some(out) => {
            if let Some(parent) = out.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            fs::rename(&artifact, &out)
                .with_context(|| format!("failed to move artifact to {}", out.display()))?;
            out
        }
        None => artifact,
    };
    println!("{}", final_path.display());
    Ok(())
}

fn run_job(settings: &Settings, input: Option<PathBuf>) -> anyhow::Result<()> {
    let raw = match input {
        Some(path) => fs::read_to_string(&path)
            .with_context(|| format!("failed to read job file {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };
    let job: JobInput = serde_json::from_str(&raw).context("job input is not valid JSON")?;
    let result = handle_job(settings, job.input);
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

/// The job contract mirrors the HTTP surface: every failure comes back as a
/// result object with an `error` field, never as a crash.
fn handle_job(settings: &Settings, params: JobParams) -> JobResult {
    let Some(source) = params.image_url.as_deref().or(params.image_b64.as_deref()) else {
        return JobResult::error("image_url or image_b64 is required");
    };

    let format = match params.format.as_deref() {
        Some(spec) => match spec.parse::<OutputFormat>() {
            Ok(format) => format,
            Err(reason) => return JobResult::error(reason),
        },
        None => OutputFormat::default(),
    };

    let image = match materialize_input(source, &settings.inputs_dir) {
        Ok(path) => path,
        Err(err) => return JobResult::error(format!("failed to resolve input image: {err}")),
    };

    let defaults = GenerationRequest::default();
    let request = GenerationRequest {
        prompt: params.prompt,
        negative_prompt: params.negative_prompt,
        image: Some(image),
        width: params.width.unwrap_or(defaults.width),
        height: params.height.unwrap_or(defaults.height),
        num_frames: params.frames.unwrap_or(defaults.num_frames),
        fps: params.fps.unwrap_or(defaults.fps),
        num_steps: params.steps,
        guidance_scale: params.guidance.unwrap_or(defaults.guidance_scale),
        seed: params.seed,
        format,
    };

    let runner = Runner::new(settings, Arc::new(PipelineCell::new()));
    let outcome = runner.run(&request);
    let Some(path) = outcome.output else {
        return JobResult::error(
            outcome
                .error
                .unwrap_or_else(|| "inference_failed".to_string()),
        );
    };

    match params.output_presigned_url {
        Some(put_url) => match upload_artifact(&path, &put_url, format) {
            Ok(()) => JobResult {
                video_path: None,
                video_url: Some(put_url),
                error: None,
            },
            Err(err) => JobResult::error(format!("artifact upload failed: {err}")),
        },
        None => JobResult {
            video_path: Some(path.display().to_string()),
            video_url: None,
            error: None,
        },
    }
}

fn upload_artifact(
    path: &std::path::Path,
    put_url: &str,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(UPLOAD_TIMEOUT)
        .build()?;
    let bytes = fs::read(path)?;
    client
        .put(put_url)
        .header(reqwest::header::CONTENT_TYPE, format.content_type())
        .body(bytes)
        .send()?
        .error_for_status()?;
    Ok(())
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
    fn job_input_parses_the_documented_shape() {
        let job: JobInput = serde_json::from_str(
            r#"{
                "input": {
                    "image_url": "https://example.com/input.png",
                    "frames": 16,
                    "fps": 8,
                    "seed": 123,
                    "guidance": 1.0,
                    "output_presigned_url": "https://example.com/put"
                }
            }"#,
        )
        .unwrap();
        assert_eq!(job.input.image_url.as_deref(), Some("https://example.com/input.png"));
        assert_eq!(job.input.frames, Some(16));
        assert_eq!(job.input.seed, Some(123));
        assert_eq!(
            job.input.output_presigned_url.as_deref(),
            Some("https://example.com/put")
        );
    }

    #[test]
    fn job_without_an_image_source_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let result = handle_job(&settings_in(dir.path()), JobParams::default());
        assert_eq!(
            result.error.as_deref(),
            Some("image_url or image_b64 is required")
        );
        assert!(result.video_path.is_none());
        assert!(result.video_url.is_none());
    }

    #[test]
    fn job_with_a_bad_format_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let params = JobParams {
            image_b64: Some("aGVsbG8=".to_string()),
            format: Some("webm".to_string()),
            ..Default::default()
        };
        let result = handle_job(&settings_in(dir.path()), params);
        assert!(result.error.unwrap().contains("webm"));
    }

    #[test]
    fn job_failures_are_result_objects_not_crashes() {
        let dir = tempfile::tempdir().unwrap();
        // Valid base64 payload, but no model weights exist; the failure must
        // come back inside the result.
        let params = JobParams {
            image_b64: Some("aGVsbG8=".to_string()),
            ..Default::default()
        };
        let result = handle_job(&settings_in(dir.path()), params);
        assert!(result.error.is_some());
        assert!(result.video_path.is_none());
    }
}
