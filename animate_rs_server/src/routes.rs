use std::{fs, path::Path, str::FromStr, sync::Arc};

use actix_multipart::Multipart;
use actix_web::{web, Either, HttpResponse, Responder};
use animate_rs_core::{
    materialize_input, save_upload, verify_layout, GenerationRequest, OutputFormat, PipelineCell,
    Runner, Settings,
};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::info;

pub struct AppContext {
    pub settings: Settings,
    pub runner: Runner,
    pub cell: Arc<PipelineCell>,
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/models", web::get().to(models))
        .route("/generate", web::post().to(generate))
        .route("/download/{file}", web::get().to(download))
        .default_service(web::route().to(not_found));
}

/// Incoming generation parameters; the JSON body and the multipart form both
/// reduce to this.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GenerateBody {
    prompt: Option<String>,
    negative_prompt: Option<String>,
    image_url: Option<String>,
    image_b64: Option<String>,
    width: Option<usize>,
    height: Option<usize>,
    frames: Option<usize>,
    fps: Option<u16>,
    steps: Option<usize>,
    guidance: Option<f64>,
    seed: Option<u64>,
    format: Option<String>,
    #[serde(skip)]
    upload: Option<(Vec<u8>, Option<String>)>,
}

impl GenerateBody {
    /// Resolves the body against the request defaults, materializing any
    /// image source to a local file. Errors are client errors.
    fn into_request(self, inputs_dir: &Path) -> Result<GenerationRequest, String> {
        let defaults = GenerationRequest::default();
        let format = match self.format.as_deref() {
            Some(spec) => OutputFormat::from_str(spec)?,
            None => defaults.format,
        };
        let image = if let Some((bytes, filename)) = self.upload {
            Some(save_upload(&bytes, inputs_dir, filename.as_deref()).map_err(|e| e.to_string())?)
        } else if let Some(payload) = self.image_b64.as_deref() {
            Some(materialize_input(payload, inputs_dir).map_err(|e| e.to_string())?)
        } else if let Some(url) = self.image_url.as_deref() {
            Some(materialize_input(url, inputs_dir).map_err(|e| e.to_string())?)
        } else {
            None
        };
        Ok(GenerationRequest {
            prompt: self.prompt,
            negative_prompt: self.negative_prompt,
            image,
            width: self.width.unwrap_or(defaults.width),
            height: self.height.unwrap_or(defaults.height),
            num_frames: self.frames.unwrap_or(defaults.num_frames),
            fps: self.fps.unwrap_or(defaults.fps),
            num_steps: self.steps,
            guidance_scale: self.guidance.unwrap_or(defaults.guidance_scale),
            seed: self.seed,
            format,
        })
    }
}

#[derive(Serialize)]
struct ApiError {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl ApiError {
    fn new(error: &'static str, reason: Option<String>) -> Self {
        Self { error, reason }
    }
}

#[derive(Serialize)]
struct GenerateResponse {
    id: String,
    video_path: String,
}

async fn health(ctx: web::Data<AppContext>) -> impl Responder {
    let models_present = verify_layout(&ctx.settings.models_dir).is_ok();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "models_present": models_present,
        "pipeline_loaded": ctx.cell.get().is_some(),
    }))
}

async fn models(ctx: web::Data<AppContext>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "available": ["AnimateDiff-Lightning"],
        "base_repo": ctx.settings.base_repo,
        "adapter_repo": ctx.settings.adapter_repo,
    }))
}

async fn generate(
    ctx: web::Data<AppContext>,
    payload: Either<web::Json<GenerateBody>, Multipart>,
) -> HttpResponse {
    let body = match payload {
        Either::Left(json) => json.into_inner(),
        Either::Right(multipart) => match read_multipart(multipart).await {
            Ok(body) => body,
            Err(reason) => {
                return HttpResponse::BadRequest()
                    .json(ApiError::new("invalid_request", Some(reason)))
            }
        },
    };

    // Input materialization and the forward pass both block; keep them off
    // the worker threads.
    let blocking = web::block(move || {
        let request = body.into_request(&ctx.settings.inputs_dir)?;
        request.validate().map_err(|err| err.to_string())?;
        Ok::<_, String>(ctx.runner.run(&request))
    })
    .await;

    let outcome = match blocking {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(reason)) => {
            return HttpResponse::BadRequest()
                .json(ApiError::new("invalid_request", Some(reason)))
        }
        Err(err) => {
            return HttpResponse::InternalServerError()
                .json(ApiError::new("inference_failed", Some(err.to_string())))
        }
    };

    match outcome.output {
        Some(path) => {
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let id = path
                .file_stem()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            info!("generated artifact {file}");
            HttpResponse::Ok().json(GenerateResponse {
                id,
                video_path: format!("/download/{file}"),
            })
        }
        None => HttpResponse::InternalServerError()
            .json(ApiError::new("inference_failed", outcome.error)),
    }
}

async fn download(ctx: web::Data<AppContext>, path: web::Path<String>) -> HttpResponse {
    let file = path.into_inner();
    if !is_safe_artifact_name(&file) {
        return HttpResponse::BadRequest().json(ApiError::new("invalid_name", None));
    }
    match fs::read(ctx.settings.outputs_dir.join(&file)) {
        Ok(bytes) => HttpResponse::Ok()
            .content_type(content_type_for(&file))
            .body(bytes),
        Err(_) => HttpResponse::NotFound().json(ApiError::new("not_found", None)),
    }
}

async fn not_found() -> HttpResponse {
    HttpResponse::NotFound().json(ApiError::new("not_found", None))
}

async fn read_multipart(mut payload: Multipart) -> Result<GenerateBody, String> {
    let mut body = GenerateBody::default();
    while let Some(mut field) = payload.try_next().await.map_err(|e| e.to_string())? {
        let (name, filename) = {
            let disposition = field.content_disposition();
            (
                disposition.get_name().unwrap_or("").to_string(),
                disposition.get_filename().map(|f| f.to_string()),
            )
        };
        let mut data = Vec::new();
        while let Some(chunk) = field.try_next().await.map_err(|e| e.to_string())? {
            data.extend_from_slice(&chunk);
        }
        if name == "image" {
            body.upload = Some((data, filename));
        } else {
            let text = String::from_utf8(data).map_err(|e| e.to_string())?;
            assign_text_field(&mut body, &name, text.trim())?;
        }
    }
    Ok(body)
}

fn assign_text_field(body: &mut GenerateBody, name: &str, value: &str) -> Result<(), String> {
    fn parsed<T: FromStr>(name: &str, value: &str) -> Result<T, String> {
        value
            .parse()
            .map_err(|_| format!("field `{name}` has invalid value `{value}`"))
    }

    match name {
        "prompt" => body.prompt = Some(value.to_string()),
        "negative_prompt" => body.negative_prompt = Some(value.to_string()),
        "image_url" => body.image_url = Some(value.to_string()),
        "image_b64" => body.image_b64 = Some(value.to_string()),
        "width" => body.width = Some(parsed(name, value)?),
        "height" => body.height = Some(parsed(name, value)?),
        "frames" => body.frames = Some(parsed(name, value)?),
        "fps" => body.fps = Some(parsed(name, value)?),
        "steps" => body.steps = Some(parsed(name, value)?),
        "guidance" => body.guidance = Some(parsed(name, value)?),
        "seed" => body.seed = Some(parsed(name, value)?),
        "format" => body.format = Some(value.to_string()),
        // Unknown parts are ignored so clients can send extras.
        _ => {}
    }
    Ok(())
}

fn is_safe_artifact_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn content_type_for(name: &str) -> &'static str {
    if name.ends_with(".gif") {
        "image/gif"
    } else if name.ends_with(".mp4") {
        "video/mp4"
    } else {
        "application/octet-stream"
    }
}
