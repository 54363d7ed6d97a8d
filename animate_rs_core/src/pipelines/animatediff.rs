use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use image::{DynamicImage, RgbImage};
use memmap2::Mmap;
use safetensors::SafeTensors;
use tokenizers::Tokenizer;
use tracing::{info, warn};

use super::{Loader, ModelPipeline, SchedulerKind, VideoGenerationParams};
use crate::config::PipelineConfig;
use crate::fetch::{lightning_steps, AdapterDescriptor, ADAPTER_DESCRIPTOR};

const VAE_SCALE: f64 = 0.18215;
/// How strongly a seed image anchors the frames; the remainder of the noise
/// schedule still runs on top of it.
const IMG2IMG_STRENGTH: f64 = 0.75;
/// Step count when the adapter name carries no distillation hint.
const FALLBACK_STEPS: usize = 25;

/// The motion-adapter checkpoint: resolved through its descriptor, validated
/// as an actual motion module, and the source of the Lightning default step
/// count.
#[derive(Debug)]
pub(crate) struct MotionAdapter {
    weight: PathBuf,
    motion_tensor_count: usize,
    distilled_steps: Option<usize>,
}

impl MotionAdapter {
    pub(crate) fn load(adapter_dir: &Path) -> Result<Self> {
        let descriptor_path = adapter_dir.join(ADAPTER_DESCRIPTOR);
        let descriptor: AdapterDescriptor = serde_json::from_str(
            &fs::read_to_string(&descriptor_path).with_context(|| {
                format!("missing adapter descriptor at {}", descriptor_path.display())
            })?,
        )?;

        let weight = adapter_dir.join(&descriptor.weight_file);
        let file = fs::File::open(&weight)
            .with_context(|| format!("missing adapter weight {}", weight.display()))?;
        let mmap = unsafe { Mmap::map(&file)? };
        let tensors = SafeTensors::deserialize(&mmap)?;
        let motion_tensor_count = tensors
            .names()
            .iter()
            .filter(|name| name.contains("motion_modules") || name.contains("temporal"))
            .count();
        if motion_tensor_count == 0 {
            anyhow::bail!(
                "`{}` does not look like a motion-adapter checkpoint",
                weight.display()
            );
        }

        let distilled_steps = lightning_steps(&descriptor.weight_file);
        Ok(Self {
            weight,
            motion_tensor_count,
            distilled_steps,
        })
    }
}

pub(crate) struct AnimateDiffLoader;

impl Loader for AnimateDiffLoader {
    fn name(&self) -> &'static str {
        "animatediff"
    }

    fn required_files(&self) -> Vec<&'static str> {
        vec![
            "model_index.json",
            "tokenizer/tokenizer.json",
            "scheduler/scheduler_config.json",
        ]
    }

    fn load(&self, config: &PipelineConfig, device: &Device) -> Result<Box<dyn ModelPipeline>> {
        let adapter = MotionAdapter::load(&config.adapter_dir)?;
        info!(
            "motion adapter: {} ({} motion tensors)",
            adapter.weight.display(),
            adapter.motion_tensor_count
        );

        let dtype = if matches!(device, Device::Cpu) {
            DType::F32
        } else {
            DType::F16
        };
        let sd_config = StableDiffusionConfig::v1_5(None, None, None);

        let tokenizer_path = config.base_dir.join("tokenizer").join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(anyhow::Error::msg)?;
        let pad_id = match &sd_config.clip.pad_with {
            Some(padding) => *tokenizer
                .get_vocab(true)
                .get(padding.as_str())
                .context("pad token missing from tokenizer vocab")?,
            None => *tokenizer
                .get_vocab(true)
                .get("<|endoftext|>")
                .context("end-of-text token missing from tokenizer vocab")?,
        };

        info!("loading CLIP text encoder");
        let clip_weights = component_weights(&config.base_dir, "text_encoder", "model", dtype)?;
        let clip =
            stable_diffusion::build_clip_transformer(&sd_config.clip, clip_weights, device, dtype)?;

        info!("loading VAE");
        let vae_weights =
            component_weights(&config.base_dir, "vae", "diffusion_pytorch_model", dtype)?;
        let vae = sd_config.build_vae(vae_weights, device, dtype)?;

        info!("loading UNet");
        let unet_weights =
            component_weights(&config.base_dir, "unet", "diffusion_pytorch_model", dtype)?;
        let unet = if config.flash_attention {
            match sd_config.build_unet(&unet_weights, device, 4, true, dtype) {
                Ok(unet) => unet,
                Err(err) => {
                    warn!("flash attention unavailable ({err}), using standard attention");
                    sd_config.build_unet(&unet_weights, device, 4, false, dtype)?
                }
            }
        } else {
            sd_config.build_unet(&unet_weights, device, 4, false, dtype)?
        };

        Ok(Box::new(AnimateDiffPipeline {
            device: device.clone(),
            dtype,
            tokenizer,
            pad_id,
            clip,
            vae,
            unet,
            sd_config,
            scheduler_kind: config.scheduler,
            vae_slicing: config.vae_slicing,
            latent_correlation: config.latent_correlation,
            adapter,
        }))
    }
}

/// Prefers the fp16 shard when running in half precision, falling back to
/// whichever variant exists.
fn component_weights(
    base_dir: &Path,
    component: &str,
    stem: &str,
    dtype: DType,
) -> Result<PathBuf> {
    let fp16 = base_dir
        .join(component)
        .join(format!("{stem}.fp16.safetensors"));
    let fp32 = base_dir.join(component).join(format!("{stem}.safetensors"));
    if dtype == DType::F16 && fp16.exists() {
        return Ok(fp16);
    }
    if fp32.exists() {
        return Ok(fp32);
    }
    if fp16.exists() {
        return Ok(fp16);
    }
    anyhow::bail!(
        "no weights for `{component}` under {}",
        base_dir.display()
    )
}

struct AnimateDiffPipeline {
    device: Device,
    dtype: DType,
    tokenizer: Tokenizer,
    pad_id: u32,
    clip: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
    sd_config: StableDiffusionConfig,
    scheduler_kind: SchedulerKind,
    vae_slicing: bool,
    latent_correlation: f64,
    adapter: MotionAdapter,
}

impl AnimateDiffPipeline {
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec();
        let max_len = self.sd_config.clip.max_position_embeddings;
        tokens.truncate(max_len);
        while tokens.len() < max_len {
            tokens.push(self.pad_id);
        }
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.clip.forward(&tokens)?)
    }

    /// Initial per-frame noise with a shared component, so neighbouring
    /// frames start from correlated latents instead of independent static.
    fn correlated_noise(&self, frames: usize, height: usize, width: usize) -> Result<Tensor> {
        let per_frame = Tensor::randn(0f32, 1f32, (frames, 4, height, width), &self.device)?;
        let rho = self.latent_correlation.clamp(0.0, 0.99);
        let noise = if rho > 0.0 {
            let base = Tensor::randn(0f32, 1f32, (1, 4, height, width), &self.device)?;
            (per_frame * (1.0 - rho).sqrt())?.broadcast_add(&(base * rho.sqrt())?)?
        } else {
            per_frame
        };
        Ok(noise.to_dtype(self.dtype)?)
    }

    /// Decodes latents of shape `(n, 4, h, w)` into `n` frames.
    fn decode_latents(&self, latents: &Tensor) -> Result<Vec<RgbImage>> {
        let images = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let images = ((images / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let images = (images.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?;
        let (count, _, height, width) = images.dims4()?;
        let mut frames = Vec::with_capacity(count);
        for idx in 0..count {
            let data = images
                .i(idx)?
                .permute((1, 2, 0))?
                .flatten_all()?
                .to_vec1::<u8>()?;
            frames.push(
                RgbImage::from_raw(width as u32, height as u32, data)
                    .context("decoded frame has invalid dimensions")?,
            );
        }
        Ok(frames)
    }
}

impl ModelPipeline for AnimateDiffPipeline {
    fn default_steps(&self) -> usize {
        self.adapter.distilled_steps.unwrap_or(FALLBACK_STEPS)
    }

    fn forward(
        &mut self,
        prompt: &str,
        negative_prompt: &str,
        seed_image: Option<&DynamicImage>,
        params: &VideoGenerationParams,
    ) -> Result<Vec<RgbImage>> {
        let frames = params.num_frames;
        let steps = params.num_steps;
        let (latent_height, latent_width) = (params.height / 8, params.width / 8);
        let use_guidance = params.guidance_scale > 1.0;

        let seed = params.seed.unwrap_or_else(rand::random);
        self.device.set_seed(seed)?;
        info!("generation seed: {seed}");

        let mut scheduler = self.scheduler_kind.build(steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        let cond = self.encode_prompt(prompt)?;
        let embeddings = if use_guidance {
            let uncond = self.encode_prompt(negative_prompt)?;
            Tensor::cat(
                &[
                    uncond.repeat((frames, 1, 1))?,
                    cond.repeat((frames, 1, 1))?,
                ],
                0,
            )?
        } else {
            cond.repeat((frames, 1, 1))?
        };
        let embeddings = embeddings.to_dtype(self.dtype)?;

        let noise = self.correlated_noise(frames, latent_height, latent_width)?;
        let (mut latents, t_start) = match seed_image {
            Some(img) => {
                let img = preprocess_image(img, params.width, params.height)?
                    .to_device(&self.device)?
                    .to_dtype(self.dtype)?;
                let image_latents =
                    (self.vae.encode(&img)?.sample()? * VAE_SCALE)?.repeat((frames, 1, 1, 1))?;
                let t_start = steps
                    .saturating_sub((steps as f64 * IMG2IMG_STRENGTH) as usize)
                    .min(timesteps.len().saturating_sub(1));
                let latents = scheduler.add_noise(&image_latents, noise, timesteps[t_start])?;
                (latents, t_start)
            }
            None => ((noise * scheduler.init_noise_sigma())?, 0),
        };

        for (timestep_index, &timestep) in timesteps.iter().enumerate() {
            if timestep_index < t_start {
                continue;
            }
            let latent_model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, &embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * params.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        // Sliced decoding runs frames through the VAE one at a time, trading
        // throughput for peak memory.
        if self.vae_slicing {
            let mut images = Vec::with_capacity(frames);
            for idx in 0..frames {
                let latent = latents.i(idx)?.unsqueeze(0)?;
                images.extend(self.decode_latents(&latent)?);
            }
            Ok(images)
        } else {
            self.decode_latents(&latents)
        }
    }
}

/// Seed image to a `(1, 3, height, width)` tensor in `[-1, 1]`.
fn preprocess_image(img: &DynamicImage, width: usize, height: usize) -> Result<Tensor> {
    let img = img
        .resize_to_fill(
            width as u32,
            height as u32,
            image::imageops::FilterType::CatmullRom,
        )
        .to_rgb8();
    let data = img.into_raw();
    let tensor = Tensor::from_vec(data, (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetensors::tensor::{Dtype, TensorView};
    use std::collections::HashMap;

    fn write_adapter(dir: &Path, weight_name: &str, tensor_name: &str) {
        let data = vec![0u8; 4];
        let view = TensorView::new(Dtype::F32, vec![1], &data).unwrap();
        let mut tensors = HashMap::new();
        tensors.insert(tensor_name.to_string(), view);
        let bytes = safetensors::serialize(tensors, &None).unwrap();
        fs::write(dir.join(weight_name), bytes).unwrap();
        fs::write(
            dir.join(ADAPTER_DESCRIPTOR),
            format!(
                r#"{{ "_class_name": "MotionAdapter", "weight_file": "{weight_name}" }}"#
            ),
        )
        .unwrap();
    }

    #[test]
    fn adapter_load_validates_motion_tensors() {
        let dir = tempfile::tempdir().unwrap();
        write_adapter(
            dir.path(),
            "animatediff_lightning_4step_diffusers.safetensors",
            "down_blocks.0.motion_modules.0.proj.weight",
        );

        let adapter = MotionAdapter::load(dir.path()).unwrap();
        assert_eq!(adapter.motion_tensor_count, 1);
        assert_eq!(adapter.distilled_steps, Some(4));
    }

    #[test]
    fn adapter_load_rejects_non_motion_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        write_adapter(
            dir.path(),
            "plain_unet.safetensors",
            "down_blocks.0.attentions.0.proj.weight",
        );

        let err = MotionAdapter::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("motion-adapter"));
    }

    #[test]
    fn adapter_load_requires_the_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let err = MotionAdapter::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("descriptor"));
    }

    #[test]
    fn missing_component_weights_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = component_weights(dir.path(), "unet", "diffusion_pytorch_model", DType::F32)
            .unwrap_err();
        assert!(err.to_string().contains("unet"));
    }

    #[test]
    fn fp16_weights_are_preferred_in_half_precision() {
        let dir = tempfile::tempdir().unwrap();
        let unet = dir.path().join("unet");
        fs::create_dir_all(&unet).unwrap();
        fs::write(unet.join("diffusion_pytorch_model.safetensors"), b"w").unwrap();
        fs::write(unet.join("diffusion_pytorch_model.fp16.safetensors"), b"w").unwrap();

        let picked =
            component_weights(dir.path(), "unet", "diffusion_pytorch_model", DType::F16).unwrap();
        assert!(picked.to_string_lossy().contains("fp16"));
        let picked =
            component_weights(dir.path(), "unet", "diffusion_pytorch_model", DType::F32).unwrap();
        assert!(!picked.to_string_lossy().contains("fp16"));
    }
}
