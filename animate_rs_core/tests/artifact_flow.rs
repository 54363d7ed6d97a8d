use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;

use animate_rs_core::{encode_frames, ensure_descriptor, verify_layout, FetchError, OutputFormat};
use image::{codecs::gif::GifDecoder, AnimationDecoder, RgbImage};

fn scaffold_base(models_dir: &Path) {
    let base = models_dir.join("sd_base");
    for (file, contents) in [
        (
            "model_index.json",
            r#"{ "_class_name": "StableDiffusionPipeline" }"#,
        ),
        ("tokenizer/tokenizer.json", "{}"),
        ("scheduler/scheduler_config.json", "{}"),
    ] {
        let path = base.join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }
    for file in [
        "text_encoder/model.safetensors",
        "unet/diffusion_pytorch_model.safetensors",
        "vae/diffusion_pytorch_model.safetensors",
    ] {
        let path = base.join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"weights").unwrap();
    }
}

#[test]
fn fetched_layout_with_synthesized_descriptor_verifies() {
    let dir = tempfile::tempdir().unwrap();
    scaffold_base(dir.path());

    let adapter = dir.path().join("ad_lightning");
    fs::create_dir_all(&adapter).unwrap();
    let weight = "animatediff_lightning_4step_diffusers.safetensors";
    fs::write(adapter.join(weight), b"weights").unwrap();

    // Hub artifact without a descriptor: one must be synthesized referencing
    // exactly the weight that exists.
    assert!(verify_layout(dir.path()).is_err());
    ensure_descriptor(&adapter).unwrap();
    verify_layout(dir.path()).unwrap();

    let descriptor = fs::read_to_string(adapter.join("config.json")).unwrap();
    assert!(descriptor.contains(weight));

    // A descriptor pointing at a deleted weight is an inconsistency, not a
    // pass.
    fs::remove_file(adapter.join(weight)).unwrap();
    assert!(matches!(
        verify_layout(dir.path()),
        Err(FetchError::DanglingDescriptor { .. })
    ));
}

#[test]
fn sixteen_frames_at_eight_fps_encode_to_sixteen_frames() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outputs").join("clip.gif");
    let frames: Vec<RgbImage> = (0..16)
        .map(|i| RgbImage::from_pixel(16, 16, image::Rgb([i * 8, 0, 0])))
        .collect();

    encode_frames(&frames, 8, OutputFormat::Gif, &path).unwrap();

    let decoder = GifDecoder::new(BufReader::new(File::open(&path).unwrap())).unwrap();
    let decoded = decoder.into_frames().collect_frames().unwrap();
    assert_eq!(decoded.len(), 16);

    // 8 fps corresponds to a 125ms frame delay; GIF stores centiseconds, so
    // allow for that rounding.
    let (numer, denom) = decoded[0].delay().numer_denom_ms();
    let delay_ms = numer as f64 / denom as f64;
    assert!((120.0..=130.0).contains(&delay_ms), "delay was {delay_ms}ms");
}
