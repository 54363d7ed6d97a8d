use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    str::FromStr,
};

use image::{
    codecs::gif::{GifEncoder, Repeat},
    Delay, Frame, RgbImage,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Container for the encoded frame sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Animated GIF, encoded in-process.
    #[default]
    Gif,
    /// H.264 MP4, encoded by piping raw frames to `ffmpeg`.
    Mp4,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Gif => "gif",
            Self::Mp4 => "mp4",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Gif => "image/gif",
            Self::Mp4 => "video/mp4",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gif" => Ok(Self::Gif),
            "mp4" => Ok(Self::Mp4),
            other => Err(format!("unknown output format `{other}`")),
        }
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("refusing to encode an empty frame sequence")]
    NoFrames,
    #[error("frame rate must be nonzero")]
    ZeroRate,
    #[error("all frames must share the dimensions of the first frame")]
    MixedDimensions,
    #[error("`ffmpeg` was not found on PATH; install it or request gif output")]
    EncoderMissing,
    #[error("ffmpeg exited with {status}: {stderr}")]
    EncoderFailed { status: String, stderr: String },
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Writes `frames` to `path` at `fps`, creating missing parent directories.
/// The file appears atomically: encoding goes to a hidden sibling which is
/// renamed only on success, so failures leave no partial artifact behind.
pub fn encode_frames(
    frames: &[RgbImage],
    fps: u16,
    format: OutputFormat,
    path: &Path,
) -> Result<(), EncodeError> {
    if frames.is_empty() {
        return Err(EncodeError::NoFrames);
    }
    if fps == 0 {
        return Err(EncodeError::ZeroRate);
    }
    let (width, height) = frames[0].dimensions();
    if frames.iter().any(|f| f.dimensions() != (width, height)) {
        return Err(EncodeError::MixedDimensions);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let staging = staging_path(path);
    let result = match format {
        OutputFormat::Gif => write_gif(frames, fps, &staging),
        OutputFormat::Mp4 => write_mp4(frames, fps, width, height, &staging),
    };
    match result {
        Ok(()) => {
            fs::rename(&staging, path)?;
            debug!("encoded {} frames at {fps} fps to {}", frames.len(), path.display());
            Ok(())
        }
        Err(err) => {
            let _ = fs::remove_file(&staging);
            Err(err)
        }
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    path.with_file_name(format!(".{name}.part"))
}

fn write_gif(frames: &[RgbImage], fps: u16, path: &Path) -> Result<(), EncodeError> {
    let file = BufWriter::new(File::create(path)?);
    let mut encoder = GifEncoder::new(file);
    encoder.set_repeat(Repeat::Infinite)?;
    let delay = Delay::from_numer_denom_ms(1000, u32::from(fps));
    for frame in frames {
        let rgba = image::DynamicImage::ImageRgb8(frame.clone()).to_rgba8();
        encoder.encode_frame(Frame::from_parts(rgba, 0, 0, delay))?;
    }
    Ok(())
}

fn write_mp4(
    frames: &[RgbImage],
    fps: u16,
    width: u32,
    height: u32,
    path: &Path,
) -> Result<(), EncodeError> {
    let mut child = Command::new("ffmpeg")
        .args([
            "-y",
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
            "-s",
            &format!("{width}x{height}"),
            "-r",
            &fps.to_string(),
            "-i",
            "-",
            "-c:v",
            "libx264",
            "-pix_fmt",
            "yuv420p",
            "-f",
            "mp4",
        ])
        .arg(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                EncodeError::EncoderMissing
            } else {
                EncodeError::Io(err)
            }
        })?;

    {
        let mut stdin = child.stdin.take().expect("ffmpeg stdin was piped");
        for frame in frames {
            stdin.write_all(frame.as_raw())?;
        }
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(EncodeError::EncoderFailed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}
