use std::{fs, io, path::{Path, PathBuf}, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Remote seed images must arrive within this window; a hung upstream must
/// not pin a worker forever.
pub const REMOTE_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum InputError {
    #[error("fetching remote image failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("invalid base64 image payload: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("image payload is empty")]
    Empty,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Turns an `image_url` or base64 payload into a local file under
/// `inputs_dir` and returns its path.
pub fn materialize_input(reference: &str, inputs_dir: &Path) -> Result<PathBuf, InputError> {
    let bytes = decode_image_payload(reference)?;
    persist(&bytes, inputs_dir, "png")
}

/// Resolves the payload bytes: HTTP(S) URLs are fetched with a bounded
/// timeout, anything else is treated as base64 (raw or `data:` URL form).
pub fn decode_image_payload(reference: &str) -> Result<Vec<u8>, InputError> {
    if reference.is_empty() {
        return Err(InputError::Empty);
    }
    let bytes = if reference.starts_with("http://") || reference.starts_with("https://") {
        fetch_remote(reference)?
    } else {
        let encoded = match reference.strip_prefix("data:") {
            Some(rest) => rest.split_once(',').map(|(_, b64)| b64).unwrap_or(rest),
            None => reference,
        };
        STANDARD.decode(encoded.trim())?
    };
    if bytes.is_empty() {
        return Err(InputError::Empty);
    }
    Ok(bytes)
}

/// Stores an already-received upload (e.g. a multipart file part) under
/// `inputs_dir`.
pub fn save_upload(
    bytes: &[u8],
    inputs_dir: &Path,
    original_name: Option<&str>,
) -> Result<PathBuf, InputError> {
    if bytes.is_empty() {
        return Err(InputError::Empty);
    }
    let extension = original_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .unwrap_or("png");
    persist(bytes, inputs_dir, extension)
}

fn persist(bytes: &[u8], inputs_dir: &Path, extension: &str) -> Result<PathBuf, InputError> {
    fs::create_dir_all(inputs_dir)?;
    let path = inputs_dir.join(format!("{}.{extension}", Uuid::new_v4()));
    fs::write(&path, bytes)?;
    debug!("stored {} input bytes at {}", bytes.len(), path.display());
    Ok(path)
}

fn fetch_remote(url: &str) -> Result<Vec<u8>, InputError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(REMOTE_FETCH_TIMEOUT)
        .build()?;
    let response = client.get(url).send()?.error_for_status()?;
    Ok(response.bytes()?.to_vec())
}
