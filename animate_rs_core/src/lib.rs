//! Core crate of animate_rs.
//!
//! Everything the service binaries need lives here: fetching the base model
//! and motion-adapter weights from the Hugging Face hub, building the shared
//! inference pipeline, running one generation per request and encoding the
//! resulting frames into a playable artifact.
//!
//! ```rust,no_run
//! use animate_rs_core::{
//!     GenerationRequest, PipelineCell, Runner, Settings,
//! };
//! use std::sync::Arc;
//!
//! let settings = Settings::from_env();
//! let cell = Arc::new(PipelineCell::new());
//! let runner = Runner::new(&settings, cell);
//!
//! let outcome = runner.run(&GenerationRequest {
//!     prompt: Some("a rusty robot walking on a sandy beach".to_string()),
//!     ..Default::default()
//! });
//! match outcome.output {
//!     Some(path) => println!("wrote {}", path.display()),
//!     None => eprintln!("{}", outcome.error.unwrap_or_default()),
//! }
//! ```

mod config;
mod encode;
mod fetch;
mod input;
mod pipelines;
mod runner;
mod tokens;

pub use config::{PipelineConfig, Settings};
pub use encode::{encode_frames, EncodeError, OutputFormat};
pub use fetch::{ensure_descriptor, verify_layout, FetchError, ModelFetcher};
pub use input::{decode_image_payload, materialize_input, save_upload, InputError};
pub use pipelines::{
    DevicePreference, Pipeline, PipelineCell, SchedulerKind, VideoGenerationParams,
};
pub use runner::{GenerationOutcome, GenerationRequest, RequestError, Runner};
pub use tokens::TokenSource;
