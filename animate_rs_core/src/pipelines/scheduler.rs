use std::str::FromStr;

use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig,
    euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig,
    schedulers::{Scheduler, SchedulerConfig},
};
use serde::Deserialize;

/// Which denoising step algorithm replaces the base model's default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    #[default]
    Ddim,
    EulerAncestral,
}

impl SchedulerKind {
    pub(crate) fn build(&self, num_steps: usize) -> candle_core::Result<Box<dyn Scheduler>> {
        match self {
            Self::Ddim => DDIMSchedulerConfig::default().build(num_steps),
            Self::EulerAncestral => {
                EulerAncestralDiscreteSchedulerConfig::default().build(num_steps)
            }
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ddim" => Ok(Self::Ddim),
            "euler-ancestral" | "euler_ancestral" => Ok(Self::EulerAncestral),
            other => Err(format!("unknown scheduler `{other}`")),
        }
    }
}
