//! Configuration for the FAR pipeline components.
//!
//! Every struct deserializes from JSON with defaults for omitted fields, so a
//! config file only needs to name what differs from the defaults below.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::pipeline::GenerateParams;
use crate::scheduler::SchedulerConfig;
use crate::{Error, Result};

/// How the autoencoder treats the time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoencoderKind {
    /// Image autoencoder applied to each frame independently: `[N, C, H, W]`.
    PerFrame,
    /// Video autoencoder that decodes `[B, C, T, H, W]` with time next to channel.
    TimeAware,
}

/// Latent codec configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    #[serde(default = "default_kind")]
    pub kind: AutoencoderKind,
    /// Latents are multiplied by this after encoding and divided before decoding.
    #[serde(default = "default_scaling_factor")]
    pub scaling_factor: f64,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            scaling_factor: default_scaling_factor(),
        }
    }
}

fn default_kind() -> AutoencoderKind {
    AutoencoderKind::PerFrame
}

fn default_scaling_factor() -> f64 {
    // SD-VAE scaling.
    0.18215
}

/// Class/action vocabulary of the denoiser.
///
/// The null (unconditional) id of each kind is one past its last valid id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionConfig {
    #[serde(default)]
    pub num_classes: Option<usize>,
    #[serde(default)]
    pub num_action_classes: Option<usize>,
}

impl ConditionConfig {
    /// Null label id used for the unconditional branch.
    pub fn null_label_id(&self) -> Result<u32> {
        self.num_classes
            .map(|n| n as u32)
            .ok_or_else(|| Error::Config("label conditioning needs `num_classes`".to_string()))
    }

    /// Null action id used for the unconditional branch.
    pub fn null_action_id(&self) -> Result<u32> {
        self.num_action_classes.map(|n| n as u32).ok_or_else(|| {
            Error::Config("action conditioning needs `num_action_classes`".to_string())
        })
    }
}

/// Static configuration a denoiser exposes to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenoiserConfig {
    /// Latent channel count of the working latents.
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default)]
    pub condition_cfg: ConditionConfig,
}

impl Default for DenoiserConfig {
    fn default() -> Self {
        Self {
            in_channels: default_in_channels(),
            condition_cfg: ConditionConfig::default(),
        }
    }
}

fn default_in_channels() -> usize {
    4
}

/// Everything the pipeline needs besides the learned components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub generate: GenerateParams,
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.codec.kind, AutoencoderKind::PerFrame);
        assert!((cfg.codec.scaling_factor - 0.18215).abs() < 1e-12);
        assert_eq!(cfg.generate.num_inference_steps, 50);
        assert_eq!(cfg.generate.context_timestep_idx, -1);
        assert!(cfg.generate.use_kv_cache);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = PipelineConfig::from_json_str(
            r#"{"codec": {"kind": "time_aware", "scaling_factor": 1.15258426},
                "generate": {"unroll_length": 16, "guidance_scale": 1.5}}"#,
        )
        .unwrap();
        assert_eq!(cfg.codec.kind, AutoencoderKind::TimeAware);
        assert_eq!(cfg.generate.unroll_length, 16);
        assert_eq!(cfg.generate.sample_size, 32);
        assert_eq!(cfg.scheduler.num_train_timesteps, 1000);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("far.json");
        std::fs::write(&path, r#"{"generate": {"batch_size": 4}}"#).unwrap();
        let cfg = PipelineConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.generate.batch_size, 4);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = PipelineConfig::from_json_str(r#"{"codec": {"kind": "three_d"}}"#).unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_null_ids() {
        let cfg = ConditionConfig {
            num_classes: Some(101),
            num_action_classes: None,
        };
        assert_eq!(cfg.null_label_id().unwrap(), 101);
        assert!(matches!(cfg.null_action_id(), Err(Error::Config(_))));
    }
}
