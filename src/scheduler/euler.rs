//! Flow-matching Euler discrete scheduler.
//!
//! Update rule:
//! ```text
//! x_next = x + (σ_next - σ) * v
//! ```
//!
//! The step is computed in f32 and cast back to the sample dtype, so bf16/f16
//! latents do not accumulate rounding error across the schedule.

use candle_core::{DType, Tensor};

use super::{Scheduler, SchedulerConfig};
use crate::{Error, Result};

/// Timesteps closer than this are considered the same schedule entry.
const TIMESTEP_EPS: f64 = 1e-4;

/// Flow-matching Euler discrete scheduler.
#[derive(Debug, Clone)]
pub struct FlowMatchEulerScheduler {
    config: SchedulerConfig,
    sigmas: Vec<f64>,
    timesteps: Vec<f64>,
}

impl FlowMatchEulerScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            sigmas: Vec::new(),
            timesteps: Vec::new(),
        }
    }

    /// Sigmas of the current schedule, including the terminal 0.
    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    fn index_for_timestep(&self, timestep: f64) -> Result<usize> {
        self.timesteps
            .iter()
            .position(|t| (t - timestep).abs() < TIMESTEP_EPS)
            .ok_or_else(|| {
                Error::Config(format!(
                    "timestep {timestep} is not in the current schedule (call set_timesteps first)"
                ))
            })
    }
}

impl Scheduler for FlowMatchEulerScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) {
        // The training schedule is already shifted, so its smallest sigma is
        // shift(1/N). Inference timesteps are spaced linearly over the
        // training range and shifted once more.
        let num_train = self.config.num_train_timesteps as f64;
        let t_max = self.config.sigma_to_timestep(1.0);
        let t_min = self.config.sigma_to_timestep(self.config.shift_sigma(1.0 / num_train));
        let denom = num_inference_steps.saturating_sub(1).max(1) as f64;

        self.sigmas = (0..num_inference_steps)
            .map(|i| {
                let t = t_max - (t_max - t_min) * i as f64 / denom;
                self.config.shift_sigma(t / num_train)
            })
            .collect();
        self.timesteps = self
            .sigmas
            .iter()
            .map(|&sigma| self.config.sigma_to_timestep(sigma))
            .collect();

        // Terminal sigma = 0.
        self.sigmas.push(0.0);
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn step(&mut self, model_output: &Tensor, timestep: f64, sample: &Tensor) -> Result<Tensor> {
        let index = self.index_for_timestep(timestep)?;
        let sigma = self.sigmas[index];
        let sigma_next = self.sigmas[index + 1];

        let dtype = sample.dtype();
        let sample = sample.to_dtype(DType::F32)?;
        let model_output = model_output.to_dtype(DType::F32)?;

        let prev = (sample + (model_output * (sigma_next - sigma))?)?;
        Ok(prev.to_dtype(dtype)?)
    }
}
