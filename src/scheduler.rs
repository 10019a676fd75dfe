//! Noise schedulers for the denoising loop.
//!
//! - [`euler`]: flow-matching Euler discrete scheduler
//!
//! ## Flow-matching formulation
//!
//! The forward process interpolates: `x_t = (1 - σ) * x_0 + σ * ε`
//!
//! The model predicts velocity `v = ε - x_0`, so one Euler step is
//! `x_next = x + (σ_next - σ) * v`.
//!
//! The sigma schedule is shifted: `σ' = shift * σ / (1 + (shift - 1) * σ)`

pub mod euler;

use candle_core::Tensor;

/// Common interface for all schedulers.
pub trait Scheduler {
    /// Set up the timestep schedule for a given number of inference steps.
    fn set_timesteps(&mut self, num_inference_steps: usize);

    /// Timesteps of the current schedule, in the order they must be run.
    fn timesteps(&self) -> &[f64];

    /// Advance `sample` from `timestep` to the next timestep of the schedule.
    fn step(
        &mut self,
        model_output: &Tensor,
        timestep: f64,
        sample: &Tensor,
    ) -> crate::Result<Tensor>;
}

/// Configuration shared across schedulers.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    /// Number of training timesteps (default: 1000).
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,

    /// Sigma schedule shift factor (default: 1.0, no shift).
    #[serde(default = "default_shift")]
    pub shift: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: default_num_train_timesteps(),
            shift: default_shift(),
        }
    }
}

impl SchedulerConfig {
    /// Warp a sigma toward the noisy end: `σ' = shift * σ / (1 + (shift - 1) * σ)`.
    ///
    /// `shift > 1` spends more of the schedule at high noise, which helps
    /// larger latents; `shift == 1` leaves the schedule linear.
    pub fn shift_sigma(&self, sigma: f64) -> f64 {
        self.shift * sigma / (1.0 + (self.shift - 1.0) * sigma)
    }

    /// Model timestep for a sigma.
    pub fn sigma_to_timestep(&self, sigma: f64) -> f64 {
        sigma * self.num_train_timesteps as f64
    }
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_shift() -> f64 {
    1.0
}
