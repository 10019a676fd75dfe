//! Autoregressive frame-by-frame video generation.
//!
//! [`FarPipeline::generate`] runs two nested loops:
//!
//! 1. Draw all working noise up front, one frame per unroll step
//! 2. Encode the optional context frames to latents (clean context)
//! 3. For each unroll step: denoise one noise frame conditioned on every
//!    latent produced so far, then append it to the context
//! 4. Decode the full latent sequence back to frames
//!
//! Each unroll step runs the full scheduler schedule
//! ([`FarPipeline::denoise_step`]). The denoiser always sees
//! `[context frames, working frame]` as one sequence, with context positions
//! tagged by [`CLEAN_CONTEXT_TIMESTEP`]. When KV caching is enabled the first
//! denoiser call of a step primes the cache with the context; the remaining
//! calls reuse it.

use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::codec::{Autoencoder, LatentCodec};
use crate::conditions::{Conditions, Guidance};
use crate::config::PipelineConfig;
use crate::denoiser::{CacheState, Denoiser};
use crate::noise::{NoiseGenerator, randn_tensor};
use crate::scheduler::Scheduler;
use crate::scheduler::euler::FlowMatchEulerScheduler;
use crate::{Error, Result};

/// Timestep tag of clean (already generated or given) context frames.
pub const CLEAN_CONTEXT_TIMESTEP: i64 = -1;

/// Parameters of one [`FarPipeline::generate`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateParams {
    /// Number of frames to generate after the context.
    #[serde(default)]
    pub unroll_length: usize,
    /// `> 1`: classifier-free guidance; `== -1`: unconditional; otherwise unguided.
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    /// Must stay at [`CLEAN_CONTEXT_TIMESTEP`] whenever there is context.
    #[serde(default = "default_context_timestep_idx")]
    pub context_timestep_idx: i64,
    #[serde(default = "default_num_inference_steps")]
    pub num_inference_steps: usize,
    /// Latent height and width of generated frames.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    /// Ignored when context frames are given (their batch size wins).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_use_kv_cache")]
    pub use_kv_cache: bool,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            unroll_length: 0,
            guidance_scale: default_guidance_scale(),
            context_timestep_idx: default_context_timestep_idx(),
            num_inference_steps: default_num_inference_steps(),
            sample_size: default_sample_size(),
            batch_size: default_batch_size(),
            use_kv_cache: default_use_kv_cache(),
        }
    }
}

fn default_guidance_scale() -> f64 {
    1.0
}

fn default_context_timestep_idx() -> i64 {
    CLEAN_CONTEXT_TIMESTEP
}

fn default_num_inference_steps() -> usize {
    50
}

fn default_sample_size() -> usize {
    32
}

fn default_batch_size() -> usize {
    1
}

fn default_use_kv_cache() -> bool {
    true
}

/// Per-unroll-step denoising options.
#[derive(Debug, Clone, Copy)]
pub struct StepOptions {
    pub guidance: Guidance,
    pub num_inference_steps: usize,
    pub context_timestep_idx: i64,
}

/// Frame-autoregressive diffusion pipeline.
pub struct FarPipeline<D, A, S> {
    denoiser: D,
    codec: LatentCodec<A>,
    scheduler: S,
    device: Device,
    generate_params: GenerateParams,
}

impl<D, A> FarPipeline<D, A, FlowMatchEulerScheduler>
where
    D: Denoiser,
    A: Autoencoder,
{
    /// Build a pipeline with the flow-matching Euler scheduler.
    ///
    /// `cfg.generate` becomes [`FarPipeline::generate_params`].
    pub fn from_config(denoiser: D, vae: A, cfg: &PipelineConfig, device: &Device) -> Self {
        let codec = LatentCodec::new(vae, &cfg.codec);
        let scheduler = FlowMatchEulerScheduler::new(cfg.scheduler.clone());
        Self::new(denoiser, codec, scheduler, device).with_generate_params(cfg.generate.clone())
    }
}

impl<D, A, S> FarPipeline<D, A, S>
where
    D: Denoiser,
    A: Autoencoder,
    S: Scheduler,
{
    pub fn new(denoiser: D, codec: LatentCodec<A>, scheduler: S, device: &Device) -> Self {
        Self {
            denoiser,
            codec,
            scheduler,
            device: device.clone(),
            generate_params: GenerateParams::default(),
        }
    }

    pub fn with_generate_params(mut self, params: GenerateParams) -> Self {
        self.generate_params = params;
        self
    }

    /// Configured generation parameters, ready to pass to [`Self::generate`].
    pub fn generate_params(&self) -> &GenerateParams {
        &self.generate_params
    }

    pub fn denoiser(&self) -> &D {
        &self.denoiser
    }

    pub fn codec(&self) -> &LatentCodec<A> {
        &self.codec
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Latents and noise use the autoencoder's dtype.
    pub fn dtype(&self) -> DType {
        self.codec.dtype()
    }

    /// Generate `unroll_length` frames after the optional `context` frames.
    ///
    /// `context` is `[B, T, C, H, W]` in `[0, 1]`. `generators` holds either
    /// one noise generator or one per batch element. Returns
    /// `[B, T + unroll_length, C, H', W']` in `[0, 1]`, context frames
    /// included (re-decoded from their latents).
    ///
    /// Working noise is drawn first; the first generator then also samples
    /// the autoencoder posterior of the context, so the whole call is
    /// reproducible from the seeds.
    pub fn generate(
        &mut self,
        params: &GenerateParams,
        context: Option<&Tensor>,
        conditions: Option<&Conditions>,
        generators: &mut [NoiseGenerator],
    ) -> Result<Tensor> {
        if params.num_inference_steps == 0 {
            return Err(Error::Config("num_inference_steps must be positive".into()));
        }
        let guidance = Guidance::from_scale(params.guidance_scale);

        let (batch_size, context_len) = match context {
            Some(ctx) => {
                let (b, t, _, _, _) = ctx.dims5()?;
                (b, t)
            }
            None => (params.batch_size, 0),
        };
        let total_frames = context_len + params.unroll_length;

        if total_frames == 0 {
            return Err(Error::Config(
                "nothing to generate: no context frames and unroll_length == 0".into(),
            ));
        }
        // Every step after the first sees context, either given or generated.
        if total_frames > 1 && params.context_timestep_idx != CLEAN_CONTEXT_TIMESTEP {
            return Err(Error::InvalidContextTimestep {
                expected: CLEAN_CONTEXT_TIMESTEP,
                got: params.context_timestep_idx,
            });
        }
        if let Some(Conditions::Action(actions)) = conditions {
            let available = actions.dim(1)?;
            if available < total_frames {
                return Err(Error::Config(format!(
                    "action sequence covers {available} frames, generation needs {total_frames}"
                )));
            }
        }

        let t0 = Instant::now();
        tracing::info!(
            unroll_length = params.unroll_length,
            context_frames = context_len,
            batch_size,
            guidance = %guidance,
            use_kv_cache = params.use_kv_cache,
            "starting autoregressive generation"
        );

        // 1. All working noise up front: [B, unroll, C, S, S]
        let latent_channels = self.denoiser.config().in_channels;
        let noise = randn_tensor(
            (
                batch_size,
                params.unroll_length,
                latent_channels,
                params.sample_size,
                params.sample_size,
            ),
            generators,
            &self.device,
            self.dtype(),
        )?;

        // 2. Encode vision context
        let mut latents = match (context, generators.first_mut()) {
            (Some(ctx), Some(generator)) if context_len > 0 => {
                Some(self.codec.encode_seeded(ctx, generator)?)
            }
            _ => None,
        };

        // 3. Unroll
        let mut cache = CacheState::<D::Cache>::new(params.use_kv_cache);
        let opts = StepOptions {
            guidance,
            num_inference_steps: params.num_inference_steps,
            context_timestep_idx: params.context_timestep_idx,
        };

        for step in context_len..total_frames {
            let t_step = Instant::now();
            let step_conditions = conditions.map(|c| c.for_step(step)).transpose()?;
            let working = noise.narrow(1, step - context_len, 1)?;

            let (frame, next_cache) =
                self.denoise_step(latents.as_ref(), working, step_conditions, cache, opts)?;
            cache = next_cache;

            let seq = match latents.take() {
                None => frame,
                Some(prev) => Tensor::cat(&[&prev, &frame], 1)?,
            };
            tracing::debug!(
                "unroll step {}/{}: {} latent frames, {:.2}s",
                step + 1 - context_len,
                params.unroll_length,
                seq.dim(1)?,
                t_step.elapsed().as_secs_f64()
            );
            latents = Some(seq);
        }

        // 4. Decode
        let latents =
            latents.ok_or_else(|| Error::Config("no latent frames were produced".into()))?;
        let video = self.codec.decode(&latents)?;

        tracing::info!(
            "generated {} frames in {:.2}s",
            params.unroll_length,
            t0.elapsed().as_secs_f64()
        );
        Ok(video)
    }

    /// Denoise one working frame `[B, 1, C, S, S]` against `vision_context`.
    ///
    /// Runs the whole scheduler schedule and returns the clean frame together
    /// with the cache state for the next unroll step.
    pub fn denoise_step(
        &mut self,
        vision_context: Option<&Tensor>,
        mut latents: Tensor,
        conditions: Option<Conditions>,
        mut cache: CacheState<D::Cache>,
        opts: StepOptions,
    ) -> Result<(Tensor, CacheState<D::Cache>)> {
        if vision_context.is_some() && opts.context_timestep_idx != CLEAN_CONTEXT_TIMESTEP {
            return Err(Error::InvalidContextTimestep {
                expected: CLEAN_CONTEXT_TIMESTEP,
                got: opts.context_timestep_idx,
            });
        }

        let batch_size = latents.dim(0)?;
        let model_batch = batch_size * opts.guidance.batch_multiplier();

        let conditions = conditions
            .map(|c| c.apply_guidance(opts.guidance, &self.denoiser.config().condition_cfg))
            .transpose()?;

        self.scheduler.set_timesteps(opts.num_inference_steps);

        // Prime the cache on the first call, only if there is context to cache.
        cache.is_cache_step = vision_context.is_some();

        let context_input = vision_context
            .map(|ctx| opts.guidance.expand_batch(ctx))
            .transpose()?;
        let context_timesteps = context_input
            .as_ref()
            .map(|ctx| -> Result<Tensor> {
                Ok(Tensor::full(
                    opts.context_timestep_idx as f32,
                    (model_batch, ctx.dim(1)?),
                    &self.device,
                )?)
            })
            .transpose()?;

        let timesteps = self.scheduler.timesteps().to_vec();
        for t in timesteps {
            let latent_input = opts.guidance.expand_batch(&latents)?;
            let working_len = latent_input.dim(1)?;

            // [B', 1] timestep per working frame, context tags prepended.
            let mut timestep = Tensor::full(t as f32, (model_batch, working_len), &self.device)?;
            let mut model_input = latent_input;
            if let (Some(ctx), Some(ctx_t)) = (&context_input, &context_timesteps) {
                timestep = Tensor::cat(&[ctx_t, &timestep], 1)?;
                model_input = Tensor::cat(&[ctx, &model_input], 1)?;
            }

            let (noise_pred, next_cache) =
                self.denoiser.predict(&model_input, &timestep, conditions.as_ref(), cache)?;
            cache = next_cache;
            cache.is_cache_step = false;

            // Keep only the working-frame predictions.
            let pred_len = noise_pred.dim(1)?;
            let noise_pred = if pred_len > working_len {
                noise_pred.narrow(1, pred_len - working_len, working_len)?
            } else {
                noise_pred
            };
            let noise_pred = noise_pred.to_dtype(latents.dtype())?;
            let noise_pred = opts.guidance.combine(&noise_pred)?;

            latents = self.scheduler.step(&noise_pred, t, &latents)?;
        }

        Ok((latents, cache))
    }
}
