//! Latent codec: pixel frames ↔ scaled autoencoder latents.
//!
//! Pixels are `[B, T, C, H, W]` in `[0, 1]`; latents are `[B, T, C', H', W']`
//! multiplied by the autoencoder's scaling factor. The codec hides how the
//! wrapped autoencoder batches its inputs:
//!
//! ```text
//! encode:  [B,T,C,H,W] → ×2−1 → [(B·T),C,H,W] → encoder → ×scale → [B,T,C',H',W']
//! decode:  per-frame:   [B,T,C',H',W'] → [(B·T),C',H',W'] → decoder → [B,T,C,H,W]
//!          time-aware:  [B,T,C',H',W'] → [B,C',T,H',W']   → decoder → [B,T,C,H,W]
//!          then /2+0.5, clamp to [0, 1]
//! ```

use candle_core::{DType, Tensor};

use crate::Result;
use crate::config::{AutoencoderKind, CodecConfig};
use crate::noise::{NoiseGenerator, randn_tensor};

/// Log-variance is clamped to this range before computing the std.
const LOGVAR_MIN: f64 = -30.0;
const LOGVAR_MAX: f64 = 20.0;

/// Diagonal Gaussian over latents, parameterized by mean and log-variance.
#[derive(Debug, Clone)]
pub struct DiagonalGaussian {
    mean: Tensor,
    logvar: Tensor,
}

impl DiagonalGaussian {
    pub fn new(mean: Tensor, logvar: Tensor) -> Result<Self> {
        let logvar = logvar.clamp(LOGVAR_MIN, LOGVAR_MAX)?;
        Ok(Self { mean, logvar })
    }

    /// Split encoder moments `[N, 2·C', H', W']` into mean and log-variance.
    pub fn from_moments(moments: &Tensor) -> Result<Self> {
        let halves = moments.chunk(2, 1)?;
        Self::new(halves[0].clone(), halves[1].clone())
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    /// Draw `mean + std * ε`, with `ε` from `generator` when given and
    /// from the device RNG otherwise.
    pub fn sample(&self, generator: Option<&mut NoiseGenerator>) -> Result<Tensor> {
        let std = (&self.logvar * 0.5)?.exp()?;
        let eps = match generator {
            Some(generator) => randn_tensor(
                self.mean.shape().clone(),
                std::slice::from_mut(generator),
                self.mean.device(),
                self.mean.dtype(),
            )?,
            None => self.mean.randn_like(0.0, 1.0)?,
        };
        Ok((&self.mean + (std * eps)?)?)
    }
}

/// What an autoencoder's encoder produces.
#[derive(Debug, Clone)]
pub enum EncoderOutput {
    /// KL autoencoders: a distribution to sample from.
    LatentDist(DiagonalGaussian),
    /// Deterministic autoencoders: the latent itself.
    Latent(Tensor),
}

impl EncoderOutput {
    pub fn into_latent(self, generator: Option<&mut NoiseGenerator>) -> Result<Tensor> {
        match self {
            EncoderOutput::LatentDist(dist) => dist.sample(generator),
            EncoderOutput::Latent(latent) => Ok(latent),
        }
    }
}

/// A pretrained autoencoder.
///
/// Per-frame autoencoders see `[N, C, H, W]` on both sides. Time-aware ones
/// encode `[N, C, H, W]` frames but decode `[B, C', T, H', W']` clips.
pub trait Autoencoder {
    /// Dtype the network weights run in; inputs are cast to it.
    fn dtype(&self) -> DType;

    fn encode(&self, pixels: &Tensor) -> Result<EncoderOutput>;

    fn decode(&self, latents: &Tensor) -> Result<Tensor>;
}

/// Wraps an [`Autoencoder`] with layout conversion and latent scaling.
#[derive(Debug, Clone)]
pub struct LatentCodec<A> {
    vae: A,
    kind: AutoencoderKind,
    scaling_factor: f64,
}

impl<A: Autoencoder> LatentCodec<A> {
    pub fn new(vae: A, cfg: &CodecConfig) -> Self {
        Self {
            vae,
            kind: cfg.kind,
            scaling_factor: cfg.scaling_factor,
        }
    }

    pub fn kind(&self) -> AutoencoderKind {
        self.kind
    }

    pub fn scaling_factor(&self) -> f64 {
        self.scaling_factor
    }

    pub fn dtype(&self) -> DType {
        self.vae.dtype()
    }

    pub fn autoencoder(&self) -> &A {
        &self.vae
    }

    /// Encode context frames `[B, T, C, H, W]` in `[0, 1]` to scaled latents.
    ///
    /// KL autoencoders sample their posterior with the device RNG here, so
    /// the result is not reproducible from a seed. Use [`Self::encode_seeded`]
    /// for that.
    pub fn encode(&self, context: &Tensor) -> Result<Tensor> {
        self.encode_with(context, None)
    }

    /// Like [`Self::encode`], drawing posterior samples from `generator`.
    pub fn encode_seeded(
        &self,
        context: &Tensor,
        generator: &mut NoiseGenerator,
    ) -> Result<Tensor> {
        self.encode_with(context, Some(generator))
    }

    fn encode_with(
        &self,
        context: &Tensor,
        generator: Option<&mut NoiseGenerator>,
    ) -> Result<Tensor> {
        let (b, t, c, h, w) = context.dims5()?;

        // [0, 1] -> [-1, 1]
        let pixels = context
            .affine(2.0, -1.0)?
            .reshape((b * t, c, h, w))?
            .to_dtype(self.vae.dtype())?;

        let latents = self.vae.encode(&pixels)?.into_latent(generator)?;
        let latents = (latents * self.scaling_factor)?;

        let (_, lc, lh, lw) = latents.dims4()?;
        Ok(latents.reshape((b, t, lc, lh, lw))?)
    }

    /// Decode scaled latents `[B, T, C', H', W']` to frames in `[0, 1]`.
    pub fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let (b, t, lc, lh, lw) = latents.dims5()?;
        let latents = (latents * (1.0 / self.scaling_factor))?.to_dtype(self.vae.dtype())?;

        let samples = match self.kind {
            AutoencoderKind::TimeAware => {
                let clip = latents.permute((0, 2, 1, 3, 4))?.contiguous()?;
                self.vae.decode(&clip)?.permute((0, 2, 1, 3, 4))?.contiguous()?
            }
            AutoencoderKind::PerFrame => {
                let frames = latents.reshape((b * t, lc, lh, lw))?;
                let decoded = self.vae.decode(&frames)?;
                let (_, c, h, w) = decoded.dims4()?;
                decoded.reshape((b, t, c, h, w))?
            }
        };

        // [-1, 1] -> [0, 1]
        Ok(samples.affine(0.5, 0.5)?.clamp(0.0, 1.0)?)
    }
}
