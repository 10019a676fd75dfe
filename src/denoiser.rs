//! The denoising network as seen by the pipeline.
//!
//! The pipeline never looks inside a denoiser's key/value cache. It creates a
//! [`CacheState`] once per generation call, hands it to every
//! [`Denoiser::predict`] call and takes back the updated state. The only field
//! the pipeline itself writes is [`CacheState::is_cache_step`].

use candle_core::Tensor;

use crate::Result;
use crate::conditions::Conditions;
use crate::config::DenoiserConfig;

/// Context cache threaded through every denoiser call of one generation.
#[derive(Debug, Clone)]
pub struct CacheState<C> {
    /// True only for the call that feeds the current context through the
    /// network so its keys/values can be stored.
    pub is_cache_step: bool,
    /// Denoiser-owned store; `None` when caching is disabled.
    pub kv_cache: Option<C>,
    /// Number of sequence positions already held in `kv_cache`.
    pub cached_seqlen: usize,
    /// Whether per-layer storage inside `kv_cache` has been allocated.
    pub multi_level_cache_init: bool,
}

impl<C: Default> CacheState<C> {
    /// Fresh state for a new generation call.
    pub fn new(use_kv_cache: bool) -> Self {
        Self {
            is_cache_step: true,
            kv_cache: use_kv_cache.then(C::default),
            cached_seqlen: 0,
            multi_level_cache_init: false,
        }
    }
}

impl<C> CacheState<C> {
    pub fn is_enabled(&self) -> bool {
        self.kv_cache.is_some()
    }

    /// Record that the first `seqlen` positions are now cached.
    pub fn record_cached(&mut self, seqlen: usize) {
        self.cached_seqlen = seqlen;
        self.multi_level_cache_init = true;
    }
}

/// A noise-predicting diffusion transformer.
pub trait Denoiser {
    /// Opaque key/value store carried in [`CacheState::kv_cache`].
    type Cache: Default;

    /// Latent channel count and condition vocabulary.
    fn config(&self) -> &DenoiserConfig;

    /// Predict noise for `latents` `[B, T, C, H, W]` at per-position
    /// `timesteps` `[B, T]`. Context positions carry the clean-context
    /// timestep. Returns the prediction (same shape as `latents`, or just the
    /// trailing working frames) and the updated cache state.
    fn predict(
        &self,
        latents: &Tensor,
        timesteps: &Tensor,
        conditions: Option<&Conditions>,
        cache: CacheState<Self::Cache>,
    ) -> Result<(Tensor, CacheState<Self::Cache>)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_cache_state() {
        let enabled = CacheState::<Vec<u8>>::new(true);
        assert!(enabled.is_cache_step);
        assert!(enabled.is_enabled());
        assert_eq!(enabled.kv_cache.as_deref(), Some(&[][..]));
        assert_eq!(enabled.cached_seqlen, 0);
        assert!(!enabled.multi_level_cache_init);

        let disabled = CacheState::<Vec<u8>>::new(false);
        assert!(disabled.is_cache_step);
        assert!(!disabled.is_enabled());
    }

    #[test]
    fn test_record_cached() {
        let mut state = CacheState::<()>::new(true);
        state.record_cached(12);
        assert_eq!(state.cached_seqlen, 12);
        assert!(state.multi_level_cache_init);
    }
}
