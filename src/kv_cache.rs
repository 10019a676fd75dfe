//! Per-layer key/value store for context caching.
//!
//! A ready-made [`Denoiser::Cache`](crate::denoiser::Denoiser::Cache): one
//! `candle_nn` [`KvCache`] per transformer layer, allocated on the first cache
//! step rather than up front, since the pipeline creates the store before the
//! denoiser knows its layer count.

use candle_core::Tensor;
use candle_nn::kv_cache::KvCache;

use crate::denoiser::CacheState;
use crate::{Error, Result};

/// Keys/values for every layer of a denoiser.
#[derive(Debug, Clone, Default)]
pub struct MultiLevelKvCache {
    levels: Vec<KvCache>,
}

impl MultiLevelKvCache {
    /// Allocate `num_levels` caches concatenating along `seq_dim`.
    ///
    /// Returns `true` if storage was allocated by this call.
    pub fn ensure_levels(&mut self, num_levels: usize, seq_dim: usize, max_seq_len: usize) -> bool {
        if !self.levels.is_empty() {
            return false;
        }
        self.levels = (0..num_levels)
            .map(|_| KvCache::new(seq_dim, max_seq_len))
            .collect();
        true
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Append keys/values to one layer, returning everything cached for it.
    pub fn append(&mut self, level: usize, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let num_levels = self.levels.len();
        let cache = self
            .levels
            .get_mut(level)
            .ok_or_else(|| Error::Config(format!("kv level {level} out of {num_levels}")))?;
        Ok(cache.append(&k.contiguous()?, &v.contiguous()?)?)
    }

    /// Cached keys/values of one layer, if any were appended.
    pub fn level(&self, level: usize) -> Result<Option<(Tensor, Tensor)>> {
        let Some(cache) = self.levels.get(level) else {
            return Ok(None);
        };
        match (cache.k()?, cache.v()?) {
            (Some(k), Some(v)) => Ok(Some((k, v))),
            _ => Ok(None),
        }
    }

    /// Sequence length held by the first layer (all layers advance together).
    pub fn seq_len(&self) -> usize {
        self.levels.first().map_or(0, |c| c.current_seq_len())
    }

    pub fn reset(&mut self) {
        for cache in self.levels.iter_mut() {
            cache.reset();
        }
    }
}

impl CacheState<MultiLevelKvCache> {
    /// Lazily allocate per-layer storage and mark it initialized.
    ///
    /// No-op when caching is disabled or storage already exists.
    pub fn ensure_levels(&mut self, num_levels: usize, seq_dim: usize, max_seq_len: usize) {
        if self.multi_level_cache_init {
            return;
        }
        if let Some(store) = self.kv_cache.as_mut() {
            store.ensure_levels(num_levels, seq_dim, max_seq_len);
            self.multi_level_cache_init = true;
        }
    }
}
