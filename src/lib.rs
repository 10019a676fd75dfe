//! Frame-autoregressive video diffusion in pure Rust.
//!
//! A candle-based inference pipeline that generates video one frame at a
//! time: each new frame is denoised from noise by a diffusion transformer
//! that attends to every frame generated (or given) so far, optionally
//! reusing a key/value cache of that context.
//!
//! ## Architecture
//!
//! ```text
//! context frames ─→ LatentCodec::encode ─→ clean latents ─┐
//!                                                          ├→ [context, noisy frame]
//! seeded noise (one frame per unroll step) ───────────────┘          ↓
//!                              Denoiser (+ KV cache, CFG) × scheduler steps
//!                                                                     ↓
//!                                      clean frame, appended to the context
//!                                                                     ↓
//!                                           LatentCodec::decode → video
//! ```
//!
//! The autoencoder and the denoising network are supplied by the caller
//! through the [`codec::Autoencoder`] and [`denoiser::Denoiser`] traits.
//!
//! ## Modules
//!
//! - [`pipeline`]: the unroll loop and the per-frame denoising loop
//! - [`codec`]: pixel ↔ latent conversion around an autoencoder
//! - [`denoiser`]: denoiser interface and the cache state it threads
//! - [`kv_cache`]: per-layer key/value store for denoisers
//! - [`conditions`]: label/action conditioning and guidance modes
//! - [`scheduler`]: flow-matching Euler scheduler
//! - [`noise`]: seeded Gaussian noise
//! - [`video`]: JPEG/GIF export of generated videos
//! - [`config`]: serde configuration

pub mod codec;
pub mod conditions;
pub mod config;
pub mod denoiser;
pub mod kv_cache;
pub mod noise;
pub mod pipeline;
pub mod scheduler;
pub mod video;

mod error;

pub use error::{Error, Result};
pub use pipeline::{CLEAN_CONTEXT_TIMESTEP, FarPipeline, GenerateParams};
