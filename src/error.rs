//! Error types for far-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error. Shape and dtype mismatches surface here.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// A condition kind other than `label` or `action`.
    #[error("unsupported condition kind '{0}' (expected 'label' or 'action')")]
    UnsupportedCondition(String),

    /// Context positions must carry the clean-context timestep.
    #[error("context timestep index must be {expected} to mark clean context, got {got}")]
    InvalidContextTimestep { expected: i64, got: i64 },

    /// Invalid configuration or generation parameters.
    #[error("config: {0}")]
    Config(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame/GIF encoding error.
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
}
