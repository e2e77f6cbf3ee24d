//! Error types for tacotron-gmm.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid or unknown configuration value. Raised at construction time.
    #[error("config: {0}")]
    Config(String),

    /// Checkpoint could not be opened or is missing tensors.
    #[error("weight load: {0}")]
    WeightLoad(String),

    /// Input data disagrees with the configured shapes.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub(crate) fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }
}
