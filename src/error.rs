/* ------------------------------------------------------------------ */
/* Crate-wide error type                                              */
/* ------------------------------------------------------------------ */

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected before any computation starts (unknown architecture,
    /// unknown schedule, inconsistent flags).
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to deserialize {path}: {source}")]
    Deserialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed embedding file {path}: {reason}")]
    Embedding { path: PathBuf, reason: String },

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
