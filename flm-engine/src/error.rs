//! Engine error taxonomy.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed request shape: missing field, bad parameter, unusable input.
    #[error("{0}")]
    InvalidRequest(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// The archive wants a different runtime version than this build.
    #[error("model requires flm >= {required}, this build is {current}")]
    ModelIncompatible { required: String, current: String },

    #[error("download failed: {0}")]
    DownloadFailure(String),

    /// Generation asked to push past the compiled context window.
    #[error("maximum context length reached")]
    MaxContextReached,

    #[error("weight archive error: {0}")]
    Archive(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Npu(#[from] flm_npu::NpuError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
