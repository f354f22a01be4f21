//! Model Execution Engine
//!
//! Everything between the HTTP surface and the device layer:
//! - model configuration and the model catalog ([`config`], [`catalog`])
//! - the quantized weight archive and its tile reordering ([`archive`])
//! - the paged KV cache with sliding/full attention scheduling ([`kv`])
//! - the sampler chain ([`sampler`])
//! - chat templates and stop tokens ([`template`])
//! - the streaming token generator ([`model`])
//! - speech-to-text ([`asr`]) and the model downloader ([`download`])

pub mod archive;
pub mod asr;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod download;
pub mod error;
pub mod kv;
pub mod meta;
pub mod model;
pub mod runtime;
pub mod sampler;
pub mod template;
pub mod version;

pub use archive::WeightArchive;
pub use cancel::CancelHandle;
pub use catalog::ModelCatalog;
pub use config::LmConfig;
pub use download::ModelDownloader;
pub use error::EngineError;
pub use kv::KvCache;
pub use meta::{ChatMeta, StopReason};
pub use model::{AutoModel, LmInput, TokenSink};
pub use runtime::EngineRuntime;
pub use sampler::{Sampler, SamplerParams};

/// Runtime version reported by the CLI and the version endpoints.
pub const FLM_VERSION: &str = "0.9.30";

pub type Result<T> = std::result::Result<T, EngineError>;
