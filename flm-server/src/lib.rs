//! HTTP Front-End
//!
//! A session-per-connection HTTP/1.1 server on the tokio reactor:
//! - request parsing with a bounded body and keep-alive ([`http`])
//! - the per-connection read/respond loop ([`session`])
//! - accelerator-exclusive admission control and the bounded deferral
//!   queue ([`gate`])
//! - UTF-8 boundary-safe streaming and the reasoning-channel filter
//!   ([`filter`])
//! - the Ollama and OpenAI wire formats ([`ollama`], [`openai`])
//! - request routing and the endpoint handlers ([`routes`])
//!
//! Accelerator-exclusive routes serialize on a single process-wide gate;
//! everything else runs concurrently. Generation runs on blocking threads
//! and writes its chunks synchronously, so a slow client throttles
//! generation rather than queueing unbounded output.

pub mod filter;
pub mod gate;
pub mod http;
pub mod multipart;
pub mod ollama;
pub mod openai;
pub mod routes;
pub mod session;
pub mod state;

pub use session::Server;
pub use state::{ServerConfig, ServerState};
