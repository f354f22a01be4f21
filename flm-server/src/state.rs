//! Process-wide server state.
//!
//! Everything mutable lives in one [`ServerState`] value constructed at
//! startup and passed by shared handle: the admission gate, the engine slot,
//! the active-request map and the connection counter. No ambient statics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpStream;

use flm_engine::{CancelHandle, EngineRuntime, ModelCatalog};

use crate::gate::NpuGate;
use crate::http::{self, ChunkSender};

/// A session's socket, shareable with deferred tasks and blocking writers.
pub type SharedStream = Arc<tokio::sync::Mutex<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors: bool,
    pub max_connections: usize,
    pub io_threads: usize,
    pub max_body_bytes: usize,
    pub max_npu_queue: usize,
    pub request_timeout: Duration,
    /// Tag served when a request names no model.
    pub default_model: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 52625,
            cors: true,
            max_connections: 10,
            io_threads: 10,
            max_body_bytes: 256 * 1024 * 1024,
            max_npu_queue: 10,
            request_timeout: Duration::from_secs(600),
            default_model: String::new(),
        }
    }
}

pub struct ServerState {
    pub config: ServerConfig,
    pub gate: NpuGate,
    /// Catalog reads never wait on the engine lock.
    pub catalog: Arc<ModelCatalog>,
    pub engine: parking_lot::Mutex<EngineRuntime>,
    /// Tag currently resident on the device, for `/api/ps`.
    pub loaded_tag: parking_lot::Mutex<Option<String>>,
    pub active_requests: DashMap<String, CancelHandle>,
    pub connections: AtomicUsize,
    request_counter: AtomicU64,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        catalog: Arc<ModelCatalog>,
        engine: EngineRuntime,
    ) -> Arc<Self> {
        let gate = NpuGate::new(config.max_npu_queue);
        Arc::new(Self {
            config,
            gate,
            catalog,
            engine: parking_lot::Mutex::new(engine),
            loaded_tag: parking_lot::Mutex::new(None),
            active_requests: DashMap::new(),
            connections: AtomicUsize::new(0),
            request_counter: AtomicU64::new(0),
        })
    }

    /// Request id for bodies that carry none.
    pub fn next_request_id(&self) -> String {
        format!("req_{}", self.request_counter.fetch_add(1, Ordering::SeqCst))
    }

    pub fn register_request(&self, id: &str, handle: CancelHandle) {
        self.active_requests.insert(id.to_string(), handle);
    }

    pub fn unregister_request(&self, id: &str) {
        self.active_requests.remove(id);
    }

    /// Flip an active request's cancellation token. `false` when the id is
    /// unknown (already finished or never seen).
    pub fn cancel_request(&self, id: &str) -> bool {
        match self.active_requests.remove(id) {
            Some((_, handle)) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }
}

/// Synchronous chunk writer used from generation threads: each send blocks
/// the caller until the frame is on the socket, so a slow client throttles
/// the generation loop. Headers go out once, before the first chunk.
pub struct BlockingChunkSender {
    handle: tokio::runtime::Handle,
    stream: SharedStream,
    content_type: &'static str,
    cors: bool,
    headers_sent: bool,
}

impl BlockingChunkSender {
    pub fn new(
        handle: tokio::runtime::Handle,
        stream: SharedStream,
        content_type: &'static str,
        cors: bool,
    ) -> Self {
        Self {
            handle,
            stream,
            content_type,
            cors,
            headers_sent: false,
        }
    }
}

impl ChunkSender for BlockingChunkSender {
    fn send(&mut self, payload: &str, is_final: bool) -> bool {
        let mut frame = Vec::new();
        if !self.headers_sent {
            frame.extend_from_slice(&http::encode_stream_headers(self.content_type, self.cors));
            self.headers_sent = true;
        }
        frame.extend_from_slice(&http::encode_chunk(payload.as_bytes()));
        if is_final {
            frame.extend_from_slice(http::chunk_terminator());
        }
        let stream = self.stream.clone();
        self.handle.block_on(async move {
            let mut guard = stream.lock().await;
            http::write_all(&mut guard, &frame).await.is_ok()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.max_body_bytes, 268_435_456);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.max_npu_queue, 10);
        assert_eq!(config.request_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_cancel_unknown_request() {
        // Exercised without an engine: the map is independent state.
        let map: DashMap<String, CancelHandle> = DashMap::new();
        let handle = CancelHandle::new();
        map.insert("req_1".into(), handle.clone());
        let (_, removed) = map.remove("req_1").unwrap();
        removed.cancel();
        assert!(handle.cancelled());
        assert!(map.remove("req_1").is_none());
    }
}
