//! Accept loop and per-connection sessions.
//!
//! One session per socket. Within a session, requests are strictly
//! serialized: the next request is not read until the previous response has
//! been fully written, including responses written out-of-line by a
//! deferred task. Connections past the configured limit are closed right
//! after accept.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::http::{self, HttpResponse, ReadError};
use crate::routes;
use crate::state::{ServerState, SharedStream};

pub struct Server {
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Bind and serve until the process exits.
    pub async fn run(&self) -> std::io::Result<()> {
        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(
            target: "flm::server",
            %addr,
            workers = self.state.config.io_threads,
            "server listening"
        );
        self.serve_on(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve_on(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let active = self.state.connections.load(Ordering::SeqCst);
            if active >= self.state.config.max_connections {
                warn!(
                    target: "flm::server",
                    %peer,
                    limit = self.state.config.max_connections,
                    "connection limit reached, rejecting"
                );
                drop(stream);
                continue;
            }
            self.state.connections.fetch_add(1, Ordering::SeqCst);
            debug!(target: "flm::server", %peer, "connection established");
            let state = self.state.clone();
            tokio::spawn(async move {
                let shared: SharedStream = Arc::new(tokio::sync::Mutex::new(stream));
                Session { stream: shared, state }.serve().await;
            });
        }
    }
}

struct Session {
    stream: SharedStream,
    state: Arc<ServerState>,
}

impl Session {
    async fn serve(self) {
        loop {
            let cors = self.state.config.cors;
            let request = {
                let mut guard = self.stream.lock().await;
                let read = timeout(
                    self.state.config.request_timeout,
                    http::read_request(&mut guard, self.state.config.max_body_bytes),
                )
                .await;
                match read {
                    Ok(Ok(request)) => request,
                    Ok(Err(ReadError::Closed)) => break,
                    Ok(Err(ReadError::TooLarge { max_bytes, declared })) => {
                        http::drain_body(&mut guard, declared).await;
                        let mut res = HttpResponse::json(
                            413,
                            &serde_json::json!({
                                "error": "Request payload too large",
                                "max_bytes": max_bytes,
                            }),
                        );
                        res.keep_alive = false;
                        let _ = http::write_all(&mut guard, &http::encode_response(&res, cors))
                            .await;
                        break;
                    }
                    Ok(Err(ReadError::Malformed(reason))) => {
                        debug!(target: "flm::server", %reason, "malformed request");
                        let mut res = HttpResponse::error(400, &reason);
                        res.keep_alive = false;
                        let _ = http::write_all(&mut guard, &http::encode_response(&res, cors))
                            .await;
                        break;
                    }
                    Ok(Err(ReadError::Io(_))) => break,
                    Err(_) => {
                        debug!(target: "flm::server", "request read timed out");
                        break;
                    }
                }
            };

            debug!(
                target: "flm::server",
                method = %request.method,
                path = %request.path,
                "incoming request"
            );
            let close = routes::dispatch(self.state.clone(), self.stream.clone(), request).await;
            if close {
                break;
            }
        }
        self.state.connections.fetch_sub(1, Ordering::SeqCst);
        let mut guard = self.stream.lock().await;
        let _ = guard.shutdown().await;
        debug!(target: "flm::server", "connection closed");
    }
}
