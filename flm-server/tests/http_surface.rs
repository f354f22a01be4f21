//! End-to-end wire tests over loopback.
//!
//! These exercise the surface that never touches the accelerator: preflight,
//! routing, the body-size bound, admission refusal and cancellation. Each
//! request carries `Connection: close` so the response can be read to EOF.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use flm_engine::catalog::ModelCatalog;
use flm_engine::{CancelHandle, EngineRuntime};
use flm_npu::PowerMode;
use flm_server::{Server, ServerConfig, ServerState};

fn test_catalog(dir: &std::path::Path) -> Arc<ModelCatalog> {
    let list = dir.join("model_list.json");
    std::fs::write(
        &list,
        serde_json::json!({
            "model_path": "models",
            "models": {
                "llama3.2": {
                    "1b": {
                        "name": "Llama-3.2-1B-Instruct-NPU",
                        "url": "https://models.example/llama32-1b",
                        "files": ["config.json"],
                        "flm_min_version": "0.9.0",
                        "details": {
                            "family": "llama",
                            "parameter_size": "1.2B",
                            "quantization_level": "Q4_NX"
                        }
                    }
                }
            }
        })
        .to_string(),
    )
    .unwrap();
    Arc::new(ModelCatalog::load(&list, dir.join("models")).unwrap())
}

async fn spawn_server(config: ServerConfig) -> (std::net::SocketAddr, Arc<ServerState>) {
    let dir = tempfile::tempdir().unwrap();
    let catalog = test_catalog(dir.path());
    let engine = EngineRuntime::deferred(PowerMode::Performance, false, catalog.clone(), None);
    let state = ServerState::new(config, catalog, engine);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_state = state.clone();
    tokio::spawn(async move {
        let _ = Server::new(server_state).serve_on(listener).await;
    });
    // The tempdir can go away once the catalog is parsed.
    drop(dir);
    (addr, state)
}

async fn roundtrip(addr: std::net::SocketAddr, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    stream.flush().await.unwrap();
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).into_owned()
}

fn request(method: &str, path: &str, body: &str) -> Vec<u8> {
    format!(
        "{method} {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

fn body_json(response: &str) -> serde_json::Value {
    let body = response
        .split("\r\n\r\n")
        .nth(1)
        .expect("response has a body");
    serde_json::from_str(body).expect("body is JSON")
}

#[tokio::test]
async fn test_preflight_carries_cors_headers() {
    let (addr, _state) = spawn_server(ServerConfig::default()).await;
    let response = roundtrip(
        addr,
        b"OPTIONS /v1/chat/completions HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.contains("Access-Control-Allow-Origin: *"));
    assert!(response.contains("Access-Control-Allow-Methods: GET, POST, OPTIONS"));
    assert!(response
        .contains("Access-Control-Allow-Headers: Content-Type, Authorization, X-Requested-With"));
    assert!(response.ends_with("\r\n\r\n"), "empty body expected");
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (addr, _state) = spawn_server(ServerConfig::default()).await;
    let response = roundtrip(addr, &request("POST", "/api/unknown", "{}")).await;
    assert!(response.starts_with("HTTP/1.1 404"));
    assert_eq!(body_json(&response)["error"], "Not Found");
}

#[tokio::test]
async fn test_oversize_body_is_413() {
    let config = ServerConfig {
        max_body_bytes: 1024,
        ..Default::default()
    };
    let (addr, _state) = spawn_server(config).await;
    let oversized = "x".repeat(4096);
    let response = roundtrip(addr, &request("POST", "/api/chat", &oversized)).await;
    assert!(response.starts_with("HTTP/1.1 413"), "{response}");
    let body = body_json(&response);
    assert_eq!(body["error"], "Request payload too large");
    assert_eq!(body["max_bytes"], 1024);
}

#[tokio::test]
async fn test_version_and_tags() {
    let (addr, _state) = spawn_server(ServerConfig::default()).await;
    let response = roundtrip(addr, &request("GET", "/api/version", "")).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(body_json(&response)["version"], flm_engine::FLM_VERSION);

    let response = roundtrip(addr, &request("GET", "/api/tags", "")).await;
    let body = body_json(&response);
    assert_eq!(body["models"][0]["name"], "llama3.2:1b");

    let response = roundtrip(addr, &request("GET", "/v1/models", "")).await;
    let body = body_json(&response);
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "llama3.2:1b");
}

#[tokio::test]
async fn test_queue_full_refuses_with_503() {
    let config = ServerConfig {
        max_npu_queue: 0,
        ..Default::default()
    };
    let (addr, state) = spawn_server(config).await;
    // Simulate an in-flight accelerator request holding the gate.
    assert!(state.gate.try_acquire());

    let body = r#"{"model":"llama3.2:1b","messages":[{"role":"user","content":"Hello"}]}"#;
    let response = roundtrip(addr, &request("POST", "/api/chat", body)).await;
    assert!(response.starts_with("HTTP/1.1 503"), "{response}");
    let error = body_json(&response)["error"].as_str().unwrap().to_string();
    assert!(error.contains("queue is full"), "{error}");

    assert!(state.gate.release_and_pop().is_none());
}

#[tokio::test]
async fn test_cancel_flips_active_request() {
    let (addr, state) = spawn_server(ServerConfig::default()).await;

    let response =
        roundtrip(addr, &request("POST", "/api/cancel", r#"{"request_id":"ghost"}"#)).await;
    assert_eq!(body_json(&response)["cancelled"], false);

    let handle = CancelHandle::new();
    state.register_request("req_42", handle.clone());
    let response =
        roundtrip(addr, &request("POST", "/api/cancel", r#"{"request_id":"req_42"}"#)).await;
    assert_eq!(body_json(&response)["cancelled"], true);
    assert!(handle.cancelled());
}

#[tokio::test]
async fn test_ps_reports_nothing_until_a_model_loads() {
    let (addr, state) = spawn_server(ServerConfig::default()).await;
    let response = roundtrip(addr, &request("GET", "/api/ps", "")).await;
    assert_eq!(body_json(&response)["models"], serde_json::json!([]));

    *state.loaded_tag.lock() = Some("llama3.2:1b".to_string());
    let response = roundtrip(addr, &request("GET", "/api/ps", "")).await;
    assert_eq!(body_json(&response)["models"][0]["name"], "llama3.2:1b");
}
