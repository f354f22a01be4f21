//! HTTP/1.1 wire handling.
//!
//! Requests are read head-first with a bounded body; responses and chunked
//! transfer frames are written by hand. Headers for a streaming response go
//! out once, synchronously, before the first chunk.

use std::collections::HashMap;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Largest accepted request head (start line + headers).
const MAX_HEAD_BYTES: usize = 64 * 1024;

pub const CORS_HEADERS: &str = "Access-Control-Allow-Origin: *\r\n\
Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
Access-Control-Allow-Headers: Content-Type, Authorization, X-Requested-With\r\n";

#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("")
    }

    pub fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(value) => !value.eq_ignore_ascii_case("close"),
            None => self.version != "HTTP/1.0",
        }
    }
}

#[derive(Debug)]
pub enum ReadError {
    /// Peer closed before a full request arrived.
    Closed,
    /// Body over the configured bound. `declared` is the Content-Length the
    /// peer announced; the session drains it before responding so the 413
    /// reaches the client instead of a reset.
    TooLarge { max_bytes: usize, declared: usize },
    Malformed(String),
    Io(std::io::Error),
}

/// Discard `declared` unread body bytes so the error response survives.
pub async fn drain_body(stream: &mut TcpStream, declared: usize) {
    let mut remaining = declared;
    let mut scratch = [0u8; 64 * 1024];
    while remaining > 0 {
        let take = remaining.min(scratch.len());
        match stream.read(&mut scratch[..take]).await {
            Ok(0) | Err(_) => break,
            Ok(n) => remaining -= n,
        }
    }
}

impl From<std::io::Error> for ReadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Read one request off the socket. The body is bounded by `max_body`.
pub async fn read_request(
    stream: &mut TcpStream,
    max_body: usize,
) -> Result<HttpRequest, ReadError> {
    let mut head = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    // Head first: scan for the blank line without over-reading the body.
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            if head.is_empty() {
                return Err(ReadError::Closed);
            }
            return Err(ReadError::Malformed("connection closed mid-head".into()));
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_HEAD_BYTES {
            return Err(ReadError::Malformed("request head too large".into()));
        }
    }

    let head_text = String::from_utf8_lossy(&head);
    let mut lines = head_text.split("\r\n");
    let start = lines.next().unwrap_or_default();
    let mut parts = start.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ReadError::Malformed("empty start line".into()))?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| ReadError::Malformed("start line has no target".into()))?
        .to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_length > max_body {
        return Err(ReadError::TooLarge {
            max_bytes: max_body,
            declared: content_length,
        });
    }
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        stream.read_exact(&mut body).await?;
    }

    Ok(HttpRequest {
        method,
        path,
        version,
        headers,
        body,
    })
}

/// Pushes framed payloads to a client. Implementations return `false` once
/// the connection is unusable; emitters stop generating on that signal.
pub trait ChunkSender {
    fn send(&mut self, payload: &str, is_final: bool) -> bool;
}

/// A plain (non-streaming) response.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    pub keep_alive: bool,
}

impl HttpResponse {
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: value.to_string().into_bytes(),
            keep_alive: true,
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "error": message }))
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: Vec::new(),
            keep_alive: true,
        }
    }
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "OK",
    }
}

/// Serialize a full response, headers first.
pub fn encode_response(res: &HttpResponse, cors: bool) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: {}\r\n",
        res.status,
        status_text(res.status),
        res.content_type,
        res.body.len(),
        if res.keep_alive { "keep-alive" } else { "close" },
    );
    if cors {
        out.push_str(CORS_HEADERS);
    }
    out.push_str("\r\n");
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&res.body);
    bytes
}

/// Header block opening a chunked streaming response.
pub fn encode_stream_headers(content_type: &str, cors: bool) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\nTransfer-Encoding: chunked\r\n"
    );
    if cors {
        out.push_str(CORS_HEADERS);
    }
    out.push_str("\r\n");
    out.into_bytes()
}

/// One chunked-transfer frame: `<hex length>\r\n<bytes>\r\n`.
pub fn encode_chunk(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    out
}

/// The zero-length terminator frame.
pub fn chunk_terminator() -> &'static [u8] {
    b"0\r\n\r\n"
}

pub async fn write_all(stream: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(bytes).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_framing() {
        assert_eq!(encode_chunk(b"hello"), b"5\r\nhello\r\n".to_vec());
        assert_eq!(encode_chunk(&[0u8; 16]).len(), 2 + 2 + 16 + 2);
        assert_eq!(chunk_terminator(), b"0\r\n\r\n");
    }

    #[test]
    fn test_response_encoding_includes_cors() {
        let res = HttpResponse::error(404, "Not Found");
        let plain = String::from_utf8(encode_response(&res, false)).unwrap();
        assert!(plain.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(!plain.contains("Access-Control-Allow-Origin"));
        let with_cors = String::from_utf8(encode_response(&res, true)).unwrap();
        assert!(with_cors.contains("Access-Control-Allow-Origin: *"));
        assert!(with_cors.contains("Access-Control-Allow-Methods: GET, POST, OPTIONS"));
        assert!(with_cors
            .contains("Access-Control-Allow-Headers: Content-Type, Authorization, X-Requested-With"));
    }

    #[test]
    fn test_stream_headers_come_before_any_chunk() {
        let head = String::from_utf8(encode_stream_headers("application/x-ndjson", true)).unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Transfer-Encoding: chunked"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_read_request_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            write_all(
                &mut stream,
                b"POST /api/chat HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 7\r\n\r\n{\"a\":1}",
            )
            .await
            .unwrap();
            stream
        });
        let (mut server_side, _) = listener.accept().await.unwrap();
        let req = read_request(&mut server_side, 1024).await.unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/api/chat");
        assert_eq!(req.body, b"{\"a\":1}");
        assert!(req.keep_alive());
        let _ = client.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_request_rejects_oversize_body() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            write_all(
                &mut stream,
                b"POST /api/chat HTTP/1.1\r\nContent-Length: 999999\r\n\r\n",
            )
            .await
            .unwrap();
            stream
        });
        let (mut server_side, _) = listener.accept().await.unwrap();
        match read_request(&mut server_side, 1024).await {
            Err(ReadError::TooLarge { max_bytes, declared }) => {
                assert_eq!(max_bytes, 1024);
                assert_eq!(declared, 999_999);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
        let _ = client.await.unwrap();
    }
}
