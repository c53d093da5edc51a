use crate::http::types::{HeaderMap, Status};
use crate::net::reactor::ChunkProducer;
use chrono::Utc;

/// Identifies the server build in the `Server` header.
pub const SERVER: &str = concat!("mortar/", env!("CARGO_PKG_VERSION"));

/// Response payload. Ownership moves from the handler into the protocol
/// engine when the handler returns.
pub enum Body {
    /// Fixed body, emitted with `Content-Length`.
    Bytes(Vec<u8>),
    /// Pull stream, emitted chunked; `None` ends it.
    Stream(ChunkProducer),
    /// Push stream (SSE): the preamble is written immediately, later bytes
    /// arrive through the reactor.
    Push(Vec<u8>),
}

pub struct HttpResponse {
    pub status: Status,
    pub headers: HeaderMap,
    pub body: Body,
}

impl HttpResponse {
    pub fn new(status: Status) -> HttpResponse {
        HttpResponse {
            status,
            headers: HeaderMap::new(),
            body: Body::Bytes(Vec::new()),
        }
    }

    pub fn text(status: Status, body: &str) -> HttpResponse {
        let mut response = HttpResponse::new(status);

        response.headers.set("Content-Type", "text/plain");
        response.body = Body::Bytes(body.as_bytes().to_vec());
        response
    }

    pub fn json(status: Status, body: String) -> HttpResponse {
        let mut response = HttpResponse::new(status);

        response.headers.set("Content-Type", "application/json");
        response.body = Body::Bytes(body.into_bytes());
        response
    }

    /// Chunked response fed by a producer closure.
    pub fn stream(content_type: &str, producer: ChunkProducer) -> HttpResponse {
        let mut response = HttpResponse::new(Status::OK);

        response.headers.set("Content-Type", content_type);
        response.body = Body::Stream(producer);
        response
    }

    /// Server-sent event channel. The preamble (replayed events) goes out
    /// with the headers; live events are pushed afterwards.
    pub fn sse(preamble: Vec<u8>) -> HttpResponse {
        let mut response = HttpResponse::new(Status::OK);

        response.headers.set("Content-Type", "text/event-stream");
        response.headers.set("Cache-Control", "no-cache");
        response.headers.set("Connection", "keep-alive");
        response.body = Body::Push(preamble);
        response
    }

    pub fn with_header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Fixed-body length, `None` for streams.
    pub fn body_len(&self) -> Option<usize> {
        match &self.body {
            Body::Bytes(bytes) => Some(bytes.len()),
            _ => None,
        }
    }

    #[inline]
    pub fn is_streaming(&self) -> bool {
        !matches!(self.body, Body::Bytes(_))
    }
}

/// RFC 7231 IMF-fixdate.
pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn write_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Writes the status line and header block, deriving the framing headers
/// from the body variant. Created headers use canonical casing.
pub fn encode_head(response: &HttpResponse, keep_alive: bool, out: &mut Vec<u8>) {
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(response.status.0.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(response.status.reason().as_bytes());
    out.extend_from_slice(b"\r\n");

    write_header(out, "Date", &http_date());
    write_header(out, "Server", SERVER);

    match &response.body {
        Body::Bytes(bytes) => {
            write_header(out, "Content-Length", &bytes.len().to_string());
        }
        Body::Stream(_) | Body::Push(_) => {
            write_header(out, "Transfer-Encoding", "chunked");
        }
    }

    if !keep_alive {
        write_header(out, "Connection", "close");
    }

    for (name, value) in response.headers.iter() {
        // Connection framing is decided here, not by handlers.
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
            || (!keep_alive && name.eq_ignore_ascii_case("connection"))
        {
            continue;
        }

        write_header(out, name, value);
    }

    out.extend_from_slice(b"\r\n");
}

/// Serializes a fixed response completely.
pub fn encode(response: &HttpResponse, keep_alive: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + response.body_len().unwrap_or(0));

    encode_head(response, keep_alive, &mut out);

    if let Body::Bytes(bytes) = &response.body {
        out.extend_from_slice(bytes);
    }

    out
}

/// Frames one chunk: `HEX-LEN CRLF bytes CRLF`.
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);

    out.extend_from_slice(format!("{:X}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

/// Terminating zero chunk.
pub const CHUNK_END: &[u8] = b"0\r\n\r\n";

/// Complete close-marked plain-text response, for refusals written outside
/// the normal response path.
pub fn canned(status: Status, body: &str) -> Vec<u8> {
    encode(&HttpResponse::text(status, body), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_and_body(wire: &[u8]) -> (String, Vec<u8>) {
        let split = wire
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .expect("header terminator");

        (
            String::from_utf8(wire[..split].to_vec()).unwrap(),
            wire[split + 4..].to_vec(),
        )
    }

    #[test]
    fn test_fixed_body_framing() {
        let response = HttpResponse::text(Status::OK, "hello body");
        let wire = encode(&response, true);
        let (head, body) = head_and_body(&wire);

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Length: 10"));
        assert!(head.contains("Content-Type: text/plain"));
        assert!(head.contains("Date: "));
        assert!(head.contains(&format!("Server: {}", SERVER)));
        assert!(!head.contains("Connection: close"));
        assert_eq!(body, b"hello body");
    }

    #[test]
    fn test_close_marking() {
        let wire = encode(&HttpResponse::text(Status::OK, "x"), false);
        let (head, _) = head_and_body(&wire);

        assert!(head.contains("Connection: close"));
    }

    #[test]
    fn test_stream_framing_headers() {
        let producer: ChunkProducer = Box::new(|| None);
        let response = HttpResponse::stream("application/octet-stream", producer);
        let wire = encode(&response, true);
        let (head, body) = head_and_body(&wire);

        assert!(head.contains("Transfer-Encoding: chunked"));
        assert!(!head.contains("Content-Length"));
        assert!(body.is_empty());
    }

    #[test]
    fn test_sse_headers() {
        let response = HttpResponse::sse(Vec::new());
        let wire = encode(&response, true);
        let (head, _) = head_and_body(&wire);

        assert!(head.contains("Content-Type: text/event-stream"));
        assert!(head.contains("Cache-Control: no-cache"));
        assert!(head.contains("Connection: keep-alive"));
        assert!(head.contains("Transfer-Encoding: chunked"));
    }

    #[test]
    fn test_handler_framing_headers_dropped() {
        let response =
            HttpResponse::text(Status::OK, "abc").with_header("Content-Length", "999");
        let wire = encode(&response, true);
        let (head, body) = head_and_body(&wire);

        assert!(head.contains("Content-Length: 3"));
        assert!(!head.contains("Content-Length: 999"));
        assert_eq!(body, b"abc");
    }

    #[test]
    fn test_chunk_framing() {
        assert_eq!(encode_chunk(b"hello"), b"5\r\nhello\r\n");
        assert_eq!(encode_chunk(&[0u8; 26]), {
            let mut expected = b"1A\r\n".to_vec();
            expected.extend_from_slice(&[0u8; 26]);
            expected.extend_from_slice(b"\r\n");
            expected
        });
        assert_eq!(CHUNK_END, b"0\r\n\r\n");
    }

    #[test]
    fn test_canned_is_closed() {
        let wire = canned(Status::SERVICE_UNAVAILABLE, "overloaded");
        let (head, body) = head_and_body(&wire);

        assert!(head.starts_with("HTTP/1.1 503 Service Unavailable"));
        assert!(head.contains("Connection: close"));
        assert_eq!(body, b"overloaded");
    }
}
