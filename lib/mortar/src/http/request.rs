use crate::http::limits::HttpLimits;
use crate::http::query::{self, QueryMap};
use crate::http::types::{is_token_byte, HeaderMap, HttpError, Method, Status, Version};
use crate::net::addr::PeerAddress;
use crate::net::buffer::Buffer;
use memchr::memmem;
use std::mem;
use std::net::IpAddr;

/// Request attributes derived by the proxy middleware.
#[derive(Debug, Clone, Default)]
pub struct Forwarded {
    pub client_ip: Option<IpAddr>,
    pub proto: Option<String>,
    pub host: Option<String>,
}

/// A parsed request. Immutable once parsing completes; the middleware chain
/// only fills the derived fields.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    /// Raw request-target as received.
    pub target: String,
    /// Percent-decoded path portion of the target.
    pub path: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub query: QueryMap,
    pub body: Vec<u8>,
    pub peer: PeerAddress,
    pub forwarded: Forwarded,
    pub principal: Option<String>,
}

impl HttpRequest {
    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Effective client address: proxy-derived when present, direct peer
    /// otherwise.
    #[inline]
    pub fn effective_ip(&self) -> Option<IpAddr> {
        self.forwarded.client_ip.or_else(|| self.peer.ip())
    }

    /// Keep-alive is implied for 1.1 unless the client opted out; 1.0 must
    /// opt in.
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.has_token("connection", "close"),
            Version::Http10 => self.headers.has_token("connection", "keep-alive"),
        }
    }

    /// Re-emits the request in wire form, preserving original casing of the
    /// method and target.
    pub fn serialize(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(128 + self.body.len());

        wire.extend_from_slice(self.method.as_str().as_bytes());
        wire.push(b' ');
        wire.extend_from_slice(self.target.as_bytes());
        wire.push(b' ');
        wire.extend_from_slice(self.version.as_str().as_bytes());
        wire.extend_from_slice(b"\r\n");

        for (name, value) in self.headers.iter() {
            wire.extend_from_slice(name.as_bytes());
            wire.extend_from_slice(b": ");
            wire.extend_from_slice(value.as_bytes());
            wire.extend_from_slice(b"\r\n");
        }

        wire.extend_from_slice(b"\r\n");
        wire.extend_from_slice(&self.body);
        wire
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Phase {
    Line,
    Headers,
    FixedBody { remaining: usize },
    ChunkSize,
    ChunkData { remaining: usize },
    ChunkDataEnd,
    Trailers,
    Ready,
}

/// Incremental request parser over a connection's read buffer. One instance
/// lives per connection and is reused across keep-alive requests.
pub struct Parser {
    limits: HttpLimits,
    phase: Phase,
    method: Method,
    target: String,
    path: String,
    version: Version,
    headers: HeaderMap,
    query: QueryMap,
    body: Vec<u8>,
    header_block: usize,
}

impl Parser {
    pub fn new(limits: HttpLimits) -> Parser {
        Parser {
            limits,
            phase: Phase::Line,
            method: Method::Get,
            target: String::new(),
            path: String::new(),
            version: Version::Http11,
            headers: HeaderMap::new(),
            query: QueryMap::new(),
            body: Vec::new(),
            header_block: 0,
        }
    }

    /// Status to report when the read buffer fills while a request is still
    /// incomplete.
    pub fn overflow_status(&self) -> Status {
        match self.phase {
            Phase::Line => Status::URI_TOO_LONG,
            Phase::Headers | Phase::Trailers => Status::HEADER_FIELDS_TOO_LARGE,
            _ => Status::PAYLOAD_TOO_LARGE,
        }
    }

    /// Drops any half-parsed request, e.g. after an error response.
    pub fn reset(&mut self) {
        self.phase = Phase::Line;
        self.method = Method::Get;
        self.target = String::new();
        self.path = String::new();
        self.version = Version::Http11;
        self.headers = HeaderMap::new();
        self.query = QueryMap::new();
        self.body = Vec::new();
        self.header_block = 0;
    }

    /// Consumes as much of the buffer as the current phase allows. Returns
    /// a complete request, or `None` when more bytes are needed.
    pub fn advance(
        &mut self,
        buffer: &mut Buffer,
        peer: &PeerAddress,
    ) -> Result<Option<HttpRequest>, HttpError> {
        loop {
            match self.phase {
                Phase::Line => {
                    let line = match take_line(buffer) {
                        Some(line) => line,
                        None => {
                            if buffer.len() > self.limits.line_capacity() {
                                return Err(HttpError::new(
                                    Status::URI_TOO_LONG,
                                    "request line too long",
                                ));
                            }

                            return Ok(None);
                        }
                    };

                    self.parse_request_line(&line)?;
                    self.phase = Phase::Headers;
                    self.header_block = 0;
                }
                Phase::Headers => {
                    let line = match take_line(buffer) {
                        Some(line) => line,
                        None => {
                            if self.header_block + buffer.len() > self.limits.max_header_block {
                                return Err(HttpError::new(
                                    Status::HEADER_FIELDS_TOO_LARGE,
                                    "header block too large",
                                ));
                            }

                            return Ok(None);
                        }
                    };

                    if line.is_empty() {
                        self.begin_body()?;
                        continue;
                    }

                    self.header_block += line.len() + 2;

                    if self.header_block > self.limits.max_header_block {
                        return Err(HttpError::new(
                            Status::HEADER_FIELDS_TOO_LARGE,
                            "header block too large",
                        ));
                    }

                    self.parse_header_line(&line)?;
                }
                Phase::FixedBody { remaining } => {
                    if buffer.is_empty() {
                        return Ok(None);
                    }

                    let take = remaining.min(buffer.len());

                    self.body.extend_from_slice(&buffer.data()[..take]);
                    buffer.consume(take);

                    if take == remaining {
                        self.phase = Phase::Ready;
                    } else {
                        self.phase = Phase::FixedBody {
                            remaining: remaining - take,
                        };
                        return Ok(None);
                    }
                }
                Phase::ChunkSize => {
                    let line = match take_line(buffer) {
                        Some(line) => line,
                        None => {
                            if buffer.len() > 18 {
                                return Err(HttpError::new(
                                    Status::BAD_REQUEST,
                                    "chunk size line too long",
                                ));
                            }

                            return Ok(None);
                        }
                    };

                    let size = parse_chunk_size(&line)?;

                    if self.body.len() + size > self.limits.max_body {
                        return Err(HttpError::new(Status::PAYLOAD_TOO_LARGE, "body too large"));
                    }

                    self.phase = if size == 0 {
                        Phase::Trailers
                    } else {
                        Phase::ChunkData { remaining: size }
                    };
                }
                Phase::ChunkData { remaining } => {
                    if buffer.is_empty() {
                        return Ok(None);
                    }

                    let take = remaining.min(buffer.len());

                    self.body.extend_from_slice(&buffer.data()[..take]);
                    buffer.consume(take);

                    if take == remaining {
                        self.phase = Phase::ChunkDataEnd;
                    } else {
                        self.phase = Phase::ChunkData {
                            remaining: remaining - take,
                        };
                        return Ok(None);
                    }
                }
                Phase::ChunkDataEnd => {
                    if buffer.len() < 2 {
                        return Ok(None);
                    }

                    if &buffer.data()[..2] != b"\r\n" {
                        return Err(HttpError::new(Status::BAD_REQUEST, "chunk not terminated"));
                    }

                    buffer.consume(2);
                    self.phase = Phase::ChunkSize;
                }
                Phase::Trailers => {
                    let line = match take_line(buffer) {
                        Some(line) => line,
                        None => {
                            if buffer.len() > self.limits.max_header_block {
                                return Err(HttpError::new(
                                    Status::HEADER_FIELDS_TOO_LARGE,
                                    "trailer block too large",
                                ));
                            }

                            return Ok(None);
                        }
                    };

                    // Trailer fields are tolerated and dropped.
                    if line.is_empty() {
                        self.phase = Phase::Ready;
                    }
                }
                Phase::Ready => {
                    return Ok(Some(self.finish(peer)));
                }
            }
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), HttpError> {
        let first_space = memchr::memchr(b' ', line)
            .ok_or_else(|| HttpError::new(Status::BAD_REQUEST, "malformed request line"))?;

        let method_raw = &line[..first_space];

        if method_raw.is_empty() || method_raw.len() > self.limits.max_method {
            return Err(HttpError::new(Status::BAD_REQUEST, "malformed method"));
        }

        if !method_raw.iter().all(|&byte| is_token_byte(byte)) {
            return Err(HttpError::new(Status::BAD_REQUEST, "malformed method"));
        }

        self.method = Method::from_bytes(method_raw)
            .ok_or_else(|| HttpError::new(Status::NOT_IMPLEMENTED, "unrecognized method"))?;

        let rest = &line[first_space + 1..];
        let second_space = memchr::memchr(b' ', rest)
            .ok_or_else(|| HttpError::new(Status::BAD_REQUEST, "malformed request line"))?;

        let target_raw = &rest[..second_space];
        let version_raw = &rest[second_space + 1..];

        if target_raw.is_empty() {
            return Err(HttpError::new(Status::BAD_REQUEST, "empty request target"));
        }

        if target_raw.len() > self.limits.max_target {
            return Err(HttpError::new(Status::URI_TOO_LONG, "request target too long"));
        }

        if target_raw[0] != b'/' && target_raw != b"*" {
            return Err(HttpError::new(Status::BAD_REQUEST, "unsupported target form"));
        }

        self.version = Version::from_bytes(version_raw)
            .ok_or_else(|| HttpError::new(Status::BAD_REQUEST, "unsupported version"))?;

        let (path_raw, query_raw) = match memchr::memchr(b'?', target_raw) {
            Some(mark) => (&target_raw[..mark], &target_raw[mark + 1..]),
            None => (target_raw, &target_raw[target_raw.len()..]),
        };

        self.path = query::percent_decode(path_raw, false)?;
        self.query = query::parse(query_raw, &self.limits)?;
        self.target = String::from_utf8(target_raw.to_vec())
            .map_err(|_| HttpError::new(Status::BAD_REQUEST, "target is not utf-8"))?;

        Ok(())
    }

    fn parse_header_line(&mut self, line: &[u8]) -> Result<(), HttpError> {
        if line[0] == b' ' || line[0] == b'\t' {
            return Err(HttpError::new(Status::BAD_REQUEST, "folded header"));
        }

        let colon = memchr::memchr(b':', line)
            .ok_or_else(|| HttpError::new(Status::BAD_REQUEST, "malformed header"))?;

        let name_raw = &line[..colon];

        if name_raw.is_empty() || !name_raw.iter().all(|&byte| is_token_byte(byte)) {
            return Err(HttpError::new(Status::BAD_REQUEST, "malformed header name"));
        }

        if name_raw.len() > self.limits.max_header_name {
            return Err(HttpError::new(
                Status::HEADER_FIELDS_TOO_LARGE,
                "header name too long",
            ));
        }

        let mut value_raw = &line[colon + 1..];

        while value_raw.first() == Some(&b' ') || value_raw.first() == Some(&b'\t') {
            value_raw = &value_raw[1..];
        }

        while value_raw.last() == Some(&b' ') || value_raw.last() == Some(&b'\t') {
            value_raw = &value_raw[..value_raw.len() - 1];
        }

        if value_raw.len() > self.limits.max_header_value {
            return Err(HttpError::new(
                Status::HEADER_FIELDS_TOO_LARGE,
                "header value too long",
            ));
        }

        let name = String::from_utf8(name_raw.to_vec())
            .map_err(|_| HttpError::new(Status::BAD_REQUEST, "header is not utf-8"))?;
        let value = String::from_utf8(value_raw.to_vec())
            .map_err(|_| HttpError::new(Status::BAD_REQUEST, "header is not utf-8"))?;

        self.headers.append(name, value);
        Ok(())
    }

    /// Chunked transfer-coding takes precedence over Content-Length; having
    /// both is malformed.
    fn begin_body(&mut self) -> Result<(), HttpError> {
        let chunked = match self.headers.get("transfer-encoding") {
            Some(codings) => {
                let last = codings
                    .split(',')
                    .last()
                    .map(|item| item.trim().to_ascii_lowercase());

                if last.as_deref() != Some("chunked") {
                    return Err(HttpError::new(
                        Status::BAD_REQUEST,
                        "unsupported transfer coding",
                    ));
                }

                true
            }
            None => false,
        };

        let length = self.headers.get("content-length");

        if chunked && length.is_some() {
            return Err(HttpError::new(
                Status::BAD_REQUEST,
                "conflicting body framing",
            ));
        }

        if chunked {
            self.phase = Phase::ChunkSize;
            return Ok(());
        }

        match length {
            None => {
                self.phase = Phase::Ready;
                Ok(())
            }
            Some(text) => {
                let size: usize = text
                    .trim()
                    .parse()
                    .map_err(|_| HttpError::new(Status::BAD_REQUEST, "malformed content-length"))?;

                if size > self.limits.max_body {
                    return Err(HttpError::new(Status::PAYLOAD_TOO_LARGE, "body too large"));
                }

                self.phase = if size == 0 {
                    Phase::Ready
                } else {
                    Phase::FixedBody { remaining: size }
                };

                Ok(())
            }
        }
    }

    fn finish(&mut self, peer: &PeerAddress) -> HttpRequest {
        self.phase = Phase::Line;
        self.header_block = 0;

        HttpRequest {
            method: self.method,
            target: mem::take(&mut self.target),
            path: mem::take(&mut self.path),
            version: self.version,
            headers: mem::take(&mut self.headers),
            query: mem::take(&mut self.query),
            body: mem::take(&mut self.body),
            peer: peer.clone(),
            forwarded: Forwarded::default(),
            principal: None,
        }
    }
}

/// Pops one CRLF-terminated line off the buffer.
fn take_line(buffer: &mut Buffer) -> Option<Vec<u8>> {
    let end = memmem::find(buffer.data(), b"\r\n")?;
    let line = buffer.data()[..end].to_vec();

    buffer.consume(end + 2);
    Some(line)
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, HttpError> {
    // Chunk extensions after ';' are ignored.
    let digits = match memchr::memchr(b';', line) {
        Some(mark) => &line[..mark],
        None => line,
    };

    let text = std::str::from_utf8(digits)
        .map_err(|_| HttpError::new(Status::BAD_REQUEST, "malformed chunk size"))?;

    usize::from_str_radix(text.trim(), 16)
        .map_err(|_| HttpError::new(Status::BAD_REQUEST, "malformed chunk size"))
}
