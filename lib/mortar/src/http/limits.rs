use std::time::Duration;

/// Parsing and framing ceilings. The defaults are deliberately strict;
/// every limit maps to a hard 4xx when crossed.
#[derive(Debug, Clone)]
pub struct HttpLimits {
    /// Method token length.
    pub max_method: usize,
    /// Request-target length; beyond it the request is a 414.
    pub max_target: usize,
    /// Single header name length.
    pub max_header_name: usize,
    /// Single header value length.
    pub max_header_value: usize,
    /// Whole header block, request line excluded; beyond it a 431.
    pub max_header_block: usize,
    /// Decoded body size for both framings; beyond it a 413.
    pub max_body: usize,
    /// Query pairs accepted; one more is a 400.
    pub max_query_params: usize,
    pub max_query_key: usize,
    pub max_query_value: usize,
    /// Requests served over one keep-alive connection before it closes.
    pub max_requests_per_connection: usize,
    /// Keep-alive connections idle beyond this are reaped.
    pub idle_timeout: Duration,
}

impl Default for HttpLimits {
    fn default() -> HttpLimits {
        HttpLimits {
            max_method: 16,
            max_target: 8192,
            max_header_name: 256,
            max_header_value: 8192,
            max_header_block: 8192,
            max_body: 2 * 1024 * 1024,
            max_query_params: 100,
            max_query_key: 256,
            max_query_value: 4096,
            max_requests_per_connection: 10_000,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl HttpLimits {
    /// Read buffer capacity that can always hold one maximal request.
    pub fn read_capacity(&self) -> usize {
        self.max_method + self.max_target + self.max_header_block + self.max_body + 1024
    }

    /// Longest acceptable request line.
    pub(crate) fn line_capacity(&self) -> usize {
        // method SP target SP version
        self.max_method + 1 + self.max_target + 1 + 8
    }
}
