//! Shared HTTP exchange types
//!
//! The cache stores complete HTTP responses, so responses are modeled as a
//! value type (`Exchange`) that serializes to HTTP/1.1 wire form and parses
//! back. Transports produce `Exchange`s; the transforming transport also
//! fabricates synthetic ones.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;

use crate::error::{ProxyError, Result};

/// Header set on responses served from cache.
pub const X_FROM_CACHE: &str = "x-from-cache";

/// A GET request as seen by the transport stack. The URL may carry a
/// fragment; fragments never go on the wire but partition cache keys and
/// select the transforming path.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub url: String,
    pub headers: HeaderMap,
}

impl ExchangeRequest {
    pub fn new(url: impl Into<String>) -> Self {
        ExchangeRequest {
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    /// The fragment portion of the URL, empty when absent.
    pub fn fragment(&self) -> &str {
        match self.url.split_once('#') {
            Some((_, fragment)) => fragment,
            None => "",
        }
    }

    /// The URL with any fragment removed.
    pub fn without_fragment(&self) -> &str {
        match self.url.split_once('#') {
            Some((url, _)) => url,
            None => &self.url,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// A complete HTTP response: status, headers, body.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Exchange {
    pub fn new(status: StatusCode) -> Self {
        Exchange {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn set_header(&mut self, name: &'static str, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(HeaderName::from_static(name), value);
        }
    }

    /// Whether this response was served from the HTTP cache.
    pub fn from_cache(&self) -> bool {
        self.header(X_FROM_CACHE) == Some("1")
    }

    /// Serialize to HTTP/1.1 wire form for cache storage.
    pub fn to_wire(&self) -> Vec<u8> {
        let reason = self.status.canonical_reason().unwrap_or("");
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), reason).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse a response previously serialized with [`Exchange::to_wire`].
    pub fn from_wire(data: &[u8]) -> Result<Exchange> {
        let header_end = find_header_end(data)
            .ok_or_else(|| ProxyError::Cache("truncated cached response".to_string()))?;
        let head = std::str::from_utf8(&data[..header_end])
            .map_err(|_| ProxyError::Cache("cached response header is not UTF-8".to_string()))?;

        let mut lines = head.split("\r\n");
        let status_line = lines
            .next()
            .ok_or_else(|| ProxyError::Cache("missing status line".to_string()))?;
        let code = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| ProxyError::Cache(format!("malformed status line: {status_line}")))?;
        let status = StatusCode::from_u16(code)
            .map_err(|_| ProxyError::Cache(format!("invalid status code: {code}")))?;

        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProxyError::Cache(format!("malformed header line: {line}")))?;
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| ProxyError::Cache(format!("invalid header name: {name}")))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|_| ProxyError::Cache(format!("invalid header value: {value}")))?;
            headers.append(name, value);
        }

        Ok(Exchange {
            status,
            headers,
            body: Bytes::copy_from_slice(&data[header_end + 4..]),
        })
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Whether a stored or fetched response satisfies the conditional headers of
/// a request, by entity tag or last-modified time.
pub fn conditional_match(request_headers: &HeaderMap, response: &Exchange) -> bool {
    let req_header = |name: &str| request_headers.get(name).and_then(|v| v.to_str().ok());

    if let (Some(etag), Some(if_none_match)) = (response.header("etag"), req_header("if-none-match")) {
        if !etag.is_empty() && etag == if_none_match {
            return true;
        }
    }

    if let (Some(last_modified), Some(if_modified_since)) =
        (response.header("last-modified"), req_header("if-modified-since"))
    {
        if let (Ok(modified), Ok(since)) = (
            httpdate::parse_http_date(last_modified),
            httpdate::parse_http_date(if_modified_since),
        ) {
            if modified < since {
                return true;
            }
        }
    }

    false
}

/// Transport seam: anything that can perform a GET and produce a response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, req: &ExchangeRequest) -> Result<Exchange>;
}
