//! Error types for the refract proxy

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error types that can occur while serving a proxied image request
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("malformed URL {url:?}: {message}")]
    MalformedUrl { message: String, url: String },

    #[error("request not allowed: {0}")]
    AccessDenied(String),

    #[error("error fetching remote image: {0}")]
    Upstream(String),

    #[error("status code: {0}")]
    UpstreamStatus(u16),

    #[error("response body too large; max allowed: {limit} bytes")]
    BodyTooLarge { limit: u64 },

    #[error("invalid content-type: {0}")]
    UnsupportedContentType(String),

    #[error("size in pixels too large: max size: {max}, real size: {actual}")]
    TooManyPixels { max: u64, actual: u64 },

    #[error("invalid image format: {0}")]
    InvalidImage(String),

    #[error("error transforming image: {0}")]
    Transform(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("request timed out")]
    Timeout,
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(err.to_string())
    }
}

impl ProxyError {
    /// HTTP status code to send to the client for this error.
    ///
    /// Upstream status codes are propagated; transform failures never reach
    /// this mapping because the fetch layer falls back to the source bytes.
    pub fn to_http_status(&self) -> u16 {
        match self {
            ProxyError::MalformedUrl { .. } => 400,
            ProxyError::AccessDenied(_) => 403,
            ProxyError::UpstreamStatus(code) if (100..=599).contains(code) => *code,
            ProxyError::UpstreamStatus(_) => 500,
            ProxyError::Timeout => 504,
            _ => 500,
        }
    }
}

/// Extract an embedded upstream status code from an error message.
///
/// Fetch errors that cross the caching layer carry their origin status as a
/// `status code: N` suffix. Absent or out-of-range codes map to 500.
pub fn extract_status_code(message: &str) -> u16 {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"status code:\s+(\d+)$").unwrap());

    let code = re
        .captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .unwrap_or(500);

    if code == 0 || code > 599 {
        500
    } else {
        code
    }
}
