//! Caching HTTP client layer
//!
//! A `CachingClient` composes over any [`Transport`] and stores successful
//! GET responses keyed by the full request URL, fragment included. The
//! fragment is what partitions transformed variants: the same remote image
//! with different option strings occupies distinct cache entries.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::cache::Cache;
use crate::error::Result;
use crate::models::{Exchange, ExchangeRequest, Transport, X_FROM_CACHE};

/// Headers refreshed on a stored entry when a revalidation returns 304.
const REFRESH_HEADERS: [&str; 4] = ["date", "cache-control", "expires", "etag"];

/// HTTP caching transport. Honors Cache-Control and Expires for freshness,
/// revalidates with If-None-Match / If-Modified-Since when stale, and marks
/// responses served from cache with `X-From-Cache: 1`.
pub struct CachingClient {
    transport: Arc<dyn Transport>,
    cache: Arc<dyn Cache>,
}

impl CachingClient {
    pub fn new(transport: Arc<dyn Transport>, cache: Arc<dyn Cache>) -> Self {
        CachingClient { transport, cache }
    }

    /// Perform a GET for `url` (which may carry an options fragment).
    pub async fn get(&self, url: &str) -> Result<Exchange> {
        self.round_trip(&ExchangeRequest::new(url)).await
    }

    fn store(&self, key: &str, exchange: &Exchange) {
        let mut stored = exchange.clone();
        stored.headers.remove(X_FROM_CACHE);
        if stored.header("date").is_none() {
            stored.set_header("date", &httpdate::fmt_http_date(SystemTime::now()));
        }
        self.cache.set(key, &stored.to_wire());
    }

    fn load(&self, key: &str) -> Option<Exchange> {
        let raw = self.cache.get(key)?;
        match Exchange::from_wire(&raw) {
            Ok(exchange) => Some(exchange),
            Err(e) => {
                warn!("dropping undecodable cache entry for {key}: {e}");
                self.cache.delete(key);
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for CachingClient {
    async fn round_trip(&self, req: &ExchangeRequest) -> Result<Exchange> {
        let key = req.url.as_str();

        if let Some(mut cached) = self.load(key) {
            if is_fresh(&cached) {
                debug!("cache hit (fresh): {key}");
                mark_cached(&mut cached);
                return Ok(cached);
            }

            // Stale entry: revalidate when the origin gave us validators,
            // otherwise refetch outright.
            let etag = cached.header("etag").map(str::to_string);
            let last_modified = cached.header("last-modified").map(str::to_string);
            if etag.is_some() || last_modified.is_some() {
                let mut revalidation = req.clone();
                if let Some(etag) = &etag {
                    if let Ok(v) = http::HeaderValue::from_str(etag) {
                        revalidation.headers.insert("if-none-match", v);
                    }
                }
                if let Some(lm) = &last_modified {
                    if let Ok(v) = http::HeaderValue::from_str(lm) {
                        revalidation.headers.insert("if-modified-since", v);
                    }
                }

                let resp = self.transport.round_trip(&revalidation).await?;
                if resp.status == http::StatusCode::NOT_MODIFIED {
                    debug!("cache hit (revalidated): {key}");
                    for name in REFRESH_HEADERS {
                        if let Some(value) = resp.headers.get(name) {
                            cached.headers.insert(
                                http::HeaderName::from_static(name),
                                value.clone(),
                            );
                        }
                    }
                    self.store(key, &cached);
                    mark_cached(&mut cached);
                    return Ok(cached);
                }

                if is_cacheable(req, &resp) {
                    self.store(key, &resp);
                } else {
                    self.cache.delete(key);
                }
                return Ok(resp);
            }
        }

        debug!("cache miss: {key}");
        let resp = self.transport.round_trip(req).await?;
        if is_cacheable(req, &resp) {
            self.store(key, &resp);
        }
        Ok(resp)
    }
}

fn mark_cached(exchange: &mut Exchange) {
    exchange.set_header(X_FROM_CACHE, "1");
}

fn cache_control_has(headers_value: Option<&str>, directive: &str) -> bool {
    headers_value
        .map(|cc| {
            cc.split(',')
                .any(|d| d.trim().eq_ignore_ascii_case(directive))
        })
        .unwrap_or(false)
}

fn max_age(cache_control: Option<&str>) -> Option<Duration> {
    let cc = cache_control?;
    for directive in cc.split(',') {
        let directive = directive.trim();
        if let Some(value) = directive
            .strip_prefix("max-age=")
            .or_else(|| directive.strip_prefix("MAX-AGE="))
        {
            return value.trim_matches('"').parse::<u64>().ok().map(Duration::from_secs);
        }
    }
    None
}

/// Whether a stored response can be served without revalidation.
fn is_fresh(exchange: &Exchange) -> bool {
    let cache_control = exchange.header("cache-control");
    if cache_control_has(cache_control, "no-store") || cache_control_has(cache_control, "no-cache") {
        return false;
    }

    let Some(date) = exchange.header("date").and_then(|d| httpdate::parse_http_date(d).ok())
    else {
        return false;
    };

    let lifetime = match max_age(cache_control) {
        Some(lifetime) => lifetime,
        None => {
            let Some(expires) = exchange
                .header("expires")
                .and_then(|e| httpdate::parse_http_date(e).ok())
            else {
                return false;
            };
            match expires.duration_since(date) {
                Ok(lifetime) => lifetime,
                Err(_) => return false,
            }
        }
    };

    let age = SystemTime::now()
        .duration_since(date)
        .unwrap_or(Duration::ZERO);
    age < lifetime
}

fn is_cacheable(req: &ExchangeRequest, exchange: &Exchange) -> bool {
    if exchange.status != http::StatusCode::OK {
        return false;
    }
    if cache_control_has(req.header("cache-control"), "no-store") {
        return false;
    }
    !cache_control_has(exchange.header("cache-control"), "no-store")
}
