//! Admission control for remote URLs
//!
//! A request may be admitted by referrer, by host whitelist (directly or via
//! the host's canonical name), by IP-range whitelist, or by HMAC signature.
//! Host-scoped decisions are cached in two bounded LRU sets so repeat
//! traffic skips DNS; the negative set is bypassed entirely when a signature
//! key is configured, because a per-request signature can legitimately admit
//! a previously denied host.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use lru::LruCache;
use sha2::Sha256;
use tracing::debug;
use url::Url;

use crate::error::{ProxyError, Result};
use crate::ip_range::IpRange;
use crate::metrics::Statser;
use crate::request::ImageRequest;
use crate::resolver::Resolver;

/// Capacity of each decision cache.
const DECISION_CACHE_CAPACITY: usize = 10_000;

type HmacSha256 = Hmac<Sha256>;

/// Static admission configuration.
#[derive(Default)]
pub struct AccessConfig {
    /// Hosts a request's Referer header must match. Empty allows all.
    pub referrers: Vec<String>,

    /// Remote hosts images may be proxied from. Empty means no host
    /// restriction (admission falls through to IP ranges / signature).
    pub allowed_hosts: Vec<String>,

    /// Remote IP ranges images may be proxied from.
    pub allowed_ip_ranges: Vec<IpRange>,

    /// HMAC key for signed requests.
    pub signature_key: Option<Vec<u8>>,
}

impl AccessConfig {
    fn open(&self) -> bool {
        self.allowed_hosts.is_empty()
            && self.allowed_ip_ranges.is_empty()
            && self.signature_key.is_none()
    }
}

/// Evaluates whether a remote URL may be fetched.
pub struct AccessPolicy {
    config: AccessConfig,
    resolver: Arc<dyn Resolver>,
    statser: Arc<dyn Statser>,
    allowed_hosts_cache: Mutex<LruCache<String, ()>>,
    denied_hosts_cache: Mutex<LruCache<String, ()>>,
}

impl AccessPolicy {
    pub fn new(config: AccessConfig, resolver: Arc<dyn Resolver>, statser: Arc<dyn Statser>) -> Self {
        let capacity = NonZeroUsize::new(DECISION_CACHE_CAPACITY).unwrap();
        AccessPolicy {
            config,
            resolver,
            statser,
            allowed_hosts_cache: Mutex::new(LruCache::new(capacity)),
            denied_hosts_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Determine whether the request contains an allowed referrer, host, or
    /// signature. Returns an error describing the rejection otherwise.
    pub async fn allowed(&self, req: &ImageRequest, referer: Option<&str>) -> Result<()> {
        if !self.config.referrers.is_empty() && !valid_referrer(&self.config.referrers, referer) {
            self.statser.increment("request.error.referrer");
            return Err(ProxyError::AccessDenied(format!(
                "request does not contain an allowed referrer: {req}"
            )));
        }

        if self.config.open() {
            return Ok(());
        }

        let host = host_with_port(&req.url);

        if self.allowed_hosts_cache.lock().unwrap().get(&host).is_some() {
            self.statser.increment("request.access.cache_hit_allowed");
            return Ok(());
        }

        // Negative decisions are only trusted when no signature key is in
        // play; a signed request must always get a full evaluation.
        if self.config.signature_key.is_none()
            && self.denied_hosts_cache.lock().unwrap().get(&host).is_some()
        {
            self.statser.increment("request.access.cache_hit_denied");
            return Err(self.denied(req));
        }

        if self.evaluate(req, &host).await {
            return Ok(());
        }

        if self.config.signature_key.is_none() {
            self.denied_hosts_cache.lock().unwrap().put(host, ());
        }
        Err(self.denied(req))
    }

    /// Full (uncached) evaluation of host whitelist, IP whitelist, and
    /// signature. Host- and IP-based admissions are recorded in the positive
    /// cache; signature admissions are per-URL and never cached.
    async fn evaluate(&self, req: &ImageRequest, host: &str) -> bool {
        if !self.config.allowed_hosts.is_empty() {
            if valid_host(&self.config.allowed_hosts, host) {
                self.record_allowed(host);
                return true;
            }

            // the whitelisted name may sit behind a CNAME
            if let Some(bare) = req.url.host_str() {
                if let Ok(canonical) = self.resolver.cname(bare).await {
                    if !canonical.is_empty() {
                        let canonical = match req.url.port() {
                            Some(port) => format!("{canonical}:{port}"),
                            None => canonical,
                        };
                        if valid_host(&self.config.allowed_hosts, &canonical) {
                            debug!("host {host} admitted via cname {canonical}");
                            self.record_allowed(host);
                            return true;
                        }
                    }
                }
            }
        }

        if !self.config.allowed_ip_ranges.is_empty() {
            if let Some(bare) = req.url.host_str() {
                if let Ok(ips) = self.resolver.lookup_ip(bare).await {
                    let admitted = ips
                        .iter()
                        .any(|ip| self.config.allowed_ip_ranges.iter().any(|r| r.contains(*ip)));
                    if admitted {
                        self.record_allowed(host);
                        return true;
                    }
                }
            }
        }

        if let Some(key) = &self.config.signature_key {
            if valid_signature(key, req) {
                return true;
            }
        }

        false
    }

    fn record_allowed(&self, host: &str) {
        self.allowed_hosts_cache.lock().unwrap().put(host.to_string(), ());
    }

    fn denied(&self, req: &ImageRequest) -> ProxyError {
        self.statser.increment("request.error.not_allowed");
        ProxyError::AccessDenied(format!(
            "request does not contain an allowed host or valid signature: {req}"
        ))
    }

    /// Drop both decision caches. Tests purge between scenarios.
    pub fn purge_decision_caches(&self) {
        self.allowed_hosts_cache.lock().unwrap().clear();
        self.denied_hosts_cache.lock().unwrap().clear();
    }
}

/// Host portion of a URL including any explicit port, the form whitelist
/// entries are written in.
fn host_with_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Whether `host` matches one of the whitelist entries: exact equality, or a
/// `*.`-prefixed entry whose remainder is a suffix of the host.
fn valid_host(whitelist: &[String], host: &str) -> bool {
    whitelist.iter().any(|entry| {
        if entry == host {
            return true;
        }
        entry
            .strip_prefix("*.")
            .map(|suffix| host.ends_with(suffix))
            .unwrap_or(false)
    })
}

/// Whether the Referer header names a whitelisted host. Malformed or absent
/// headers deny.
fn valid_referrer(whitelist: &[String], referer: Option<&str>) -> bool {
    let Some(referer) = referer else { return false };
    let Ok(url) = Url::parse(referer) else { return false };
    valid_host(whitelist, &host_with_port(&url))
}

/// Validate the request signature: URL-safe base64 (padding restored),
/// HMAC-SHA256 over the remote URL without fragment, constant-time compare.
fn valid_signature(key: &[u8], req: &ImageRequest) -> bool {
    let mut sig = req.options.signature.clone();
    let m = sig.len() % 4;
    if m != 0 {
        sig.push_str(&"=".repeat(4 - m));
    }

    let Ok(got) = URL_SAFE.decode(sig.as_bytes()) else {
        debug!("error base64 decoding signature {:?}", req.options.signature);
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(req.remote_url().as_bytes());
    mac.verify_slice(&got).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::AtomicStats;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::IpAddr;

    /// Table-driven resolver standing in for real DNS.
    #[derive(Default)]
    struct MockResolver {
        cnames: HashMap<String, String>,
        ips: HashMap<String, Vec<IpAddr>>,
    }

    #[async_trait]
    impl Resolver for MockResolver {
        async fn cname(&self, host: &str) -> Result<String> {
            self.cnames
                .get(host)
                .cloned()
                .ok_or_else(|| ProxyError::Upstream("no cname record".to_string()))
        }

        async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
            self.ips
                .get(host)
                .cloned()
                .ok_or_else(|| ProxyError::Upstream("no address record".to_string()))
        }
    }

    fn request(url: &str, signature: &str) -> ImageRequest {
        let mut req = ImageRequest {
            url: Url::parse(url).unwrap(),
            options: Default::default(),
        };
        req.options.signature = signature.to_string();
        req
    }

    fn policy(config: AccessConfig, resolver: MockResolver) -> AccessPolicy {
        AccessPolicy::new(config, Arc::new(resolver), Arc::new(AtomicStats::new()))
    }

    fn hosts(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_open_config_allows_everything() {
        let policy = policy(AccessConfig::default(), MockResolver::default());
        let req = request("http://test/image", "");
        assert!(policy.allowed(&req, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_host_whitelist() {
        let config = AccessConfig {
            allowed_hosts: hosts(&["good", "good.ref", "good.nosig"]),
            ..Default::default()
        };
        let policy = policy(config, MockResolver::default());

        assert!(policy.allowed(&request("http://good/image", ""), None).await.is_ok());
        assert!(policy.allowed(&request("http://bad/image", ""), None).await.is_err());
    }

    #[tokio::test]
    async fn test_referrer_check() {
        let config = AccessConfig {
            referrers: hosts(&["good", "good.ref", "good.nosig"]),
            ..Default::default()
        };
        let policy = policy(config, MockResolver::default());
        let req = request("http://test/image", "");

        assert!(policy.allowed(&req, Some("http://good.ref/foo")).await.is_ok());
        assert!(policy.allowed(&req, Some("http://bad.ref/foo")).await.is_err());
        assert!(policy.allowed(&req, Some("MALFORMED!!")).await.is_err());
        assert!(policy.allowed(&req, None).await.is_err());
    }

    #[tokio::test]
    async fn test_signature_key() {
        let config = AccessConfig {
            signature_key: Some(b"c0ffee".to_vec()),
            ..Default::default()
        };
        let policy = policy(config, MockResolver::default());

        let signed = request("http://test/image", "NDx5zZHx7QfE8E-ijowRreq6CJJBZjwiRfOVk_mkfQQ=");
        assert!(policy.allowed(&signed, None).await.is_ok());

        let bad = request("http://test/image", "deadbeef");
        assert!(policy.allowed(&bad, None).await.is_err());

        let unsigned = request("http://test/image", "");
        assert!(policy.allowed(&unsigned, None).await.is_err());
    }

    #[tokio::test]
    async fn test_whitelist_and_signature_combined() {
        let config = AccessConfig {
            allowed_hosts: hosts(&["good.nosig"]),
            signature_key: Some(b"c0ffee".to_vec()),
            ..Default::default()
        };
        let policy = policy(config, MockResolver::default());

        // whitelisted host without a signature
        assert!(policy.allowed(&request("http://good.nosig/image", ""), None).await.is_ok());

        // signed URL on a non-whitelisted host
        let signed = request("http://bad/image", "gWivrPhXBbsYEwpmWAKjbJEiAEgZwbXbltg95O2tgNI=");
        assert!(policy.allowed(&signed, None).await.is_ok());

        // neither
        assert!(policy.allowed(&request("http://bad.nosig/image", ""), None).await.is_err());
    }

    #[test]
    fn test_valid_host_rules() {
        let whitelist = hosts(&["a.test", "a.test:81", "*.b.test", "*c.test"]);

        assert!(valid_host(&whitelist, "a.test"));
        assert!(!valid_host(&whitelist, "x.a.test"));
        assert!(valid_host(&whitelist, "a.test:81"));
        assert!(!valid_host(&whitelist, "a.test:90"));

        assert!(valid_host(&whitelist, "b.test"));
        assert!(valid_host(&whitelist, "x.b.test"));
        assert!(valid_host(&whitelist, "x.y.b.test"));

        // a bare-star entry is not a wildcard
        assert!(!valid_host(&whitelist, "c.test"));
        assert!(!valid_host(&whitelist, "xc.test"));
    }

    #[tokio::test]
    async fn test_cname_fallback() {
        let whitelist = hosts(&["a.test", "a.test:81", "*.b.test"]);
        let mut resolver = MockResolver::default();
        resolver.cnames.insert("d.test".into(), "a.test".into());
        resolver.cnames.insert("e.test".into(), "b.test".into());
        resolver.cnames.insert("a.f.test".into(), String::new());

        let config = AccessConfig {
            allowed_hosts: whitelist,
            ..Default::default()
        };
        let policy = policy(config, resolver);

        assert!(policy.allowed(&request("http://d.test/image", ""), None).await.is_ok());
        // the original port is re-attached to the canonical name
        assert!(policy.allowed(&request("http://d.test:81/image", ""), None).await.is_ok());
        assert!(policy.allowed(&request("http://d.test:90/image", ""), None).await.is_err());
        assert!(policy.allowed(&request("http://e.test/image", ""), None).await.is_ok());
        // empty and missing CNAME answers deny
        assert!(policy.allowed(&request("http://a.f.test/image", ""), None).await.is_err());
        assert!(policy.allowed(&request("http://xxx.test/image", ""), None).await.is_err());
    }

    #[tokio::test]
    async fn test_ip_whitelist() {
        let mut resolver = MockResolver::default();
        resolver
            .ips
            .insert("images.test".into(), vec!["216.58.12.4".parse().unwrap()]);
        resolver
            .ips
            .insert("other.test".into(), vec!["10.1.2.3".parse().unwrap()]);

        let config = AccessConfig {
            allowed_ip_ranges: vec![IpRange::parse("216.58.0.0-216.58.255.255").unwrap()],
            ..Default::default()
        };
        let policy = policy(config, resolver);

        assert!(policy.allowed(&request("http://images.test/a.jpg", ""), None).await.is_ok());
        assert!(policy.allowed(&request("http://other.test/a.jpg", ""), None).await.is_err());
    }

    #[tokio::test]
    async fn test_signature_independent_of_options() {
        let config = AccessConfig {
            signature_key: Some(b"c0ffee".to_vec()),
            ..Default::default()
        };
        let policy = policy(config, MockResolver::default());

        // same remote URL, different transform options, same signature
        let mut a = request("http://test/image", "NDx5zZHx7QfE8E-ijowRreq6CJJBZjwiRfOVk_mkfQQ=");
        a.options.width = 100.0;
        let mut b = request("http://test/image", "NDx5zZHx7QfE8E-ijowRreq6CJJBZjwiRfOVk_mkfQQ=");
        b.options.rotate = 90;

        assert!(policy.allowed(&a, None).await.is_ok());
        policy.purge_decision_caches();
        assert!(policy.allowed(&b, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_negative_cache_without_signature_key() {
        let stats = Arc::new(AtomicStats::new());
        let config = AccessConfig {
            allowed_hosts: hosts(&["elsewhere.test"]),
            ..Default::default()
        };
        let policy = AccessPolicy::new(config, Arc::new(MockResolver::default()), stats.clone());

        let req = request("http://bad.test/image", "");
        assert!(policy.allowed(&req, None).await.is_err());
        assert_eq!(stats.counter("request.access.cache_hit_denied"), 0);

        // second evaluation is served from the negative cache
        assert!(policy.allowed(&req, None).await.is_err());
        assert_eq!(stats.counter("request.access.cache_hit_denied"), 1);
    }

    #[tokio::test]
    async fn test_negative_cache_bypassed_with_signature_key() {
        let stats = Arc::new(AtomicStats::new());
        let config = AccessConfig {
            allowed_hosts: hosts(&["elsewhere.test"]),
            signature_key: Some(b"c0ffee".to_vec()),
            ..Default::default()
        };
        let policy = AccessPolicy::new(config, Arc::new(MockResolver::default()), stats.clone());

        // unsigned request on a non-whitelisted host is denied twice, never
        // from the negative cache
        let req = request("http://test/image", "");
        assert!(policy.allowed(&req, None).await.is_err());
        assert!(policy.allowed(&req, None).await.is_err());
        assert_eq!(stats.counter("request.access.cache_hit_denied"), 0);

        // and a properly signed request for the same host is admitted
        let signed = request("http://test/image", "NDx5zZHx7QfE8E-ijowRreq6CJJBZjwiRfOVk_mkfQQ=");
        assert!(policy.allowed(&signed, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_positive_cache_records_host_admissions() {
        let stats = Arc::new(AtomicStats::new());
        let config = AccessConfig {
            allowed_hosts: hosts(&["good.test"]),
            ..Default::default()
        };
        let policy = AccessPolicy::new(config, Arc::new(MockResolver::default()), stats.clone());

        let req = request("http://good.test/image", "");
        assert!(policy.allowed(&req, None).await.is_ok());
        assert!(policy.allowed(&req, None).await.is_ok());
        assert_eq!(stats.counter("request.access.cache_hit_allowed"), 1);
    }

    #[test]
    fn test_signature_padding_restored() {
        let req = request("http://test/image", "NDx5zZHx7QfE8E-ijowRreq6CJJBZjwiRfOVk_mkfQQ");
        assert!(valid_signature(b"c0ffee", &req));

        let req = request("http://test/image", "NDx5zZHx7QfE8E-ijowRreq6CJJBZjwiRfOVk_mkfQQ=");
        assert!(valid_signature(b"c0ffee", &req));

        let req = request("http://test/image", "");
        assert!(!valid_signature(b"c0ffee", &req));
    }
}
