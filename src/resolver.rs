//! DNS lookups used by the access policy
//!
//! The policy only needs two queries: the canonical name of a host (so a
//! whitelisted host hidden behind a CNAME still matches) and its A/AAAA
//! records (for IP-range whitelisting). Tests substitute a table-driven
//! resolver.

use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use tracing::warn;

use crate::error::{ProxyError, Result};

/// Name resolution interface consumed by the access policy.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Canonical name of `host`, or an error when no CNAME record exists.
    async fn cname(&self, host: &str) -> Result<String>;

    /// All A/AAAA records of `host`.
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Resolver backed by the system DNS configuration.
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn new() -> Self {
        let inner = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                warn!("failed to read system DNS config, using defaults: {e}");
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        };
        SystemResolver { inner }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn cname(&self, host: &str) -> Result<String> {
        let lookup = self
            .inner
            .lookup(host, RecordType::CNAME)
            .await
            .map_err(|e| ProxyError::Upstream(format!("cname lookup failed: {e}")))?;

        lookup
            .iter()
            .find_map(|rdata| match rdata {
                RData::CNAME(name) => Some(name.0.to_utf8().trim_end_matches('.').to_string()),
                _ => None,
            })
            .ok_or_else(|| ProxyError::Upstream(format!("no cname record for {host}")))
    }

    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        let lookup = self
            .inner
            .lookup_ip(host)
            .await
            .map_err(|e| ProxyError::Upstream(format!("ip lookup failed: {e}")))?;
        Ok(lookup.iter().collect())
    }
}
