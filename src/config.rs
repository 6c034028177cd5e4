//! Configuration management for the proxy

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ProxyError, Result};
use crate::ip_range::IpRange;

/// Proxy configuration, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// TCP address to listen on (default: 127.0.0.1:8080)
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Directory for the disk cache. Empty disables caching.
    #[serde(default)]
    pub cache_dir: String,

    /// Maximum number of cache keys tracked in memory (default: 1,000,000).
    /// Keys beyond this evict their least-frequently-used peers from disk.
    #[serde(default = "default_cache_limit")]
    pub cache_limit: u64,

    /// Maximum size of a fetched original in bytes (default: 10MB)
    #[serde(default = "default_max_response_size")]
    pub max_response_size: u64,

    /// Maximum size of a decoded image in pixels (default: 40,000,000)
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,

    /// Maximum number of requests handled at once (default: 15)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Per-request time limit in seconds; 0 disables (default: 30)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Remote hosts images may be proxied from. Empty allows all (subject
    /// to the other admission mechanisms).
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Remote IP ranges images may be proxied from, e.g.
    /// "192.168.10.0/24" or "192.168.1.100-192.168.1.120".
    #[serde(default)]
    pub allowed_ip_ranges: Vec<String>,

    /// Referring hosts requests must come from. Empty allows all.
    #[serde(default)]
    pub allowed_referrers: Vec<String>,

    /// HMAC key for signed requests. An "@path" value reads the key from a
    /// file.
    #[serde(default)]
    pub signature_key: Option<String>,

    /// Base URL that relative remote URLs are resolved against.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Allow images to scale beyond their original dimensions.
    #[serde(default)]
    pub scale_up: bool,

    /// Ceiling on pixel-count growth when scaling up (default: 2.0).
    #[serde(default = "default_max_scale_up")]
    pub max_scale_up: f64,

    /// RSS threshold for memory warnings; 0 disables (default: 0).
    #[serde(default)]
    pub memory_limit_bytes: u64,

    /// Interval of the background memory-reclaim task in seconds
    /// (default: 60).
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_cache_limit() -> u64 {
    1_000_000
}

fn default_max_response_size() -> u64 {
    10 * 1024 * 1024
}

fn default_max_pixels() -> u64 {
    40_000_000
}

fn default_max_concurrency() -> usize {
    15
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_scale_up() -> f64 {
    2.0
}

fn default_gc_interval_secs() -> u64 {
    60
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            listen_addr: default_listen_addr(),
            cache_dir: String::new(),
            cache_limit: default_cache_limit(),
            max_response_size: default_max_response_size(),
            max_pixels: default_max_pixels(),
            max_concurrency: default_max_concurrency(),
            timeout_secs: default_timeout_secs(),
            allowed_hosts: Vec::new(),
            allowed_ip_ranges: Vec::new(),
            allowed_referrers: Vec::new(),
            signature_key: None,
            base_url: None,
            scale_up: false,
            max_scale_up: default_max_scale_up(),
            memory_limit_bytes: 0,
            gc_interval_secs: default_gc_interval_secs(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file and validate it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ProxyError::Config(format!("failed to read config file: {e}")))?;

        let config: ProxyConfig = serde_yaml::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("failed to parse config file: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate field values and cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(ProxyError::Config(
                "max_concurrency must be greater than 0".to_string(),
            ));
        }
        if self.max_response_size == 0 {
            return Err(ProxyError::Config(
                "max_response_size must be greater than 0".to_string(),
            ));
        }
        if self.max_pixels == 0 {
            return Err(ProxyError::Config(
                "max_pixels must be greater than 0".to_string(),
            ));
        }
        if self.max_scale_up <= 0.0 {
            return Err(ProxyError::Config(format!(
                "max_scale_up must be positive, got {}",
                self.max_scale_up
            )));
        }

        self.parsed_base_url()?;
        self.parsed_ip_ranges()?;
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout_secs))
        }
    }

    pub fn parsed_base_url(&self) -> Result<Option<Url>> {
        match &self.base_url {
            None => Ok(None),
            Some(raw) => Url::parse(raw)
                .map(Some)
                .map_err(|e| ProxyError::Config(format!("invalid base_url {raw:?}: {e}"))),
        }
    }

    pub fn parsed_ip_ranges(&self) -> Result<Vec<IpRange>> {
        self.allowed_ip_ranges.iter().map(|s| IpRange::parse(s)).collect()
    }

    /// The HMAC signature key. An "@path" value reads the key bytes from
    /// that file.
    pub fn signature_key_bytes(&self) -> Result<Option<Vec<u8>>> {
        match &self.signature_key {
            None => Ok(None),
            Some(key) if key.is_empty() => Ok(None),
            Some(key) => match key.strip_prefix('@') {
                Some(path) => std::fs::read(path)
                    .map(Some)
                    .map_err(|e| ProxyError::Config(format!("error reading signature file: {e}"))),
                None => Ok(Some(key.as_bytes().to_vec())),
            },
        }
    }
}
