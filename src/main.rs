//! refract server entry point
//!
//! Loads configuration, wires the cache and client stack together, and
//! serves until terminated.
//!
//! ```bash
//! # start with the default config file (refract.yaml)
//! refract
//!
//! # start with a custom config
//! refract /path/to/config.yaml
//! ```

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use refract::access::{AccessConfig, AccessPolicy};
use refract::cache::{Cache, NopCache};
use refract::config::ProxyConfig;
use refract::diskcache::{spawn_original_evictor, DiskCache};
use refract::fetch::{new_client, HttpTransport};
use refract::governor::{self, GovernorConfig};
use refract::metrics::AtomicStats;
use refract::resolver::SystemResolver;
use refract::server::Proxy;
use refract::transform::Transformer;
use refract::Statser;

/// Size of the disk-cache event channel feeding the secondary evictor.
const CACHE_EVENT_CHANNEL_SIZE: usize = 1024;

/// Capacity of the secondary LFU that evicts original images.
const ORIGINAL_EVICTOR_CAPACITY: u64 = 512;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let config_path = env::args().nth(1).unwrap_or_else(|| "refract.yaml".to_string());
    info!("loading configuration from {config_path}");

    let config = match ProxyConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    info!("  listen addr: {}", config.listen_addr);
    info!("  cache dir: {:?}", config.cache_dir);
    info!("  cache limit: {} keys", config.cache_limit);
    info!("  max response size: {} bytes", config.max_response_size);
    info!("  max pixels: {}", config.max_pixels);
    info!("  max concurrency: {}", config.max_concurrency);
    info!("  timeout: {:?}", config.timeout());
    info!("  scale up: {} (max {:.1}x)", config.scale_up, config.max_scale_up);

    if let Err(e) = run(config).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(config: ProxyConfig) -> refract::Result<()> {
    let statser = Arc::new(AtomicStats::new());
    statser.increment("exec.started");

    let cache: Arc<dyn Cache> = if config.cache_dir.is_empty() {
        info!("caching disabled");
        Arc::new(NopCache)
    } else {
        let (disk, events) =
            DiskCache::with_events(&config.cache_dir, config.cache_limit, CACHE_EVENT_CHANNEL_SIZE)?;
        let disk = Arc::new(disk);
        spawn_original_evictor(disk.clone(), ORIGINAL_EVICTOR_CAPACITY, events);
        disk
    };

    let transformer = Arc::new(Transformer::new(config.max_scale_up, statser.clone()));
    let base = Arc::new(HttpTransport::new(config.max_response_size)?);
    let client = new_client(
        base,
        cache,
        transformer,
        statser.clone(),
        config.max_response_size,
        config.max_pixels,
    );

    let access = Arc::new(AccessPolicy::new(
        AccessConfig {
            referrers: config.allowed_referrers.clone(),
            allowed_hosts: config.allowed_hosts.clone(),
            allowed_ip_ranges: config.parsed_ip_ranges()?,
            signature_key: config.signature_key_bytes()?,
        },
        Arc::new(SystemResolver::new()),
        statser.clone(),
    ));

    let _governor = governor::spawn(
        GovernorConfig {
            interval: std::time::Duration::from_secs(config.gc_interval_secs.max(1)),
            memory_limit_bytes: config.memory_limit_bytes,
        },
        statser.clone(),
    );

    let proxy = Arc::new(Proxy::new(
        client,
        access,
        statser,
        config.max_concurrency,
        config.timeout(),
        config.parsed_base_url()?,
        config.scale_up,
    ));

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| refract::ProxyError::Io(format!("failed to bind {}: {e}", config.listen_addr)))?;

    proxy.serve(listener).await.map_err(Into::into)
}
