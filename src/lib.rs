//! refract: a caching HTTP image-transformation proxy
//!
//! Clients request `/{options}/{remote_url}`; the proxy fetches the remote
//! image (subject to host, IP-range, referrer, and signature admission),
//! applies the requested transformations, and returns the result. Originals
//! and every derived variant are cached separately, so repeat requests
//! avoid both upstream traffic and recomputation.
//!
//! # Architecture
//!
//! The client stack is two caching layers deep. The outer layer caches
//! transformed variants, keyed by the remote URL with the option string in
//! the fragment. Its transport is [`TransformingTransport`], which fetches
//! the original through an inner caching client (keyed by the fragment-free
//! URL), runs the [`Transformer`], and fabricates a synthetic response for
//! the outer cache to store.
//!
//! ```text
//! client -> Proxy -> CachingClient ──> TransformingTransport
//!                        │                    │
//!                     DiskCache <── CachingClient -> HttpTransport -> origin
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use refract::ProxyConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProxyConfig::from_file("refract.yaml")?;
//! println!("listening on {}", config.listen_addr);
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod cache;
pub mod config;
pub mod diskcache;
pub mod error;
pub mod fetch;
pub mod governor;
pub mod http_cache;
pub mod ip_range;
pub mod limit_reader;
pub mod metrics;
pub mod models;
pub mod options;
pub mod request;
pub mod resolver;
pub mod server;
pub mod transform;

// Re-export commonly used types
pub use access::{AccessConfig, AccessPolicy};
pub use cache::{Cache, MemoryCache, NopCache};
pub use config::ProxyConfig;
pub use diskcache::{spawn_original_evictor, CacheEvent, CacheOp, DiskCache};
pub use error::{ProxyError, Result};
pub use fetch::{new_client, HttpTransport, TransformingTransport};
pub use http_cache::CachingClient;
pub use ip_range::IpRange;
pub use limit_reader::LimitedReader;
pub use metrics::{AtomicStats, NoopStats, Statser};
pub use models::{Exchange, ExchangeRequest, Transport};
pub use options::{Options, OutputFormat};
pub use request::ImageRequest;
pub use resolver::{Resolver, SystemResolver};
pub use server::Proxy;
pub use transform::{Transformer, DEFAULT_MAX_SCALE_UP, DEFAULT_QUALITY};
