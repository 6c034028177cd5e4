//! Fetch pipeline
//!
//! Two transports compose under the caching layer. `HttpTransport` performs
//! real upstream GETs with a bounded body read. `TransformingTransport`
//! recognizes requests whose URL fragment carries transformation options:
//! it fetches the original through an inner caching client (so the original
//! is cached under the fragment-free URL), guards size and type, runs the
//! transformation engine, and fabricates a synthetic response for the outer
//! cache to store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use tracing::{debug, error, info};

use crate::cache::Cache;
use crate::error::{ProxyError, Result};
use crate::http_cache::CachingClient;
use crate::limit_reader::LimitedReader;
use crate::metrics::Statser;
use crate::models::{conditional_match, Exchange, ExchangeRequest, Transport};
use crate::options::Options;
use crate::transform::{changes_format, decode_dimensions, Transformer};

/// Content types accepted for transformation.
const ALLOWED_CONTENT_TYPES: [&str; 4] = ["image/jpeg", "image/jpg", "image/png", "image/gif"];

/// Upstream transport backed by a reqwest client. Bodies are drained
/// through the byte budget regardless of what Content-Length claims.
pub struct HttpTransport {
    client: reqwest::Client,
    max_response_size: u64,
}

impl HttpTransport {
    pub fn new(max_response_size: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProxyError::Upstream(format!("failed to create HTTP client: {e}")))?;
        Ok(HttpTransport {
            client,
            max_response_size,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn round_trip(&self, req: &ExchangeRequest) -> Result<Exchange> {
        let url = req.without_fragment();
        debug!("fetching remote URL: {url}");

        let response = self
            .client
            .get(url)
            .headers(req.headers.clone())
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = LimitedReader::new(response.bytes_stream(), self.max_response_size)
            .collect()
            .await?;

        Ok(Exchange {
            status,
            headers,
            body,
        })
    }
}

/// Transport that turns option-carrying requests into transformed images.
pub struct TransformingTransport {
    /// Underlying transport for requests without an options fragment.
    base: Arc<dyn Transport>,

    /// Caching client used to fetch originals, so they are cached under the
    /// URL without the fragment, separately from every derived variant.
    client: Arc<CachingClient>,

    transformer: Arc<Transformer>,
    statser: Arc<dyn Statser>,
    max_response_size: u64,
    max_pixels: u64,
}

impl TransformingTransport {
    pub fn new(
        base: Arc<dyn Transport>,
        client: Arc<CachingClient>,
        transformer: Arc<Transformer>,
        statser: Arc<dyn Statser>,
        max_response_size: u64,
        max_pixels: u64,
    ) -> Self {
        TransformingTransport {
            base,
            client,
            transformer,
            statser,
            max_response_size,
            max_pixels,
        }
    }
}

#[async_trait]
impl Transport for TransformingTransport {
    async fn round_trip(&self, req: &ExchangeRequest) -> Result<Exchange> {
        if req.fragment().is_empty() {
            // normal requests pass through
            return self.base.round_trip(req).await;
        }

        let url = req.without_fragment();
        let timer = self.statser.new_timing();
        let original = self.client.get(url).await?;
        timer.send(self.statser.as_ref(), "request.get_image");

        if original.status != StatusCode::OK {
            return Err(ProxyError::UpstreamStatus(original.status.as_u16()));
        }

        let content_type = original.header("content-type").unwrap_or_default();
        let base_type = content_type.split(';').next().unwrap_or_default().trim();
        if !ALLOWED_CONTENT_TYPES.contains(&base_type) {
            self.statser.increment("image.error.content_type");
            return Err(ProxyError::UnsupportedContentType(content_type.to_string()));
        }

        // a conditional request satisfied by the original lets the caching
        // layer above reuse its stored entry
        if conditional_match(&req.headers, &original) {
            return Ok(Exchange::new(StatusCode::NOT_MODIFIED));
        }

        if let Some(declared) = original
            .header("content-length")
            .and_then(|v| v.parse::<u64>().ok())
        {
            if declared > self.max_response_size {
                self.statser.increment("image.error.too_large.bytes");
                return Err(ProxyError::BodyTooLarge {
                    limit: self.max_response_size,
                });
            }
        }
        // the declared length can lie, and cached entries may predate a
        // lowered limit
        if original.body.len() as u64 > self.max_response_size {
            self.statser.increment("image.error.too_large.bytes");
            return Err(ProxyError::BodyTooLarge {
                limit: self.max_response_size,
            });
        }
        self.statser.gauge("request.size.bytes", original.body.len() as u64);

        let (width, height) = decode_dimensions(&original.body)?;
        let pixels = width as u64 * height as u64;
        info!("image: {url}, width: {width}, height: {height}, pixels: {pixels}");
        self.statser.gauge("request.size.pixels", pixels);
        if pixels > self.max_pixels {
            self.statser.increment("image.error.too_large.pixels");
            return Err(ProxyError::TooManyPixels {
                max: self.max_pixels,
                actual: pixels,
            });
        }

        let options = Options::parse(req.fragment());
        let body = match self
            .transformer
            .transform(original.body.clone(), &options, url)
        {
            Ok(transformed) => transformed,
            Err(e) => {
                // a transform bug must never 5xx a request whose source
                // bytes were valid
                self.statser.increment("image.error.transform");
                error!(
                    "error transforming image: {e}, Content-Type: {content_type}, URL: {url}"
                );
                original.body.clone()
            }
        };

        // replay the response with the transformed image and an updated
        // content length
        let mut synthetic = Exchange {
            status: original.status,
            headers: original.headers.clone(),
            body,
        };
        if changes_format(&original.body, &options) {
            synthetic.headers.remove("content-type");
        }
        synthetic.headers.remove("content-length");
        synthetic.set_header("content-length", &synthetic.body.len().to_string());

        Ok(synthetic)
    }
}

/// Compose the full client stack: a caching layer over the transforming
/// transport, which itself fetches originals through a caching layer over
/// the base transport. Both layers share one cache; the fragment keeps their
/// key spaces disjoint.
pub fn new_client(
    base: Arc<dyn Transport>,
    cache: Arc<dyn Cache>,
    transformer: Arc<Transformer>,
    statser: Arc<dyn Statser>,
    max_response_size: u64,
    max_pixels: u64,
) -> Arc<CachingClient> {
    let inner = Arc::new(CachingClient::new(base.clone(), cache.clone()));
    let transforming = Arc::new(TransformingTransport::new(
        base,
        inner,
        transformer,
        statser,
        max_response_size,
        max_pixels,
    ));
    Arc::new(CachingClient::new(transforming, cache))
}
