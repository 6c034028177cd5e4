//! Proxy front-end
//!
//! One task per connection, one global semaphore as the only backpressure
//! mechanism. Requests flow through parse, admission, the caching client
//! stack, and are streamed back with selected upstream headers relayed.

use std::sync::Arc;
use std::time::Duration;

use http::{HeaderValue, StatusCode};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info};
use url::Url;

use crate::access::AccessPolicy;
use crate::error::extract_status_code;
use crate::http_cache::CachingClient;
use crate::metrics::Statser;
use crate::models::conditional_match;
use crate::request::ImageRequest;

/// Upstream headers relayed to the client before the body.
const RELAYED_HEADERS: [&str; 5] = ["cache-control", "last-modified", "expires", "etag", "link"];

/// The image proxy HTTP server.
pub struct Proxy {
    client: Arc<CachingClient>,
    access: Arc<AccessPolicy>,
    statser: Arc<dyn Statser>,
    gate: Arc<Semaphore>,
    max_concurrency: usize,
    timeout: Option<Duration>,
    base_url: Option<Url>,
    scale_up: bool,
}

impl Proxy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<CachingClient>,
        access: Arc<AccessPolicy>,
        statser: Arc<dyn Statser>,
        max_concurrency: usize,
        timeout: Option<Duration>,
        base_url: Option<Url>,
        scale_up: bool,
    ) -> Self {
        Proxy {
            client,
            access,
            statser,
            gate: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            timeout,
            base_url,
            scale_up,
        }
    }

    /// Accept connections forever.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!("proxy listening on {}", listener.local_addr()?);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let proxy = Arc::clone(&self);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let proxy = Arc::clone(&proxy);
                    async move { Ok::<_, hyper::Error>(proxy.handle(req).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("error serving connection: {err:?}");
                }
            });
        }
    }

    /// Handle one inbound request. Generic over the body type, which is
    /// never read; tests drive this directly with empty-bodied requests.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>> {
        self.statser.increment("request.count.total");

        match req.uri().path() {
            "/favicon.ico" => {
                self.statser.increment("request.count.favicon");
                return empty_response(StatusCode::OK);
            }
            "/health" => {
                self.statser.increment("request.count.health_check");
                // saturated when fewer than two permits remain
                return if self.gate.available_permits() < 2 {
                    text_response(StatusCode::SERVICE_UNAVAILABLE, "overloaded")
                } else {
                    text_response(StatusCode::OK, "OK")
                };
            }
            "/" => return text_response(StatusCode::OK, "OK"),
            _ => {}
        }

        let timer = self.statser.new_timing();

        let _permit = self.gate.acquire().await.expect("gate is never closed");
        let depth = self.max_concurrency - self.gate.available_permits();
        self.statser.gauge("concurrency", depth as u64);

        let response = match self.timeout {
            Some(timeout) if !timeout.is_zero() => {
                match tokio::time::timeout(timeout, self.handle_image(&req)).await {
                    Ok(response) => response,
                    Err(_) => {
                        self.statser.increment("request.error.timeout");
                        text_response(
                            StatusCode::GATEWAY_TIMEOUT,
                            "timed out waiting for the image to be fetched and transformed",
                        )
                    }
                }
            }
            _ => self.handle_image(&req).await,
        };

        timer.send(self.statser.as_ref(), "request.time");
        response
    }

    /// The image-serving path: parse, admit, fetch, relay.
    async fn handle_image<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        let mut image_req =
            match ImageRequest::resolve(req.uri().path(), req.uri().query(), self.base_url.as_ref()) {
                Ok(image_req) => image_req,
                Err(e) => {
                    let msg = format!("invalid request URL: {e}");
                    error!("{msg}");
                    self.statser.increment("request.error.invalid_request_url");
                    return text_response(StatusCode::BAD_REQUEST, &msg);
                }
            };

        // proxy-wide scale-up policy applies to every request
        image_req.options.scale_up = self.scale_up;

        let referer = req
            .headers()
            .get("referer")
            .and_then(|v| v.to_str().ok());
        if let Err(e) = self.access.allowed(&image_req, referer).await {
            error!("{e}");
            return text_response(StatusCode::FORBIDDEN, &e.to_string());
        }

        let exchange = match self.client.get(&image_req.to_string()).await {
            Ok(exchange) => exchange,
            Err(e) => {
                let msg = format!("error fetching remote image: {e}");
                error!("{msg}");
                self.statser.increment("request.error.fetch");
                let status = StatusCode::from_u16(extract_status_code(&e.to_string()))
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return text_response(status, &msg);
            }
        };

        info!(
            "request: {image_req} (served from cache: {})",
            exchange.from_cache()
        );
        if exchange.from_cache() {
            self.statser.increment("request.cached");
        } else {
            self.statser.increment("request.not_cached");
        }

        let mut builder = Response::builder().status(exchange.status);
        {
            let headers = builder.headers_mut().expect("fresh builder");
            for name in RELAYED_HEADERS {
                if let Some(value) = exchange.headers.get(name) {
                    headers.insert(http::HeaderName::from_static(name), value.clone());
                }
            }
            headers.insert(
                "access-control-allow-origin",
                HeaderValue::from_static("*"),
            );
        }

        if conditional_match(req.headers(), &exchange) {
            return builder
                .status(StatusCode::NOT_MODIFIED)
                .body(Full::new(Bytes::new()))
                .expect("valid response");
        }

        {
            let headers = builder.headers_mut().expect("fresh builder");
            for name in ["content-length", "content-type"] {
                if let Some(value) = exchange.headers.get(name) {
                    headers.insert(http::HeaderName::from_static(name), value.clone());
                }
            }
        }

        self.statser
            .increment(&format!("request.code.{}", exchange.status.as_u16()));
        builder
            .body(Full::new(exchange.body))
            .expect("valid response")
    }
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("valid response")
}

fn text_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(message.to_string())))
        .expect("valid response")
}
