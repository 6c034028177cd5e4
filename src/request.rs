//! Request resolution
//!
//! An inbound proxy path is either `/{options}/{remote_url}` or just
//! `/{remote_url}`. The remote URL is not percent-encoded and may carry its
//! own path; the inbound query string always belongs to the remote URL.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use url::Url;

use crate::error::{ProxyError, Result};
use crate::options::Options;

/// A resolved proxy request: the remote image URL plus the transformations
/// to apply to it.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub url: Url,
    pub options: Options,
}

impl ImageRequest {
    /// Resolve an inbound request path and query into an `ImageRequest`.
    ///
    /// `path` is the raw request path including the leading slash; `query`
    /// is the raw inbound query string, appended verbatim to the remote URL.
    /// Relative remote URLs are resolved against `base_url` when one is
    /// configured.
    pub fn resolve(path: &str, query: Option<&str>, base_url: Option<&Url>) -> Result<ImageRequest> {
        let inbound = path.strip_prefix('/').unwrap_or(path);

        let mut options = Options::default();
        let mut url = match parse_absolute(inbound) {
            Some(u) => u,
            None => {
                // first segment is the option list
                let (opts, remote) = inbound.split_once('/').ok_or_else(|| ProxyError::MalformedUrl {
                    message: "too few path segments".to_string(),
                    url: path.to_string(),
                })?;
                options = Options::parse(opts);
                parse_remote(remote, base_url).map_err(|message| ProxyError::MalformedUrl {
                    message,
                    url: path.to_string(),
                })?
            }
        };

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ProxyError::MalformedUrl {
                message: "remote URL must have http or https scheme".to_string(),
                url: path.to_string(),
            });
        }

        // the inbound query string is always part of the remote URL
        url.set_query(query);

        Ok(ImageRequest { url, options })
    }

    /// The remote URL string without options, used for signature validation
    /// and as the cache key of the original image.
    pub fn remote_url(&self) -> String {
        self.url.to_string()
    }
}

impl fmt::Display for ImageRequest {
    /// The request URL with the options encoded in the fragment. This is the
    /// cache key of the transformed variant.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut u = self.url.clone();
        u.set_fragment(Some(&self.options.to_string()));
        write!(f, "{u}")
    }
}

/// Undo path cleaning that collapses the double slash of an embedded scheme
/// (`http://` becoming `http:/`).
fn restore_scheme(s: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^(https?):/+([^/])").unwrap());
    re.replace(s, "$1://$2").into_owned()
}

fn parse_absolute(s: &str) -> Option<Url> {
    let cleaned = restore_scheme(s);
    match Url::parse(&cleaned) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => Some(u),
        _ => None,
    }
}

fn parse_remote(s: &str, base_url: Option<&Url>) -> std::result::Result<Url, String> {
    let cleaned = restore_scheme(s);
    match Url::parse(&cleaned) {
        Ok(u) => Ok(u),
        Err(url::ParseError::RelativeUrlWithoutBase) => match base_url {
            Some(base) => base
                .join(&cleaned)
                .map_err(|e| format!("unable to parse remote URL: {e}")),
            None => Err("must provide absolute remote URL".to_string()),
        },
        Err(e) => Err(format!("unable to parse remote URL: {e}")),
    }
}
