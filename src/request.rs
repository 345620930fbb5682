//! The immutable `Request` value and its `CacheControl` directive override.

use http::{HeaderMap, Method};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// A restartable request body: either fully-buffered bytes or a known- or
/// unknown-length byte source. Bodies are not consumed by `Request` itself;
/// the engine hands them to the bound `Transport`.
#[derive(Clone, Debug)]
pub enum RequestBody {
    /// An in-memory body of known length.
    Bytes(bytes::Bytes),
    /// A restartable byte source whose length may be unknown (negotiated
    /// as `Transfer-Encoding: chunked` on the wire).
    Stream {
        /// Declared content length, if known.
        content_length: Option<u64>,
        /// Media type, if known (e.g. `application/json`).
        media_type: Option<String>,
    },
}

/// Request-side cache control directives, parsed from a `Cache-Control`
/// (and legacy `Pragma: no-cache`) header, or set programmatically via
/// [`Request::with_cache_control`].
///
/// Parsing mirrors RFC 7234 §5.2.1: directives are comma-separated,
/// `name=value` pairs may quote their value, and unrecognized directives
/// are ignored rather than rejected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub max_age_sec: Option<i64>,
    pub max_stale_sec: Option<i64>,
    pub min_fresh_sec: Option<i64>,
    pub s_max_age_sec: Option<i64>,
    pub must_revalidate: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub no_transform: bool,
    pub only_if_cached: bool,
    pub public: bool,
    pub private: bool,
}

impl CacheControl {
    /// A `CacheControl` that forces cache-only lookup (`only-if-cached`,
    /// effectively unbounded `max-stale`).
    pub fn force_cache() -> Self {
        CacheControl { only_if_cached: true, max_stale_sec: Some(i64::MAX), ..Default::default() }
    }

    /// A `CacheControl` that forces a network round-trip (`no-cache`).
    pub fn force_network() -> Self {
        CacheControl { no_cache: true, ..Default::default() }
    }

    /// Parse directives out of a request or response header map. Both
    /// `Cache-Control` and the HTTP/1.0 `Pragma: no-cache` backward
    /// compatibility directive (RFC 2616 §14.32) are honored.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut builder = CacheControl::default();

        if let Some(pragma) = headers.get(http::header::PRAGMA) {
            if pragma.to_str().map(|v| v.eq_ignore_ascii_case("no-cache")).unwrap_or(false) {
                builder.no_cache = true;
            }
        }

        for value in headers.get_all(http::header::CACHE_CONTROL) {
            let Ok(value) = value.to_str() else { continue };
            for directive in value.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                let mut parts = directive.splitn(2, '=');
                let name = parts.next().unwrap_or("").trim();
                let raw_param = parts.next().map(str::trim);
                if raw_param.map(|p| directive.matches('=').count() > 1).unwrap_or(false) {
                    // Too many `=` for this simple tokenizer; skip the directive.
                    continue;
                }
                let param = raw_param.map(|p| {
                    if p.len() > 1 && p.starts_with('"') && p.ends_with('"') {
                        &p[1..p.len() - 1]
                    } else {
                        p
                    }
                });

                match name.to_ascii_lowercase().as_str() {
                    "max-age" => builder.max_age_sec = parse_number(param),
                    "s-maxage" => builder.s_max_age_sec = parse_number(param),
                    "max-stale" => builder.max_stale_sec = parse_number(param),
                    "min-fresh" => builder.min_fresh_sec = parse_number(param),
                    "must-revalidate" => builder.must_revalidate = true,
                    "no-cache" => builder.no_cache = true,
                    "no-store" => builder.no_store = true,
                    "no-transform" => builder.no_transform = true,
                    "only-if-cached" => builder.only_if_cached = true,
                    "public" => builder.public = true,
                    "private" => builder.private = true,
                    _ => {}
                }
            }
        }

        builder
    }

    pub(crate) fn max_stale(&self) -> Option<Duration> {
        self.max_stale_sec.filter(|s| *s >= 0).map(|s| Duration::from_secs(s as u64))
    }

    pub(crate) fn min_fresh(&self) -> Option<Duration> {
        self.min_fresh_sec.filter(|s| *s >= 0).map(|s| Duration::from_secs(s as u64))
    }
}

fn parse_number(param: Option<&str>) -> Option<i64> {
    match param {
        None | Some("") => None,
        Some(p) => p.parse::<i64>().ok(),
    }
}

/// An immutable, shareable HTTP request.
#[derive(Clone, Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<RequestBody>,
    pub(crate) cache_control: CacheControl,
    pub(crate) fingerprint_override: Option<String>,
    pub(crate) cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl Request {
    /// Start building a request for `method` against `url`.
    pub fn builder(method: Method, url: Url) -> RequestBuilder {
        RequestBuilder {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            cache_control: None,
            fingerprint_override: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    pub fn cache_control(&self) -> CacheControl {
        self.cache_control
    }

    /// Cache fingerprint override, or `None` to derive it from
    /// method + URL (see `fingerprint::fingerprint`).
    pub fn fingerprint_override(&self) -> Option<&str> {
        self.fingerprint_override.as_deref()
    }

    /// Whether this request's owning `Call` has been cancelled.
    /// Interceptors may observe this to short-circuit.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Build a copy of this request with a different URL and method,
    /// preserving headers minus hop-specific ones, used when following a
    /// redirect or building a conditional revalidation request.
    pub(crate) fn with_url(&self, url: Url) -> Request {
        Request {
            method: self.method.clone(),
            url,
            headers: self.headers.clone(),
            body: self.body.clone(),
            cache_control: self.cache_control,
            fingerprint_override: self.fingerprint_override.clone(),
            cancelled: self.cancelled.clone(),
        }
    }
}

/// Builder for [`Request`].
pub struct RequestBuilder {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<RequestBody>,
    cache_control: Option<CacheControl>,
    fingerprint_override: Option<String>,
}

impl RequestBuilder {
    pub fn header(mut self, name: http::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn cache_control(mut self, cache_control: CacheControl) -> Self {
        self.cache_control = Some(cache_control);
        self
    }

    pub fn fingerprint_override(mut self, tag: impl Into<String>) -> Self {
        self.fingerprint_override = Some(tag.into());
        self
    }

    pub fn build(self) -> Request {
        let cache_control =
            self.cache_control.unwrap_or_else(|| CacheControl::from_headers(&self.headers));
        Request {
            method: self.method,
            url: self.url,
            headers: self.headers,
            body: self.body,
            cache_control,
            fingerprint_override: self.fingerprint_override,
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pragma_no_cache_sets_no_cache() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::PRAGMA, "no-cache".parse().unwrap());
        let cc = CacheControl::from_headers(&headers);
        assert!(cc.no_cache);
    }

    #[test]
    fn parses_max_age_and_must_revalidate() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CACHE_CONTROL,
            "max-age=3600, must-revalidate".parse().unwrap(),
        );
        let cc = CacheControl::from_headers(&headers);
        assert_eq!(cc.max_age_sec, Some(3600));
        assert!(cc.must_revalidate);
    }

    #[test]
    fn strips_quotes_from_quoted_values() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CACHE_CONTROL, "max-age=\"120\"".parse().unwrap());
        let cc = CacheControl::from_headers(&headers);
        assert_eq!(cc.max_age_sec, Some(120));
    }

    #[test]
    fn force_cache_sets_only_if_cached_and_unbounded_stale() {
        let cc = CacheControl::force_cache();
        assert!(cc.only_if_cached);
        assert_eq!(cc.max_stale_sec, Some(i64::MAX));
    }
}
