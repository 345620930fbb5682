//! `HttpEngine`: per-request orchestration combining cache policy,
//! revalidation, redirect classification, and connection acquisition.
//!
//! Grounded on `HttpCache::run`/`remote_fetch`/`conditional_fetch` in the
//! teacher crate's `lib.rs` for the overall lookup/revalidate/deliver
//! shape, generalized from the teacher's tower-style single-shot
//! `Middleware` call into an explicit frame the `Call`/`InterceptorChain`
//! machinery can re-enter per redirect hop, per this system's design
//! lineage's `HttpEngine` state table.

use crate::body::{CacheReadBodyReader, CachingBodyReader, NetworkBodyReader, ResponseBodyStream};
use crate::cache::metadata_store::MetadataRecord;
use crate::cache::{has_explicit_validator, is_cacheable, record_from_response, ResponseCache};
use crate::config::ClientFacade;
use crate::error::{Error, Result};
use crate::fingerprint::fingerprint;
use crate::interceptor::InterceptorChain;
use crate::request::{CacheControl, Request};
use crate::response::{Response, ResponseBuilder};
use crate::transport::BodyReader;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

/// Adapts a `transport::BodyReader` trait object into a plain
/// `Read + Send` for `body::CachingBodyReader`/`NetworkBodyReader`,
/// forwarding its `close()` on drop so the `Transport` implementation
/// still observes the contract even though this crate's body stream is
/// what callers actually interact with.
struct TransportBodyAdapter(Box<dyn BodyReader>);

impl Read for TransportBodyAdapter {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl Drop for TransportBodyAdapter {
    fn drop(&mut self) {
        let _ = self.0.close();
    }
}

fn epoch_secs(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn parse_http_date(headers: &HeaderMap, name: http::HeaderName) -> Option<SystemTime> {
    headers.get(name).and_then(|v| v.to_str().ok()).and_then(|s| httpdate::parse_http_date(s).ok())
}

/// RFC 7234-simplified freshness lifetime (§4.2): `max-age`/`s-maxage`,
/// else `Expires - Date`, else the heuristic `0.1 * (Date - Last-Modified)`.
fn freshness_lifetime_sec(headers: &HeaderMap, received_at: SystemTime) -> Option<i64> {
    let cc = CacheControl::from_headers(headers);
    if let Some(s_maxage) = cc.s_max_age_sec {
        return Some(s_maxage);
    }
    if let Some(max_age) = cc.max_age_sec {
        return Some(max_age);
    }
    let date = parse_http_date(headers, http::header::DATE).unwrap_or(received_at);
    if let Some(expires) = parse_http_date(headers, http::header::EXPIRES) {
        return Some(epoch_secs(expires) - epoch_secs(date));
    }
    if let Some(last_modified) = parse_http_date(headers, http::header::LAST_MODIFIED) {
        let heuristic = ((epoch_secs(date) - epoch_secs(last_modified)) as f64 * 0.1) as i64;
        return Some(heuristic.max(0));
    }
    None
}

fn current_age_sec(now: SystemTime, received_at: SystemTime, headers: &HeaderMap) -> i64 {
    let header_age = headers
        .get(http::header::AGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);
    let resident = (epoch_secs(now) - epoch_secs(received_at)).max(0);
    header_age.max(0) + resident
}

fn headers_from_map(map: &HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in map {
        if let (Ok(name), Ok(value)) =
            (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value))
        {
            headers.insert(name, value);
        }
    }
    headers
}

fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_string(), value.to_string());
        }
    }
    map
}

/// Overlay any end-to-end header present in `fresh` onto `stored`,
/// per §4.6's conditional-merge rule.
fn merge_headers(stored: &HashMap<String, String>, fresh: &HeaderMap) -> HeaderMap {
    let mut merged = stored.clone();
    for (name, value) in fresh {
        if let Ok(value) = value.to_str() {
            merged.insert(name.as_str().to_string(), value.to_string());
        }
    }
    headers_from_map(&merged)
}

fn has_validator_stored(headers: &HashMap<String, String>) -> bool {
    headers.contains_key("etag") || headers.contains_key("last-modified")
}

/// A response has a known length only with a valid `Content-Length`.
/// Chunked transfer encoding and connection-close delimited bodies are
/// both unknown in advance and therefore not cacheable (§8 boundary
/// behaviors).
fn response_known_length(headers: &HeaderMap) -> bool {
    match headers.get(http::header::CONTENT_LENGTH) {
        Some(v) => {
            v.to_str().ok().and_then(|s| s.parse::<i64>().ok()).map(|n| n >= 0).unwrap_or(false)
        }
        None => false,
    }
}

/// A stored entry is fresh iff `age < lifetime` (widened by `max-stale`,
/// narrowed by `min-fresh`, per §4.2). `must-revalidate` on the stored
/// response disables the `max-stale` widening.
fn is_fresh(record: &MetadataRecord, request_cc: &CacheControl) -> bool {
    let headers = headers_from_map(&record.headers);
    let received_at =
        SystemTime::UNIX_EPOCH + Duration::from_secs(record.received_response_at_epoch.max(0) as u64);
    let now = SystemTime::now();

    let Some(lifetime) = freshness_lifetime_sec(&headers, received_at) else {
        return false;
    };
    let age = current_age_sec(now, received_at, &headers);

    let response_cc = CacheControl::from_headers(&headers);
    let mut effective_lifetime = lifetime;
    if !response_cc.must_revalidate {
        if let Some(max_stale) = request_cc.max_stale_sec {
            effective_lifetime = effective_lifetime.saturating_add(max_stale.max(0));
        }
    }
    if age >= effective_lifetime {
        return false;
    }
    if let Some(min_fresh) = request_cc.min_fresh_sec {
        if lifetime - age < min_fresh.max(0) {
            return false;
        }
    }
    true
}

fn with_conditional_headers(request: &Request, stored: &MetadataRecord) -> Request {
    let mut headers = request.headers().clone();
    if let Some(etag) = stored.headers.get("etag") {
        if let Ok(v) = HeaderValue::from_str(etag) {
            headers.insert(http::header::IF_NONE_MATCH, v);
        }
    }
    if let Some(last_modified) = stored.headers.get("last-modified") {
        if let Ok(v) = HeaderValue::from_str(last_modified) {
            headers.insert(http::header::IF_MODIFIED_SINCE, v);
        }
    }
    Request {
        method: request.method.clone(),
        url: request.url.clone(),
        headers,
        body: request.body.clone(),
        cache_control: request.cache_control,
        fingerprint_override: request.fingerprint_override.clone(),
        cancelled: request.cancelled.clone(),
    }
}

/// The target of a followable redirect, or `None` if this response isn't
/// one (wrong status, unsafe method, missing/unparseable `Location`, or a
/// cross-scheme hop), per §4.2's redirect policy.
pub fn redirect_target(method: &Method, status: StatusCode, headers: &HeaderMap, from: &Url) -> Option<Url> {
    if !matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308) {
        return None;
    }
    if !matches!(*method, Method::GET | Method::HEAD) {
        return None;
    }
    let location = headers.get(http::header::LOCATION)?.to_str().ok()?;
    let target = from.join(location).ok()?;
    if target.scheme() != from.scheme() {
        return None;
    }
    Some(target)
}

/// Implements the per-request state machine described in §4.2. One
/// `HttpEngine` handles exactly one frame; redirects are driven by the
/// caller (`call::Call`), which re-enters the application interceptor
/// chain with a new frame for the follow-up request.
pub struct HttpEngine {
    facade: Arc<ClientFacade>,
    /// Set to the connection currently bound to this call's in-flight
    /// network attempt, so `Call::cancel` can reach it for a best-effort
    /// abort of blocking I/O (§5). `None` for engines run outside a
    /// `Call` (e.g. these unit tests).
    active_connection: Option<Arc<parking_lot::Mutex<Option<crate::pool::Connection>>>>,
}

impl HttpEngine {
    pub fn new(facade: Arc<ClientFacade>) -> Self {
        HttpEngine { facade, active_connection: None }
    }

    /// Construct an engine that publishes its currently bound connection
    /// into `active`, used by `call::Call` to support mid-flight cancellation.
    pub(crate) fn with_active_connection(
        facade: Arc<ClientFacade>,
        active: Arc<parking_lot::Mutex<Option<crate::pool::Connection>>>,
    ) -> Self {
        HttpEngine { facade, active_connection: Some(active) }
    }

    fn connection_identity(&self, url: &Url) -> crate::pool::ConnectionIdentity {
        let default_port = if url.scheme() == "https" { 443 } else { 80 };
        crate::pool::ConnectionIdentity {
            scheme: url.scheme().to_string(),
            host: url.host_str().unwrap_or_default().to_string(),
            port: url.port().unwrap_or(default_port),
            proxy: self.facade.tls.proxy.clone(),
            root_ca_dir: self.facade.tls.root_ca_directory.clone(),
            root_ca_file: self.facade.tls.root_ca_file.clone(),
            timeout_sec: self.facade.timeout_sec(),
        }
    }

    /// Run one frame: cache lookup, conditional revalidation, or a plain
    /// network round-trip, and classification of the result. Does not
    /// follow redirects itself.
    pub fn run_frame(
        &self,
        request: Request,
        chain: &InterceptorChain,
        prior: Option<Response>,
    ) -> Result<Response> {
        if request.is_cancelled() {
            return Err(Error::cancelled());
        }

        let request_cc = request.cache_control();
        let cache = self.facade.cache().cloned();

        if *request.method() != Method::GET {
            let response = self.send_over_network(request.clone(), chain, prior)?;
            if let Some(cache) = &cache {
                if crate::cache::invalidates_on_success(request.method()) && response.status().is_success()
                {
                    let get_key = fingerprint(&Method::GET, request.url());
                    let _ = cache.remove(&get_key);
                }
            }
            return Ok(response);
        }

        let key = request
            .fingerprint_override()
            .map(|s| s.to_string())
            .unwrap_or_else(|| fingerprint(request.method(), request.url()));

        let entry = match &cache {
            Some(cache) => cache.lookup(&key)?,
            None => None,
        };

        match entry {
            Some(entry) => {
                if !request_cc.no_cache && is_fresh(&entry.metadata, &request_cc) {
                    return self.deliver_cache(request, cache.as_ref().unwrap(), &key, entry, prior);
                }
                if request_cc.only_if_cached {
                    return Ok(self.synthesize_504(request, prior));
                }
                if has_validator_stored(&entry.metadata.headers) {
                    let conditional = with_conditional_headers(&request, &entry.metadata);
                    let network_response = self.send_over_network(conditional, chain, prior.clone())?;
                    if network_response.status().as_u16() == 304 {
                        return self.merge_conditional(
                            request,
                            cache.as_ref().unwrap(),
                            &key,
                            entry.metadata,
                            network_response,
                            prior,
                        );
                    }
                    return Ok(network_response);
                }
                self.send_over_network(request, chain, prior)
            }
            None => {
                if request_cc.only_if_cached {
                    return Ok(self.synthesize_504(request, prior));
                }
                self.send_over_network(request, chain, prior)
            }
        }
    }

    fn deliver_cache(
        &self,
        request: Request,
        cache: &Arc<ResponseCache>,
        key: &str,
        entry: crate::cache::CacheEntry,
        prior: Option<Response>,
    ) -> Result<Response> {
        let file = cache
            .open_body(key)?
            .ok_or_else(|| Error::CacheIo(format!("cache body for {key} missing at delivery").into()))?;
        let status = StatusCode::from_u16(entry.metadata.status)?;
        let headers = headers_from_map(&entry.metadata.headers);
        let mut builder = ResponseBuilder::new(request, status, entry.metadata.reason.clone())
            .headers(headers)
            .body(ResponseBodyStream::CacheRead(CacheReadBodyReader::new(file)));
        if let Some(p) = prior {
            builder = builder.prior_response(p);
        }
        Ok(builder.build())
    }

    fn synthesize_504(&self, request: Request, prior: Option<Response>) -> Response {
        let mut builder = ResponseBuilder::new(request, StatusCode::from_u16(504).unwrap(), "Unsatisfiable Request");
        if let Some(p) = prior {
            builder = builder.prior_response(p);
        }
        builder.build()
    }

    fn merge_conditional(
        &self,
        request: Request,
        cache: &Arc<ResponseCache>,
        key: &str,
        stored: MetadataRecord,
        network_response: Response,
        prior: Option<Response>,
    ) -> Result<Response> {
        let merged_headers = merge_headers(&stored.headers, network_response.headers());
        let status = StatusCode::from_u16(stored.status)?;
        let file = cache
            .open_body(key)?
            .ok_or_else(|| Error::CacheIo(format!("cache body for {key} missing at merge").into()))?;

        let now = crate::cache::now_epoch();
        let mut updated = stored.clone();
        updated.headers = headers_to_map(&merged_headers);
        updated.received_response_at_epoch = now;
        updated.last_accessed_at_epoch = now;
        cache.update_metadata(&updated)?;

        let cache_response =
            ResponseBuilder::new(request.clone(), status, stored.reason.clone())
                .headers(headers_from_map(&stored.headers))
                .build();

        let mut builder = ResponseBuilder::new(request, status, stored.reason.clone())
            .headers(merged_headers)
            .body(ResponseBodyStream::CacheRead(CacheReadBodyReader::new(file)))
            .cache_response(cache_response)
            .network_response(network_response);
        if let Some(p) = prior {
            builder = builder.prior_response(p);
        }
        Ok(builder.build())
    }

    /// Acquire a connection, run `request` through the network
    /// interceptor chain and the bound `Transport`, and wrap the result
    /// body for either cache-tee or plain network delivery. Releases the
    /// connection (or terminates it) when the caller closes the body, or
    /// immediately on a send failure.
    fn send_over_network(
        &self,
        request: Request,
        chain: &InterceptorChain,
        prior: Option<Response>,
    ) -> Result<Response> {
        if request.is_cancelled() {
            return Err(Error::cancelled());
        }

        let identity = self.connection_identity(request.url());
        let connection = self.facade.pool().acquire(&identity);
        if let Some(active) = &self.active_connection {
            *active.lock() = Some(connection.clone());
        }
        if request.is_cancelled() {
            // Cancelled between the top-of-function check and acquiring
            // the connection: release immediately and bail out.
            connection.cancel();
            self.facade.pool().release(&connection);
            if let Some(active) = &self.active_connection {
                *active.lock() = None;
            }
            return Err(Error::cancelled());
        }
        let pool = Arc::clone(self.facade.pool());
        let pool_for_terminal = Arc::clone(&pool);
        let transport = Arc::clone(&self.facade.transport);
        let cache = self.facade.cache().cloned();
        let key = fingerprint(request.method(), request.url());
        let sent_at = SystemTime::now();
        let active_for_close = self.active_connection.clone();
        let active_for_err = self.active_connection.clone();

        let conn_for_transport = connection.clone();
        let result = chain.run_network(request.clone(), connection.clone(), &move |req| {
            if conn_for_transport.is_cancelled() {
                return Err(Error::cancelled());
            }
            let (status, reason, headers, raw_body) = transport.send(&req, &conn_for_transport)?;
            let received_at = SystemTime::now();

            let shell = ResponseBuilder::new(req.clone(), status, reason.clone())
                .headers(headers.clone())
                .build();

            let cacheable = cache.is_some()
                && is_cacheable(
                    req.method(),
                    status.as_u16(),
                    response_known_length(&headers),
                    CacheControl::from_headers(&headers).no_store,
                    has_explicit_validator(&headers),
                );

            let adapted: Box<dyn Read + Send> = Box::new(TransportBodyAdapter(raw_body));

            let body_stream = if cacheable {
                let cache = cache.clone().unwrap();
                let (temp, generation) = cache.begin_put(&key)?;
                let record =
                    record_from_response(&key, &req, &shell, epoch_secs(sent_at), epoch_secs(received_at));
                let pool_for_close = Arc::clone(&pool_for_terminal);
                let conn_for_close = conn_for_transport.clone();
                let key_for_commit = key.clone();
                let active_for_close = active_for_close.clone();
                ResponseBodyStream::Caching(
                    CachingBodyReader::new(adapted, temp)
                        .with_on_commit(move |temp, bytes| {
                            if cache.is_current_writer(&key_for_commit, generation) {
                                let mut record = record;
                                record.body_size = bytes;
                                let _ = cache.commit_put(&key_for_commit, temp, record);
                            }
                        })
                        .with_on_close(move |drained| {
                            if !drained {
                                conn_for_close.cancel();
                            }
                            pool_for_close.release(&conn_for_close);
                            if let Some(active) = &active_for_close {
                                *active.lock() = None;
                            }
                        }),
                )
            } else {
                let pool_for_close = Arc::clone(&pool_for_terminal);
                let conn_for_close = conn_for_transport.clone();
                let active_for_close = active_for_close.clone();
                ResponseBodyStream::Network(NetworkBodyReader::new(adapted).with_on_close(move |drained| {
                    if !drained {
                        conn_for_close.cancel();
                    }
                    pool_for_close.release(&conn_for_close);
                    if let Some(active) = &active_for_close {
                        *active.lock() = None;
                    }
                }))
            };

            let mut builder = ResponseBuilder::new(req, status, reason)
                .headers(headers)
                .body(body_stream)
                .timestamps(sent_at, received_at);
            if let Some(p) = prior.clone() {
                builder = builder.prior_response(p);
            }
            Ok(builder.build())
        });

        match result {
            Ok(response) => Ok(response),
            Err(err) => {
                connection.cancel();
                pool.release(&connection);
                if let Some(active) = &active_for_err {
                    *active.lock() = None;
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientFacade;
    use crate::interceptor::InterceptorChain;
    use crate::transport::{MockTransport, ScriptedResponse};
    use tempfile::TempDir;

    fn request(url: &str) -> Request {
        Request::builder(Method::GET, Url::parse(url).unwrap()).build()
    }

    fn facade_with_cache(transport: Arc<MockTransport>, dir: &TempDir) -> Arc<ClientFacade> {
        let cache = ResponseCache::open(dir.path(), 10_000).unwrap();
        ClientFacade::builder(transport).cache(cache).build().unwrap()
    }

    #[test]
    fn fresh_cached_response_is_served_without_a_network_call() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.script(
            "http://h/p",
            ScriptedResponse::new(200, "OK")
                .header("cache-control", "max-age=3600")
                .body(b"response data 1".to_vec()),
        );
        let facade = facade_with_cache(transport.clone(), &dir);
        let chain = InterceptorChain::new(vec![], vec![]);
        let engine = HttpEngine::new(facade.clone());

        let first = engine.run_frame(request("http://h/p"), &chain, None).unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let _ = first.take_body().unwrap().close();

        let second = engine.run_frame(request("http://h/p"), &chain, None).unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(transport.send_count(), 1);
    }

    #[test]
    fn stale_entry_with_validator_revalidates_via_304() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.script(
            "http://h/p",
            ScriptedResponse::new(200, "OK")
                .header("cache-control", "max-age=0")
                .header("last-modified", "Mon, 25 Jul 2016 10:13:43 GMT")
                .body(b"response data 1".to_vec()),
        );
        transport.script("http://h/p", ScriptedResponse::new(304, "Not Modified"));
        let facade = facade_with_cache(transport.clone(), &dir);
        let chain = InterceptorChain::new(vec![], vec![]);
        let engine = HttpEngine::new(facade);

        let first = engine.run_frame(request("http://h/p"), &chain, None).unwrap();
        let mut body = first.take_body().unwrap();
        let mut out = Vec::new();
        body.read_to_end(&mut out).unwrap();
        let _ = body.close();
        assert_eq!(out, b"response data 1");

        let second = engine.run_frame(request("http://h/p"), &chain, None).unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.network_response().unwrap().status().as_u16(), 304);
        assert!(second.cache_response().is_some());
        let mut merged_body = second.take_body().unwrap();
        let mut merged_out = Vec::new();
        merged_body.read_to_end(&mut merged_out).unwrap();
        assert_eq!(merged_out, b"response data 1");
        assert_eq!(transport.send_count(), 2);
    }

    #[test]
    fn only_if_cached_miss_synthesizes_504() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        let facade = facade_with_cache(transport, &dir);
        let chain = InterceptorChain::new(vec![], vec![]);
        let engine = HttpEngine::new(facade);

        let mut req = request("http://h/missing");
        req = Request::builder(req.method().clone(), req.url().clone())
            .cache_control(CacheControl::force_cache())
            .build();
        let response = engine.run_frame(req, &chain, None).unwrap();
        assert_eq!(response.status().as_u16(), 504);
    }

    #[test]
    fn post_to_cached_url_invalidates_the_get_entry() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.script(
            "http://h/p",
            ScriptedResponse::new(200, "OK")
                .header("cache-control", "max-age=3600")
                .body(b"response data 1".to_vec()),
        );
        transport.script("http://h/p", ScriptedResponse::new(200, "OK").body(b"ok".to_vec()));
        let facade = facade_with_cache(transport, &dir);
        let chain = InterceptorChain::new(vec![], vec![]);
        let engine = HttpEngine::new(facade.clone());

        let get1 = engine.run_frame(request("http://h/p"), &chain, None).unwrap();
        let _ = get1.take_body().unwrap().close();

        let post = Request::builder(Method::POST, Url::parse("http://h/p").unwrap()).build();
        let post_response = engine.run_frame(post, &chain, None).unwrap();
        let _ = post_response.take_body();
        assert!(post_response.status().is_success());

        assert!(facade.cache().unwrap().lookup(&fingerprint(&Method::GET, &Url::parse("http://h/p").unwrap())).unwrap().is_none());
    }

    #[test]
    fn redirect_target_rejects_cross_scheme_hop() {
        let from = Url::parse("http://h/p").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::LOCATION, "https://h/p".parse().unwrap());
        assert!(redirect_target(&Method::GET, StatusCode::from_u16(307).unwrap(), &headers, &from).is_none());
    }

    #[test]
    fn redirect_target_follows_same_scheme_307_for_get() {
        let from = Url::parse("http://h/p").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::LOCATION, "http://h/q".parse().unwrap());
        let target = redirect_target(&Method::GET, StatusCode::from_u16(307).unwrap(), &headers, &from).unwrap();
        assert_eq!(target.as_str(), "http://h/q");
    }
}
