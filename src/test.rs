//! End-to-end scenario tests driving `ClientFacade`/`Call` through a
//! scripted `Transport`, covering the concrete scenarios this system is
//! built against rather than any single module's unit behavior.

use crate::config::ClientFacade;
use crate::error::Error;
use crate::fingerprint::fingerprint;
use crate::pool::Connection;
use crate::request::Request;
use crate::transport::{BodyReader, ScriptedResponse, Transport};
use http::{HeaderMap, Method, StatusCode};
use std::io::Read;
use std::sync::Arc;
use tempfile::TempDir;
use url::Url;

fn get(url: &str) -> Request {
    Request::builder(Method::GET, Url::parse(url).unwrap()).build()
}

fn key(url: &str) -> String {
    fingerprint(&Method::GET, &Url::parse(url).unwrap())
}

/// S1 — a fresh GET against a bare facade (no cache configured) returns
/// the scripted body and releases its connection back to the pool Idle.
#[test]
fn s1_fresh_get_with_no_cache_round_trips_body_and_frees_connection() {
    let transport = crate::transport::MockTransport::new();
    transport.script(
        "http://h/p?a=10&b=20",
        ScriptedResponse::new(200, "OK")
            .header("content-type", "text/plain")
            .body(b"response data 1".to_vec()),
    );
    let facade = ClientFacade::builder(transport).build().unwrap();

    let call = facade.new_call(get("http://h/p?a=10&b=20"));
    let response = call.execute().unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.take_body().unwrap();
    let mut bytes = Vec::new();
    body.read_to_end(&mut bytes).unwrap();
    assert_eq!(bytes, b"response data 1");
    body.close().unwrap();

    assert_eq!(facade.pool().size(), 1);
}

/// S4 — under a 300-byte budget with 100-byte bodies, a fourth GET
/// evicts the least-recently-used key, driven through the full
/// call/engine/cache path rather than the cache's own unit tests.
#[test]
fn s4_lru_eviction_through_the_full_call_path() {
    let transport = crate::transport::MockTransport::new();
    for n in 1..=4u8 {
        transport.script(
            &format!("http://h/p?test={n}"),
            ScriptedResponse::new(200, "OK").body(vec![0u8; 100]),
        );
    }
    let dir = TempDir::new().unwrap();
    let cache = crate::cache::ResponseCache::open(dir.path(), 300).unwrap();
    let facade = ClientFacade::builder(transport).cache(cache).build().unwrap();

    let fetch = |n: u8| {
        let call = facade.new_call(get(&format!("http://h/p?test={n}")));
        let response = call.execute().unwrap();
        let _ = response.take_body().unwrap().close();
    };

    fetch(1);
    fetch(2);
    fetch(3);
    fetch(4);

    let c = facade.cache().unwrap();
    assert!(c.lookup(&key("http://h/p?test=1")).unwrap().is_none());
    assert!(c.lookup(&key("http://h/p?test=4")).unwrap().is_some());
}

/// A 0-byte body with a known `Content-Length: 0` is still cacheable
/// and served from cache on the next GET.
#[test]
fn zero_length_body_is_cacheable_and_served_from_cache() {
    let transport = Arc::new(crate::transport::MockTransport::new());
    transport.script(
        "http://h/empty",
        ScriptedResponse::new(200, "OK")
            .header("cache-control", "max-age=3600")
            .body(Vec::new()),
    );
    let dir = TempDir::new().unwrap();
    let cache = crate::cache::ResponseCache::open(dir.path(), 10_000).unwrap();
    let facade = ClientFacade::builder(Arc::clone(&transport)).cache(cache).build().unwrap();

    let first = facade.new_call(get("http://h/empty")).execute().unwrap();
    let mut body = first.take_body().unwrap();
    let mut bytes = Vec::new();
    body.read_to_end(&mut bytes).unwrap();
    assert!(bytes.is_empty());
    body.close().unwrap();
    assert_eq!(transport.send_count(), 1);

    // second GET must be served from cache: no second response was
    // scripted, so a network attempt here would bump send_count or fail.
    let second = facade.new_call(get("http://h/empty")).execute().unwrap();
    assert_eq!(transport.send_count(), 1, "served from cache, no second network attempt");
    let mut bytes = Vec::new();
    second.take_body().unwrap().read_to_end(&mut bytes).unwrap();
    assert!(bytes.is_empty());
}

/// A `BodyReader` that streams a fixed payload one byte at a time and
/// refuses to hand out any more bytes once its bound connection is
/// cancelled, the way a real socket-backed reader would observe
/// `Connection::is_cancelled()` mid-transfer.
struct CancellableBodyReader {
    connection: Connection,
    remaining: std::collections::VecDeque<u8>,
}

impl Read for CancellableBodyReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.connection.is_cancelled() {
            return Err(std::io::Error::other(Error::illegal_state(
                "connection cancelled mid-read",
            )));
        }
        match self.remaining.pop_front() {
            Some(byte) => {
                buf[0] = byte;
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

impl BodyReader for CancellableBodyReader {
    fn close(&mut self) -> crate::error::Result<()> {
        Ok(())
    }
}

struct SlowBodyTransport {
    payload: Vec<u8>,
}

impl Transport for SlowBodyTransport {
    fn send(
        &self,
        _request: &Request,
        connection: &Connection,
    ) -> crate::error::Result<(StatusCode, String, HeaderMap, Box<dyn BodyReader>)> {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_LENGTH,
            http::HeaderValue::from_str(&self.payload.len().to_string()).unwrap(),
        );
        let reader = CancellableBodyReader {
            connection: connection.clone(),
            remaining: self.payload.iter().copied().collect(),
        };
        Ok((StatusCode::OK, "OK".to_string(), headers, Box::new(reader)))
    }
}

/// S7 — cancelling a call while its body is still being read fails the
/// next `read()` and a subsequent `execute()` on the same call also
/// fails, with `IllegalState` (not a second `Execution{cancelled}`,
/// since the one-shot flag was already claimed by the first
/// `execute()`). No cache entry is written.
#[test]
fn s7_cancel_during_body_read_poisons_the_stream_and_the_call() {
    let transport = SlowBodyTransport { payload: vec![0xAB; 1024] };
    let dir = TempDir::new().unwrap();
    let cache = crate::cache::ResponseCache::open(dir.path(), 10_000).unwrap();
    let facade = ClientFacade::builder(transport).cache(cache).build().unwrap();

    let call = Arc::new(facade.new_call(get("http://h/big")));
    let response = call.execute().unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.take_body().unwrap();
    let mut first_byte = [0u8; 1];
    body.read_exact(&mut first_byte).unwrap();

    assert!(call.cancel());

    let mut rest = [0u8; 1];
    let err = body.read(&mut rest).unwrap_err();
    assert!(err.get_ref().is_some());

    // closing after a cancelled read must abandon the tee, not commit a
    // partial body to the cache.
    let _ = body.close();

    let second_execute = call.execute();
    assert!(matches!(second_execute, Err(Error::IllegalState(_))));

    assert!(facade.cache().unwrap().lookup(&key("http://h/big")).unwrap().is_none());
}

/// The pooled connection backing a call is observably cancelled by
/// `Call::cancel()` while a read is in flight on it: it is dropped on
/// release rather than returned to the pool Idle.
#[test]
fn cancel_drops_the_bound_connection_instead_of_pooling_it() {
    let transport = SlowBodyTransport { payload: vec![1, 2, 3, 4] };
    let facade = ClientFacade::builder(transport).build().unwrap();
    let call = Arc::new(facade.new_call(get("http://h/p")));
    let response = call.execute().unwrap();
    let mut body = response.take_body().unwrap();
    let mut byte = [0u8; 1];
    body.read_exact(&mut byte).unwrap();

    call.cancel();
    let _ = body.close();
    assert_eq!(facade.pool().size(), 0, "a cancelled connection is dropped, not pooled Idle");
}
