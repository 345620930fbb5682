//! `Transport`: the pluggable TLS/socket boundary named out of scope in
//! §1. Only the narrow capability trait lives in this crate; a
//! `MockTransport` test double exercises the engine/interceptor/call
//! machinery against scripted responses in place of real sockets.

use crate::error::Result;
use crate::pool::Connection;
use crate::request::Request;
use http::{HeaderMap, StatusCode};
use std::io::Read;
use std::sync::Arc;

/// A readable, closeable response body as received from the wire.
pub trait BodyReader: Read + Send {
    fn close(&mut self) -> Result<()>;
}

/// Sends a prepared request over a bound `Connection` and returns the
/// status line, headers, and a readable body stream. Implementations
/// must honor the per-I/O deadline and observe `connection.is_cancelled()`.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: &Request,
        connection: &Connection,
    ) -> Result<(StatusCode, String, HeaderMap, Box<dyn BodyReader>)>;
}

/// An in-memory [`BodyReader`] over a fixed byte buffer, used by
/// [`MockTransport`]. Only built for tests (or with the `test-util`
/// feature) so this mock never lands in a downstream production
/// dependency graph.
#[cfg(any(test, feature = "test-util"))]
pub struct CursorBodyReader {
    cursor: std::io::Cursor<Vec<u8>>,
    closed: bool,
}

#[cfg(any(test, feature = "test-util"))]
impl CursorBodyReader {
    pub fn new(bytes: Vec<u8>) -> Self {
        CursorBodyReader { cursor: std::io::Cursor::new(bytes), closed: false }
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Read for CursorBodyReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

#[cfg(any(test, feature = "test-util"))]
impl BodyReader for CursorBodyReader {
    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// A scripted response returned by [`MockTransport`] for one call.
#[cfg(any(test, feature = "test-util"))]
#[derive(Clone)]
pub struct ScriptedResponse {
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[cfg(any(test, feature = "test-util"))]
impl ScriptedResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        ScriptedResponse {
            status: StatusCode::from_u16(status).unwrap(),
            reason: reason.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(
            http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            http::HeaderValue::from_str(value).unwrap(),
        );
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        let bytes = body.into();
        self.headers.insert(
            http::header::CONTENT_LENGTH,
            http::HeaderValue::from_str(&bytes.len().to_string()).unwrap(),
        );
        self.body = bytes;
        self
    }
}

/// A `Transport` test double that serves pre-scripted responses keyed
/// by URL, in request order per key, and counts how many times `send`
/// was called in total (used by redirect-cap tests, §8 S6).
#[cfg(any(test, feature = "test-util"))]
pub struct MockTransport {
    responses: parking_lot::Mutex<std::collections::HashMap<String, std::collections::VecDeque<ScriptedResponse>>>,
    send_count: std::sync::atomic::AtomicUsize,
}

#[cfg(any(test, feature = "test-util"))]
impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            responses: parking_lot::Mutex::new(std::collections::HashMap::new()),
            send_count: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Queue `response` to be returned the next time `send` is called
    /// for `url`.
    pub fn script(&self, url: &str, response: ScriptedResponse) {
        self.responses.lock().entry(url.to_string()).or_default().push_back(response);
    }

    pub fn send_count(&self) -> usize {
        self.send_count.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Lets a shared handle to a `Transport` (e.g. `Arc<MockTransport>`, kept
/// by a test so it can inspect `send_count()` after handing a clone to
/// `ClientFacade::builder`) be used anywhere a `Transport` is expected.
impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(
        &self,
        request: &Request,
        connection: &Connection,
    ) -> Result<(StatusCode, String, HeaderMap, Box<dyn BodyReader>)> {
        (**self).send(request, connection)
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Transport for MockTransport {
    fn send(
        &self,
        request: &Request,
        _connection: &Connection,
    ) -> Result<(StatusCode, String, HeaderMap, Box<dyn BodyReader>)> {
        self.send_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut url = request.url().clone();
        url.set_fragment(None);
        let key = url.to_string();
        let mut responses = self.responses.lock();
        let queue = responses.get_mut(&key).ok_or_else(|| {
            crate::error::Error::execution(
                format!("no scripted response for {key}"),
                std::io::Error::other("unscripted url"),
            )
        })?;
        let scripted = queue.pop_front().ok_or_else(|| {
            crate::error::Error::execution(
                format!("scripted response queue exhausted for {key}"),
                std::io::Error::other("exhausted"),
            )
        })?;
        Ok((
            scripted.status,
            scripted.reason,
            scripted.headers,
            Box::new(CursorBodyReader::new(scripted.body)),
        ))
    }
}
