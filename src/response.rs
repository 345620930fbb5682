//! The immutable `Response` value and its redirect/validation DAG.

use crate::body::ResponseBodyStream;
use crate::request::Request;
use http::{HeaderMap, StatusCode};
use std::sync::Arc;
use std::time::SystemTime;

/// An immutable HTTP response.
///
/// `priorResponse`, `networkResponse`, and `cacheResponse` form a DAG of
/// back-pointers (never cycles): `priorResponse` links to the response
/// that caused this one (a redirect source or a 304 conditional source),
/// while `networkResponse`/`cacheResponse` record, body-stripped, what was
/// actually received from the wire and from the cache respectively when
/// this response is the product of a conditional merge (see
/// `engine::merge_conditional`).
#[derive(Clone)]
pub struct Response {
    pub(crate) request: Request,
    pub(crate) status: StatusCode,
    pub(crate) reason: String,
    pub(crate) protocol: &'static str,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<Arc<parking_lot::Mutex<Option<ResponseBodyStream>>>>,
    pub(crate) network_response: Option<Box<Response>>,
    pub(crate) cache_response: Option<Box<Response>>,
    pub(crate) prior_response: Option<Box<Response>>,
    pub(crate) sent_at: SystemTime,
    pub(crate) received_at: SystemTime,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("url", &self.request.url())
            .field("has_network_response", &self.network_response.is_some())
            .field("has_cache_response", &self.cache_response.is_some())
            .field("has_prior_response", &self.prior_response.is_some())
            .finish()
    }
}

impl Response {
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn network_response(&self) -> Option<&Response> {
        self.network_response.as_deref()
    }

    pub fn cache_response(&self) -> Option<&Response> {
        self.cache_response.as_deref()
    }

    pub fn prior_response(&self) -> Option<&Response> {
        self.prior_response.as_deref()
    }

    pub fn sent_at(&self) -> SystemTime {
        self.sent_at
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    /// Take the body stream, leaving `None` behind. Calling this twice
    /// returns `None` the second time -- a body is single-consumer.
    pub fn take_body(&self) -> Option<ResponseBodyStream> {
        self.body.as_ref().and_then(|b| b.lock().take())
    }

    /// A body-stripped copy of this response, used to populate
    /// `networkResponse`/`cacheResponse`/`priorResponse` links without
    /// retaining a second owner of the (single-consumer) body stream.
    pub(crate) fn stripped(&self) -> Response {
        Response {
            request: self.request.clone(),
            status: self.status,
            reason: self.reason.clone(),
            protocol: self.protocol,
            headers: self.headers.clone(),
            body: None,
            network_response: None,
            cache_response: None,
            prior_response: None,
            sent_at: self.sent_at,
            received_at: self.received_at,
        }
    }
}

/// Builder for [`Response`], used by the engine's terminal states.
pub struct ResponseBuilder {
    request: Request,
    status: StatusCode,
    reason: String,
    headers: HeaderMap,
    body: Option<ResponseBodyStream>,
    network_response: Option<Response>,
    cache_response: Option<Response>,
    prior_response: Option<Response>,
    sent_at: SystemTime,
    received_at: SystemTime,
}

impl ResponseBuilder {
    pub fn new(request: Request, status: StatusCode, reason: impl Into<String>) -> Self {
        let now = SystemTime::now();
        ResponseBuilder {
            request,
            status,
            reason: reason.into(),
            headers: HeaderMap::new(),
            body: None,
            network_response: None,
            cache_response: None,
            prior_response: None,
            sent_at: now,
            received_at: now,
        }
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: ResponseBodyStream) -> Self {
        self.body = Some(body);
        self
    }

    pub fn network_response(mut self, response: Response) -> Self {
        self.network_response = Some(response.stripped());
        self
    }

    pub fn cache_response(mut self, response: Response) -> Self {
        self.cache_response = Some(response.stripped());
        self
    }

    pub fn prior_response(mut self, response: Response) -> Self {
        self.prior_response = Some(response.stripped());
        self
    }

    pub fn timestamps(mut self, sent_at: SystemTime, received_at: SystemTime) -> Self {
        self.sent_at = sent_at;
        self.received_at = received_at;
        self
    }

    pub fn build(self) -> Response {
        Response {
            request: self.request,
            status: self.status,
            reason: self.reason,
            protocol: "HTTP/1.1",
            headers: self.headers,
            body: self.body.map(|b| Arc::new(parking_lot::Mutex::new(Some(b)))),
            network_response: self.network_response.map(Box::new),
            cache_response: self.cache_response.map(Box::new),
            prior_response: self.prior_response.map(Box::new),
            sent_at: self.sent_at,
            received_at: self.received_at,
        }
    }
}
