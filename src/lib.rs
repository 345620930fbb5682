#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
//! A general-purpose HTTP/1.1 client core: a multi-level RFC 7234
//! response cache backed by SQLite metadata and content-addressed body
//! files, a connection pool keyed by endpoint/TLS/proxy identity, a
//! composable application/network interceptor chain, and synchronous or
//! worker-pool-backed asynchronous execution.
//!
//! The pluggable socket/TLS boundary itself (the [`transport::Transport`]
//! trait) is this crate's only integration seam; callers supply a real
//! implementation, or use [`transport::MockTransport`] (behind the
//! `test-util` feature, or automatically under `cfg(test)`) in tests.
//!
//! ```no_run
//! use rustic_http::{ClientFacade, Request};
//! use rustic_http::cache::ResponseCache;
//! # use rustic_http::transport::MockTransport;
//! use std::io::Read;
//! use url::Url;
//!
//! # fn main() -> rustic_http::Result<()> {
//! let cache = ResponseCache::open("./http-cache", 64 * 1024 * 1024)?;
//! let facade = ClientFacade::builder(MockTransport::new())
//!     .cache(cache)
//!     .timeout_sec(30)
//!     .build()?;
//!
//! let request = Request::builder(http::Method::GET, Url::parse("http://example.com/")?).build();
//! let call = facade.new_call(request);
//! let response = call.execute()?;
//! let mut body = response.take_body().unwrap();
//! let mut bytes = Vec::new();
//! body.read_to_end(&mut bytes).ok();
//! body.close()?;
//! # Ok(())
//! # }
//! ```

pub mod body;
pub mod cache;
pub mod call;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod interceptor;
pub mod pool;
pub mod request;
pub mod response;
pub mod transport;

#[cfg(test)]
mod test;

pub use body::{CacheReadBodyReader, CachingBodyReader, CloseOutcome, NetworkBodyReader, ResponseBodyStream, TeeOutcome};
pub use cache::{CacheEntry, ResponseCache};
pub use call::{Call, Callback, WorkerPool};
pub use config::{ClientFacade, ClientFacadeBuilder, CrlCheckPolicy, TlsConfig};
pub use engine::HttpEngine;
pub use error::{BoxError, Error, Result};
pub use interceptor::{Chain, Interceptor, InterceptorChain};
pub use pool::{Connection, ConnectionIdentity, ConnectionPool, ConnectionState};
pub use request::{CacheControl, Request, RequestBody, RequestBuilder};
pub use response::{Response, ResponseBuilder};
pub use transport::{BodyReader, Transport};
#[cfg(any(test, feature = "test-util"))]
pub use transport::{CursorBodyReader, MockTransport, ScriptedResponse};
