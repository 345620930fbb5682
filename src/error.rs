use miette::Diagnostic;
use thiserror::Error;

/// A `Result` typedef to use with the [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// An opaque, thread-safe error used to wrap transport and interceptor
/// causes that don't otherwise have a typed home in [`Error`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The error taxonomy surfaced by every public operation in this crate.
#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    /// A bad URL, unsupported scheme, negative read size, or invalid
    /// builder option. Always raised synchronously at the call site.
    #[error("invalid argument: {0}")]
    #[diagnostic(code(rustic_http::invalid_argument))]
    InvalidArgument(String),

    /// Double `execute()`, read-after-close, double `proceed()`, or a
    /// callback-reentrant `execute()` on the same `Call`.
    #[error("illegal state: {0}")]
    #[diagnostic(code(rustic_http::illegal_state))]
    IllegalState(String),

    /// A per-I/O inactivity deadline was exceeded.
    #[error("timed out waiting on {0}")]
    #[diagnostic(code(rustic_http::timeout))]
    Timeout(String),

    /// A generic transport or cache I/O failure, wrapping a cause where
    /// available. Also used to surface a cancelled `Call` (`cancelled`
    /// is `true` in that case).
    #[error("execution failed: {message}")]
    #[diagnostic(code(rustic_http::execution))]
    Execution {
        /// Human-readable description of the failure.
        message: String,
        /// Whether the owning `Call` had been cancelled.
        cancelled: bool,
        /// The underlying cause, if any.
        #[source]
        cause: Option<BoxError>,
    },

    /// Certificate validation failure: bad CA, expired, hostname
    /// mismatch, or CRL rule violation.
    #[error("tls error: {0}")]
    #[diagnostic(code(rustic_http::tls))]
    Tls(String),

    /// Unrecoverable cache store failure that would otherwise silently
    /// mask a user-visible failure (see the self-healing rules in
    /// `cache::metadata_store`).
    #[error("cache i/o error: {0}")]
    #[diagnostic(code(rustic_http::cache_io))]
    CacheIo(#[source] BoxError),

    /// Error from `http`.
    #[error(transparent)]
    #[diagnostic(code(rustic_http::http))]
    Http(#[from] http::Error),

    /// Error parsing an HTTP status code.
    #[error(transparent)]
    #[diagnostic(code(rustic_http::invalid_status_code))]
    InvalidStatusCode(#[from] http::status::InvalidStatusCode),

    /// Error converting a header value to a string.
    #[error(transparent)]
    #[diagnostic(code(rustic_http::header_to_str))]
    HeaderToStr(#[from] http::header::ToStrError),

    /// Error parsing an HTTP method.
    #[error(transparent)]
    #[diagnostic(code(rustic_http::invalid_method))]
    InvalidMethod(#[from] http::method::InvalidMethod),

    /// Error parsing a URI.
    #[error(transparent)]
    #[diagnostic(code(rustic_http::invalid_uri))]
    InvalidUri(#[from] http::uri::InvalidUri),

    /// Error parsing a URL.
    #[error(transparent)]
    #[diagnostic(code(rustic_http::invalid_url))]
    InvalidUrl(#[from] url::ParseError),

    /// Error parsing a header value.
    #[error(transparent)]
    #[diagnostic(code(rustic_http::invalid_header_value))]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Error parsing a header name.
    #[error(transparent)]
    #[diagnostic(code(rustic_http::invalid_header_name))]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Error from the metadata store's SQLite backend.
    #[error(transparent)]
    #[diagnostic(code(rustic_http::sqlite))]
    Sqlite(#[from] rusqlite::Error),

    /// Error (de)serializing the metadata header map.
    #[error(transparent)]
    #[diagnostic(code(rustic_http::serde_json))]
    SerdeJson(#[from] serde_json::Error),

    /// Plain I/O error from the body store or temp-file tee.
    #[error(transparent)]
    #[diagnostic(code(rustic_http::io))]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an `Execution` error from an arbitrary cause.
    pub fn execution(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Error::Execution { message: message.into(), cancelled: false, cause: Some(cause.into()) }
    }

    /// Build the `Execution` error a cancelled `Call` surfaces.
    pub fn cancelled() -> Self {
        Error::Execution {
            message: "call was cancelled".to_string(),
            cancelled: true,
            cause: None,
        }
    }

    /// Shorthand for `Error::IllegalState`.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::IllegalState(message.into())
    }

    /// Shorthand for `Error::InvalidArgument`.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// True when this error represents a cancelled call.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Execution { cancelled: true, .. })
    }
}
