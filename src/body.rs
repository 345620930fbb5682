//! `ResponseBodyStream`: a single-consumer, one-shot byte stream.
//!
//! Two variants exist at the Connection/ResponseCache boundary: the
//! **caching** variant tees network bytes into the cache's temp file as
//! they're read, and the **cache-read** variant serves bytes straight out
//! of the body store. Both implement [`std::io::Read`] so callers can use
//! ordinary `Read` combinators; `close()` and `is_eof()` carry the
//! cache-commit and connection-release semantics `Read` alone can't express.

use crate::error::{Error, Result};
use std::io::Read;
use std::time::{Duration, Instant};

/// How long a caching body stream will try to drain remaining network
/// bytes on an early `close()` before giving up on the connection.
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// The outcome of closing a caching body stream, consumed exactly once by
/// `ResponseCache::put`'s tee-commit logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeeOutcome {
    /// The body was fully read (or successfully drained) and the temp file
    /// tee should be committed to the body store.
    Commit {
        /// Total bytes written to the tee.
        bytes: u64,
    },
    /// The tee should be discarded: a write failure occurred, the caller
    /// closed before EOF and draining timed out, or the stream was
    /// cancelled mid-read.
    Abandon,
}

/// A single-consumer response body stream.
///
/// After [`close`](ResponseBodyStream::close), every operation except
/// `close` itself fails with [`Error::IllegalState`]. After EOF, further
/// reads return `Ok(0)` (the idiomatic `std::io::Read` EOF sentinel,
/// standing in for the read-after-eof `-1` convention of the C-style
/// stream this design descends from).
pub enum ResponseBodyStream {
    /// Bytes are being tee'd into the cache's temp file as they're read
    /// from the network.
    Caching(CachingBodyReader),
    /// Bytes come from the cache body store; closing releases no network
    /// resources.
    CacheRead(CacheReadBodyReader),
    /// Bytes come straight from the network with no cache tee, for
    /// responses the engine determined are not cacheable.
    Network(NetworkBodyReader),
}

impl ResponseBodyStream {
    pub fn is_eof(&self) -> bool {
        match self {
            ResponseBodyStream::Caching(r) => r.eof,
            ResponseBodyStream::CacheRead(r) => r.eof,
            ResponseBodyStream::Network(r) => r.eof,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            ResponseBodyStream::Caching(r) => r.closed,
            ResponseBodyStream::CacheRead(r) => r.closed,
            ResponseBodyStream::Network(r) => r.closed,
        }
    }

    /// Close the stream. Idempotent. For the caching variant, attempts to
    /// drain any remaining bytes (bounded by [`DRAIN_TIMEOUT`]) so the
    /// connection can be returned to the pool; if draining fails to reach
    /// EOF in time, the connection must be terminated by the caller (the
    /// engine), which is signalled via the returned tee outcome being
    /// `Abandon` together with `drained` being `false`.
    pub fn close(&mut self) -> Result<CloseOutcome> {
        match self {
            ResponseBodyStream::Caching(r) => Ok(r.close()),
            ResponseBodyStream::CacheRead(r) => {
                r.closed = true;
                Ok(CloseOutcome { tee: None, drained: true })
            }
            ResponseBodyStream::Network(r) => {
                r.closed = true;
                if let Some(on_close) = r.on_close.take() {
                    on_close(r.eof);
                }
                Ok(CloseOutcome { tee: None, drained: r.eof })
            }
        }
    }
}

impl Read for ResponseBodyStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ResponseBodyStream::Caching(r) => r.read(buf),
            ResponseBodyStream::CacheRead(r) => r.read(buf),
            ResponseBodyStream::Network(r) => r.read(buf),
        }
    }
}

/// Body stream for a network response the engine decided not to cache.
pub struct NetworkBodyReader {
    inner: Box<dyn Read + Send>,
    eof: bool,
    closed: bool,
    /// Invoked exactly once from `close()`, with whether the stream had
    /// reached EOF, so the engine can release or terminate the bound
    /// connection without `body::ResponseBodyStream` knowing about `pool`.
    on_close: Option<Box<dyn FnOnce(bool) + Send>>,
}

impl NetworkBodyReader {
    pub fn new(inner: Box<dyn Read + Send>) -> Self {
        NetworkBodyReader { inner, eof: false, closed: false, on_close: None }
    }

    pub fn with_on_close(mut self, on_close: impl FnOnce(bool) + Send + 'static) -> Self {
        self.on_close = Some(Box::new(on_close));
        self
    }
}

impl Read for NetworkBodyReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other(Error::illegal_state("read after close")));
        }
        if self.eof {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }
}

/// Result of closing a [`ResponseBodyStream`].
#[derive(Debug)]
pub struct CloseOutcome {
    /// `Some` only for the caching variant.
    pub tee: Option<TeeOutcome>,
    /// Whether the stream reached EOF (directly or via drain) before the
    /// connection would need to be terminated.
    pub drained: bool,
}

/// Body stream for a response currently being received from the network
/// and simultaneously tee'd into the cache's temp file.
pub struct CachingBodyReader {
    inner: Box<dyn Read + Send>,
    tee: Option<tempfile::NamedTempFile>,
    written: u64,
    write_failed: bool,
    eof: bool,
    closed: bool,
    /// Invoked exactly once, from `close()`, only when the tee outcome is
    /// `Commit`: hands the committed temp file and its byte count to the
    /// cache so it can be persisted under the response's key. Left unset
    /// by tests that only care about the tee itself.
    on_commit: Option<Box<dyn FnOnce(tempfile::NamedTempFile, u64) + Send>>,
    /// Invoked exactly once from `close()`, with whether the stream
    /// drained to EOF, so the engine can release or terminate the bound
    /// connection.
    on_close: Option<Box<dyn FnOnce(bool) + Send>>,
}

impl CachingBodyReader {
    pub fn new(inner: Box<dyn Read + Send>, tee: tempfile::NamedTempFile) -> Self {
        CachingBodyReader {
            inner,
            tee: Some(tee),
            written: 0,
            write_failed: false,
            eof: false,
            closed: false,
            on_commit: None,
            on_close: None,
        }
    }

    /// Attach the cache-commit callback invoked on a successful close.
    pub fn with_on_commit(
        mut self,
        on_commit: impl FnOnce(tempfile::NamedTempFile, u64) + Send + 'static,
    ) -> Self {
        self.on_commit = Some(Box::new(on_commit));
        self
    }

    /// Attach the connection release/terminate callback invoked on close.
    pub fn with_on_close(mut self, on_close: impl FnOnce(bool) + Send + 'static) -> Self {
        self.on_close = Some(Box::new(on_close));
        self
    }

    /// Path of the in-progress temp file, for tests and for the cache's
    /// commit step.
    pub fn temp_path(&self) -> Option<&std::path::Path> {
        self.tee.as_ref().map(|f| f.path())
    }

    fn tee_write(&mut self, data: &[u8]) {
        if self.write_failed {
            return;
        }
        if let Some(tee) = self.tee.as_mut() {
            use std::io::Write;
            if tee.write_all(data).is_err() {
                self.write_failed = true;
                self.tee = None;
            } else {
                self.written += data.len() as u64;
            }
        }
    }

    fn close(&mut self) -> CloseOutcome {
        if self.closed {
            return CloseOutcome {
                tee: Some(if self.write_failed { TeeOutcome::Abandon } else if self.eof { TeeOutcome::Commit { bytes: self.written } } else { TeeOutcome::Abandon }),
                drained: self.eof,
            };
        }
        self.closed = true;

        if !self.eof {
            let deadline = Instant::now() + DRAIN_TIMEOUT;
            let mut scratch = [0u8; 8192];
            while !self.eof && Instant::now() < deadline {
                match self.inner.read(&mut scratch) {
                    Ok(0) => self.eof = true,
                    Ok(n) => self.tee_write(&scratch[..n]),
                    Err(_) => {
                        self.write_failed = true;
                        break;
                    }
                }
            }
        }

        let drained = self.eof;
        let tee = if self.write_failed || !drained {
            TeeOutcome::Abandon
        } else {
            TeeOutcome::Commit { bytes: self.written }
        };
        if let TeeOutcome::Commit { bytes } = tee {
            if let (Some(temp), Some(on_commit)) = (self.tee.take(), self.on_commit.take()) {
                on_commit(temp, bytes);
            }
        }
        if let Some(on_close) = self.on_close.take() {
            on_close(drained);
        }
        CloseOutcome { tee: Some(tee), drained }
    }
}

impl Read for CachingBodyReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other(Error::illegal_state("read after close")));
        }
        if self.eof {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.eof = true;
        } else {
            self.tee_write(&buf[..n]);
        }
        Ok(n)
    }
}

/// Body stream serving bytes straight from the cache's body store.
pub struct CacheReadBodyReader {
    inner: std::fs::File,
    eof: bool,
    closed: bool,
}

impl CacheReadBodyReader {
    pub fn new(inner: std::fs::File) -> Self {
        CacheReadBodyReader { inner, eof: false, closed: false }
    }
}

impl Read for CacheReadBodyReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other(Error::illegal_state("read after close")));
        }
        if self.eof {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn caching_reader_tees_bytes_and_commits_on_full_read() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let temp_path = temp.path().to_path_buf();
        let mut reader =
            CachingBodyReader::new(Box::new(Cursor::new(b"response data 1".to_vec())), temp);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"response data 1");

        let outcome = reader.close();
        assert!(outcome.drained);
        assert_eq!(outcome.tee, Some(TeeOutcome::Commit { bytes: 15 }));

        let teed = std::fs::read(&temp_path).unwrap();
        assert_eq!(teed, b"response data 1");
    }

    #[test]
    fn read_after_close_is_illegal_state() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let mut reader = CachingBodyReader::new(Box::new(Cursor::new(Vec::new())), temp);
        let _ = reader.close();
        let mut buf = [0u8; 8];
        assert!(reader.read(&mut buf).is_err());
    }

    #[test]
    fn cache_read_reports_eof_after_full_read() {
        let mut temp = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        temp.write_all(b"cached").unwrap();
        let file = std::fs::File::open(temp.path()).unwrap();
        let mut reader = CacheReadBodyReader::new(file);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"cached");
        assert!(reader.eof);
    }
}
