//! `ResponseCache`: composes [`metadata_store`], [`body_store`], and
//! [`lru`] into the single component the engine consults for `lookup`
//! and `put`. Owns the cacheability rules (§4.1 rule 1-4), the
//! single-writer-per-key discipline, and the self-healing recovery path.

pub mod body_store;
pub mod lru;
pub mod metadata_store;

use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use body_store::CacheBodyStore;
use http::Method;
use lru::LruStrategy;
use metadata_store::{looks_like_corruption, CacheMetadataStore, MetadataRecord};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Status codes eligible for storage per §4.1 rule 4 (2xx with an
/// explicit validator are handled separately in [`is_cacheable`]).
const CACHEABLE_STATUSES: &[u16] =
    &[200, 203, 204, 300, 301, 302, 307, 308, 404, 405, 410, 414, 501];

pub(crate) fn now_epoch() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// A cache hit: the stored metadata plus a handle to open its body.
pub struct CacheEntry {
    pub metadata: MetadataRecord,
}

/// Decide whether a response is eligible for storage, per §4.1 rules
/// 1-4. Takes the request method, response status, whether
/// `Content-Length` is known (or the body was fully buffered with a
/// known size), and the response's `Cache-Control` directives.
pub fn is_cacheable(
    method: &Method,
    status: u16,
    known_length: bool,
    no_store: bool,
    has_explicit_validator: bool,
) -> bool {
    if method != Method::GET {
        return false;
    }
    if !known_length {
        return false;
    }
    if no_store {
        return false;
    }
    if status == 304 {
        // Never stored directly; merged into the existing entry instead.
        return false;
    }
    if CACHEABLE_STATUSES.contains(&status) {
        return true;
    }
    (200..300).contains(&status) && has_explicit_validator
}

/// Whether a response header map carries an explicit validator (`ETag`
/// or `Last-Modified`), per §4.1 rule 4's 2xx carve-out and §4.2's
/// decision to build a conditional request for a stale entry.
pub fn has_explicit_validator(headers: &http::HeaderMap) -> bool {
    headers.contains_key(http::header::ETAG) || headers.contains_key(http::header::LAST_MODIFIED)
}

/// Methods whose successful (2xx) response invalidates the target key,
/// per §4.1 / testable property 7 and the PATCH-like-POST open-question
/// decision in DESIGN.md.
pub fn invalidates_on_success(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::DELETE | Method::PATCH)
}

/// The durable, LRU-bounded response cache.
pub struct ResponseCache {
    root: PathBuf,
    metadata: Mutex<CacheMetadataStore>,
    bodies: CacheBodyStore,
    lru: Mutex<LruStrategy>,
    /// Per-key write generation, incremented on every `put`'s temp-file
    /// staging so a superseded in-progress tee knows to abandon itself
    /// on commit (single-writer-per-key, §4.1).
    write_generation: Mutex<HashMap<String, u64>>,
}

impl ResponseCache {
    /// Open (or create) a cache rooted at `root`, with an LRU byte
    /// budget of `max_bytes`.
    pub fn open(root: impl AsRef<Path>, max_bytes: u64) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let metadata_store = Self::open_metadata(&root)?;
        let bodies = CacheBodyStore::open(&root)?;

        let mut lru = LruStrategy::new(max_bytes);
        match metadata_store.enumerate() {
            Ok(rows) => lru.rebuild(
                rows.iter().map(|r| {
                    (r.key.as_str(), r.body_size, r.last_accessed_at_epoch, r.created_at_epoch)
                }),
            ),
            Err(_) => {
                // Self-heal: enumerate failing after a successful open
                // still indicates corruption (§4.1).
                metadata_store.recreate()?;
                bodies.remove_all()?;
            }
        }

        Ok(ResponseCache {
            root,
            metadata: Mutex::new(metadata_store),
            bodies,
            lru: Mutex::new(lru),
            write_generation: Mutex::new(HashMap::new()),
        })
    }

    fn open_metadata(root: &Path) -> Result<CacheMetadataStore> {
        CacheMetadataStore::open(root.join("cache_metadata.db"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Look up `request`'s fingerprint. Touches LRU/last-accessed on a
    /// hit. Returns `Ok(None)` for a miss; only unreadable underlying
    /// storage is an error (`CacheIo`).
    pub fn lookup(&self, key: &str) -> Result<Option<CacheEntry>> {
        let record = match self.get_record_self_healing(key)? {
            Some(r) => r,
            None => return Ok(None),
        };

        if !self.bodies.exists(key) {
            // Open Question 3 (DESIGN.md): a row with no body file is a
            // hard CacheIo failure, not a miss.
            return Err(Error::CacheIo(
                format!("metadata present for key {key} but body file is missing").into(),
            ));
        }

        let now = now_epoch();
        self.metadata.lock().touch_last_accessed(key, now)?;
        self.lru.lock().touch(key, now);

        Ok(Some(CacheEntry { metadata: record }))
    }

    /// Open a reader for a looked-up entry's body.
    pub fn open_body(&self, key: &str) -> Result<Option<std::fs::File>> {
        self.bodies.open_reader(key)
    }

    fn get_record_self_healing(&self, key: &str) -> Result<Option<MetadataRecord>> {
        let attempt = { self.metadata.lock().get(key) };
        match attempt {
            Ok(record) => Ok(record),
            Err(e) if looks_like_corruption(&e) => {
                log::warn!("cache metadata store looks corrupted, recreating: {e}");
                {
                    let metadata = self.metadata.lock();
                    metadata.recreate()?;
                }
                self.bodies.remove_all()?;
                self.lru.lock().clear();
                Ok(None)
            }
            Err(e) => Err(Error::CacheIo(Box::new(e))),
        }
    }

    /// Begin a write for `key`: allocates a temp-file tee and bumps the
    /// key's write generation so a prior in-flight tee for the same key
    /// knows (via `is_current_writer`) that it has been superseded.
    pub fn begin_put(&self, key: &str) -> Result<(tempfile::NamedTempFile, u64)> {
        let tee = self.bodies.create_tee()?;
        let mut generations = self.write_generation.lock();
        let generation = generations.entry(key.to_string()).or_insert(0);
        *generation += 1;
        Ok((tee, *generation))
    }

    /// Whether `generation` is still the most recent write attempt for
    /// `key`, i.e. no later `put` has superseded it.
    pub fn is_current_writer(&self, key: &str, generation: u64) -> bool {
        self.write_generation.lock().get(key).copied() == Some(generation)
    }

    /// Commit a tee to the body store and upsert metadata atomically
    /// with respect to readers (the rename in `commit` is the atomic
    /// step readers observe). Called only when the write is still
    /// current (see `is_current_writer`) and the body tee reported
    /// `TeeOutcome::Commit`.
    pub fn commit_put(
        &self,
        key: &str,
        temp: tempfile::NamedTempFile,
        mut record: MetadataRecord,
    ) -> Result<()> {
        let bytes = self.bodies.commit(key, temp)?;
        record.body_size = bytes;
        record.key = key.to_string();
        self.metadata.lock().upsert(&record)?;
        let evicted = self.lru.lock().insert(key, bytes, now_epoch());
        for evicted_key in evicted {
            self.evict_key(&evicted_key)?;
        }
        Ok(())
    }

    /// Overwrite a key's metadata row in place, without touching its
    /// committed body file. Used by the engine's conditional-merge path
    /// (§4.2/§4.6): a 304 updates stored headers and timestamps but never
    /// rewrites the body.
    pub fn update_metadata(&self, record: &MetadataRecord) -> Result<()> {
        self.metadata.lock().upsert(record)
    }

    fn evict_key(&self, key: &str) -> Result<()> {
        log::debug!("evicting cache key {key}");
        self.metadata.lock().delete(key)?;
        self.bodies.remove(key)
    }

    /// Remove `key` from the cache. Idempotent.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.metadata.lock().delete(key)?;
        self.bodies.remove(key)?;
        self.lru.lock().remove(key);
        Ok(())
    }

    /// Truncate metadata, unlink all body files, reset LRU.
    pub fn evict_all(&self) -> Result<()> {
        self.metadata.lock().truncate()?;
        self.bodies.remove_all()?;
        self.lru.lock().clear();
        Ok(())
    }

    /// Current committed total body bytes.
    pub fn size(&self) -> u64 {
        self.lru.lock().current_bytes()
    }
}

/// Build a [`MetadataRecord`] from a request/response pair and header
/// map, ready for [`ResponseCache::commit_put`].
pub fn record_from_response(
    key: &str,
    request: &Request,
    response: &Response,
    sent_epoch: i64,
    received_epoch: i64,
) -> MetadataRecord {
    let now = now_epoch();
    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }
    MetadataRecord {
        key: key.to_string(),
        url: request.url().to_string(),
        method: request.method().to_string(),
        status: response.status().as_u16(),
        reason: response.reason().to_string(),
        headers,
        body_size: 0,
        sent_request_at_epoch: sent_epoch,
        received_response_at_epoch: received_epoch,
        created_at_epoch: now,
        last_accessed_at_epoch: now,
    }
}
