//! Cache key derivation.
//!
//! A fingerprint is a deterministic digest of a request's method and URL
//! (query included, fragment excluded) used to index the response cache.
//! Only GET-family requests are eligible for storage; see `cache::mod`.

use sha2::{Digest, Sha256};
use url::Url;

/// Compute the fingerprint for a `method` + `url` pair.
///
/// The fragment is stripped before hashing since it is never sent to the
/// origin and carries no caching significance.
pub fn fingerprint(method: &http::Method, url: &Url) -> String {
    let mut without_fragment = url.clone();
    without_fragment.set_fragment(None);
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(without_fragment.as_str().as_bytes());
    hex::encode(hasher.finalize())
}
