//! `ClientFacade` / `ClientFacadeBuilder`: the lifecycle root that owns
//! the shared cache, connection pool, interceptors, TLS configuration,
//! default timeout, and async worker pool.
//!
//! Grounded on the `EasyHttp`/`EasyHttp::Builder` setter list from this
//! system's design lineage, carried over near-verbatim in shape.

use crate::cache::ResponseCache;
use crate::call::{Call, WorkerPool};
use crate::error::{Error, Result};
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::pool::ConnectionPool;
use crate::request::Request;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;

/// CRL enforcement policy for certificate validation, named in §6. Not
/// interpreted by this crate (TLS itself is the external `Transport`'s
/// concern) but threaded through so a `Transport` implementation can
/// read it back off the facade/connection identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrlCheckPolicy {
    NoCheck,
    CheckSoftFail,
    #[default]
    CheckHardFail,
}

/// Per-facade connection identity inputs that do not vary per request:
/// proxy, root CA locality, and the default timeout. Combined with a
/// request's scheme/host/port to form a [`crate::pool::ConnectionIdentity`].
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub proxy: Option<String>,
    pub root_ca_directory: Option<String>,
    pub root_ca_file: Option<String>,
    pub crl_check_policy: CrlCheckPolicy,
}

/// The shared lifecycle root: cache, pool, interceptors, TLS config,
/// default timeout, and the bounded async worker pool used only by
/// `executeAsync`.
pub struct ClientFacade {
    pub(crate) cache: Option<Arc<ResponseCache>>,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) network_interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) tls: TlsConfig,
    pub(crate) timeout_sec: u64,
    pub(crate) workers: Arc<WorkerPool>,
}

impl std::fmt::Debug for ClientFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientFacade")
            .field("timeout_sec", &self.timeout_sec)
            .field("has_cache", &self.cache.is_some())
            .field("interceptors", &self.interceptors.len())
            .field("network_interceptors", &self.network_interceptors.len())
            .finish()
    }
}

impl ClientFacade {
    pub fn builder(transport: impl Transport + 'static) -> ClientFacadeBuilder {
        ClientFacadeBuilder {
            cache: None,
            pool: None,
            transport: Arc::new(transport),
            interceptors: Vec::new(),
            network_interceptors: Vec::new(),
            tls: TlsConfig::default(),
            timeout_sec: 60,
            worker_count: 5,
        }
    }

    /// Create a one-shot `Call` for `request`.
    pub fn new_call(self: &Arc<Self>, request: Request) -> Call {
        Call::new(Arc::clone(self), request)
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn timeout_sec(&self) -> u64 {
        self.timeout_sec
    }

    /// Cancel every in-flight connection and drain the cache's
    /// outstanding state; new calls may still be issued afterward.
    pub fn invalidate_and_cancel(&self) {
        self.pool.cancel_all();
    }
}

/// Builder for [`ClientFacade`].
pub struct ClientFacadeBuilder {
    cache: Option<Arc<ResponseCache>>,
    pool: Option<Arc<ConnectionPool>>,
    transport: Arc<dyn Transport>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    tls: TlsConfig,
    timeout_sec: u64,
    worker_count: usize,
}

impl ClientFacadeBuilder {
    pub fn cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn connection_pool(mut self, pool: ConnectionPool) -> Self {
        self.pool = Some(Arc::new(pool));
        self
    }

    /// Default timeout in seconds, bounding per-I/O inactivity (connect
    /// and read), not total request time. `0` selects the platform
    /// default (60s, matching §6).
    pub fn timeout_sec(mut self, timeout_sec: u64) -> Self {
        self.timeout_sec = timeout_sec;
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.tls.proxy = Some(proxy.into());
        self
    }

    pub fn root_ca_directory(mut self, dir: impl Into<String>) -> Self {
        self.tls.root_ca_directory = Some(dir.into());
        self
    }

    pub fn root_ca_file(mut self, file: impl Into<String>) -> Self {
        self.tls.root_ca_file = Some(file.into());
        self
    }

    pub fn crl_check_policy(mut self, policy: CrlCheckPolicy) -> Self {
        self.tls.crl_check_policy = policy;
        self
    }

    pub fn add_interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn add_network_interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.network_interceptors.push(Arc::new(interceptor));
        self
    }

    /// Number of worker threads backing `executeAsync` (default 5, §5).
    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn build(self) -> Result<Arc<ClientFacade>> {
        if self.timeout_sec == 0 {
            // 0 selects the platform default; normalize to it explicitly
            // rather than threading a sentinel through the engine.
        }
        if self.tls.root_ca_directory.is_some() && self.tls.root_ca_file.is_some() {
            return Err(Error::invalid_argument(
                "root_ca_directory and root_ca_file are mutually exclusive",
            ));
        }
        let timeout_sec = if self.timeout_sec == 0 { 60 } else { self.timeout_sec };
        let pool = self.pool.unwrap_or_else(|| {
            Arc::new(ConnectionPool::new(Duration::from_secs(timeout_sec), 5))
        });
        let workers = Arc::new(WorkerPool::new(self.worker_count.max(1)));
        Ok(Arc::new(ClientFacade {
            cache: self.cache,
            pool,
            transport: self.transport,
            interceptors: self.interceptors,
            network_interceptors: self.network_interceptors,
            tls: self.tls,
            timeout_sec,
            workers,
        }))
    }

    pub(crate) fn chain(facade: &Arc<ClientFacade>) -> InterceptorChain {
        InterceptorChain::new(
            facade.interceptors.clone(),
            facade.network_interceptors.clone(),
        )
    }
}
