//! `ConnectionPool` and `Connection`: reusable connection handles keyed
//! by endpoint+TLS+proxy identity, idle keep-alive expiry, and
//! cooperative cancellation.
//!
//! Grounded on `ConnectionInternal.cpp`'s `setInuseIfReusable` identity
//! match and idempotent `m_cancelled` flag from this system's design
//! lineage -- the teacher crate has no connection-pool equivalent of its
//! own (it caches responses for a client it doesn't own).

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The identity tuple a `Connection` is keyed and matched by. Two
/// requests needing the same tuple may share a connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub proxy: Option<String>,
    pub root_ca_dir: Option<String>,
    pub root_ca_file: Option<String>,
    pub timeout_sec: u64,
}

/// A `Connection`'s lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    InUse,
    Idle,
    Cancelled,
}

struct ConnectionInner {
    identity: ConnectionIdentity,
    state: ConnectionState,
    idle_since: Option<Instant>,
}

/// A mutable handle wrapping one underlying transport session.
///
/// Invariants (§3): only one `HttpEngine` owns a `Connection` in state
/// `InUse`; idle connections sit in the pool subject to the idle
/// timeout; `Cancelled` is terminal.
#[derive(Clone)]
pub struct Connection {
    id: u64,
    inner: Arc<Mutex<ConnectionInner>>,
    cancelled: Arc<AtomicBool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &inner.identity.host)
            .field("state", &inner.state)
            .finish()
    }
}

impl Connection {
    fn new(id: u64, identity: ConnectionIdentity) -> Self {
        Connection {
            id,
            inner: Arc::new(Mutex::new(ConnectionInner {
                identity,
                state: ConnectionState::InUse,
                idle_since: None,
            })),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn identity(&self) -> ConnectionIdentity {
        self.inner.lock().identity.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Cancel this connection. Idempotent: returns `true` whether or not
    /// it was already cancelled. Transitions the state to `Cancelled`
    /// and sets the flag the bound `Transport` observes to interrupt
    /// blocking I/O.
    pub fn cancel(&self) -> bool {
        self.cancelled.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::Cancelled;
        log::debug!("cancelled connection {}", self.id);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn set_idle(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::InUse {
            inner.state = ConnectionState::Idle;
            inner.idle_since = Some(Instant::now());
        }
    }

    fn set_in_use(&self) {
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::InUse;
        inner.idle_since = None;
    }

    fn is_idle_expired(&self, keep_alive: Duration) -> bool {
        let inner = self.inner.lock();
        inner.state == ConnectionState::Idle
            && inner.idle_since.map(|since| since.elapsed() >= keep_alive).unwrap_or(false)
    }
}

/// Set of `Connection`s, thread-safe, scanning/updating only while
/// holding its single mutex (network I/O never occurs under the lock).
pub struct ConnectionPool {
    keep_alive: Duration,
    max_idle: usize,
    connections: Mutex<Vec<Connection>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl ConnectionPool {
    pub fn new(keep_alive: Duration, max_idle: usize) -> Self {
        ConnectionPool {
            keep_alive,
            max_idle,
            connections: Mutex::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Acquire a connection matching `identity`: reuse an `Idle` one
    /// whose identity tuple equals `identity` if present, otherwise
    /// hand back a freshly-created one already marked `InUse`.
    pub fn acquire(&self, identity: &ConnectionIdentity) -> Connection {
        self.sweep_expired();
        let mut connections = self.connections.lock();
        if let Some(conn) = connections
            .iter()
            .find(|c| c.state() == ConnectionState::Idle && &c.identity() == identity)
        {
            log::trace!("reusing idle connection to {}", identity.host);
            conn.set_in_use();
            return conn.clone();
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let conn = Connection::new(id, identity.clone());
        connections.push(conn.clone());
        log::trace!("created new connection {id} to {}", identity.host);
        conn
    }

    /// Release `connection` back to the pool: `Idle` (starting the
    /// keep-alive timer) unless it is `Cancelled`, in which case it is
    /// dropped from the pool entirely.
    pub fn release(&self, connection: &Connection) {
        if connection.is_cancelled() {
            self.remove(connection);
            return;
        }
        connection.set_idle();
        log::debug!("released connection {} to idle", connection.id());
        self.enforce_idle_ceiling();
    }

    fn remove(&self, connection: &Connection) {
        let mut connections = self.connections.lock();
        connections.retain(|c| c.id() != connection.id());
    }

    fn sweep_expired(&self) {
        let mut connections = self.connections.lock();
        let keep_alive = self.keep_alive;
        connections.retain(|c| {
            if c.is_idle_expired(keep_alive) {
                log::debug!("idle connection {} expired", c.id());
                false
            } else {
                true
            }
        });
    }

    /// Terminate the oldest idle connections past `max_idle` (a
    /// configurable ceiling; default 5, per §4.3 default for async
    /// execution).
    fn enforce_idle_ceiling(&self) {
        let mut connections = self.connections.lock();
        let idle_count = connections.iter().filter(|c| c.state() == ConnectionState::Idle).count();
        if idle_count <= self.max_idle {
            return;
        }
        let mut to_drop = idle_count - self.max_idle;
        connections.retain(|c| {
            if to_drop > 0 && c.state() == ConnectionState::Idle {
                to_drop -= 1;
                false
            } else {
                true
            }
        });
    }

    /// Cancel every connection currently held by the pool, used by
    /// `ClientFacade::invalidate_and_cancel`.
    pub fn cancel_all(&self) {
        let connections = self.connections.lock();
        log::debug!("cancelling all {} pooled connections", connections.len());
        for conn in connections.iter() {
            conn.cancel();
        }
    }

    pub fn size(&self) -> usize {
        self.connections.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ConnectionIdentity {
        ConnectionIdentity {
            scheme: "http".to_string(),
            host: "h".to_string(),
            port: 80,
            proxy: None,
            root_ca_dir: None,
            root_ca_file: None,
            timeout_sec: 60,
        }
    }

    #[test]
    fn release_then_acquire_reuses_idle_connection() {
        let pool = ConnectionPool::new(Duration::from_secs(60), 5);
        let conn = pool.acquire(&identity());
        let id = conn.id();
        pool.release(&conn);
        let reused = pool.acquire(&identity());
        assert_eq!(reused.id(), id);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn in_use_connection_is_not_reused() {
        let pool = ConnectionPool::new(Duration::from_secs(60), 5);
        let first = pool.acquire(&identity());
        let second = pool.acquire(&identity());
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn cancel_is_idempotent_and_terminal() {
        let conn = Connection::new(0, identity());
        assert!(conn.cancel());
        assert!(conn.cancel());
        assert_eq!(conn.state(), ConnectionState::Cancelled);
    }

    #[test]
    fn cancelled_connection_is_dropped_on_release_not_reused() {
        let pool = ConnectionPool::new(Duration::from_secs(60), 5);
        let conn = pool.acquire(&identity());
        conn.cancel();
        pool.release(&conn);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn idle_connection_past_keep_alive_is_swept() {
        let pool = ConnectionPool::new(Duration::from_millis(1), 5);
        let conn = pool.acquire(&identity());
        pool.release(&conn);
        std::thread::sleep(Duration::from_millis(20));
        let fresh = pool.acquire(&identity());
        assert_ne!(fresh.id(), conn.id());
    }

    #[test]
    fn cancel_all_cancels_every_pooled_connection() {
        let pool = ConnectionPool::new(Duration::from_secs(60), 5);
        let a = pool.acquire(&identity());
        let b = pool.acquire(&identity());
        pool.cancel_all();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
