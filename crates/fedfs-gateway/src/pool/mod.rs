//! Bounded pool of remote sessions.
//!
//! Connections are created lazily and partitioned per [`ConnClass`] into free
//! and in-use sets. The pool's bookkeeping lock is never held across a
//! network call: creation, keep-alive and teardown all happen after the
//! bookkeeping has been settled.

mod connection;
mod reaper;

pub use connection::{ConnClass, ConnId, Connection, SessionGuard};
pub(crate) use connection::exhausted;

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fedfs_rpc::{Connector, ServerAddr, Watchdog};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use connection::{ConnCounters, SessionFactory};
use reaper::Reaper;

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on FileIO connections before they are shared.
    pub max_connections: usize,
    /// Free connections idle this long are disconnected.
    pub idle_timeout: Duration,
    /// Connections are pinged when their last keep-alive is this old.
    pub keepalive_interval: Duration,
    /// How often the reaper runs.
    pub reaper_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Duration::from_secs(300),
            keepalive_interval: Duration::from_secs(180),
            reaper_interval: Duration::from_secs(10),
        }
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub file_io_free: usize,
    pub file_io_busy: usize,
    pub short_op_free: usize,
    pub short_op_busy: usize,
    pub one_time: usize,
    /// Sum of reference counts over every in-use connection.
    pub total_refs: usize,
    pub created: u64,
    pub reconnects: u64,
    pub keepalives: u64,
    pub reaped: u64,
}

/// Result of one reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reaped: usize,
    pub keepalives: usize,
}

#[derive(Default)]
struct PoolState {
    file_free: Vec<Arc<Connection>>,
    file_busy: BTreeMap<ConnId, Arc<Connection>>,
    file_pending: usize,
    short_free: Option<Arc<Connection>>,
    short_busy: Option<Arc<Connection>>,
    one_time: BTreeMap<ConnId, Arc<Connection>>,
}

impl PoolState {
    fn lease_short(&mut self) -> Option<Arc<Connection>> {
        if let Some(conn) = &self.short_busy {
            conn.add_ref();
            return Some(Arc::clone(conn));
        }
        let conn = self.short_free.take()?;
        conn.add_ref();
        self.short_busy = Some(Arc::clone(&conn));
        Some(conn)
    }

    fn least_shared_file_conn(&self) -> Option<Arc<Connection>> {
        // BTreeMap order makes the lowest id win ties.
        self.file_busy
            .values()
            .min_by_key(|c| c.refs())
            .map(Arc::clone)
    }

    fn drain(&mut self) -> Vec<Arc<Connection>> {
        let mut all: Vec<Arc<Connection>> = self.file_free.drain(..).collect();
        all.extend(std::mem::take(&mut self.file_busy).into_values());
        all.extend(self.short_free.take());
        all.extend(self.short_busy.take());
        all.extend(std::mem::take(&mut self.one_time).into_values());
        all
    }
}

pub(crate) struct PoolShared {
    config: PoolConfig,
    factory: SessionFactory,
    state: Mutex<PoolState>,
    short_gate: Mutex<()>,
    next_id: AtomicU64,
    reaped: AtomicU64,
    closed: AtomicBool,
}

impl PoolShared {
    fn create(&self, class: ConnClass) -> Result<Arc<Connection>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::open(id, class, self.factory.clone())?;
        Ok(Arc::new(conn))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::RemoteUnavailable {
                reason: "connection pool is shut down".to_string(),
            });
        }
        Ok(())
    }

    fn acquire_file_io(&self) -> Result<Arc<Connection>> {
        {
            let mut state = self.state.lock();
            if let Some(conn) = state.file_free.pop() {
                conn.add_ref();
                state.file_busy.insert(conn.id(), Arc::clone(&conn));
                debug!(conn = conn.id(), "reusing free FileIO connection");
                return Ok(conn);
            }

            let total = state.file_busy.len() + state.file_free.len() + state.file_pending;
            if total >= self.config.max_connections {
                if let Some(conn) = state.least_shared_file_conn() {
                    let refs = conn.add_ref();
                    debug!(conn = conn.id(), refs, "pool at capacity, sharing connection");
                    return Ok(conn);
                }
            }
            state.file_pending += 1;
        }

        let created = self.create(ConnClass::FileIo);
        let mut state = self.state.lock();
        state.file_pending -= 1;
        let conn = created?;
        conn.add_ref();
        state.file_busy.insert(conn.id(), Arc::clone(&conn));
        Ok(conn)
    }

    fn acquire_short_op(&self) -> Result<Arc<Connection>> {
        if let Some(conn) = self.state.lock().lease_short() {
            return Ok(conn);
        }

        let _gate = self.short_gate.lock();
        if let Some(conn) = self.state.lock().lease_short() {
            return Ok(conn);
        }
        let conn = self.create(ConnClass::ShortOp)?;
        conn.add_ref();
        self.state.lock().short_busy = Some(Arc::clone(&conn));
        Ok(conn)
    }

    fn acquire_one_time(&self) -> Result<Arc<Connection>> {
        let conn = self.create(ConnClass::OneTimeUse)?;
        conn.add_ref();
        self.state
            .lock()
            .one_time
            .insert(conn.id(), Arc::clone(&conn));
        Ok(conn)
    }

    fn release(&self, conn: &Arc<Connection>) {
        let mut teardown = None;
        {
            let mut state = self.state.lock();
            if conn.drop_ref() > 0 {
                return;
            }
            conn.touch();
            let closed = self.closed.load(Ordering::SeqCst);
            match conn.class() {
                ConnClass::FileIo => {
                    if let Some(conn) = state.file_busy.remove(&conn.id()) {
                        if closed {
                            teardown = Some(conn);
                        } else {
                            state.file_free.push(conn);
                        }
                    }
                }
                ConnClass::ShortOp => {
                    let is_current = state
                        .short_busy
                        .as_ref()
                        .map_or(false, |c| c.id() == conn.id());
                    if is_current {
                        let conn = state.short_busy.take();
                        if closed {
                            teardown = conn;
                        } else {
                            state.short_free = conn;
                        }
                    }
                }
                ConnClass::OneTimeUse => {
                    teardown = state.one_time.remove(&conn.id());
                }
            }
        }

        if let Some(conn) = teardown {
            conn.disconnect();
        }
    }
}

/// A counted hold on a pooled connection. Dropping it releases the hold.
pub struct ConnLease {
    shared: Arc<PoolShared>,
    conn: Arc<Connection>,
}

impl ConnLease {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }
}

impl Deref for ConnLease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for ConnLease {
    fn drop(&mut self) {
        self.shared.release(&self.conn);
    }
}

impl std::fmt::Debug for ConnLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ConnLease").field(&self.conn).finish()
    }
}

/// The connection pool.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    reaper: Mutex<Option<Reaper>>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        addr: ServerAddr,
        watchdog: Option<Arc<Watchdog>>,
    ) -> Self {
        debug!(
            "Initializing connection pool: max={}, idle_timeout={:?}, keepalive={:?}",
            config.max_connections, config.idle_timeout, config.keepalive_interval
        );
        Self {
            shared: Arc::new(PoolShared {
                config,
                factory: SessionFactory {
                    connector,
                    addr,
                    watchdog,
                    counters: Arc::new(ConnCounters::default()),
                },
                state: Mutex::new(PoolState::default()),
                short_gate: Mutex::new(()),
                next_id: AtomicU64::new(1),
                reaped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
            reaper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Hands out a connection of the given class. Never fails for lack of
    /// capacity: a full FileIO pool degrades to sharing.
    pub fn acquire(&self, class: ConnClass) -> Result<ConnLease> {
        self.shared.check_open()?;
        let conn = match class {
            ConnClass::FileIo => self.shared.acquire_file_io()?,
            ConnClass::ShortOp => self.shared.acquire_short_op()?,
            ConnClass::OneTimeUse => self.shared.acquire_one_time()?,
        };
        Ok(ConnLease {
            shared: Arc::clone(&self.shared),
            conn,
        })
    }

    /// Gives a hold back early. Equivalent to dropping the lease.
    pub fn release(&self, lease: ConnLease) {
        drop(lease);
    }

    /// Re-establishes the session of `conn` under its lock.
    pub fn reconnect(&self, conn: &Connection) -> Result<()> {
        conn.lock().reconnect()
    }

    /// Runs one reaper pass immediately.
    pub fn sweep(&self) -> SweepReport {
        reaper::sweep(&self.shared, Instant::now())
    }

    /// Starts the background reaper. Idempotent.
    pub fn start_reaper(&self) -> Result<()> {
        let mut slot = self.reaper.lock();
        if slot.is_none() {
            *slot = Some(Reaper::spawn(Arc::clone(&self.shared))?);
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        let counters = &self.shared.factory.counters;
        let busy_refs: usize = state
            .file_busy
            .values()
            .chain(state.short_busy.iter())
            .chain(state.one_time.values())
            .map(|c| c.refs())
            .sum();
        PoolStats {
            file_io_free: state.file_free.len(),
            file_io_busy: state.file_busy.len(),
            short_op_free: state.short_free.iter().count(),
            short_op_busy: state.short_busy.iter().count(),
            one_time: state.one_time.len(),
            total_refs: busy_refs,
            created: counters.created.load(Ordering::Relaxed),
            reconnects: counters.reconnects.load(Ordering::Relaxed),
            keepalives: counters.keepalives.load(Ordering::Relaxed),
            reaped: self.shared.reaped.load(Ordering::Relaxed),
        }
    }

    /// Stops the reaper and disconnects every connection. Later acquires fail.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.stop();
        }
        let all = self.shared.state.lock().drain();
        let count = all.len();
        for conn in all {
            conn.retire();
            conn.disconnect();
        }
        info!("Connection pool shut down, {} connections closed", count);
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedfs_rpc::memory::MemoryStore;

    fn pool_with(store: &MemoryStore, max: usize) -> ConnectionPool {
        let config = PoolConfig {
            max_connections: max,
            ..PoolConfig::default()
        };
        ConnectionPool::new(
            config,
            Arc::new(store.connector()),
            ServerAddr::new("localhost", 1247, "rods", "tempZone"),
            None,
        )
    }

    #[test]
    fn test_file_io_reuses_free_connection() {
        let store = MemoryStore::new();
        let pool = pool_with(&store, 4);
        let first_id = {
            let lease = pool.acquire(ConnClass::FileIo).unwrap();
            lease.id()
        };
        let lease = pool.acquire(ConnClass::FileIo).unwrap();
        assert_eq!(lease.id(), first_id);
        assert_eq!(store.counts().connects, 1);
    }

    #[test]
    fn test_file_io_creates_until_capacity_then_shares() {
        let store = MemoryStore::new();
        let pool = pool_with(&store, 2);
        let a = pool.acquire(ConnClass::FileIo).unwrap();
        let b = pool.acquire(ConnClass::FileIo).unwrap();
        assert_ne!(a.id(), b.id());

        let c = pool.acquire(ConnClass::FileIo).unwrap();
        assert_eq!(c.id(), a.id(), "lowest refcount, lowest id wins");
        assert_eq!(a.refs(), 2);

        let d = pool.acquire(ConnClass::FileIo).unwrap();
        assert_eq!(d.id(), b.id());
        assert_eq!(store.counts().connects, 2);
    }

    #[test]
    fn test_short_op_is_a_shared_singleton() {
        let store = MemoryStore::new();
        let pool = pool_with(&store, 2);
        let a = pool.acquire(ConnClass::ShortOp).unwrap();
        let b = pool.acquire(ConnClass::ShortOp).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.refs(), 2);
        drop(a);
        drop(b);

        let stats = pool.stats();
        assert_eq!(stats.short_op_free, 1);
        assert_eq!(stats.short_op_busy, 0);

        let c = pool.acquire(ConnClass::ShortOp).unwrap();
        assert_eq!(c.refs(), 1);
        assert_eq!(store.counts().connects, 1);
    }

    #[test]
    fn test_one_time_use_disconnects_on_release() {
        let store = MemoryStore::new();
        let pool = pool_with(&store, 2);
        let lease = pool.acquire(ConnClass::OneTimeUse).unwrap();
        assert_eq!(pool.stats().one_time, 1);
        assert_eq!(store.live_sessions(), 1);
        pool.release(lease);
        assert_eq!(pool.stats().one_time, 0);
        assert_eq!(store.live_sessions(), 0);
    }

    #[test]
    fn test_release_at_zero_moves_to_free() {
        let store = MemoryStore::new();
        let pool = pool_with(&store, 2);
        let a = pool.acquire(ConnClass::FileIo).unwrap();
        let shared = pool.acquire(ConnClass::FileIo).unwrap();
        let _b = pool.acquire(ConnClass::FileIo).unwrap();
        let _c = pool.acquire(ConnClass::FileIo).unwrap();
        assert_eq!(pool.stats().file_io_busy, 2);

        drop(a);
        assert_eq!(pool.stats().file_io_free, 0, "still held by a sharer");
        drop(shared);
        let stats = pool.stats();
        assert_eq!(stats.file_io_free + stats.file_io_busy, 2);
    }

    #[test]
    fn test_acquire_fails_when_remote_unreachable() {
        let store = MemoryStore::new();
        let pool = pool_with(&store, 2);
        store.refuse_connects(2);
        let err = pool.acquire(ConnClass::FileIo).unwrap_err();
        assert!(matches!(err, GatewayError::RemoteUnavailable { .. }));
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn test_reconnect_bumps_generation() {
        let store = MemoryStore::new();
        let pool = pool_with(&store, 2);
        let lease = pool.acquire(ConnClass::FileIo).unwrap();
        let before = lease.generation();
        pool.reconnect(&lease).unwrap();
        assert_eq!(lease.generation(), before + 1);
        assert_eq!(pool.stats().reconnects, 1);
    }

    #[test]
    fn test_shutdown_disconnects_everything() {
        let store = MemoryStore::new();
        let pool = pool_with(&store, 2);
        let held = pool.acquire(ConnClass::FileIo).unwrap();
        drop(pool.acquire(ConnClass::ShortOp).unwrap());
        assert_eq!(store.live_sessions(), 2);

        pool.shutdown();
        assert_eq!(store.live_sessions(), 0);
        assert!(pool.acquire(ConnClass::FileIo).is_err());
        drop(held);
        assert_eq!(store.live_sessions(), 0);
    }
}
