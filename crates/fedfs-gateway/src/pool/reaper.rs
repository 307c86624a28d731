//! Background eviction of idle connections and keep-alive pings.

use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, warn};

use super::{Connection, PoolShared, SweepReport};

/// One pass: disconnect free connections idle past the timeout, then ping
/// every remaining connection whose keep-alive is due.
pub(crate) fn sweep(shared: &PoolShared, now: Instant) -> SweepReport {
    let idle_timeout = shared.config.idle_timeout;
    let (expired, live): (Vec<Arc<Connection>>, Vec<Arc<Connection>>) = {
        let mut state = shared.state.lock();

        let (stale, fresh): (Vec<_>, Vec<_>) = state
            .file_free
            .drain(..)
            .partition(|c| c.idle_for(now) >= idle_timeout);
        state.file_free = fresh;
        let mut expired = stale;

        let short_expired = state
            .short_free
            .as_ref()
            .map_or(false, |c| c.idle_for(now) >= idle_timeout);
        if short_expired {
            expired.extend(state.short_free.take());
        }

        let live = state
            .file_free
            .iter()
            .chain(state.file_busy.values())
            .chain(state.short_free.iter())
            .chain(state.short_busy.iter())
            .map(Arc::clone)
            .collect();
        (expired, live)
    };

    for conn in &expired {
        debug!(conn = conn.id(), "reaping idle connection");
        conn.disconnect();
    }
    shared
        .reaped
        .fetch_add(expired.len() as u64, Ordering::Relaxed);

    let interval = shared.config.keepalive_interval;
    let keepalives = live
        .iter()
        .filter(|c| c.keepalive_due(now, interval))
        .filter(|c| c.keepalive())
        .count();

    SweepReport {
        reaped: expired.len(),
        keepalives,
    }
}

pub(crate) struct Reaper {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl Reaper {
    pub(crate) fn spawn(shared: Arc<PoolShared>) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let interval = shared.config.reaper_interval;
        let handle = thread::Builder::new()
            .name("fedfs-reaper".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let report = sweep(&shared, Instant::now());
                        if report.reaped > 0 || report.keepalives > 0 {
                            debug!(
                                "Reaper pass: reaped={}, keepalives={}",
                                report.reaped, report.keepalives
                            );
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        debug!("Connection reaper started, interval={:?}", interval);
        Ok(Self { stop_tx, handle })
    }

    pub(crate) fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            warn!("connection reaper thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ConnClass, ConnectionPool, PoolConfig};
    use fedfs_rpc::memory::MemoryStore;
    use fedfs_rpc::ServerAddr;
    use std::sync::Arc;
    use std::time::Duration;

    fn pool(store: &MemoryStore, idle_ms: u64, keepalive_ms: u64) -> ConnectionPool {
        ConnectionPool::new(
            PoolConfig {
                max_connections: 4,
                idle_timeout: Duration::from_millis(idle_ms),
                keepalive_interval: Duration::from_millis(keepalive_ms),
                reaper_interval: Duration::from_millis(10),
            },
            Arc::new(store.connector()),
            ServerAddr::new("localhost", 1247, "rods", "tempZone"),
            None,
        )
    }

    #[test]
    fn test_sweep_reaps_idle_free_connection() {
        let store = MemoryStore::new();
        let pool = pool(&store, 0, 60_000);
        drop(pool.acquire(ConnClass::FileIo).unwrap());
        assert_eq!(pool.stats().file_io_free, 1);

        let report = pool.sweep();
        assert_eq!(report.reaped, 1);
        assert_eq!(pool.stats().file_io_free, 0);
        assert_eq!(store.live_sessions(), 0);
    }

    #[test]
    fn test_sweep_never_reaps_busy_connection() {
        let store = MemoryStore::new();
        let pool = pool(&store, 0, 60_000);
        let _held = pool.acquire(ConnClass::FileIo).unwrap();
        assert_eq!(pool.sweep().reaped, 0);
        assert_eq!(store.live_sessions(), 1);
    }

    #[test]
    fn test_sweep_keeps_fresh_free_connection() {
        let store = MemoryStore::new();
        let pool = pool(&store, 60_000, 60_000);
        drop(pool.acquire(ConnClass::ShortOp).unwrap());
        assert_eq!(pool.sweep(), super::SweepReport::default());
        assert_eq!(pool.stats().short_op_free, 1);
    }

    #[test]
    fn test_sweep_pings_due_connections() {
        let store = MemoryStore::new();
        let pool = pool(&store, 60_000, 0);
        let _held = pool.acquire(ConnClass::FileIo).unwrap();
        drop(pool.acquire(ConnClass::ShortOp).unwrap());

        let report = pool.sweep();
        assert_eq!(report.keepalives, 2);
        assert_eq!(store.counts().noops, 2);
        assert_eq!(pool.stats().keepalives, 2);
    }

    #[test]
    fn test_background_reaper_evicts_idle_connection() {
        let store = MemoryStore::new();
        let pool = pool(&store, 20, 60_000);
        pool.start_reaper().unwrap();
        drop(pool.acquire(ConnClass::FileIo).unwrap());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.live_sessions() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(store.live_sessions(), 0);
        pool.shutdown();
    }
}
