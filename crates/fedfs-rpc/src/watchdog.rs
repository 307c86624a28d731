//! Call-timeout watchdog.
//!
//! Remote calls are synchronous and cannot be cancelled mid-flight. The
//! watchdog is the only timeout mechanism: callers register each call for
//! its duration, and a background sweeper forcibly closes the transport of
//! any call that has run past the deadline. The blocked caller then sees a
//! transport error and goes through the usual reconnect path.

use crate::session::CallAbort;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for the call watchdog.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// A call running longer than this has its transport closed.
    pub call_timeout: Duration,
    /// How often in-flight calls are checked.
    pub sweep_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

struct WatchedCall {
    op: &'static str,
    started: Instant,
    abort: Arc<dyn CallAbort>,
}

struct Inner {
    timeout: Duration,
    next_id: AtomicU64,
    calls: Mutex<HashMap<u64, WatchedCall>>,
    aborted: AtomicU64,
}

impl Inner {
    fn sweep(&self) -> usize {
        let now = Instant::now();
        let overdue: Vec<(u64, WatchedCall)> = {
            let mut calls = self.calls.lock();
            let ids: Vec<u64> = calls
                .iter()
                .filter(|(_, c)| now.duration_since(c.started) >= self.timeout)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| calls.remove(&id).map(|c| (id, c)))
                .collect()
        };

        for (id, call) in &overdue {
            warn!(
                call = id,
                op = call.op,
                elapsed_ms = now.duration_since(call.started).as_millis() as u64,
                "remote call exceeded deadline, closing transport"
            );
            call.abort.abort();
        }
        self.aborted
            .fetch_add(overdue.len() as u64, Ordering::Relaxed);
        overdue.len()
    }
}

/// Registration of one in-flight call. Dropping it ends the watch.
pub struct CallGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.inner.calls.lock().remove(&self.id);
    }
}

/// Background deadline enforcement for remote calls.
pub struct Watchdog {
    inner: Arc<Inner>,
    stop_tx: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    /// Creates a watchdog without a sweeper thread. Use [`Watchdog::sweep`]
    /// to check deadlines manually.
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                timeout: config.call_timeout,
                next_id: AtomicU64::new(1),
                calls: Mutex::new(HashMap::new()),
                aborted: AtomicU64::new(0),
            }),
            stop_tx: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    /// Creates a watchdog and starts its sweeper thread.
    pub fn start(config: WatchdogConfig) -> std::io::Result<Self> {
        let interval = config.sweep_interval;
        let watchdog = Self::new(config);
        let (tx, rx) = mpsc::channel::<()>();
        let inner = Arc::clone(&watchdog.inner);

        let handle = thread::Builder::new()
            .name("fedfs-watchdog".to_string())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        inner.sweep();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        debug!(
            timeout_ms = watchdog.inner.timeout.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "call watchdog started"
        );
        *watchdog.stop_tx.lock() = Some(tx);
        *watchdog.thread.lock() = Some(handle);
        Ok(watchdog)
    }

    /// Registers a call that is about to be issued.
    pub fn watch(&self, op: &'static str, abort: Arc<dyn CallAbort>) -> CallGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.calls.lock().insert(
            id,
            WatchedCall {
                op,
                started: Instant::now(),
                abort,
            },
        );
        CallGuard {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    /// Aborts every call past its deadline. Returns how many were aborted.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Number of calls currently registered.
    pub fn in_flight(&self) -> usize {
        self.inner.calls.lock().len()
    }

    /// Total number of calls aborted so far.
    pub fn aborted_total(&self) -> u64 {
        self.inner.aborted.load(Ordering::Relaxed)
    }

    /// Stops the sweeper thread and waits for it.
    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!("call watchdog thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingAbort {
        hits: AtomicUsize,
    }

    impl CallAbort for CountingAbort {
        fn abort(&self) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(timeout_ms: u64) -> WatchdogConfig {
        WatchdogConfig {
            call_timeout: Duration::from_millis(timeout_ms),
            sweep_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn guard_drop_unregisters_call() {
        let dog = Watchdog::new(config(1000));
        let abort = Arc::new(CountingAbort::default());
        {
            let _guard = dog.watch("read", abort.clone());
            assert_eq!(dog.in_flight(), 1);
        }
        assert_eq!(dog.in_flight(), 0);
    }

    #[test]
    fn sweep_leaves_fresh_calls_alone() {
        let dog = Watchdog::new(config(10_000));
        let abort = Arc::new(CountingAbort::default());
        let _guard = dog.watch("read", abort.clone());
        assert_eq!(dog.sweep(), 0);
        assert_eq!(abort.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sweep_aborts_overdue_call_once() {
        let dog = Watchdog::new(config(0));
        let abort = Arc::new(CountingAbort::default());
        let _guard = dog.watch("write", abort.clone());

        assert_eq!(dog.sweep(), 1);
        assert_eq!(dog.sweep(), 0, "aborted calls are not aborted twice");
        assert_eq!(abort.hits.load(Ordering::SeqCst), 1);
        assert_eq!(dog.aborted_total(), 1);
    }

    #[test]
    fn background_sweeper_aborts_stuck_call() {
        let dog = Watchdog::start(config(20)).unwrap();
        let abort = Arc::new(CountingAbort::default());
        let _guard = dog.watch("read", abort.clone());

        let deadline = Instant::now() + Duration::from_secs(2);
        while abort.hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(abort.hits.load(Ordering::SeqCst), 1);
        dog.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let dog = Watchdog::start(config(1000)).unwrap();
        dog.stop();
        dog.stop();
    }
}
