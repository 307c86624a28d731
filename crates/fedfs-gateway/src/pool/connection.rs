//! A pooled session and its per-connection lock.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fedfs_rpc::{Connector, RemoteSession, ServerAddr, Watchdog};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

pub type ConnId = u64;

/// How a connection is used, which decides how it is pooled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnClass {
    /// Long-lived data transfer; shared once the pool is at capacity.
    FileIo,
    /// Short metadata calls; a single shared connection.
    ShortOp,
    /// Created for one caller and torn down on release.
    OneTimeUse,
}

/// Counters shared by every connection of a pool.
#[derive(Debug, Default)]
pub(crate) struct ConnCounters {
    pub created: AtomicU64,
    pub reconnects: AtomicU64,
    pub keepalives: AtomicU64,
    pub disconnects: AtomicU64,
}

/// Everything needed to (re)establish a session.
#[derive(Clone)]
pub(crate) struct SessionFactory {
    pub connector: Arc<dyn Connector>,
    pub addr: ServerAddr,
    pub watchdog: Option<Arc<Watchdog>>,
    pub counters: Arc<ConnCounters>,
}

impl SessionFactory {
    fn connect_once(&self) -> fedfs_rpc::Result<Box<dyn RemoteSession>> {
        let mut session = self.connector.connect(&self.addr)?;
        if let Err(e) = session.login() {
            session.disconnect();
            return Err(e);
        }
        Ok(session)
    }

    /// Connects and logs in, retrying once.
    pub fn establish(&self) -> Result<Box<dyn RemoteSession>> {
        match self.connect_once() {
            Ok(session) => Ok(session),
            Err(first) => {
                warn!(addr = %self.addr, error = %first, "connect failed, retrying once");
                self.connect_once().map_err(|second| {
                    tracing::error!(addr = %self.addr, error = %second, "connect failed twice");
                    GatewayError::RemoteUnavailable {
                        reason: second.to_string(),
                    }
                })
            }
        }
    }
}

struct Timestamps {
    last_active: Instant,
    last_keepalive: Instant,
}

/// One remote session owned by the pool.
///
/// The reference count controls lifetime within the pool; the session lock
/// controls concurrent use. Every remote call goes through [`Connection::lock`].
pub struct Connection {
    id: ConnId,
    class: ConnClass,
    session: Mutex<Option<Box<dyn RemoteSession>>>,
    factory: SessionFactory,
    refs: AtomicUsize,
    generation: AtomicU64,
    retired: AtomicBool,
    times: Mutex<Timestamps>,
}

impl Connection {
    pub(crate) fn open(id: ConnId, class: ConnClass, factory: SessionFactory) -> Result<Self> {
        let session = factory.establish()?;
        factory.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(conn = id, ?class, "connection established");
        let now = Instant::now();
        Ok(Self {
            id,
            class,
            session: Mutex::new(Some(session)),
            factory,
            refs: AtomicUsize::new(0),
            generation: AtomicU64::new(1),
            retired: AtomicBool::new(false),
            times: Mutex::new(Timestamps {
                last_active: now,
                last_keepalive: now,
            }),
        })
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn class(&self) -> ConnClass {
        self.class
    }

    /// Current number of logical holders.
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    /// Bumped on every reconnect. Remote descriptors opened under an older
    /// generation are no longer valid.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Takes the connection's lock for exclusive use of its session.
    pub fn lock(&self) -> SessionGuard<'_> {
        SessionGuard {
            conn: self,
            slot: self.session.lock(),
        }
    }

    pub fn try_lock(&self) -> Option<SessionGuard<'_>> {
        self.session.try_lock().map(|slot| SessionGuard { conn: self, slot })
    }

    pub(crate) fn add_ref(&self) -> usize {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn drop_ref(&self) -> usize {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            self.refs.store(0, Ordering::SeqCst);
            warn!(conn = self.id, "release on connection with no holders");
            return 0;
        }
        prev - 1
    }

    pub(crate) fn touch(&self) {
        self.times.lock().last_active = Instant::now();
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.times.lock().last_active)
    }

    pub(crate) fn keepalive_due(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.times.lock().last_keepalive) >= interval
    }

    /// Refuses any further reconnect. Used at shutdown.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Tears the session down. The next call reconnects unless retired.
    pub(crate) fn disconnect(&self) {
        let taken = self.session.lock().take();
        if let Some(mut session) = taken {
            session.disconnect();
            self.factory
                .counters
                .disconnects
                .fetch_add(1, Ordering::Relaxed);
            debug!(conn = self.id, "connection disconnected");
        }
    }

    /// Issues a keep-alive if the session is not in use. A failed keep-alive
    /// drops the session so the next caller reconnects.
    pub(crate) fn keepalive(&self) -> bool {
        let Some(mut guard) = self.try_lock() else {
            return false;
        };
        let Some(session) = guard.slot.as_mut() else {
            return false;
        };
        match session.noop() {
            Ok(()) => {
                self.times.lock().last_keepalive = Instant::now();
                self.factory
                    .counters
                    .keepalives
                    .fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(conn = self.id, error = %e, "keep-alive failed, dropping session");
                if let Some(mut dead) = guard.slot.take() {
                    dead.disconnect();
                }
                self.generation.fetch_add(1, Ordering::SeqCst);
                false
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("refs", &self.refs())
            .field("generation", &self.generation())
            .finish()
    }
}

/// Exclusive use of a connection's session, held for the duration of a call.
pub struct SessionGuard<'a> {
    conn: &'a Connection,
    slot: MutexGuard<'a, Option<Box<dyn RemoteSession>>>,
}

impl<'a> SessionGuard<'a> {
    pub fn connection(&self) -> &'a Connection {
        self.conn
    }

    pub fn generation(&self) -> u64 {
        self.conn.generation()
    }

    /// Runs one remote call without retrying.
    ///
    /// A missing session (dropped by a failed keep-alive or reconnect) is
    /// re-established first.
    pub fn call_once<T, F>(&mut self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn RemoteSession) -> fedfs_rpc::Result<T>,
    {
        if self.slot.is_none() {
            self.reconnect()?;
        }
        let Some(session) = self.slot.as_mut() else {
            return Err(GatewayError::RemoteUnavailable {
                reason: format!("connection {} has no session", self.conn.id),
            });
        };

        let _watch = self
            .conn
            .factory
            .watchdog
            .as_ref()
            .map(|dog| dog.watch(op, session.abort_handle()));
        let result = f(session.as_mut());
        self.conn.touch();
        result.map_err(GatewayError::from)
    }

    /// Runs a call that does not depend on a remote descriptor, reconnecting
    /// and retrying once on a transport error.
    pub fn call<T, F>(&mut self, op: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut(&mut dyn RemoteSession) -> fedfs_rpc::Result<T>,
    {
        match self.call_once(op, &mut f) {
            Err(e) if e.is_transport() => {
                warn!(conn = self.conn.id, op, error = %e, "transport error, reconnecting");
                self.reconnect()?;
                self.call_once(op, &mut f).map_err(|e| exhausted(op, e))
            }
            other => other,
        }
    }

    /// Tears down and re-establishes the session under the held lock.
    pub fn reconnect(&mut self) -> Result<()> {
        if let Some(mut old) = self.slot.take() {
            old.disconnect();
            self.conn
                .factory
                .counters
                .disconnects
                .fetch_add(1, Ordering::Relaxed);
        }
        self.conn.generation.fetch_add(1, Ordering::SeqCst);
        if self.conn.retired.load(Ordering::SeqCst) {
            return Err(GatewayError::RemoteUnavailable {
                reason: format!("connection {} is shut down", self.conn.id),
            });
        }

        let session = self.conn.factory.establish()?;
        *self.slot = Some(session);
        self.conn
            .factory
            .counters
            .reconnects
            .fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut times = self.conn.times.lock();
        times.last_active = now;
        times.last_keepalive = now;
        debug!(
            conn = self.conn.id,
            generation = self.conn.generation(),
            "connection re-established"
        );
        Ok(())
    }
}

/// A transport error that survived the single retry.
pub(crate) fn exhausted(op: &'static str, err: GatewayError) -> GatewayError {
    match err {
        GatewayError::Transport { reason, .. } => GatewayError::RemoteUnavailable {
            reason: format!("{} failed after reconnect: {}", op, reason),
        },
        other => other,
    }
}
