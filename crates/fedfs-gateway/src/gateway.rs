//! The gateway context: one instance per mount, owning every component and
//! background thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fedfs_rpc::{Connector, Watchdog};
use tracing::{debug, info};

use crate::buffered::BufferedFs;
use crate::config::GatewayConfig;
use crate::direct::DirectFs;
use crate::error::Result;
use crate::pool::ConnectionPool;
use crate::preload::PreloadFs;
use crate::registry::Registry;

/// Which layer serves file data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPath {
    /// Every read and write goes straight to the remote.
    Direct,
    /// Block cache and write-delta, no read-ahead.
    Buffered,
    /// Block cache plus sliding-window read-ahead.
    Preload,
}

impl DataPath {
    pub fn from_config(config: &GatewayConfig) -> Self {
        match (config.cache.enabled, config.preload.enabled) {
            (false, _) => DataPath::Direct,
            (true, false) => DataPath::Buffered,
            (true, true) => DataPath::Preload,
        }
    }
}

pub struct Gateway {
    config: GatewayConfig,
    data_path: DataPath,
    watchdog: Option<Arc<Watchdog>>,
    pool: Arc<ConnectionPool>,
    registry: Arc<Registry>,
    buffered: Arc<BufferedFs>,
    preload: PreloadFs,
    stopped: AtomicBool,
}

impl Gateway {
    /// Validates `config`, then builds the component stack and starts the
    /// reaper and, if call timeouts are enabled, the watchdog.
    pub fn start(config: GatewayConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let data_path = DataPath::from_config(&config);
        debug!(
            "Initializing gateway: server={}, root={}, data_path={:?}",
            config.server.addr(),
            config.server.remote_root,
            data_path
        );

        let watchdog = match config.watchdog_config() {
            Some(wd) => Some(Arc::new(Watchdog::start(wd)?)),
            None => None,
        };

        let pool = Arc::new(ConnectionPool::new(
            config.pool_config(),
            connector,
            config.server.addr(),
            watchdog.clone(),
        ));
        pool.start_reaper()?;

        let registry = Arc::new(Registry::new(Arc::clone(&pool)));
        let buffered = Arc::new(BufferedFs::new(
            DirectFs::new(Arc::clone(&registry)),
            config.cache.block_size,
        ));
        let preload = PreloadFs::new(Arc::clone(&buffered), config.preload_config());

        info!(
            "Gateway started for {} (pool={}, block_size={}, window={})",
            config.server.addr(),
            config.pool.max_connections,
            config.cache.block_size,
            config.preload.window
        );

        Ok(Self {
            config,
            data_path,
            watchdog,
            pool,
            registry,
            buffered,
            preload,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn data_path(&self) -> DataPath {
        self.data_path
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn direct(&self) -> &DirectFs {
        self.buffered.direct()
    }

    pub fn buffered(&self) -> &Arc<BufferedFs> {
        &self.buffered
    }

    pub fn preload(&self) -> &PreloadFs {
        &self.preload
    }

    pub fn watchdog(&self) -> Option<&Arc<Watchdog>> {
        self.watchdog.as_ref()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Joins read-ahead, flushes and closes every handle, stops background
    /// threads and disconnects all sessions. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.preload.shutdown();
        let files = self.buffered.close_all();
        let rest = self.registry.close_all();
        self.pool.shutdown();
        if let Some(watchdog) = &self.watchdog {
            watchdog.stop();
        }
        info!(
            "Gateway stopped, {} files and {} other handles closed",
            files, rest
        );
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}
