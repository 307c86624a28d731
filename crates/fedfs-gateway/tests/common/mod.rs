//! Shared fixtures for gateway integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use fedfs_gateway::{ConnectionPool, FsOps, Gateway, GatewayConfig, PoolConfig};
use fedfs_rpc::memory::MemoryStore;
use fedfs_rpc::ServerAddr;

/// Collection every fixture mounts.
pub const ROOT: &str = "/tempZone/home/rods";

pub fn remote(path: &str) -> String {
    format!("{}{}", ROOT, path)
}

/// Deterministic, non-repeating-per-block content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

pub fn config(block_size: u64, window: usize) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.server.remote_root = ROOT.to_string();
    config.cache.block_size = block_size;
    config.preload.window = window;
    config
}

pub struct TestGateway {
    pub store: MemoryStore,
    pub ops: FsOps,
}

impl TestGateway {
    pub fn start(config: GatewayConfig) -> Self {
        let store = MemoryStore::new();
        store.mkdir(ROOT);
        let gateway = Gateway::start(config, Arc::new(store.connector())).unwrap();
        Self {
            store,
            ops: FsOps::new(Arc::new(gateway)),
        }
    }

    pub fn with_blocks(block_size: u64, window: usize) -> Self {
        Self::start(config(block_size, window))
    }

    /// Stores `data` at the mount-relative `path`.
    pub fn seed(&self, path: &str, data: &[u8]) {
        self.store.put(&remote(path), data);
    }

    pub fn remote_bytes(&self, path: &str) -> Vec<u8> {
        self.store.get(&remote(path)).unwrap_or_default()
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        self.ops.gateway()
    }
}

pub fn addr() -> ServerAddr {
    ServerAddr::new("localhost", 1247, "rods", "tempZone")
}

/// A bare pool over `store`, for tests that need millisecond timings.
pub fn pool(store: &MemoryStore, config: PoolConfig) -> ConnectionPool {
    ConnectionPool::new(config, Arc::new(store.connector()), addr(), None)
}
