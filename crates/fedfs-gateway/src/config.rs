//! Gateway configuration

use std::path::Path;
use std::time::Duration;

use fedfs_rpc::{ServerAddr, WatchdogConfig};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::pool::PoolConfig;
use crate::preload::PreloadConfig;

pub const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub zone: String,
    /// Remote collection exposed as the filesystem root.
    pub remote_root: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1247,
            user: "rods".to_string(),
            zone: "tempZone".to_string(),
            remote_root: "/".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> ServerAddr {
        ServerAddr::new(&self.host, self.port, &self.user, &self.zone)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub reaper_interval_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout_secs: 300,
            keepalive_interval_secs: 180,
            reaper_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub block_size: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadSection {
    pub enabled: bool,
    pub window: usize,
}

impl Default for PreloadSection {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSection {
    /// Calls running longer than this are aborted. Zero disables the watchdog.
    pub call_timeout_secs: u64,
    pub watchdog_interval_ms: u64,
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            call_timeout_secs: 0,
            watchdog_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub pool: PoolSection,
    pub cache: CacheSection,
    pub preload: PreloadSection,
    pub rpc: RpcSection,
}

impl GatewayConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| GatewayError::Config {
            reason: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        tracing::debug!("Loaded gateway config from {}", path.display());
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| GatewayError::Config {
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(GatewayError::Config {
                reason: "server host cannot be empty".to_string(),
            });
        }

        if !self.server.remote_root.starts_with('/') {
            return Err(GatewayError::Config {
                reason: "remote root must be an absolute collection path".to_string(),
            });
        }

        if self.pool.max_connections == 0 {
            return Err(GatewayError::Config {
                reason: "pool must allow at least one connection".to_string(),
            });
        }

        if self.cache.block_size == 0 {
            return Err(GatewayError::Config {
                reason: "cache block size cannot be zero".to_string(),
            });
        }

        if self.preload.window == 0 {
            return Err(GatewayError::Config {
                reason: "preload window cannot be zero".to_string(),
            });
        }

        if self.pool.keepalive_interval_secs >= self.pool.idle_timeout_secs {
            tracing::warn!(
                "keep-alive interval {}s is not shorter than idle timeout {}s",
                self.pool.keepalive_interval_secs,
                self.pool.idle_timeout_secs
            );
        }

        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.pool.max_connections,
            idle_timeout: Duration::from_secs(self.pool.idle_timeout_secs),
            keepalive_interval: Duration::from_secs(self.pool.keepalive_interval_secs),
            reaper_interval: Duration::from_secs(self.pool.reaper_interval_secs),
        }
    }

    pub fn preload_config(&self) -> PreloadConfig {
        PreloadConfig {
            window: self.preload.window,
        }
    }

    /// `None` when call timeouts are disabled.
    pub fn watchdog_config(&self) -> Option<WatchdogConfig> {
        if self.rpc.call_timeout_secs == 0 {
            return None;
        }
        Some(WatchdogConfig {
            call_timeout: Duration::from_secs(self.rpc.call_timeout_secs),
            sweep_interval: Duration::from_millis(self.rpc.watchdog_interval_ms.max(1)),
        })
    }
}
