//! Runtime configuration for the store and the server.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Bucket count used when none (or zero) is configured.
pub const DEFAULT_TABLE_SIZE: usize = 32;
/// Hop budget for recursive variable lookups.
pub const DEFAULT_MAX_RECURSION: u16 = 50;
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_WORKERS: usize = 4;

/// Shape and location of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Number of buckets. Fixed for the lifetime of the store; 0 selects
    /// [`DEFAULT_TABLE_SIZE`].
    pub table_size: usize,
    /// Maximum number of reference hops a recursive lookup may follow.
    pub max_recursion: u16,
    /// Directory holding the persistence log.
    pub data_dir: PathBuf,
}

impl StoreConfig {
    /// Default shape, persisted under `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_table_size(mut self, table_size: usize) -> Self {
        self.table_size = table_size;
        self
    }

    pub fn with_max_recursion(mut self, max_recursion: u16) -> Self {
        self.max_recursion = max_recursion;
        self
    }

    /// Bucket count actually used.
    pub fn effective_table_size(&self) -> usize {
        if self.table_size == 0 {
            DEFAULT_TABLE_SIZE
        } else {
            self.table_size
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table_size: DEFAULT_TABLE_SIZE,
            max_recursion: DEFAULT_MAX_RECURSION,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        }
    }
}

/// Everything needed to start a server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind. Port 0 picks an ephemeral port.
    pub listen: SocketAddr,
    /// Size of the worker pool, i.e. the number of connections served at once.
    pub workers: usize,
    pub store: StoreConfig,
}

impl ServerConfig {
    pub fn new(listen: SocketAddr, store: StoreConfig) -> Self {
        Self {
            listen,
            workers: DEFAULT_WORKERS,
            store,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            StoreConfig::default(),
        )
    }
}
