use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::config::{
    DEFAULT_DATA_DIR, DEFAULT_MAX_RECURSION, DEFAULT_TABLE_SIZE, DEFAULT_WORKERS, ServerConfig,
    StoreConfig,
};

/// Lowest port the server may listen on.
pub const MIN_PORT: u16 = 1024;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Multi-threaded key-value arithmetic server", long_about = None)]
pub struct Cli {
    /// Number of worker threads, i.e. concurrently served connections.
    #[arg(short = 'N', long, default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Number of hash table buckets.
    #[arg(short = 'H', long, default_value_t = DEFAULT_TABLE_SIZE)]
    pub table_size: usize,

    /// Maximum references followed by recursive lookups.
    #[arg(short = 'I', long, default_value_t = DEFAULT_MAX_RECURSION)]
    pub max_recursion: u16,

    /// Directory holding the persistence log.
    #[arg(short = 'd', long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Address to listen on, as host:port.
    pub listen: String,
}

impl Cli {
    /// Validates the arguments and resolves the listen address.
    pub fn into_config(self) -> Result<ServerConfig> {
        if self.workers == 0 {
            bail!("worker count must be at least 1");
        }
        let listen = resolve(&self.listen)?;
        let store = StoreConfig::new(self.data_dir)
            .with_table_size(self.table_size)
            .with_max_recursion(self.max_recursion);
        Ok(ServerConfig::new(listen, store).with_workers(self.workers))
    }
}

fn resolve(listen: &str) -> Result<SocketAddr> {
    let addr = listen
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {listen}"))?
        .next()
        .with_context(|| format!("{listen} resolved to no addresses"))?;
    if addr.port() < MIN_PORT {
        bail!("port {} is reserved, use {MIN_PORT} or above", addr.port());
    }
    Ok(addr)
}
