//! TCP listener wired to the worker pool.
//!
//! The accept loop runs on one thread and hands each connection to an idle
//! worker. A worker serves its connection to completion with a
//! [`Dispatcher`] whose lock owner id is the worker's index, so nested store
//! calls made on behalf of one connection re-enter the buckets it holds.

use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::{Closed, Dispatcher};
use crate::lock::OwnerId;
use crate::pool::{WorkerId, WorkerPool};
use crate::store::SyncStore;

/// A bound, not yet running, server.
pub struct Server {
    listener: TcpListener,
    store: Arc<SyncStore>,
    workers: usize,
}

impl Server {
    /// Opens the store and binds the listener.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        if config.workers == 0 {
            bail!("worker count must be at least 1");
        }
        let store = SyncStore::open(&config.store).with_context(|| {
            format!("failed to open store in {}", config.store.data_dir.display())
        })?;
        let listener = TcpListener::bind(config.listen)
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let addr = listener.local_addr().context("listener has no local address")?;
        info!(
            addr = %addr,
            workers = config.workers,
            table_size = store.table_size(),
            "listening"
        );
        Ok(Self {
            listener,
            store: Arc::new(store),
            workers: config.workers,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    pub fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }

    /// Serves connections on the calling thread until the process exits.
    pub fn run(self) -> Result<()> {
        self.serve(&AtomicBool::new(false))
    }

    /// Runs the accept loop on a background thread.
    pub fn spawn(self) -> Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        let store = Arc::clone(&self.store);
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("kv-accept-{}", local_addr.port()))
                .spawn(move || self.serve(&stop))
                .context("failed to spawn accept loop")?
        };
        Ok(ServerHandle {
            local_addr,
            store,
            stop,
            thread,
        })
    }

    fn serve(self, stop: &AtomicBool) -> Result<()> {
        let store = Arc::clone(&self.store);
        let pool = WorkerPool::new(self.workers, "kv-worker", move |worker, stream: TcpStream| {
            handle_connection(&store, worker, stream)
        })
        .context("failed to spawn worker pool")?;

        for stream in self.listener.incoming() {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    if let Ok(peer) = stream.peer_addr() {
                        debug!(peer = %peer, "accepted connection");
                    }
                    if pool.assign(stream).is_err() {
                        warn!("no workers left to serve connections");
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }

        pool.shutdown();
        info!("server stopped");
        Ok(())
    }
}

fn handle_connection(store: &Arc<SyncStore>, worker: WorkerId, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(err) => {
            warn!(worker, peer = %peer, error = %err, "failed to clone connection");
            return;
        }
    };
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(stream);
    let dispatcher = Dispatcher::new(Arc::clone(store), worker as OwnerId);

    match dispatcher.serve(&mut reader, &mut writer) {
        Ok(Closed::Disconnected { requests }) => {
            info!(worker, peer = %peer, requests, "connection closed");
        }
        Ok(Closed::LogFailure { requests }) => {
            warn!(worker, peer = %peer, requests, "connection closed after log failure");
        }
        Err(err) => {
            warn!(worker, peer = %peer, error = %err, "connection ended with error");
        }
    }
}

/// Handle to a server started with [`Server::spawn`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    store: Arc<SyncStore>,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The store the server is serving, for inspection in tests and tools.
    pub fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }

    /// Stops accepting connections and waits for the workers to finish.
    pub fn shutdown(self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        // Wake the accept loop so it observes the flag.
        if let Err(err) = TcpStream::connect(self.local_addr) {
            debug!(error = %err, "wake-up connection failed");
        }
        self.thread
            .join()
            .map_err(|_| anyhow!("accept loop panicked"))?
    }
}
