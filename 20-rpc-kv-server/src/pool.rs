//! Fixed-size worker pool with idle-worker hand-off.
//!
//! Each worker owns a one-slot channel for the connection it is assigned.
//! Workers announce that they are idle on a shared channel; [`WorkerPool::assign`]
//! blocks on that channel until some worker is free, so a worker never holds
//! more than one connection and connections are never queued behind a busy
//! worker.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, SendError, Sender, bounded, unbounded};
use tracing::{debug, warn};

/// Index of a worker within its pool.
pub type WorkerId = usize;

struct Worker<C> {
    slot: Sender<C>,
    thread: JoinHandle<()>,
}

pub struct WorkerPool<C> {
    workers: Vec<Worker<C>>,
    idle: Receiver<WorkerId>,
}

impl<C: Send + 'static> WorkerPool<C> {
    /// Spawns `size` workers that run `handler` for every connection they are
    /// given.
    pub fn new<F>(size: usize, name: &str, handler: F) -> io::Result<Self>
    where
        F: Fn(WorkerId, C) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let (idle_tx, idle_rx) = unbounded();
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let (slot_tx, slot_rx) = bounded::<C>(1);
            let idle_tx = idle_tx.clone();
            let handler = Arc::clone(&handler);
            let thread = thread::Builder::new()
                .name(format!("{name}-{id}"))
                .spawn(move || worker_loop(id, slot_rx, idle_tx, handler.as_ref()))?;
            workers.push(Worker {
                slot: slot_tx,
                thread,
            });
        }
        Ok(Self {
            workers,
            idle: idle_rx,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Hands `conn` to an idle worker, blocking until one is available.
    ///
    /// Gives the connection back if every worker has exited.
    pub fn assign(&self, conn: C) -> Result<WorkerId, SendError<C>> {
        let Ok(id) = self.idle.recv() else {
            return Err(SendError(conn));
        };
        self.workers[id].slot.send(conn)?;
        debug!(worker = id, "assigned connection");
        Ok(id)
    }

    /// Stops the pool and joins every worker. A busy worker is joined once
    /// its current connection ends.
    pub fn shutdown(self) {
        let threads: Vec<JoinHandle<()>> = self
            .workers
            .into_iter()
            .map(|worker| worker.thread)
            .collect();
        for (id, thread) in threads.into_iter().enumerate() {
            if thread.join().is_err() {
                warn!(worker = id, "worker panicked");
            }
        }
    }
}

fn worker_loop<C, F>(id: WorkerId, slot: Receiver<C>, idle: Sender<WorkerId>, handler: &F)
where
    F: Fn(WorkerId, C),
{
    if idle.send(id).is_err() {
        return;
    }
    for conn in slot.iter() {
        handler(id, conn);
        if idle.send(id).is_err() {
            break;
        }
    }
    debug!(worker = id, "worker exiting");
}
