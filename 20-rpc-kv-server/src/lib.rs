//! Multi-threaded key-value arithmetic server.
//!
//! Clients connect over TCP and send binary requests that compute with 64-bit
//! integers, store results in named variables, alias variables to one
//! another, and pass file reads and writes through to the server's disk.
//! Every mutation is appended to a text log before it is applied, and the log
//! is replayed on startup.
//!
//! # Architecture
//!
//! - **Accept thread**: accepts connections and hands each one to an idle worker
//! - **Worker threads**: a fixed pool; each serves one connection at a time
//!   until the peer disconnects
//! - **Store**: a hash table shared by all workers, guarded by one reentrant
//!   lock per bucket
//!
//! Multi-key operations lock their buckets in ascending index order, so two
//! requests touching overlapping sets of variables can never deadlock.
//!
//! # Modules
//!
//! - [`key`], [`value`]: variable names and the integer/reference values they hold
//! - [`record`], [`log`]: `key=value` text records and the append-only log
//! - [`table`]: bucketed hash table with log replay, dump and load
//! - [`lock`], [`store`]: reentrant bucket locks and the thread-safe store
//! - [`arith`]: checked arithmetic
//! - [`files`]: file passthrough
//! - [`protocol`]: opcodes, request decoding, reply encoding
//! - [`dispatcher`]: per-connection request loop
//! - [`pool`], [`server`]: worker pool and TCP front end
//! - [`client`]: blocking client used by tests and tools
//! - [`config`], [`cli`]: configuration and command-line parsing

pub mod arith;
pub mod cli;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod files;
pub mod key;
pub mod lock;
pub mod log;
pub mod pool;
pub mod protocol;
pub mod record;
pub mod server;
pub mod store;
pub mod table;
pub mod value;

pub use error::{Error, Result};
