//! Error types shared by the store, the dispatcher and the file passthrough.

use std::io;

/// Errors returned by store, arithmetic, file and protocol operations.
///
/// Everything except [`Error::Io`] on the connection itself is reported back to
/// the client as a status byte and leaves the connection open.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Key does not start with a letter, contains characters other than
    /// letters, digits and `_`, is empty, or is too long.
    #[error("invalid key {0:?}")]
    InvalidKey(String),

    /// A reference value names something that is not a valid key.
    #[error("invalid reference value {0:?}")]
    InvalidValue(String),

    #[error("key {0:?} not found")]
    NotFound(String),

    /// The stored variant is not the one the caller asked for.
    #[error("key {key:?} holds {found}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Reference chain did not reach an integer within the hop budget.
    #[error("reference chain from {key:?} did not resolve within {hops} hops")]
    CycleOrTooDeep { key: String, hops: u16 },

    #[error("arithmetic overflow")]
    Overflow,

    #[error("division by zero")]
    DivideByZero,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A load or log line that is not `key=value` or `~key=`.
    #[error("invalid record on line {line}: {content:?}")]
    InvalidFormat { line: usize, content: String },

    /// The request could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A bucket was released by a caller that does not hold it.
    #[error("bucket {bucket} is not held by owner {owner}")]
    LockOwnership { bucket: usize, owner: u64 },

    /// A whole-table operation was started while holding only some buckets.
    #[error("owner {owner} holds {held} buckets and cannot wait for the whole table")]
    LockOrder { owner: u64, held: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
