//! Per-connection request loop.
//!
//! A connection is a sequence of request/reply exchanges. Store and file
//! errors are reported in the reply status and the loop carries on; errors
//! on the transport itself, or a failed write to the persistence log, end the
//! connection.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::files;
use crate::lock::OwnerId;
use crate::protocol::{self, CLEAR_MAGIC, ReplyBody, Request, Status};
use crate::store::SyncStore;

/// Result of handling one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: Status,
    pub body: ReplyBody,
    /// The connection must be closed after the reply is sent.
    pub close: bool,
}

impl Outcome {
    fn ok(body: ReplyBody) -> Self {
        Self {
            status: Status::OK,
            body,
            close: false,
        }
    }

    fn status(status: Status) -> Self {
        Self {
            status,
            body: ReplyBody::Empty,
            close: false,
        }
    }
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    /// The peer hung up between requests.
    Disconnected { requests: u64 },
    /// The persistence log failed while serving a request.
    LogFailure { requests: u64 },
}

/// Executes requests against a shared store on behalf of one lock owner.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: Arc<SyncStore>,
    owner: OwnerId,
}

impl Dispatcher {
    pub fn new(store: Arc<SyncStore>, owner: OwnerId) -> Self {
        Self { store, owner }
    }

    /// Serves requests until the peer disconnects.
    ///
    /// Returns `Err` when reading a request or writing a reply fails.
    pub fn serve<R: Read, W: Write>(
        &self,
        reader: &mut R,
        writer: &mut W,
    ) -> std::io::Result<Closed> {
        let mut requests = 0u64;
        while let Some(header) = protocol::read_header(reader)? {
            let request = protocol::read_request(reader, header.op)?;
            let outcome = self.handle(&request);
            protocol::write_reply(writer, header.id, outcome.status, &outcome.body)?;
            requests += 1;
            if outcome.close {
                return Ok(Closed::LogFailure { requests });
            }
        }
        Ok(Closed::Disconnected { requests })
    }

    /// Handles one decoded request.
    pub fn handle(&self, request: &Request) -> Outcome {
        if let Request::Unsupported { op } = request {
            debug!(owner = self.owner, op = *op, "unsupported opcode");
            return Outcome::status(Status::UNSUPPORTED);
        }
        match self.execute(request) {
            Ok(body) => Outcome::ok(body),
            Err(err) => {
                let close = writes_log(request) && matches!(err, Error::Io(_));
                if close {
                    warn!(owner = self.owner, error = %err, "persistence log failure");
                } else {
                    debug!(owner = self.owner, op = request.op(), error = %err, "request failed");
                }
                Outcome {
                    status: Status::from(&err),
                    body: ReplyBody::Empty,
                    close,
                }
            }
        }
    }

    fn execute(&self, request: &Request) -> Result<ReplyBody> {
        let store = &self.store;
        let owner = self.owner;
        let body = match request {
            Request::Compute(computation) => ReplyBody::Integer(store.compute(computation, owner)?),
            Request::GetVar { name } => {
                ReplyBody::Name(store.lookup_reference(name, owner)?.into_string())
            }
            Request::SetVar { name, target } => {
                store.insert_reference(name, target, owner)?;
                ReplyBody::Empty
            }
            Request::DelVar { name } => {
                store.remove(name, owner)?;
                ReplyBody::Empty
            }
            Request::ReadFile { path, offset, len } => {
                ReplyBody::Bytes(files::read_range(Path::new(path), *offset, *len)?)
            }
            Request::WriteFile { path, offset, data } => {
                files::write_range(Path::new(path), *offset, data)?;
                ReplyBody::Empty
            }
            Request::CreateFile { path } => {
                files::create(Path::new(path))?;
                ReplyBody::Empty
            }
            Request::FileSize { path } => ReplyBody::Integer(files::size(Path::new(path))?),
            Request::Dump { path } => {
                store.dump(Path::new(path), owner)?;
                ReplyBody::Empty
            }
            Request::Load { path } => {
                store.load(Path::new(path), owner)?;
                ReplyBody::Empty
            }
            Request::Clear { magic } if *magic == CLEAR_MAGIC => {
                store.clear(owner)?;
                ReplyBody::Empty
            }
            Request::Clear { magic } => {
                return Err(Error::Protocol(format!(
                    "clear requires magic {CLEAR_MAGIC:#010x}, got {magic:#010x}"
                )));
            }
            Request::Unsupported { op } => {
                return Err(Error::Protocol(format!("unsupported opcode {op:#06x}")));
            }
        };
        Ok(body)
    }
}

/// Requests whose I/O errors can only come from the persistence log.
fn writes_log(request: &Request) -> bool {
    match request {
        Request::Compute(computation) => computation.dest.is_some(),
        Request::SetVar { .. } | Request::DelVar { .. } | Request::Clear { .. } => true,
        _ => false,
    }
}
