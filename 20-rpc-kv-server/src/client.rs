//! Blocking client for the server's wire protocol.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};

use thiserror::Error;

use crate::arith::{ArithOp, Computation};
use crate::protocol::{self, CLEAR_MAGIC, ReplyBody, Request, Status};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("server replied with status {0}")]
    Status(Status),
    #[error("reply id {got:?} does not match request id {expected:?}")]
    IdMismatch { expected: [u8; 4], got: [u8; 4] },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ClientError {
    /// The reply status, when the server answered with an error.
    pub fn status(&self) -> Option<Status> {
        match self {
            ClientError::Status(status) => Some(*status),
            _ => None,
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// One connection to a server. Requests are sent one at a time.
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    next_id: u32,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
            next_id: 0,
        })
    }

    /// Sends `request` and reads the reply payload it implies.
    pub fn request(&mut self, request: &Request) -> ClientResult<ReplyBody> {
        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id.to_be_bytes();
        self.writer.write_all(&request.encode(id)?)?;
        self.writer.flush()?;

        let (got, status) = protocol::read_reply_header(&mut self.reader)?;
        if got != id {
            return Err(ClientError::IdMismatch { expected: id, got });
        }
        if !status.is_ok() {
            return Err(ClientError::Status(status));
        }
        let body = match request {
            Request::Compute(_) | Request::FileSize { .. } => {
                ReplyBody::Integer(protocol::read_i64(&mut self.reader)?)
            }
            Request::GetVar { .. } => ReplyBody::Name(protocol::read_name(&mut self.reader)?),
            Request::ReadFile { .. } => ReplyBody::Bytes(protocol::read_bytes(&mut self.reader)?),
            _ => ReplyBody::Empty,
        };
        Ok(body)
    }

    pub fn compute(&mut self, computation: Computation) -> ClientResult<i64> {
        match self.request(&Request::Compute(computation))? {
            ReplyBody::Integer(n) => Ok(n),
            _ => Err(unexpected_body()),
        }
    }

    /// Stores an integer variable by computing `value + 0` into it.
    pub fn set_integer(&mut self, name: &str, value: i64) -> ClientResult<()> {
        self.compute(Computation::new(ArithOp::Add, value, 0i64).store_in(name))?;
        Ok(())
    }

    /// Reads an integer variable by computing `name + 0`.
    pub fn get_integer(&mut self, name: &str) -> ClientResult<i64> {
        self.compute(Computation::new(ArithOp::Add, name, 0i64))
    }

    /// Name that the reference variable `name` points at.
    pub fn get_var(&mut self, name: &str) -> ClientResult<String> {
        match self.request(&Request::GetVar { name: name.into() })? {
            ReplyBody::Name(target) => Ok(target),
            _ => Err(unexpected_body()),
        }
    }

    pub fn set_var(&mut self, name: &str, target: &str) -> ClientResult<()> {
        self.request(&Request::SetVar {
            name: name.into(),
            target: target.into(),
        })?;
        Ok(())
    }

    pub fn del_var(&mut self, name: &str) -> ClientResult<()> {
        self.request(&Request::DelVar { name: name.into() })?;
        Ok(())
    }

    pub fn read_file(&mut self, path: &str, offset: u64, len: u16) -> ClientResult<Vec<u8>> {
        let request = Request::ReadFile {
            path: path.into(),
            offset,
            len,
        };
        match self.request(&request)? {
            ReplyBody::Bytes(bytes) => Ok(bytes),
            _ => Err(unexpected_body()),
        }
    }

    pub fn write_file(&mut self, path: &str, offset: u64, data: &[u8]) -> ClientResult<()> {
        self.request(&Request::WriteFile {
            path: path.into(),
            offset,
            data: data.to_vec(),
        })?;
        Ok(())
    }

    pub fn create_file(&mut self, path: &str) -> ClientResult<()> {
        self.request(&Request::CreateFile { path: path.into() })?;
        Ok(())
    }

    pub fn file_size(&mut self, path: &str) -> ClientResult<i64> {
        match self.request(&Request::FileSize { path: path.into() })? {
            ReplyBody::Integer(n) => Ok(n),
            _ => Err(unexpected_body()),
        }
    }

    pub fn dump(&mut self, path: &str) -> ClientResult<()> {
        self.request(&Request::Dump { path: path.into() })?;
        Ok(())
    }

    pub fn load(&mut self, path: &str) -> ClientResult<()> {
        self.request(&Request::Load { path: path.into() })?;
        Ok(())
    }

    pub fn clear(&mut self) -> ClientResult<()> {
        self.request(&Request::Clear { magic: CLEAR_MAGIC })?;
        Ok(())
    }
}

fn unexpected_body() -> ClientError {
    ClientError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        "reply payload does not match the request",
    ))
}
