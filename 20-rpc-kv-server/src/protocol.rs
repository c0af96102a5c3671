//! Binary request/reply framing.
//!
//! Every request starts with a header (`op: u16`, `id: [u8; 4]`) followed by
//! an opcode-specific payload. Every reply starts with the same `id` and a
//! one-byte status; a payload follows only when the status is [`Status::OK`].
//! Multi-byte integers are big-endian.
//!
//! | op            | payload                                      | reply payload      |
//! |---------------|----------------------------------------------|--------------------|
//! | `0x0101..05`  | operands A, B (name or `i64`), result name?  | `i64`              |
//! | `0x0108`      | name                                         | name               |
//! | `0x0109`      | name, target name                            |                    |
//! | `0x010f`      | name                                         |                    |
//! | `0x0201`      | path, offset `u64`, length `u16`             | `u16` + bytes      |
//! | `0x0202`      | path, offset `u64`, length `u16`, bytes      |                    |
//! | `0x0210`      | path                                         |                    |
//! | `0x0220`      | path                                         | `i64`              |
//! | `0x0301`      | path                                         |                    |
//! | `0x0302`      | path                                         |                    |
//! | `0x0310`      | magic `u32` = `0x0badbad0`                   |                    |
//!
//! For math opcodes the low nibble selects the operation and the flag bits
//! 0x10 / 0x20 / 0x40 mark A, B and the result as variables; 0x80 resolves
//! variable operands recursively. Names are `u8` length + bytes, paths are
//! `u16` length + bytes.

use std::fmt;
use std::io::{self, ErrorKind, Read, Write};

use crate::arith::{ArithOp, Computation, Operand};
use crate::error::Error;

/// Opcode values.
pub mod op {
    pub const MATH_FAMILY: u16 = 0x0100;
    pub const GET_VAR: u16 = 0x0108;
    pub const SET_VAR: u16 = 0x0109;
    pub const DEL_VAR: u16 = 0x010f;
    pub const READ: u16 = 0x0201;
    pub const WRITE: u16 = 0x0202;
    pub const CREATE: u16 = 0x0210;
    pub const FILE_SIZE: u16 = 0x0220;
    pub const DUMP: u16 = 0x0301;
    pub const LOAD: u16 = 0x0302;
    pub const CLEAR: u16 = 0x0310;

    pub const VAR_A: u16 = 0x10;
    pub const VAR_B: u16 = 0x20;
    pub const VAR_RESULT: u16 = 0x40;
    pub const RECURSIVE: u16 = 0x80;
}

/// Payload that must accompany a clear request.
pub const CLEAR_MAGIC: u32 = 0x0bad_bad0;

/// Correlation token echoed back in the reply.
pub type RequestId = [u8; 4];

/// One-byte reply status. Values follow errno numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u8);

impl Status {
    pub const OK: Status = Status(0);
    pub const NOT_FOUND: Status = Status(2);
    pub const IO: Status = Status(5);
    pub const PERMISSION_DENIED: Status = Status(13);
    pub const TYPE_MISMATCH: Status = Status(14);
    pub const ALREADY_EXISTS: Status = Status(17);
    pub const INVALID: Status = Status(22);
    pub const DEADLOCK: Status = Status(35);
    pub const TOO_DEEP: Status = Status(40);
    pub const OVERFLOW: Status = Status(75);
    pub const UNSUPPORTED: Status = Status(95);

    pub fn is_ok(self) -> bool {
        self == Status::OK
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidKey(_)
            | Error::InvalidValue(_)
            | Error::InvalidFormat { .. }
            | Error::DivideByZero
            | Error::Protocol(_) => Status::INVALID,
            Error::NotFound(_) => Status::NOT_FOUND,
            Error::TypeMismatch { .. } => Status::TYPE_MISMATCH,
            Error::CycleOrTooDeep { .. } => Status::TOO_DEEP,
            Error::Overflow => Status::OVERFLOW,
            Error::Io(io) => io_status(io),
            Error::LockOwnership { .. } => Status::IO,
            Error::LockOrder { .. } => Status::DEADLOCK,
        }
    }
}

fn io_status(err: &io::Error) -> Status {
    if let Some(code) = err.raw_os_error().and_then(|code| u8::try_from(code).ok()) {
        return Status(code);
    }
    match err.kind() {
        ErrorKind::NotFound => Status::NOT_FOUND,
        ErrorKind::AlreadyExists => Status::ALREADY_EXISTS,
        ErrorKind::PermissionDenied => Status::PERMISSION_DENIED,
        ErrorKind::InvalidInput | ErrorKind::InvalidData => Status::INVALID,
        _ => Status::IO,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub op: u16,
    pub id: RequestId,
}

/// A decoded request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Compute(Computation),
    GetVar { name: String },
    SetVar { name: String, target: String },
    DelVar { name: String },
    ReadFile { path: String, offset: u64, len: u16 },
    WriteFile { path: String, offset: u64, data: Vec<u8> },
    CreateFile { path: String },
    FileSize { path: String },
    Dump { path: String },
    Load { path: String },
    Clear { magic: u32 },
    /// An opcode this server does not know; its payload (if any) is not read.
    Unsupported { op: u16 },
}

impl Request {
    /// Opcode for this request.
    pub fn op(&self) -> u16 {
        match self {
            Request::Compute(c) => {
                let mut op = op::MATH_FAMILY | u16::from(c.op.code());
                if c.lhs.variable().is_some() {
                    op |= op::VAR_A;
                }
                if c.rhs.variable().is_some() {
                    op |= op::VAR_B;
                }
                if c.dest.is_some() {
                    op |= op::VAR_RESULT;
                }
                if c.recursive {
                    op |= op::RECURSIVE;
                }
                op
            }
            Request::GetVar { .. } => op::GET_VAR,
            Request::SetVar { .. } => op::SET_VAR,
            Request::DelVar { .. } => op::DEL_VAR,
            Request::ReadFile { .. } => op::READ,
            Request::WriteFile { .. } => op::WRITE,
            Request::CreateFile { .. } => op::CREATE,
            Request::FileSize { .. } => op::FILE_SIZE,
            Request::Dump { .. } => op::DUMP,
            Request::Load { .. } => op::LOAD,
            Request::Clear { .. } => op::CLEAR,
            Request::Unsupported { op } => *op,
        }
    }

    /// Encodes header and payload.
    pub fn encode(&self, id: RequestId) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.op().to_be_bytes());
        buf.extend_from_slice(&id);
        match self {
            Request::Compute(c) => {
                put_operand(&mut buf, &c.lhs)?;
                put_operand(&mut buf, &c.rhs)?;
                if let Some(dest) = &c.dest {
                    put_name(&mut buf, dest)?;
                }
            }
            Request::GetVar { name } | Request::DelVar { name } => put_name(&mut buf, name)?,
            Request::SetVar { name, target } => {
                put_name(&mut buf, name)?;
                put_name(&mut buf, target)?;
            }
            Request::ReadFile { path, offset, len } => {
                put_path(&mut buf, path)?;
                buf.extend_from_slice(&offset.to_be_bytes());
                buf.extend_from_slice(&len.to_be_bytes());
            }
            Request::WriteFile { path, offset, data } => {
                put_path(&mut buf, path)?;
                buf.extend_from_slice(&offset.to_be_bytes());
                let len = u16::try_from(data.len())
                    .map_err(|_| invalid_input("write payload longer than 65535 bytes"))?;
                buf.extend_from_slice(&len.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Request::CreateFile { path }
            | Request::FileSize { path }
            | Request::Dump { path }
            | Request::Load { path } => put_path(&mut buf, path)?,
            Request::Clear { magic } => buf.extend_from_slice(&magic.to_be_bytes()),
            Request::Unsupported { .. } => {}
        }
        Ok(buf)
    }
}

/// Reads a request header. Returns `Ok(None)` if the peer closed the
/// connection before sending another request.
pub fn read_header<R: Read>(reader: &mut R) -> io::Result<Option<Header>> {
    let mut op = [0u8; 2];
    let first = loop {
        match reader.read(&mut op[..1]) {
            Ok(n) => break n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    };
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut op[1..])?;
    let mut id = [0u8; 4];
    reader.read_exact(&mut id)?;
    Ok(Some(Header {
        op: u16::from_be_bytes(op),
        id,
    }))
}

/// Reads the payload for `op`.
pub fn read_request<R: Read>(reader: &mut R, op: u16) -> io::Result<Request> {
    let request = match op {
        op::GET_VAR => Request::GetVar {
            name: read_name(reader)?,
        },
        op::SET_VAR => Request::SetVar {
            name: read_name(reader)?,
            target: read_name(reader)?,
        },
        op::DEL_VAR => Request::DelVar {
            name: read_name(reader)?,
        },
        op::READ => Request::ReadFile {
            path: read_path(reader)?,
            offset: read_u64(reader)?,
            len: read_u16(reader)?,
        },
        op::WRITE => {
            let path = read_path(reader)?;
            let offset = read_u64(reader)?;
            let len = read_u16(reader)?;
            let mut data = vec![0u8; usize::from(len)];
            reader.read_exact(&mut data)?;
            Request::WriteFile { path, offset, data }
        }
        op::CREATE => Request::CreateFile {
            path: read_path(reader)?,
        },
        op::FILE_SIZE => Request::FileSize {
            path: read_path(reader)?,
        },
        op::DUMP => Request::Dump {
            path: read_path(reader)?,
        },
        op::LOAD => Request::Load {
            path: read_path(reader)?,
        },
        op::CLEAR => Request::Clear {
            magic: read_u32(reader)?,
        },
        _ if op >> 8 == op::MATH_FAMILY >> 8 => match ArithOp::from_code((op & 0x0f) as u8) {
            Some(arith) => Request::Compute(read_computation(reader, op, arith)?),
            None => Request::Unsupported { op },
        },
        _ => Request::Unsupported { op },
    };
    Ok(request)
}

fn read_computation<R: Read>(reader: &mut R, op: u16, arith: ArithOp) -> io::Result<Computation> {
    let lhs = read_operand(reader, op & op::VAR_A != 0)?;
    let rhs = read_operand(reader, op & op::VAR_B != 0)?;
    let dest = if op & op::VAR_RESULT != 0 {
        Some(read_name(reader)?)
    } else {
        None
    };
    Ok(Computation {
        op: arith,
        lhs,
        rhs,
        dest,
        recursive: op & op::RECURSIVE != 0,
    })
}

fn read_operand<R: Read>(reader: &mut R, is_variable: bool) -> io::Result<Operand> {
    if is_variable {
        Ok(Operand::Variable(read_name(reader)?))
    } else {
        Ok(Operand::Literal(read_i64(reader)?))
    }
}

/// Reply payload sent after an OK status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Empty,
    Integer(i64),
    Name(String),
    Bytes(Vec<u8>),
}

/// Writes a complete reply and flushes it.
pub fn write_reply<W: Write>(
    writer: &mut W,
    id: RequestId,
    status: Status,
    body: &ReplyBody,
) -> io::Result<()> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&id);
    buf.push(status.0);
    if status.is_ok() {
        match body {
            ReplyBody::Empty => {}
            ReplyBody::Integer(n) => buf.extend_from_slice(&n.to_be_bytes()),
            ReplyBody::Name(name) => put_name(&mut buf, name)?,
            ReplyBody::Bytes(bytes) => {
                let len = u16::try_from(bytes.len())
                    .map_err(|_| invalid_input("reply payload longer than 65535 bytes"))?;
                buf.extend_from_slice(&len.to_be_bytes());
                buf.extend_from_slice(bytes);
            }
        }
    }
    writer.write_all(&buf)?;
    writer.flush()
}

/// Reads the fixed part of a reply.
pub fn read_reply_header<R: Read>(reader: &mut R) -> io::Result<(RequestId, Status)> {
    let mut id = [0u8; 4];
    reader.read_exact(&mut id)?;
    Ok((id, Status(read_u8(reader)?)))
}

pub fn read_u8<R: Read>(reader: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn read_u16<R: Read>(reader: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

pub fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

pub fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

pub fn read_i64<R: Read>(reader: &mut R) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

/// Reads a `u8`-length-prefixed name. Bytes that are not UTF-8 are replaced,
/// which makes the name fail key validation later.
pub fn read_name<R: Read>(reader: &mut R) -> io::Result<String> {
    let len = read_u8(reader)?;
    read_string(reader, usize::from(len))
}

/// Reads a `u16`-length-prefixed path.
pub fn read_path<R: Read>(reader: &mut R) -> io::Result<String> {
    let len = read_u16(reader)?;
    read_string(reader, usize::from(len))
}

/// Reads a `u16`-length-prefixed byte string.
pub fn read_bytes<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = read_u16(reader)?;
    let mut buf = vec![0u8; usize::from(len)];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_string<R: Read>(reader: &mut R, len: usize) -> io::Result<String> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn put_name(buf: &mut Vec<u8>, name: &str) -> io::Result<()> {
    let len = u8::try_from(name.len()).map_err(|_| invalid_input("name longer than 255 bytes"))?;
    buf.push(len);
    buf.extend_from_slice(name.as_bytes());
    Ok(())
}

fn put_path(buf: &mut Vec<u8>, path: &str) -> io::Result<()> {
    let len =
        u16::try_from(path.len()).map_err(|_| invalid_input("path longer than 65535 bytes"))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(path.as_bytes());
    Ok(())
}

fn put_operand(buf: &mut Vec<u8>, operand: &Operand) -> io::Result<()> {
    match operand {
        Operand::Literal(n) => {
            buf.extend_from_slice(&n.to_be_bytes());
            Ok(())
        }
        Operand::Variable(name) => put_name(buf, name),
    }
}

fn invalid_input(message: &'static str) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, message)
}
