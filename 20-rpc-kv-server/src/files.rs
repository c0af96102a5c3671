//! File passthrough for the read/write/create/filesize opcodes.
//!
//! Paths are used as given, so relative paths resolve against the server's
//! working directory.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Reads `len` bytes starting at `offset`.
///
/// The whole range must lie inside the file.
pub fn read_range(path: &Path, offset: u64, len: u16) -> Result<Vec<u8>> {
    let mut file = fs::File::open(path)?;
    let size = file.metadata()?.len();
    let end = offset
        .checked_add(u64::from(len))
        .ok_or_else(|| out_of_range(path))?;
    if end > size {
        return Err(out_of_range(path));
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; usize::from(len)];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Writes `data` at `offset` into an existing file, extending it if needed.
pub fn write_range(path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    file.flush()?;
    Ok(())
}

/// Creates an empty file. Fails if anything already exists at `path`.
pub fn create(path: &Path) -> Result<()> {
    OpenOptions::new().write(true).create_new(true).open(path)?;
    Ok(())
}

pub fn size(path: &Path) -> Result<i64> {
    let len = fs::metadata(path)?.len();
    i64::try_from(len).map_err(|_| Error::Overflow)
}

fn out_of_range(path: &Path) -> Error {
    Error::Io(io::Error::new(
        ErrorKind::InvalidInput,
        format!("range outside of {}", path.display()),
    ))
}
