//! Line codec shared by the persistence log, `dump` and `load`.
//!
//! ```text
//! key=value      insert or overwrite
//! ~key=          remove
//! ```

use std::fmt;

use crate::error::{Error, Result};
use crate::key::Key;
use crate::value::Value;

const REMOVE_MARKER: char = '~';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Put { key: Key, value: Value },
    Remove { key: Key },
}

impl Record {
    /// Parses one line. Blank lines yield `Ok(None)`.
    ///
    /// `line_no` is 1-based and only used for error reporting.
    pub fn parse(line: &str, line_no: usize) -> Result<Option<Self>> {
        let line = line.trim_start().trim_end_matches('\r');
        if line.is_empty() {
            return Ok(None);
        }

        let invalid = || Error::InvalidFormat {
            line: line_no,
            content: line.to_string(),
        };

        let (key, value) = line.split_once('=').ok_or_else(invalid)?;

        if let Some(removed) = key.strip_prefix(REMOVE_MARKER) {
            if !value.is_empty() {
                return Err(invalid());
            }
            return Ok(Some(Record::Remove {
                key: Key::new(removed)?,
            }));
        }

        let value = Value::parse_text(value).ok_or_else(invalid)??;
        Ok(Some(Record::Put {
            key: Key::new(key)?,
            value,
        }))
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::Put { key, value } => write!(f, "{key}={value}"),
            Record::Remove { key } => write!(f, "{REMOVE_MARKER}{key}="),
        }
    }
}
