//! Key syntax rules.
//!
//! A key starts with an ASCII letter and continues with letters, digits or
//! `_`. Keys are case-sensitive and shorter than [`MAX_KEY_LEN`] + 1 bytes.

use std::fmt;

use crate::error::{Error, Result};

/// Longest accepted key, in bytes.
pub const MAX_KEY_LEN: usize = 31;

/// A validated variable name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(String);

impl Key {
    /// Validates `name` and wraps it.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(Error::InvalidKey(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Returns whether `name` satisfies the key syntax.
pub fn is_valid(name: &str) -> bool {
    let bytes = name.as_bytes();
    match bytes.split_first() {
        Some((first, rest)) => {
            bytes.len() <= MAX_KEY_LEN
                && first.is_ascii_alphabetic()
                && rest.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'_')
        }
        None => false,
    }
}

/// Checks `name`, returning [`Error::InvalidKey`] when it is rejected.
pub fn validate(name: &str) -> Result<()> {
    if is_valid(name) {
        Ok(())
    } else {
        Err(Error::InvalidKey(name.to_string()))
    }
}
