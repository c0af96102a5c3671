//! Values stored under a key.

use std::fmt;

use crate::error::{Error, Result};
use crate::key::Key;

/// A stored value: either a signed integer or the name of another variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Reference(Key),
}

impl Value {
    /// Builds a reference value, rejecting referents that are not valid keys.
    pub fn reference(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        match Key::new(name) {
            Ok(key) => Ok(Value::Reference(key)),
            Err(Error::InvalidKey(name)) => Err(Error::InvalidValue(name)),
            Err(other) => Err(other),
        }
    }

    /// Name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Integer(_) => INTEGER,
            Value::Reference(_) => REFERENCE,
        }
    }

    /// Parses the right-hand side of a `key=value` record.
    ///
    /// A leading ASCII letter makes the text a reference; anything else must
    /// be a decimal `i64`. Returns `None` when neither applies.
    pub fn parse_text(text: &str) -> Option<Result<Self>> {
        let first = text.bytes().next()?;
        if first.is_ascii_alphabetic() {
            return Some(Value::reference(text));
        }
        text.parse::<i64>().ok().map(|n| Ok(Value::Integer(n)))
    }
}

pub(crate) const INTEGER: &str = "integer";
pub(crate) const REFERENCE: &str = "reference";

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "{n}"),
            Value::Reference(key) => write!(f, "{key}"),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_text_picks_variant_from_first_character() {
        assert_eq!(Value::parse_text("42").unwrap().unwrap(), Value::Integer(42));
        assert_eq!(Value::parse_text("-7").unwrap().unwrap(), Value::Integer(-7));
        assert_eq!(
            Value::parse_text("other").unwrap().unwrap(),
            Value::Reference(Key::new("other").unwrap())
        );
    }

    #[test]
    fn parse_text_rejects_garbage() {
        assert!(Value::parse_text("").is_none());
        assert!(Value::parse_text("12ab").is_none());
        assert!(Value::parse_text("_x").is_none());
        assert!(Value::parse_text("99999999999999999999").is_none());
    }

    #[test]
    fn bad_referent_is_invalid_value() {
        assert!(matches!(
            Value::parse_text("a~b"),
            Some(Err(Error::InvalidValue(name))) if name == "a~b"
        ));
    }

    #[test]
    fn display_matches_record_format() {
        assert_eq!(Value::Integer(i64::MIN).to_string(), "-9223372036854775808");
        assert_eq!(Value::reference("next").unwrap().to_string(), "next");
    }
}
