//! Checked integer arithmetic for the math opcodes.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithOp {
    /// Maps the low nibble of a math opcode (1..=5) to an operation.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ArithOp::Add),
            2 => Some(ArithOp::Sub),
            3 => Some(ArithOp::Mul),
            4 => Some(ArithOp::Div),
            5 => Some(ArithOp::Mod),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ArithOp::Add => 1,
            ArithOp::Sub => 2,
            ArithOp::Mul => 3,
            ArithOp::Div => 4,
            ArithOp::Mod => 5,
        }
    }

    /// Applies the operation. Never wraps.
    pub fn apply(self, a: i64, b: i64) -> Result<i64> {
        let result = match self {
            ArithOp::Add => a.checked_add(b),
            ArithOp::Sub => a.checked_sub(b),
            ArithOp::Mul => a.checked_mul(b),
            ArithOp::Div | ArithOp::Mod if b == 0 => return Err(Error::DivideByZero),
            ArithOp::Div => a.checked_div(b),
            ArithOp::Mod => a.checked_rem(b),
        };
        result.ok_or(Error::Overflow)
    }
}

/// One side of a computation: a literal or the name of an integer variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Literal(i64),
    Variable(String),
}

impl Operand {
    pub fn variable(&self) -> Option<&str> {
        match self {
            Operand::Variable(name) => Some(name),
            Operand::Literal(_) => None,
        }
    }
}

impl From<i64> for Operand {
    fn from(n: i64) -> Self {
        Operand::Literal(n)
    }
}

impl From<&str> for Operand {
    fn from(name: &str) -> Self {
        Operand::Variable(name.to_string())
    }
}

/// `dest = lhs op rhs`, evaluated atomically by
/// [`SyncStore::compute`](crate::store::SyncStore::compute).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Computation {
    pub op: ArithOp,
    pub lhs: Operand,
    pub rhs: Operand,
    /// Variable receiving the result, if any.
    pub dest: Option<String>,
    /// Resolve variable operands through chains of references.
    pub recursive: bool,
}

impl Computation {
    pub fn new(op: ArithOp, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> Self {
        Self {
            op,
            lhs: lhs.into(),
            rhs: rhs.into(),
            dest: None,
            recursive: false,
        }
    }

    pub fn store_in(mut self, dest: impl Into<String>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    /// Every variable the computation touches, operands first.
    pub fn variables(&self) -> Vec<&str> {
        self.lhs
            .variable()
            .into_iter()
            .chain(self.rhs.variable())
            .chain(self.dest.as_deref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_operations() {
        assert_eq!(ArithOp::Add.apply(2, 3).unwrap(), 5);
        assert_eq!(ArithOp::Sub.apply(2, 3).unwrap(), -1);
        assert_eq!(ArithOp::Mul.apply(-4, 3).unwrap(), -12);
        assert_eq!(ArithOp::Div.apply(7, 2).unwrap(), 3);
        assert_eq!(ArithOp::Div.apply(-7, 2).unwrap(), -3);
        assert_eq!(ArithOp::Mod.apply(-7, 2).unwrap(), -1);
    }

    #[test]
    fn overflow_is_an_error() {
        assert!(matches!(ArithOp::Add.apply(i64::MAX, 1), Err(Error::Overflow)));
        assert!(matches!(ArithOp::Sub.apply(i64::MIN, 1), Err(Error::Overflow)));
        assert!(matches!(ArithOp::Mul.apply(i64::MAX, 2), Err(Error::Overflow)));
        assert!(matches!(ArithOp::Mul.apply(i64::MIN, -1), Err(Error::Overflow)));
        assert!(matches!(ArithOp::Div.apply(i64::MIN, -1), Err(Error::Overflow)));
        assert!(matches!(ArithOp::Mod.apply(i64::MIN, -1), Err(Error::Overflow)));
    }

    #[test]
    fn zero_divisor() {
        assert!(matches!(ArithOp::Div.apply(1, 0), Err(Error::DivideByZero)));
        assert!(matches!(ArithOp::Mod.apply(1, 0), Err(Error::DivideByZero)));
    }

    #[test]
    fn codes_round_trip() {
        for code in 1..=5 {
            assert_eq!(ArithOp::from_code(code).unwrap().code(), code);
        }
        assert!(ArithOp::from_code(0).is_none());
        assert!(ArithOp::from_code(6).is_none());
    }

    #[test]
    fn variables_lists_operands_then_destination() {
        let c = Computation::new(ArithOp::Add, "a", 4i64).store_in("c");
        assert_eq!(c.variables(), vec!["a", "c"]);
        let literal = Computation::new(ArithOp::Add, 1i64, 2i64);
        assert!(literal.variables().is_empty());
    }
}
