//! Column type names.
//!
//! `ColumnType` is the canonical, possibly parameterized wire name of a column
//! (`UInt64`, `Array(Nullable(String))`, `DateTime64(3, 'UTC')`). Composite
//! columns build their names from their children, so a decoded column always
//! reports the name it would write back.

pub mod parser;

pub use parser::{Field, TypeExpr, parse_enum_entry, parse_fields, parse_type, quote, split_args};

use crate::error::TypeError;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ColumnType(String);

impl ColumnType {
    pub fn new(s: impl Into<String>) -> Self {
        ColumnType(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn array(inner: &ColumnType) -> Self {
        ColumnType(format!("Array({})", inner.0))
    }

    pub fn nullable(inner: &ColumnType) -> Self {
        ColumnType(format!("Nullable({})", inner.0))
    }

    pub fn low_cardinality(inner: &ColumnType) -> Self {
        ColumnType(format!("LowCardinality({})", inner.0))
    }

    pub fn map(key: &ColumnType, value: &ColumnType) -> Self {
        ColumnType(format!("Map({}, {})", key.0, value.0))
    }

    /// Name before any parenthesis: `Array` for `Array(UInt8)`.
    pub fn base(&self) -> &str {
        let s = self.0.trim();
        match s.find('(') {
            Some(i) => s[..i].trim_end(),
            None => s,
        }
    }

    pub fn parse(&self) -> Result<TypeExpr<'_>, TypeError> {
        parse_type(&self.0)
    }

    /// The single argument of a wrapper (`Array(T)` -> `T`), if this is `wrapper(...)`.
    pub fn elem(&self, wrapper: &str) -> Option<ColumnType> {
        let expr = self.parse().ok()?;
        if expr.name == wrapper && expr.args.len() == 1 {
            Some(ColumnType::new(expr.args[0]))
        } else {
            None
        }
    }

    /// Whitespace outside quotes removed; two types are the same wire type iff
    /// their normalized forms are equal.
    pub fn normalized(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        let mut in_quote = false;
        let mut escaped = false;
        let mut pending_space = false;
        for c in self.0.trim().chars() {
            if in_quote {
                out.push(c);
                match c {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '\'' => in_quote = false,
                    _ => {}
                }
                continue;
            }
            if c.is_whitespace() {
                pending_space = true;
                continue;
            }
            // Keep a single space between identifiers ("name Type" in named tuples).
            if pending_space
                && out.chars().last().is_some_and(|p| p.is_alphanumeric() || p == '_' || p == '`')
                && (c.is_alphanumeric() || c == '_' || c == '`')
            {
                out.push(' ');
            }
            pending_space = false;
            if c == '\'' {
                in_quote = true;
            }
            out.push(c);
        }
        out
    }

    /// Same wire type, ignoring formatting.
    pub fn same_as(&self, other: &ColumnType) -> bool {
        self.0 == other.0 || self.normalized() == other.normalized()
    }

    /// `Ok` when `other` names the same type, `Conflict` otherwise.
    pub fn check(&self, other: &ColumnType) -> Result<(), TypeError> {
        if self.same_as(other) {
            Ok(())
        } else {
            Err(TypeError::Conflict {
                have: self.0.clone(),
                want: other.0.clone(),
            })
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ColumnType {
    fn from(s: &str) -> Self {
        ColumnType::new(s)
    }
}

impl From<String> for ColumnType {
    fn from(s: String) -> Self {
        ColumnType(s)
    }
}

impl AsRef<str> for ColumnType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_round_trip() {
        let t = ColumnType::array(&ColumnType::nullable(&ColumnType::low_cardinality(
            &"String".into(),
        )));
        assert_eq!(t.as_str(), "Array(Nullable(LowCardinality(String)))");
        assert_eq!(t.base(), "Array");
        assert_eq!(
            t.elem("Array").map(|e| e.into_string()),
            Some("Nullable(LowCardinality(String))".to_string())
        );
        assert_eq!(t.elem("Nullable"), None);
    }

    #[test]
    fn test_same_as_ignores_formatting() {
        let a = ColumnType::new("Map(String,Array( UInt8 ))");
        let b = ColumnType::new("Map(String, Array(UInt8))");
        assert!(a.same_as(&b));
        assert!(a.check(&b).is_ok());

        let named = ColumnType::new("Tuple(a  UInt8, b String)");
        assert_eq!(named.normalized(), "Tuple(a UInt8,b String)");

        let e1 = ColumnType::new("Enum8('a b' = 1)");
        let e2 = ColumnType::new("Enum8('ab' = 1)");
        assert!(!e1.same_as(&e2));
        assert!(matches!(e1.check(&e2), Err(TypeError::Conflict { .. })));
    }
}
