//! Type-string parser.
//!
//! Handles `Name`, `Name(Arg1, Arg2, ...)` and field lists `name Type, name Type`.
//! Arguments are split on top-level commas only: parentheses nest and
//! single-quoted literals (enum names) may contain commas and parentheses.

use nom::{
    IResult, Parser,
    bytes::complete::take_while1,
    character::complete::{char, i64 as nom_i64, multispace0},
    sequence::preceded,
};

use crate::error::TypeError;

/// `Name(args...)` split into its parts. Arguments are trimmed slices of the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeExpr<'a> {
    pub name: &'a str,
    pub args: Vec<&'a str>,
    /// `Name()` and `Name` differ: the former is a parameterized type with no arguments.
    pub parenthesized: bool,
}

/// A `name Type` entry of a named tuple or Nested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field<'a> {
    pub name: &'a str,
    pub type_str: &'a str,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(is_ident_char).parse(input)
}

/// Backquoted or bare field name.
fn field_name(input: &str) -> Option<(&str, &str)> {
    if let Some(rest) = input.strip_prefix('`') {
        let end = rest.find('`')?;
        return Some((&rest[end + 1..], &rest[..end]));
    }
    identifier(input).ok()
}

/// Parse `Name` or `Name(args)`.
pub fn parse_type(input: &str) -> Result<TypeExpr<'_>, TypeError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(TypeError::malformed(input, "empty type"));
    }
    let (rest, name) =
        identifier(s).map_err(|_| TypeError::malformed(input, "expected a type name"))?;
    let rest = rest.trim_start();
    if rest.is_empty() {
        return Ok(TypeExpr {
            name,
            args: Vec::new(),
            parenthesized: false,
        });
    }
    let inner = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| TypeError::malformed(input, "expected '(' ... ')' after type name"))?;
    let args = split_args(inner).map_err(|reason| TypeError::malformed(input, reason))?;
    Ok(TypeExpr {
        name,
        args,
        parenthesized: true,
    })
}

/// Split on commas at depth zero. Tolerates whitespace and one trailing comma;
/// rejects unbalanced parentheses, unterminated quotes and empty fields.
pub fn split_args(s: &str) -> Result<Vec<&str>, String> {
    let mut out = Vec::new();
    let mut depth: usize = 0;
    let mut start = 0;
    let mut in_quote = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if in_quote {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '\'' => in_quote = false,
                _ => {}
            }
            continue;
        }
        match c {
            '\'' => in_quote = true,
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| format!("unbalanced ')' at {}", i))?;
            }
            ',' if depth == 0 => {
                let field = s[start..i].trim();
                if field.is_empty() {
                    return Err(format!("empty argument before ',' at {}", i));
                }
                out.push(field);
                start = i + 1;
            }
            _ => {}
        }
    }
    if in_quote {
        return Err("unterminated quote".to_string());
    }
    if depth != 0 {
        return Err("unbalanced '('".to_string());
    }
    let last = s[start..].trim();
    if !last.is_empty() {
        out.push(last);
    }
    Ok(out)
}

/// Parse a single `name Type` field.
pub fn parse_field(s: &str) -> Result<Field<'_>, TypeError> {
    let trimmed = s.trim();
    let (rest, name) =
        field_name(trimmed).ok_or_else(|| TypeError::malformed(s, "expected a field name"))?;
    let type_str = rest.trim();
    if type_str.is_empty() || rest.len() == rest.trim_start().len() {
        return Err(TypeError::malformed(s, format!("field {:?} has no type", name)));
    }
    Ok(Field { name, type_str })
}

/// Parse `name Type, name Type, ...`.
pub fn parse_fields(s: &str) -> Result<Vec<Field<'_>>, TypeError> {
    let parts = split_args(s).map_err(|reason| TypeError::malformed(s, reason))?;
    if parts.is_empty() {
        return Err(TypeError::malformed(s, "no fields"));
    }
    parts.into_iter().map(parse_field).collect()
}

/// Whether every argument looks like `name Type` (named tuple) rather than a bare type.
pub fn looks_named(args: &[&str]) -> bool {
    !args.is_empty()
        && args.iter().all(|a| match field_name(a) {
            Some((rest, name)) => {
                let rest_trim = rest.trim_start();
                rest.len() != rest_trim.len()
                    && !rest_trim.is_empty()
                    && !rest_trim.starts_with('(')
                    && (a.trim_start().starts_with('`') || parse_type(name).is_ok())
                    && parse_type(rest_trim).is_ok()
            }
            None => false,
        })
}

/// Read a single-quoted literal with backslash escapes. Returns (rest, unescaped).
fn quoted(input: &str) -> Option<(&str, String)> {
    let body = input.strip_prefix('\'')?;
    let mut out = String::new();
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                let (_, e) = chars.next()?;
                out.push(match e {
                    'n' => '\n',
                    't' => '\t',
                    '0' => '\0',
                    other => other,
                });
            }
            '\'' => return Some((&body[i + 1..], out)),
            other => out.push(other),
        }
    }
    None
}

fn enum_value(input: &str) -> IResult<&str, i64> {
    preceded((multispace0, char('='), multispace0), nom_i64).parse(input)
}

/// Parse one `'name' = value` enum entry.
pub fn parse_enum_entry(s: &str) -> Result<(String, i64), TypeError> {
    let t = s.trim();
    let (rest, name) =
        quoted(t).ok_or_else(|| TypeError::malformed(s, "expected a quoted enum name"))?;
    let (rest, value) =
        enum_value(rest).map_err(|_| TypeError::malformed(s, "expected '= <integer>'"))?;
    if !rest.trim().is_empty() {
        return Err(TypeError::malformed(s, "trailing characters after enum value"));
    }
    Ok((name, value))
}

/// Quote `s` as a single-quoted literal, escaping `\` and `'`.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}
