//! Tuple and Nested.
//!
//! A tuple is its element columns written one after another, each covering
//! every row. Nested is an array of a named tuple under its own type name.

use async_trait::async_trait;

use super::{ColArray, Column, impl_as_any, new_column};
use crate::error::{Error, Result, TypeError};
use crate::protocol::buffer::Buffer;
use crate::protocol::reader::Reader;
use crate::types::{ColumnType, parse_fields, parse_type, parser::looks_named};

#[derive(Debug)]
pub struct ColTuple {
    names: Option<Vec<String>>,
    columns: Vec<Box<dyn Column>>,
}

fn field_name(name: &str) -> String {
    let plain = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if plain {
        name.to_string()
    } else {
        format!("`{}`", name)
    }
}

/// Text between the outer parentheses of `Name(...)`.
fn body(t: &ColumnType) -> &str {
    let s = t.as_str().trim();
    match (s.find('('), s.rfind(')')) {
        (Some(a), Some(b)) if a < b => &s[a + 1..b],
        _ => "",
    }
}

impl ColTuple {
    pub fn new(columns: Vec<Box<dyn Column>>) -> Self {
        Self {
            names: None,
            columns,
        }
    }

    pub fn named(fields: Vec<(String, Box<dyn Column>)>) -> Self {
        let (names, columns) = fields.into_iter().unzip();
        Self {
            names: Some(names),
            columns,
        }
    }

    /// Build from a `Tuple(...)` type string.
    pub fn from_type(t: &ColumnType) -> std::result::Result<Self, TypeError> {
        let expr = t.parse()?;
        if expr.name != "Tuple" || expr.args.is_empty() {
            return Err(TypeError::Unsupported(t.to_string()));
        }
        if looks_named(&expr.args) {
            let fields = parse_fields(body(t))?;
            let mut out = Vec::with_capacity(fields.len());
            for f in fields {
                out.push((f.name.to_string(), new_column(f.type_str)?));
            }
            Ok(Self::named(out))
        } else {
            let columns = expr
                .args
                .iter()
                .map(|a| new_column(a))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(Self::new(columns))
        }
    }

    pub fn names(&self) -> Option<&[String]> {
        self.names.as_deref()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, i: usize) -> Option<&dyn Column> {
        self.columns.get(i).map(|c| c.as_ref())
    }

    pub fn get<T: Column + 'static>(&self, i: usize) -> Option<&T> {
        self.columns.get(i)?.downcast_ref::<T>()
    }

    pub fn get_mut<T: Column + 'static>(&mut self, i: usize) -> Option<&mut T> {
        self.columns.get_mut(i)?.downcast_mut::<T>()
    }

    /// Element column by field name.
    pub fn field<T: Column + 'static>(&self, name: &str) -> Option<&T> {
        let i = self.names.as_ref()?.iter().position(|n| n == name)?;
        self.get(i)
    }

    fn element_types(&self) -> Vec<String> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, c)| match &self.names {
                Some(names) => format!("{} {}", field_name(&names[i]), c.column_type()),
                None => c.column_type().into_string(),
            })
            .collect()
    }
}

#[async_trait]
impl Column for ColTuple {
    fn column_type(&self) -> ColumnType {
        ColumnType::new(format!("Tuple({})", self.element_types().join(", ")))
    }

    fn rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.rows())
    }

    fn reset(&mut self) {
        for c in &mut self.columns {
            c.reset();
        }
    }

    fn encode_column(&self, buf: &mut Buffer) {
        for c in &self.columns {
            c.encode_column(buf);
        }
    }

    async fn decode_column(&mut self, r: &mut Reader<'_>, rows: usize) -> Result<()> {
        for c in &mut self.columns {
            c.decode_column(r, rows).await?;
        }
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        let rows = self.rows();
        for (i, c) in self.columns.iter_mut().enumerate() {
            if c.rows() != rows {
                return Err(Error::InvalidInput(format!(
                    "tuple element {} has {} rows, element 0 has {}",
                    i,
                    c.rows(),
                    rows
                )));
            }
            c.prepare()?;
        }
        Ok(())
    }

    fn encode_state(&self, buf: &mut Buffer) {
        for c in &self.columns {
            c.encode_state(buf);
        }
    }

    async fn decode_state(&mut self, r: &mut Reader<'_>) -> Result<()> {
        for c in &mut self.columns {
            c.decode_state(r).await?;
        }
        Ok(())
    }

    fn infer(&mut self, t: &ColumnType) -> std::result::Result<(), TypeError> {
        let expr = parse_type(t.as_str())?;
        if expr.name != "Tuple" || expr.args.len() != self.columns.len() {
            return self.column_type().check(t);
        }
        if looks_named(&expr.args) {
            let fields = parse_fields(body(t))?;
            if let Some(names) = &self.names {
                if names.iter().zip(&fields).any(|(n, f)| n != f.name) {
                    return self.column_type().check(t);
                }
            }
            for (c, f) in self.columns.iter_mut().zip(&fields) {
                c.infer(&ColumnType::new(f.type_str))?;
            }
            self.names = Some(fields.iter().map(|f| f.name.to_string()).collect());
        } else {
            if self.names.is_some() {
                return self.column_type().check(t);
            }
            for (c, a) in self.columns.iter_mut().zip(&expr.args) {
                c.infer(&ColumnType::new(*a))?;
            }
        }
        Ok(())
    }

    impl_as_any!();
}

/// `Nested(name Type, ...)`: wire-identical to `Array(Tuple(name Type, ...))`.
#[derive(Debug)]
pub struct ColNested {
    inner: ColArray,
}

impl ColNested {
    pub fn new(fields: Vec<(String, Box<dyn Column>)>) -> Self {
        Self {
            inner: ColArray::new(ColTuple::named(fields)),
        }
    }

    pub fn from_type(t: &ColumnType) -> std::result::Result<Self, TypeError> {
        let expr = t.parse()?;
        if expr.name != "Nested" {
            return Err(TypeError::Unsupported(t.to_string()));
        }
        let fields = parse_fields(body(t))?;
        let mut out = Vec::with_capacity(fields.len());
        for f in fields {
            out.push((f.name.to_string(), new_column(f.type_str)?));
        }
        Ok(Self::new(out))
    }

    pub fn array(&self) -> &ColArray {
        &self.inner
    }

    pub fn array_mut(&mut self) -> &mut ColArray {
        &mut self.inner
    }

    pub fn tuple(&self) -> Option<&ColTuple> {
        self.inner.inner::<ColTuple>()
    }

    pub fn tuple_mut(&mut self) -> Option<&mut ColTuple> {
        self.inner.inner_mut::<ColTuple>()
    }

    pub fn end_row(&mut self) {
        self.inner.end_row();
    }
}

#[async_trait]
impl Column for ColNested {
    fn column_type(&self) -> ColumnType {
        let fields = self
            .tuple()
            .map(|t| t.element_types().join(", "))
            .unwrap_or_default();
        ColumnType::new(format!("Nested({})", fields))
    }

    fn rows(&self) -> usize {
        self.inner.rows()
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn encode_column(&self, buf: &mut Buffer) {
        self.inner.encode_column(buf);
    }

    async fn decode_column(&mut self, r: &mut Reader<'_>, rows: usize) -> Result<()> {
        self.inner.decode_column(r, rows).await
    }

    fn prepare(&mut self) -> Result<()> {
        self.inner.prepare()
    }

    fn encode_state(&self, buf: &mut Buffer) {
        self.inner.encode_state(buf);
    }

    async fn decode_state(&mut self, r: &mut Reader<'_>) -> Result<()> {
        self.inner.decode_state(r).await
    }

    fn infer(&mut self, t: &ColumnType) -> std::result::Result<(), TypeError> {
        let other = ColNested::from_type(t)?;
        if other.column_type().same_as(&self.column_type()) {
            Ok(())
        } else {
            self.column_type().check(t)
        }
    }

    impl_as_any!();
}
