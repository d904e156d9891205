//! Map(K, V): per-row offsets like Array, then all keys, then all values.

use async_trait::async_trait;
use std::ops::Range;

use super::array::{decode_offsets, encode_offsets};
use super::{Column, impl_as_any};
use crate::error::{Error, Result, TypeError};
use crate::protocol::buffer::Buffer;
use crate::protocol::reader::Reader;
use crate::types::ColumnType;

#[derive(Debug)]
pub struct ColMap {
    offsets: Vec<u64>,
    keys: Box<dyn Column>,
    values: Box<dyn Column>,
}

impl ColMap {
    pub fn new(keys: impl Column + 'static, values: impl Column + 'static) -> Self {
        Self::boxed(Box::new(keys), Box::new(values))
    }

    pub fn boxed(keys: Box<dyn Column>, values: Box<dyn Column>) -> Self {
        Self {
            offsets: Vec::new(),
            keys,
            values,
        }
    }

    pub fn keys<T: Column + 'static>(&self) -> Option<&T> {
        self.keys.downcast_ref::<T>()
    }

    pub fn keys_mut<T: Column + 'static>(&mut self) -> Option<&mut T> {
        self.keys.downcast_mut::<T>()
    }

    pub fn values<T: Column + 'static>(&self) -> Option<&T> {
        self.values.downcast_ref::<T>()
    }

    pub fn values_mut<T: Column + 'static>(&mut self) -> Option<&mut T> {
        self.values.downcast_mut::<T>()
    }

    /// Close a row holding every pair appended since the previous row.
    pub fn end_row(&mut self) {
        self.offsets.push(self.keys.rows() as u64);
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Pair positions of `row` in the key and value columns.
    pub fn row_range(&self, row: usize) -> Option<Range<usize>> {
        let end = *self.offsets.get(row)? as usize;
        let start = match row {
            0 => 0,
            _ => self.offsets[row - 1] as usize,
        };
        Some(start..end)
    }
}

#[async_trait]
impl Column for ColMap {
    fn column_type(&self) -> ColumnType {
        ColumnType::map(&self.keys.column_type(), &self.values.column_type())
    }

    fn rows(&self) -> usize {
        self.offsets.len()
    }

    fn reset(&mut self) {
        self.offsets.clear();
        self.keys.reset();
        self.values.reset();
    }

    fn encode_column(&self, buf: &mut Buffer) {
        encode_offsets(&self.offsets, buf);
        self.keys.encode_column(buf);
        self.values.encode_column(buf);
    }

    async fn decode_column(&mut self, r: &mut Reader<'_>, rows: usize) -> Result<()> {
        if rows == 0 {
            return Ok(());
        }
        let base = self.keys.rows() as u64;
        let pairs = decode_offsets(r, rows, base, &mut self.offsets).await?;
        self.keys.decode_column(r, pairs).await?;
        self.values.decode_column(r, pairs).await
    }

    fn prepare(&mut self) -> Result<()> {
        let last = self.offsets.last().copied().unwrap_or(0);
        if self.keys.rows() != self.values.rows() || last != self.keys.rows() as u64 {
            return Err(Error::InvalidInput(format!(
                "{}: {} keys, {} values, rows cover {}",
                self.column_type(),
                self.keys.rows(),
                self.values.rows(),
                last
            )));
        }
        self.keys.prepare()?;
        self.values.prepare()
    }

    fn encode_state(&self, buf: &mut Buffer) {
        self.keys.encode_state(buf);
        self.values.encode_state(buf);
    }

    async fn decode_state(&mut self, r: &mut Reader<'_>) -> Result<()> {
        self.keys.decode_state(r).await?;
        self.values.decode_state(r).await
    }

    fn infer(&mut self, t: &ColumnType) -> std::result::Result<(), TypeError> {
        let expr = t.parse()?;
        if expr.name != "Map" || expr.args.len() != 2 {
            return self.column_type().check(t);
        }
        self.keys.infer(&ColumnType::new(expr.args[0]))?;
        self.values.infer(&ColumnType::new(expr.args[1]))
    }

    impl_as_any!();
}
