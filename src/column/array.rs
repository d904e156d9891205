//! Array(T): cumulative end offsets followed by the flattened elements.

use async_trait::async_trait;
use std::ops::Range;

use super::{Column, MAX_NESTED_ELEMENTS, impl_as_any, reserve_bounded};
use crate::error::{DecodeError, Error, Result, TypeError};
use crate::protocol::buffer::Buffer;
use crate::protocol::reader::Reader;
use crate::types::ColumnType;

#[derive(Debug)]
pub struct ColArray {
    offsets: Vec<u64>,
    data: Box<dyn Column>,
}

impl ColArray {
    pub fn new(data: impl Column + 'static) -> Self {
        Self::boxed(Box::new(data))
    }

    pub fn boxed(data: Box<dyn Column>) -> Self {
        Self {
            offsets: Vec::new(),
            data,
        }
    }

    pub fn data(&self) -> &dyn Column {
        self.data.as_ref()
    }

    /// Elements appended here belong to the next row once `end_row` is called.
    pub fn data_mut(&mut self) -> &mut dyn Column {
        self.data.as_mut()
    }

    pub fn inner<T: Column + 'static>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    pub fn inner_mut<T: Column + 'static>(&mut self) -> Option<&mut T> {
        self.data.downcast_mut::<T>()
    }

    /// Close a row holding every element appended since the previous row.
    pub fn end_row(&mut self) {
        self.offsets.push(self.data.rows() as u64);
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Element positions of `row` in the inner column.
    pub fn row_range(&self, row: usize) -> Option<Range<usize>> {
        let end = *self.offsets.get(row)? as usize;
        let start = match row {
            0 => 0,
            _ => self.offsets[row - 1] as usize,
        };
        Some(start..end)
    }

    fn last_offset(&self) -> u64 {
        self.offsets.last().copied().unwrap_or(0)
    }
}

/// Read `rows` cumulative offsets, rebased onto `base`. Returns the number of
/// elements they cover.
pub(crate) async fn decode_offsets(
    r: &mut Reader<'_>,
    rows: usize,
    base: u64,
    out: &mut Vec<u64>,
) -> Result<usize> {
    reserve_bounded(out, rows);
    let mut prev = 0u64;
    for _ in 0..rows {
        let offset = r.offset();
        let end = r.u64().await?;
        if end < prev {
            return Err(DecodeError::invalid(format!(
                "offset {} at byte {} is below previous offset {}",
                end, offset, prev
            ))
            .into());
        }
        if end > MAX_NESTED_ELEMENTS {
            return Err(DecodeError::Bound {
                what: "nested elements",
                value: end,
                max: MAX_NESTED_ELEMENTS,
            }
            .into());
        }
        out.push(base + end);
        prev = end;
    }
    Ok(prev as usize)
}

pub(crate) fn encode_offsets(offsets: &[u64], buf: &mut Buffer) {
    for &o in offsets {
        buf.put_u64(o);
    }
}

#[async_trait]
impl Column for ColArray {
    fn column_type(&self) -> ColumnType {
        ColumnType::array(&self.data.column_type())
    }

    fn rows(&self) -> usize {
        self.offsets.len()
    }

    fn reset(&mut self) {
        self.offsets.clear();
        self.data.reset();
    }

    fn encode_column(&self, buf: &mut Buffer) {
        encode_offsets(&self.offsets, buf);
        self.data.encode_column(buf);
    }

    async fn decode_column(&mut self, r: &mut Reader<'_>, rows: usize) -> Result<()> {
        if rows == 0 {
            return Ok(());
        }
        let base = self.data.rows() as u64;
        let elements = decode_offsets(r, rows, base, &mut self.offsets).await?;
        self.data.decode_column(r, elements).await
    }

    fn prepare(&mut self) -> Result<()> {
        if self.last_offset() != self.data.rows() as u64 {
            return Err(Error::InvalidInput(format!(
                "{}: {} elements appended but rows cover {}",
                self.column_type(),
                self.data.rows(),
                self.last_offset()
            )));
        }
        self.data.prepare()
    }

    fn encode_state(&self, buf: &mut Buffer) {
        self.data.encode_state(buf);
    }

    async fn decode_state(&mut self, r: &mut Reader<'_>) -> Result<()> {
        self.data.decode_state(r).await
    }

    fn infer(&mut self, t: &ColumnType) -> std::result::Result<(), TypeError> {
        match t.elem("Array") {
            Some(inner) => self.data.infer(&inner),
            None => self.column_type().check(t),
        }
    }

    impl_as_any!();
}
