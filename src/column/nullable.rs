//! Nullable(T): one null-flag byte per row, then the full inner column.
//! Null rows still carry a placeholder value in the inner column.

use async_trait::async_trait;

use super::{Column, impl_as_any};
use crate::error::{DecodeError, Error, Result, TypeError};
use crate::protocol::buffer::Buffer;
use crate::protocol::reader::Reader;
use crate::types::ColumnType;

#[derive(Debug)]
pub struct ColNullable {
    nulls: Vec<u8>,
    values: Box<dyn Column>,
}

impl ColNullable {
    pub fn new(values: impl Column + 'static) -> Self {
        Self::boxed(Box::new(values))
    }

    pub fn boxed(values: Box<dyn Column>) -> Self {
        Self {
            nulls: Vec::new(),
            values,
        }
    }

    pub fn values(&self) -> &dyn Column {
        self.values.as_ref()
    }

    pub fn values_mut(&mut self) -> &mut dyn Column {
        self.values.as_mut()
    }

    pub fn inner<T: Column + 'static>(&self) -> Option<&T> {
        self.values.downcast_ref::<T>()
    }

    pub fn inner_mut<T: Column + 'static>(&mut self) -> Option<&mut T> {
        self.values.downcast_mut::<T>()
    }

    /// Record the null flag for the value most recently appended to the inner column.
    pub fn push_row(&mut self, is_null: bool) {
        self.nulls.push(is_null as u8);
    }

    pub fn is_null(&self, row: usize) -> Option<bool> {
        self.nulls.get(row).map(|&b| b == 1)
    }

    pub fn nulls(&self) -> &[u8] {
        &self.nulls
    }
}

#[async_trait]
impl Column for ColNullable {
    fn column_type(&self) -> ColumnType {
        ColumnType::nullable(&self.values.column_type())
    }

    fn rows(&self) -> usize {
        self.nulls.len()
    }

    fn reset(&mut self) {
        self.nulls.clear();
        self.values.reset();
    }

    fn encode_column(&self, buf: &mut Buffer) {
        buf.put_raw(&self.nulls);
        self.values.encode_column(buf);
    }

    async fn decode_column(&mut self, r: &mut Reader<'_>, rows: usize) -> Result<()> {
        let start = self.nulls.len();
        let offset = r.offset();
        r.read_into_vec(rows, &mut self.nulls).await?;
        if let Some(i) = self.nulls[start..].iter().position(|&b| b > 1) {
            return Err(DecodeError::InvalidBool {
                offset: offset + i as u64,
                value: self.nulls[start + i],
            }
            .into());
        }
        self.values.decode_column(r, rows).await
    }

    fn prepare(&mut self) -> Result<()> {
        if self.nulls.len() != self.values.rows() {
            return Err(Error::InvalidInput(format!(
                "{}: {} null flags for {} values",
                self.column_type(),
                self.nulls.len(),
                self.values.rows()
            )));
        }
        self.values.prepare()
    }

    fn encode_state(&self, buf: &mut Buffer) {
        self.values.encode_state(buf);
    }

    async fn decode_state(&mut self, r: &mut Reader<'_>) -> Result<()> {
        self.values.decode_state(r).await
    }

    fn infer(&mut self, t: &ColumnType) -> std::result::Result<(), TypeError> {
        match t.elem("Nullable") {
            Some(inner) => self.values.infer(&inner),
            None => self.column_type().check(t),
        }
    }

    impl_as_any!();
}
