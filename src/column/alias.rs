//! Named aliases over another column's wire format (the geo types).

use async_trait::async_trait;

use super::{Column, impl_as_any};
use crate::error::{Result, TypeError};
use crate::protocol::buffer::Buffer;
use crate::protocol::reader::Reader;
use crate::types::ColumnType;

#[derive(Debug)]
pub struct ColAlias {
    name: ColumnType,
    inner: Box<dyn Column>,
}

impl ColAlias {
    pub fn new(name: impl Into<ColumnType>, inner: Box<dyn Column>) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }

    pub fn inner(&self) -> &dyn Column {
        self.inner.as_ref()
    }

    pub fn inner_mut(&mut self) -> &mut dyn Column {
        self.inner.as_mut()
    }

    pub fn get<T: Column + 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    pub fn get_mut<T: Column + 'static>(&mut self) -> Option<&mut T> {
        self.inner.downcast_mut::<T>()
    }
}

#[async_trait]
impl Column for ColAlias {
    fn column_type(&self) -> ColumnType {
        self.name.clone()
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
        self.name.check(t)
    }

    impl_as_any!();
}
