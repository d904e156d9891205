//! Nothing: the type of `NULL` literals. One placeholder byte per row.

use async_trait::async_trait;

use super::{Column, impl_as_any};
use crate::error::Result;
use crate::protocol::buffer::Buffer;
use crate::protocol::reader::Reader;
use crate::types::ColumnType;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColNothing {
    rows: usize,
}

impl ColNothing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self) {
        self.rows += 1;
    }
}

#[async_trait]
impl Column for ColNothing {
    fn column_type(&self) -> ColumnType {
        ColumnType::new("Nothing")
    }

    fn rows(&self) -> usize {
        self.rows
    }

    fn reset(&mut self) {
        self.rows = 0;
    }

    fn encode_column(&self, buf: &mut Buffer) {
        buf.buf.resize(buf.buf.len() + self.rows, b'0');
    }

    async fn decode_column(&mut self, r: &mut Reader<'_>, rows: usize) -> Result<()> {
        let mut skip = vec![0u8; rows.min(4096)];
        let mut left = rows;
        while left > 0 {
            let n = left.min(skip.len());
            r.read_full(&mut skip[..n]).await?;
            left -= n;
        }
        self.rows += rows;
        Ok(())
    }

    impl_as_any!();
}
