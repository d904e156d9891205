//! String and FixedString.

use async_trait::async_trait;

use super::{Column, impl_as_any, reserve_bounded};
use crate::error::{DecodeError, Error, Result, TypeError};
use crate::protocol::buffer::Buffer;
use crate::protocol::reader::Reader;
use crate::types::ColumnType;

/// Length-prefixed strings, stored in one arena with per-row spans.
/// Decoded rows are UTF-8 validated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColStr {
    buf: Vec<u8>,
    spans: Vec<(usize, usize)>,
}

impl ColStr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values<S: AsRef<[u8]>>(values: impl IntoIterator<Item = S>) -> Self {
        let mut c = Self::new();
        for v in values {
            c.append(v);
        }
        c
    }

    pub fn append(&mut self, v: impl AsRef<[u8]>) {
        let start = self.buf.len();
        self.buf.extend_from_slice(v.as_ref());
        self.spans.push((start, self.buf.len()));
    }

    pub fn get(&self, row: usize) -> Option<&[u8]> {
        self.spans.get(row).map(|&(s, e)| &self.buf[s..e])
    }

    /// `None` past the last row or for appended bytes that are not UTF-8.
    pub fn get_str(&self, row: usize) -> Option<&str> {
        std::str::from_utf8(self.get(row)?).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.spans.iter().map(|&(s, e)| &self.buf[s..e])
    }

    /// Rows as UTF-8, lossy.
    pub fn to_strings(&self) -> Vec<String> {
        self.iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }
}

#[async_trait]
impl Column for ColStr {
    fn column_type(&self) -> ColumnType {
        ColumnType::new("String")
    }

    fn rows(&self) -> usize {
        self.spans.len()
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.spans.clear();
    }

    fn encode_column(&self, buf: &mut Buffer) {
        for v in self.iter() {
            buf.put_bytes(v);
        }
    }

    async fn decode_column(&mut self, r: &mut Reader<'_>, rows: usize) -> Result<()> {
        reserve_bounded(&mut self.spans, rows);
        for _ in 0..rows {
            let offset = r.offset();
            let (start, end) = r.bytes_into(&mut self.buf).await?;
            if std::str::from_utf8(&self.buf[start..end]).is_err() {
                self.buf.truncate(start);
                return Err(DecodeError::InvalidUtf8 { offset }.into());
            }
            self.spans.push((start, end));
        }
        Ok(())
    }

    impl_as_any!();
}

/// Rows of exactly `size` bytes; shorter values are zero-padded on append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColFixedStr {
    size: usize,
    buf: Vec<u8>,
    rows: usize,
}

impl ColFixedStr {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            buf: Vec::new(),
            rows: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Values longer than the fixed size are rejected.
    pub fn append(&mut self, v: impl AsRef<[u8]>) -> Result<()> {
        let v = v.as_ref();
        if v.len() > self.size {
            return Err(Error::InvalidInput(format!(
                "value of {} bytes does not fit FixedString({})",
                v.len(),
                self.size
            )));
        }
        self.push_truncated(v);
        Ok(())
    }

    /// Append `v` cut or zero-padded to the fixed size.
    pub(crate) fn push_truncated(&mut self, v: &[u8]) {
        let take = v.len().min(self.size);
        self.buf.extend_from_slice(&v[..take]);
        self.buf.resize(self.buf.len() + self.size - take, 0);
        self.rows += 1;
    }

    pub fn get(&self, row: usize) -> Option<&[u8]> {
        if row >= self.rows {
            return None;
        }
        self.buf.get(row * self.size..(row + 1) * self.size)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.rows).map(move |i| &self.buf[i * self.size..(i + 1) * self.size])
    }
}

#[async_trait]
impl Column for ColFixedStr {
    fn column_type(&self) -> ColumnType {
        ColumnType::new(format!("FixedString({})", self.size))
    }

    fn rows(&self) -> usize {
        self.rows
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.rows = 0;
    }

    fn encode_column(&self, buf: &mut Buffer) {
        buf.put_raw(&self.buf);
    }

    async fn decode_column(&mut self, r: &mut Reader<'_>, rows: usize) -> Result<()> {
        let n = rows.checked_mul(self.size).ok_or(DecodeError::Bound {
            what: "FixedString bytes",
            value: rows as u64,
            max: (usize::MAX / self.size.max(1)) as u64,
        })?;
        r.read_into_vec(n, &mut self.buf).await?;
        self.rows += rows;
        Ok(())
    }

    /// Takes its size from the wire when created without one.
    fn infer(&mut self, t: &ColumnType) -> std::result::Result<(), TypeError> {
        if self.size == 0 && self.rows == 0 && t.base() == "FixedString" {
            let expr = t.parse()?;
            let size = expr
                .args
                .first()
                .and_then(|a| a.parse::<usize>().ok())
                .filter(|&n| n > 0)
                .ok_or_else(|| TypeError::malformed(t.as_str(), "FixedString needs a positive size"))?;
            self.size = size;
            return Ok(());
        }
        self.column_type().check(t)
    }

    impl_as_any!();
}
