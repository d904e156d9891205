//! Enum8 / Enum16: integer codes on the wire, named through the type's mapping.

use async_trait::async_trait;
use std::collections::HashMap;

use super::{Column, DECODE_CHUNK_ROWS, impl_as_any, reserve_bounded};
use crate::error::{DecodeError, Error, Result, TypeError};
use crate::protocol::buffer::Buffer;
use crate::protocol::reader::Reader;
use crate::types::{ColumnType, parse_enum_entry, quote};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumWidth {
    Enum8,
    Enum16,
}

impl EnumWidth {
    fn name(self) -> &'static str {
        match self {
            EnumWidth::Enum8 => "Enum8",
            EnumWidth::Enum16 => "Enum16",
        }
    }

    fn size(self) -> usize {
        match self {
            EnumWidth::Enum8 => 1,
            EnumWidth::Enum16 => 2,
        }
    }

    fn range(self) -> (i64, i64) {
        match self {
            EnumWidth::Enum8 => (i8::MIN as i64, i8::MAX as i64),
            EnumWidth::Enum16 => (i16::MIN as i64, i16::MAX as i64),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColEnum {
    width: EnumWidth,
    entries: Vec<(String, i16)>,
    by_name: HashMap<String, i16>,
    by_value: HashMap<i16, usize>,
    values: Vec<i16>,
}

impl ColEnum {
    /// Enum with a mapping adopted later from the wire type.
    pub fn empty(width: EnumWidth) -> Self {
        Self {
            width,
            entries: Vec::new(),
            by_name: HashMap::new(),
            by_value: HashMap::new(),
            values: Vec::new(),
        }
    }

    pub fn new<S: Into<String>>(
        width: EnumWidth,
        entries: impl IntoIterator<Item = (S, i16)>,
    ) -> std::result::Result<Self, TypeError> {
        let mut c = Self::empty(width);
        for (name, value) in entries {
            c.add_entry(name.into(), value as i64)?;
        }
        if c.entries.is_empty() {
            return Err(TypeError::malformed(width.name(), "enum without entries"));
        }
        Ok(c)
    }

    /// Parse `Enum8('a' = 1, ...)` or `Enum16(...)`.
    pub fn from_type(t: &ColumnType) -> std::result::Result<Self, TypeError> {
        let expr = t.parse()?;
        let width = match expr.name {
            "Enum8" => EnumWidth::Enum8,
            "Enum16" => EnumWidth::Enum16,
            _ => return Err(TypeError::Unsupported(t.to_string())),
        };
        if expr.args.is_empty() {
            return Err(TypeError::malformed(t.as_str(), "enum without entries"));
        }
        let mut c = Self::empty(width);
        for arg in expr.args {
            let (name, value) = parse_enum_entry(arg)?;
            c.add_entry(name, value)
                .map_err(|e| TypeError::malformed(t.as_str(), e.to_string()))?;
        }
        Ok(c)
    }

    fn add_entry(&mut self, name: String, value: i64) -> std::result::Result<(), TypeError> {
        let (min, max) = self.width.range();
        if value < min || value > max {
            return Err(TypeError::malformed(
                &name,
                format!("value {} out of {} range", value, self.width.name()),
            ));
        }
        let value = value as i16;
        if self.by_name.contains_key(&name) || self.by_value.contains_key(&value) {
            return Err(TypeError::malformed(&name, "duplicate enum entry"));
        }
        self.by_name.insert(name.clone(), value);
        self.by_value.insert(value, self.entries.len());
        self.entries.push((name, value));
        Ok(())
    }

    pub fn entries(&self) -> &[(String, i16)] {
        &self.entries
    }

    pub fn append(&mut self, name: &str) -> Result<()> {
        let v = *self.by_name.get(name).ok_or_else(|| {
            Error::InvalidInput(format!("{:?} is not a member of {}", name, self.column_type()))
        })?;
        self.values.push(v);
        Ok(())
    }

    pub fn append_value(&mut self, v: i16) -> Result<()> {
        if !self.by_value.contains_key(&v) {
            return Err(Error::InvalidInput(format!(
                "{} is not a value of {}",
                v,
                self.column_type()
            )));
        }
        self.values.push(v);
        Ok(())
    }

    pub fn get(&self, row: usize) -> Option<&str> {
        let v = self.values.get(row)?;
        let i = *self.by_value.get(v)?;
        Some(self.entries[i].0.as_str())
    }

    pub fn values(&self) -> &[i16] {
        &self.values
    }
}

#[async_trait]
impl Column for ColEnum {
    fn column_type(&self) -> ColumnType {
        let entries: Vec<String> = self
            .entries
            .iter()
            .map(|(name, value)| format!("{} = {}", quote(name), value))
            .collect();
        ColumnType::new(format!("{}({})", self.width.name(), entries.join(", ")))
    }

    fn rows(&self) -> usize {
        self.values.len()
    }

    fn reset(&mut self) {
        self.values.clear();
    }

    fn encode_column(&self, buf: &mut Buffer) {
        for &v in &self.values {
            match self.width {
                EnumWidth::Enum8 => buf.put_i8(v as i8),
                EnumWidth::Enum16 => buf.put_i16(v),
            }
        }
    }

    async fn decode_column(&mut self, r: &mut Reader<'_>, rows: usize) -> Result<()> {
        reserve_bounded(&mut self.values, rows);
        let size = self.width.size();
        let mut chunk = vec![0u8; size * rows.min(DECODE_CHUNK_ROWS)];
        let mut left = rows;
        while left > 0 {
            let n = left.min(DECODE_CHUNK_ROWS);
            let bytes = &mut chunk[..n * size];
            r.read_full(bytes).await?;
            for b in bytes.chunks_exact(size) {
                let v = match self.width {
                    EnumWidth::Enum8 => b[0] as i8 as i16,
                    EnumWidth::Enum16 => i16::from_le_bytes([b[0], b[1]]),
                };
                if !self.by_value.contains_key(&v) {
                    return Err(DecodeError::UnknownEnumValue {
                        type_name: self.column_type().into_string(),
                        value: v as i64,
                    }
                    .into());
                }
                self.values.push(v);
            }
            left -= n;
        }
        Ok(())
    }

    /// An enum created without a mapping takes it from the wire type.
    fn infer(&mut self, t: &ColumnType) -> std::result::Result<(), TypeError> {
        if self.entries.is_empty() && t.base() == self.width.name() {
            let parsed = ColEnum::from_type(t)?;
            self.entries = parsed.entries;
            self.by_name = parsed.by_name;
            self.by_value = parsed.by_value;
            return Ok(());
        }
        let other = ColEnum::from_type(t)?;
        if other.width == self.width && other.entries == self.entries {
            Ok(())
        } else {
            self.column_type().check(t)
        }
    }

    impl_as_any!();
}
