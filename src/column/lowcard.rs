//! LowCardinality(T): a per-block dictionary plus one integer key per row.
//!
//! Wire layout:
//! - state: `u64` serialization version (1, shared dictionaries with additional keys)
//! - data: `u64` meta (key width in the low byte, flags above), `u64` dictionary
//!   rows, dictionary column, `u64` key rows, keys at the declared width
//!
//! Global dictionaries are not supported; every block must carry its own
//! dictionary as additional keys. For `LowCardinality(Nullable(T))` the
//! dictionary's first entry is a placeholder and key 0 means NULL.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use super::fixed::{ColFixed, HashablePrimitive};
use super::string::{ColFixedStr, ColStr};
use super::{Column, DECODE_CHUNK_ROWS, MAX_NESTED_ELEMENTS, impl_as_any, reserve_bounded};
use crate::error::{DecodeError, Error, Result, TypeError};
use crate::protocol::buffer::Buffer;
use crate::protocol::reader::Reader;
use crate::types::ColumnType;

/// Serialization version written in the column state.
const SHARED_DICTIONARIES_WITH_ADDITIONAL_KEYS: u64 = 1;

const KEY_WIDTH_MASK: u64 = 0xff;
const NEED_GLOBAL_DICTIONARY: u64 = 1 << 8;
const HAS_ADDITIONAL_KEYS: u64 = 1 << 9;
const NEED_UPDATE_DICTIONARY: u64 = 1 << 10;

/// Width of the per-row keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyWidth {
    U8 = 0,
    U16 = 1,
    U32 = 2,
    U64 = 3,
}

impl KeyWidth {
    /// Smallest width that can address a dictionary of `len` entries.
    pub fn for_len(len: usize) -> Self {
        let max = len.saturating_sub(1) as u64;
        if max <= u8::MAX as u64 {
            KeyWidth::U8
        } else if max <= u16::MAX as u64 {
            KeyWidth::U16
        } else if max <= u32::MAX as u64 {
            KeyWidth::U32
        } else {
            KeyWidth::U64
        }
    }

    pub fn from_meta(meta: u64) -> Result<Self> {
        match meta & KEY_WIDTH_MASK {
            0 => Ok(KeyWidth::U8),
            1 => Ok(KeyWidth::U16),
            2 => Ok(KeyWidth::U32),
            3 => Ok(KeyWidth::U64),
            other => Err(DecodeError::invalid(format!("unknown LowCardinality key width {}", other)).into()),
        }
    }

    pub fn size(self) -> usize {
        1 << (self as usize)
    }

    fn put(self, key: u64, buf: &mut Buffer) {
        match self {
            KeyWidth::U8 => buf.put_u8(key as u8),
            KeyWidth::U16 => buf.put_u16(key as u16),
            KeyWidth::U32 => buf.put_u32(key as u32),
            KeyWidth::U64 => buf.put_u64(key),
        }
    }

    fn read(self, b: &[u8]) -> u64 {
        let mut le = [0u8; 8];
        le[..b.len()].copy_from_slice(b);
        u64::from_le_bytes(le)
    }
}

/// Columns usable as a LowCardinality dictionary.
pub trait LcIndex: Column + Sized + 'static {
    type Value: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Empty column of the same wire type.
    fn empty_like(&self) -> Self;

    /// Entry stored in the NULL slot of a nullable dictionary.
    fn placeholder(&self) -> Self::Value;

    /// Precondition: `row < self.rows()`.
    fn value_at(&self, row: usize) -> Self::Value;

    fn push_value(&mut self, v: &Self::Value);
}

impl LcIndex for ColStr {
    type Value = Vec<u8>;

    fn empty_like(&self) -> Self {
        ColStr::new()
    }

    fn placeholder(&self) -> Vec<u8> {
        Vec::new()
    }

    fn value_at(&self, row: usize) -> Vec<u8> {
        self.get(row).map(<[u8]>::to_vec).unwrap_or_default()
    }

    fn push_value(&mut self, v: &Vec<u8>) {
        self.append(v);
    }
}

impl LcIndex for ColFixedStr {
    type Value = Vec<u8>;

    fn empty_like(&self) -> Self {
        ColFixedStr::new(self.size())
    }

    fn placeholder(&self) -> Vec<u8> {
        vec![0; self.size()]
    }

    fn value_at(&self, row: usize) -> Vec<u8> {
        self.get(row).map(<[u8]>::to_vec).unwrap_or_default()
    }

    fn push_value(&mut self, v: &Vec<u8>) {
        self.push_truncated(v);
    }
}

impl<T: HashablePrimitive> LcIndex for ColFixed<T> {
    type Value = T;

    fn empty_like(&self) -> Self {
        ColFixed::with_type(self.column_type())
    }

    fn placeholder(&self) -> T {
        T::ZERO
    }

    fn value_at(&self, row: usize) -> T {
        self.get(row).unwrap_or(T::ZERO)
    }

    fn push_value(&mut self, v: &T) {
        self.append(*v);
    }
}

#[derive(Debug)]
pub struct ColLowCardinality<C: LcIndex> {
    index: C,
    keys: Vec<u64>,
    lookup: HashMap<C::Value, u64>,
    nullable: bool,
    key_width: KeyWidth,
}

impl ColLowCardinality<ColStr> {
    /// `LowCardinality(String)`.
    pub fn strings() -> Self {
        Self::new(ColStr::new())
    }

    pub fn get_str(&self, row: usize) -> Option<&str> {
        let key = *self.keys.get(row)?;
        if self.nullable && key == 0 {
            return None;
        }
        self.index.get_str(key as usize)
    }
}

impl<C: LcIndex> ColLowCardinality<C> {
    /// Dictionary over `index`, which must be empty.
    pub fn new(index: C) -> Self {
        let mut c = Self {
            index,
            keys: Vec::new(),
            lookup: HashMap::new(),
            nullable: false,
            key_width: KeyWidth::U8,
        };
        c.index.reset();
        c
    }

    /// `LowCardinality(Nullable(T))`.
    pub fn nullable(index: C) -> Self {
        let mut c = Self::new(index);
        c.nullable = true;
        let zero = c.index.placeholder();
        c.index.push_value(&zero);
        c
    }

    /// Column from an already-built dictionary and keys.
    pub fn from_parts(index: C, keys: Vec<u64>, nullable: bool) -> Result<Self> {
        if let Some(bad) = keys.iter().find(|&&k| k >= index.rows() as u64) {
            return Err(Error::InvalidInput(format!(
                "key {} outside dictionary of {} entries",
                bad,
                index.rows()
            )));
        }
        if nullable && index.rows() == 0 {
            return Err(Error::InvalidInput(
                "nullable dictionary needs a placeholder entry".to_string(),
            ));
        }
        let mut lookup = HashMap::new();
        let skip = nullable as usize;
        for i in skip..index.rows() {
            lookup.entry(index.value_at(i)).or_insert(i as u64);
        }
        Ok(Self {
            key_width: KeyWidth::for_len(index.rows()),
            index,
            keys,
            lookup,
            nullable,
        })
    }

    pub fn append(&mut self, v: impl Into<C::Value>) {
        let v = v.into();
        let key = match self.lookup.get(&v) {
            Some(&k) => k,
            None => {
                let k = self.index.rows() as u64;
                self.index.push_value(&v);
                self.lookup.insert(v, k);
                k
            }
        };
        self.keys.push(key);
    }

    pub fn append_null(&mut self) -> Result<()> {
        if !self.nullable {
            return Err(Error::InvalidInput(format!(
                "NULL appended to {}",
                self.column_type()
            )));
        }
        self.keys.push(0);
        Ok(())
    }

    /// Value of `row`; `None` past the end or for NULL.
    pub fn get(&self, row: usize) -> Option<C::Value> {
        let key = *self.keys.get(row)?;
        if self.nullable && key == 0 {
            return None;
        }
        Some(self.index.value_at(key as usize))
    }

    pub fn is_null(&self, row: usize) -> bool {
        self.nullable && self.keys.get(row) == Some(&0)
    }

    pub fn index(&self) -> &C {
        &self.index
    }

    pub fn keys(&self) -> &[u64] {
        &self.keys
    }

    pub fn key_width(&self) -> KeyWidth {
        self.key_width
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    fn inner_type(&self) -> ColumnType {
        let t = self.index.column_type();
        if self.nullable {
            ColumnType::nullable(&t)
        } else {
            t
        }
    }

    /// Rebuild the dictionary with only referenced entries, in first-seen order.
    fn compact(&mut self) {
        let mut index = self.index.empty_like();
        let mut remap: Vec<Option<u64>> = vec![None; self.index.rows()];
        let mut lookup = HashMap::new();
        if self.nullable {
            let zero = index.placeholder();
            index.push_value(&zero);
            if let Some(slot) = remap.first_mut() {
                *slot = Some(0);
            }
        }
        for key in &mut self.keys {
            let old = *key as usize;
            let new = match remap[old] {
                Some(k) => k,
                None => {
                    let v = self.index.value_at(old);
                    let k = match lookup.get(&v) {
                        Some(&k) => k,
                        None => {
                            let k = index.rows() as u64;
                            index.push_value(&v);
                            lookup.insert(v, k);
                            k
                        }
                    };
                    remap[old] = Some(k);
                    k
                }
            };
            *key = new;
        }
        self.index = index;
        self.lookup = lookup;
    }

    fn is_compact(&self) -> bool {
        let base = self.nullable as usize;
        let mut seen = vec![false; self.index.rows()];
        let mut distinct = 0;
        for &k in &self.keys {
            let k = k as usize;
            if k >= base && !seen[k] {
                seen[k] = true;
                distinct += 1;
            }
        }
        distinct + base == self.index.rows()
    }
}

#[async_trait]
impl<C: LcIndex> Column for ColLowCardinality<C> {
    fn column_type(&self) -> ColumnType {
        ColumnType::low_cardinality(&self.inner_type())
    }

    fn rows(&self) -> usize {
        self.keys.len()
    }

    fn reset(&mut self) {
        self.index.reset();
        self.keys.clear();
        self.lookup.clear();
        if self.nullable {
            let zero = self.index.placeholder();
            self.index.push_value(&zero);
        }
    }

    fn encode_column(&self, buf: &mut Buffer) {
        // Zero rows carry no dictionary; the decoder reads nothing for them.
        if self.keys.is_empty() {
            return;
        }
        let width = self.key_width.max(KeyWidth::for_len(self.index.rows()));
        buf.put_u64(width as u64 | HAS_ADDITIONAL_KEYS | NEED_UPDATE_DICTIONARY);
        buf.put_u64(self.index.rows() as u64);
        self.index.encode_column(buf);
        buf.put_u64(self.keys.len() as u64);
        for &k in &self.keys {
            width.put(k, buf);
        }
    }

    async fn decode_column(&mut self, r: &mut Reader<'_>, rows: usize) -> Result<()> {
        if rows == 0 {
            return Ok(());
        }
        let meta = r.u64().await?;
        if meta & NEED_GLOBAL_DICTIONARY != 0 {
            return Err(DecodeError::invalid("LowCardinality global dictionaries are not supported").into());
        }
        if meta & HAS_ADDITIONAL_KEYS == 0 {
            return Err(DecodeError::invalid("LowCardinality block without a dictionary").into());
        }
        let width = KeyWidth::from_meta(meta)?;

        let dict_rows = r.u64().await?;
        if dict_rows > MAX_NESTED_ELEMENTS {
            return Err(DecodeError::Bound {
                what: "LowCardinality dictionary rows",
                value: dict_rows,
                max: MAX_NESTED_ELEMENTS,
            }
            .into());
        }
        let dict_rows = dict_rows as usize;
        let base = self.index.rows() as u64;
        self.index.decode_column(r, dict_rows).await?;
        let skip = self.nullable as usize;
        for i in skip..dict_rows {
            let v = self.index.value_at(base as usize + i);
            self.lookup.entry(v).or_insert(base + i as u64);
        }

        let key_rows = r.u64().await?;
        if key_rows != rows as u64 {
            return Err(DecodeError::invalid(format!(
                "LowCardinality has {} keys for {} rows",
                key_rows, rows
            ))
            .into());
        }
        reserve_bounded(&mut self.keys, rows);
        let size = width.size();
        let mut chunk = vec![0u8; size * rows.min(DECODE_CHUNK_ROWS)];
        let mut left = rows;
        while left > 0 {
            let n = left.min(DECODE_CHUNK_ROWS);
            let start = r.offset();
            let bytes = &mut chunk[..n * size];
            r.read_full(bytes).await?;
            for (i, b) in bytes.chunks_exact(size).enumerate() {
                let key = width.read(b);
                if key >= dict_rows as u64 {
                    return Err(DecodeError::invalid(format!(
                        "key {} at byte {} outside dictionary of {} entries",
                        key,
                        start + (i * size) as u64,
                        dict_rows
                    ))
                    .into());
                }
                self.keys.push(if self.nullable && key == 0 { 0 } else { base + key });
            }
            left -= n;
        }
        self.key_width = self.key_width.max(width);
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        if !self.is_compact() {
            self.compact();
        }
        self.key_width = KeyWidth::for_len(self.index.rows());
        self.index.prepare()
    }

    fn encode_state(&self, buf: &mut Buffer) {
        buf.put_u64(SHARED_DICTIONARIES_WITH_ADDITIONAL_KEYS);
    }

    async fn decode_state(&mut self, r: &mut Reader<'_>) -> Result<()> {
        let offset = r.offset();
        let version = r.u64().await?;
        if version != SHARED_DICTIONARIES_WITH_ADDITIONAL_KEYS {
            return Err(DecodeError::invalid(format!(
                "LowCardinality serialization version {} at byte {}",
                version, offset
            ))
            .into());
        }
        Ok(())
    }

    fn infer(&mut self, t: &ColumnType) -> std::result::Result<(), TypeError> {
        let Some(inner) = t.elem("LowCardinality") else {
            return self.column_type().check(t);
        };
        match inner.elem("Nullable") {
            Some(value) if self.nullable => self.index.infer(&value),
            None if !self.nullable => self.index.infer(&inner),
            _ => self.column_type().check(t),
        }
    }

    impl_as_any!();
}
