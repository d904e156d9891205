//! Column codec family.
//!
//! Every wire type is a `Column`: a homogeneous run of `rows()` values that can
//! encode itself into a `Buffer` and decode (appending) from a `Reader`.
//! Composite kinds own their children as `Box<dyn Column>`; nesting is plain
//! composition, so `Array(Nullable(LowCardinality(String)))` is three wrappers
//! around a leaf.
//!
//! Columns are built either explicitly (caller constructs the graph) or from a
//! type string via `new_column` / `ColAuto`.

pub mod alias;
pub mod array;
pub mod auto;
pub mod enums;
pub mod fixed;
pub mod lowcard;
pub mod map;
pub mod nothing;
pub mod nullable;
pub mod string;
pub mod tuple;

pub use alias::ColAlias;
pub use array::ColArray;
pub use auto::{ColAuto, new_column};
pub use enums::{ColEnum, EnumWidth};
pub use fixed::*;
pub use lowcard::{ColLowCardinality, KeyWidth, LcIndex};
pub use map::ColMap;
pub use nothing::ColNothing;
pub use nullable::ColNullable;
pub use string::{ColFixedStr, ColStr};
pub use tuple::{ColNested, ColTuple};

use async_trait::async_trait;
use std::any::Any;
use std::fmt;

use crate::error::{Result, TypeError};
use crate::protocol::buffer::Buffer;
use crate::protocol::reader::Reader;
use crate::types::ColumnType;

/// Rows decoded per chunk when the row count comes from the wire.
pub(crate) const DECODE_CHUNK_ROWS: usize = 8192;

/// Upper bound on elements claimed by array/map offsets in one block.
pub(crate) const MAX_NESTED_ELEMENTS: u64 = 1 << 32;

/// Uniform contract for every wire type.
#[async_trait]
pub trait Column: Send + Sync + fmt::Debug {
    /// Canonical wire type name.
    fn column_type(&self) -> ColumnType;

    fn rows(&self) -> usize;

    /// Truncate to zero rows, keeping capacity.
    fn reset(&mut self);

    /// Append all rows. No outer length prefix; the row count travels in the block.
    fn encode_column(&self, buf: &mut Buffer);

    /// Decode `rows` rows, appending to existing contents.
    async fn decode_column(&mut self, r: &mut Reader<'_>, rows: usize) -> Result<()>;

    /// Pre-encode hook. Builds dictionaries where a kind needs one.
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Serialization state written once per column before its data.
    fn encode_state(&self, _buf: &mut Buffer) {}

    async fn decode_state(&mut self, _r: &mut Reader<'_>) -> Result<()> {
        Ok(())
    }

    /// Accept `t` as this column's wire type. Kinds whose parameters come
    /// from the type string (enum mappings, time zones) adopt them here;
    /// everything else only checks compatibility.
    fn infer(&mut self, t: &ColumnType) -> std::result::Result<(), TypeError> {
        self.column_type().check(t)
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl dyn Column {
    /// Typed view of a column.
    pub fn downcast_ref<T: Column + 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Column + 'static>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

/// Implements the `as_any` pair for a concrete column.
macro_rules! impl_as_any {
    () => {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    };
}
pub(crate) use impl_as_any;

/// A column paired with its name in a block.
#[derive(Debug)]
pub struct NamedColumn {
    pub name: String,
    pub data: Box<dyn Column>,
}

impl NamedColumn {
    pub fn new(name: impl Into<String>, data: impl Column + 'static) -> Self {
        Self {
            name: name.into(),
            data: Box::new(data),
        }
    }

    pub fn boxed(name: impl Into<String>, data: Box<dyn Column>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Column inferred from a type string.
    pub fn typed(name: impl Into<String>, type_str: &str) -> std::result::Result<Self, TypeError> {
        Ok(Self::boxed(name, new_column(type_str)?))
    }

    /// Typed view, looking through `ColAuto`.
    pub fn get<T: Column + 'static>(&self) -> Option<&T> {
        self.data
            .downcast_ref::<T>()
            .or_else(|| self.data.downcast_ref::<ColAuto>()?.get::<T>())
    }

    pub fn get_mut<T: Column + 'static>(&mut self) -> Option<&mut T> {
        if self.data.as_any().is::<T>() {
            return self.data.downcast_mut::<T>();
        }
        self.data.downcast_mut::<ColAuto>()?.get_mut::<T>()
    }
}

/// Grow `v` for `rows` incoming values without trusting a wire-supplied count.
pub(crate) fn reserve_bounded<T>(v: &mut Vec<T>, rows: usize) {
    v.reserve(rows.min(DECODE_CHUNK_ROWS));
}
