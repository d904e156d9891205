//! Block framing.
//!
//! A block is one batch of equal-length columns:
//! - block info (tagged fields, revision-gated)
//! - varint column count, varint row count
//! - per column: name, type, custom-serialization flag (revision-gated),
//!   then state and data when the block has rows
//!
//! `0` columns and `0` rows is the end-of-stream sentinel.

use serde::Deserialize;

use super::buffer::Buffer;
use super::feature::Feature;
use super::reader::{DEFAULT_MAX_STRING_LEN, Reader};
use crate::column::{Column, NamedColumn, new_column};
use crate::error::{DecodeError, Error, Result};
use crate::types::ColumnType;

/// Bounds applied to wire-supplied counts before anything is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DecodeLimits {
    pub max_columns: u64,
    pub max_rows: u64,
    pub max_string_len: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_columns: 1 << 16,
            max_rows: 1 << 28,
            max_string_len: DEFAULT_MAX_STRING_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub is_overflows: bool,
    pub bucket_num: i32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self {
            is_overflows: false,
            bucket_num: -1,
        }
    }
}

impl BlockInfo {
    pub fn encode(&self, buf: &mut Buffer) {
        buf.put_varint(1);
        buf.put_bool(self.is_overflows);
        buf.put_varint(2);
        buf.put_i32(self.bucket_num);
        buf.put_varint(0);
    }

    pub async fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let mut info = BlockInfo::default();
        loop {
            let offset = r.offset();
            match r.varint().await? {
                0 => return Ok(info),
                1 => info.is_overflows = r.bool().await?,
                2 => info.bucket_num = r.i32().await?,
                field => {
                    return Err(DecodeError::invalid(format!(
                        "unknown block info field {} at byte {}",
                        field, offset
                    ))
                    .into());
                }
            }
        }
    }
}

/// Shape of a decoded block. The column data lands in the caller's `Results`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Block {
    pub info: BlockInfo,
    pub columns: usize,
    pub rows: usize,
}

impl Block {
    pub fn is_end(&self) -> bool {
        self.columns == 0 && self.rows == 0
    }

    /// Encode `columns` as one block. Row counts are checked and columns
    /// prepared before anything is written to `buf`.
    pub fn encode(
        buf: &mut Buffer,
        revision: u64,
        info: &BlockInfo,
        columns: &mut [NamedColumn],
    ) -> Result<usize> {
        let rows = columns.first().map_or(0, |c| c.data.rows());
        for c in columns.iter() {
            if c.data.rows() != rows {
                return Err(Error::RowMismatch {
                    column: c.name.clone(),
                    rows: c.data.rows(),
                    expected: rows,
                });
            }
        }
        for c in columns.iter_mut() {
            c.data.prepare()?;
        }

        if Feature::BlockInfo.supported(revision) {
            info.encode(buf);
        }
        buf.put_varint(columns.len() as u64);
        buf.put_varint(rows as u64);
        for c in columns.iter() {
            buf.put_string(&c.name);
            buf.put_string(c.data.column_type().as_str());
            if Feature::CustomSerialization.supported(revision) {
                buf.put_bool(false);
            }
            if rows > 0 {
                c.data.encode_state(buf);
                c.data.encode_column(buf);
            }
        }
        tracing::trace!(columns = columns.len(), rows, "encoded block");
        Ok(rows)
    }

    /// The `0, 0` sentinel.
    pub fn encode_end(buf: &mut Buffer, revision: u64) {
        if Feature::BlockInfo.supported(revision) {
            BlockInfo::default().encode(buf);
        }
        buf.put_varint(0);
        buf.put_varint(0);
    }

    /// Decode one block into `target`. The sentinel leaves `target` untouched.
    pub async fn decode(
        r: &mut Reader<'_>,
        revision: u64,
        limits: &DecodeLimits,
        target: &mut Results,
    ) -> Result<Block> {
        let info = if Feature::BlockInfo.supported(revision) {
            BlockInfo::decode(r).await?
        } else {
            BlockInfo::default()
        };
        let columns = r.varint_bounded("block columns", limits.max_columns).await?;
        let rows = r.varint_bounded("block rows", limits.max_rows).await?;
        let block = Block {
            info,
            columns,
            rows,
        };
        if block.is_end() {
            return Ok(block);
        }
        target.expect_columns(columns)?;
        target.begin_block();

        for index in 0..columns {
            let name = r.str().await?;
            let type_name = ColumnType::new(r.str().await?);
            if Feature::CustomSerialization.supported(revision) && r.bool().await? {
                return Err(DecodeError::invalid("custom serialization is not supported")
                    .in_column(index, &name)
                    .into());
            }
            let column = target.bind(index, &name, &type_name)?;
            if rows > 0 {
                let decoded = async {
                    column.decode_state(r).await?;
                    column.decode_column(r, rows).await
                }
                .await;
                decoded.map_err(|e| match e {
                    Error::Decode(d) => Error::Decode(d.in_column(index, &name)),
                    other => other,
                })?;
            }
        }
        tracing::trace!(columns, rows, "decoded block");
        Ok(block)
    }
}

/// Decode targets for result blocks.
///
/// Explicit targets are positional and must match the server's column names
/// and types. Auto targets are created from the first block's types and
/// reused for the following blocks.
#[derive(Debug)]
pub struct Results {
    columns: Vec<NamedColumn>,
    auto: bool,
    replace: bool,
}

impl Default for Results {
    fn default() -> Self {
        Self::auto()
    }
}

impl Results {
    pub fn new(columns: Vec<NamedColumn>) -> Self {
        Self {
            columns,
            auto: false,
            replace: false,
        }
    }

    pub fn auto() -> Self {
        Self {
            columns: Vec::new(),
            auto: true,
            replace: false,
        }
    }

    pub fn is_auto(&self) -> bool {
        self.auto
    }

    /// When set, every decoded block replaces the rows of the previous one
    /// instead of appending to them. The end sentinel replaces nothing.
    pub fn set_replace(&mut self, replace: bool) {
        self.replace = replace;
    }

    fn begin_block(&mut self) {
        if self.replace {
            self.reset();
        }
    }

    pub fn columns(&self) -> &[NamedColumn] {
        &self.columns
    }

    pub fn columns_mut(&mut self) -> &mut [NamedColumn] {
        &mut self.columns
    }

    pub fn into_columns(self) -> Vec<NamedColumn> {
        self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&NamedColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Typed column by name.
    pub fn get<T: Column + 'static>(&self, name: &str) -> Option<&T> {
        self.column(name)?.get::<T>()
    }

    pub fn rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.data.rows())
    }

    /// Drop all rows, keeping columns and their types.
    pub fn reset(&mut self) {
        for c in &mut self.columns {
            c.data.reset();
        }
    }

    fn expect_columns(&self, columns: usize) -> Result<()> {
        let have = self.columns.len();
        if (self.auto && have == 0) || have == columns {
            return Ok(());
        }
        Err(Error::Protocol(format!(
            "block has {} columns, expected {}",
            columns, have
        )))
    }

    /// Target for column `index`, checked against the wire name and type.
    fn bind(&mut self, index: usize, name: &str, t: &ColumnType) -> Result<&mut dyn Column> {
        let type_err = |source| Error::ColumnType {
            index,
            name: name.to_string(),
            source,
        };
        if index == self.columns.len() && self.auto {
            let data = new_column(t.as_str()).map_err(type_err)?;
            self.columns.push(NamedColumn::boxed(name, data));
        }
        let Some(target) = self.columns.get_mut(index) else {
            return Err(Error::Protocol(format!("no target for column {}", index)));
        };
        if target.name != name {
            return Err(Error::Protocol(format!(
                "column {} is {:?}, target is {:?}",
                index, name, target.name
            )));
        }
        target.data.infer(t).map_err(type_err)?;
        Ok(target.data.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColArray, ColAuto, ColStr, ColUInt64, ColUInt8};
    use crate::protocol::feature::CLIENT_REVISION;
    use pretty_assertions::assert_eq;

    fn input() -> Vec<NamedColumn> {
        vec![
            NamedColumn::new("id", ColUInt64::from_values([1, 2])),
            NamedColumn::new("name", ColStr::from_values(["a", "b"])),
        ]
    }

    async fn decode_into(bytes: &[u8], revision: u64, target: &mut Results) -> Result<Block> {
        let mut r = Reader::from_slice(bytes);
        Block::decode(&mut r, revision, &DecodeLimits::default(), target).await
    }

    #[test]
    fn test_block_info_layout() {
        let mut b = Buffer::new();
        BlockInfo::default().encode(&mut b);
        assert_eq!(b.as_slice(), &[1, 0, 2, 0xff, 0xff, 0xff, 0xff, 0]);
    }

    #[tokio::test]
    async fn test_round_trip_explicit_targets() {
        let mut b = Buffer::new();
        let rows = Block::encode(&mut b, CLIENT_REVISION, &BlockInfo::default(), &mut input()).unwrap();
        assert_eq!(rows, 2);

        let mut target = Results::new(vec![
            NamedColumn::new("id", ColUInt64::new()),
            NamedColumn::new("name", ColStr::new()),
        ]);
        let block = decode_into(b.as_slice(), CLIENT_REVISION, &mut target).await.unwrap();
        assert_eq!(block.rows, 2);
        assert_eq!(block.columns, 2);
        assert_eq!(target.get::<ColUInt64>("id").unwrap().values(), &[1, 2]);
        assert_eq!(target.get::<ColStr>("name").unwrap().get_str(1), Some("b"));
    }

    #[tokio::test]
    async fn test_auto_targets_follow_blocks() {
        let mut b = Buffer::new();
        Block::encode(&mut b, CLIENT_REVISION, &BlockInfo::default(), &mut input()).unwrap();
        let bytes = b.as_slice().to_vec();

        let mut target = Results::auto();
        decode_into(&bytes, CLIENT_REVISION, &mut target).await.unwrap();
        assert_eq!(target.len(), 2);
        assert_eq!(target.columns()[1].data.column_type().as_str(), "String");

        target.reset();
        decode_into(&bytes, CLIENT_REVISION, &mut target).await.unwrap();
        assert_eq!(target.rows(), 2);
        assert_eq!(target.get::<ColUInt64>("id").unwrap().values(), &[1, 2]);
    }

    #[tokio::test]
    async fn test_end_sentinel_leaves_targets_alone() {
        let mut b = Buffer::new();
        Block::encode_end(&mut b, CLIENT_REVISION);
        let mut target = Results::new(vec![NamedColumn::new("id", ColUInt64::from_values([9]))]);
        let block = decode_into(b.as_slice(), CLIENT_REVISION, &mut target).await.unwrap();
        assert!(block.is_end());
        assert_eq!(target.get::<ColUInt64>("id").unwrap().values(), &[9]);

        let mut empty = Buffer::new();
        Block::encode(&mut empty, CLIENT_REVISION, &BlockInfo::default(), &mut []).unwrap();
        assert_eq!(empty.as_slice(), b.as_slice());
    }

    #[tokio::test]
    async fn test_replace_mode_keeps_last_block() {
        let mut b = Buffer::new();
        Block::encode(&mut b, CLIENT_REVISION, &BlockInfo::default(), &mut input()).unwrap();
        let block = b.as_slice().to_vec();
        let mut end = Buffer::new();
        Block::encode_end(&mut end, CLIENT_REVISION);

        let mut appending = Results::auto();
        decode_into(&block, CLIENT_REVISION, &mut appending).await.unwrap();
        decode_into(&block, CLIENT_REVISION, &mut appending).await.unwrap();
        assert_eq!(appending.rows(), 4);

        let mut replacing = Results::auto();
        replacing.set_replace(true);
        decode_into(&block, CLIENT_REVISION, &mut replacing).await.unwrap();
        decode_into(&block, CLIENT_REVISION, &mut replacing).await.unwrap();
        decode_into(end.as_slice(), CLIENT_REVISION, &mut replacing).await.unwrap();
        assert_eq!(replacing.rows(), 2);
    }

    #[tokio::test]
    async fn test_zero_rows_header_has_no_data() {
        let mut cols = vec![NamedColumn::new("n", ColUInt8::new())];
        let mut b = Buffer::new();
        Block::encode(&mut b, CLIENT_REVISION, &BlockInfo::default(), &mut cols).unwrap();
        let mut expect = Buffer::new();
        BlockInfo::default().encode(&mut expect);
        expect.put_varint(1);
        expect.put_varint(0);
        expect.put_string("n");
        expect.put_string("UInt8");
        expect.put_bool(false);
        assert_eq!(b.as_slice(), expect.as_slice());

        let mut target = Results::auto();
        let block = decode_into(b.as_slice(), CLIENT_REVISION, &mut target).await.unwrap();
        assert_eq!(block.rows, 0);
        assert_eq!(target.len(), 1);
    }

    #[test]
    fn test_row_mismatch_writes_nothing() {
        let mut cols = input();
        cols.push(NamedColumn::new("extra", ColUInt8::from_values([1])));
        let mut b = Buffer::new();
        let err = Block::encode(&mut b, CLIENT_REVISION, &BlockInfo::default(), &mut cols).unwrap_err();
        assert!(matches!(err, Error::RowMismatch { expected: 2, rows: 1, .. }));
        assert!(b.is_empty());
    }

    #[test]
    fn test_prepare_failure_writes_nothing() {
        let mut arr = ColArray::new(ColUInt8::new());
        arr.inner_mut::<ColUInt8>().unwrap().append(1);
        let mut cols = vec![NamedColumn::new("a", arr)];
        let mut b = Buffer::new();
        assert!(Block::encode(&mut b, CLIENT_REVISION, &BlockInfo::default(), &mut cols).is_err());
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn test_old_revision_omits_gated_fields() {
        let mut b = Buffer::new();
        Block::encode(&mut b, 5, &BlockInfo::default(), &mut input()).unwrap();
        assert_eq!(&b.as_slice()[..2], &[2, 2]);
        let mut target = Results::auto();
        decode_into(b.as_slice(), 5, &mut target).await.unwrap();
        assert_eq!(target.rows(), 2);
    }

    #[tokio::test]
    async fn test_target_mismatches() {
        let mut b = Buffer::new();
        Block::encode(&mut b, CLIENT_REVISION, &BlockInfo::default(), &mut input()).unwrap();
        let bytes = b.as_slice().to_vec();

        let mut wrong_type = Results::new(vec![
            NamedColumn::new("id", ColUInt8::new()),
            NamedColumn::new("name", ColStr::new()),
        ]);
        let err = decode_into(&bytes, CLIENT_REVISION, &mut wrong_type).await.unwrap_err();
        assert!(matches!(err, Error::ColumnType { index: 0, .. }));

        let mut wrong_name = Results::new(vec![
            NamedColumn::new("x", ColUInt64::new()),
            NamedColumn::new("name", ColStr::new()),
        ]);
        assert!(matches!(
            decode_into(&bytes, CLIENT_REVISION, &mut wrong_name).await,
            Err(Error::Protocol(_))
        ));

        let mut too_few = Results::new(vec![NamedColumn::new("id", ColUInt64::new())]);
        assert!(decode_into(&bytes, CLIENT_REVISION, &mut too_few).await.is_err());

        let mut with_auto = Results::new(vec![
            NamedColumn::new("id", ColAuto::new()),
            NamedColumn::new("name", ColStr::new()),
        ]);
        decode_into(&bytes, CLIENT_REVISION, &mut with_auto).await.unwrap();
        assert_eq!(with_auto.get::<ColUInt64>("id").unwrap().values(), &[1, 2]);
    }

    #[tokio::test]
    async fn test_limits_reject_claims() {
        let mut b = Buffer::new();
        BlockInfo::default().encode(&mut b);
        b.put_varint(1);
        b.put_varint(u32::MAX as u64);
        let limits = DecodeLimits {
            max_rows: 1000,
            ..DecodeLimits::default()
        };
        let mut r = Reader::from_slice(b.as_slice());
        let err = Block::decode(&mut r, CLIENT_REVISION, &limits, &mut Results::auto())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Decode(DecodeError::Bound { what: "block rows", .. })
        ));
    }

    #[tokio::test]
    async fn test_decode_error_names_column() {
        let mut b = Buffer::new();
        Block::encode(&mut b, CLIENT_REVISION, &BlockInfo::default(), &mut input()).unwrap();
        let bytes = &b.as_slice()[..b.len() - 1];
        let err = decode_into(bytes, CLIENT_REVISION, &mut Results::auto()).await.unwrap_err();
        match err {
            Error::Decode(DecodeError::Column { index, name, source }) => {
                assert_eq!(index, 1);
                assert_eq!(name, "name");
                assert!(source.is_short_read());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_custom_serialization_rejected() {
        let mut b = Buffer::new();
        BlockInfo::default().encode(&mut b);
        b.put_varint(1);
        b.put_varint(1);
        b.put_string("x");
        b.put_string("UInt8");
        b.put_bool(true);
        b.put_u8(1);
        let err = decode_into(b.as_slice(), CLIENT_REVISION, &mut Results::auto())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Decode(DecodeError::Column { index: 0, .. })));
    }
}
