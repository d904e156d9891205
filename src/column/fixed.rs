//! Fixed-width columns.
//!
//! One generic column, `ColFixed<T>`, covers every type whose rows are a
//! constant number of little-endian bytes: integers up to 128 bits, floats,
//! Bool, UUID, IPv4/IPv6 and the kinds that reuse an integer representation
//! under another name (Date, DateTime, DateTime64, Decimal).

use async_trait::async_trait;
use std::fmt;
use std::hash::Hash;
use std::net::{Ipv4Addr, Ipv6Addr};

use super::{Column, DECODE_CHUNK_ROWS, impl_as_any, reserve_bounded};
use crate::error::{DecodeError, Result, TypeError};
use crate::protocol::buffer::Buffer;
use crate::protocol::reader::Reader;
use crate::types::{ColumnType, parse_type};

/// A value with a constant-size little-endian wire form.
pub trait Primitive: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {
    const SIZE: usize;
    /// Wire name used by `ColFixed::new`.
    const TYPE_NAME: &'static str;
    /// All-zero bytes on the wire.
    const ZERO: Self;

    fn put(self, buf: &mut Buffer);

    /// Parse exactly `SIZE` bytes. `None` for bytes that are not a value;
    /// only `bool` has those.
    fn read(b: &[u8]) -> Option<Self>;
}

macro_rules! primitive {
    ($($t:ty => $name:literal),* $(,)?) => {$(
        impl Primitive for $t {
            const SIZE: usize = std::mem::size_of::<$t>();
            const TYPE_NAME: &'static str = $name;
            const ZERO: Self = 0 as $t;

            fn put(self, buf: &mut Buffer) {
                buf.put_raw(&self.to_le_bytes());
            }

            fn read(b: &[u8]) -> Option<Self> {
                Some(<$t>::from_le_bytes(b.try_into().ok()?))
            }
        }
    )*};
}

primitive! {
    i8 => "Int8",
    i16 => "Int16",
    i32 => "Int32",
    i64 => "Int64",
    i128 => "Int128",
    u8 => "UInt8",
    u16 => "UInt16",
    u32 => "UInt32",
    u64 => "UInt64",
    u128 => "UInt128",
    f32 => "Float32",
    f64 => "Float64",
}

impl Primitive for bool {
    const SIZE: usize = 1;
    const TYPE_NAME: &'static str = "Bool";
    const ZERO: Self = false;

    fn put(self, buf: &mut Buffer) {
        buf.put_bool(self);
    }

    fn read(b: &[u8]) -> Option<Self> {
        match b {
            [0] => Some(false),
            [1] => Some(true),
            _ => None,
        }
    }
}

/// UUID as a 128-bit integer. The wire form is the high half then the low
/// half, each little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Uuid(pub u128);

impl Primitive for Uuid {
    const SIZE: usize = 16;
    const TYPE_NAME: &'static str = "UUID";
    const ZERO: Self = Uuid(0);

    fn put(self, buf: &mut Buffer) {
        buf.put_u64((self.0 >> 64) as u64);
        buf.put_u64(self.0 as u64);
    }

    fn read(b: &[u8]) -> Option<Self> {
        let high = u64::from_le_bytes(b.get(..8)?.try_into().ok()?);
        let low = u64::from_le_bytes(b.get(8..16)?.try_into().ok()?);
        Some(Uuid(((high as u128) << 64) | low as u128))
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xffff_ffff_ffff
        )
    }
}

/// IPv4 travels as its UInt32 value.
impl Primitive for Ipv4Addr {
    const SIZE: usize = 4;
    const TYPE_NAME: &'static str = "IPv4";
    const ZERO: Self = Ipv4Addr::UNSPECIFIED;

    fn put(self, buf: &mut Buffer) {
        buf.put_u32(u32::from(self));
    }

    fn read(b: &[u8]) -> Option<Self> {
        Some(Ipv4Addr::from(u32::from_le_bytes(b.try_into().ok()?)))
    }
}

/// IPv6 travels as its 16 octets in network order.
impl Primitive for Ipv6Addr {
    const SIZE: usize = 16;
    const TYPE_NAME: &'static str = "IPv6";
    const ZERO: Self = Ipv6Addr::UNSPECIFIED;

    fn put(self, buf: &mut Buffer) {
        buf.put_raw(&self.octets());
    }

    fn read(b: &[u8]) -> Option<Self> {
        let octets: [u8; 16] = b.try_into().ok()?;
        Some(Ipv6Addr::from(octets))
    }
}

/// Column of fixed-width values.
#[derive(Debug, Clone, PartialEq)]
pub struct ColFixed<T: Primitive> {
    data: Vec<T>,
    type_name: ColumnType,
}

pub type ColInt8 = ColFixed<i8>;
pub type ColInt16 = ColFixed<i16>;
pub type ColInt32 = ColFixed<i32>;
pub type ColInt64 = ColFixed<i64>;
pub type ColInt128 = ColFixed<i128>;
pub type ColUInt8 = ColFixed<u8>;
pub type ColUInt16 = ColFixed<u16>;
pub type ColUInt32 = ColFixed<u32>;
pub type ColUInt64 = ColFixed<u64>;
pub type ColUInt128 = ColFixed<u128>;
pub type ColFloat32 = ColFixed<f32>;
pub type ColFloat64 = ColFixed<f64>;
pub type ColBool = ColFixed<bool>;
pub type ColUuid = ColFixed<Uuid>;
pub type ColIPv4 = ColFixed<Ipv4Addr>;
pub type ColIPv6 = ColFixed<Ipv6Addr>;

impl<T: Primitive> Default for ColFixed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Primitive> ColFixed<T> {
    pub fn new() -> Self {
        Self::with_type(T::TYPE_NAME)
    }

    /// Same representation under another wire name (`Date` over `u16`).
    pub fn with_type(t: impl Into<ColumnType>) -> Self {
        Self {
            data: Vec::new(),
            type_name: t.into(),
        }
    }

    pub fn from_values(values: impl IntoIterator<Item = T>) -> Self {
        let mut c = Self::new();
        c.data.extend(values);
        c
    }

    /// Replace the rows, keeping the wire name.
    pub fn with_values(mut self, values: impl IntoIterator<Item = T>) -> Self {
        self.data.clear();
        self.data.extend(values);
        self
    }

    pub fn append(&mut self, v: T) {
        self.data.push(v);
    }

    pub fn extend_from_slice(&mut self, v: &[T]) {
        self.data.extend_from_slice(v);
    }

    pub fn values(&self) -> &[T] {
        &self.data
    }

    pub fn get(&self, row: usize) -> Option<T> {
        self.data.get(row).copied()
    }
}

impl ColFixed<u16> {
    /// Days since 1970-01-01.
    pub fn date() -> Self {
        Self::with_type("Date")
    }
}

impl ColFixed<i32> {
    /// Days since 1970-01-01, signed.
    pub fn date32() -> Self {
        Self::with_type("Date32")
    }

    /// Decimal with precision 1..=9.
    pub fn decimal(precision: u8, scale: u8) -> Self {
        Self::with_type(format!("Decimal({}, {})", precision, scale))
    }
}

impl ColFixed<u32> {
    /// Seconds since the epoch, optionally tagged with a time zone.
    pub fn date_time(tz: Option<&str>) -> Self {
        match tz {
            Some(tz) => Self::with_type(format!("DateTime({})", crate::types::quote(tz))),
            None => Self::with_type("DateTime"),
        }
    }
}

impl ColFixed<i64> {
    /// Ticks of 10^-precision seconds since the epoch.
    pub fn date_time64(precision: u8, tz: Option<&str>) -> Self {
        match tz {
            Some(tz) => Self::with_type(format!(
                "DateTime64({}, {})",
                precision,
                crate::types::quote(tz)
            )),
            None => Self::with_type(format!("DateTime64({})", precision)),
        }
    }

    /// Decimal with precision 10..=18.
    pub fn decimal(precision: u8, scale: u8) -> Self {
        Self::with_type(format!("Decimal({}, {})", precision, scale))
    }
}

impl ColFixed<i128> {
    /// Decimal with precision 19..=38.
    pub fn decimal(precision: u8, scale: u8) -> Self {
        Self::with_type(format!("Decimal({}, {})", precision, scale))
    }
}

/// DateTime carries only a time zone and DateTime64 a zone after its
/// precision; both are adopted from the wire as long as the precision agrees.
fn adopts_time_params(have: &ColumnType, want: &ColumnType) -> bool {
    if have.base() != want.base() {
        return false;
    }
    match have.base() {
        "DateTime" => true,
        "DateTime64" => match (parse_type(have.as_str()), parse_type(want.as_str())) {
            (Ok(a), Ok(b)) => a.args.first().is_some() && a.args.first() == b.args.first(),
            _ => false,
        },
        _ => false,
    }
}

#[async_trait]
impl<T: Primitive> Column for ColFixed<T> {
    fn column_type(&self) -> ColumnType {
        self.type_name.clone()
    }

    fn rows(&self) -> usize {
        self.data.len()
    }

    fn reset(&mut self) {
        self.data.clear();
    }

    fn encode_column(&self, buf: &mut Buffer) {
        buf.buf.reserve(self.data.len() * T::SIZE);
        for v in &self.data {
            v.put(buf);
        }
    }

    async fn decode_column(&mut self, r: &mut Reader<'_>, rows: usize) -> Result<()> {
        reserve_bounded(&mut self.data, rows);
        let mut chunk = vec![0u8; T::SIZE * rows.min(DECODE_CHUNK_ROWS)];
        let mut left = rows;
        while left > 0 {
            let n = left.min(DECODE_CHUNK_ROWS);
            let start = r.offset();
            let bytes = &mut chunk[..n * T::SIZE];
            r.read_full(bytes).await?;
            for (i, b) in bytes.chunks_exact(T::SIZE).enumerate() {
                match T::read(b) {
                    Some(v) => self.data.push(v),
                    None => {
                        return Err(DecodeError::InvalidBool {
                            offset: start + (i * T::SIZE) as u64,
                            value: b[0],
                        }
                        .into());
                    }
                }
            }
            left -= n;
        }
        Ok(())
    }

    fn infer(&mut self, t: &ColumnType) -> std::result::Result<(), TypeError> {
        if self.type_name.same_as(t) {
            return Ok(());
        }
        if adopts_time_params(&self.type_name, t) {
            self.type_name = t.clone();
            return Ok(());
        }
        self.type_name.check(t)
    }

    impl_as_any!();
}

/// Values usable as LowCardinality dictionary entries.
pub trait HashablePrimitive: Primitive + Eq + Hash {}

impl<T: Primitive + Eq + Hash> HashablePrimitive for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::testing::{assert_prefixes_fail, encode, round_trip};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_uint64_layout() {
        let col = ColUInt64::from_values([1, 0x0102]);
        let bytes = round_trip(&col, &mut ColUInt64::new()).await;
        assert_eq!(
            bytes,
            vec![1, 0, 0, 0, 0, 0, 0, 0, 2, 1, 0, 0, 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn test_decode_appends() {
        let col = ColInt32::from_values([-1, 7]);
        let bytes = encode(&col);
        let mut target = ColInt32::from_values([42]);
        let mut r = Reader::from_slice(&bytes);
        target.decode_column(&mut r, 2).await.unwrap();
        assert_eq!(target.values(), &[42, -1, 7]);
    }

    #[tokio::test]
    async fn test_float_and_wide_ints() {
        let f = ColFloat64::from_values([1.5, -0.25, f64::MAX]);
        let mut out = ColFloat64::new();
        round_trip(&f, &mut out).await;
        assert_eq!(out.values(), f.values());

        let big = ColInt128::from_values([i128::MIN, -1, i128::MAX]);
        let mut out = ColInt128::new();
        round_trip(&big, &mut out).await;
        assert_eq!(out.values(), big.values());
    }

    #[tokio::test]
    async fn test_bool_rejects_other_bytes() {
        let bytes = [1u8, 0, 2];
        let mut col = ColBool::new();
        let err = col
            .decode_column(&mut Reader::from_slice(&bytes), 3)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Decode(DecodeError::InvalidBool { offset: 2, value: 2 })
        ));
    }

    #[tokio::test]
    async fn test_uuid_wire_order() {
        let id = Uuid(0x0011_2233_4455_6677_8899_aabb_ccdd_eeff);
        let col = ColUuid::from_values([id]);
        let bytes = encode(&col);
        assert_eq!(&bytes[..8], &0x0011_2233_4455_6677u64.to_le_bytes());
        assert_eq!(&bytes[8..], &0x8899_aabb_ccdd_eeffu64.to_le_bytes());
        let mut out = ColUuid::new();
        round_trip(&col, &mut out).await;
        assert_eq!(out.get(0), Some(id));
        assert_eq!(id.to_string(), "00112233-4455-6677-8899-aabbccddeeff");
    }

    #[tokio::test]
    async fn test_ip_addresses() {
        let v4 = ColIPv4::from_values([Ipv4Addr::new(127, 0, 0, 1)]);
        assert_eq!(encode(&v4), vec![1, 0, 0, 127]);
        let v6 = ColIPv6::from_values([Ipv6Addr::LOCALHOST]);
        let mut out = ColIPv6::new();
        round_trip(&v6, &mut out).await;
        assert_eq!(out.get(0), Some(Ipv6Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_named_representations() {
        let d = ColFixed::<u16>::date().with_values([19000]);
        assert_eq!(d.column_type().as_str(), "Date");
        let mut out = ColFixed::<u16>::date();
        round_trip(&d, &mut out).await;

        assert_eq!(
            ColFixed::<i64>::date_time64(3, Some("UTC")).column_type().as_str(),
            "DateTime64(3, 'UTC')"
        );
        assert_eq!(
            ColFixed::<i128>::decimal(38, 10).column_type().as_str(),
            "Decimal(38, 10)"
        );
    }

    #[test]
    fn test_infer_adopts_time_zone() {
        let mut c = ColFixed::<u32>::date_time(None);
        c.infer(&"DateTime('Europe/Berlin')".into()).unwrap();
        assert_eq!(c.column_type().as_str(), "DateTime('Europe/Berlin')");

        let mut c = ColFixed::<i64>::date_time64(3, None);
        c.infer(&"DateTime64(3, 'UTC')".into()).unwrap();
        assert!(c.infer(&"DateTime64(6, 'UTC')".into()).is_err());

        let mut c = ColUInt32::new();
        assert!(matches!(
            c.infer(&"UInt64".into()),
            Err(TypeError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_prefixes() {
        let col = ColUInt32::from_values([1, 2, 3]);
        let bytes = encode(&col);
        assert_prefixes_fail(&bytes, 3, || Box::new(ColUInt32::new())).await;
    }

    #[tokio::test]
    async fn test_short_read_kinds() {
        let mut col = ColUInt16::new();
        let err = col
            .decode_column(&mut Reader::from_slice(&[]), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Decode(DecodeError::Eof { offset: 0 })));

        let mut col = ColUInt16::new();
        let err = col
            .decode_column(&mut Reader::from_slice(&[1]), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Decode(DecodeError::Truncated { .. })
        ));
    }
}
