//! Columns built from type strings.

use async_trait::async_trait;

use super::{
    ColAlias, ColArray, ColEnum, ColFixed, ColFixedStr, ColLowCardinality, ColMap, ColNested,
    ColNothing, ColNullable, ColStr, ColTuple, Column, LcIndex, Primitive, Uuid, impl_as_any,
};
use crate::error::{DecodeError, Result, TypeError};
use crate::protocol::buffer::Buffer;
use crate::protocol::reader::Reader;
use crate::types::{ColumnType, TypeExpr};
use std::net::{Ipv4Addr, Ipv6Addr};

fn fixed<T: Primitive>(t: &str) -> Box<dyn Column> {
    Box::new(ColFixed::<T>::with_type(t))
}

fn one_arg<'a>(t: &str, expr: &TypeExpr<'a>) -> std::result::Result<&'a str, TypeError> {
    match expr.args.as_slice() {
        [a] => Ok(*a),
        _ => Err(TypeError::malformed(
            t,
            format!("{} takes exactly one argument", expr.name),
        )),
    }
}

fn number(t: &str, arg: &str, what: &str, max: u32) -> std::result::Result<u32, TypeError> {
    arg.trim()
        .parse::<u32>()
        .ok()
        .filter(|&n| n <= max)
        .ok_or_else(|| TypeError::malformed(t, format!("{} must be an integer up to {}", what, max)))
}

fn decimal(t: &str, precision: u32) -> std::result::Result<Box<dyn Column>, TypeError> {
    match precision {
        1..=9 => Ok(fixed::<i32>(t)),
        10..=18 => Ok(fixed::<i64>(t)),
        19..=38 => Ok(fixed::<i128>(t)),
        _ => Err(TypeError::Unsupported(t.to_string())),
    }
}

fn lc<C: LcIndex>(index: C, nullable: bool) -> Box<dyn Column> {
    if nullable {
        Box::new(ColLowCardinality::nullable(index))
    } else {
        Box::new(ColLowCardinality::new(index))
    }
}

fn low_cardinality(t: &str, inner: &str) -> std::result::Result<Box<dyn Column>, TypeError> {
    let inner_type = ColumnType::new(inner.trim());
    let (nullable, value) = match inner_type.elem("Nullable") {
        Some(v) => (true, v),
        None => (false, inner_type),
    };
    let expr = value.parse()?;
    let v = value.as_str();
    Ok(match expr.name {
        "String" => lc(ColStr::new(), nullable),
        "FixedString" => {
            let n = number(v, one_arg(v, &expr)?, "FixedString size", u32::MAX)?;
            if n == 0 {
                return Err(TypeError::malformed(v, "FixedString size must be positive"));
            }
            lc(ColFixedStr::new(n as usize), nullable)
        }
        "Int8" => lc(ColFixed::<i8>::new(), nullable),
        "Int16" => lc(ColFixed::<i16>::new(), nullable),
        "Int32" => lc(ColFixed::<i32>::new(), nullable),
        "Int64" => lc(ColFixed::<i64>::new(), nullable),
        "Int128" => lc(ColFixed::<i128>::new(), nullable),
        "UInt8" => lc(ColFixed::<u8>::new(), nullable),
        "UInt16" => lc(ColFixed::<u16>::new(), nullable),
        "UInt32" => lc(ColFixed::<u32>::new(), nullable),
        "UInt64" => lc(ColFixed::<u64>::new(), nullable),
        "UInt128" => lc(ColFixed::<u128>::new(), nullable),
        "Date" => lc(ColFixed::<u16>::with_type(v), nullable),
        "Date32" => lc(ColFixed::<i32>::with_type(v), nullable),
        "DateTime" => lc(ColFixed::<u32>::with_type(v), nullable),
        "UUID" => lc(ColFixed::<Uuid>::new(), nullable),
        "IPv4" => lc(ColFixed::<Ipv4Addr>::new(), nullable),
        "IPv6" => lc(ColFixed::<Ipv6Addr>::new(), nullable),
        _ => return Err(TypeError::Unsupported(t.to_string())),
    })
}

fn point() -> Box<dyn Column> {
    Box::new(ColAlias::new(
        "Point",
        Box::new(ColTuple::new(vec![
            Box::new(ColFixed::<f64>::new()),
            Box::new(ColFixed::<f64>::new()),
        ])),
    ))
}

fn geo_array(name: &str, inner: Box<dyn Column>) -> Box<dyn Column> {
    Box::new(ColAlias::new(name, Box::new(ColArray::boxed(inner))))
}

/// Build an empty column for a wire type string.
pub fn new_column(type_str: &str) -> std::result::Result<Box<dyn Column>, TypeError> {
    let t = type_str.trim();
    let expr = crate::types::parse_type(t)?;
    if !expr.parenthesized {
        let col: Box<dyn Column> = match expr.name {
            "Int8" => fixed::<i8>(t),
            "Int16" => fixed::<i16>(t),
            "Int32" => fixed::<i32>(t),
            "Int64" => fixed::<i64>(t),
            "Int128" => fixed::<i128>(t),
            "UInt8" => fixed::<u8>(t),
            "UInt16" => fixed::<u16>(t),
            "UInt32" => fixed::<u32>(t),
            "UInt64" => fixed::<u64>(t),
            "UInt128" => fixed::<u128>(t),
            "Float32" => fixed::<f32>(t),
            "Float64" => fixed::<f64>(t),
            "Bool" => fixed::<bool>(t),
            "Date" => fixed::<u16>(t),
            "Date32" => fixed::<i32>(t),
            "DateTime" => fixed::<u32>(t),
            "UUID" => fixed::<Uuid>(t),
            "IPv4" => fixed::<Ipv4Addr>(t),
            "IPv6" => fixed::<Ipv6Addr>(t),
            "String" => Box::new(ColStr::new()),
            "Nothing" => Box::new(ColNothing::new()),
            "Point" => point(),
            "Ring" => geo_array("Ring", point()),
            "Polygon" => geo_array("Polygon", new_column("Ring")?),
            "MultiPolygon" => geo_array("MultiPolygon", new_column("Polygon")?),
            _ => return Err(TypeError::Unsupported(t.to_string())),
        };
        return Ok(col);
    }

    match expr.name {
        "DateTime" => {
            one_arg(t, &expr)?;
            Ok(fixed::<u32>(t))
        }
        "DateTime64" => {
            if expr.args.is_empty() || expr.args.len() > 2 {
                return Err(TypeError::malformed(t, "DateTime64 takes a precision and an optional time zone"));
            }
            number(t, expr.args[0], "DateTime64 precision", 9)?;
            Ok(fixed::<i64>(t))
        }
        "Decimal" => match expr.args.as_slice() {
            [p, s] => {
                let precision = number(t, p, "Decimal precision", 76)?;
                number(t, s, "Decimal scale", precision)?;
                decimal(t, precision)
            }
            _ => Err(TypeError::malformed(t, "Decimal takes a precision and a scale")),
        },
        "Decimal32" | "Decimal64" | "Decimal128" => {
            let (width, max) = match expr.name {
                "Decimal32" => (9, 9),
                "Decimal64" => (18, 18),
                _ => (38, 38),
            };
            number(t, one_arg(t, &expr)?, "Decimal scale", max)?;
            decimal(t, width)
        }
        "FixedString" => {
            let n = number(t, one_arg(t, &expr)?, "FixedString size", u32::MAX)?;
            if n == 0 {
                return Err(TypeError::malformed(t, "FixedString size must be positive"));
            }
            Ok(Box::new(ColFixedStr::new(n as usize)))
        }
        "Array" => Ok(Box::new(ColArray::boxed(new_column(one_arg(t, &expr)?)?))),
        "Nullable" => Ok(Box::new(ColNullable::boxed(new_column(one_arg(t, &expr)?)?))),
        "LowCardinality" => low_cardinality(t, one_arg(t, &expr)?),
        "Map" => match expr.args.as_slice() {
            [k, v] => Ok(Box::new(ColMap::boxed(new_column(k)?, new_column(v)?))),
            _ => Err(TypeError::malformed(t, "Map takes a key and a value type")),
        },
        "Tuple" => Ok(Box::new(ColTuple::from_type(&ColumnType::new(t))?)),
        "Nested" => Ok(Box::new(ColNested::from_type(&ColumnType::new(t))?)),
        "Enum8" | "Enum16" => Ok(Box::new(ColEnum::from_type(&ColumnType::new(t))?)),
        "SimpleAggregateFunction" => match expr.args.as_slice() {
            [_, inner] => Ok(Box::new(ColAlias::new(t, new_column(inner)?))),
            _ => Err(TypeError::malformed(t, "SimpleAggregateFunction takes a function and a type")),
        },
        _ => Err(TypeError::Unsupported(t.to_string())),
    }
}

/// A column whose concrete kind is chosen by the first type it is inferred with.
#[derive(Debug, Default)]
pub struct ColAuto {
    data: Option<Box<dyn Column>>,
}

impl ColAuto {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> Option<&dyn Column> {
        self.data.as_deref()
    }

    pub fn get<T: Column + 'static>(&self) -> Option<&T> {
        self.data.as_ref()?.downcast_ref::<T>()
    }

    pub fn get_mut<T: Column + 'static>(&mut self) -> Option<&mut T> {
        self.data.as_mut()?.downcast_mut::<T>()
    }

    pub fn into_inner(self) -> Option<Box<dyn Column>> {
        self.data
    }
}

#[async_trait]
impl Column for ColAuto {
    /// Empty until inferred.
    fn column_type(&self) -> ColumnType {
        self.data
            .as_ref()
            .map(|c| c.column_type())
            .unwrap_or_default()
    }

    fn rows(&self) -> usize {
        self.data.as_ref().map_or(0, |c| c.rows())
    }

    fn reset(&mut self) {
        if let Some(c) = &mut self.data {
            c.reset();
        }
    }

    fn encode_column(&self, buf: &mut Buffer) {
        if let Some(c) = &self.data {
            c.encode_column(buf);
        }
    }

    async fn decode_column(&mut self, r: &mut Reader<'_>, rows: usize) -> Result<()> {
        match &mut self.data {
            Some(c) => c.decode_column(r, rows).await,
            None if rows == 0 => Ok(()),
            None => Err(DecodeError::invalid("column decoded before its type was inferred").into()),
        }
    }

    fn prepare(&mut self) -> Result<()> {
        match &mut self.data {
            Some(c) => c.prepare(),
            None => Ok(()),
        }
    }

    fn encode_state(&self, buf: &mut Buffer) {
        if let Some(c) = &self.data {
            c.encode_state(buf);
        }
    }

    async fn decode_state(&mut self, r: &mut Reader<'_>) -> Result<()> {
        match &mut self.data {
            Some(c) => c.decode_state(r).await,
            None => Ok(()),
        }
    }

    fn infer(&mut self, t: &ColumnType) -> std::result::Result<(), TypeError> {
        match &mut self.data {
            Some(c) => c.infer(t),
            None => {
                self.data = Some(new_column(t.as_str())?);
                Ok(())
            }
        }
    }

    impl_as_any!();
}
