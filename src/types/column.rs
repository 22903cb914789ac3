//! Typed column buffers and their native encoding.
//!
//! A column is serialized as an optional prefix (LowCardinality key version,
//! reached through Array and Nullable) followed by the data of every row.

use super::{ColumnType, EnumMapping, Value};
use crate::error::{ChError, ChResult, ProtocolError};
use crate::protocol::{ChReader, ChWriter};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::net::Ipv6Addr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;
use uuid::Uuid;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// LowCardinality serialization version.
const LC_VERSION: i64 = 1;
const LC_HAS_ADDITIONAL_KEYS: i64 = 1 << 9;
const LC_NEED_UPDATE_DICTIONARY: i64 = 1 << 10;
/// Dictionaries larger than this are treated as a corrupt stream.
const LC_MAX_DICT_SIZE: u64 = 1 << 28;
/// Upper bound on values decoded into one column, nested array elements included.
pub(crate) const MAX_COLUMN_ROWS: usize = 1 << 28;
/// Upper bound on the fixed-width payload of one column.
const MAX_COLUMN_BYTES: usize = 1 << 30;
/// Column data is read in pieces of this size, so memory follows the bytes received.
const READ_CHUNK: usize = 64 << 10;

/// Values of one column, one variant per supported encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Bool(Vec<bool>),
    String(Vec<String>),
    Uuid(Vec<Uuid>),
    Date(Vec<NaiveDate>),
    DateTime(Vec<DateTime<Utc>>),
    Ipv6(Vec<Ipv6Addr>),
    /// `offsets[i]` is the end of row `i` in `values`.
    Array {
        offsets: Vec<u64>,
        values: Box<ColumnData>,
    },
    Nullable {
        nulls: Vec<bool>,
        values: Box<ColumnData>,
    },
    LowCardinality(Vec<String>),
    Enum8 {
        mapping: Arc<EnumMapping>,
        codes: Vec<i8>,
    },
    Enum16 {
        mapping: Arc<EnumMapping>,
        codes: Vec<i16>,
    },
}

macro_rules! read_fixed {
    ($rd:expr, $rows:expr, $vec:expr, $ty:ty) => {{
        const WIDTH: usize = std::mem::size_of::<$ty>();
        let buf = read_bytes($rd, $rows, WIDTH).await?;
        $vec.extend(buf.chunks_exact(WIDTH).map(|chunk| {
            let mut bytes = [0u8; WIDTH];
            bytes.copy_from_slice(chunk);
            <$ty>::from_le_bytes(bytes)
        }));
    }};
}

macro_rules! write_fixed {
    ($wr:expr, $vec:expr) => {{
        for v in $vec.iter() {
            $wr.put_raw(&v.to_le_bytes());
        }
    }};
}

fn invalid(msg: impl Into<String>) -> String {
    msg.into()
}

fn int<T: TryFrom<i128>>(v: &Value) -> Result<T, String> {
    v.as_i128()
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| invalid(format!("{} value out of range or not an integer", v.kind())))
}

impl ColumnData {
    pub fn new(ty: &ColumnType) -> Self {
        match ty {
            ColumnType::Int8 => ColumnData::Int8(Vec::new()),
            ColumnType::Int16 => ColumnData::Int16(Vec::new()),
            ColumnType::Int32 => ColumnData::Int32(Vec::new()),
            ColumnType::Int64 => ColumnData::Int64(Vec::new()),
            ColumnType::UInt8 => ColumnData::UInt8(Vec::new()),
            ColumnType::UInt16 => ColumnData::UInt16(Vec::new()),
            ColumnType::UInt32 => ColumnData::UInt32(Vec::new()),
            ColumnType::UInt64 => ColumnData::UInt64(Vec::new()),
            ColumnType::Float32 => ColumnData::Float32(Vec::new()),
            ColumnType::Float64 => ColumnData::Float64(Vec::new()),
            ColumnType::Bool => ColumnData::Bool(Vec::new()),
            ColumnType::String => ColumnData::String(Vec::new()),
            ColumnType::Uuid => ColumnData::Uuid(Vec::new()),
            ColumnType::Date => ColumnData::Date(Vec::new()),
            ColumnType::DateTime(_) => ColumnData::DateTime(Vec::new()),
            ColumnType::Ipv6 => ColumnData::Ipv6(Vec::new()),
            ColumnType::Array(inner) => ColumnData::Array {
                offsets: Vec::new(),
                values: Box::new(ColumnData::new(inner)),
            },
            ColumnType::Nullable(inner) => ColumnData::Nullable {
                nulls: Vec::new(),
                values: Box::new(ColumnData::new(inner)),
            },
            ColumnType::LowCardinality => ColumnData::LowCardinality(Vec::new()),
            ColumnType::Enum8(mapping) => ColumnData::Enum8 {
                mapping: mapping.clone(),
                codes: Vec::new(),
            },
            ColumnType::Enum16(mapping) => ColumnData::Enum16 {
                mapping: mapping.clone(),
                codes: Vec::new(),
            },
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Int8(v) => v.len(),
            ColumnData::Int16(v) => v.len(),
            ColumnData::Int32(v) => v.len(),
            ColumnData::Int64(v) => v.len(),
            ColumnData::UInt8(v) => v.len(),
            ColumnData::UInt16(v) => v.len(),
            ColumnData::UInt32(v) => v.len(),
            ColumnData::UInt64(v) => v.len(),
            ColumnData::Float32(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Bool(v) => v.len(),
            ColumnData::String(v) => v.len(),
            ColumnData::Uuid(v) => v.len(),
            ColumnData::Date(v) => v.len(),
            ColumnData::DateTime(v) => v.len(),
            ColumnData::Ipv6(v) => v.len(),
            ColumnData::Array { offsets, .. } => offsets.len(),
            ColumnData::Nullable { nulls, .. } => nulls.len(),
            ColumnData::LowCardinality(v) => v.len(),
            ColumnData::Enum8 { codes, .. } => codes.len(),
            ColumnData::Enum16 { codes, .. } => codes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep the first `rows` rows.
    pub fn truncate(&mut self, rows: usize) {
        match self {
            ColumnData::Int8(v) => v.truncate(rows),
            ColumnData::Int16(v) => v.truncate(rows),
            ColumnData::Int32(v) => v.truncate(rows),
            ColumnData::Int64(v) => v.truncate(rows),
            ColumnData::UInt8(v) => v.truncate(rows),
            ColumnData::UInt16(v) => v.truncate(rows),
            ColumnData::UInt32(v) => v.truncate(rows),
            ColumnData::UInt64(v) => v.truncate(rows),
            ColumnData::Float32(v) => v.truncate(rows),
            ColumnData::Float64(v) => v.truncate(rows),
            ColumnData::Bool(v) => v.truncate(rows),
            ColumnData::String(v) => v.truncate(rows),
            ColumnData::Uuid(v) => v.truncate(rows),
            ColumnData::Date(v) => v.truncate(rows),
            ColumnData::DateTime(v) => v.truncate(rows),
            ColumnData::Ipv6(v) => v.truncate(rows),
            ColumnData::Array { offsets, values } => {
                offsets.truncate(rows);
                values.truncate(offsets.last().copied().unwrap_or(0) as usize);
            }
            ColumnData::Nullable { nulls, values } => {
                nulls.truncate(rows);
                values.truncate(rows);
            }
            ColumnData::LowCardinality(v) => v.truncate(rows),
            ColumnData::Enum8 { codes, .. } => codes.truncate(rows),
            ColumnData::Enum16 { codes, .. } => codes.truncate(rows),
        }
    }

    /// Value of row `row`, or `None` past the end.
    pub fn value(&self, row: usize) -> Option<Value> {
        if row >= self.len() {
            return None;
        }
        Some(match self {
            ColumnData::Int8(v) => Value::Int8(v[row]),
            ColumnData::Int16(v) => Value::Int16(v[row]),
            ColumnData::Int32(v) => Value::Int32(v[row]),
            ColumnData::Int64(v) => Value::Int64(v[row]),
            ColumnData::UInt8(v) => Value::UInt8(v[row]),
            ColumnData::UInt16(v) => Value::UInt16(v[row]),
            ColumnData::UInt32(v) => Value::UInt32(v[row]),
            ColumnData::UInt64(v) => Value::UInt64(v[row]),
            ColumnData::Float32(v) => Value::Float32(v[row]),
            ColumnData::Float64(v) => Value::Float64(v[row]),
            ColumnData::Bool(v) => Value::Bool(v[row]),
            ColumnData::String(v) => Value::String(v[row].clone()),
            ColumnData::Uuid(v) => Value::Uuid(v[row]),
            ColumnData::Date(v) => Value::Date(v[row]),
            ColumnData::DateTime(v) => Value::DateTime(v[row]),
            ColumnData::Ipv6(v) => Value::Ipv6(v[row]),
            ColumnData::Array { offsets, values } => {
                let start = if row == 0 { 0 } else { offsets[row - 1] as usize };
                let end = offsets[row] as usize;
                Value::Array((start..end).filter_map(|i| values.value(i)).collect())
            }
            ColumnData::Nullable { nulls, values } => {
                if nulls[row] {
                    Value::Null
                } else {
                    values.value(row)?
                }
            }
            ColumnData::LowCardinality(v) => Value::String(v[row].clone()),
            ColumnData::Enum8 { mapping, codes } => {
                Value::String(mapping.name(codes[row] as i16)?.to_string())
            }
            ColumnData::Enum16 { mapping, codes } => {
                Value::String(mapping.name(codes[row])?.to_string())
            }
        })
    }

    /// Append one row. On error nothing is appended.
    pub fn push(&mut self, value: Value) -> Result<(), String> {
        if value.is_null() {
            return match self {
                ColumnData::Nullable { nulls, values } => {
                    values.push_default();
                    nulls.push(true);
                    Ok(())
                }
                _ => Err(invalid("NULL in a non-Nullable column")),
            };
        }

        match self {
            ColumnData::Int8(v) => v.push(int(&value)?),
            ColumnData::Int16(v) => v.push(int(&value)?),
            ColumnData::Int32(v) => v.push(int(&value)?),
            ColumnData::Int64(v) => v.push(int(&value)?),
            ColumnData::UInt8(v) => v.push(int(&value)?),
            ColumnData::UInt16(v) => v.push(int(&value)?),
            ColumnData::UInt32(v) => v.push(int(&value)?),
            ColumnData::UInt64(v) => v.push(int(&value)?),
            ColumnData::Float32(v) => match value {
                Value::Float32(f) => v.push(f),
                other => v.push(other.as_f64().ok_or_else(|| mismatch("Float32", &other))? as f32),
            },
            ColumnData::Float64(v) => {
                v.push(value.as_f64().ok_or_else(|| mismatch("Float64", &value))?)
            }
            ColumnData::Bool(v) => v.push(value.as_bool().ok_or_else(|| mismatch("Bool", &value))?),
            ColumnData::String(v) | ColumnData::LowCardinality(v) => match value {
                Value::String(s) => v.push(s),
                Value::Uuid(u) => v.push(u.to_string()),
                other => return Err(mismatch("String", &other)),
            },
            ColumnData::Uuid(v) => v.push(value.as_uuid().ok_or_else(|| mismatch("UUID", &value))?),
            ColumnData::Date(v) => v.push(value.as_date().ok_or_else(|| mismatch("Date", &value))?),
            ColumnData::DateTime(v) => {
                v.push(value.as_datetime().ok_or_else(|| mismatch("DateTime", &value))?)
            }
            ColumnData::Ipv6(v) => v.push(value.as_ipv6().ok_or_else(|| mismatch("IPv6", &value))?),
            ColumnData::Array { offsets, values } => {
                let items = match value {
                    Value::Array(items) => items,
                    other => return Err(mismatch("Array", &other)),
                };
                let before = values.len();
                for item in items {
                    if let Err(e) = values.push(item) {
                        values.truncate(before);
                        return Err(e);
                    }
                }
                offsets.push(values.len() as u64);
            }
            ColumnData::Nullable { nulls, values } => {
                values.push(value)?;
                nulls.push(false);
            }
            ColumnData::Enum8 { mapping, codes } => {
                let code = enum_code(mapping, &value)?;
                codes.push(i8::try_from(code).map_err(|_| invalid("Enum8 code out of range"))?);
            }
            ColumnData::Enum16 { mapping, codes } => codes.push(enum_code(mapping, &value)?),
        }
        Ok(())
    }

    /// Append the zero value of the type, used under NULL rows.
    fn push_default(&mut self) {
        match self {
            ColumnData::Int8(v) => v.push(0),
            ColumnData::Int16(v) => v.push(0),
            ColumnData::Int32(v) => v.push(0),
            ColumnData::Int64(v) => v.push(0),
            ColumnData::UInt8(v) => v.push(0),
            ColumnData::UInt16(v) => v.push(0),
            ColumnData::UInt32(v) => v.push(0),
            ColumnData::UInt64(v) => v.push(0),
            ColumnData::Float32(v) => v.push(0.0),
            ColumnData::Float64(v) => v.push(0.0),
            ColumnData::Bool(v) => v.push(false),
            ColumnData::String(v) | ColumnData::LowCardinality(v) => v.push(String::new()),
            ColumnData::Uuid(v) => v.push(Uuid::nil()),
            ColumnData::Date(v) => v.push(DateTime::<Utc>::UNIX_EPOCH.date_naive()),
            ColumnData::DateTime(v) => v.push(DateTime::<Utc>::UNIX_EPOCH),
            ColumnData::Ipv6(v) => v.push(Ipv6Addr::UNSPECIFIED),
            ColumnData::Array { offsets, values } => offsets.push(values.len() as u64),
            ColumnData::Nullable { nulls, values } => {
                nulls.push(true);
                values.push_default();
            }
            ColumnData::Enum8 { mapping, codes } => codes.push(mapping.default_code() as i8),
            ColumnData::Enum16 { mapping, codes } => codes.push(mapping.default_code()),
        }
    }

    pub fn read_prefix<'a, R>(&'a mut self, rd: &'a mut ChReader<R>) -> BoxFuture<'a, ChResult<()>>
    where
        R: AsyncRead + Unpin + Send,
    {
        Box::pin(async move {
            match self {
                ColumnData::Array { values, .. } | ColumnData::Nullable { values, .. } => {
                    values.read_prefix(rd).await
                }
                ColumnData::LowCardinality(_) => {
                    let version = rd.read_i64().await?;
                    if version != LC_VERSION {
                        return Err(ProtocolError::Malformed(format!(
                            "unsupported LowCardinality version {}",
                            version
                        ))
                        .into());
                    }
                    Ok(())
                }
                _ => Ok(()),
            }
        })
    }

    /// Decode `rows` rows and append them.
    pub fn read_data<'a, R>(
        &'a mut self,
        rd: &'a mut ChReader<R>,
        rows: usize,
    ) -> BoxFuture<'a, ChResult<()>>
    where
        R: AsyncRead + Unpin + Send,
    {
        Box::pin(async move {
            if rows > MAX_COLUMN_ROWS {
                return Err(ProtocolError::Malformed(format!("column of {} values", rows)).into());
            }
            match self {
                ColumnData::Int8(v) => read_fixed!(rd, rows, v, i8),
                ColumnData::Int16(v) => read_fixed!(rd, rows, v, i16),
                ColumnData::Int32(v) => read_fixed!(rd, rows, v, i32),
                ColumnData::Int64(v) => read_fixed!(rd, rows, v, i64),
                ColumnData::UInt8(v) => read_fixed!(rd, rows, v, u8),
                ColumnData::UInt16(v) => read_fixed!(rd, rows, v, u16),
                ColumnData::UInt32(v) => read_fixed!(rd, rows, v, u32),
                ColumnData::UInt64(v) => read_fixed!(rd, rows, v, u64),
                ColumnData::Float32(v) => read_fixed!(rd, rows, v, f32),
                ColumnData::Float64(v) => read_fixed!(rd, rows, v, f64),
                ColumnData::Bool(v) => {
                    let buf = read_bytes(rd, rows, 1).await?;
                    v.extend(buf.iter().map(|b| *b != 0));
                }
                ColumnData::String(v) => {
                    v.reserve(rows.min(READ_CHUNK));
                    for _ in 0..rows {
                        v.push(rd.read_string().await?);
                    }
                }
                ColumnData::Uuid(v) => {
                    v.reserve(rows.min(READ_CHUNK));
                    for _ in 0..rows {
                        v.push(rd.read_uuid().await?);
                    }
                }
                ColumnData::Date(v) => {
                    v.reserve(rows.min(READ_CHUNK));
                    for _ in 0..rows {
                        v.push(rd.read_date().await?);
                    }
                }
                ColumnData::DateTime(v) => {
                    v.reserve(rows.min(READ_CHUNK));
                    for _ in 0..rows {
                        v.push(rd.read_datetime().await?);
                    }
                }
                ColumnData::Ipv6(v) => {
                    let buf = read_bytes(rd, rows, 16).await?;
                    v.extend(buf.chunks_exact(16).map(|chunk| {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(chunk);
                        Ipv6Addr::from(octets)
                    }));
                }
                ColumnData::Array { offsets, values } => {
                    let base = values.len() as u64;
                    let mut prev = 0u64;
                    offsets.reserve(rows.min(READ_CHUNK));
                    for _ in 0..rows {
                        let end = rd.read_u64().await?;
                        if end < prev {
                            return Err(
                                ProtocolError::Malformed("array offsets decrease".to_string()).into()
                            );
                        }
                        if end > MAX_COLUMN_ROWS as u64 {
                            return Err(ProtocolError::Malformed(format!(
                                "array offset {} past the element bound",
                                end
                            ))
                            .into());
                        }
                        prev = end;
                        offsets.push(base + end);
                    }
                    values.read_data(rd, prev as usize).await?;
                }
                ColumnData::Nullable { nulls, values } => {
                    let buf = read_bytes(rd, rows, 1).await?;
                    nulls.extend(buf.iter().map(|b| *b != 0));
                    values.read_data(rd, rows).await?;
                }
                ColumnData::LowCardinality(v) => read_low_cardinality(rd, rows, v).await?,
                ColumnData::Enum8 { mapping, codes } => {
                    let buf = read_bytes(rd, rows, 1).await?;
                    for b in buf {
                        let code = b as i8;
                        check_enum_code(mapping, code as i16)?;
                        codes.push(code);
                    }
                }
                ColumnData::Enum16 { mapping, codes } => {
                    for _ in 0..rows {
                        let code = rd.read_i16().await?;
                        check_enum_code(mapping, code)?;
                        codes.push(code);
                    }
                }
            }
            Ok(())
        })
    }

    pub fn write_prefix(&self, wr: &mut ChWriter) {
        match self {
            ColumnData::Array { values, .. } | ColumnData::Nullable { values, .. } => {
                values.write_prefix(wr)
            }
            ColumnData::LowCardinality(_) => wr.put_i64(LC_VERSION),
            _ => {}
        }
    }

    pub fn write_data(&self, wr: &mut ChWriter) {
        match self {
            ColumnData::Int8(v) => write_fixed!(wr, v),
            ColumnData::Int16(v) => write_fixed!(wr, v),
            ColumnData::Int32(v) => write_fixed!(wr, v),
            ColumnData::Int64(v) => write_fixed!(wr, v),
            ColumnData::UInt8(v) => wr.put_raw(v),
            ColumnData::UInt16(v) => write_fixed!(wr, v),
            ColumnData::UInt32(v) => write_fixed!(wr, v),
            ColumnData::UInt64(v) => write_fixed!(wr, v),
            ColumnData::Float32(v) => write_fixed!(wr, v),
            ColumnData::Float64(v) => write_fixed!(wr, v),
            ColumnData::Bool(v) => v.iter().for_each(|b| wr.put_bool(*b)),
            ColumnData::String(v) => v.iter().for_each(|s| wr.put_str(s)),
            ColumnData::Uuid(v) => v.iter().for_each(|u| wr.put_uuid(u)),
            ColumnData::Date(v) => v.iter().for_each(|d| wr.put_date(*d)),
            ColumnData::DateTime(v) => v.iter().for_each(|t| wr.put_datetime(t)),
            ColumnData::Ipv6(v) => v.iter().for_each(|ip| wr.put_raw(&ip.octets())),
            ColumnData::Array { offsets, values } => {
                write_fixed!(wr, offsets);
                values.write_data(wr);
            }
            ColumnData::Nullable { nulls, values } => {
                nulls.iter().for_each(|n| wr.put_bool(*n));
                values.write_data(wr);
            }
            ColumnData::LowCardinality(v) => write_low_cardinality(wr, v),
            ColumnData::Enum8 { codes, .. } => codes.iter().for_each(|c| wr.put_i8(*c)),
            ColumnData::Enum16 { codes, .. } => write_fixed!(wr, codes),
        }
    }
}

/// Read `rows * width` bytes, growing the buffer only as data arrives.
async fn read_bytes<R>(rd: &mut ChReader<R>, rows: usize, width: usize) -> ChResult<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    let total = rows
        .checked_mul(width)
        .filter(|n| *n <= MAX_COLUMN_BYTES)
        .ok_or_else(|| {
            ProtocolError::Malformed(format!("column of {} values of {} bytes", rows, width))
        })?;
    let mut buf = Vec::with_capacity(total.min(READ_CHUNK));
    while buf.len() < total {
        let start = buf.len();
        buf.resize(start + (total - start).min(READ_CHUNK), 0);
        rd.read_exact(&mut buf[start..]).await?;
    }
    Ok(buf)
}

fn mismatch(expected: &str, value: &Value) -> String {
    format!("expected {}, got {}", expected, value.kind())
}

fn enum_code(mapping: &EnumMapping, value: &Value) -> Result<i16, String> {
    match value {
        Value::String(name) => mapping
            .code(name)
            .ok_or_else(|| format!("'{}' is not an enum value", name)),
        other => {
            let code: i16 = int(other)?;
            mapping
                .name(code)
                .map(|_| code)
                .ok_or_else(|| format!("{} is not an enum code", code))
        }
    }
}

fn check_enum_code(mapping: &EnumMapping, code: i16) -> ChResult<()> {
    if mapping.name(code).is_none() {
        return Err(ProtocolError::Malformed(format!("unknown enum code {}", code)).into());
    }
    Ok(())
}

/// Dictionary index width, from the low bits of the serialization flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyType {
    U8 = 0,
    U16 = 1,
    U32 = 2,
    U64 = 3,
}

impl KeyType {
    fn for_dict_len(len: usize) -> Self {
        if len <= u8::MAX as usize {
            KeyType::U8
        } else if len <= u16::MAX as usize {
            KeyType::U16
        } else if len <= u32::MAX as usize {
            KeyType::U32
        } else {
            KeyType::U64
        }
    }

    fn from_flags(flags: i64) -> ChResult<Self> {
        match flags & 0xf {
            0 => Ok(KeyType::U8),
            1 => Ok(KeyType::U16),
            2 => Ok(KeyType::U32),
            3 => Ok(KeyType::U64),
            other => Err(ProtocolError::Malformed(format!(
                "unknown LowCardinality key type {}",
                other
            ))
            .into()),
        }
    }
}

async fn read_low_cardinality<R>(
    rd: &mut ChReader<R>,
    rows: usize,
    out: &mut Vec<String>,
) -> ChResult<()>
where
    R: AsyncRead + Unpin + Send,
{
    // Nothing is written for zero rows, e.g. under empty arrays.
    if rows == 0 {
        return Ok(());
    }
    let key_type = KeyType::from_flags(rd.read_i64().await?)?;

    let dict_size = rd.read_u64().await?;
    if dict_size > LC_MAX_DICT_SIZE {
        return Err(ProtocolError::Malformed(format!(
            "LowCardinality dictionary of {} entries",
            dict_size
        ))
        .into());
    }
    let mut dict = Vec::with_capacity((dict_size as usize).min(READ_CHUNK));
    for _ in 0..dict_size {
        dict.push(rd.read_string().await?);
    }

    let num_keys = rd.read_u64().await?;
    if num_keys != rows as u64 {
        return Err(ProtocolError::Malformed(format!(
            "LowCardinality has {} keys for {} rows",
            num_keys, rows
        ))
        .into());
    }

    out.reserve(rows.min(READ_CHUNK));
    for _ in 0..rows {
        let key = match key_type {
            KeyType::U8 => rd.read_u8().await? as u64,
            KeyType::U16 => rd.read_u16().await? as u64,
            KeyType::U32 => rd.read_u32().await? as u64,
            KeyType::U64 => rd.read_u64().await?,
        };
        let value = dict.get(key as usize).ok_or_else(|| {
            ChError::from(ProtocolError::Malformed(format!(
                "LowCardinality key {} outside dictionary of {}",
                key,
                dict.len()
            )))
        })?;
        out.push(value.clone());
    }
    Ok(())
}

fn write_low_cardinality(wr: &mut ChWriter, values: &[String]) {
    if values.is_empty() {
        return;
    }

    let mut index: HashMap<&str, u64> = HashMap::new();
    let mut dict: Vec<&str> = Vec::new();
    let keys: Vec<u64> = values
        .iter()
        .map(|s| {
            *index.entry(s.as_str()).or_insert_with(|| {
                dict.push(s.as_str());
                (dict.len() - 1) as u64
            })
        })
        .collect();

    let key_type = KeyType::for_dict_len(dict.len());
    wr.put_i64(key_type as i64 | LC_HAS_ADDITIONAL_KEYS | LC_NEED_UPDATE_DICTIONARY);
    wr.put_i64(dict.len() as i64);
    for s in &dict {
        wr.put_str(s);
    }
    wr.put_i64(keys.len() as i64);
    for key in keys {
        match key_type {
            KeyType::U8 => wr.put_u8(key as u8),
            KeyType::U16 => wr.put_u16(key as u16),
            KeyType::U32 => wr.put_u32(key as u32),
            KeyType::U64 => wr.put_u64(key),
        }
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    type_name: String,
    ty: ColumnType,
    data: ColumnData,
}

impl Column {
    pub fn new(name: &str, type_name: &str) -> ChResult<Self> {
        if name.is_empty() {
            return Err(ProtocolError::EmptyColumnName.into());
        }
        if type_name.is_empty() {
            return Err(ProtocolError::EmptyColumnType(name.to_string()).into());
        }
        let ty = ColumnType::parse(type_name)?;
        Ok(Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            data: ColumnData::new(&ty),
            ty,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type descriptor exactly as sent by the server or given by the caller.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn column_type(&self) -> &ColumnType {
        &self.ty
    }

    pub fn data(&self) -> &ColumnData {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn value(&self, row: usize) -> Option<Value> {
        self.data.value(row)
    }

    pub fn push(&mut self, value: impl Into<Value>) -> ChResult<()> {
        self.data
            .push(value.into())
            .map_err(|message| ProtocolError::InvalidValue {
                column: self.name.clone(),
                message,
            })?;
        Ok(())
    }

    pub(crate) fn truncate(&mut self, rows: usize) {
        self.data.truncate(rows);
    }

    pub(crate) async fn read<R>(&mut self, rd: &mut ChReader<R>, rows: usize) -> ChResult<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        if rows == 0 {
            return Ok(());
        }
        self.data.read_prefix(rd).await?;
        self.data.read_data(rd, rows).await
    }

    pub(crate) fn write(&self, wr: &mut ChWriter) {
        wr.put_str(&self.name);
        wr.put_str(&self.type_name);
        if self.data.is_empty() {
            return;
        }
        self.data.write_prefix(wr);
        self.data.write_data(wr);
    }
}
