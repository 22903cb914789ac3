//! Columnar data model: type descriptors, column buffers and blocks.

pub mod block;
pub mod column;
pub mod enums;
pub mod value;

pub use block::{Block, BlockKind};
pub use column::{Column, ColumnData};
pub use enums::EnumMapping;
pub use value::Value;

use crate::error::{ChResult, ProtocolError};
use std::fmt;
use std::sync::Arc;

/// A parsed column type descriptor such as `Array(Nullable(UInt64))`.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Bool,
    String,
    Uuid,
    Date,
    /// Optional timezone argument, kept for the type name only.
    DateTime(Option<String>),
    /// 16 bytes in network order.
    Ipv6,
    Array(Box<ColumnType>),
    Nullable(Box<ColumnType>),
    /// Dictionary-encoded strings.
    LowCardinality,
    Enum8(Arc<EnumMapping>),
    Enum16(Arc<EnumMapping>),
}

impl ColumnType {
    pub fn parse(s: &str) -> ChResult<Self> {
        let s = s.trim();
        let unsupported = || ProtocolError::UnsupportedType(s.to_string());

        let simple = match s {
            "Int8" => Some(ColumnType::Int8),
            "Int16" => Some(ColumnType::Int16),
            "Int32" => Some(ColumnType::Int32),
            "Int64" => Some(ColumnType::Int64),
            "UInt8" => Some(ColumnType::UInt8),
            "UInt16" => Some(ColumnType::UInt16),
            "UInt32" => Some(ColumnType::UInt32),
            "UInt64" => Some(ColumnType::UInt64),
            "Float32" => Some(ColumnType::Float32),
            "Float64" => Some(ColumnType::Float64),
            "Bool" | "Boolean" => Some(ColumnType::Bool),
            "String" => Some(ColumnType::String),
            "UUID" => Some(ColumnType::Uuid),
            "Date" => Some(ColumnType::Date),
            "DateTime" => Some(ColumnType::DateTime(None)),
            "IPv6" => Some(ColumnType::Ipv6),
            _ => None,
        };
        if let Some(ty) = simple {
            return Ok(ty);
        }

        let (name, args) = s
            .split_once('(')
            .and_then(|(name, rest)| Some((name.trim(), rest.strip_suffix(')')?)))
            .ok_or_else(unsupported)?;

        match name {
            "Array" => Ok(ColumnType::Array(Box::new(Self::parse(args)?))),
            "Nullable" => {
                let inner = Self::parse(args)?;
                if matches!(
                    inner,
                    ColumnType::Nullable(_) | ColumnType::Array(_) | ColumnType::LowCardinality
                ) {
                    return Err(unsupported().into());
                }
                Ok(ColumnType::Nullable(Box::new(inner)))
            }
            "LowCardinality" => match Self::parse(args)? {
                ColumnType::String => Ok(ColumnType::LowCardinality),
                _ => Err(unsupported().into()),
            },
            "DateTime" => {
                let tz = args.trim().trim_matches('\'').to_string();
                Ok(ColumnType::DateTime(Some(tz)))
            }
            "Enum8" => Ok(ColumnType::Enum8(Arc::new(EnumMapping::parse(args)?))),
            "Enum16" => Ok(ColumnType::Enum16(Arc::new(EnumMapping::parse(args)?))),
            "SimpleAggregateFunction" => {
                let (_, inner) = split_top_level(args).ok_or_else(unsupported)?;
                Self::parse(inner)
            }
            _ => Err(unsupported().into()),
        }
    }

    /// Encoded width in bytes for fixed-width types.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            ColumnType::Int8 | ColumnType::UInt8 | ColumnType::Bool => Some(1),
            ColumnType::Int16 | ColumnType::UInt16 | ColumnType::Date => Some(2),
            ColumnType::Int32 | ColumnType::UInt32 | ColumnType::Float32 => Some(4),
            ColumnType::DateTime(_) => Some(4),
            ColumnType::Int64 | ColumnType::UInt64 | ColumnType::Float64 => Some(8),
            ColumnType::Uuid | ColumnType::Ipv6 => Some(16),
            ColumnType::Enum8(_) => Some(1),
            ColumnType::Enum16(_) => Some(2),
            _ => None,
        }
    }
}

/// Split `a, b` at the first comma outside parentheses and quotes.
fn split_top_level(s: &str) -> Option<(&str, &str)> {
    let mut depth = 0i32;
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth -= 1,
            ',' if !quoted && depth == 0 => return Some((s[..i].trim(), s[i + 1..].trim())),
            _ => {}
        }
    }
    None
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Int8 => f.write_str("Int8"),
            ColumnType::Int16 => f.write_str("Int16"),
            ColumnType::Int32 => f.write_str("Int32"),
            ColumnType::Int64 => f.write_str("Int64"),
            ColumnType::UInt8 => f.write_str("UInt8"),
            ColumnType::UInt16 => f.write_str("UInt16"),
            ColumnType::UInt32 => f.write_str("UInt32"),
            ColumnType::UInt64 => f.write_str("UInt64"),
            ColumnType::Float32 => f.write_str("Float32"),
            ColumnType::Float64 => f.write_str("Float64"),
            ColumnType::Bool => f.write_str("Bool"),
            ColumnType::String => f.write_str("String"),
            ColumnType::Uuid => f.write_str("UUID"),
            ColumnType::Date => f.write_str("Date"),
            ColumnType::DateTime(None) => f.write_str("DateTime"),
            ColumnType::DateTime(Some(tz)) => write!(f, "DateTime('{}')", tz),
            ColumnType::Ipv6 => f.write_str("IPv6"),
            ColumnType::Array(inner) => write!(f, "Array({})", inner),
            ColumnType::Nullable(inner) => write!(f, "Nullable({})", inner),
            ColumnType::LowCardinality => f.write_str("LowCardinality(String)"),
            ColumnType::Enum8(mapping) => write!(f, "Enum8({})", mapping),
            ColumnType::Enum16(mapping) => write!(f, "Enum16({})", mapping),
        }
    }
}
