//! Row Helpers
//!
//! Owned per-row views of a [`Block`] and the [`ChRow`] schema trait used for
//! typed fetches and inserts.

use crate::error::{ChResult, ProtocolError};
use crate::types::{Block, Value};
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Trait for types that map to and from a fixed column list.
///
/// ```ignore
/// struct Event { id: u64, name: String }
///
/// impl ChRow for Event {
///     fn columns() -> &'static [(&'static str, &'static str)] {
///         &[("id", "UInt64"), ("name", "String")]
///     }
///
///     fn from_row(row: &Row) -> ChResult<Self> {
///         Ok(Event {
///             id: row.require("id")?.as_u64().unwrap_or_default(),
///             name: row.text_by_name("name"),
///         })
///     }
///
///     fn to_row(&self) -> Vec<Value> {
///         vec![self.id.into(), self.name.as_str().into()]
///     }
/// }
///
/// let events: Vec<Event> = client.fetch_all("SELECT id, name FROM events").await?;
/// client.insert_rows("events", &events).await?;
/// ```
pub trait ChRow: Sized {
    /// Ordered `(name, type)` pairs. `to_row` values follow this order.
    fn columns() -> &'static [(&'static str, &'static str)];

    fn from_row(row: &Row) -> ChResult<Self>;

    fn to_row(&self) -> Vec<Value>;
}

/// Build one insert block from typed rows.
pub fn block_from_rows<T: ChRow>(rows: &[T]) -> ChResult<Block> {
    let mut block = Block::with_columns(T::columns().iter().copied())?;
    for row in rows {
        block.push_row(row.to_row())?;
    }
    Ok(block)
}

/// One row of a result block.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    names: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(names: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { names, values }
    }

    /// All rows of `block`, sharing one copy of the column names.
    pub fn from_block(block: &Block) -> Vec<Row> {
        let names: Arc<[String]> = block
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        block
            .rows()
            .map(|values| Row::new(names.clone(), values))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.get(self.column_index(name)?)
    }

    /// Value of a column that must be present.
    pub fn require(&self, name: &str) -> ChResult<&Value> {
        self.get_by_name(name).ok_or_else(|| {
            ProtocolError::InvalidValue {
                column: name.to_string(),
                message: "column not in result".to_string(),
            }
            .into()
        })
    }

    /// Check if a column is NULL. Missing columns count as NULL.
    pub fn is_null(&self, idx: usize) -> bool {
        self.get(idx).is_none_or(Value::is_null)
    }

    pub fn get_string(&self, idx: usize) -> Option<String> {
        self.get(idx)?.as_str().map(str::to_string)
    }

    pub fn get_i64(&self, idx: usize) -> Option<i64> {
        self.get(idx)?.as_i64()
    }

    pub fn get_u64(&self, idx: usize) -> Option<u64> {
        self.get(idx)?.as_u64()
    }

    pub fn get_f64(&self, idx: usize) -> Option<f64> {
        self.get(idx)?.as_f64()
    }

    pub fn get_bool(&self, idx: usize) -> Option<bool> {
        self.get(idx)?.as_bool()
    }

    pub fn get_uuid(&self, idx: usize) -> Option<Uuid> {
        self.get(idx)?.as_uuid()
    }

    pub fn get_date(&self, idx: usize) -> Option<NaiveDate> {
        self.get(idx)?.as_date()
    }

    pub fn get_datetime(&self, idx: usize) -> Option<DateTime<Utc>> {
        self.get(idx)?.as_datetime()
    }

    // ==================== ERGONOMIC SHORTCUTS ====================

    /// Get string, defaulting to empty string if NULL.
    pub fn text(&self, idx: usize) -> String {
        self.get_string(idx).unwrap_or_default()
    }

    /// Get i64, defaulting to 0 if NULL.
    pub fn int(&self, idx: usize) -> i64 {
        self.get_i64(idx).unwrap_or(0)
    }

    pub fn float(&self, idx: usize) -> f64 {
        self.get_f64(idx).unwrap_or(0.0)
    }

    pub fn boolean(&self, idx: usize) -> bool {
        self.get_bool(idx).unwrap_or(false)
    }

    // ==================== GET BY COLUMN NAME ====================

    pub fn get_string_by_name(&self, name: &str) -> Option<String> {
        self.get_string(self.column_index(name)?)
    }

    pub fn get_i64_by_name(&self, name: &str) -> Option<i64> {
        self.get_i64(self.column_index(name)?)
    }

    pub fn get_u64_by_name(&self, name: &str) -> Option<u64> {
        self.get_u64(self.column_index(name)?)
    }

    pub fn get_f64_by_name(&self, name: &str) -> Option<f64> {
        self.get_f64(self.column_index(name)?)
    }

    pub fn get_bool_by_name(&self, name: &str) -> Option<bool> {
        self.get_bool(self.column_index(name)?)
    }

    pub fn get_uuid_by_name(&self, name: &str) -> Option<Uuid> {
        self.get_uuid(self.column_index(name)?)
    }

    pub fn get_datetime_by_name(&self, name: &str) -> Option<DateTime<Utc>> {
        self.get_datetime(self.column_index(name)?)
    }

    pub fn text_by_name(&self, name: &str) -> String {
        self.get_string_by_name(name).unwrap_or_default()
    }

    pub fn is_null_by_name(&self, name: &str) -> bool {
        self.column_index(name)
            .map(|idx| self.is_null(idx))
            .unwrap_or(true)
    }
}
