//! Blocks: equal-length named columns, the unit of data exchange.

use super::column::MAX_COLUMN_ROWS;
use super::{Column, Value};
use crate::error::{ChError, ChResult, ProtocolError};
use crate::protocol::{ChReader, ChWriter};
use tokio::io::AsyncRead;

const BLOCK_INFO_OVERFLOWS: u64 = 1;
const BLOCK_INFO_BUCKET_NUM: u64 = 2;
const BLOCK_INFO_END: u64 = 0;
/// Upper bound on columns per block accepted from the wire.
const MAX_COLUMNS: u64 = 1 << 16;

/// Which server packet a block arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockKind {
    #[default]
    Data,
    Totals,
    Extremes,
    Log,
    ProfileEvents,
}

/// A set of columns with the same row count.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    columns: Vec<Column>,
    rows: usize,
    kind: BlockKind,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty block with the given `(name, type)` columns.
    pub fn with_columns<'a, I>(columns: I) -> ChResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut block = Self::new();
        for (name, ty) in columns {
            block.add_column(name, ty)?;
        }
        Ok(block)
    }

    /// Block from filled columns. All must have the same length.
    pub fn from_columns(columns: Vec<Column>) -> ChResult<Self> {
        let rows = columns.first().map(Column::len).unwrap_or(0);
        if let Some(col) = columns.iter().find(|c| c.len() != rows) {
            return Err(ProtocolError::RowCountMismatch {
                column: col.name().to_string(),
                expected: rows,
                actual: col.len(),
            }
            .into());
        }
        Ok(Self {
            columns,
            rows,
            kind: BlockKind::Data,
        })
    }

    /// Append an empty column. Only valid while the block has no rows.
    pub fn add_column(&mut self, name: &str, type_name: &str) -> ChResult<()> {
        if self.rows > 0 {
            return Err(ProtocolError::RowCountMismatch {
                column: name.to_string(),
                expected: self.rows,
                actual: 0,
            }
            .into());
        }
        self.columns.push(Column::new(name, type_name)?);
        Ok(())
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub(crate) fn set_kind(&mut self, kind: BlockKind) {
        self.kind = kind;
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name() == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name() == name)
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// True for the zero-row block that terminates an insert.
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Values of row `i` in column order.
    pub fn row(&self, i: usize) -> Option<Vec<Value>> {
        if i >= self.rows {
            return None;
        }
        self.columns.iter().map(|c| c.value(i)).collect()
    }

    pub fn rows(&self) -> impl Iterator<Item = Vec<Value>> + '_ {
        (0..self.rows).filter_map(|i| self.row(i))
    }

    /// Append one row, one value per column in column order.
    /// A rejected value leaves the block unchanged.
    pub fn push_row<I>(&mut self, values: I) -> ChResult<()>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let mut values = values.into_iter();
        for i in 0..self.columns.len() {
            let res = match values.next() {
                Some(v) => self.columns[i].push(v),
                None => Err(self.arity_error()),
            };
            if let Err(e) = res {
                self.rollback(i);
                return Err(e);
            }
        }
        if values.next().is_some() {
            self.rollback(self.columns.len());
            return Err(self.arity_error());
        }
        self.rows += 1;
        Ok(())
    }

    fn rollback(&mut self, pushed: usize) {
        let rows = self.rows;
        for col in &mut self.columns[..pushed] {
            col.truncate(rows);
        }
    }

    fn arity_error(&self) -> ChError {
        ProtocolError::InvalidValue {
            column: String::new(),
            message: format!("row does not have {} values", self.columns.len()),
        }
        .into()
    }

    /// Encode block info and columns. Framing is up to the caller.
    pub(crate) fn write_to(&self, wr: &mut ChWriter) -> ChResult<()> {
        if let Some(col) = self.columns.iter().find(|c| c.len() != self.rows) {
            return Err(ProtocolError::RowCountMismatch {
                column: col.name().to_string(),
                expected: self.rows,
                actual: col.len(),
            }
            .into());
        }

        wr.put_uvarint(BLOCK_INFO_OVERFLOWS);
        wr.put_bool(false);
        wr.put_uvarint(BLOCK_INFO_BUCKET_NUM);
        wr.put_i32(-1);
        wr.put_uvarint(BLOCK_INFO_END);

        wr.put_uvarint(self.columns.len() as u64);
        wr.put_uvarint(self.rows as u64);
        for col in &self.columns {
            col.write(wr);
        }
        Ok(())
    }

    pub(crate) async fn read_from<R>(rd: &mut ChReader<R>) -> ChResult<Self>
    where
        R: AsyncRead + Unpin + Send,
    {
        loop {
            match rd.read_uvarint().await? {
                BLOCK_INFO_END => break,
                BLOCK_INFO_OVERFLOWS => {
                    rd.read_bool().await?;
                }
                BLOCK_INFO_BUCKET_NUM => {
                    rd.read_i32().await?;
                }
                other => {
                    return Err(
                        ProtocolError::Malformed(format!("unknown block info field {}", other))
                            .into(),
                    );
                }
            }
        }

        let num_columns = rd.read_uvarint().await?;
        let num_rows = rd.read_uvarint().await?;
        if num_columns > MAX_COLUMNS || num_rows > MAX_COLUMN_ROWS as u64 {
            return Err(ProtocolError::Malformed(format!(
                "block of {} columns by {} rows",
                num_columns, num_rows
            ))
            .into());
        }
        let rows = num_rows as usize;

        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            let name = rd.read_string().await?;
            let type_name = rd.read_string().await?;
            let mut col = Column::new(&name, &type_name)?;
            col.read(rd, rows).await?;
            columns.push(col);
        }

        Ok(Self {
            columns,
            rows,
            kind: BlockKind::Data,
        })
    }
}
