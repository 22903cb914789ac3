//! Streaming query results.

use super::hook::QueryEvent;
use super::pool::PooledConnection;
use super::row::{ChRow, Row};
use super::session::QueryResult;
use super::ClientInner;
use crate::error::{ChError, ChResult};
use crate::types::{Block, BlockKind};
use std::sync::Arc;
use tokio::time::Instant;

/// Hook and stats bookkeeping run once when the cursor ends.
pub(crate) struct Finish {
    pub(crate) client: Arc<ClientInner>,
    pub(crate) event: QueryEvent,
}

/// Lazy, single-pass sequence of result blocks.
///
/// Owns its pooled connection until the server's end of stream, an error,
/// or `close()`. Errors end iteration and are kept for [`err`](Self::err)
/// and [`close`](Self::close). Dropping an unfinished cursor discards the
/// connection.
pub struct BlockCursor {
    conn: Option<PooledConnection>,
    deadline: Option<Instant>,
    result: QueryResult,
    /// Block read while opening the query.
    pending: Option<Block>,
    error: Option<ChError>,
    finish: Option<Finish>,
}

impl BlockCursor {
    pub(crate) fn new(
        conn: PooledConnection,
        deadline: Option<Instant>,
        result: QueryResult,
        first: Option<Block>,
        finish: Finish,
    ) -> Self {
        let mut cursor = Self {
            conn: Some(conn),
            deadline,
            result,
            pending: first,
            error: None,
            finish: Some(finish),
        };
        if cursor.pending.is_none() {
            cursor.release(None);
        }
        cursor
    }

    /// Next block in server order: data blocks, then totals and extremes if
    /// the query has them. `None` at the end or after an error.
    pub async fn next(&mut self) -> Option<Block> {
        if let Some(block) = self.pending.take() {
            return Some(block);
        }
        let conn = self.conn.as_mut()?;
        match conn.next_block(self.deadline, &mut self.result).await {
            Ok(Some(block)) => Some(block),
            Ok(None) => {
                self.release(None);
                None
            }
            Err(err) => {
                self.release(Some(err));
                None
            }
        }
    }

    /// The error that ended iteration, if any.
    pub fn err(&self) -> Option<&ChError> {
        self.error.as_ref()
    }

    /// Progress and row counts so far.
    pub fn result(&self) -> &QueryResult {
        &self.result
    }

    /// True once the connection has been released.
    pub fn is_done(&self) -> bool {
        self.conn.is_none()
    }

    /// Drain the remaining blocks and release the connection.
    pub async fn close(mut self) -> ChResult<QueryResult> {
        self.pending = None;
        while !self.is_done() {
            self.next().await;
        }
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(std::mem::take(&mut self.result)),
        }
    }

    /// Iterate rows instead of blocks. Totals and extremes are skipped; they
    /// stay available on [`QueryResult`].
    pub fn rows(self) -> Rows {
        Rows {
            cursor: self,
            current: Vec::new().into_iter(),
        }
    }

    fn release(&mut self, error: Option<ChError>) {
        if let Some(conn) = self.conn.take() {
            conn.release(error.as_ref());
        }
        if let Some(mut finish) = self.finish.take() {
            finish
                .client
                .finish(&mut finish.event, self.result.rows, error.as_ref());
        }
        self.error = error;
    }
}

impl Drop for BlockCursor {
    fn drop(&mut self) {
        if self.conn.is_some() {
            tracing::debug!("query cursor dropped before end of stream");
            self.release(Some(ChError::Cancelled));
        }
    }
}

impl std::fmt::Debug for BlockCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCursor")
            .field("done", &self.is_done())
            .field("rows", &self.result.rows)
            .field("error", &self.error)
            .finish()
    }
}

/// Row-at-a-time view over a [`BlockCursor`].
#[derive(Debug)]
pub struct Rows {
    cursor: BlockCursor,
    current: std::vec::IntoIter<Row>,
}

impl Rows {
    pub async fn next(&mut self) -> Option<Row> {
        loop {
            if let Some(row) = self.current.next() {
                return Some(row);
            }
            let block = self.cursor.next().await?;
            if block.kind() == BlockKind::Data {
                self.current = Row::from_block(&block).into_iter();
            }
        }
    }

    /// Next row mapped through [`ChRow::from_row`].
    pub async fn next_typed<T: ChRow>(&mut self) -> Option<ChResult<T>> {
        let row = self.next().await?;
        Some(T::from_row(&row))
    }

    pub fn err(&self) -> Option<&ChError> {
        self.cursor.err()
    }

    pub fn result(&self) -> &QueryResult {
        self.cursor.result()
    }

    pub async fn close(self) -> ChResult<QueryResult> {
        self.cursor.close().await
    }
}
