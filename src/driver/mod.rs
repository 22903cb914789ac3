//! ClickHouse Driver Module (async I/O)
//!
//! Connection methods are split across modules for easier maintenance:
//! - `connection.rs` - Core struct, deadlines, close
//! - `session.rs` - handshake, ping, query, insert, result streaming
//! - `pool.rs` - admission control, idle list, dial supervisor
//! - `retry.rs` - jittered backoff for transient errors
//! - `cursor.rs` - streaming block and row cursors
//! - `hook.rs` - query observers

mod connection;
mod cursor;
mod dialer;
mod hook;
mod pool;
mod retry;
mod row;
mod session;
mod stream;

pub use connection::ChConnection;
pub use cursor::{BlockCursor, Rows};
pub use dialer::{Dialer, TcpDialer};
pub use hook::{QueryEvent, QueryHook, TracingHook, query_operation};
pub use pool::{ChPool, PoolStats, PooledConnection};
pub use retry::RetryPolicy;
pub use row::{ChRow, Row, block_from_rows};
pub use session::{QueryOptions, QueryResult};
pub use stream::ChStream;

use crate::config::ChConfig;
use crate::error::{ChError, ChResult};
use crate::types::Block;
use cursor::Finish;
use hook::Hooks;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Client-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub queries: u64,
    pub errors: u64,
}

pub(crate) struct ClientInner {
    pool: ChPool,
    retry: RetryPolicy,
    hooks: RwLock<Hooks>,
    queries: AtomicU64,
    errors: AtomicU64,
}

impl ClientInner {
    fn hooks(&self) -> std::sync::RwLockReadGuard<'_, Hooks> {
        self.hooks.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count the statement and run `before_query` hooks.
    fn start(&self, query: &str) -> ChResult<QueryEvent> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let event = QueryEvent::new(query);
        let hooks = self.hooks();
        if !hooks.is_empty()
            && let Err(err) = hooks.before(&event)
        {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }
        Ok(event)
    }

    pub(crate) fn finish(&self, event: &mut QueryEvent, rows: u64, error: Option<&ChError>) {
        if error.is_some() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        event.finish(rows);
        self.hooks().after(event, error);
    }

    fn settings(&self) -> &std::collections::BTreeMap<String, crate::protocol::SettingValue> {
        &self.pool.config().settings
    }
}

/// Pooled ClickHouse client. Cheap to clone; clones share the pool.
///
/// # Example
/// ```ignore
/// let client = ChClient::from_dsn("clickhouse://default@localhost:9000/default")?;
/// client.exec("CREATE TABLE t (id UInt64) ENGINE = Memory").await?;
///
/// let mut block = Block::with_columns([("id", "UInt64")])?;
/// block.push_row([Value::from(1u64)])?;
/// client.insert("t", block).await?;
///
/// let mut rows = client.query("SELECT id FROM t").await?.rows();
/// while let Some(row) = rows.next().await {
///     println!("{}", row.int(0));
/// }
/// rows.close().await?;
/// ```
#[derive(Clone)]
pub struct ChClient {
    inner: Arc<ClientInner>,
}

impl ChClient {
    pub fn new(config: ChConfig) -> ChResult<Self> {
        Ok(Self::from_pool(ChPool::new(config)?))
    }

    pub fn from_dsn(dsn: &str) -> ChResult<Self> {
        Self::new(ChConfig::from_dsn(dsn)?)
    }

    /// Client over an existing pool, e.g. one with a custom [`Dialer`].
    pub fn from_pool(pool: ChPool) -> Self {
        let retry = RetryPolicy::from_config(pool.config());
        Self {
            inner: Arc::new(ClientInner {
                pool,
                retry,
                hooks: RwLock::new(Hooks::default()),
                queries: AtomicU64::new(0),
                errors: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ChConfig {
        self.inner.pool.config()
    }

    pub fn pool(&self) -> &ChPool {
        &self.inner.pool
    }

    /// Register a hook for every later statement, in all clones.
    pub fn add_query_hook(&self, hook: impl QueryHook + 'static) {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Box::new(hook));
    }

    /// Run a statement, discarding any result rows.
    pub async fn exec(&self, query: &str) -> ChResult<QueryResult> {
        self.exec_with(query, &QueryOptions::default()).await
    }

    pub async fn exec_with(&self, query: &str, opts: &QueryOptions) -> ChResult<QueryResult> {
        let mut event = self.inner.start(query)?;
        let res = self
            .inner
            .retry
            .run(opts.deadline, move |_| self.exec_once(query, opts))
            .await;
        match &res {
            Ok(result) => self.inner.finish(&mut event, result.rows, None),
            Err(err) => self.inner.finish(&mut event, 0, Some(err)),
        }
        res
    }

    async fn exec_once(&self, query: &str, opts: &QueryOptions) -> ChResult<QueryResult> {
        let mut conn = self.inner.pool.get(opts.deadline).await?;
        let res = conn.exec(query, opts, self.inner.settings()).await;
        conn.release(res.as_ref().err());
        res
    }

    /// Start a streaming query.
    ///
    /// Retries cover everything up to the first result block, so a server
    /// error raised before any data arrives is retried like any other.
    pub async fn query(&self, query: &str) -> ChResult<BlockCursor> {
        self.query_with(query, &QueryOptions::default()).await
    }

    pub async fn query_with(&self, query: &str, opts: &QueryOptions) -> ChResult<BlockCursor> {
        let mut event = self.inner.start(query)?;
        let opened = self
            .inner
            .retry
            .run(opts.deadline, move |_| self.open_cursor(query, opts))
            .await;
        match opened {
            Ok((conn, result, first)) => Ok(BlockCursor::new(
                conn,
                opts.deadline,
                result,
                first,
                Finish {
                    client: self.inner.clone(),
                    event,
                },
            )),
            Err(err) => {
                self.inner.finish(&mut event, 0, Some(&err));
                Err(err)
            }
        }
    }

    async fn open_cursor(
        &self,
        query: &str,
        opts: &QueryOptions,
    ) -> ChResult<(PooledConnection, QueryResult, Option<Block>)> {
        let mut conn = self.inner.pool.get(opts.deadline).await?;
        let mut result = QueryResult::default();
        let opened = match conn.send_query(query, opts, self.inner.settings()).await {
            Ok(()) => conn.next_block(opts.deadline, &mut result).await,
            Err(err) => Err(err),
        };
        match opened {
            Ok(first) => Ok((conn, result, first)),
            Err(err) => {
                conn.release(Some(&err));
                Err(err)
            }
        }
    }

    /// Run a query and map every row through [`ChRow::from_row`].
    pub async fn fetch_all<T: ChRow>(&self, query: &str) -> ChResult<Vec<T>> {
        let mut rows = self.query(query).await?.rows();
        let mut out = Vec::new();
        while let Some(row) = rows.next().await {
            out.push(T::from_row(&row)?);
        }
        rows.close().await?;
        Ok(out)
    }

    /// Insert one block into `table`, naming its columns explicitly.
    pub async fn insert(&self, table: &str, block: Block) -> ChResult<QueryResult> {
        let query = insert_query(table, &block);
        self.insert_blocks(&query, &[block]).await
    }

    /// Insert typed rows into `table` as a single block.
    pub async fn insert_rows<T: ChRow>(&self, table: &str, rows: &[T]) -> ChResult<QueryResult> {
        self.insert(table, block_from_rows(rows)?).await
    }

    /// Run an `INSERT ... VALUES` statement with `blocks` as its data.
    pub async fn insert_blocks(&self, query: &str, blocks: &[Block]) -> ChResult<QueryResult> {
        self.insert_blocks_with(query, blocks, &QueryOptions::default())
            .await
    }

    pub async fn insert_blocks_with(
        &self,
        query: &str,
        blocks: &[Block],
        opts: &QueryOptions,
    ) -> ChResult<QueryResult> {
        let mut event = self.inner.start(query)?;
        let res = self
            .inner
            .retry
            .run(opts.deadline, move |_| self.insert_once(query, blocks, opts))
            .await;
        match &res {
            Ok(result) => self.inner.finish(&mut event, result.rows, None),
            Err(err) => self.inner.finish(&mut event, 0, Some(err)),
        }
        res
    }

    async fn insert_once(
        &self,
        query: &str,
        blocks: &[Block],
        opts: &QueryOptions,
    ) -> ChResult<QueryResult> {
        let mut conn = self.inner.pool.get(opts.deadline).await?;
        let res = conn.insert(query, opts, self.inner.settings(), blocks).await;
        conn.release(res.as_ref().err());
        res
    }

    /// Check out a connection and round-trip a Ping.
    pub async fn ping(&self) -> ChResult<()> {
        let mut conn = self.inner.pool.get(None).await?;
        let res = conn.ping(None).await;
        conn.release(res.as_ref().err());
        res
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            queries: self.inner.queries.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Close the pool. Idempotent.
    pub async fn close(&self) -> ChResult<()> {
        self.inner.pool.close().await
    }
}

impl std::fmt::Debug for ChClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChClient")
            .field("pool", &self.inner.pool)
            .field("stats", &self.stats())
            .finish()
    }
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

fn insert_query(table: &str, block: &Block) -> String {
    let columns: Vec<String> = block.columns().iter().map(|c| quote_ident(c.name())).collect();
    format!("INSERT INTO {} ({}) VALUES", table, columns.join(", "))
}
