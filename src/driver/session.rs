//! Request state machines over one connection: handshake, ping, query,
//! insert and result streaming.

use super::connection::ChConnection;
use crate::error::{ChResult, ProtocolError};
use crate::protocol::packet::{self, ClientInfo, QueryPacket, ServerPacket};
use crate::protocol::{ProfileInfo, Progress, SettingValue, TraceContext};
use crate::types::Block;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Per-query options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Sent as the query id; the server assigns one when empty.
    pub query_id: String,
    /// Merged over the client-wide settings.
    pub settings: BTreeMap<String, SettingValue>,
    /// Caller deadline. Bounds every I/O step and the whole retry loop.
    pub deadline: Option<Instant>,
    pub trace: Option<TraceContext>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query_id(mut self, id: impl Into<String>) -> Self {
        self.query_id = id.into();
        self
    }

    pub fn setting(mut self, key: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `timeout` from now.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline(Instant::now() + timeout)
    }

    pub fn trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }
}

/// Accounting for one finished (or partially read) request.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub progress: Progress,
    pub profile: Option<ProfileInfo>,
    /// Data rows received, or written for inserts.
    pub rows: u64,
    pub blocks: u64,
    pub totals: Option<Block>,
    pub extremes: Option<Block>,
}

impl ChConnection {
    /// Exchange Hello packets. Fails if this connection already has one.
    pub async fn handshake(
        &mut self,
        database: &str,
        user: &str,
        password: &str,
        deadline: Option<Instant>,
    ) -> ChResult<()> {
        if self.server_info().is_some() {
            return Err(ProtocolError::DuplicateHello.into());
        }

        self.begin_exchange();
        self.with_writer(deadline, |w| {
            packet::write_hello(w, database, user, password);
            Ok(())
        })
        .await?;

        match self.read_packet(deadline).await? {
            ServerPacket::Hello(info) => {
                tracing::debug!(
                    conn = self.id(),
                    server = %info,
                    revision = info.negotiated_revision(),
                    "handshake complete"
                );
                self.set_server_info(info)?;
                self.end_exchange();
                Ok(())
            }
            ServerPacket::Exception(err) => {
                tracing::warn!(conn = self.id(), error = %err, "handshake rejected");
                Err(err.into())
            }
            other => Err(other.unexpected("waiting for hello").into()),
        }
    }

    /// Round-trip a Ping. Progress and end-of-stream leftovers are skipped.
    pub async fn ping(&mut self, deadline: Option<Instant>) -> ChResult<()> {
        self.begin_exchange();
        self.with_writer(deadline, |w| {
            packet::write_ping(w);
            Ok(())
        })
        .await?;

        loop {
            match self.read_packet(deadline).await? {
                ServerPacket::Pong => {
                    self.end_exchange();
                    return Ok(());
                }
                ServerPacket::Exception(err) => {
                    self.end_exchange();
                    return Err(err.into());
                }
                ServerPacket::Progress(_)
                | ServerPacket::EndOfStream
                | ServerPacket::ProfileInfo(_) => continue,
                other => return Err(other.unexpected("waiting for pong").into()),
            }
        }
    }

    /// Send a Query packet and the empty block that ends external data.
    pub(crate) async fn send_query(
        &mut self,
        query: &str,
        opts: &QueryOptions,
        base_settings: &BTreeMap<String, SettingValue>,
    ) -> ChResult<()> {
        let mut settings = base_settings.clone();
        settings.extend(opts.settings.iter().map(|(k, v)| (k.clone(), v.clone())));
        let client = ClientInfo::from_env(self.local_addr().to_string());
        let rev = self.revision();
        let compression = self.compression;

        self.begin_exchange();
        self.touch();
        self.with_writer(opts.deadline, |w| {
            QueryPacket {
                id: &opts.query_id,
                query,
                settings: &settings,
                trace: opts.trace.as_ref(),
                compression,
                client: &client,
            }
            .encode(w, rev)
        })
        .await
    }

    /// Next row-carrying block of the current query, or `None` at end of
    /// stream. Header-only (zero-row) data blocks are skipped.
    pub(crate) async fn next_block(
        &mut self,
        deadline: Option<Instant>,
        result: &mut QueryResult,
    ) -> ChResult<Option<Block>> {
        loop {
            match self.read_packet(deadline).await? {
                ServerPacket::Data(block) => {
                    if block.is_empty() {
                        continue;
                    }
                    result.rows += block.num_rows() as u64;
                    result.blocks += 1;
                    return Ok(Some(block));
                }
                ServerPacket::Totals(block) => {
                    result.totals = Some(block.clone());
                    return Ok(Some(block));
                }
                ServerPacket::Extremes(block) => {
                    result.extremes = Some(block.clone());
                    return Ok(Some(block));
                }
                ServerPacket::Progress(p) => result.progress.merge(&p),
                ServerPacket::ProfileInfo(p) => result.profile = Some(p),
                ServerPacket::ProfileEvents(_) | ServerPacket::TableColumns { .. } => {}
                ServerPacket::Log(block) => log_server_block(self.id(), &block),
                ServerPacket::Exception(err) => {
                    // Before any data the exchange is over and the conn is
                    // clean; mid-stream it is discarded.
                    if result.blocks == 0 {
                        self.end_exchange();
                    }
                    return Err(err.into());
                }
                ServerPacket::EndOfStream => {
                    self.end_exchange();
                    return Ok(None);
                }
                other => return Err(other.unexpected("reading query result").into()),
            }
        }
    }

    /// Run a statement and discard any result rows.
    pub(crate) async fn exec(
        &mut self,
        query: &str,
        opts: &QueryOptions,
        base_settings: &BTreeMap<String, SettingValue>,
    ) -> ChResult<QueryResult> {
        self.send_query(query, opts, base_settings).await?;
        let mut result = QueryResult::default();
        while self.next_block(opts.deadline, &mut result).await?.is_some() {}
        Ok(result)
    }

    /// `INSERT ... VALUES` with the rows of `blocks`.
    ///
    /// Column names of every block must match the server's sample block.
    pub(crate) async fn insert(
        &mut self,
        query: &str,
        opts: &QueryOptions,
        base_settings: &BTreeMap<String, SettingValue>,
        blocks: &[Block],
    ) -> ChResult<QueryResult> {
        let deadline = opts.deadline;
        let compression = self.compression;
        self.send_query(query, opts, base_settings).await?;

        let mut result = QueryResult::default();
        let sample = loop {
            match self.read_packet(deadline).await? {
                ServerPacket::Data(block) => break block,
                ServerPacket::Progress(p) => result.progress.merge(&p),
                ServerPacket::TableColumns { .. } | ServerPacket::ProfileEvents(_) => {}
                ServerPacket::Log(block) => log_server_block(self.id(), &block),
                ServerPacket::Exception(err) => {
                    self.end_exchange();
                    return Err(err.into());
                }
                other => return Err(other.unexpected("waiting for insert sample block").into()),
            }
        };

        for block in blocks.iter().filter(|b| !b.is_empty()) {
            check_insert_columns(&sample, block)?;
            self.with_writer(deadline, |w| packet::write_data(w, block, compression))
                .await?;
            result.rows += block.num_rows() as u64;
            result.blocks += 1;
        }
        self.with_writer(deadline, |w| packet::write_data(w, &Block::new(), compression))
            .await?;

        loop {
            match self.read_packet(deadline).await? {
                ServerPacket::EndOfStream => {
                    self.end_exchange();
                    return Ok(result);
                }
                ServerPacket::Progress(p) => result.progress.merge(&p),
                ServerPacket::ProfileInfo(p) => result.profile = Some(p),
                ServerPacket::TableColumns { .. } | ServerPacket::ProfileEvents(_) => {}
                ServerPacket::Log(block) => log_server_block(self.id(), &block),
                ServerPacket::Exception(err) => {
                    self.end_exchange();
                    return Err(err.into());
                }
                other => return Err(other.unexpected("finishing insert").into()),
            }
        }
    }
}

fn check_insert_columns(sample: &Block, block: &Block) -> ChResult<()> {
    let names = |b: &Block| b.columns().iter().map(|c| c.name().to_string()).collect::<Vec<_>>();
    let (expected, got) = (names(sample), names(block));
    if expected != got {
        return Err(ProtocolError::Malformed(format!(
            "insert block has columns {:?}, table expects {:?}",
            got, expected
        ))
        .into());
    }
    Ok(())
}

fn log_server_block(conn: u64, block: &Block) {
    let Some(text) = block.column("text") else {
        return;
    };
    for i in 0..block.num_rows() {
        if let Some(line) = text.value(i) {
            tracing::debug!(conn, text = line.as_str().unwrap_or_default(), "server log");
        }
    }
}
