//! A single server connection: socket, codecs and lifecycle metadata.

use super::dialer::Dialer;
use super::stream::ChStream;
use crate::config::ChConfig;
use crate::error::{ChError, ChResult, ProtocolError, TransportError};
use crate::protocol::packet::{self, ServerPacket};
use crate::protocol::{ChReader, ChWriter, ServerInfo, TCP_PROTOCOL_VERSION};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::{Instant, timeout_at};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Upper bound on the best-effort Cancel write after a timeout.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(1);

/// One native-protocol connection.
///
/// Owned exclusively by whoever checked it out of the pool. A request marks
/// the connection as mid-exchange until the server's final packet is read;
/// a connection released in that state is discarded, never reused.
pub struct ChConnection {
    id: u64,
    reader: ChReader<ChStream>,
    writer: ChWriter,
    local_addr: String,
    created_at: Instant,
    used_at: Instant,
    /// Shared with the pool so `close()` there reaches checked-out conns.
    closed: Arc<AtomicBool>,
    pooled: bool,
    server: Option<ServerInfo>,
    revision: u64,
    in_exchange: bool,
    pub(crate) compression: bool,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl ChConnection {
    /// Dial `config.addr` and perform the handshake.
    pub async fn connect(config: &ChConfig, dialer: &dyn Dialer) -> ChResult<Self> {
        let stream = dialer.dial(&config.addr).await?;
        let mut conn = Self::new(stream, config);
        conn.handshake(&config.database, &config.user, &config.password, None)
            .await?;
        Ok(conn)
    }

    /// Wrap an open stream. No bytes are exchanged until [`handshake`](Self::handshake).
    pub fn new(stream: ChStream, config: &ChConfig) -> Self {
        let local_addr = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let now = Instant::now();
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            reader: ChReader::new(stream),
            writer: ChWriter::new(),
            local_addr,
            created_at: now,
            used_at: now,
            closed: Arc::new(AtomicBool::new(false)),
            pooled: false,
            server: None,
            revision: TCP_PROTOCOL_VERSION,
            in_exchange: false,
            compression: config.compression,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Handshake reply, once the handshake has completed.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server.as_ref()
    }

    /// Protocol revision in use on this connection.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn used_at(&self) -> Instant {
        self.used_at
    }

    pub(crate) fn touch(&mut self) {
        self.used_at = Instant::now();
    }

    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    pub(crate) fn set_pooled(&mut self, pooled: bool) {
        self.pooled = pooled;
    }

    pub(crate) fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True while a request has not seen its terminating packet.
    pub fn in_exchange(&self) -> bool {
        self.in_exchange
    }

    pub(crate) fn begin_exchange(&mut self) {
        self.in_exchange = true;
    }

    pub(crate) fn end_exchange(&mut self) {
        self.in_exchange = false;
    }

    /// Bytes received and not consumed. Non-zero means the stream is out of
    /// sync with the request cycle.
    pub fn buffered(&self) -> usize {
        self.reader.buffered()
    }

    /// Non-blocking liveness check for idle connections.
    pub async fn is_idle(&mut self) -> bool {
        !self.is_closed() && !self.in_exchange && self.reader.is_idle().await
    }

    pub(crate) fn set_server_info(&mut self, info: ServerInfo) -> ChResult<()> {
        if self.server.is_some() {
            return Err(ProtocolError::DuplicateHello.into());
        }
        self.revision = info.negotiated_revision();
        self.server = Some(info);
        Ok(())
    }

    /// Deadline for one I/O step: the tighter of the configured timeout and
    /// the caller's deadline. The flag tells whether the caller's won.
    fn io_deadline(timeout: Duration, deadline: Option<Instant>) -> (Instant, bool) {
        let configured = Instant::now() + timeout;
        match deadline {
            Some(d) if d <= configured => (d, true),
            _ => (configured, false),
        }
    }

    fn timeout_error(op: &'static str, caller: bool) -> ChError {
        if caller {
            ChError::DeadlineExceeded
        } else {
            TransportError::Timeout(op).into()
        }
    }

    fn check_open(&self) -> ChResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        Ok(())
    }

    /// Encode a request with `f` and flush it to the socket.
    pub(crate) async fn with_writer<F>(&mut self, deadline: Option<Instant>, f: F) -> ChResult<()>
    where
        F: FnOnce(&mut ChWriter) -> ChResult<()>,
    {
        self.check_open()?;
        self.writer.clear();
        f(&mut self.writer)?;
        let buf = self.writer.take();

        let (at, caller) = Self::io_deadline(self.write_timeout, deadline);
        let stream = self.reader.get_mut();
        let res = timeout_at(at, async {
            stream.write_all(&buf).await?;
            stream.flush().await
        })
        .await;

        match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                let err = Self::timeout_error("write", caller);
                self.cancel_in_flight().await;
                Err(err)
            }
        }
    }

    /// Read one server packet within the read timeout.
    pub(crate) async fn read_packet(&mut self, deadline: Option<Instant>) -> ChResult<ServerPacket> {
        self.check_open()?;
        let (at, caller) = Self::io_deadline(self.read_timeout, deadline);
        let res = timeout_at(
            at,
            packet::read_packet(&mut self.reader, self.revision, self.compression),
        )
        .await;

        match res {
            Ok(res) => res,
            Err(_) => {
                let err = Self::timeout_error("read", caller);
                self.cancel_in_flight().await;
                Err(err)
            }
        }
    }

    /// Ask the server to abandon the current query. Best effort: the
    /// connection is discarded afterwards either way.
    async fn cancel_in_flight(&mut self) {
        if !self.in_exchange {
            return;
        }
        let mut wr = ChWriter::new();
        packet::write_cancel(&mut wr);
        let stream = self.reader.get_mut();
        let sent = tokio::time::timeout(CANCEL_TIMEOUT.min(self.write_timeout), async {
            stream.write_all(wr.as_bytes()).await?;
            stream.flush().await
        })
        .await;
        tracing::debug!(conn = self.id, ok = matches!(sent, Ok(Ok(()))), "sent cancel");
    }

    /// Close the socket. Only the first call does any work.
    pub async fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let stream = self.reader.get_mut();
        let _ = tokio::time::timeout(CANCEL_TIMEOUT, stream.shutdown()).await;
    }

    /// Mark closed without touching the socket; dropping it closes the fd.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for ChConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChConnection")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("revision", &self.revision)
            .field("in_exchange", &self.in_exchange)
            .field("closed", &self.is_closed())
            .finish()
    }
}
