//! Packet encoding (client side) and decoding (server side).
//!
//! Every writer encodes into a [`ChWriter`]; nothing here touches a socket.

use super::reader::ChReader;
use super::swap_uuid;
use super::wire::{
    self, ProfileInfo, Progress, ServerInfo, SettingValue, TraceContext, client, revision, server,
};
use super::writer::ChWriter;
use crate::error::{ChResult, ProtocolError, ServerError};
use crate::types::{Block, BlockKind};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::AsyncRead;

/// Settings flag marking a setting the server must not ignore.
const SETTING_FLAG_IMPORTANT: u64 = 1;

/// Client identity sent inside every Query packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub local_addr: String,
    pub os_user: String,
    pub hostname: String,
}

impl ClientInfo {
    /// Fill user and host from the environment.
    pub fn from_env(local_addr: String) -> Self {
        let os_user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            local_addr,
            os_user,
            hostname,
        }
    }
}

/// Handshake request.
pub fn write_hello(wr: &mut ChWriter, database: &str, user: &str, password: &str) {
    wr.put_uvarint(client::HELLO);
    wr.put_str(wire::CLIENT_NAME);
    wr.put_uvarint(wire::CLIENT_VERSION_MAJOR);
    wr.put_uvarint(wire::CLIENT_VERSION_MINOR);
    wr.put_uvarint(wire::TCP_PROTOCOL_VERSION);
    wr.put_str(database);
    wr.put_str(user);
    wr.put_str(password);
}

/// One Query packet. Encoding depends on the negotiated revision.
#[derive(Debug, Clone)]
pub struct QueryPacket<'a> {
    pub id: &'a str,
    pub query: &'a str,
    pub settings: &'a BTreeMap<String, SettingValue>,
    pub trace: Option<&'a TraceContext>,
    pub compression: bool,
    pub client: &'a ClientInfo,
}

impl QueryPacket<'_> {
    /// Encode the query followed by the empty block that ends external data.
    pub fn encode(&self, wr: &mut ChWriter, rev: u64) -> ChResult<()> {
        wr.put_uvarint(client::QUERY);
        wr.put_str(self.id);

        if rev >= revision::CLIENT_INFO {
            self.encode_client_info(wr, rev);
        }

        for (key, value) in self.settings {
            wr.put_str(key);
            if rev > revision::SETTINGS_SERIALIZED_AS_STRINGS {
                wr.put_uvarint(SETTING_FLAG_IMPORTANT);
                wr.put_str(&value.to_string());
            } else {
                put_typed_setting(wr, value);
            }
        }
        wr.put_str("");

        if rev >= revision::INTERSERVER_SECRET {
            wr.put_str("");
        }

        wr.put_uvarint(wire::STAGE_COMPLETE);
        wr.put_bool(self.compression);
        wr.put_str(self.query);

        write_data(wr, &Block::new(), self.compression)
    }

    fn encode_client_info(&self, wr: &mut ChWriter, rev: u64) {
        wr.put_u8(wire::QUERY_INITIAL);
        // initial user, initial query id
        wr.put_str("");
        wr.put_str("");
        wr.put_str(&self.client.local_addr);
        if rev >= revision::INITIAL_QUERY_START_TIME {
            wr.put_i64(0);
        }

        wr.put_u8(wire::INTERFACE_TCP);
        wr.put_str(&self.client.os_user);
        wr.put_str(&self.client.hostname);
        wr.put_str(wire::CLIENT_NAME);
        wr.put_uvarint(wire::CLIENT_VERSION_MAJOR);
        wr.put_uvarint(wire::CLIENT_VERSION_MINOR);
        wr.put_uvarint(wire::TCP_PROTOCOL_VERSION);

        if rev >= revision::QUOTA_KEY_IN_CLIENT_INFO {
            wr.put_str("");
        }
        if rev >= revision::DISTRIBUTED_DEPTH {
            wr.put_uvarint(0);
        }
        if rev >= revision::VERSION_PATCH {
            wr.put_uvarint(0);
        }

        if rev >= revision::OPENTELEMETRY {
            match self.trace {
                Some(trace) => {
                    wr.put_u8(1);
                    let mut trace_id = trace.trace_id;
                    swap_uuid(&mut trace_id);
                    wr.put_raw(&trace_id);
                    let mut span_id = trace.span_id;
                    span_id.reverse();
                    wr.put_raw(&span_id);
                    wr.put_str(&trace.trace_state);
                    wr.put_u8(trace.flags);
                }
                None => wr.put_u8(0),
            }
        }

        if rev >= revision::PARALLEL_REPLICAS {
            // collaborate_with_initiator, count_participating_replicas,
            // number_of_current_replica
            wr.put_uvarint(0);
            wr.put_uvarint(0);
            wr.put_uvarint(0);
        }
    }
}

fn put_typed_setting(wr: &mut ChWriter, value: &SettingValue) {
    match value {
        SettingValue::Bool(b) => wr.put_uvarint(*b as u64),
        SettingValue::UInt(n) => wr.put_uvarint(*n),
        // zigzag
        SettingValue::Int(n) => wr.put_uvarint(((*n << 1) ^ (*n >> 63)) as u64),
        SettingValue::String(s) => wr.put_str(s),
    }
}

/// Data packet. The table name stays outside the compressed section.
pub fn write_data(wr: &mut ChWriter, block: &Block, compression: bool) -> ChResult<()> {
    wr.put_uvarint(client::DATA);
    wr.put_str("");
    wr.with_compression(compression, |w| block.write_to(w))
}

pub fn write_ping(wr: &mut ChWriter) {
    wr.put_uvarint(client::PING);
}

pub fn write_cancel(wr: &mut ChWriter) {
    wr.put_uvarint(client::CANCEL);
}

/// Decoded server packet.
#[derive(Debug, Clone)]
pub enum ServerPacket {
    Hello(ServerInfo),
    Data(Block),
    Exception(ServerError),
    Progress(Progress),
    Pong,
    EndOfStream,
    ProfileInfo(ProfileInfo),
    Totals(Block),
    Extremes(Block),
    Log(Block),
    TableColumns { table: String, description: String },
    ProfileEvents(Block),
}

impl ServerPacket {
    pub fn tag(&self) -> u64 {
        match self {
            ServerPacket::Hello(_) => server::HELLO,
            ServerPacket::Data(_) => server::DATA,
            ServerPacket::Exception(_) => server::EXCEPTION,
            ServerPacket::Progress(_) => server::PROGRESS,
            ServerPacket::Pong => server::PONG,
            ServerPacket::EndOfStream => server::END_OF_STREAM,
            ServerPacket::ProfileInfo(_) => server::PROFILE_INFO,
            ServerPacket::Totals(_) => server::TOTALS,
            ServerPacket::Extremes(_) => server::EXTREMES,
            ServerPacket::Log(_) => server::LOG,
            ServerPacket::TableColumns { .. } => server::TABLE_COLUMNS,
            ServerPacket::ProfileEvents(_) => server::PROFILE_EVENTS,
        }
    }

    /// Protocol error for this packet arriving in the wrong state.
    pub fn unexpected(&self, context: &'static str) -> ProtocolError {
        ProtocolError::UnexpectedPacket {
            packet: self.tag(),
            context,
        }
    }
}

/// Read one server packet.
pub async fn read_packet<R>(
    rd: &mut ChReader<R>,
    rev: u64,
    compression: bool,
) -> ChResult<ServerPacket>
where
    R: AsyncRead + Unpin + Send,
{
    let tag = rd.read_uvarint().await?;
    let packet = match tag {
        server::HELLO => ServerPacket::Hello(read_server_info(rd).await?),
        server::DATA => ServerPacket::Data(read_block(rd, BlockKind::Data, compression).await?),
        server::TOTALS => {
            ServerPacket::Totals(read_block(rd, BlockKind::Totals, compression).await?)
        }
        server::EXTREMES => {
            ServerPacket::Extremes(read_block(rd, BlockKind::Extremes, compression).await?)
        }
        server::LOG => ServerPacket::Log(read_block(rd, BlockKind::Log, false).await?),
        server::PROFILE_EVENTS => {
            ServerPacket::ProfileEvents(read_block(rd, BlockKind::ProfileEvents, false).await?)
        }
        server::EXCEPTION => ServerPacket::Exception(read_exception(rd).await?),
        server::PROGRESS => ServerPacket::Progress(read_progress(rd, rev).await?),
        server::PONG => ServerPacket::Pong,
        server::END_OF_STREAM => ServerPacket::EndOfStream,
        server::PROFILE_INFO => ServerPacket::ProfileInfo(ProfileInfo {
            rows: rd.read_uvarint().await?,
            blocks: rd.read_uvarint().await?,
            bytes: rd.read_uvarint().await?,
            applied_limit: rd.read_bool().await?,
            rows_before_limit: rd.read_uvarint().await?,
            calculated_rows_before_limit: rd.read_bool().await?,
        }),
        server::TABLE_COLUMNS => ServerPacket::TableColumns {
            table: rd.read_string().await?,
            description: rd.read_string().await?,
        },
        other => {
            return Err(ProtocolError::UnexpectedPacket {
                packet: other,
                context: "reading server packet",
            }
            .into());
        }
    };
    Ok(packet)
}

/// Handshake reply body, after the Hello tag.
pub async fn read_server_info<R>(rd: &mut ChReader<R>) -> ChResult<ServerInfo>
where
    R: AsyncRead + Unpin + Send,
{
    let mut info = ServerInfo {
        name: rd.read_string().await?,
        major: rd.read_uvarint().await?,
        minor: rd.read_uvarint().await?,
        revision: rd.read_uvarint().await?,
        ..Default::default()
    };
    let rev = info.negotiated_revision();
    if rev >= revision::SERVER_TIMEZONE {
        info.timezone = Some(rd.read_string().await?);
    }
    if rev >= revision::SERVER_DISPLAY_NAME {
        info.display_name = Some(rd.read_string().await?);
    }
    if rev >= revision::VERSION_PATCH {
        info.patch = Some(rd.read_uvarint().await?);
    }
    Ok(info)
}

async fn read_block<R>(
    rd: &mut ChReader<R>,
    kind: BlockKind,
    compression: bool,
) -> ChResult<Block>
where
    R: AsyncRead + Unpin + Send,
{
    // external table name
    rd.read_string().await?;
    if compression {
        rd.begin_compressed();
    }
    let mut block = Block::read_from(rd).await?;
    if compression {
        rd.end_compressed()?;
    }
    block.set_kind(kind);
    Ok(block)
}

/// Exception body. Nested causes follow inline while `has_nested` is set.
pub async fn read_exception<R>(rd: &mut ChReader<R>) -> ChResult<ServerError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut chain = Vec::new();
    loop {
        let code = rd.read_i32().await?;
        let name = rd.read_string().await?;
        let message = rd.read_string().await?;
        let stack_trace = rd.read_string().await?;
        let has_nested = rd.read_bool().await?;

        let message = message
            .strip_prefix(&format!("{}:", name))
            .unwrap_or(&message)
            .trim()
            .to_string();
        chain.push(ServerError {
            code,
            name,
            message,
            stack_trace,
            nested: None,
        });
        if !has_nested {
            break;
        }
    }

    let mut err = chain
        .pop()
        .ok_or_else(|| ProtocolError::Malformed("empty exception".to_string()))?;
    while let Some(mut outer) = chain.pop() {
        outer.nested = Some(Box::new(err));
        err = outer;
    }
    Ok(err)
}

async fn read_progress<R>(rd: &mut ChReader<R>, rev: u64) -> ChResult<Progress>
where
    R: AsyncRead + Unpin + Send,
{
    let mut progress = Progress {
        rows: rd.read_uvarint().await?,
        bytes: rd.read_uvarint().await?,
        total_rows: rd.read_uvarint().await?,
        ..Default::default()
    };
    if rev >= revision::CLIENT_WRITE_INFO {
        progress.wrote_rows = rd.read_uvarint().await?;
        progress.wrote_bytes = rd.read_uvarint().await?;
    }
    if rev >= revision::SERVER_QUERY_TIME_IN_PROGRESS {
        progress.elapsed = Duration::from_nanos(rd.read_uvarint().await?);
    }
    Ok(progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChError;
    use crate::types::Value;
    use pretty_assertions::assert_eq;

    fn put_exception(wr: &mut ChWriter, code: i32, name: &str, message: &str, nested: bool) {
        wr.put_i32(code);
        wr.put_str(name);
        wr.put_str(message);
        wr.put_str("stack");
        wr.put_bool(nested);
    }

    #[test]
    fn test_hello_bytes() {
        let mut wr = ChWriter::new();
        write_hello(&mut wr, "db", "u", "p");
        let bytes = wr.take();

        let mut expected = vec![0u8, 7];
        expected.extend_from_slice(b"qail-ch");
        expected.extend_from_slice(&[1, 1]);
        // 54453 as LEB128
        expected.extend_from_slice(&[0xb5, 0xa9, 0x03]);
        expected.extend_from_slice(&[2, b'd', b'b', 1, b'u', 1, b'p']);
        assert_eq!(&bytes[..], &expected[..]);
    }

    #[tokio::test]
    async fn test_server_info_gated_by_revision() {
        let mut wr = ChWriter::new();
        wr.put_str("ClickHouse");
        wr.put_uvarint(23);
        wr.put_uvarint(8);
        wr.put_uvarint(54465);
        wr.put_str("UTC");
        wr.put_str("node-1");
        wr.put_uvarint(3);
        let bytes = wr.take();
        let mut rd = ChReader::new(&bytes[..]);
        let info = read_server_info(&mut rd).await.unwrap();
        assert_eq!(info.timezone.as_deref(), Some("UTC"));
        assert_eq!(info.display_name.as_deref(), Some("node-1"));
        assert_eq!(info.patch, Some(3));
        assert_eq!(info.negotiated_revision(), wire::TCP_PROTOCOL_VERSION);

        let mut wr = ChWriter::new();
        wr.put_str("ClickHouse");
        wr.put_uvarint(1);
        wr.put_uvarint(1);
        wr.put_uvarint(54060);
        wr.put_str("UTC");
        let bytes = wr.take();
        let mut rd = ChReader::new(&bytes[..]);
        let info = read_server_info(&mut rd).await.unwrap();
        assert_eq!(info.timezone.as_deref(), Some("UTC"));
        assert_eq!(info.display_name, None);
        assert_eq!(info.patch, None);
        assert_eq!(rd.buffered(), 0);
    }

    #[tokio::test]
    async fn test_nested_exception() {
        let mut wr = ChWriter::new();
        wr.put_uvarint(server::EXCEPTION);
        put_exception(&mut wr, 241, "DB::Exception", "DB::Exception: Memory limit", true);
        put_exception(&mut wr, 173, "DB::ErrnoException", "Cannot allocate", false);
        let bytes = wr.take();

        let mut rd = ChReader::new(&bytes[..]);
        let packet = read_packet(&mut rd, wire::TCP_PROTOCOL_VERSION, false)
            .await
            .unwrap();
        let err = match packet {
            ServerPacket::Exception(err) => err,
            other => panic!("expected exception, got {other:?}"),
        };
        assert_eq!(err.code, 241);
        assert_eq!(err.message, "Memory limit");
        assert_eq!(err.to_string(), "DB::Exception: Memory limit (241)");
        assert_eq!(err.depth(), 1);
        let nested = err.nested.as_deref().unwrap();
        assert_eq!(nested.code, 173);
        assert!(nested.nested.is_none());
    }

    #[tokio::test]
    async fn test_progress_fields_by_revision() {
        let mut wr = ChWriter::new();
        for v in [10u64, 2048, 100, 1, 64, 5_000_000] {
            wr.put_uvarint(v);
        }
        let bytes = wr.take();

        let mut rd = ChReader::new(&bytes[..]);
        let p = read_progress(&mut rd, 54460).await.unwrap();
        assert_eq!(p.rows, 10);
        assert_eq!(p.total_rows, 100);
        assert_eq!(p.wrote_bytes, 64);
        assert_eq!(p.elapsed, Duration::from_millis(5));

        let mut rd = ChReader::new(&bytes[..]);
        let p = read_progress(&mut rd, 54420).await.unwrap();
        assert_eq!(p.wrote_rows, 1);
        assert_eq!(p.elapsed, Duration::ZERO);
        assert_eq!(rd.buffered(), 4);
    }

    #[tokio::test]
    async fn test_data_packet_compressed() {
        let mut block = Block::with_columns([("n", "UInt32"), ("s", "String")]).unwrap();
        for i in 0..100u32 {
            block
                .push_row([Value::from(i), Value::from(format!("row-{i}"))])
                .unwrap();
        }

        for compression in [false, true] {
            let mut wr = ChWriter::new();
            wr.put_uvarint(server::DATA);
            wr.put_str("");
            wr.with_compression(compression, |w| block.write_to(w))
                .unwrap();
            wr.put_uvarint(server::END_OF_STREAM);
            let bytes = wr.take();

            let mut rd = ChReader::new(&bytes[..]);
            let rev = wire::TCP_PROTOCOL_VERSION;
            match read_packet(&mut rd, rev, compression).await.unwrap() {
                ServerPacket::Data(got) => assert_eq!(got, block),
                other => panic!("unexpected {other:?}"),
            }
            assert!(matches!(
                read_packet(&mut rd, rev, compression).await.unwrap(),
                ServerPacket::EndOfStream
            ));
        }
    }

    #[tokio::test]
    async fn test_unknown_packet_rejected() {
        for tag in [server::TABLES_STATUS_RESPONSE, server::PART_UUIDS, 99] {
            let bytes = [tag as u8];
            let mut rd = ChReader::new(&bytes[..]);
            assert!(matches!(
                read_packet(&mut rd, wire::TCP_PROTOCOL_VERSION, false).await,
                Err(ChError::Protocol(ProtocolError::UnexpectedPacket { packet, .. })) if packet == tag
            ));
        }
    }

    #[test]
    fn test_query_settings_encoding() {
        let settings = BTreeMap::from([("max_threads".to_string(), SettingValue::Int(4))]);
        let info = ClientInfo::default();
        let packet = QueryPacket {
            id: "q",
            query: "SELECT 1",
            settings: &settings,
            trace: None,
            compression: false,
            client: &info,
        };

        let mut new_rev = ChWriter::new();
        packet.encode(&mut new_rev, wire::TCP_PROTOCOL_VERSION).unwrap();
        let bytes = new_rev.take();
        let needle = b"\x0bmax_threads\x01\x014";
        assert!(bytes.windows(needle.len()).any(|w| w == needle));

        let mut old_rev = ChWriter::new();
        packet.encode(&mut old_rev, 54400).unwrap();
        let bytes = old_rev.take();
        let needle = b"\x0bmax_threads\x08";
        assert!(bytes.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_query_ends_with_empty_block() {
        let settings = BTreeMap::new();
        let info = ClientInfo::default();
        let packet = QueryPacket {
            id: "",
            query: "SELECT 1",
            settings: &settings,
            trace: None,
            compression: false,
            client: &info,
        };
        let mut wr = ChWriter::new();
        packet.encode(&mut wr, wire::TCP_PROTOCOL_VERSION).unwrap();
        let bytes = wr.take();

        let mut tail = ChWriter::new();
        write_data(&mut tail, &Block::new(), false).unwrap();
        let tail = tail.take();
        assert!(bytes.ends_with(&tail));
        let query_end = bytes.len() - tail.len();
        assert!(bytes[..query_end].ends_with(b"\x08SELECT 1"));
    }
}
