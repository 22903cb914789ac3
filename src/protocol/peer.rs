//! Server side of the exchange: decode client packets, encode server packets.
//!
//! Lets an in-process server speak the protocol with the same codecs the
//! client uses, e.g. to script replies in integration tests.

use super::packet::{ClientInfo, ServerPacket};
use super::reader::ChReader;
use super::swap_uuid;
use super::wire::{TraceContext, client, revision};
use super::writer::ChWriter;
use crate::error::{ChResult, ProtocolError, ServerError};
use crate::types::Block;
use std::collections::BTreeMap;
use tokio::io::AsyncRead;

/// Handshake request as received by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub client_name: String,
    pub major: u64,
    pub minor: u64,
    pub protocol_version: u64,
    pub database: String,
    pub user: String,
    pub password: String,
}

/// Query request as received by a server.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedQuery {
    pub id: String,
    pub query: String,
    pub settings: BTreeMap<String, String>,
    pub trace: Option<TraceContext>,
    pub compression: bool,
    pub client: ClientInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientPacket {
    Hello(ClientHello),
    Query(ReceivedQuery),
    Data(Block),
    Ping,
    Cancel,
}

/// Read one client packet. `compression` applies to Data packets.
pub async fn read_client_packet<R>(
    rd: &mut ChReader<R>,
    rev: u64,
    compression: bool,
) -> ChResult<ClientPacket>
where
    R: AsyncRead + Unpin + Send,
{
    match rd.read_uvarint().await? {
        client::HELLO => Ok(ClientPacket::Hello(ClientHello {
            client_name: rd.read_string().await?,
            major: rd.read_uvarint().await?,
            minor: rd.read_uvarint().await?,
            protocol_version: rd.read_uvarint().await?,
            database: rd.read_string().await?,
            user: rd.read_string().await?,
            password: rd.read_string().await?,
        })),
        client::QUERY => Ok(ClientPacket::Query(read_query(rd, rev).await?)),
        client::DATA => {
            rd.read_string().await?;
            if compression {
                rd.begin_compressed();
            }
            let block = Block::read_from(rd).await?;
            if compression {
                rd.end_compressed()?;
            }
            Ok(ClientPacket::Data(block))
        }
        client::PING => Ok(ClientPacket::Ping),
        client::CANCEL => Ok(ClientPacket::Cancel),
        other => Err(ProtocolError::UnexpectedPacket {
            packet: other,
            context: "reading client packet",
        }
        .into()),
    }
}

async fn read_query<R>(rd: &mut ChReader<R>, rev: u64) -> ChResult<ReceivedQuery>
where
    R: AsyncRead + Unpin + Send,
{
    let id = rd.read_string().await?;
    let mut client = ClientInfo::default();
    let mut trace = None;

    if rev >= revision::CLIENT_INFO {
        rd.read_u8().await?;
        rd.read_string().await?;
        rd.read_string().await?;
        client.local_addr = rd.read_string().await?;
        if rev >= revision::INITIAL_QUERY_START_TIME {
            rd.read_i64().await?;
        }
        rd.read_u8().await?;
        client.os_user = rd.read_string().await?;
        client.hostname = rd.read_string().await?;
        rd.read_string().await?;
        for _ in 0..3 {
            rd.read_uvarint().await?;
        }
        if rev >= revision::QUOTA_KEY_IN_CLIENT_INFO {
            rd.read_string().await?;
        }
        if rev >= revision::DISTRIBUTED_DEPTH {
            rd.read_uvarint().await?;
        }
        if rev >= revision::VERSION_PATCH {
            rd.read_uvarint().await?;
        }
        if rev >= revision::OPENTELEMETRY && rd.read_u8().await? == 1 {
            let mut trace_id = [0u8; 16];
            rd.read_exact(&mut trace_id).await?;
            swap_uuid(&mut trace_id);
            let mut span_id = [0u8; 8];
            rd.read_exact(&mut span_id).await?;
            span_id.reverse();
            trace = Some(TraceContext {
                trace_id,
                span_id,
                trace_state: rd.read_string().await?,
                flags: rd.read_u8().await?,
            });
        }
        if rev >= revision::PARALLEL_REPLICAS {
            for _ in 0..3 {
                rd.read_uvarint().await?;
            }
        }
    }

    if rev <= revision::SETTINGS_SERIALIZED_AS_STRINGS {
        return Err(ProtocolError::Malformed(format!(
            "typed settings of revision {} cannot be decoded",
            rev
        ))
        .into());
    }
    let mut settings = BTreeMap::new();
    loop {
        let key = rd.read_string().await?;
        if key.is_empty() {
            break;
        }
        rd.read_uvarint().await?;
        settings.insert(key, rd.read_string().await?);
    }

    if rev >= revision::INTERSERVER_SECRET {
        rd.read_string().await?;
    }
    rd.read_uvarint().await?;
    let compression = rd.read_bool().await?;
    let query = rd.read_string().await?;

    Ok(ReceivedQuery {
        id,
        query,
        settings,
        trace,
        compression,
        client,
    })
}

fn put_exception(wr: &mut ChWriter, err: &ServerError) {
    let mut cur = Some(err);
    while let Some(e) = cur {
        wr.put_i32(e.code);
        wr.put_str(&e.name);
        wr.put_str(&format!("{}: {}", e.name, e.message));
        wr.put_str(&e.stack_trace);
        wr.put_bool(e.nested.is_some());
        cur = e.nested.as_deref();
    }
}

impl ServerPacket {
    /// Encode as a server would send it.
    pub fn encode(&self, wr: &mut ChWriter, rev: u64, compression: bool) -> ChResult<()> {
        wr.put_uvarint(self.tag());
        match self {
            ServerPacket::Hello(info) => {
                wr.put_str(&info.name);
                wr.put_uvarint(info.major);
                wr.put_uvarint(info.minor);
                wr.put_uvarint(info.revision);
                let rev = info.negotiated_revision();
                if rev >= revision::SERVER_TIMEZONE {
                    wr.put_str(info.timezone.as_deref().unwrap_or("UTC"));
                }
                if rev >= revision::SERVER_DISPLAY_NAME {
                    wr.put_str(info.display_name.as_deref().unwrap_or(""));
                }
                if rev >= revision::VERSION_PATCH {
                    wr.put_uvarint(info.patch.unwrap_or(0));
                }
            }
            ServerPacket::Data(block)
            | ServerPacket::Totals(block)
            | ServerPacket::Extremes(block) => {
                wr.put_str("");
                wr.with_compression(compression, |w| block.write_to(w))?;
            }
            ServerPacket::Log(block) | ServerPacket::ProfileEvents(block) => {
                wr.put_str("");
                block.write_to(wr)?;
            }
            ServerPacket::Exception(err) => put_exception(wr, err),
            ServerPacket::Progress(p) => {
                wr.put_uvarint(p.rows);
                wr.put_uvarint(p.bytes);
                wr.put_uvarint(p.total_rows);
                if rev >= revision::CLIENT_WRITE_INFO {
                    wr.put_uvarint(p.wrote_rows);
                    wr.put_uvarint(p.wrote_bytes);
                }
                if rev >= revision::SERVER_QUERY_TIME_IN_PROGRESS {
                    wr.put_uvarint(p.elapsed.as_nanos() as u64);
                }
            }
            ServerPacket::Pong | ServerPacket::EndOfStream => {}
            ServerPacket::ProfileInfo(info) => {
                wr.put_uvarint(info.rows);
                wr.put_uvarint(info.blocks);
                wr.put_uvarint(info.bytes);
                wr.put_bool(info.applied_limit);
                wr.put_uvarint(info.rows_before_limit);
                wr.put_bool(info.calculated_rows_before_limit);
            }
            ServerPacket::TableColumns { table, description } => {
                wr.put_str(table);
                wr.put_str(description);
            }
        }
        Ok(())
    }
}
