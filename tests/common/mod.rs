//! Scripted in-process server speaking the native protocol.

#![allow(dead_code)]

use qail_ch::error::{ChResult, ServerError};
use qail_ch::protocol::peer::{ClientPacket, ReceivedQuery, read_client_packet};
use qail_ch::protocol::{ChReader, ChWriter, ServerInfo, ServerPacket, TCP_PROTOCOL_VERSION};
use qail_ch::types::{Block, Value};
use qail_ch::{ChConfig, ChPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinHandle;

/// What the server does with one query.
pub enum Reply {
    /// Send these packets.
    Packets(Vec<ServerPacket>),
    /// Send `sample`, read data blocks until the empty one, then send `then`.
    Insert { sample: Block, then: Vec<ServerPacket> },
    /// Never answer; keep reading client packets.
    Hang,
    /// Drop the connection.
    Close,
}

pub type Script = Arc<dyn Fn(&ReceivedQuery, usize) -> Reply + Send + Sync>;

#[derive(Default)]
pub struct Recorded {
    pub queries: Mutex<Vec<ReceivedQuery>>,
    pub inserted: Mutex<Vec<Block>>,
    pub accepted: AtomicUsize,
    pub cancels: AtomicUsize,
    pub pings: AtomicUsize,
}

pub struct MockServer {
    pub addr: String,
    pub recorded: Arc<Recorded>,
    handle: JoinHandle<()>,
    conns: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Drop for MockServer {
    /// Stops accepting and hangs up every open connection.
    fn drop(&mut self) {
        self.handle.abort();
        for conn in self.conns.lock().unwrap().drain(..) {
            conn.abort();
        }
    }
}

impl MockServer {
    pub async fn start(script: impl Fn(&ReceivedQuery, usize) -> Reply + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let recorded = Arc::new(Recorded::default());
        let script: Script = Arc::new(script);

        let conns = Arc::new(Mutex::new(Vec::new()));

        let (rec, handles) = (recorded.clone(), conns.clone());
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                rec.accepted.fetch_add(1, Ordering::SeqCst);
                let (rec, script) = (rec.clone(), script.clone());
                let conn = tokio::spawn(async move {
                    let _ = serve(stream, rec, script).await;
                });
                handles.lock().unwrap().push(conn);
            }
        });

        Self {
            addr,
            recorded,
            handle,
            conns,
        }
    }

    /// Server answering every query with `packets`.
    pub async fn replying(packets: Vec<ServerPacket>) -> Self {
        Self::start(move |_, _| Reply::Packets(packets.clone())).await
    }

    pub fn config(&self) -> ChConfig {
        ChConfig::new(self.addr.clone())
            .pool_size(2)
            .read_timeout(Duration::from_secs(5))
            .retry_backoff(Duration::from_millis(1), Duration::from_millis(5))
    }

    pub fn query_count(&self) -> usize {
        self.recorded.queries.lock().unwrap().len()
    }

    pub fn queries(&self) -> Vec<ReceivedQuery> {
        self.recorded.queries.lock().unwrap().clone()
    }
}

pub fn server_info() -> ServerInfo {
    ServerInfo {
        name: "ClickHouse".to_string(),
        major: 23,
        minor: 8,
        revision: TCP_PROTOCOL_VERSION,
        timezone: Some("UTC".to_string()),
        display_name: Some("mock".to_string()),
        patch: Some(1),
    }
}

async fn send(
    wr: &mut OwnedWriteHalf,
    packets: &[ServerPacket],
    rev: u64,
    compression: bool,
) -> ChResult<()> {
    let mut w = ChWriter::new();
    for packet in packets {
        packet.encode(&mut w, rev, compression)?;
    }
    wr.write_all(w.as_bytes()).await?;
    Ok(())
}

async fn serve(stream: tokio::net::TcpStream, rec: Arc<Recorded>, script: Script) -> ChResult<()> {
    let (rd, mut wr) = stream.into_split();
    let mut rd = ChReader::new(rd);
    let mut rev = TCP_PROTOCOL_VERSION;
    let mut compression = false;

    loop {
        match read_client_packet(&mut rd, rev, compression).await? {
            ClientPacket::Hello(_) => {
                let info = server_info();
                rev = info.negotiated_revision();
                send(&mut wr, &[ServerPacket::Hello(info)], rev, false).await?;
            }
            ClientPacket::Ping => {
                rec.pings.fetch_add(1, Ordering::SeqCst);
                send(&mut wr, &[ServerPacket::Pong], rev, false).await?;
            }
            ClientPacket::Cancel => {
                rec.cancels.fetch_add(1, Ordering::SeqCst);
            }
            ClientPacket::Data(_) => {}
            ClientPacket::Query(query) => {
                compression = query.compression;
                // External tables end with one empty block.
                read_client_packet(&mut rd, rev, compression).await?;
                let n = {
                    let mut queries = rec.queries.lock().unwrap();
                    queries.push(query.clone());
                    queries.len() - 1
                };
                match script(&query, n) {
                    Reply::Packets(packets) => send(&mut wr, &packets, rev, compression).await?,
                    Reply::Insert { sample, then } => {
                        send(&mut wr, &[ServerPacket::Data(sample)], rev, compression).await?;
                        loop {
                            match read_client_packet(&mut rd, rev, compression).await? {
                                ClientPacket::Data(block) if block.num_columns() == 0 => break,
                                ClientPacket::Data(block) => rec.inserted.lock().unwrap().push(block),
                                _ => return Ok(()),
                            }
                        }
                        send(&mut wr, &then, rev, compression).await?;
                    }
                    Reply::Hang => {}
                    Reply::Close => return Ok(()),
                }
            }
        }
    }
}

/// `(id UInt64, name String)` block with the given rows.
pub fn id_name_block(rows: &[(u64, &str)]) -> Block {
    let mut block = Block::with_columns([("id", "UInt64"), ("name", "String")]).unwrap();
    for (id, name) in rows {
        block
            .push_row([Value::from(*id), Value::from(*name)])
            .unwrap();
    }
    block
}

pub fn exception(code: i32, nested: Option<ServerError>) -> ServerError {
    ServerError {
        code,
        name: "DB::Exception".to_string(),
        message: format!("failure {}", code),
        stack_trace: String::new(),
        nested: nested.map(Box::new),
    }
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Routes driver logs to the test writer; `RUST_LOG` narrows them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("qail_ch=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn pool(config: ChConfig) -> ChPool {
    ChPool::new(config).unwrap()
}
