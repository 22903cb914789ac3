//! Client against a scripted in-process server.

mod common;

use common::{MockServer, Reply, exception, id_name_block, init_tracing};
use pretty_assertions::assert_eq;
use qail_ch::driver::{QueryEvent, QueryHook, TracingHook};
use qail_ch::error::{ChError, TransportError};
use qail_ch::protocol::{ProfileInfo, Progress, ServerPacket};
use qail_ch::types::{Block, Value};
use qail_ch::{ChClient, ChResult, ChRow, QueryOptions, Row};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn three_rows_in_two_blocks() -> Vec<ServerPacket> {
    vec![
        ServerPacket::Data(id_name_block(&[])),
        ServerPacket::Data(id_name_block(&[(1, "a"), (2, "b")])),
        ServerPacket::Progress(Progress {
            rows: 3,
            bytes: 42,
            total_rows: 3,
            ..Default::default()
        }),
        ServerPacket::Data(id_name_block(&[(3, "c")])),
        ServerPacket::ProfileInfo(ProfileInfo {
            rows: 3,
            blocks: 2,
            ..Default::default()
        }),
        ServerPacket::EndOfStream,
    ]
}

async fn collect_rows(client: &ChClient, query: &str) -> ChResult<Vec<Row>> {
    let mut rows = client.query(query).await?.rows();
    let mut out = Vec::new();
    while let Some(row) = rows.next().await {
        out.push(row);
    }
    rows.close().await?;
    Ok(out)
}

#[tokio::test]
async fn query_yields_rows_in_server_order() {
    for compression in [false, true] {
        let server = MockServer::replying(three_rows_in_two_blocks()).await;
        let client = ChClient::new(server.config().compression(compression)).unwrap();

        let rows = collect_rows(&client, "SELECT id, name FROM t").await.unwrap();
        let got: Vec<(i64, String)> = rows.iter().map(|r| (r.int(0), r.text(1))).collect();
        assert_eq!(
            got,
            vec![(1, "a".to_string()), (2, "b".to_string()), (3, "c".to_string())]
        );
        assert_eq!(rows[0].names(), &["id".to_string(), "name".to_string()]);
        assert_eq!(server.queries()[0].compression, compression);

        let stats = client.pool_stats();
        assert_eq!(stats.idle_conns, 1);
        assert_eq!(stats.total_conns, 1);
    }
}

#[tokio::test]
async fn query_result_accounting() {
    let server = MockServer::replying(three_rows_in_two_blocks()).await;
    let client = ChClient::new(server.config()).unwrap();

    let mut cursor = client.query("SELECT id, name FROM t").await.unwrap();
    let mut blocks = 0;
    while let Some(block) = cursor.next().await {
        assert!(!block.is_empty());
        blocks += 1;
    }
    assert_eq!(blocks, 2);
    let result = cursor.close().await.unwrap();
    assert_eq!(result.rows, 3);
    assert_eq!(result.blocks, 2);
    assert_eq!(result.progress.rows, 3);
    assert_eq!(result.profile.map(|p| p.blocks), Some(2));
}

#[tokio::test]
async fn query_packet_carries_settings_and_id() {
    let server = MockServer::replying(vec![ServerPacket::EndOfStream]).await;
    let client = ChClient::new(server.config().setting("max_threads", 4i64)).unwrap();

    let opts = QueryOptions::new()
        .query_id("q-1")
        .setting("max_threads", 2i64)
        .setting("readonly", true);
    client.exec_with("SELECT 1", &opts).await.unwrap();

    let query = &server.queries()[0];
    assert_eq!(query.id, "q-1");
    assert_eq!(query.query, "SELECT 1");
    assert_eq!(query.settings["max_threads"], "2");
    assert_eq!(query.settings["readonly"], "1");
}

#[tokio::test]
async fn insert_streams_blocks_then_terminator() {
    let server = MockServer::start(|_, _| Reply::Insert {
        sample: id_name_block(&[]),
        then: vec![ServerPacket::EndOfStream],
    })
    .await;
    let client = ChClient::new(server.config()).unwrap();

    let result = client
        .insert("events", id_name_block(&[(1, "a"), (2, "b")]))
        .await
        .unwrap();
    assert_eq!(result.rows, 2);

    assert_eq!(
        server.queries()[0].query,
        "INSERT INTO events (`id`, `name`) VALUES"
    );
    let inserted = server.recorded.inserted.lock().unwrap().clone();
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].row(1), Some(vec![Value::UInt64(2), Value::from("b")]));
    assert_eq!(client.pool_stats().idle_conns, 1);
}

#[tokio::test]
async fn insert_with_wrong_columns_discards_connection() {
    let server = MockServer::start(|_, _| Reply::Insert {
        sample: id_name_block(&[]),
        then: vec![ServerPacket::EndOfStream],
    })
    .await;
    let client = ChClient::new(server.config()).unwrap();

    let mut block = Block::with_columns([("other", "UInt8")]).unwrap();
    block.push_row([Value::UInt8(1)]).unwrap();
    let err = client.insert_blocks("INSERT INTO events VALUES", &[block]).await.unwrap_err();
    assert!(matches!(err, ChError::Protocol(_)));
    assert_eq!(client.pool_stats().total_conns, 0);
}

#[derive(Debug, PartialEq)]
struct Event {
    id: u64,
    name: String,
}

impl ChRow for Event {
    fn columns() -> &'static [(&'static str, &'static str)] {
        &[("id", "UInt64"), ("name", "String")]
    }

    fn from_row(row: &Row) -> ChResult<Self> {
        Ok(Event {
            id: row.require("id")?.as_u64().unwrap_or_default(),
            name: row.text_by_name("name"),
        })
    }

    fn to_row(&self) -> Vec<Value> {
        vec![self.id.into(), self.name.as_str().into()]
    }
}

#[tokio::test]
async fn typed_fetch_and_insert() {
    let server = MockServer::start(|q, _| {
        if q.query.starts_with("INSERT") {
            Reply::Insert {
                sample: id_name_block(&[]),
                then: vec![ServerPacket::EndOfStream],
            }
        } else {
            Reply::Packets(three_rows_in_two_blocks())
        }
    })
    .await;
    let client = ChClient::new(server.config()).unwrap();

    let events: Vec<Event> = client.fetch_all("SELECT id, name FROM events").await.unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(
        events[2],
        Event {
            id: 3,
            name: "c".to_string()
        }
    );

    let result = client.insert_rows("events", &events).await.unwrap();
    assert_eq!(result.rows, 3);
}

#[tokio::test]
async fn ping_round_trip() {
    let server = MockServer::replying(vec![]).await;
    let client = ChClient::new(server.config()).unwrap();
    client.ping().await.unwrap();
    client.ping().await.unwrap();
    assert_eq!(server.recorded.pings.load(Ordering::SeqCst), 2);
    assert_eq!(server.recorded.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retryable_exception_is_retried() {
    let server = MockServer::start(|_, n| {
        if n < 2 {
            Reply::Packets(vec![ServerPacket::Exception(exception(
                241,
                Some(exception(1, None)),
            ))])
        } else {
            Reply::Packets(three_rows_in_two_blocks())
        }
    })
    .await;
    let client = ChClient::new(server.config()).unwrap();

    let rows = collect_rows(&client, "SELECT id, name FROM t").await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(server.query_count(), 3);
    // Exceptions before any data leave the connection reusable.
    assert_eq!(server.recorded.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn nested_exception_surfaces_after_retries() {
    let server = MockServer::replying(vec![ServerPacket::Exception(exception(
        241,
        Some(exception(2, Some(exception(3, None)))),
    ))])
    .await;
    let client = ChClient::new(server.config().max_retries(2)).unwrap();

    let err = client.exec("SELECT 1").await.unwrap_err();
    assert_eq!(err.server_code(), Some(241));
    let ChError::Server(server_err) = &err else {
        panic!("expected server error, got {err:?}");
    };
    assert_eq!(server_err.depth(), 2);
    assert_eq!(server_err.message, "failure 241");
    assert_eq!(server.query_count(), 3);
    assert_eq!(client.stats().errors, 1);
}

#[tokio::test]
async fn unclassified_exception_is_not_retried() {
    let server = MockServer::replying(vec![ServerPacket::Exception(exception(999, None))]).await;
    let client = ChClient::new(server.config()).unwrap();

    let err = client.exec("SELECT 1").await.unwrap_err();
    assert_eq!(err.server_code(), Some(999));
    assert_eq!(server.query_count(), 1);
}

#[tokio::test]
async fn closing_cursor_early_drains_and_reuses_connection() {
    let server = MockServer::replying(three_rows_in_two_blocks()).await;
    let client = ChClient::new(server.config()).unwrap();

    let mut cursor = client.query("SELECT id, name FROM t").await.unwrap();
    assert!(cursor.next().await.is_some());
    let result = cursor.close().await.unwrap();
    assert_eq!(result.rows, 3);

    client.exec("SELECT 1").await.unwrap();
    let stats = client.pool_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(server.recorded.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropping_cursor_mid_stream_discards_connection() {
    let server = MockServer::replying(three_rows_in_two_blocks()).await;
    let client = ChClient::new(server.config()).unwrap();

    let mut cursor = client.query("SELECT id, name FROM t").await.unwrap();
    assert!(cursor.next().await.is_some());
    drop(cursor);

    let stats = client.pool_stats();
    assert_eq!(stats.total_conns, 0);
    assert_eq!(stats.idle_conns, 0);
    assert_eq!(client.pool().available(), 2);
}

#[tokio::test]
async fn exception_mid_stream_ends_cursor_and_discards_connection() {
    let server = MockServer::replying(vec![
        ServerPacket::Data(id_name_block(&[(1, "a")])),
        ServerPacket::Exception(exception(241, None)),
    ])
    .await;
    let client = ChClient::new(server.config()).unwrap();

    let mut cursor = client.query("SELECT id, name FROM t").await.unwrap();
    assert!(cursor.next().await.is_some());
    assert!(cursor.next().await.is_none());
    assert_eq!(cursor.err().and_then(ChError::server_code), Some(241));
    assert!(cursor.close().await.is_err());
    assert_eq!(client.pool_stats().total_conns, 0);
}

#[tokio::test]
async fn read_timeout_sends_cancel_and_discards() {
    init_tracing();
    let server = MockServer::start(|_, _| Reply::Hang).await;
    let client = ChClient::new(
        server
            .config()
            .read_timeout(Duration::from_millis(100))
            .max_retries(0),
    )
    .unwrap();

    let err = client.exec("SELECT sleep(10)").await.unwrap_err();
    assert!(matches!(err, ChError::Transport(TransportError::Timeout("read"))));
    assert_eq!(client.pool_stats().total_conns, 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.recorded.cancels.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn caller_deadline_is_not_retried() {
    let server = MockServer::start(|_, _| Reply::Hang).await;
    let client = ChClient::new(server.config()).unwrap();

    let opts = QueryOptions::new().timeout(Duration::from_millis(100));
    let err = client.exec_with("SELECT sleep(10)", &opts).await.unwrap_err();
    assert!(matches!(err, ChError::DeadlineExceeded));
    assert_eq!(server.query_count(), 1);
}

#[tokio::test]
async fn connection_closed_by_server_is_retried_on_new_connection() {
    let server = MockServer::start(|_, n| {
        if n == 0 {
            Reply::Close
        } else {
            Reply::Packets(vec![ServerPacket::EndOfStream])
        }
    })
    .await;
    let client = ChClient::new(server.config()).unwrap();

    client.exec("SELECT 1").await.unwrap();
    assert_eq!(server.query_count(), 2);
    assert_eq!(server.recorded.accepted.load(Ordering::SeqCst), 2);
}

struct RowCounter {
    rows: Arc<AtomicU64>,
    ops: Arc<Mutex<Vec<String>>>,
}

impl QueryHook for RowCounter {
    fn after_query(&self, event: &QueryEvent, error: Option<&ChError>) {
        self.rows.fetch_add(event.rows, Ordering::SeqCst);
        self.ops
            .lock()
            .unwrap()
            .push(format!("{} ok={}", event.operation, error.is_none()));
    }
}

#[tokio::test]
async fn hooks_observe_queries() {
    init_tracing();
    let server = MockServer::start(|q, _| {
        if q.query.contains("bad") {
            Reply::Packets(vec![ServerPacket::Exception(exception(60, None))])
        } else {
            Reply::Packets(three_rows_in_two_blocks())
        }
    })
    .await;
    let client = ChClient::new(server.config()).unwrap();
    let rows = Arc::new(AtomicU64::new(0));
    let ops = Arc::new(Mutex::new(Vec::new()));
    client.add_query_hook(TracingHook::default());
    client.add_query_hook(RowCounter {
        rows: rows.clone(),
        ops: ops.clone(),
    });

    collect_rows(&client, "select id, name from t").await.unwrap();
    assert!(client.exec("SELECT bad").await.is_err());

    assert_eq!(rows.load(Ordering::SeqCst), 3);
    assert_eq!(
        *ops.lock().unwrap(),
        vec!["SELECT ok=true".to_string(), "SELECT ok=false".to_string()]
    );
    assert_eq!(client.stats().queries, 2);
    assert_eq!(client.stats().errors, 1);
}

#[tokio::test]
#[ignore = "Requires ClickHouse server"]
async fn live_server_round_trip() {
    let client = ChClient::from_dsn("clickhouse://default@localhost:9000/default").unwrap();
    client.ping().await.unwrap();
    let rows = collect_rows(&client, "SELECT number FROM system.numbers LIMIT 10")
        .await
        .unwrap();
    assert_eq!(rows.len(), 10);
    assert_eq!(rows[9].get_u64(0), Some(9));
    client.close().await.unwrap();
}
