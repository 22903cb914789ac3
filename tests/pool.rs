//! Pool capacity, health eviction and shutdown.

mod common;

use common::{MockServer, exception, pool, wait_until};
use qail_ch::PoolConfig;
use qail_ch::error::{ChError, PoolError, TransportError};
use qail_ch::protocol::ServerPacket;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test]
async fn admission_is_bounded_by_pool_size() {
    let server = MockServer::replying(vec![]).await;
    let pool = pool(
        server
            .config()
            .pool(PoolConfig::default().pool_size(2).pool_timeout(Duration::from_millis(100))),
    );

    let a = pool.get(None).await.unwrap();
    let _b = pool.get(None).await.unwrap();
    assert_eq!(pool.available(), 0);

    let err = pool.get(None).await.unwrap_err();
    assert!(matches!(err, ChError::Pool(PoolError::Timeout(_))));
    assert_eq!(pool.stats().timeouts, 1);

    drop(a);
    let c = pool.get(None).await.unwrap();
    assert_eq!(pool.stats().hits, 1);
    assert_eq!(pool.stats().total_conns, 2);
    drop(c);
}

#[tokio::test]
async fn caller_deadline_bounds_admission() {
    let server = MockServer::replying(vec![]).await;
    let pool = pool(server.config().pool_size(1));
    let _held = pool.get(None).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_millis(50);
    let err = pool.get(Some(deadline)).await.unwrap_err();
    assert!(matches!(err, ChError::DeadlineExceeded));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checkouts_never_exceed_pool_size() {
    let server = MockServer::replying(vec![]).await;
    let pool = pool(server.config().pool_size(3));
    let out = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..24 {
        let (pool, out, peak) = (pool.clone(), out.clone(), peak.clone());
        tasks.push(tokio::spawn(async move {
            let mut conn = pool.get(None).await.unwrap();
            let now = out.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            conn.ping(None).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            out.fetch_sub(1, Ordering::SeqCst);
            if i % 5 == 0 {
                conn.discard("test");
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(pool.available(), 3);
    assert!(pool.stats().total_conns <= 3);
}

#[tokio::test]
async fn idle_connections_past_max_idle_time_are_replaced() {
    let server = MockServer::replying(vec![]).await;
    let pool = pool(
        server
            .config()
            .pool(PoolConfig::default().pool_size(2).conn_max_idle_time(Duration::from_millis(50))),
    );

    drop(pool.get(None).await.unwrap());
    assert_eq!(pool.stats().idle_conns, 1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let conn = pool.get(None).await.unwrap();
    let stats = pool.stats();
    assert_eq!(stats.stale_conns, 1);
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.total_conns, 1);
    assert_eq!(server.recorded.accepted.load(Ordering::SeqCst), 2);
    drop(conn);
}

#[tokio::test]
async fn connections_past_max_lifetime_are_replaced() {
    let server = MockServer::replying(vec![]).await;
    let pool = pool(
        server
            .config()
            .pool(PoolConfig::default().pool_size(2).conn_max_lifetime(Duration::from_millis(50))),
    );

    let first = pool.get(None).await.unwrap().id();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = pool.get(None).await.unwrap().id();
    assert_ne!(first, second);
    assert_eq!(pool.stats().stale_conns, 1);
}

#[tokio::test]
async fn connection_closed_by_peer_fails_liveness_check() {
    let server = MockServer::replying(vec![]).await;
    let pool = pool(server.config());

    let mut conn = pool.get(None).await.unwrap();
    conn.ping(None).await.unwrap();
    drop(conn);
    drop(server);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Idle conn sees EOF and is evicted; the new dial is refused.
    assert!(pool.get(None).await.is_err());
    assert_eq!(pool.stats().stale_conns, 1);
}

#[tokio::test]
async fn close_reaches_checked_out_connections() {
    let server = MockServer::replying(vec![ServerPacket::EndOfStream]).await;
    let pool = pool(server.config());

    let idle = pool.get(None).await.unwrap();
    let mut held = pool.get(None).await.unwrap();
    drop(idle);
    assert_eq!(pool.stats().idle_conns, 1);

    pool.close().await.unwrap();
    pool.close().await.unwrap();
    assert_eq!(pool.stats().idle_conns, 0);
    assert!(held.is_closed());
    assert!(matches!(
        held.ping(None).await,
        Err(ChError::Transport(TransportError::Closed))
    ));
    drop(held);

    assert_eq!(pool.stats().total_conns, 0);
    assert!(matches!(
        pool.get(None).await,
        Err(ChError::Pool(PoolError::Closed))
    ));
}

#[tokio::test]
async fn min_idle_conns_are_dialed_ahead_and_replaced() {
    let server = MockServer::replying(vec![]).await;
    let pool = pool(
        server
            .config()
            .pool(PoolConfig::default().pool_size(3).min_idle_conns(2)),
    );

    wait_until(|| pool.stats().idle_conns == 2).await;
    assert_eq!(pool.stats().total_conns, 2);

    let _a = pool.get(None).await.unwrap();
    assert_eq!(pool.stats().hits, 1);
    wait_until(|| pool.stats().idle_conns == 2).await;
    assert_eq!(pool.stats().total_conns, 3);

    // The pool is full, so taking another idle conn is not topped up.
    let b = pool.get(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = pool.stats();
    assert_eq!((stats.total_conns, stats.idle_conns), (3, 1));

    b.discard("test");
    wait_until(|| pool.stats().idle_conns == 2).await;
    assert_eq!(pool.stats().total_conns, 3);
    assert_eq!(server.recorded.accepted.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn release_discards_only_after_connection_errors() {
    let server = MockServer::replying(vec![]).await;
    let pool = pool(server.config());

    let conn = pool.get(None).await.unwrap();
    conn.release(Some(&ChError::Transport(TransportError::Timeout("read"))));
    assert_eq!(pool.stats().total_conns, 0);

    let conn = pool.get(None).await.unwrap();
    conn.release(Some(&ChError::Transport(TransportError::Closed)));
    assert_eq!(pool.stats().total_conns, 0);

    let conn = pool.get(None).await.unwrap();
    conn.release(Some(&ChError::Server(exception(60, None))));
    let stats = pool.stats();
    assert_eq!((stats.total_conns, stats.idle_conns), (1, 1));

    let conn = pool.get(None).await.unwrap();
    conn.release(None);
    assert_eq!(pool.stats().idle_conns, 1);
    assert_eq!(server.recorded.accepted.load(Ordering::SeqCst), 3);
}
