//! Scenario: Telemetry Listener over a real loopback socket.
//!
//! # Invariants under test
//!
//! - A well-formed frame reaches the engine and moves the space.
//! - A malformed frame is audited and the connection stays open.
//! - An idle connection is closed after the configured deadline.
//! - Flipping the shutdown channel stops the accept loop.

use std::sync::Arc;
use std::time::Duration;

use psr_audit::{AuditAction, AuditLog, AuditQuery};
use psr_daemon::listener::{ListenerConfig, TelemetryListener};
use psr_daemon::state::ListenerCounters;
use psr_db::{RetryWriter, SqliteStore, Store, StoreOptions};
use psr_reconcile::ReconcileEngine;
use psr_schemas::{Actor, SensorStatus, SpaceStatus};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

const OCCUPIED_FRAME: &str = "00112233440181CAE53081CAE175";

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<SqliteStore>,
    engine: Arc<ReconcileEngine>,
    counters: Arc<ListenerCounters>,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        SqliteStore::open(dir.path().join("parking.db"), &StoreOptions::default())
            .await
            .unwrap(),
    );
    store.migrate().await.unwrap();
    let audit = AuditLog::with_defaults(dir.path().join("sensor_audit.jsonl")).unwrap();
    let engine = Arc::new(ReconcileEngine::new(
        store.clone(),
        audit,
        RetryWriter::default(),
    ));
    Harness {
        _dir: dir,
        store,
        engine,
        counters: Arc::new(ListenerCounters::default()),
    }
}

impl Harness {
    async fn listener(&self, idle_timeout: Option<Duration>) -> TelemetryListener {
        TelemetryListener::bind(
            "127.0.0.1:0",
            ListenerConfig {
                read_buffer_bytes: 1024,
                idle_timeout,
            },
            Arc::clone(&self.engine),
            Arc::clone(&self.counters),
        )
        .await
        .unwrap()
    }
}

/// Poll `check` every 10ms for up to 3s.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn frames_are_applied_and_bad_frames_audited() {
    let h = harness().await;
    let admin = Actor::Admin("ops".to_string());
    let sensor = h
        .store
        .insert_sensor("75E1CA81", Some("30E5CA81"), SensorStatus::Live, &admin)
        .await
        .unwrap();
    let space = h.store.insert_space(sensor.id, &admin).await.unwrap();

    let listener = h.listener(None).await;
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(listener.run(rx));

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(&hex::decode(OCCUPIED_FRAME).unwrap())
        .await
        .unwrap();

    let store = h.store.clone();
    let occupied = eventually(|| {
        let store = store.clone();
        async move {
            matches!(
                store.space_by_id(space.id).await,
                Ok(Some(s)) if s.status == SpaceStatus::Occupied
            )
        }
    })
    .await;
    assert!(occupied, "frame never reached the store");

    // Too short to parse; the connection must survive it.
    conn.write_all(&[0x00, 0x11, 0x22]).await.unwrap();
    let counters = h.counters.clone();
    assert!(
        eventually(|| {
            let counters = counters.clone();
            async move { counters.snapshot().frames_rejected == 1 }
        })
        .await
    );

    let stats = h.counters.snapshot();
    assert_eq!(stats.frames_ok, 1);
    assert_eq!(stats.connections_accepted, 1);
    assert_eq!(stats.connections_active, 1);

    let errors = h
        .engine
        .audit_log()
        .query(&AuditQuery {
            action: Some(AuditAction::Error),
            ..AuditQuery::default()
        })
        .unwrap();
    assert_eq!(errors.total, 1);
    assert_eq!(errors.entries[0].raw_hex.as_deref(), Some("001122"));

    let updated = h
        .engine
        .audit_log()
        .query(&AuditQuery {
            action: Some(AuditAction::Updated),
            ..AuditQuery::default()
        })
        .unwrap();
    assert_eq!(updated.total, 1);
    assert_eq!(updated.entries[0].wpsd_id.as_deref(), Some("75E1CA81"));

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("listener did not stop")
        .unwrap();
}

#[tokio::test]
async fn idle_connection_is_closed() {
    let h = harness().await;
    let listener = h.listener(Some(Duration::from_millis(150))).await;
    let addr = listener.local_addr().unwrap();
    let (_tx, rx) = watch::channel(false);
    tokio::spawn(listener.run(rx));

    let mut conn = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(3), conn.read(&mut buf))
        .await
        .expect("server never closed the idle connection")
        .unwrap_or(0);
    assert_eq!(n, 0);

    let counters = h.counters.clone();
    assert!(
        eventually(|| {
            let counters = counters.clone();
            async move { counters.snapshot().connections_active == 0 }
        })
        .await
    );
    assert_eq!(h.counters.snapshot().connections_accepted, 1);
}

#[tokio::test]
async fn shutdown_stops_accept_loop_and_open_connections() {
    let h = harness().await;
    let listener = h.listener(None).await;
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(listener.run(rx));

    let mut conn = TcpStream::connect(addr).await.unwrap();
    let counters = h.counters.clone();
    assert!(
        eventually(|| {
            let counters = counters.clone();
            async move { counters.snapshot().connections_active == 1 }
        })
        .await
    );

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("listener did not stop")
        .unwrap();

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(3), conn.read(&mut buf))
        .await
        .expect("connection left open after shutdown")
        .unwrap_or(0);
    assert_eq!(n, 0);
}
