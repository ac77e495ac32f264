//! Shared runtime state for psr-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The listener holds the
//! same counters so `/v1/status` can report them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use psr_audit::AuditLog;
use psr_config::Settings;
use psr_db::{RetryPolicy, RetryWriter, SqliteStore, StoreOptions};
use psr_reconcile::ReconcileEngine;
use serde::{Deserialize, Serialize};
use tracing::info;

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// Listener counters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ListenerCounters {
    connections_accepted: AtomicU64,
    connections_active: AtomicU64,
    frames_ok: AtomicU64,
    frames_rejected: AtomicU64,
    reconcile_failures: AtomicU64,
}

/// Point-in-time copy of [`ListenerCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerStats {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub frames_ok: u64,
    pub frames_rejected: u64,
    pub reconcile_failures: u64,
}

impl ListenerCounters {
    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn frame_ok(&self) {
        self.frames_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconcile_failed(&self) {
        self.reconcile_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            frames_ok: self.frames_ok.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            reconcile_failures: self.reconcile_failures.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub build: BuildInfo,
    pub engine: Arc<ReconcileEngine>,
    pub counters: Arc<ListenerCounters>,
}

impl AppState {
    pub fn new(engine: Arc<ReconcileEngine>) -> Self {
        Self {
            build: BuildInfo {
                service: "psr-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            engine,
            counters: Arc::new(ListenerCounters::default()),
        }
    }
}

/// Open the store, apply migrations, open the audit log and assemble the
/// engine. Shared by the daemon and the CLI.
pub async fn build_engine(settings: &Settings) -> anyhow::Result<(Arc<SqliteStore>, Arc<ReconcileEngine>)> {
    let store = SqliteStore::connect(
        &settings.store.url,
        &StoreOptions {
            max_connections: settings.store.max_connections,
            busy_timeout: settings.store.busy_timeout(),
        },
    )
    .await
    .with_context(|| format!("open store {}", settings.store.url))?;
    store.migrate().await.context("apply migrations")?;
    info!(url = %settings.store.url, "store ready");

    let audit = AuditLog::new(
        &settings.audit.path,
        settings.audit.max_bytes,
        settings.audit.generations,
    )?;

    let retry = RetryWriter::new(RetryPolicy {
        max_retries: settings.retry.max_retries,
        base_delay: settings.retry.base_delay(),
    });

    let store = Arc::new(store);
    let engine = Arc::new(ReconcileEngine::new(store.clone(), audit, retry));
    Ok((store, engine))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}
