//! psr-daemon entry point.
//!
//! Thin: loads config, sets up tracing, builds the engine, then runs the
//! telemetry listener, the expiry sweeper and the HTTP surface until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use psr_config::{report_unused_keys, UnusedKeyPolicy};
use psr_daemon::listener::{ListenerConfig, TelemetryListener};
use psr_daemon::{routes, state};
use psr_reconcile::{spawn_expiry_sweeper, ExpirySweeper, SweepPolicy};
use tokio::sync::watch;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Production injects env
    // vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let loaded = psr_config::load_from_env().context("load config")?;
    let unused = report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Warn)?;
    if !unused.is_clean() {
        warn!(keys = ?unused.unused_leaf_pointers, "CONFIG_UNUSED_KEYS");
    }
    let settings = loaded.settings()?;
    info!(config_hash = %loaded.config_hash, "config loaded");

    let (_store, engine) = state::build_engine(&settings).await?;
    let shared = Arc::new(state::AppState::new(Arc::clone(&engine)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let telemetry = TelemetryListener::bind(
        &settings.listener.bind,
        ListenerConfig::from(&settings.listener),
        Arc::clone(&engine),
        Arc::clone(&shared.counters),
    )
    .await?;
    let telemetry_task = tokio::spawn(telemetry.run(shutdown_rx.clone()));

    let sweeper = Arc::new(ExpirySweeper::new(
        Arc::clone(&engine),
        SweepPolicy::from_secs(
            settings.sweeper.grace_secs,
            settings.sweeper.warn_lower_secs,
            settings.sweeper.warn_upper_secs,
            settings.sweeper.legacy_duration_secs,
        ),
    ));
    let sweeper_task = spawn_expiry_sweeper(sweeper, settings.sweeper.interval(), shutdown_rx);

    let app = routes::build_router(Arc::clone(&shared)).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let http = tokio::net::TcpListener::bind(&settings.http.bind)
        .await
        .with_context(|| format!("bind http on {}", settings.http.bind))?;
    info!("psr-daemon http on http://{}", settings.http.bind);

    axum::serve(http, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "ctrl-c handler failed");
            }
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("server crashed")?;

    let _ = telemetry_task.await;
    let _ = sweeper_task.await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
