use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use psr_audit::{AuditAction, AuditLog, AuditQuery};
use psr_config::Settings;
use psr_db::{SqliteStore, Store, StoreOptions};
use psr_reconcile::{ExpirySweeper, SweepPolicy};
use psr_schemas::{Actor, SensorStatus};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "psr")]
#[command(about = "Parking-state reconciliation operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (later layers override earlier ones)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Sensor provisioning
    Sensor {
        #[command(subcommand)]
        cmd: SensorCmd,
    },

    /// Parking space provisioning
    Space {
        #[command(subcommand)]
        cmd: SpaceCmd,
    },

    /// Sensor audit log utilities
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },

    /// Telemetry frame utilities
    Frame {
        #[command(subcommand)]
        cmd: FrameCmd,
    },

    /// Expiry sweeper
    Sweep {
        #[command(subcommand)]
        cmd: SweepCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    /// Apply embedded migrations.
    Migrate,

    /// Print schema version and row counts.
    Diag,
}

#[derive(Subcommand)]
enum SensorCmd {
    /// Register a sensor by its wire id (wpsd_id).
    Add {
        #[arg(long)]
        external_id: String,

        /// Collector (wdc_id) the sensor reports through
        #[arg(long)]
        collector_id: Option<String>,

        /// live | inactive | deleted
        #[arg(long, default_value = "live")]
        status: String,

        /// Acting identity, `kind:id`
        #[arg(long, default_value = "admin:cli")]
        actor: String,
    },

    /// Change a sensor's status. Only live sensors drive space state.
    SetStatus {
        #[arg(long)]
        id: i64,

        /// live | inactive | deleted
        #[arg(long)]
        status: String,

        #[arg(long, default_value = "admin:cli")]
        actor: String,
    },
}

#[derive(Subcommand)]
enum SpaceCmd {
    /// Create a vacant space bound to a sensor.
    Add {
        #[arg(long)]
        sensor_id: i64,

        #[arg(long, default_value = "admin:cli")]
        actor: String,
    },
}

#[derive(Subcommand)]
enum AuditCmd {
    /// Query the audit log, newest first. Prints one JSON entry per line.
    Query {
        #[arg(long)]
        wpsd_id: Option<String>,

        /// received | updated | ignored_reservation | ignored_unknown | error
        #[arg(long)]
        action: Option<String>,

        /// RFC 3339, inclusive
        #[arg(long)]
        from: Option<String>,

        /// RFC 3339, inclusive
        #[arg(long)]
        to: Option<String>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long)]
        limit: Option<usize>,

        /// Last N matching entries; overrides offset/limit
        #[arg(long)]
        tail: Option<usize>,
    },
}

#[derive(Subcommand)]
enum FrameCmd {
    /// Decode one hex-encoded frame and print the occupancy event as JSON.
    Decode {
        hex: String,
    },
}

#[derive(Subcommand)]
enum SweepCmd {
    /// Run a single expiry/warning pass and print the report.
    Once,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Commands::Db { cmd } => {
            let settings = settings()?;
            let store = open_store(&settings).await?;
            match cmd {
                DbCmd::Migrate => {
                    store.migrate().await.context("apply migrations")?;
                    println!("migrations_applied=true");
                }
                DbCmd::Diag => {
                    let d = store.diagnostics().await?;
                    println!("schema_version={}", d.schema_version);
                    println!("sensors_live={}", d.sensors_live);
                    println!("spaces_vacant={}", d.spaces_vacant);
                    println!("spaces_occupied={}", d.spaces_occupied);
                    println!("spaces_reserved={}", d.spaces_reserved);
                    println!("reservations_active={}", d.reservations_active);
                    println!("notifications_pending={}", d.notifications_pending);
                }
            }
        }
        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = psr_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }
        Commands::Sensor { cmd } => {
            let settings = settings()?;
            let store = open_store(&settings).await?;
            store.migrate().await.context("apply migrations")?;
            match cmd {
                SensorCmd::Add {
                    external_id,
                    collector_id,
                    status,
                    actor,
                } => {
                    let actor = Actor::parse(&actor)?;
                    let status = SensorStatus::parse(&status)?;
                    let s = store
                        .insert_sensor(&external_id, collector_id.as_deref(), status, &actor)
                        .await?;
                    println!("sensor_id={}", s.id);
                    println!("external_id={}", s.external_id);
                    println!("status={}", s.status.as_str());
                }
                SensorCmd::SetStatus { id, status, actor } => {
                    let actor = Actor::parse(&actor)?;
                    let status = SensorStatus::parse(&status)?;
                    if !store.set_sensor_status(id, status, &actor).await? {
                        anyhow::bail!("sensor {} not found", id);
                    }
                    println!("sensor_id={} status={}", id, status.as_str());
                }
            }
        }
        Commands::Space { cmd } => match cmd {
            SpaceCmd::Add { sensor_id, actor } => {
                let settings = settings()?;
                let store = open_store(&settings).await?;
                store.migrate().await.context("apply migrations")?;
                let actor = Actor::parse(&actor)?;
                let space = store.insert_space(sensor_id, &actor).await?;
                println!("space_id={}", space.id);
                println!("sensor_id={}", space.sensor_id);
                println!("status={}", space.status.as_str());
            }
        },
        Commands::Audit { cmd } => match cmd {
            AuditCmd::Query {
                wpsd_id,
                action,
                from,
                to,
                offset,
                limit,
                tail,
            } => {
                let settings = settings()?;
                let audit = AuditLog::new(
                    &settings.audit.path,
                    settings.audit.max_bytes,
                    settings.audit.generations,
                )?;
                let q = AuditQuery {
                    wpsd_id,
                    action: action.as_deref().map(AuditAction::parse).transpose()?,
                    from: from.as_deref().map(parse_ts).transpose()?,
                    to: to.as_deref().map(parse_ts).transpose()?,
                    offset,
                    limit,
                    tail,
                };
                let page = audit.query(&q)?;
                println!("total={}", page.total);
                for e in &page.entries {
                    println!("{}", serde_json::to_string(e)?);
                }
            }
        },
        Commands::Frame { cmd } => match cmd {
            FrameCmd::Decode { hex } => {
                let ev = psr_proto::parse_hex_frame(hex.trim(), Utc::now())
                    .map_err(|e| anyhow::anyhow!("frame rejected ({}): {}", e.kind(), e))?;
                println!("{}", serde_json::to_string_pretty(&ev)?);
            }
        },
        Commands::Sweep { cmd } => match cmd {
            SweepCmd::Once => {
                let settings = settings()?;
                let (_store, engine) = psr_daemon::state::build_engine(&settings).await?;
                let sweeper = ExpirySweeper::new(
                    Arc::clone(&engine),
                    SweepPolicy::from_secs(
                        settings.sweeper.grace_secs,
                        settings.sweeper.warn_lower_secs,
                        settings.sweeper.warn_upper_secs,
                        settings.sweeper.legacy_duration_secs,
                    ),
                );
                let report = sweeper.sweep().await;
                println!("{}", serde_json::to_string(&report)?);
                if report.failed > 0 {
                    anyhow::bail!("{} reservation(s) failed to sweep", report.failed);
                }
            }
        },
    }

    Ok(())
}

fn settings() -> Result<Settings> {
    let loaded = psr_config::load_from_env().context("load config")?;
    loaded.settings()
}

async fn open_store(settings: &Settings) -> Result<SqliteStore> {
    let store = SqliteStore::connect(
        &settings.store.url,
        &StoreOptions {
            max_connections: settings.store.max_connections,
            busy_timeout: settings.store.busy_timeout(),
        },
    )
    .await
    .with_context(|| format!("open store {}", settings.store.url))?;
    tracing::debug!(url = %settings.store.url, "store opened");
    Ok(store)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid RFC 3339 timestamp: {s}"))?
        .with_timezone(&Utc))
}
