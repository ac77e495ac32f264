//! Expiry Sweeper.
//!
//! One pass walks every active reservation:
//! - past its end by more than `grace`: released through the engine
//!   (`VacateReason::Expired`) and a `reservation_ended` notice is queued;
//! - ending within `(warn_lower, warn_upper]`: a single `reservation_ending`
//!   notice, guarded by the store's warned-once mark.
//!
//! Per-reservation failures are logged and counted; they never abort the pass.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use psr_schemas::{Actor, ParkingSpace, Reservation};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::{ReconcileEngine, VacateReason};
use crate::error::Result;

/// Largest second count `chrono::Duration` accepts.
const MAX_SECS: i64 = i64::MAX / 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    pub grace: Duration,
    pub warn_lower: Duration,
    pub warn_upper: Duration,
    /// Assumed length of reservations recorded without any end time.
    pub legacy_duration: Duration,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::seconds(60),
            warn_lower: Duration::minutes(9),
            warn_upper: Duration::minutes(11),
            legacy_duration: Duration::hours(1),
        }
    }
}

impl SweepPolicy {
    pub fn from_secs(grace: u64, warn_lower: u64, warn_upper: u64, legacy_duration: u64) -> Self {
        let secs = |s: u64| Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX).min(MAX_SECS));
        Self {
            grace: secs(grace),
            warn_lower: secs(warn_lower),
            warn_upper: secs(warn_upper),
            legacy_duration: secs(legacy_duration),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub inspected: usize,
    pub expired: usize,
    pub warned: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Swept {
    Expired,
    Warned,
    Idle,
}

pub struct ExpirySweeper {
    engine: Arc<ReconcileEngine>,
    policy: SweepPolicy,
}

impl ExpirySweeper {
    pub fn new(engine: Arc<ReconcileEngine>, policy: SweepPolicy) -> Self {
        Self { engine, policy }
    }

    pub fn policy(&self) -> SweepPolicy {
        self.policy
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// One pass evaluated against `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let active = match self.engine.store().active_reservations().await {
            Ok(rs) => rs,
            Err(e) => {
                warn!(error = %e, "sweep: listing active reservations failed");
                report.failed += 1;
                return report;
            }
        };

        for r in &active {
            report.inspected += 1;
            match self.sweep_one(r, now).await {
                Ok(Swept::Expired) => report.expired += 1,
                Ok(Swept::Warned) => report.warned += 1,
                Ok(Swept::Idle) => {}
                Err(e) => {
                    warn!(reservation_id = r.id, space_id = r.space_id, error = %e, "sweep: reservation failed");
                    report.failed += 1;
                }
            }
        }

        report
    }

    async fn sweep_one(&self, r: &Reservation, now: DateTime<Utc>) -> Result<Swept> {
        let store = self.engine.store();
        let space = store.space_by_id(r.space_id).await?;
        let end = resolve_end_time(r, space.as_ref(), self.policy.legacy_duration);

        if now - end > self.policy.grace {
            let outcome = self
                .engine
                .vacate_at(r.space_id, VacateReason::Expired, &Actor::sweeper(), now)
                .await?;
            if !outcome.closed_reservation() {
                debug!(reservation_id = r.id, ?outcome, "expired reservation already closed");
                return Ok(Swept::Idle);
            }
            self.engine.notifier().reservation_ended(r, now).await?;
            info!(reservation_id = r.id, space_id = r.space_id, %end, "reservation expired");
            return Ok(Swept::Expired);
        }

        let remaining = end - now;
        if remaining > self.policy.warn_lower && remaining <= self.policy.warn_upper {
            let first = self
                .engine
                .retry()
                .run("mark_reservation_warned", || {
                    store.mark_reservation_warned(r.id, now)
                })
                .await?;
            if first {
                self.engine.notifier().reservation_ending(r, end, now).await?;
                info!(reservation_id = r.id, space_id = r.space_id, %end, "reservation ending soon");
                return Ok(Swept::Warned);
            }
        }

        Ok(Swept::Idle)
    }
}

/// End of a reservation: its own end time, else the space's, else the
/// space's reservation time plus the legacy duration, else its start plus
/// the legacy duration.
pub fn resolve_end_time(
    r: &Reservation,
    space: Option<&ParkingSpace>,
    legacy_duration: Duration,
) -> DateTime<Utc> {
    if let Some(end) = r.end_time {
        return end;
    }
    if let Some(space) = space {
        if let Some(end) = space.reservation_end_time {
            return end;
        }
        if let Some(t) = space.reservation_time {
            return t + legacy_duration;
        }
    }
    r.start_time + legacy_duration
}

/// Run [`ExpirySweeper::sweep`] every `interval` until `shutdown` flips to
/// `true` or its sender is dropped.
pub fn spawn_expiry_sweeper(
    sweeper: Arc<ExpirySweeper>,
    interval: StdDuration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = sweeper.sweep().await;
                    if report.expired + report.warned + report.failed > 0 {
                        info!(?report, "sweep complete");
                    } else {
                        debug!(?report, "sweep complete");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("expiry sweeper stopping");
                        break;
                    }
                }
            }
        }
    })
}
