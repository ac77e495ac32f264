//! Reconciliation of sensor reports and user/system transitions into space
//! state.
//!
//! Every path is read, branch, conditional write. The store re-checks the
//! branch condition at write time (`where status = expected`); a zero-row
//! write is a conflict, answered by re-reading rather than overwriting.
//!
//! Protection rule: sensor input never moves a space into or out of
//! `reserved`. Only check-in and [`ReconcileEngine::apply_expiry_or_vacate`]
//! may leave `reserved`.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use psr_audit::{AuditAction, AuditEntry, AuditLog};
use psr_db::{ReservationClose, RetryWriter, Store};
use psr_proto::ProtocolError;
use psr_schemas::{
    Actor, NewReservation, OccupancyEvent, ParkingSpace, Reservation, ReservationStatus,
    SpaceStatus,
};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::{ReconcileError, Result};
use crate::notify::Notifier;

/// Upper bound on read/write passes when conditional writes keep losing.
const MAX_PASSES: usize = 3;

/// What happened to one sensor report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorOutcome {
    UnknownSensor,
    SensorNotLive,
    /// Known sensor with no paired space (configuration inconsistency).
    SpaceMissing,
    /// Space is reserved; report ignored.
    Protected { space_id: i64 },
    Unchanged { space_id: i64 },
    Updated {
        space_id: i64,
        from: SpaceStatus,
        to: SpaceStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacateReason {
    Expired,
    Cancelled,
    CheckOut,
    Manual,
}

impl VacateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            VacateReason::Expired => "expired",
            VacateReason::Cancelled => "cancelled",
            VacateReason::CheckOut => "check_out",
            VacateReason::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "expired" => Ok(VacateReason::Expired),
            "cancelled" => Ok(VacateReason::Cancelled),
            "check_out" => Ok(VacateReason::CheckOut),
            "manual" => Ok(VacateReason::Manual),
            other => Err(ReconcileError::InvalidRequest(format!(
                "unknown vacate reason: {other}"
            ))),
        }
    }

    /// Reservation-driven reasons only apply to a reserved space.
    fn may_vacate(&self, status: SpaceStatus) -> bool {
        match self {
            VacateReason::Expired | VacateReason::Cancelled => status == SpaceStatus::Reserved,
            VacateReason::CheckOut | VacateReason::Manual => status != SpaceStatus::Vacant,
        }
    }

    fn closes_as(&self) -> ReservationStatus {
        match self {
            VacateReason::Cancelled => ReservationStatus::Cancelled,
            _ => ReservationStatus::Completed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacateOutcome {
    Vacated {
        from: SpaceStatus,
        reservation_id: Option<i64>,
    },
    /// Space was left alone; only the linked reservation was closed.
    ReservationClosed { reservation_id: i64 },
    Unchanged { status: SpaceStatus },
}

impl VacateOutcome {
    /// `true` if a reservation ended as part of this call.
    pub fn closed_reservation(&self) -> bool {
        matches!(
            self,
            VacateOutcome::Vacated {
                reservation_id: Some(_),
                ..
            } | VacateOutcome::ReservationClosed { .. }
        )
    }
}

/// The single writer of space state. Cheap to share behind an `Arc`.
pub struct ReconcileEngine {
    store: Arc<dyn Store>,
    audit: AuditLog,
    retry: RetryWriter,
    notifier: Notifier,
}

impl ReconcileEngine {
    pub fn new(store: Arc<dyn Store>, audit: AuditLog, retry: RetryWriter) -> Self {
        let notifier = Notifier::new(store.clone(), retry);
        Self {
            store,
            audit,
            retry,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn retry(&self) -> RetryWriter {
        self.retry
    }

    // -----------------------------------------------------------------------
    // Sensor path
    // -----------------------------------------------------------------------

    /// Merge one decoded sensor report into space state.
    ///
    /// Returns `Err` only for store failures (busy after retries, query
    /// errors) or a conflict that persisted across every pass; each of those
    /// is also audited as `error`.
    pub async fn apply_sensor_event(&self, event: &OccupancyEvent) -> Result<SensorOutcome> {
        let sensor_id = event.sensor_external_id.as_str();
        let target = event.target_status();
        let parsed = json!({
            "wpsd_id": sensor_id,
            "wdc_id": event.collector_id,
            "occupied": event.occupied,
            "status": target.as_str(),
            "received_at": event.received_at,
        });
        let entry = |action: AuditAction, message: String| {
            AuditEntry::new(action, message)
                .sensor(sensor_id)
                .collector(event.collector_id.as_str())
                .raw_hex(event.raw_frame_hex.as_str())
                .parsed(parsed.clone())
        };

        let sensor = match self.store.sensor_by_external_id(sensor_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                debug!(sensor = %sensor_id, "unknown sensor");
                self.audit(entry(AuditAction::IgnoredUnknown, "sensor not found".into()))
                    .await;
                return Ok(SensorOutcome::UnknownSensor);
            }
            Err(e) => return Err(self.sensor_failure(entry, "sensor lookup", e.into()).await),
        };

        if !sensor.is_live() {
            debug!(sensor = %sensor_id, status = sensor.status.as_str(), "sensor not live");
            self.audit(entry(
                AuditAction::IgnoredUnknown,
                format!("sensor not live ({})", sensor.status.as_str()),
            ))
            .await;
            return Ok(SensorOutcome::SensorNotLive);
        }

        let actor = Actor::sensor(sensor_id);
        let mut last_seen = SpaceStatus::Vacant;
        let mut space_id = 0;

        for pass in 0..MAX_PASSES {
            let space = match self.store.space_by_sensor_id(sensor.id).await {
                Ok(Some(s)) => s,
                Ok(None) => {
                    error!(sensor = %sensor_id, "space missing for sensor");
                    self.audit(entry(AuditAction::Error, "space missing for sensor".into()))
                        .await;
                    return Ok(SensorOutcome::SpaceMissing);
                }
                Err(e) => return Err(self.sensor_failure(entry, "space lookup", e.into()).await),
            };
            space_id = space.id;
            last_seen = space.status;

            if space.status == SpaceStatus::Reserved {
                info!(sensor = %sensor_id, space_id, "space reserved; sensor report ignored");
                self.audit(entry(
                    AuditAction::IgnoredReservation,
                    format!("space {} is reserved; sensor update ignored", space.id),
                ))
                .await;
                return Ok(SensorOutcome::Protected { space_id });
            }

            if space.status == target {
                debug!(sensor = %sensor_id, space_id, status = %target, "status unchanged");
                self.audit(entry(AuditAction::Received, "status unchanged".into()))
                    .await;
                return Ok(SensorOutcome::Unchanged { space_id });
            }

            let now = Utc::now();
            let written = self
                .retry
                .run("set_occupancy", || {
                    self.store
                        .set_occupancy(space.id, space.status, event.occupied, now, &actor)
                })
                .await;

            match written {
                Ok(true) => {
                    info!(sensor = %sensor_id, space_id, from = %space.status, to = %target, "space updated");
                    self.audit(entry(
                        AuditAction::Updated,
                        format!("space {}: {} -> {}", space.id, space.status, target),
                    ))
                    .await;
                    if target == SpaceStatus::Vacant {
                        self.announce_available(space.id, now).await;
                    }
                    return Ok(SensorOutcome::Updated {
                        space_id,
                        from: space.status,
                        to: target,
                    });
                }
                Ok(false) => {
                    debug!(sensor = %sensor_id, space_id, pass, "conditional write lost; re-reading");
                }
                Err(e) => {
                    return Err(self.sensor_failure(entry, "set_occupancy", e.into()).await)
                }
            }
        }

        let err = ReconcileError::Conflict {
            space_id,
            status: last_seen,
        };
        Err(self.sensor_failure(entry, "set_occupancy", err).await)
    }

    /// Record a frame the parser rejected. The connection stays open.
    pub async fn audit_protocol_error(&self, raw_hex: &str, err: &ProtocolError) -> Result<()> {
        self.append_audit(
            AuditEntry::new(AuditAction::Error, err.to_string())
                .raw_hex(raw_hex)
                .parsed(json!({ "error": err.kind() })),
        )
        .await?;
        Ok(())
    }

    async fn sensor_failure(
        &self,
        entry: impl Fn(AuditAction, String) -> AuditEntry,
        op: &str,
        err: ReconcileError,
    ) -> ReconcileError {
        warn!(op, error = %err, "sensor event failed");
        self.audit(entry(AuditAction::Error, format!("{op} failed: {err}")))
            .await;
        err
    }

    // -----------------------------------------------------------------------
    // Reservation path
    // -----------------------------------------------------------------------

    /// Accept a reservation on a vacant space. Anything else is a
    /// [`ReconcileError::Conflict`]; nothing is overwritten.
    pub async fn apply_reservation(&self, req: NewReservation, actor: &Actor) -> Result<Reservation> {
        let req = validate_reservation(req)?;
        let now = Utc::now();

        let reserved = self
            .retry
            .run("reserve_space", || self.store.reserve_space(&req, now, actor))
            .await?;

        match reserved {
            Some(r) => {
                info!(
                    space_id = r.space_id,
                    reservation_id = r.id,
                    plate = %r.license_plate,
                    actor = %actor,
                    "reservation accepted"
                );
                Ok(r)
            }
            None => Err(self.conflict_or_missing(req.space_id).await?),
        }
    }

    /// `reserved -> occupied`: the holder arrived. Completes the reservation.
    pub async fn apply_check_in(&self, space_id: i64, actor: &Actor) -> Result<ParkingSpace> {
        let now = Utc::now();
        let checked_in = self
            .retry
            .run("check_in", || self.store.check_in(space_id, now, actor))
            .await?;

        if !checked_in {
            return Err(self.conflict_or_missing(space_id).await?);
        }

        info!(space_id, actor = %actor, "checked in");
        self.store
            .space_by_id(space_id)
            .await?
            .ok_or(ReconcileError::SpaceNotFound(space_id))
    }

    /// Authorized release of a space, the only path besides check-in that may
    /// clear `reserved`. Closes the linked reservation in the same write.
    pub async fn apply_expiry_or_vacate(
        &self,
        space_id: i64,
        reason: VacateReason,
        actor: &Actor,
    ) -> Result<VacateOutcome> {
        self.vacate_at(space_id, reason, actor, Utc::now()).await
    }

    pub(crate) async fn vacate_at(
        &self,
        space_id: i64,
        reason: VacateReason,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<VacateOutcome> {
        let mut last_seen = SpaceStatus::Vacant;

        for pass in 0..MAX_PASSES {
            let space = self
                .store
                .space_by_id(space_id)
                .await?
                .ok_or(ReconcileError::SpaceNotFound(space_id))?;
            last_seen = space.status;

            let close = self
                .store
                .active_reservation_for_space(space_id)
                .await?
                .map(|r| ReservationClose {
                    reservation_id: r.id,
                    status: reason.closes_as(),
                    reason: reason.as_str().to_string(),
                });

            if !reason.may_vacate(space.status) {
                if let Some(c) = &close {
                    let closed = self
                        .retry
                        .run("close_reservation", || {
                            self.store.close_reservation(c, now, actor)
                        })
                        .await?;
                    if closed {
                        info!(space_id, reservation_id = c.reservation_id, reason = reason.as_str(), "reservation closed; space left {}", space.status);
                        return Ok(VacateOutcome::ReservationClosed {
                            reservation_id: c.reservation_id,
                        });
                    }
                }
                debug!(space_id, status = %space.status, reason = reason.as_str(), "nothing to vacate");
                return Ok(VacateOutcome::Unchanged {
                    status: space.status,
                });
            }

            let released = self
                .retry
                .run("release_space", || {
                    self.store
                        .release_space(space_id, space.status, close.as_ref(), now, actor)
                })
                .await?;

            if released {
                info!(space_id, from = %space.status, reason = reason.as_str(), actor = %actor, "space vacated");
                self.announce_available(space_id, now).await;
                return Ok(VacateOutcome::Vacated {
                    from: space.status,
                    reservation_id: close.map(|c| c.reservation_id),
                });
            }

            debug!(space_id, pass, "conditional release lost; re-reading");
        }

        Err(ReconcileError::Conflict {
            space_id,
            status: last_seen,
        })
    }

    /// Register `recipient_id` for `space_available` on this space.
    pub async fn watch_space(&self, space_id: i64, recipient_id: &str, actor: &Actor) -> Result<()> {
        let recipient_id = recipient_id.trim();
        if recipient_id.is_empty() {
            return Err(ReconcileError::InvalidRequest("recipient_id is empty".into()));
        }
        if self.store.space_by_id(space_id).await?.is_none() {
            return Err(ReconcileError::SpaceNotFound(space_id));
        }
        self.retry
            .run("watch_space", || {
                self.store.watch_space(space_id, recipient_id, actor)
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // helpers
    // -----------------------------------------------------------------------

    async fn conflict_or_missing(&self, space_id: i64) -> Result<ReconcileError> {
        Ok(match self.store.space_by_id(space_id).await? {
            Some(space) => {
                info!(space_id, status = %space.status, "transition rejected: conflict");
                ReconcileError::Conflict {
                    space_id,
                    status: space.status,
                }
            }
            None => ReconcileError::SpaceNotFound(space_id),
        })
    }

    async fn announce_available(&self, space_id: i64, now: DateTime<Utc>) {
        if let Err(e) = self.notifier.space_available(space_id, now).await {
            warn!(space_id, error = %e, "space_available notification failed");
        }
    }

    async fn audit(&self, entry: AuditEntry) {
        let action = entry.action;
        if let Err(e) = self.append_audit(entry).await {
            error!(action = action.as_str(), error = %e, "audit append failed");
        }
    }

    /// The append takes a file lock and does blocking I/O, so it runs on the
    /// blocking pool instead of the async worker.
    async fn append_audit(&self, entry: AuditEntry) -> anyhow::Result<()> {
        let log = self.audit.clone();
        tokio::task::spawn_blocking(move || log.append(&entry))
            .await
            .context("audit append task failed")?
    }
}

fn validate_reservation(mut req: NewReservation) -> Result<NewReservation> {
    req.license_plate = req.license_plate.trim().to_string();
    if req.license_plate.is_empty() {
        return Err(ReconcileError::InvalidRequest("license_plate is empty".into()));
    }
    if req.end_time <= req.start_time {
        return Err(ReconcileError::InvalidRequest(
            "end_time must be after start_time".into(),
        ));
    }
    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn req(plate: &str, hours: i64) -> NewReservation {
        let start = Utc::now();
        NewReservation {
            space_id: 1,
            license_plate: plate.to_string(),
            recipient_id: None,
            start_time: start,
            end_time: start + Duration::hours(hours),
            payment_tx_hash: None,
        }
    }

    #[test]
    fn reservation_validation() {
        assert_eq!(validate_reservation(req("  AB123CD ", 1)).unwrap().license_plate, "AB123CD");
        assert!(matches!(
            validate_reservation(req("   ", 1)),
            Err(ReconcileError::InvalidRequest(_))
        ));
        assert!(matches!(
            validate_reservation(req("AB123CD", 0)),
            Err(ReconcileError::InvalidRequest(_))
        ));
    }

    #[test]
    fn vacate_reason_gates() {
        assert!(VacateReason::Expired.may_vacate(SpaceStatus::Reserved));
        assert!(!VacateReason::Expired.may_vacate(SpaceStatus::Occupied));
        assert!(!VacateReason::Cancelled.may_vacate(SpaceStatus::Vacant));
        assert!(VacateReason::CheckOut.may_vacate(SpaceStatus::Occupied));
        assert!(VacateReason::Manual.may_vacate(SpaceStatus::Reserved));
        assert!(!VacateReason::Manual.may_vacate(SpaceStatus::Vacant));
        assert_eq!(VacateReason::Cancelled.closes_as(), ReservationStatus::Cancelled);
        assert_eq!(VacateReason::Expired.closes_as(), ReservationStatus::Completed);
        assert_eq!(VacateReason::parse("check_out").unwrap(), VacateReason::CheckOut);
        assert!(VacateReason::parse("towed").is_err());
    }
}
