//! psr-schemas
//!
//! Shared data model for the parking-state reconciliation workspace.
//! Every status enum round-trips through `as_str` / `parse` so the store can
//! persist it as text and the audit log can render it verbatim.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Sensor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    Live,
    Inactive,
    Deleted,
}

impl SensorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorStatus::Live => "live",
            SensorStatus::Inactive => "inactive",
            SensorStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "live" => Ok(SensorStatus::Live),
            "inactive" => Ok(SensorStatus::Inactive),
            "deleted" => Ok(SensorStatus::Deleted),
            other => Err(anyhow!("invalid sensor status: {}", other)),
        }
    }
}

/// A physical occupancy sensor. Provisioned by the admin surface; read-only
/// to reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: i64,
    /// Device identifier as reported on the wire ("wpsd_id").
    pub external_id: String,
    /// Paired wireless data collector ("wdc_id").
    pub collector_id: Option<String>,
    pub status: SensorStatus,
}

impl Sensor {
    pub fn is_live(&self) -> bool {
        self.status == SensorStatus::Live
    }
}

// ---------------------------------------------------------------------------
// ParkingSpace
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceStatus {
    Vacant,
    Occupied,
    Reserved,
}

impl SpaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceStatus::Vacant => "vacant",
            SpaceStatus::Occupied => "occupied",
            SpaceStatus::Reserved => "reserved",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "vacant" => Ok(SpaceStatus::Vacant),
            "occupied" => Ok(SpaceStatus::Occupied),
            "reserved" => Ok(SpaceStatus::Reserved),
            other => Err(anyhow!("invalid space status: {}", other)),
        }
    }

    /// Status a sensor reading maps to. Sensors only ever speak about
    /// vacant/occupied; `reserved` is never produced here.
    pub fn from_occupied(occupied: bool) -> Self {
        if occupied {
            SpaceStatus::Occupied
        } else {
            SpaceStatus::Vacant
        }
    }
}

impl fmt::Display for SpaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative state of one parking space.
///
/// Row invariants (enforced by the store schema as well):
/// - `license_plate` is `None` while vacant and always present while reserved.
/// - `reservation_end_time` is present iff `status == Reserved`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkingSpace {
    pub id: i64,
    pub sensor_id: i64,
    pub status: SpaceStatus,
    pub license_plate: Option<String>,
    pub reservation_time: Option<DateTime<Utc>>,
    pub reservation_end_time: Option<DateTime<Utc>>,
    pub occupied_since: Option<DateTime<Utc>>,
    pub payment_tx_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

// ---------------------------------------------------------------------------
// OccupancyEvent
// ---------------------------------------------------------------------------

/// One decoded sensor report. Produced once by the frame parser and consumed
/// once by the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyEvent {
    pub sensor_external_id: String,
    pub collector_id: String,
    pub occupied: bool,
    pub raw_frame_hex: String,
    pub received_at: DateTime<Utc>,
}

impl OccupancyEvent {
    pub fn target_status(&self) -> SpaceStatus {
        SpaceStatus::from_occupied(self.occupied)
    }
}

// ---------------------------------------------------------------------------
// Reservation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(ReservationStatus::Active),
            "completed" => Ok(ReservationStatus::Completed),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            other => Err(anyhow!("invalid reservation status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: i64,
    pub space_id: i64,
    pub license_plate: String,
    /// Who gets notified about this reservation (bot chat / user id).
    pub recipient_id: Option<String>,
    pub start_time: DateTime<Utc>,
    /// `None` only for rows written before end times were recorded.
    pub end_time: Option<DateTime<Utc>>,
    pub status: ReservationStatus,
    pub payment_tx_hash: Option<String>,
    pub warned_at: Option<DateTime<Utc>>,
    pub created_by: String,
}

/// Input to a reservation request, as handed over by the HTTP / bot layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    pub space_id: i64,
    pub license_plate: String,
    pub recipient_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub payment_tx_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ReservationEnding,
    SpaceAvailable,
    ReservationEnded,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ReservationEnding => "reservation_ending",
            NotificationKind::SpaceAvailable => "space_available",
            NotificationKind::ReservationEnded => "reservation_ended",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "reservation_ending" => Ok(NotificationKind::ReservationEnding),
            "space_available" => Ok(NotificationKind::SpaceAvailable),
            "reservation_ended" => Ok(NotificationKind::ReservationEnded),
            other => Err(anyhow!("invalid notification kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "sent" => Ok(NotificationStatus::Sent),
            "failed" => Ok(NotificationStatus::Failed),
            other => Err(anyhow!("invalid notification status: {}", other)),
        }
    }
}

/// Queue record handed to the external dispatcher. Always inserted as `pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNotification {
    pub recipient_id: String,
    pub kind: NotificationKind,
    pub message: String,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub recipient_id: String,
    pub kind: NotificationKind,
    pub message: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: NotificationStatus,
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Identity behind a mutation. Persisted as `kind:id` in `updated_by`,
/// `created_by` and `closed_by` columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Sensor(String),
    System(String),
    User(String),
    Admin(String),
}

impl Actor {
    pub fn sensor(external_id: impl Into<String>) -> Self {
        Actor::Sensor(external_id.into())
    }

    pub fn sweeper() -> Self {
        Actor::System("sweeper".to_string())
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("actor must be `kind:id`, got {:?}", s))?;
        if id.trim().is_empty() {
            return Err(anyhow!("actor id is empty: {:?}", s));
        }
        let id = id.to_string();
        match kind {
            "sensor" => Ok(Actor::Sensor(id)),
            "system" => Ok(Actor::System(id)),
            "user" => Ok(Actor::User(id)),
            "admin" => Ok(Actor::Admin(id)),
            other => Err(anyhow!("invalid actor kind: {}", other)),
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Sensor(id) => write!(f, "sensor:{id}"),
            Actor::System(id) => write!(f, "system:{id}"),
            Actor::User(id) => write!(f, "user:{id}"),
            Actor::Admin(id) => write!(f, "admin:{id}"),
        }
    }
}
