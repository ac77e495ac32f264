//! Store contract used by reconciliation.
//!
//! Every mutating call is a single conditional statement or a single
//! transaction whose first write is conditional on the row's current status.
//! A `false` / `None` return means the precondition no longer held when the
//! write executed (zero rows affected); callers treat that as a conflict.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use psr_schemas::{
    Actor, NewNotification, NewReservation, Notification, ParkingSpace, Reservation,
    ReservationStatus, Sensor, SpaceStatus,
};
use serde::{Deserialize, Serialize};

use crate::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Reservation closure applied atomically with a space release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationClose {
    pub reservation_id: i64,
    pub status: ReservationStatus,
    pub reason: String,
}

/// Narrow diagnostic read model for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDiagnostics {
    pub schema_version: i64,
    pub sensors_live: i64,
    pub spaces_vacant: i64,
    pub spaces_occupied: i64,
    pub spaces_reserved: i64,
    pub reservations_active: i64,
    pub notifications_pending: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Case-insensitive lookup by wire id.
    async fn sensor_by_external_id(&self, external_id: &str) -> StoreResult<Option<Sensor>>;

    async fn space_by_sensor_id(&self, sensor_id: i64) -> StoreResult<Option<ParkingSpace>>;

    async fn space_by_id(&self, space_id: i64) -> StoreResult<Option<ParkingSpace>>;

    /// Sensor-origin `vacant <-> occupied` write, applied only while the row
    /// is still in `expected`. Never touches a reserved row.
    async fn set_occupancy(
        &self,
        space_id: i64,
        expected: SpaceStatus,
        occupied: bool,
        at: DateTime<Utc>,
        actor: &Actor,
    ) -> StoreResult<bool>;

    /// `vacant -> reserved` plus an active reservation row, in one
    /// transaction. `None` when the space was not vacant.
    async fn reserve_space(
        &self,
        req: &NewReservation,
        at: DateTime<Utc>,
        actor: &Actor,
    ) -> StoreResult<Option<Reservation>>;

    /// `reserved -> occupied`, completing the active reservation.
    async fn check_in(&self, space_id: i64, at: DateTime<Utc>, actor: &Actor) -> StoreResult<bool>;

    /// `expected -> vacant`, clearing every reservation field, optionally
    /// closing a reservation in the same transaction.
    async fn release_space(
        &self,
        space_id: i64,
        expected: SpaceStatus,
        close: Option<&ReservationClose>,
        at: DateTime<Utc>,
        actor: &Actor,
    ) -> StoreResult<bool>;

    /// Close an `active` reservation. `false` if it was already closed.
    async fn close_reservation(
        &self,
        close: &ReservationClose,
        at: DateTime<Utc>,
        actor: &Actor,
    ) -> StoreResult<bool>;

    async fn reservation_by_id(&self, reservation_id: i64) -> StoreResult<Option<Reservation>>;

    async fn active_reservations(&self) -> StoreResult<Vec<Reservation>>;

    async fn active_reservation_for_space(&self, space_id: i64) -> StoreResult<Option<Reservation>>;

    /// Record that the pre-expiry warning went out. `true` only for the
    /// first caller.
    async fn mark_reservation_warned(
        &self,
        reservation_id: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn enqueue_notification(&self, n: &NewNotification) -> StoreResult<i64>;

    async fn pending_notifications(&self) -> StoreResult<Vec<Notification>>;

    async fn watch_space(&self, space_id: i64, recipient_id: &str, actor: &Actor) -> StoreResult<()>;

    async fn space_watchers(&self, space_id: i64) -> StoreResult<Vec<String>>;

    async fn diagnostics(&self) -> StoreResult<StoreDiagnostics>;
}
