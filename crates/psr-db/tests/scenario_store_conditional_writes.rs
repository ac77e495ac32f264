//! Scenario: every space transition is a compare-and-set on current status.
//!
//! # Invariants under test
//!
//! - A write whose expected status no longer matches affects zero rows and
//!   reports `false` / `None` without touching the row.
//! - Sensor-origin writes never modify a reserved space.
//! - Reserve, check-in and release keep the space row and its reservation
//!   row consistent (both change or neither does).
//! - The pre-expiry warning mark is claimed exactly once.
//! - Every write stamps `updated_by` with the acting identity.

use chrono::{Duration, Utc};
use psr_db::{ReservationClose, SqliteStore, Store, StoreOptions};
use psr_schemas::{
    Actor, NewNotification, NewReservation, NotificationKind, ParkingSpace, ReservationStatus,
    SensorStatus, SpaceStatus,
};

async fn fresh_store(dir: &tempfile::TempDir) -> anyhow::Result<SqliteStore> {
    let store = SqliteStore::open(dir.path().join("parking.db"), &StoreOptions::default()).await?;
    store.migrate().await?;
    Ok(store)
}

async fn provisioned(store: &SqliteStore, external_id: &str) -> anyhow::Result<ParkingSpace> {
    let admin = Actor::Admin("ops".to_string());
    let sensor = store
        .insert_sensor(external_id, Some("30E5CA81"), SensorStatus::Live, &admin)
        .await?;
    Ok(store.insert_space(sensor.id, &admin).await?)
}

fn reservation_for(space_id: i64, plate: &str) -> NewReservation {
    let start = Utc::now();
    NewReservation {
        space_id,
        license_plate: plate.to_string(),
        recipient_id: Some("chat-1".to_string()),
        start_time: start,
        end_time: start + Duration::hours(1),
        payment_tx_hash: Some("0xabc".to_string()),
    }
}

#[tokio::test]
async fn occupancy_write_requires_expected_status() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = fresh_store(&dir).await?;
    let space = provisioned(&store, "75E1CA81").await?;
    let sensor = Actor::sensor("75E1CA81");
    let now = Utc::now();

    assert!(store.set_occupancy(space.id, SpaceStatus::Vacant, true, now, &sensor).await?);

    // Stale precondition: the row is occupied now.
    assert!(!store.set_occupancy(space.id, SpaceStatus::Vacant, true, now, &sensor).await?);

    let row = store.space_by_id(space.id).await?.unwrap();
    assert_eq!(row.status, SpaceStatus::Occupied);
    assert!(row.occupied_since.is_some());
    assert_eq!(row.updated_by, "sensor:75E1CA81");

    assert!(store.set_occupancy(space.id, SpaceStatus::Occupied, false, now, &sensor).await?);
    let row = store.space_by_id(space.id).await?.unwrap();
    assert_eq!(row.status, SpaceStatus::Vacant);
    assert_eq!(row.occupied_since, None);
    assert_eq!(row.license_plate, None);
    Ok(())
}

#[tokio::test]
async fn sensor_write_never_touches_reserved_space() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = fresh_store(&dir).await?;
    let space = provisioned(&store, "75E1CA81").await?;
    let user = Actor::User("42".to_string());
    let sensor = Actor::sensor("75E1CA81");

    store
        .reserve_space(&reservation_for(space.id, "AB123CD"), Utc::now(), &user)
        .await?
        .expect("vacant space must be reservable");

    for occupied in [true, false] {
        assert!(!store
            .set_occupancy(space.id, SpaceStatus::Reserved, occupied, Utc::now(), &sensor)
            .await?);
    }

    let row = store.space_by_id(space.id).await?.unwrap();
    assert_eq!(row.status, SpaceStatus::Reserved);
    assert_eq!(row.license_plate.as_deref(), Some("AB123CD"));
    assert_eq!(row.updated_by, "user:42");
    Ok(())
}

#[tokio::test]
async fn reserve_only_from_vacant() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = fresh_store(&dir).await?;
    let space = provisioned(&store, "75E1CA81").await?;
    let user = Actor::User("42".to_string());

    let first = store
        .reserve_space(&reservation_for(space.id, "AB123CD"), Utc::now(), &user)
        .await?
        .unwrap();
    assert_eq!(first.status, ReservationStatus::Active);
    assert_eq!(first.created_by, "user:42");

    let second = store
        .reserve_space(&reservation_for(space.id, "ZZ999ZZ"), Utc::now(), &user)
        .await?;
    assert!(second.is_none());

    let row = store.space_by_id(space.id).await?.unwrap();
    assert_eq!(row.license_plate.as_deref(), Some("AB123CD"));
    assert_eq!(store.active_reservations().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn check_in_completes_reservation() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = fresh_store(&dir).await?;
    let space = provisioned(&store, "75E1CA81").await?;
    let user = Actor::User("42".to_string());

    let r = store
        .reserve_space(&reservation_for(space.id, "AB123CD"), Utc::now(), &user)
        .await?
        .unwrap();

    assert!(store.check_in(space.id, Utc::now(), &user).await?);
    assert!(!store.check_in(space.id, Utc::now(), &user).await?);

    let row = store.space_by_id(space.id).await?.unwrap();
    assert_eq!(row.status, SpaceStatus::Occupied);
    assert_eq!(row.reservation_end_time, None);

    let r = store.reservation_by_id(r.id).await?.unwrap();
    assert_eq!(r.status, ReservationStatus::Completed);
    assert!(store.active_reservation_for_space(space.id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn release_closes_reservation_atomically() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = fresh_store(&dir).await?;
    let space = provisioned(&store, "75E1CA81").await?;
    let user = Actor::User("42".to_string());
    let sweeper = Actor::sweeper();

    let r = store
        .reserve_space(&reservation_for(space.id, "AB123CD"), Utc::now(), &user)
        .await?
        .unwrap();
    let close = ReservationClose {
        reservation_id: r.id,
        status: ReservationStatus::Completed,
        reason: "expired".to_string(),
    };

    // Wrong precondition: nothing changes, reservation stays active.
    assert!(!store
        .release_space(space.id, SpaceStatus::Occupied, Some(&close), Utc::now(), &sweeper)
        .await?);
    assert_eq!(
        store.reservation_by_id(r.id).await?.unwrap().status,
        ReservationStatus::Active
    );

    assert!(store
        .release_space(space.id, SpaceStatus::Reserved, Some(&close), Utc::now(), &sweeper)
        .await?);

    let row = store.space_by_id(space.id).await?.unwrap();
    assert_eq!(row.status, SpaceStatus::Vacant);
    assert_eq!(row.license_plate, None);
    assert_eq!(row.reservation_time, None);
    assert_eq!(row.reservation_end_time, None);
    assert_eq!(row.payment_tx_hash, None);
    assert_eq!(row.updated_by, "system:sweeper");
    assert_eq!(
        store.reservation_by_id(r.id).await?.unwrap().status,
        ReservationStatus::Completed
    );

    // Closing again is a no-op.
    assert!(!store.close_reservation(&close, Utc::now(), &sweeper).await?);
    Ok(())
}

#[tokio::test]
async fn warning_mark_claimed_once() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = fresh_store(&dir).await?;
    let space = provisioned(&store, "75E1CA81").await?;

    let r = store
        .reserve_space(
            &reservation_for(space.id, "AB123CD"),
            Utc::now(),
            &Actor::User("42".to_string()),
        )
        .await?
        .unwrap();

    assert!(store.mark_reservation_warned(r.id, Utc::now()).await?);
    assert!(!store.mark_reservation_warned(r.id, Utc::now()).await?);
    assert!(store.reservation_by_id(r.id).await?.unwrap().warned_at.is_some());
    Ok(())
}

#[tokio::test]
async fn notifications_and_watchers_round_trip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = fresh_store(&dir).await?;
    let space = provisioned(&store, "75E1CA81").await?;
    let user = Actor::User("7".to_string());

    store.watch_space(space.id, "chat-7", &user).await?;
    store.watch_space(space.id, "chat-7", &user).await?;
    store.watch_space(space.id, "chat-3", &user).await?;
    assert_eq!(store.space_watchers(space.id).await?, vec!["chat-3", "chat-7"]);

    let id = store
        .enqueue_notification(&NewNotification {
            recipient_id: "chat-7".to_string(),
            kind: NotificationKind::SpaceAvailable,
            message: "space is free".to_string(),
            scheduled_at: Utc::now(),
        })
        .await?;

    let pending = store.pending_notifications().await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].kind, NotificationKind::SpaceAvailable);
    Ok(())
}
