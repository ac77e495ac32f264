//! SQLite-backed [`Store`].
//!
//! WAL journal, foreign keys on, short busy timeout so lock waits surface as
//! [`StoreError::Contention`] and are handled by the retry writer instead of
//! blocking a connection worker for seconds.
//!
//! Note: `sqlite::memory:` gives each pooled connection its own database; use
//! a file path (tests use a temp dir).

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use psr_schemas::{
    Actor, NewNotification, NewReservation, Notification, NotificationKind, NotificationStatus,
    ParkingSpace, Reservation, ReservationStatus, Sensor, SensorStatus, SpaceStatus,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;

use crate::store::{ReservationClose, Store, StoreDiagnostics, StoreResult};
use crate::StoreError;

const SELECT_SENSOR: &str = "select id, external_id, collector_id, status from sensors";

const SELECT_SPACE: &str = r#"
    select id, sensor_id, status, license_plate, reservation_time, reservation_end_time,
           occupied_since, payment_tx_hash, updated_at, updated_by
    from parking_spaces
"#;

const SELECT_RESERVATION: &str = r#"
    select id, space_id, license_plate, recipient_id, start_time, end_time, status,
           payment_tx_hash, warned_at, created_by
    from reservations
"#;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect using a `sqlite://` URL; the file is created if missing.
    pub async fn connect(url: &str, opts: &StoreOptions) -> StoreResult<Self> {
        let connect = SqliteConnectOptions::from_str(url)?;
        Self::connect_with(connect, opts).await
    }

    pub async fn open(path: impl AsRef<Path>, opts: &StoreOptions) -> StoreResult<Self> {
        let connect = SqliteConnectOptions::new().filename(path.as_ref());
        Self::connect_with(connect, opts).await
    }

    async fn connect_with(connect: SqliteConnectOptions, opts: &StoreOptions) -> StoreResult<Self> {
        let connect = connect
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(opts.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(opts.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(connect)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply embedded migrations. Idempotent; run once at startup.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Provisioning (admin surface)
    // -----------------------------------------------------------------------

    pub async fn insert_sensor(
        &self,
        external_id: &str,
        collector_id: Option<&str>,
        status: SensorStatus,
        actor: &Actor,
    ) -> StoreResult<Sensor> {
        let res = sqlx::query(
            r#"
            insert into sensors (external_id, collector_id, status, updated_at, updated_by)
            values (?, ?, ?, ?, ?)
            "#,
        )
        .bind(external_id.to_ascii_uppercase())
        .bind(collector_id.map(str::to_ascii_uppercase))
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(actor.to_string())
        .execute(&self.pool)
        .await?;

        Ok(Sensor {
            id: res.last_insert_rowid(),
            external_id: external_id.to_ascii_uppercase(),
            collector_id: collector_id.map(str::to_ascii_uppercase),
            status,
        })
    }

    pub async fn set_sensor_status(
        &self,
        sensor_id: i64,
        status: SensorStatus,
        actor: &Actor,
    ) -> StoreResult<bool> {
        let res = sqlx::query(
            "update sensors set status = ?, updated_at = ?, updated_by = ? where id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(actor.to_string())
        .bind(sensor_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Create the (vacant) space paired with a sensor.
    pub async fn insert_space(&self, sensor_id: i64, actor: &Actor) -> StoreResult<ParkingSpace> {
        let res = sqlx::query(
            r#"
            insert into parking_spaces (sensor_id, status, updated_at, updated_by)
            values (?, 'vacant', ?, ?)
            "#,
        )
        .bind(sensor_id)
        .bind(Utc::now())
        .bind(actor.to_string())
        .execute(&self.pool)
        .await?;

        let id = res.last_insert_rowid();
        self.space_by_id(id)
            .await?
            .ok_or_else(|| StoreError::decode(format!("space {id} vanished after insert")))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn sensor_by_external_id(&self, external_id: &str) -> StoreResult<Option<Sensor>> {
        let row = sqlx::query(&format!("{SELECT_SENSOR} where external_id = ?"))
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(sensor_from_row).transpose()
    }

    async fn space_by_sensor_id(&self, sensor_id: i64) -> StoreResult<Option<ParkingSpace>> {
        let row = sqlx::query(&format!("{SELECT_SPACE} where sensor_id = ?"))
            .bind(sensor_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(space_from_row).transpose()
    }

    async fn space_by_id(&self, space_id: i64) -> StoreResult<Option<ParkingSpace>> {
        let row = sqlx::query(&format!("{SELECT_SPACE} where id = ?"))
            .bind(space_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(space_from_row).transpose()
    }

    async fn set_occupancy(
        &self,
        space_id: i64,
        expected: SpaceStatus,
        occupied: bool,
        at: DateTime<Utc>,
        actor: &Actor,
    ) -> StoreResult<bool> {
        if expected == SpaceStatus::Reserved {
            return Ok(false);
        }

        let sql = if occupied {
            r#"
            update parking_spaces
            set status = 'occupied',
                occupied_since = ?,
                updated_at = ?,
                updated_by = ?
            where id = ? and status = ? and status <> 'reserved'
            "#
        } else {
            r#"
            update parking_spaces
            set status = 'vacant',
                occupied_since = null,
                license_plate = null,
                reservation_time = null,
                reservation_end_time = null,
                payment_tx_hash = null,
                updated_at = ?,
                updated_by = ?
            where id = ? and status = ? and status <> 'reserved'
            "#
        };

        let mut q = sqlx::query(sql);
        if occupied {
            q = q.bind(at);
        }
        let res = q
            .bind(at)
            .bind(actor.to_string())
            .bind(space_id)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn reserve_space(
        &self,
        req: &NewReservation,
        at: DateTime<Utc>,
        actor: &Actor,
    ) -> StoreResult<Option<Reservation>> {
        let actor_s = actor.to_string();
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query(
            r#"
            update parking_spaces
            set status = 'reserved',
                license_plate = ?,
                reservation_time = ?,
                reservation_end_time = ?,
                payment_tx_hash = ?,
                occupied_since = null,
                updated_at = ?,
                updated_by = ?
            where id = ? and status = 'vacant'
            "#,
        )
        .bind(&req.license_plate)
        .bind(req.start_time)
        .bind(req.end_time)
        .bind(&req.payment_tx_hash)
        .bind(at)
        .bind(&actor_s)
        .bind(req.space_id)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        // The space was vacant, so anything still active for it is stale.
        sqlx::query(
            r#"
            update reservations
            set status = 'completed', closed_at = ?, closed_by = ?, close_reason = 'superseded'
            where space_id = ? and status = 'active'
            "#,
        )
        .bind(at)
        .bind(&actor_s)
        .bind(req.space_id)
        .execute(&mut *tx)
        .await?;

        let ins = sqlx::query(
            r#"
            insert into reservations (
              space_id, license_plate, recipient_id, start_time, end_time, status,
              payment_tx_hash, created_at, created_by
            ) values (?, ?, ?, ?, ?, 'active', ?, ?, ?)
            "#,
        )
        .bind(req.space_id)
        .bind(&req.license_plate)
        .bind(&req.recipient_id)
        .bind(req.start_time)
        .bind(req.end_time)
        .bind(&req.payment_tx_hash)
        .bind(at)
        .bind(&actor_s)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(Reservation {
            id: ins.last_insert_rowid(),
            space_id: req.space_id,
            license_plate: req.license_plate.clone(),
            recipient_id: req.recipient_id.clone(),
            start_time: req.start_time,
            end_time: Some(req.end_time),
            status: ReservationStatus::Active,
            payment_tx_hash: req.payment_tx_hash.clone(),
            warned_at: None,
            created_by: actor_s,
        }))
    }

    async fn check_in(&self, space_id: i64, at: DateTime<Utc>, actor: &Actor) -> StoreResult<bool> {
        let actor_s = actor.to_string();
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query(
            r#"
            update parking_spaces
            set status = 'occupied',
                occupied_since = ?,
                reservation_end_time = null,
                updated_at = ?,
                updated_by = ?
            where id = ? and status = 'reserved'
            "#,
        )
        .bind(at)
        .bind(at)
        .bind(&actor_s)
        .bind(space_id)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            update reservations
            set status = 'completed', closed_at = ?, closed_by = ?, close_reason = 'checked_in'
            where space_id = ? and status = 'active'
            "#,
        )
        .bind(at)
        .bind(&actor_s)
        .bind(space_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn release_space(
        &self,
        space_id: i64,
        expected: SpaceStatus,
        close: Option<&ReservationClose>,
        at: DateTime<Utc>,
        actor: &Actor,
    ) -> StoreResult<bool> {
        let actor_s = actor.to_string();
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query(
            r#"
            update parking_spaces
            set status = 'vacant',
                license_plate = null,
                reservation_time = null,
                reservation_end_time = null,
                occupied_since = null,
                payment_tx_hash = null,
                updated_at = ?,
                updated_by = ?
            where id = ? and status = ?
            "#,
        )
        .bind(at)
        .bind(&actor_s)
        .bind(space_id)
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(c) = close {
            close_reservation_in(&mut tx, c, at, &actor_s).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn close_reservation(
        &self,
        close: &ReservationClose,
        at: DateTime<Utc>,
        actor: &Actor,
    ) -> StoreResult<bool> {
        let mut conn = self.pool.acquire().await?;
        close_reservation_in(&mut conn, close, at, &actor.to_string()).await
    }

    async fn reservation_by_id(&self, reservation_id: i64) -> StoreResult<Option<Reservation>> {
        let row = sqlx::query(&format!("{SELECT_RESERVATION} where id = ?"))
            .bind(reservation_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(reservation_from_row).transpose()
    }

    async fn active_reservations(&self) -> StoreResult<Vec<Reservation>> {
        let rows = sqlx::query(&format!(
            "{SELECT_RESERVATION} where status = 'active' order by id asc"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(reservation_from_row).collect()
    }

    async fn active_reservation_for_space(&self, space_id: i64) -> StoreResult<Option<Reservation>> {
        let row = sqlx::query(&format!(
            "{SELECT_RESERVATION} where space_id = ? and status = 'active'"
        ))
        .bind(space_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(reservation_from_row).transpose()
    }

    async fn mark_reservation_warned(
        &self,
        reservation_id: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let res = sqlx::query(
            r#"
            update reservations
            set warned_at = ?
            where id = ? and status = 'active' and warned_at is null
            "#,
        )
        .bind(at)
        .bind(reservation_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn enqueue_notification(&self, n: &NewNotification) -> StoreResult<i64> {
        let res = sqlx::query(
            r#"
            insert into notifications (recipient_id, kind, message, scheduled_at, status, created_at)
            values (?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(&n.recipient_id)
        .bind(n.kind.as_str())
        .bind(&n.message)
        .bind(n.scheduled_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    async fn pending_notifications(&self) -> StoreResult<Vec<Notification>> {
        let rows = sqlx::query(
            r#"
            select id, recipient_id, kind, message, scheduled_at, status
            from notifications
            where status = 'pending'
            order by id asc
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(Notification {
                    id: r.try_get("id")?,
                    recipient_id: r.try_get("recipient_id")?,
                    kind: NotificationKind::parse(&r.try_get::<String, _>("kind")?)
                        .map_err(StoreError::decode)?,
                    message: r.try_get("message")?,
                    scheduled_at: r.try_get("scheduled_at")?,
                    status: NotificationStatus::parse(&r.try_get::<String, _>("status")?)
                        .map_err(StoreError::decode)?,
                })
            })
            .collect()
    }

    async fn watch_space(&self, space_id: i64, recipient_id: &str, actor: &Actor) -> StoreResult<()> {
        sqlx::query(
            r#"
            insert into space_watchers (space_id, recipient_id, created_at, created_by)
            values (?, ?, ?, ?)
            on conflict (space_id, recipient_id) do nothing
            "#,
        )
        .bind(space_id)
        .bind(recipient_id)
        .bind(Utc::now())
        .bind(actor.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn space_watchers(&self, space_id: i64) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "select recipient_id from space_watchers where space_id = ? order by recipient_id",
        )
        .bind(space_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(r,)| r).collect())
    }

    async fn diagnostics(&self) -> StoreResult<StoreDiagnostics> {
        let (schema_version,): (i64,) = sqlx::query_as(
            "select coalesce(max(version), 0) from _sqlx_migrations where success = 1",
        )
        .fetch_one(&self.pool)
        .await?;

        let (sensors_live,): (i64,) =
            sqlx::query_as("select count(*) from sensors where status = 'live'")
                .fetch_one(&self.pool)
                .await?;

        let mut d = StoreDiagnostics {
            schema_version,
            sensors_live,
            ..StoreDiagnostics::default()
        };

        let by_status: Vec<(String, i64)> =
            sqlx::query_as("select status, count(*) from parking_spaces group by status")
                .fetch_all(&self.pool)
                .await?;
        for (status, n) in by_status {
            match SpaceStatus::parse(&status).map_err(StoreError::decode)? {
                SpaceStatus::Vacant => d.spaces_vacant = n,
                SpaceStatus::Occupied => d.spaces_occupied = n,
                SpaceStatus::Reserved => d.spaces_reserved = n,
            }
        }

        let (active,): (i64,) =
            sqlx::query_as("select count(*) from reservations where status = 'active'")
                .fetch_one(&self.pool)
                .await?;
        d.reservations_active = active;

        let (pending,): (i64,) =
            sqlx::query_as("select count(*) from notifications where status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        d.notifications_pending = pending;

        Ok(d)
    }
}

async fn close_reservation_in(
    conn: &mut sqlx::SqliteConnection,
    close: &ReservationClose,
    at: DateTime<Utc>,
    actor: &str,
) -> StoreResult<bool> {
    let res = sqlx::query(
        r#"
        update reservations
        set status = ?, closed_at = ?, closed_by = ?, close_reason = ?
        where id = ? and status = 'active'
        "#,
    )
    .bind(close.status.as_str())
    .bind(at)
    .bind(actor)
    .bind(&close.reason)
    .bind(close.reservation_id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

fn sensor_from_row(r: &SqliteRow) -> StoreResult<Sensor> {
    Ok(Sensor {
        id: r.try_get("id")?,
        external_id: r.try_get("external_id")?,
        collector_id: r.try_get("collector_id")?,
        status: SensorStatus::parse(&r.try_get::<String, _>("status")?)
            .map_err(StoreError::decode)?,
    })
}

fn space_from_row(r: &SqliteRow) -> StoreResult<ParkingSpace> {
    Ok(ParkingSpace {
        id: r.try_get("id")?,
        sensor_id: r.try_get("sensor_id")?,
        status: SpaceStatus::parse(&r.try_get::<String, _>("status")?)
            .map_err(StoreError::decode)?,
        license_plate: r.try_get("license_plate")?,
        reservation_time: r.try_get("reservation_time")?,
        reservation_end_time: r.try_get("reservation_end_time")?,
        occupied_since: r.try_get("occupied_since")?,
        payment_tx_hash: r.try_get("payment_tx_hash")?,
        updated_at: r.try_get("updated_at")?,
        updated_by: r.try_get("updated_by")?,
    })
}

fn reservation_from_row(r: &SqliteRow) -> StoreResult<Reservation> {
    Ok(Reservation {
        id: r.try_get("id")?,
        space_id: r.try_get("space_id")?,
        license_plate: r.try_get("license_plate")?,
        recipient_id: r.try_get("recipient_id")?,
        start_time: r.try_get("start_time")?,
        end_time: r.try_get("end_time")?,
        status: ReservationStatus::parse(&r.try_get::<String, _>("status")?)
            .map_err(StoreError::decode)?,
        payment_tx_hash: r.try_get("payment_tx_hash")?,
        warned_at: r.try_get("warned_at")?,
        created_by: r.try_get("created_by")?,
    })
}
