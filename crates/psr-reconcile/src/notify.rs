//! Notification Emitter.
//!
//! Turns reconciliation outcomes into `pending` rows on the notification
//! queue. Delivery belongs to the external dispatcher.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use psr_db::{RetryWriter, Store, StoreResult};
use psr_schemas::{NewNotification, NotificationKind, Reservation};
use tracing::debug;

#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn Store>,
    retry: RetryWriter,
}

impl Notifier {
    pub fn new(store: Arc<dyn Store>, retry: RetryWriter) -> Self {
        Self { store, retry }
    }

    /// Pre-expiry warning. Returns `false` when the reservation has nobody to
    /// notify.
    pub async fn reservation_ending(
        &self,
        r: &Reservation,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let message = format!(
            "Your reservation for space {} (plate {}) ends at {} UTC.",
            r.space_id,
            r.license_plate,
            end.format("%H:%M")
        );
        self.to_holder(r, NotificationKind::ReservationEnding, message, now)
            .await
    }

    pub async fn reservation_ended(&self, r: &Reservation, now: DateTime<Utc>) -> StoreResult<bool> {
        let message = format!(
            "Your reservation for space {} (plate {}) has ended.",
            r.space_id, r.license_plate
        );
        self.to_holder(r, NotificationKind::ReservationEnded, message, now)
            .await
    }

    /// Fan out to every watcher registered on the space. Returns the number
    /// of queued rows.
    pub async fn space_available(&self, space_id: i64, now: DateTime<Utc>) -> StoreResult<usize> {
        let watchers = self.store.space_watchers(space_id).await?;
        for recipient in &watchers {
            self.emit(NewNotification {
                recipient_id: recipient.clone(),
                kind: NotificationKind::SpaceAvailable,
                message: format!("Space {space_id} is now available."),
                scheduled_at: now,
            })
            .await?;
        }
        Ok(watchers.len())
    }

    async fn to_holder(
        &self,
        r: &Reservation,
        kind: NotificationKind,
        message: String,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let Some(recipient) = r.recipient_id.clone() else {
            debug!(reservation_id = r.id, kind = kind.as_str(), "no recipient; notification skipped");
            return Ok(false);
        };
        self.emit(NewNotification {
            recipient_id: recipient,
            kind,
            message,
            scheduled_at: now,
        })
        .await?;
        Ok(true)
    }

    async fn emit(&self, n: NewNotification) -> StoreResult<i64> {
        let id = self
            .retry
            .run("enqueue_notification", || self.store.enqueue_notification(&n))
            .await?;
        debug!(
            notification_id = id,
            recipient = %n.recipient_id,
            kind = n.kind.as_str(),
            "notification queued"
        );
        Ok(id)
    }
}
