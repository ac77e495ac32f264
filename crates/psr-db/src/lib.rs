//! psr-db
//!
//! Authoritative parking state: sensors, spaces, reservations, the
//! notification queue and space watchers, behind the [`Store`] trait.
//! [`SqliteStore`] is the production implementation; [`RetryWriter`] wraps
//! writes that may hit lock contention.

mod error;
mod retry;
mod sqlite;
mod store;

pub use error::StoreError;
pub use retry::{RetryPolicy, RetryWriter};
pub use sqlite::{SqliteStore, StoreOptions};
pub use store::{ReservationClose, Store, StoreDiagnostics, StoreResult};
