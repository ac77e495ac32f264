//! psr-reconcile
//!
//! Reconciliation engine, notification emitter and expiry sweeper. Everything
//! that changes a parking space goes through [`ReconcileEngine`].

mod engine;
mod error;
mod notify;
mod sweeper;

pub use engine::{ReconcileEngine, SensorOutcome, VacateOutcome, VacateReason};
pub use error::{ReconcileError, Result};
pub use notify::Notifier;
pub use sweeper::{resolve_end_time, spawn_expiry_sweeper, ExpirySweeper, SweepPolicy, SweepReport};
