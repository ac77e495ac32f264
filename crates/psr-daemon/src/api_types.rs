//! Request and response types for psr-daemon HTTP endpoints.
//!
//! `Serialize + Deserialize` so Axum can encode them and tests can decode
//! them. No business logic lives here.

use chrono::{DateTime, Utc};
use psr_db::StoreDiagnostics;
use serde::{Deserialize, Serialize};

use crate::state::ListenerStats;

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
}

// ---------------------------------------------------------------------------
// /v1/status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub daemon_uptime_secs: u64,
    pub listener: ListenerStats,
    pub store: StoreDiagnostics,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable kind: "conflict" | "space_not_found" | "invalid_request" |
    /// "store_busy" | ...
    pub error: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// /v1/reservations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationRequest {
    /// `kind:id`, e.g. `user:42`.
    pub actor: String,
    pub space_id: i64,
    pub license_plate: String,
    pub recipient_id: Option<String>,
    /// Defaults to now.
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: DateTime<Utc>,
    pub payment_tx_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// /v1/spaces/:id/...
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInRequest {
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VacateRequest {
    pub actor: String,
    /// "expired" | "cancelled" | "check_out" | "manual"
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VacateResponse {
    pub space_id: i64,
    /// "vacated" | "reservation_closed" | "unchanged"
    pub outcome: String,
    /// Space status after the call.
    pub status: String,
    pub reservation_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchRequest {
    pub actor: String,
    pub recipient_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchResponse {
    pub space_id: i64,
    pub recipient_id: String,
}
