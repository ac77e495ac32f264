//! Axum router and HTTP handlers for psr-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. This is the thin surface the external HTTP/bot layer
//! uses to reach the reconciliation core; admin CRUD lives elsewhere.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use psr_audit::AuditQuery;
use psr_reconcile::{ReconcileError, VacateOutcome, VacateReason};
use psr_schemas::{Actor, NewReservation, SpaceStatus};
use tracing::{error, info};

use crate::{
    api_types::{
        CheckInRequest, ErrorResponse, HealthResponse, ReservationRequest, StatusResponse,
        VacateRequest, VacateResponse, WatchRequest, WatchResponse,
    },
    state::{uptime_secs, AppState},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the application router wired to the given shared state.
///
/// Middleware layers are **not** applied here so tests can use the bare
/// router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/audit", get(audit_query))
        .route("/v1/reservations", post(create_reservation))
        .route("/v1/spaces/:id/check-in", post(check_in))
        .route("/v1/spaces/:id/vacate", post(vacate))
        .route("/v1/spaces/:id/watchers", post(add_watcher))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub(crate) struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, error: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.to_string(),
                message: message.into(),
            },
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }
}

impl From<ReconcileError> for ApiError {
    fn from(e: ReconcileError) -> Self {
        let status = match &e {
            ReconcileError::Conflict { .. } => StatusCode::CONFLICT,
            ReconcileError::SpaceNotFound(_) => StatusCode::NOT_FOUND,
            ReconcileError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ReconcileError::Busy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ReconcileError::Store(_) | ReconcileError::Audit(_) => {
                error!(error = %e, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.kind(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn parse_actor(raw: &str) -> Result<Actor, ApiError> {
    Actor::parse(raw).map_err(|e| ApiError::bad_request(e.to_string()))
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(
    State(st): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let store = st
        .engine
        .store()
        .diagnostics()
        .await
        .map_err(ReconcileError::from)?;

    Ok(Json(StatusResponse {
        daemon_uptime_secs: uptime_secs(),
        listener: st.counters.snapshot(),
        store,
    }))
}

// ---------------------------------------------------------------------------
// GET /v1/audit
// ---------------------------------------------------------------------------

pub(crate) async fn audit_query(
    State(st): State<Arc<AppState>>,
    Query(q): Query<AuditQuery>,
) -> Response {
    let audit = st.engine.audit_log().clone();
    let res = tokio::task::spawn_blocking(move || audit.query(&q)).await;

    match res {
        Ok(Ok(page)) => (StatusCode::OK, Json(page)).into_response(),
        Ok(Err(e)) => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "audit_error",
            format!("{e:#}"),
        )
        .into_response(),
        Err(e) => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "audit_error",
            e.to_string(),
        )
        .into_response(),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/reservations
// ---------------------------------------------------------------------------

pub(crate) async fn create_reservation(
    State(st): State<Arc<AppState>>,
    Json(body): Json<ReservationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = parse_actor(&body.actor)?;
    let req = NewReservation {
        space_id: body.space_id,
        license_plate: body.license_plate,
        recipient_id: body.recipient_id,
        start_time: body.start_time.unwrap_or_else(Utc::now),
        end_time: body.end_time,
        payment_tx_hash: body.payment_tx_hash,
    };

    let r = st.engine.apply_reservation(req, &actor).await?;
    info!(reservation_id = r.id, space_id = r.space_id, "reservations/create");
    Ok((StatusCode::CREATED, Json(r)))
}

// ---------------------------------------------------------------------------
// POST /v1/spaces/:id/check-in
// ---------------------------------------------------------------------------

pub(crate) async fn check_in(
    State(st): State<Arc<AppState>>,
    Path(space_id): Path<i64>,
    Json(body): Json<CheckInRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = parse_actor(&body.actor)?;
    let space = st.engine.apply_check_in(space_id, &actor).await?;
    Ok((StatusCode::OK, Json(space)))
}

// ---------------------------------------------------------------------------
// POST /v1/spaces/:id/vacate
// ---------------------------------------------------------------------------

pub(crate) async fn vacate(
    State(st): State<Arc<AppState>>,
    Path(space_id): Path<i64>,
    Json(body): Json<VacateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = parse_actor(&body.actor)?;
    let reason = VacateReason::parse(&body.reason)?;

    let outcome = st
        .engine
        .apply_expiry_or_vacate(space_id, reason, &actor)
        .await?;

    let resp = match outcome {
        VacateOutcome::Vacated { reservation_id, .. } => VacateResponse {
            space_id,
            outcome: "vacated".to_string(),
            status: SpaceStatus::Vacant.as_str().to_string(),
            reservation_id,
        },
        VacateOutcome::ReservationClosed { reservation_id } => VacateResponse {
            space_id,
            outcome: "reservation_closed".to_string(),
            status: current_status(&st, space_id).await?,
            reservation_id: Some(reservation_id),
        },
        VacateOutcome::Unchanged { status } => VacateResponse {
            space_id,
            outcome: "unchanged".to_string(),
            status: status.as_str().to_string(),
            reservation_id: None,
        },
    };
    Ok((StatusCode::OK, Json(resp)))
}

async fn current_status(st: &AppState, space_id: i64) -> Result<String, ApiError> {
    let space = st
        .engine
        .store()
        .space_by_id(space_id)
        .await
        .map_err(ReconcileError::from)?
        .ok_or(ReconcileError::SpaceNotFound(space_id))?;
    Ok(space.status.as_str().to_string())
}

// ---------------------------------------------------------------------------
// POST /v1/spaces/:id/watchers
// ---------------------------------------------------------------------------

pub(crate) async fn add_watcher(
    State(st): State<Arc<AppState>>,
    Path(space_id): Path<i64>,
    Json(body): Json<WatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = parse_actor(&body.actor)?;
    st.engine
        .watch_space(space_id, &body.recipient_id, &actor)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(WatchResponse {
            space_id,
            recipient_id: body.recipient_id.trim().to_string(),
        }),
    ))
}
