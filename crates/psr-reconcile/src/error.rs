use psr_db::StoreError;
use psr_schemas::SpaceStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The space was not in a state that allows the transition. Carries the
    /// status observed after the failed conditional write.
    #[error("conflict: space {space_id} is {status}")]
    Conflict { space_id: i64, status: SpaceStatus },

    #[error("space {0} not found")]
    SpaceNotFound(i64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Store contention outlasted the retry budget. Transient.
    #[error("store busy: {op} gave up after {attempts} attempts")]
    Busy { op: &'static str, attempts: u32 },

    #[error(transparent)]
    Store(StoreError),

    #[error("audit write failed: {0}")]
    Audit(#[from] anyhow::Error),
}

impl ReconcileError {
    /// Short machine-readable kind, used in audit messages and HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::Conflict { .. } => "conflict",
            ReconcileError::SpaceNotFound(_) => "space_not_found",
            ReconcileError::InvalidRequest(_) => "invalid_request",
            ReconcileError::Busy { .. } => "store_busy",
            ReconcileError::Store(_) => "store_error",
            ReconcileError::Audit(_) => "audit_error",
        }
    }
}

impl From<StoreError> for ReconcileError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Busy { op, attempts } => ReconcileError::Busy { op, attempts },
            other => ReconcileError::Store(other),
        }
    }
}
