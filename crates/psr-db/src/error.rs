use thiserror::Error;

/// SQLite primary result codes that mean "someone else holds the lock".
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Lock / busy signal from the store. Retryable.
    #[error("store contention: {0}")]
    Contention(String),

    /// Contention outlasted the retry budget.
    #[error("store busy: {op} gave up after {attempts} attempts")]
    Busy { op: &'static str, attempts: u32 },

    #[error("store query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A stored row violates the model (bad enum text, etc.).
    #[error("invalid stored row: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::Contention(_))
    }

    pub(crate) fn decode(e: impl std::fmt::Display) -> Self {
        StoreError::Decode(e.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if is_contention(&e) {
            StoreError::Contention(e.to_string())
        } else {
            StoreError::Query(e)
        }
    }
}

/// BUSY/LOCKED (including extended variants such as BUSY_SNAPSHOT) and pool
/// acquire timeouts all mean the write can be retried as-is.
fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => {
            let primary = db_err
                .code()
                .and_then(|c| c.parse::<i64>().ok())
                .map(|c| c & 0xff);
            matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED))
                || db_err.message().contains("database is locked")
                || db_err.message().contains("database table is locked")
        }
        _ => false,
    }
}
