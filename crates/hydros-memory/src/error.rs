use hydros_types::HydroError;
use thiserror::Error;

/// Errors raised by the SQLite-backed stores.
///
/// Callers above this crate only ever see [`HydroError`]; every variant maps
/// to [`HydroError::StorageUnavailable`].
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Blocking task failed: {0}")]
    Background(String),
    #[error("Database busy: {0}")]
    Timeout(String),
    #[error("Database work cancelled before it started")]
    Abandoned,
}

impl From<StoreError> for HydroError {
    fn from(err: StoreError) -> Self {
        HydroError::StorageUnavailable(err.to_string())
    }
}

/// Map a decode failure in column `idx` to a rusqlite error.
pub(crate) fn column_error(idx: usize, err: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, err.to_string(), rusqlite::types::Type::Text)
}
