use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O failure: {0}")]
    IoFailure(String),
    #[error("storage operation `{op}` timed out after {secs}s")]
    Timeout { op: &'static str, secs: u64 },
    #[error("row rejected: {0}")]
    Rejected(String),
    #[error("format mismatch: {0}")]
    FormatMismatch(String),
}

impl From<sqlx::Error> for PersistError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(db) => PersistError::Rejected(db.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
                PersistError::FormatMismatch(e.to_string())
            }
            other => PersistError::IoFailure(other.to_string()),
        }
    }
}

pub type PersistResult<T> = Result<T, PersistError>;
