use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error(transparent)]
    Store(#[from] queuectl_store::StoreError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
