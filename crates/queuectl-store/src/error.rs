use thiserror::Error;

/// Failure to read or write durable queue state.
///
/// Always fatal to the operation that raised it. An empty claim is not an
/// error and never shows up here.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Another thread panicked while holding the connection.
    #[error("Database connection lock poisoned")]
    LockPoisoned,

    /// `create_job` was given an id that is already taken.
    #[error("Job already exists: {id}")]
    DuplicateJob { id: String },

    /// A stored row holds a value this version does not understand.
    #[error("Invalid stored value: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
