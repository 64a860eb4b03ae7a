//! Error types for storage operations.

/// Errors that can occur while reading or writing device records.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// No connection could be checked out of the pool.
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] r2d2::Error),

    /// A SQL statement failed.
    #[error("storage query failed: {0}")]
    Query(#[from] rusqlite::Error),
}
