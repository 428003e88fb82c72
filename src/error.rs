use thiserror::Error;

/// Errors surfaced by the repository contract (§4.2). Uniqueness violations are kept
/// distinguishable from other backend failures so callers like the topology synchronizer
/// can special-case a lost upsert race without downcasting a driver error.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("row not found")]
    NotFound,
    #[error("unique constraint violated")]
    UniqueViolation,
    #[error("repository backend error: {0}")]
    Backend(#[from] sqlx::Error),
}

impl RepositoryError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, RepositoryError::UniqueViolation)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound)
    }
}

/// Converts a raw sqlx error into the repository's narrower taxonomy. MySQL reports
/// integrity constraint violations (including duplicate-key inserts) under SQLSTATE 23000.
pub fn classify_sqlx_error(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23000") => {
            RepositoryError::UniqueViolation
        }
        _ => RepositoryError::Backend(err),
    }
}

/// Top-level error for the pieces of the runtime that sit above the repository contract.
/// Nothing below the supervisor should need to construct one of these directly outside of
/// `main`'s startup sequence and tests.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("gateway error: {0}")]
    Gateway(#[from] serenity::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
