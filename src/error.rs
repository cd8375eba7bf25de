use thiserror::Error;

/// Error kinds the risk core must distinguish (validation, backpressure,
/// transient vs. fatal storage failure, cancellation). No HTTP status
/// mapping lives here — wiring that response belongs to the out-of-scope
/// API layer, not the core.
#[derive(Error, Debug)]
pub enum RiskError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("shutting down")]
    ShuttingDown,

    #[error("queue full")]
    QueueFull,

    #[error("database error: {0}")]
    Database(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<sqlx::Error> for RiskError {
    fn from(err: sqlx::Error) -> Self {
        RiskError::Database(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for RiskError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        RiskError::Migration(err.to_string())
    }
}

pub type RiskResult<T> = Result<T, RiskError>;
