//! Crate-wide error taxonomy.
//!
//! Mirrors the error classes the orchestrator, backfill engine, and
//! forecaster need to distinguish: transient upstream failures get
//! retried, `ValidationError`s go straight back to the caller, and so on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Network failure, HTTP 5xx, or HTTP 429 from an upstream API. Retried
    /// by the client with backoff; if retries are exhausted the caller
    /// (orchestrator/backfill) records the cycle as a failure and moves on.
    #[error("transient upstream error from {source_name}: {message}")]
    TransientUpstream {
        source_name: &'static str,
        message: String,
    },

    /// AEMET returned 401. The client refreshes its token once and retries
    /// the original call exactly once before giving up.
    #[error("AEMET auth token expired")]
    AuthExpired,

    /// The time-series store rejected a batch because a field's type
    /// disagreed with what was already stored for that measurement+field.
    /// Fatal for the batch; a defect in the writer, not a transient issue.
    #[error("field type conflict writing {measurement}.{field}: {message}")]
    FieldTypeConflict {
        measurement: String,
        field: String,
        message: String,
    },

    /// Bad caller input, e.g. `Forecast(hours)` outside `[1, 168]`.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A forecast was requested before any training run had succeeded.
    #[error("no trained model is available yet")]
    ModelUnavailable,

    /// The job was cancelled by scheduler shutdown before completing.
    #[error("operation cancelled")]
    Cancelled,

    #[error("time-series store error: {0}")]
    Store(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Whether this error class is worth retrying at the client layer.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::TransientUpstream { .. } | CoreError::Http(_))
    }
}
