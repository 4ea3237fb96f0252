use actix_web::ResponseError;
use actix_web::http::StatusCode;
use thiserror::Error;

/// Configuration problems detected while building the middleware, before any
/// write can happen.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The store schema declares a different number of custom columns than the
    /// number of extraction functions registered on the middleware.
    #[error(
        "{names} custom column name(s) configured but {extractors} extraction function(s) registered"
    )]
    ColumnCountMismatch { names: usize, extractors: usize },

    /// A table, id, or custom column name is not a plain SQL identifier.
    #[error("`{0}` is not a valid column identifier")]
    InvalidIdentifier(String),

    /// An exemption regex failed to compile.
    #[error("invalid exemption pattern `{pattern}`")]
    BadPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A write rejected or failed by the persistence layer. Surfaced to the
/// caller, never retried.
#[derive(Debug, Error)]
#[error("access log write failed: {0}")]
pub struct StoreError(Box<dyn std::error::Error + Send + Sync>);

impl StoreError {
    pub fn new(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        StoreError(err.into())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError(Box::new(err))
    }
}

impl ResponseError for StoreError {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}
