//! Domain error taxonomy
//!
//! All domain failures are values of [`DomainError`]; the API layer is the
//! single place they become HTTP status codes. Repositories bubble
//! `sqlx::Error` up through the `Database` variant; services translate
//! constraint violations into the domain kinds callers can act on.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Debug, Error)]
pub enum DomainError {
    /// Entity does not exist, or the caller may not see it.
    #[error("not found")]
    NotFound,

    /// Authenticated but not permitted for this operation.
    #[error("not permitted")]
    Forbidden,

    /// Input shape or constraint violation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Optimistic-concurrency loss or uniqueness conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A concurrent import advanced the ref; the job may be re-queued.
    #[error("ref moved under import")]
    RefMovedUnderImport,

    /// Domain rule violation (deleting main, revoking the only admin, ...).
    #[error("{0}")]
    BusinessRule(String),

    /// Upload size cap or similar resource quota exceeded.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The uploaded file could not be parsed.
    #[error("invalid file format: {0}")]
    InvalidFileFormat(String),

    /// Recoverable infrastructure error; callers may retry.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("database error")]
    Database(#[from] sqlx::Error),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl DomainError {
    /// Stable machine-readable kind carried in error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::Forbidden => "Forbidden",
            Self::Validation(_) => "Validation",
            Self::Conflict(_) => "Conflict",
            Self::RefMovedUnderImport => "RefMovedUnderImport",
            Self::BusinessRule(_) => "BusinessRule",
            Self::QuotaExceeded(_) => "QuotaExceeded",
            Self::InvalidFileFormat(_) => "InvalidFileFormat",
            Self::Transient(_) => "Transient",
            Self::Database(_) | Self::Internal(_) => "Internal",
        }
    }

    /// True when the underlying sqlx error is a unique-constraint violation.
    pub fn is_unique_violation(err: &sqlx::Error) -> bool {
        err.as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| code == "23505")
    }
}

impl IntoResponse for DomainError {
    fn into_response(self) -> Response {
        let status = match &self {
            // NotFound and Forbidden intentionally share the response shape
            // so callers cannot probe for the existence of entities they
            // may not see.
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) | Self::RefMovedUnderImport => StatusCode::CONFLICT,
            Self::BusinessRule(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::QuotaExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidFileFormat(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let correlation_id = uuid::Uuid::new_v4();
        let message = match &self {
            // Identical wording for both, per the probing contract.
            Self::NotFound | Self::Forbidden => "resource not found".to_string(),
            Self::Database(e) => {
                tracing::error!(%correlation_id, error = %e, "database failure");
                "internal error".to_string()
            }
            Self::Internal(e) => {
                tracing::error!(%correlation_id, error = ?e, "unexpected failure");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let body = json!({
            "kind": self.kind(),
            "message": message,
            "correlation_id": correlation_id,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(DomainError::NotFound.kind(), "NotFound");
        assert_eq!(
            DomainError::RefMovedUnderImport.kind(),
            "RefMovedUnderImport"
        );
        assert_eq!(
            DomainError::QuotaExceeded("cap".into()).kind(),
            "QuotaExceeded"
        );
    }

    #[test]
    fn test_not_found_and_forbidden_share_message() {
        // The probing contract: an unauthorized caller must not be able to
        // distinguish "exists but hidden" from "does not exist".
        let nf = format!("{}", DomainError::NotFound);
        assert_eq!(nf, "not found");
    }
}
