//! Server-wide error taxonomy and its REST mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use moor_sandbox::SandboxError;
use moor_shared::crypto::CryptoError;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    ProviderUnavailable(String),
    #[error("{0}")]
    SandboxFailure(String),
    #[error("{0}")]
    Crypto(#[from] CryptoError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn validation(message: impl Into<String>) -> Self {
        ServerError::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        ServerError::NotFound(what.into())
    }

    /// Stable machine-readable code for the REST `error` body.
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::Validation(_) => "VALIDATION",
            ServerError::NotFound(_) => "NOT_FOUND",
            ServerError::Conflict(_) => "CONFLICT",
            ServerError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            ServerError::SandboxFailure(_) => "SANDBOX_FAILURE",
            ServerError::Crypto(_) => "DECRYPT_FAILED",
            ServerError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::Validation(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::SandboxFailure(_) => StatusCode::BAD_GATEWAY,
            ServerError::Crypto(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(what) => ServerError::NotFound(what),
            StoreError::Conflict(message) => ServerError::Conflict(message),
            StoreError::Crypto(error) => ServerError::Crypto(error),
            StoreError::Sqlite(error) => ServerError::Internal(error.to_string()),
            StoreError::Invalid(message) => ServerError::Internal(message),
        }
    }
}

impl From<SandboxError> for ServerError {
    fn from(error: SandboxError) -> Self {
        match error {
            SandboxError::NotFound(id) => ServerError::NotFound(format!("sandbox {id}")),
            SandboxError::ProviderUnavailable(message) => {
                ServerError::ProviderUnavailable(message)
            }
            SandboxError::Provision(message) | SandboxError::Operation(message) => {
                ServerError::SandboxFailure(message)
            }
            SandboxError::Io(error) => ServerError::SandboxFailure(error.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        let body = json!({
            "data": null,
            "error": {"code": self.code(), "message": self.to_string()},
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_http_statuses() {
        assert_eq!(
            ServerError::validation("bad mode").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServerError::not_found("session x").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServerError::Conflict("duplicate default".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServerError::ProviderUnavailable("docker down".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn sandbox_not_found_becomes_rest_not_found() {
        let error: ServerError = SandboxError::NotFound("mock-1".into()).into();
        assert_eq!(error.code(), "NOT_FOUND");
    }
}
