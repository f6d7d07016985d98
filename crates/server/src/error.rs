use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rasid_core::{LedgerError, Reference};
use rasid_pipeline::PipelineError;
use rasid_storage::StoreError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("Bad request: {0}")]
    BadRequest(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Pipeline(PipelineError::InvalidRequest(_)) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST")
            }
            ApiError::Pipeline(PipelineError::Store(store)) => match store {
                StoreError::Ledger(ledger) => match ledger {
                    LedgerError::InvalidTransition { .. } => {
                        (StatusCode::CONFLICT, "INVALID_TRANSITION")
                    }
                    LedgerError::ReferenceNotFound(
                        Reference::Candidate(_) | Reference::Transaction(_),
                    ) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                    LedgerError::ReferenceNotFound(_) => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "REFERENCE_NOT_FOUND")
                    }
                    LedgerError::PrecisionOverflow(_) => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "PRECISION_OVERFLOW")
                    }
                    LedgerError::Incomplete(_) | LedgerError::InvalidTransfer => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "INCOMPLETE")
                    }
                },
                StoreError::Conflict { .. } => (StatusCode::SERVICE_UNAVAILABLE, "CONFLICT"),
                StoreError::Database(_) | StoreError::Corrupt(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.classify();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };
        (status, axum::Json(json!({ "error": message, "code": code }))).into_response()
    }
}
