use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{error, warn};

use crate::credential::CodecError;
use crate::scan::ScanError;
use crate::store::StoreError;
use crate::utils::response::error as error_response;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited")]
    RateLimited { retry_after: Duration },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Display code allocation exhausted")]
    DisplayCodeExhausted,

    #[error("Database error")]
    DatabaseError(#[source] StoreError),

    #[error("Internal server error")]
    InternalServerError(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::DisplayCodeExhausted => StatusCode::SERVICE_UNAVAILABLE,
            AppError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::Transient(_) => "TRANSIENT_FAILURE",
            AppError::DisplayCodeExhausted => "DISPLAY_CODE_EXHAUSTED",
            AppError::DatabaseError(_) => "DATABASE_ERROR",
            AppError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    fn log(&self) {
        match self {
            AppError::ValidationError(msg) | AppError::NotFound(msg) => {
                warn!(code = self.code(), message = %msg, "Request rejected");
            }
            AppError::RateLimited { retry_after } => {
                warn!(?retry_after, "Request rate limited");
            }
            AppError::Transient(msg) | AppError::InternalServerError(msg) => {
                error!(error = ?self, message = %msg, "Application error");
            }
            AppError::DisplayCodeExhausted => {
                error!("Display code namespace exhausted");
            }
            AppError::DatabaseError(e) => {
                error!(error = ?e, "Database error");
            }
        }
    }

    fn public_message(&self) -> String {
        match self {
            AppError::ValidationError(msg) | AppError::NotFound(msg) => msg.clone(),
            AppError::RateLimited { .. } => "Too many scans from this device, slow down".to_string(),
            AppError::Transient(_) => {
                "Temporarily unavailable, retry with the same idempotency key".to_string()
            }
            AppError::DisplayCodeExhausted => {
                "Could not allocate a display code, try again later".to_string()
            }
            AppError::DatabaseError(_) => "A database error occurred".to_string(),
            AppError::InternalServerError(_) => "An internal error occurred".to_string(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        if error.is_transient() {
            AppError::Transient(error.to_string())
        } else {
            AppError::DatabaseError(error)
        }
    }
}

impl From<ScanError> for AppError {
    fn from(error: ScanError) -> Self {
        match error {
            ScanError::Throttled { retry_after } => AppError::RateLimited { retry_after },
            ScanError::Transient(msg) => AppError::Transient(msg),
            ScanError::BatchTooLarge { .. } => AppError::ValidationError(error.to_string()),
            ScanError::Storage(e) => AppError::DatabaseError(e),
        }
    }
}

impl From<CodecError> for AppError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::DisplayCodeExhausted { .. } => AppError::DisplayCodeExhausted,
            CodecError::Store(e) => e.into(),
            CodecError::Serialization(e) => AppError::InternalServerError(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        // Log internal details
        self.log();

        // Do not expose internal details in the API response
        let mut response = error_response(code, self.public_message(), None, status);

        if let AppError::RateLimited { retry_after } = &self {
            let seconds = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttling_maps_to_429_with_retry_after() {
        let response = AppError::from(ScanError::Throttled {
            retry_after: Duration::from_millis(300),
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }

    #[test]
    fn test_transient_store_errors_are_retryable() {
        let error = AppError::from(StoreError::Timeout);
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.code(), "TRANSIENT_FAILURE");

        let error = AppError::from(StoreError::Corrupt("bad row".to_string()));
        assert_eq!(error.code(), "DATABASE_ERROR");
    }

    #[test]
    fn test_exhaustion_is_an_operational_error() {
        let error = AppError::from(CodecError::DisplayCodeExhausted { attempts: 25 });
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.code(), "DISPLAY_CODE_EXHAUSTED");
    }
}
