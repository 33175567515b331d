//! Caller identity forwarded by the upstream gateway.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use uuid::Uuid;

use crate::scan::ScanContext;
use crate::utils::error::AppError;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const OPERATOR_HEADER: &str = "x-operator-id";
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

fn uuid_header(headers: &HeaderMap, name: &'static str) -> Result<Option<Uuid>, AppError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };

    value
        .to_str()
        .ok()
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
        .map(Some)
        .ok_or_else(|| AppError::ValidationError(format!("{} must be a UUID", name)))
}

#[async_trait]
impl<S> FromRequestParts<S> for ScanContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ScanContext {
            tenant_id: uuid_header(&parts.headers, TENANT_HEADER)?,
            operator_id: uuid_header(&parts.headers, OPERATOR_HEADER)?,
        })
    }
}

/// The `Idempotency-Key` header, when present and non-blank.
pub fn idempotency_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}
