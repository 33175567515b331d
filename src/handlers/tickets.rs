use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use uuid::Uuid;

use super::AppState;
use crate::utils::error::AppError;
use crate::utils::response::success;

#[derive(Serialize)]
struct CredentialPayload {
    payload: String,
    display_code: String,
}

/// Issues a new signed credential. Earlier credentials for the ticket stop verifying
/// against the ticket's current display code.
pub async fn issue_credential(
    State(service): State<AppState>,
    Path(ticket_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let signed = service.issue_credential(ticket_id).await?;

    let payload = CredentialPayload {
        payload: signed.payload,
        display_code: signed.display_code,
    };
    Ok(success(payload, "Credential issued").into_response())
}
