use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::services::CheckInService;
use crate::utils::response::success;

pub mod context;
pub mod events;
pub mod scans;
pub mod tickets;

pub use events::{attendances_since, totals, totals_stream};
pub use scans::{batch_scan, scan};
pub use tickets::issue_credential;

pub type AppState = Arc<CheckInService>;

#[derive(Serialize)]
struct HealthPayload {
    status: &'static str,
    service: &'static str,
}

pub async fn health_check() -> Response {
    let payload = HealthPayload {
        status: "ok",
        service: "ticket-gate",
    };

    success(payload, "Health check successful").into_response()
}
