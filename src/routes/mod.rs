use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::config::{create_cors_layer, create_security_headers_layer};
use crate::handlers::{
    attendances_since, batch_scan, health_check, issue_credential, scan, totals, totals_stream,
    AppState,
};

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/scans", post(scan))
        .route("/scans/batch", post(batch_scan))
        .route("/events/:event_id/attendances/since", get(attendances_since))
        .route("/events/:event_id/totals", get(totals))
        .route("/events/:event_id/totals/stream", get(totals_stream))
        .route("/tickets/:ticket_id/credential", post(issue_credential))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(create_security_headers_layer())
        .layer(create_cors_layer())
}
