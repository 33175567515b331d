use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

use super::context::idempotency_header;
use super::AppState;
use crate::models::{Attendance, ScanResult, Ticket};
use crate::scan::decision::withholds_ticket;
use crate::scan::{BatchItemStatus, BatchRequest, ScanContext, ScanOutcome, ScanRequest};
use crate::utils::error::AppError;
use crate::utils::response::{success, success_with_meta};

#[derive(Serialize)]
pub struct ScanView<'a> {
    pub result: ScanResult,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'a str>,
    pub qr_code: &'a str,
    pub replayed: bool,
    pub ticket: Option<&'a Ticket>,
    pub attendance: Option<&'a Attendance>,
}

impl<'a> From<&'a ScanOutcome> for ScanView<'a> {
    fn from(outcome: &'a ScanOutcome) -> Self {
        Self {
            result: outcome.result,
            message: outcome.message(),
            reason: outcome.reason.as_deref(),
            qr_code: &outcome.qr_code,
            replayed: outcome.replayed,
            ticket: outcome.ticket.as_ref(),
            // the stored row carries the foreign guest and display code
            attendance: (!withholds_ticket(outcome.reason.as_deref()))
                .then_some(&outcome.attendance),
        }
    }
}

#[derive(Serialize)]
struct BatchItemView<'a> {
    index: usize,
    status: BatchItemStatus,
    #[serde(flatten)]
    outcome: Option<ScanView<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

pub async fn scan(
    State(service): State<AppState>,
    context: ScanContext,
    headers: HeaderMap,
    Json(mut request): Json<ScanRequest>,
) -> Result<Response, AppError> {
    if request.qr_code.trim().is_empty() {
        return Err(AppError::ValidationError("qr_code is required".to_string()));
    }
    if request.idempotency_key.is_none() {
        request.idempotency_key = idempotency_header(&headers);
    }

    let outcome = service.scan(request, &context).await?;
    let message = outcome.message();
    Ok(success(ScanView::from(&outcome), message).into_response())
}

pub async fn batch_scan(
    State(service): State<AppState>,
    context: ScanContext,
    Json(batch): Json<BatchRequest>,
) -> Result<Response, AppError> {
    let report = service.reconcile(batch, &context).await?;

    let items: Vec<BatchItemView<'_>> = report
        .items
        .iter()
        .map(|item| BatchItemView {
            index: item.index,
            status: item.status,
            outcome: item.outcome.as_ref().map(ScanView::from),
            error: item.error.as_deref(),
        })
        .collect();
    let meta = json!({
        "summary": report.summary,
        "total_scans": report.total_scans,
    });

    Ok(success_with_meta(items, "Batch processed", meta).into_response())
}
