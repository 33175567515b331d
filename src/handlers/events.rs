use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::{wrappers::WatchStream, Stream, StreamExt};
use uuid::Uuid;

use super::AppState;
use crate::utils::cursor::{decode_cursor, encode_cursor};
use crate::utils::error::AppError;
use crate::utils::response::{success, success_with_meta};

pub const DEFAULT_PAGE_LIMIT: usize = 100;
pub const MAX_PAGE_LIMIT: usize = 500;
pub const STREAM_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct SinceQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

/// Attendance records after `cursor`, oldest first.
pub async fn attendances_since(
    State(service): State<AppState>,
    Path(event_id): Path<Uuid>,
    Query(query): Query<SinceQuery>,
) -> Result<Response, AppError> {
    let after_seq = match query.cursor.as_deref().filter(|c| !c.is_empty()) {
        Some(cursor) => decode_cursor(cursor)
            .ok_or_else(|| AppError::ValidationError("cursor is not valid".to_string()))?,
        None => 0,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, MAX_PAGE_LIMIT);

    let records = service
        .attendances_since(event_id, after_seq, limit)
        .await?;
    let last_seq = records.last().map_or(after_seq, |record| record.seq);
    let meta = json!({
        "next_cursor": encode_cursor(last_seq),
        "count": records.len(),
    });

    Ok(success_with_meta(records, "Attendances retrieved", meta).into_response())
}

pub async fn totals(
    State(service): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let snapshot = service.totals_snapshot(event_id).await?;
    Ok(success(snapshot.as_ref(), "Totals retrieved").into_response())
}

/// Server-sent `totals` events. Slow clients only ever receive the newest snapshot.
pub async fn totals_stream(
    State(service): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let receiver = service.totals().subscribe(event_id).await?;
    tracing::debug!(%event_id, "Totals stream opened");

    let stream = WatchStream::new(receiver).map(|snapshot| {
        Event::default()
            .event("totals")
            .id(snapshot.sequence.to_string())
            .json_data(snapshot.as_ref())
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(STREAM_KEEP_ALIVE)))
}
