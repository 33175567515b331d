//! Postgres backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, PgPool, Row};
use uuid::Uuid;

use super::{
    AttendanceStore, CheckpointScope, CodeRegistry, EventCounts, ResultCount, StoreError,
    TicketDirectory,
};
use crate::models::{Attendance, Event, NewAttendance, ScanResult, Ticket};

const ATTENDANCE_COLUMNS: &str = "seq, id, event_id, ticket_id, guest_id, checkpoint_id, \
     operator_id, device_id, scanned_at, recorded_at, result, reason, offline, subject, \
     idempotency_token, payload_hash, admission_key, metadata";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> sqlx::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

impl<'r> FromRow<'r, PgRow> for Ticket {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            tenant_id: row.try_get("tenant_id")?,
            guest_id: row.try_get("guest_id")?,
            status: parse_column(row, "status")?,
            issued_at: row.try_get("issued_at")?,
            expires_at: row.try_get("expires_at")?,
            display_code: row.try_get("display_code")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for Event {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            checkin_policy: parse_column(row, "checkin_policy")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for Attendance {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            seq: row.try_get("seq")?,
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            ticket_id: row.try_get("ticket_id")?,
            guest_id: row.try_get("guest_id")?,
            checkpoint_id: row.try_get("checkpoint_id")?,
            operator_id: row.try_get("operator_id")?,
            device_id: row.try_get("device_id")?,
            scanned_at: row.try_get("scanned_at")?,
            recorded_at: row.try_get("recorded_at")?,
            result: parse_column(row, "result")?,
            reason: row.try_get("reason")?,
            offline: row.try_get("offline")?,
            subject: row.try_get("subject")?,
            idempotency_token: row.try_get("idempotency_token")?,
            payload_hash: row.try_get("payload_hash")?,
            admission_key: row.try_get("admission_key")?,
            metadata: row.try_get("metadata")?,
        })
    }
}

#[async_trait]
impl TicketDirectory for PgStore {
    async fn find_ticket(&self, ticket_id: Uuid) -> Result<Option<Ticket>, StoreError> {
        sqlx::query_as::<_, Ticket>(
            "SELECT id, event_id, tenant_id, guest_id, status, issued_at, expires_at, display_code \
             FROM tickets WHERE id = $1",
        )
        .bind(ticket_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)
    }

    async fn find_event(&self, event_id: Uuid) -> Result<Option<Event>, StoreError> {
        sqlx::query_as::<_, Event>("SELECT id, tenant_id, checkin_policy FROM events WHERE id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)
    }

    async fn mark_used(&self, ticket_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE tickets SET status = 'used', updated_at = NOW() \
             WHERE id = $1 AND status = 'issued'",
        )
        .bind(ticket_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_display_code(&self, ticket_id: Uuid, code: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE tickets SET display_code = $2, updated_at = NOW() WHERE id = $1")
            .bind(ticket_id)
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AttendanceStore for PgStore {
    async fn insert(&self, attendance: NewAttendance) -> Result<Attendance, StoreError> {
        let sql = format!(
            "INSERT INTO attendances (id, event_id, ticket_id, guest_id, checkpoint_id, \
             operator_id, device_id, scanned_at, recorded_at, result, reason, offline, subject, \
             idempotency_token, payload_hash, admission_key, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             RETURNING {ATTENDANCE_COLUMNS}"
        );

        sqlx::query_as::<_, Attendance>(&sql)
            .bind(attendance.id)
            .bind(attendance.event_id)
            .bind(attendance.ticket_id)
            .bind(attendance.guest_id)
            .bind(attendance.checkpoint_id)
            .bind(attendance.operator_id)
            .bind(&attendance.device_id)
            .bind(attendance.scanned_at)
            .bind(attendance.recorded_at)
            .bind(attendance.result.as_str())
            .bind(&attendance.reason)
            .bind(attendance.offline)
            .bind(&attendance.subject)
            .bind(&attendance.idempotency_token)
            .bind(&attendance.payload_hash)
            .bind(&attendance.admission_key)
            .bind(&attendance.metadata)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from)
    }

    async fn find_attendance(&self, id: Uuid) -> Result<Option<Attendance>, StoreError> {
        let sql = format!("SELECT {ATTENDANCE_COLUMNS} FROM attendances WHERE id = $1");

        sqlx::query_as::<_, Attendance>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)
    }

    async fn find_replay(
        &self,
        subject: &str,
        device_id: Option<&str>,
        token: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Attendance>, StoreError> {
        let sql = format!(
            "SELECT {ATTENDANCE_COLUMNS} FROM attendances \
             WHERE subject = $1 AND device_id IS NOT DISTINCT FROM $2 \
             AND idempotency_token = $3 AND recorded_at >= $4 \
             ORDER BY seq DESC LIMIT 1"
        );

        sqlx::query_as::<_, Attendance>(&sql)
            .bind(subject)
            .bind(device_id)
            .bind(token)
            .bind(since)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)
    }

    async fn latest_valid(
        &self,
        ticket_id: Uuid,
        scope: CheckpointScope,
    ) -> Result<Option<Attendance>, StoreError> {
        let query = match scope {
            CheckpointScope::Any => format!(
                "SELECT {ATTENDANCE_COLUMNS} FROM attendances \
                 WHERE ticket_id = $1 AND result = 'valid' \
                 ORDER BY scanned_at DESC, seq DESC LIMIT 1"
            ),
            CheckpointScope::Exactly(_) => format!(
                "SELECT {ATTENDANCE_COLUMNS} FROM attendances \
                 WHERE ticket_id = $1 AND result = 'valid' \
                 AND checkpoint_id IS NOT DISTINCT FROM $2 \
                 ORDER BY scanned_at DESC, seq DESC LIMIT 1"
            ),
        };

        let mut statement = sqlx::query_as::<_, Attendance>(&query).bind(ticket_id);
        if let CheckpointScope::Exactly(checkpoint_id) = scope {
            statement = statement.bind(checkpoint_id);
        }

        statement
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)
    }

    async fn list_since(
        &self,
        event_id: Uuid,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<Attendance>, StoreError> {
        let sql = format!(
            "SELECT {ATTENDANCE_COLUMNS} FROM attendances \
             WHERE event_id = $1 AND seq > $2 ORDER BY seq ASC LIMIT $3"
        );

        sqlx::query_as::<_, Attendance>(&sql)
            .bind(event_id)
            .bind(after_seq)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)
    }

    async fn event_counts(&self, event_id: Uuid) -> Result<EventCounts, StoreError> {
        let rows = sqlx::query(
            "SELECT checkpoint_id, result, COUNT(*) AS total, MAX(seq) AS max_seq \
             FROM attendances WHERE event_id = $1 GROUP BY checkpoint_id, result",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = EventCounts::default();
        for row in rows {
            let result: ScanResult = parse_column(&row, "result")?;
            let total: i64 = row.try_get("total")?;
            let max_seq: i64 = row.try_get("max_seq")?;
            counts.max_seq = counts.max_seq.max(max_seq);
            counts.rows.push(ResultCount {
                checkpoint_id: row.try_get("checkpoint_id")?,
                result,
                count: u64::try_from(total).unwrap_or_default(),
            });
        }
        Ok(counts)
    }
}

#[async_trait]
impl CodeRegistry for PgStore {
    async fn exists(&self, code: &str) -> Result<bool, StoreError> {
        let found: Option<i32> = sqlx::query_scalar("SELECT 1 FROM display_codes WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn claim(&self, code: &str, ticket_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO display_codes (code, ticket_id) VALUES ($1, $2)")
            .bind(code)
            .bind(ticket_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retire(&self, code: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE display_codes SET retired_at = NOW() WHERE code = $1 AND retired_at IS NULL",
        )
        .bind(code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
