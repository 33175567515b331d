//! Persistence seams for the check-in engine.
//!
//! The engine never talks to a database directly. It reads tickets and events through
//! [`TicketDirectory`], appends to the attendance log through [`AttendanceStore`] and
//! claims display codes through [`CodeRegistry`]. Postgres backs all three in
//! production; [`MemoryStore`] backs tests and local runs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Attendance, Event, NewAttendance, ScanResult, Ticket};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage operation timed out")]
    Timeout,

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A uniqueness constraint rejected the write.
    #[error("conflicting record")]
    Conflict,

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error")]
    Database(#[source] sqlx::Error),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout | StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::Conflict,
            sqlx::Error::PoolTimedOut => StoreError::Timeout,
            sqlx::Error::Io(ref e) => StoreError::Unavailable(e.to_string()),
            sqlx::Error::PoolClosed => StoreError::Unavailable("pool closed".to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(error.to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

/// Which prior valid scans count when looking for the latest admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointScope {
    Any,
    Exactly(Option<Uuid>),
}

impl CheckpointScope {
    pub fn matches(self, checkpoint_id: Option<Uuid>) -> bool {
        match self {
            CheckpointScope::Any => true,
            CheckpointScope::Exactly(expected) => expected == checkpoint_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCount {
    pub checkpoint_id: Option<Uuid>,
    pub result: ScanResult,
    pub count: u64,
}

/// Aggregate attendance counts for one event, as of `max_seq`.
#[derive(Debug, Clone, Default)]
pub struct EventCounts {
    pub rows: Vec<ResultCount>,
    pub max_seq: i64,
}

#[async_trait]
pub trait TicketDirectory: Send + Sync {
    async fn find_ticket(&self, ticket_id: Uuid) -> Result<Option<Ticket>, StoreError>;

    async fn find_event(&self, event_id: Uuid) -> Result<Option<Event>, StoreError>;

    /// Moves an `issued` ticket to `used`; any other status is left alone.
    async fn mark_used(&self, ticket_id: Uuid) -> Result<(), StoreError>;

    async fn set_display_code(&self, ticket_id: Uuid, code: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AttendanceStore: Send + Sync {
    /// Appends a record. Returns [`StoreError::Conflict`] when `id` or `admission_key`
    /// is taken.
    async fn insert(&self, attendance: NewAttendance) -> Result<Attendance, StoreError>;

    async fn find_attendance(&self, id: Uuid) -> Result<Option<Attendance>, StoreError>;

    /// Finds an earlier attempt carrying the same idempotency token, recorded at or after
    /// `since`.
    async fn find_replay(
        &self,
        subject: &str,
        device_id: Option<&str>,
        token: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Attendance>, StoreError>;

    /// Most recent `valid` record for the ticket by client scan time.
    async fn latest_valid(
        &self,
        ticket_id: Uuid,
        scope: CheckpointScope,
    ) -> Result<Option<Attendance>, StoreError>;

    /// Records of an event with `seq > after_seq`, oldest first.
    async fn list_since(
        &self,
        event_id: Uuid,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<Attendance>, StoreError>;

    async fn event_counts(&self, event_id: Uuid) -> Result<EventCounts, StoreError>;
}

/// Append-only registry of every display code ever handed out.
#[async_trait]
pub trait CodeRegistry: Send + Sync {
    /// True when the code was ever allocated, retired codes included.
    async fn exists(&self, code: &str) -> Result<bool, StoreError>;

    /// Claims the code for a ticket. Returns [`StoreError::Conflict`] if already taken.
    async fn claim(&self, code: &str, ticket_id: Uuid) -> Result<(), StoreError>;

    /// Flags a code as retired. The code stays reserved.
    async fn retire(&self, code: &str) -> Result<(), StoreError>;
}

/// Shared handles to the three persistence seams.
#[derive(Clone)]
pub struct Stores {
    pub tickets: Arc<dyn TicketDirectory>,
    pub attendances: Arc<dyn AttendanceStore>,
    pub codes: Arc<dyn CodeRegistry>,
}

impl Stores {
    /// Uses one backend for all three seams.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: TicketDirectory + AttendanceStore + CodeRegistry + 'static,
    {
        Self {
            tickets: backend.clone(),
            attendances: backend.clone(),
            codes: backend,
        }
    }
}
