//! In-process backend used by tests and `STORE=memory` runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    AttendanceStore, CheckpointScope, CodeRegistry, EventCounts, ResultCount, StoreError,
    TicketDirectory,
};
use crate::models::{Attendance, Event, NewAttendance, ScanResult, Ticket, TicketStatus};

#[derive(Debug, Default)]
struct Inner {
    tickets: HashMap<Uuid, Ticket>,
    events: HashMap<Uuid, Event>,
    attendances: Vec<Attendance>,
    admission_keys: HashSet<String>,
    /// code -> retired
    codes: HashMap<String, bool>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    failing_inserts: AtomicU32,
    insert_delay: Mutex<Option<Duration>>,
    counts_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    pub fn put_ticket(&self, ticket: Ticket) {
        if let Ok(mut inner) = self.lock() {
            inner.tickets.insert(ticket.id, ticket);
        }
    }

    pub fn put_event(&self, event: Event) {
        if let Ok(mut inner) = self.lock() {
            inner.events.insert(event.id, event);
        }
    }

    pub fn ticket(&self, ticket_id: Uuid) -> Option<Ticket> {
        self.lock().ok()?.tickets.get(&ticket_id).cloned()
    }

    pub fn attendances(&self) -> Vec<Attendance> {
        self.lock()
            .map(|inner| inner.attendances.clone())
            .unwrap_or_default()
    }

    pub fn is_retired(&self, code: &str) -> Option<bool> {
        self.lock().ok()?.codes.get(code).copied()
    }

    /// Makes the next `count` inserts fail with a transient error.
    pub fn fail_next_inserts(&self, count: u32) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// Delays every insert, for exercising timeouts.
    pub fn set_insert_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.insert_delay.lock() {
            *slot = delay;
        }
    }

    /// Delays every `event_counts` query.
    pub fn set_counts_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.counts_delay.lock() {
            *slot = delay;
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TicketDirectory for MemoryStore {
    async fn find_ticket(&self, ticket_id: Uuid) -> Result<Option<Ticket>, StoreError> {
        Ok(self.lock()?.tickets.get(&ticket_id).cloned())
    }

    async fn find_event(&self, event_id: Uuid) -> Result<Option<Event>, StoreError> {
        Ok(self.lock()?.events.get(&event_id).cloned())
    }

    async fn mark_used(&self, ticket_id: Uuid) -> Result<(), StoreError> {
        if let Some(ticket) = self.lock()?.tickets.get_mut(&ticket_id) {
            if ticket.status == TicketStatus::Issued {
                ticket.status = TicketStatus::Used;
            }
        }
        Ok(())
    }

    async fn set_display_code(&self, ticket_id: Uuid, code: &str) -> Result<(), StoreError> {
        if let Some(ticket) = self.lock()?.tickets.get_mut(&ticket_id) {
            ticket.display_code = Some(code.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl AttendanceStore for MemoryStore {
    async fn insert(&self, attendance: NewAttendance) -> Result<Attendance, StoreError> {
        let delay = self.insert_delay.lock().ok().and_then(|slot| *slot);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.take_injected_failure() {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        let mut inner = self.lock()?;
        if inner.attendances.iter().any(|a| a.id == attendance.id) {
            return Err(StoreError::Conflict);
        }
        if let Some(key) = &attendance.admission_key {
            if !inner.admission_keys.insert(key.clone()) {
                return Err(StoreError::Conflict);
            }
        }

        let seq = inner.attendances.len() as i64 + 1;
        let record = Attendance::from_new(seq, attendance);
        inner.attendances.push(record.clone());
        Ok(record)
    }

    async fn find_attendance(&self, id: Uuid) -> Result<Option<Attendance>, StoreError> {
        Ok(self
            .lock()?
            .attendances
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }

    async fn find_replay(
        &self,
        subject: &str,
        device_id: Option<&str>,
        token: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Attendance>, StoreError> {
        Ok(self
            .lock()?
            .attendances
            .iter()
            .rev()
            .find(|a| {
                a.subject == subject
                    && a.device_id.as_deref() == device_id
                    && a.idempotency_token.as_deref() == Some(token)
                    && a.recorded_at >= since
            })
            .cloned())
    }

    async fn latest_valid(
        &self,
        ticket_id: Uuid,
        scope: CheckpointScope,
    ) -> Result<Option<Attendance>, StoreError> {
        Ok(self
            .lock()?
            .attendances
            .iter()
            .filter(|a| {
                a.ticket_id == Some(ticket_id)
                    && a.result == ScanResult::Valid
                    && scope.matches(a.checkpoint_id)
            })
            .max_by_key(|a| (a.scanned_at, a.seq))
            .cloned())
    }

    async fn list_since(
        &self,
        event_id: Uuid,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<Attendance>, StoreError> {
        Ok(self
            .lock()?
            .attendances
            .iter()
            .filter(|a| a.event_id == Some(event_id) && a.seq > after_seq)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn event_counts(&self, event_id: Uuid) -> Result<EventCounts, StoreError> {
        let delay = self.counts_delay.lock().ok().and_then(|slot| *slot);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let inner = self.lock()?;
        let mut buckets: HashMap<(Option<Uuid>, ScanResult), u64> = HashMap::new();
        let mut max_seq = 0;

        for attendance in inner
            .attendances
            .iter()
            .filter(|a| a.event_id == Some(event_id))
        {
            *buckets
                .entry((attendance.checkpoint_id, attendance.result))
                .or_default() += 1;
            max_seq = max_seq.max(attendance.seq);
        }

        Ok(EventCounts {
            rows: buckets
                .into_iter()
                .map(|((checkpoint_id, result), count)| ResultCount {
                    checkpoint_id,
                    result,
                    count,
                })
                .collect(),
            max_seq,
        })
    }
}

#[async_trait]
impl CodeRegistry for MemoryStore {
    async fn exists(&self, code: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.codes.contains_key(code))
    }

    async fn claim(&self, code: &str, _ticket_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.codes.contains_key(code) {
            return Err(StoreError::Conflict);
        }
        inner.codes.insert(code.to_string(), false);
        Ok(())
    }

    async fn retire(&self, code: &str) -> Result<(), StoreError> {
        if let Some(retired) = self.lock()?.codes.get_mut(code) {
            *retired = true;
        }
        Ok(())
    }
}
