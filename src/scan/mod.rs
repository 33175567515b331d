//! Scan decision engine.
//!
//! Every evaluated attempt ends in exactly one attendance record. Attempts for the same
//! ticket are serialized through [`KeyedLocks`], and single-policy admissions also carry
//! an admission key the store refuses to accept twice, so a ticket can never be admitted
//! twice even across processes. Grace-window de-duplication under the `multiple` policy
//! relies on the per-ticket lock alone and is exact within one process only.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ScanSettings;
use crate::credential::{payload_hash, CredentialCodec};
use crate::models::{
    Attendance, CheckInPolicy, Event, NewAttendance, ScanResult, Ticket, TicketCredential,
    TicketStatus,
};
use crate::store::{StoreError, Stores};

pub mod batch;
pub mod decision;
pub mod locks;
pub mod rate_limit;

pub use batch::{BatchItem, BatchItemStatus, BatchReport, BatchRequest, BatchSummary};
pub use decision::Decision;
pub use locks::KeyedLocks;
pub use rate_limit::DeviceRateLimiter;

use decision::{ScanFacts, REASON_ALREADY_CHECKED_IN, REASON_INVALID_CREDENTIAL};

/// Attempts per storage call before a transient failure is surfaced.
pub const MAX_STORE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub qr_code: String,
    pub scanned_at: Option<DateTime<Utc>>,
    pub checkpoint_id: Option<Uuid>,
    pub device_id: Option<String>,
    #[serde(default)]
    pub offline: bool,
    pub event_id: Option<Uuid>,
    pub idempotency_key: Option<String>,
}

impl ScanRequest {
    pub fn new(qr_code: impl Into<String>) -> Self {
        Self {
            qr_code: qr_code.into(),
            scanned_at: None,
            checkpoint_id: None,
            device_id: None,
            offline: false,
            event_id: None,
            idempotency_key: None,
        }
    }
}

/// Identity the gateway resolved for the caller. The engine only compares tenants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanContext {
    pub tenant_id: Option<Uuid>,
    pub operator_id: Option<Uuid>,
}

/// Side effects for the calling layer to dispatch.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    AttendanceRecorded(Attendance),
    TicketConsumed { ticket_id: Uuid, event_id: Uuid },
    DashboardInvalidated { event_id: Uuid },
}

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub result: ScanResult,
    pub reason: Option<String>,
    pub qr_code: String,
    pub ticket: Option<Ticket>,
    pub attendance: Attendance,
    /// True when this is a stored answer to an earlier attempt with the same token.
    pub replayed: bool,
    pub effects: Vec<DomainEvent>,
}

impl ScanOutcome {
    pub fn message(&self) -> &'static str {
        self.result.message()
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("device is over its scan rate limit")]
    Throttled { retry_after: Duration },

    /// Retrying with the same idempotency key is safe.
    #[error("scan could not be completed: {0}")]
    Transient(String),

    #[error("batch of {size} scans exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("storage failure")]
    Storage(#[source] StoreError),
}

impl From<StoreError> for ScanError {
    fn from(error: StoreError) -> Self {
        if error.is_transient() {
            ScanError::Transient(error.to_string())
        } else {
            ScanError::Storage(error)
        }
    }
}

pub struct ScanEngine {
    codec: CredentialCodec,
    stores: Stores,
    settings: ScanSettings,
    tickets_in_flight: KeyedLocks<String>,
    devices_in_flight: KeyedLocks<String>,
    limiter: DeviceRateLimiter,
}

/// Everything known about an attempt before it is recorded.
struct Draft<'a> {
    request: &'a ScanRequest,
    context: &'a ScanContext,
    subject: &'a str,
    scanned_at: DateTime<Utc>,
    credential: Option<&'a TicketCredential>,
    ticket: Option<&'a Ticket>,
    event: Option<&'a Event>,
}

impl ScanEngine {
    pub fn new(codec: CredentialCodec, stores: Stores, settings: ScanSettings) -> Self {
        let limiter = DeviceRateLimiter::new(settings.device_rate_limit);
        Self {
            codec,
            stores,
            settings,
            tickets_in_flight: KeyedLocks::new(),
            devices_in_flight: KeyedLocks::new(),
            limiter,
        }
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Evaluates one live scan.
    pub async fn scan(
        &self,
        request: ScanRequest,
        context: &ScanContext,
    ) -> Result<ScanOutcome, ScanError> {
        self.throttle(request.device_id.as_deref())?;
        self.evaluate(&request, context).await
    }

    fn throttle(&self, device_id: Option<&str>) -> Result<(), ScanError> {
        self.limiter.check(device_id).map_err(|retry_after| {
            warn!(device_id, ?retry_after, "Scan throttled");
            ScanError::Throttled { retry_after }
        })
    }

    pub(crate) async fn evaluate(
        &self,
        request: &ScanRequest,
        context: &ScanContext,
    ) -> Result<ScanOutcome, ScanError> {
        let scanned_at = request.scanned_at.unwrap_or_else(Utc::now);
        let credential = self.codec.decode(&request.qr_code);
        let subject = match &credential {
            Some(credential) => credential.ticket_id.to_string(),
            None => format!("payload:{}", payload_hash(&request.qr_code)),
        };

        let lock_wait = self.settings.store_timeout * MAX_STORE_ATTEMPTS;
        let _guard = tokio::time::timeout(lock_wait, self.tickets_in_flight.lock(subject.clone()))
            .await
            .map_err(|_| {
                warn!(%subject, "Timed out waiting for in-flight scan of the same ticket");
                ScanError::Transient("ticket is busy".to_string())
            })?;

        if let Some(token) = request.idempotency_key.as_deref() {
            if let Some(outcome) = self.replay(&subject, request, context, token).await? {
                return Ok(outcome);
            }
        }

        let mut draft = Draft {
            request,
            context,
            subject: &subject,
            scanned_at,
            credential: credential.as_ref(),
            ticket: None,
            event: None,
        };

        let Some(credential) = credential.as_ref() else {
            debug!("Rejected credential");
            let decision = Decision {
                result: ScanResult::Invalid,
                reason: Some(REASON_INVALID_CREDENTIAL),
            };
            return self.record(&draft, decision, None).await;
        };

        let ticket = self
            .with_store(|| self.stores.tickets.find_ticket(credential.ticket_id))
            .await?;
        let event = match &ticket {
            Some(ticket) => {
                self.with_store(|| self.stores.tickets.find_event(ticket.event_id))
                    .await?
            }
            None => None,
        };
        draft.ticket = ticket.as_ref();
        draft.event = event.as_ref();

        let facts = ScanFacts {
            scanned_at,
            checkpoint_id: request.checkpoint_id,
            requested_event_id: request.event_id,
            tenant_id: context.tenant_id,
        };
        if let Some(decision) = decision::screen(credential, draft.ticket, draft.event, &facts) {
            return self.record(&draft, decision, None).await;
        }

        // screen() only passes with both present
        let (Some(ticket), Some(event)) = (draft.ticket, draft.event) else {
            return Err(ScanError::Transient("ticket context vanished".to_string()));
        };

        let policy = event.checkin_policy;
        let scope = decision::history_scope(policy, request.checkpoint_id);
        let prior = self
            .with_store(|| self.stores.attendances.latest_valid(ticket.id, scope))
            .await?;
        let decision = decision::admit(
            policy,
            ticket,
            prior.as_ref(),
            scanned_at,
            self.settings.duplicate_grace,
        );

        self.record(&draft, decision, prior.as_ref()).await
    }

    async fn replay(
        &self,
        subject: &str,
        request: &ScanRequest,
        context: &ScanContext,
        token: &str,
    ) -> Result<Option<ScanOutcome>, ScanError> {
        let since = Utc::now()
            - chrono::Duration::from_std(self.settings.idempotency_window)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let device_id = request.device_id.as_deref();

        let Some(previous) = self
            .with_store(|| {
                self.stores
                    .attendances
                    .find_replay(subject, device_id, token, since)
            })
            .await?
        else {
            return Ok(None);
        };

        let ticket = match previous.ticket_id {
            Some(_) if decision::withholds_ticket(previous.reason.as_deref()) => None,
            Some(ticket_id) => {
                self.with_store(|| self.stores.tickets.find_ticket(ticket_id))
                    .await?
            }
            None => None,
        }
        .filter(|ticket| context.tenant_id.is_none() || ticket.tenant_id == context.tenant_id);

        debug!(attendance_id = %previous.id, "Replaying recorded scan outcome");
        Ok(Some(ScanOutcome {
            result: previous.result,
            reason: previous.reason.clone(),
            qr_code: request.qr_code.clone(),
            ticket,
            attendance: previous,
            replayed: true,
            effects: Vec::new(),
        }))
    }

    async fn record(
        &self,
        draft: &Draft<'_>,
        decision: Decision,
        prior: Option<&Attendance>,
    ) -> Result<ScanOutcome, ScanError> {
        let policy = draft.event.map(|event| event.checkin_policy);
        let mut attendance = self.new_attendance(draft, decision, prior);

        if decision.result == ScanResult::Valid && policy == Some(CheckInPolicy::Single) {
            attendance.admission_key = draft.ticket.map(|ticket| format!("single:{}", ticket.id));
        }

        let stored = match self.insert(attendance.clone()).await {
            Ok(stored) => stored,
            Err(StoreError::Conflict) if attendance.admission_key.is_some() => {
                info!(subject = draft.subject, "Concurrent admission lost the race, recording duplicate");
                let lost = Decision {
                    result: ScanResult::Duplicate,
                    reason: Some(REASON_ALREADY_CHECKED_IN),
                };
                let mut retry = self.new_attendance(draft, lost, prior);
                retry.metadata["concurrent_admission"] = json!(true);
                self.insert(retry).await?
            }
            Err(e) => return Err(e.into()),
        };

        let mut effects = Vec::with_capacity(3);
        let mut ticket = draft
            .ticket
            .filter(|_| !decision::withholds_ticket(stored.reason.as_deref()))
            .cloned();

        if stored.result == ScanResult::Valid {
            if let Some(ticket) = ticket.as_mut().filter(|t| t.status == TicketStatus::Issued) {
                // attendance history stays authoritative if this write is lost
                if let Err(e) = self
                    .with_store(|| self.stores.tickets.mark_used(ticket.id))
                    .await
                {
                    warn!(ticket_id = %ticket.id, error = %e, "Failed to mark ticket used");
                }
                ticket.status = TicketStatus::Used;
                effects.push(DomainEvent::TicketConsumed {
                    ticket_id: ticket.id,
                    event_id: ticket.event_id,
                });
            }
        }

        if let Some(event_id) = stored.event_id {
            effects.push(DomainEvent::DashboardInvalidated { event_id });
        }
        effects.insert(0, DomainEvent::AttendanceRecorded(stored.clone()));

        info!(
            attendance_id = %stored.id,
            ticket_id = ?stored.ticket_id,
            result = %stored.result,
            reason = ?stored.reason,
            device_id = ?stored.device_id,
            offline = stored.offline,
            "Scan recorded"
        );

        Ok(ScanOutcome {
            result: stored.result,
            reason: stored.reason.clone(),
            qr_code: draft.request.qr_code.clone(),
            ticket,
            attendance: stored,
            replayed: false,
            effects,
        })
    }

    fn new_attendance(
        &self,
        draft: &Draft<'_>,
        decision: Decision,
        prior: Option<&Attendance>,
    ) -> NewAttendance {
        let request = draft.request;
        let resolved = draft.ticket.is_some();

        let mut metadata = json!({});
        if let Some(event) = draft.event {
            metadata["policy"] = json!(event.checkin_policy.as_str());
        }
        if let Some(prior) = prior {
            metadata["prior_attendance_id"] = json!(prior.id);
            metadata["prior_scanned_at"] = json!(prior.scanned_at);
        }
        if let Some(credential) = draft.credential {
            metadata["display_code"] = json!(credential.display_code);
        }

        NewAttendance {
            id: Uuid::new_v4(),
            event_id: draft
                .ticket
                .map(|ticket| ticket.event_id)
                .or(request.event_id),
            ticket_id: draft.ticket.map(|ticket| ticket.id),
            guest_id: draft.ticket.and_then(|ticket| ticket.guest_id),
            checkpoint_id: request.checkpoint_id,
            operator_id: draft.context.operator_id,
            device_id: request.device_id.clone(),
            scanned_at: draft.scanned_at,
            recorded_at: Utc::now(),
            result: decision.result,
            reason: decision.reason.map(str::to_string),
            offline: request.offline,
            subject: draft.subject.to_string(),
            idempotency_token: request.idempotency_key.clone(),
            payload_hash: (!resolved).then(|| payload_hash(&request.qr_code)),
            admission_key: None,
            metadata,
        }
    }

    /// Inserts with retries. A retried insert may find its own earlier attempt already
    /// committed; that row is returned instead of a conflict.
    async fn insert(&self, attendance: NewAttendance) -> Result<Attendance, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .bounded(self.stores.attendances.insert(attendance.clone()))
                .await;

            match result {
                Ok(stored) => return Ok(stored),
                Err(StoreError::Conflict) if attempt > 1 => {
                    let own = self
                        .bounded(self.stores.attendances.find_attendance(attendance.id))
                        .await?;
                    return own.ok_or(StoreError::Conflict);
                }
                Err(e) if e.is_transient() && attempt < MAX_STORE_ATTEMPTS => {
                    warn!(attempt, error = %e, "Attendance insert failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs a storage call under the configured timeout, retrying transient failures.
    async fn with_store<T, F, Fut>(&self, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.bounded(call()).await {
                Err(e) if e.is_transient() && attempt < MAX_STORE_ATTEMPTS => {
                    warn!(attempt, error = %e, "Storage call failed, retrying");
                }
                other => return other,
            }
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.settings.store_timeout, call)
            .await
            .unwrap_or_else(|_| Err(StoreError::Timeout))
    }
}
