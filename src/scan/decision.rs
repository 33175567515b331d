//! Pure classification rules. No I/O happens here; the engine gathers the inputs.

use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::credential::credential_expired_at;
use crate::models::{Attendance, CheckInPolicy, Event, ScanResult, Ticket, TicketCredential, TicketStatus};
use crate::store::CheckpointScope;

/// Generic reason for anything the codec refused. Never more specific than this.
pub const REASON_INVALID_CREDENTIAL: &str = "invalid_credential";
pub const REASON_TICKET_NOT_FOUND: &str = "ticket_not_found";
pub const REASON_TENANT_MISMATCH: &str = "tenant_mismatch";
pub const REASON_EVENT_MISMATCH: &str = "event_mismatch";
pub const REASON_CREDENTIAL_SUPERSEDED: &str = "credential_superseded";
pub const REASON_REVOKED: &str = "ticket_revoked";
pub const REASON_EXPIRED: &str = "ticket_expired";
pub const REASON_WITHIN_GRACE: &str = "within_grace_window";
pub const REASON_ALREADY_CHECKED_IN: &str = "already_checked_in";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub result: ScanResult,
    pub reason: Option<&'static str>,
}

impl Decision {
    fn new(result: ScanResult, reason: &'static str) -> Self {
        Self {
            result,
            reason: Some(reason),
        }
    }

    fn valid() -> Self {
        Self {
            result: ScanResult::Valid,
            reason: None,
        }
    }
}

/// What the scanning device claims about the attempt.
#[derive(Debug, Clone, Copy)]
pub struct ScanFacts {
    pub scanned_at: DateTime<Utc>,
    pub checkpoint_id: Option<Uuid>,
    pub requested_event_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
}

/// Rules that need no attendance history: resolution, tenancy, revocation, expiry.
///
/// Returns `Some` when the attempt is already decided.
pub fn screen(
    credential: &TicketCredential,
    ticket: Option<&Ticket>,
    event: Option<&Event>,
    facts: &ScanFacts,
) -> Option<Decision> {
    let Some(ticket) = ticket else {
        return Some(Decision::new(ScanResult::Invalid, REASON_TICKET_NOT_FOUND));
    };

    if facts.tenant_id.is_some() && ticket.tenant_id != facts.tenant_id {
        return Some(Decision::new(ScanResult::Invalid, REASON_TENANT_MISMATCH));
    }

    let event_mismatch = event.is_none()
        || credential.event_id != ticket.event_id
        || facts
            .requested_event_id
            .is_some_and(|requested| requested != ticket.event_id);
    if event_mismatch {
        return Some(Decision::new(ScanResult::Invalid, REASON_EVENT_MISMATCH));
    }

    if ticket
        .display_code
        .as_deref()
        .is_some_and(|current| current != credential.display_code)
    {
        return Some(Decision::new(
            ScanResult::Invalid,
            REASON_CREDENTIAL_SUPERSEDED,
        ));
    }

    if ticket.status == TicketStatus::Revoked {
        return Some(Decision::new(ScanResult::Revoked, REASON_REVOKED));
    }

    if ticket.is_expired_at(facts.scanned_at) || credential_expired_at(credential, facts.scanned_at)
    {
        return Some(Decision::new(ScanResult::Expired, REASON_EXPIRED));
    }

    None
}

/// Rejections for which the caller must not see the resolved ticket.
pub fn withholds_ticket(reason: Option<&str>) -> bool {
    matches!(
        reason,
        Some(REASON_TENANT_MISMATCH | REASON_EVENT_MISMATCH | REASON_CREDENTIAL_SUPERSEDED)
    )
}

/// Which earlier admissions the duplicate check looks at under `policy`.
pub fn history_scope(policy: CheckInPolicy, checkpoint_id: Option<Uuid>) -> CheckpointScope {
    match policy {
        CheckInPolicy::Single => CheckpointScope::Any,
        CheckInPolicy::Multiple => CheckpointScope::Exactly(checkpoint_id),
    }
}

fn within_grace(prior: &Attendance, scanned_at: DateTime<Utc>, grace: Duration) -> bool {
    let gap = scanned_at
        .signed_duration_since(prior.scanned_at)
        .num_milliseconds()
        .unsigned_abs();
    gap <= grace.as_millis() as u64
}

/// Admission rules, given the most recent valid scan in [`history_scope`].
pub fn admit(
    policy: CheckInPolicy,
    ticket: &Ticket,
    prior_valid: Option<&Attendance>,
    scanned_at: DateTime<Utc>,
    grace: Duration,
) -> Decision {
    match policy {
        CheckInPolicy::Single => match prior_valid {
            Some(prior) if within_grace(prior, scanned_at, grace) => {
                Decision::new(ScanResult::Duplicate, REASON_WITHIN_GRACE)
            }
            Some(_) => Decision::new(ScanResult::Duplicate, REASON_ALREADY_CHECKED_IN),
            None if ticket.status == TicketStatus::Used => {
                Decision::new(ScanResult::Duplicate, REASON_ALREADY_CHECKED_IN)
            }
            None => Decision::valid(),
        },
        CheckInPolicy::Multiple => match prior_valid {
            Some(prior) if within_grace(prior, scanned_at, grace) => {
                Decision::new(ScanResult::Duplicate, REASON_WITHIN_GRACE)
            }
            _ => Decision::valid(),
        },
    }
}
