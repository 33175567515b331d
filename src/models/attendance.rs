use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::ticket::UnknownVariant;

/// Outcome of one scan attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanResult {
    Valid,
    Duplicate,
    Invalid,
    Revoked,
    Expired,
}

impl ScanResult {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanResult::Valid => "valid",
            ScanResult::Duplicate => "duplicate",
            ScanResult::Invalid => "invalid",
            ScanResult::Revoked => "revoked",
            ScanResult::Expired => "expired",
        }
    }

    /// Operator-facing message shown on the scanning device.
    pub fn message(self) -> &'static str {
        match self {
            ScanResult::Valid => "Ticket accepted",
            ScanResult::Duplicate => "Ticket already checked in",
            ScanResult::Invalid => "Ticket could not be validated",
            ScanResult::Revoked => "Ticket has been revoked",
            ScanResult::Expired => "Ticket has expired",
        }
    }
}

impl fmt::Display for ScanResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanResult {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "valid" => Ok(ScanResult::Valid),
            "duplicate" => Ok(ScanResult::Duplicate),
            "invalid" => Ok(ScanResult::Invalid),
            "revoked" => Ok(ScanResult::Revoked),
            "expired" => Ok(ScanResult::Expired),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Attendance row before the store assigns it a sequence number.
#[derive(Debug, Clone)]
pub struct NewAttendance {
    pub id: Uuid,
    pub event_id: Option<Uuid>,
    pub ticket_id: Option<Uuid>,
    pub guest_id: Option<Uuid>,
    pub checkpoint_id: Option<Uuid>,
    pub operator_id: Option<Uuid>,
    pub device_id: Option<String>,
    pub scanned_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub result: ScanResult,
    pub reason: Option<String>,
    pub offline: bool,
    /// Scan subject the idempotency token is scoped to.
    pub subject: String,
    pub idempotency_token: Option<String>,
    pub payload_hash: Option<String>,
    /// Unique per single-policy admission; a second insert with the same key is a conflict.
    pub admission_key: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attendance {
    pub seq: i64,
    pub id: Uuid,
    pub event_id: Option<Uuid>,
    pub ticket_id: Option<Uuid>,
    pub guest_id: Option<Uuid>,
    pub checkpoint_id: Option<Uuid>,
    pub operator_id: Option<Uuid>,
    pub device_id: Option<String>,
    pub scanned_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub result: ScanResult,
    pub reason: Option<String>,
    pub offline: bool,
    #[serde(skip)]
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_hash: Option<String>,
    #[serde(skip)]
    pub admission_key: Option<String>,
    pub metadata: Value,
}

impl Attendance {
    pub fn from_new(seq: i64, new: NewAttendance) -> Self {
        Self {
            seq,
            id: new.id,
            event_id: new.event_id,
            ticket_id: new.ticket_id,
            guest_id: new.guest_id,
            checkpoint_id: new.checkpoint_id,
            operator_id: new.operator_id,
            device_id: new.device_id,
            scanned_at: new.scanned_at,
            recorded_at: new.recorded_at,
            result: new.result,
            reason: new.reason,
            offline: new.offline,
            subject: new.subject,
            idempotency_token: new.idempotency_token,
            payload_hash: new.payload_hash,
            admission_key: new.admission_key,
            metadata: new.metadata,
        }
    }
}
