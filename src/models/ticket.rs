use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Authoritative lifecycle state of a ticket, owned by the ticketing backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Issued,
    Revoked,
    Used,
    Expired,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Issued => "issued",
            TicketStatus::Revoked => "revoked",
            TicketStatus::Used => "used",
            TicketStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "issued" => Ok(TicketStatus::Issued),
            "revoked" => Ok(TicketStatus::Revoked),
            "used" => Ok(TicketStatus::Used),
            "expired" => Ok(TicketStatus::Expired),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant '{0}'")]
pub struct UnknownVariant(pub String);

/// Ticket as seen by the check-in engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub event_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub guest_id: Option<Uuid>,
    pub status: TicketStatus,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Display code of the credential currently printed on the ticket.
    pub display_code: Option<String>,
}

impl Ticket {
    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        self.status == TicketStatus::Expired || self.expires_at.is_some_and(|exp| exp < at)
    }
}
