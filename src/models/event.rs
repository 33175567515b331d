use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::ticket::UnknownVariant;

/// How many admissions a single ticket grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckInPolicy {
    #[default]
    Single,
    Multiple,
}

impl CheckInPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckInPolicy::Single => "single",
            CheckInPolicy::Multiple => "multiple",
        }
    }
}

impl FromStr for CheckInPolicy {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "single" => Ok(CheckInPolicy::Single),
            "multiple" => Ok(CheckInPolicy::Multiple),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub checkin_policy: CheckInPolicy,
}
