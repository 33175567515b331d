use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

pub const CREDENTIAL_VERSION: u8 = 1;

/// Signed content of a ticket QR code.
///
/// Field order is the wire order; the serialized form is what gets signed, so it must
/// stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TicketCredential {
    #[serde(rename = "v")]
    pub version: u8,
    #[serde(rename = "tid")]
    pub ticket_id: Uuid,
    #[serde(rename = "eid")]
    pub event_id: Uuid,
    #[serde(rename = "ten")]
    pub tenant_id: Option<Uuid>,
    #[serde(rename = "code")]
    pub display_code: String,
    #[serde(rename = "iat", with = "iso8601")]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(rename = "exp", with = "iso8601")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(rename = "n")]
    pub nonce: String,
}

/// Second-precision, `Z`-suffixed timestamps so the signed bytes never depend on
/// sub-second noise.
mod iso8601 {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(at) => serializer.serialize_some(&at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|at| at.with_timezone(&Utc))
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}
