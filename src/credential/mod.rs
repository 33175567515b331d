//! Signed ticket credentials.
//!
//! A payload is `base64url(json) "." base64url(hmac_sha256(json))`, both segments
//! unpadded. Verification is all-or-nothing: callers only ever learn "valid" or not.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::{ConfigError, SigningSecret};
use crate::models::{Ticket, TicketCredential, CREDENTIAL_VERSION};
use crate::store::StoreError;

pub mod display_code;

pub use display_code::DisplayCodeAllocator;

type HmacSha256 = Hmac<Sha256>;

/// Bytes of randomness mixed into every credential.
pub const NONCE_BYTES: usize = 16;

const SEPARATOR: char = '.';

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("display code allocation exhausted after {attempts} attempts")]
    DisplayCodeExhausted { attempts: u32 },

    #[error("credential serialization failed")]
    Serialization(#[from] serde_json::Error),

    #[error("code registry error")]
    Store(#[from] StoreError),
}

/// A freshly signed credential, ready to be rendered as a QR image.
#[derive(Debug, Clone)]
pub struct SignedCredential {
    pub payload: String,
    pub display_code: String,
}

#[derive(Clone)]
pub struct CredentialCodec {
    keyed: HmacSha256,
}

impl std::fmt::Debug for CredentialCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCodec").finish_non_exhaustive()
    }
}

impl CredentialCodec {
    pub fn new(secret: &SigningSecret) -> Result<Self, ConfigError> {
        let keyed =
            HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| ConfigError::Invalid {
                name: "QR_SIGNING_SECRET",
                value: "**redacted**".to_string(),
            })?;
        Ok(Self { keyed })
    }

    /// Allocates a display code and signs a new credential for `ticket`.
    pub async fn generate(
        &self,
        ticket: &Ticket,
        allocator: &DisplayCodeAllocator,
    ) -> Result<SignedCredential, CodecError> {
        let display_code = allocator.allocate(ticket.id).await?;
        let credential = TicketCredential {
            version: CREDENTIAL_VERSION,
            ticket_id: ticket.id,
            event_id: ticket.event_id,
            tenant_id: ticket.tenant_id,
            display_code,
            issued_at: ticket.issued_at,
            expires_at: ticket.expires_at,
            nonce: fresh_nonce(),
        };
        let payload = self.sign(&credential)?;

        Ok(SignedCredential {
            payload,
            display_code: credential.display_code,
        })
    }

    /// Serializes and signs an already-built credential.
    pub fn sign(&self, credential: &TicketCredential) -> Result<String, CodecError> {
        let data = serde_json::to_vec(credential)?;
        let signature = self.mac(&data).finalize().into_bytes();

        Ok(format!(
            "{}{SEPARATOR}{}",
            URL_SAFE_NO_PAD.encode(&data),
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    pub fn verify(&self, payload: &str) -> bool {
        self.verified_data(payload).is_some()
    }

    /// Returns the credential only if the payload is well formed and correctly signed.
    pub fn decode(&self, payload: &str) -> Option<TicketCredential> {
        let data = self.verified_data(payload)?;
        let credential: TicketCredential = serde_json::from_slice(&data).ok()?;
        (credential.version == CREDENTIAL_VERSION).then_some(credential)
    }

    fn verified_data(&self, payload: &str) -> Option<Vec<u8>> {
        let (data_segment, signature_segment) = payload.split_once(SEPARATOR)?;
        if data_segment.is_empty()
            || signature_segment.is_empty()
            || signature_segment.contains(SEPARATOR)
        {
            return None;
        }

        let data = URL_SAFE_NO_PAD.decode(data_segment).ok()?;
        let signature = URL_SAFE_NO_PAD.decode(signature_segment).ok()?;

        // verify_slice compares in constant time
        self.mac(&data).verify_slice(&signature).ok()?;
        Some(data)
    }

    fn mac(&self, data: &[u8]) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(data);
        mac
    }
}

fn fresh_nonce() -> String {
    let mut nonce = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);
    URL_SAFE_NO_PAD.encode(nonce)
}

/// Hex SHA-256 of a raw payload, used to key attempts that never resolved to a ticket.
pub fn payload_hash(payload: &str) -> String {
    format!("{:x}", Sha256::digest(payload.as_bytes()))
}

/// Expiry carried inside the credential, if any, has passed at `at`.
pub fn credential_expired_at(credential: &TicketCredential, at: DateTime<Utc>) -> bool {
    credential.expires_at.is_some_and(|exp| exp < at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TicketStatus;
    use crate::store::MemoryStore;
    use chrono::Duration;
    use proptest::prelude::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn codec() -> CredentialCodec {
        CredentialCodec::new(&SigningSecret::new("test-signing-secret").unwrap()).unwrap()
    }

    fn ticket() -> Ticket {
        Ticket {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            tenant_id: Some(Uuid::new_v4()),
            guest_id: None,
            status: TicketStatus::Issued,
            issued_at: Some(Utc::now()),
            expires_at: Some(Utc::now() + Duration::days(1)),
            display_code: None,
        }
    }

    async fn generate(codec: &CredentialCodec) -> (Ticket, SignedCredential) {
        let allocator = DisplayCodeAllocator::new(Arc::new(MemoryStore::new()));
        let ticket = ticket();
        let signed = codec.generate(&ticket, &allocator).await.unwrap();
        (ticket, signed)
    }

    #[tokio::test]
    async fn test_generated_payload_verifies_and_decodes() {
        let codec = codec();
        let (ticket, signed) = generate(&codec).await;

        assert!(codec.verify(&signed.payload));
        let credential = codec.decode(&signed.payload).unwrap();
        assert_eq!(credential.ticket_id, ticket.id);
        assert_eq!(credential.event_id, ticket.event_id);
        assert_eq!(credential.tenant_id, ticket.tenant_id);
        assert_eq!(credential.display_code, signed.display_code);
        assert_eq!(credential.version, CREDENTIAL_VERSION);
    }

    #[tokio::test]
    async fn test_payload_segments_are_unpadded_base64url() {
        let codec = codec();
        let (_, signed) = generate(&codec).await;

        assert_eq!(signed.payload.matches('.').count(), 1);
        assert!(signed
            .payload
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'));
    }

    #[tokio::test]
    async fn test_identical_tickets_get_distinct_payloads() {
        let codec = codec();
        let ticket = ticket();
        let credential = TicketCredential {
            version: CREDENTIAL_VERSION,
            ticket_id: ticket.id,
            event_id: ticket.event_id,
            tenant_id: None,
            display_code: "MT-AAAA-BBBB".to_string(),
            issued_at: None,
            expires_at: None,
            nonce: fresh_nonce(),
        };
        let other = TicketCredential {
            nonce: fresh_nonce(),
            ..credential.clone()
        };

        assert_ne!(codec.sign(&credential).unwrap(), codec.sign(&other).unwrap());
    }

    #[tokio::test]
    async fn test_other_secret_rejects_payload() {
        let (_, signed) = generate(&codec()).await;
        let other = CredentialCodec::new(&SigningSecret::new("another-secret").unwrap()).unwrap();

        assert!(!other.verify(&signed.payload));
        assert!(other.decode(&signed.payload).is_none());
    }

    #[test]
    fn test_structural_garbage_is_rejected() {
        let codec = codec();
        for payload in [
            "",
            ".",
            "abc",
            "abc.",
            ".abc",
            "a.b.c",
            "!!!.???",
            "eyJ2IjoxfQ.c2ln.extra",
        ] {
            assert!(!codec.verify(payload), "{:?} verified", payload);
            assert!(codec.decode(payload).is_none());
        }
    }

    #[test]
    fn test_signed_but_unparseable_data_is_rejected() {
        let codec = codec();
        let data = b"not json at all";
        let signature = codec.mac(data).finalize().into_bytes();
        let payload = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(data),
            URL_SAFE_NO_PAD.encode(signature)
        );

        assert!(codec.verify(&payload));
        assert!(codec.decode(&payload).is_none());
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let codec = codec();
        let credential = TicketCredential {
            version: 2,
            ticket_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            tenant_id: None,
            display_code: "MT-AAAA-BBBB".to_string(),
            issued_at: None,
            expires_at: None,
            nonce: fresh_nonce(),
        };
        let payload = codec.sign(&credential).unwrap();

        assert!(codec.decode(&payload).is_none());
    }

    fn signed_payload(codec: &CredentialCodec) -> String {
        codec
            .sign(&TicketCredential {
                version: CREDENTIAL_VERSION,
                ticket_id: Uuid::new_v4(),
                event_id: Uuid::new_v4(),
                tenant_id: Some(Uuid::new_v4()),
                display_code: "MT-AAAA-BBBB".to_string(),
                issued_at: Some(Utc::now()),
                expires_at: None,
                nonce: fresh_nonce(),
            })
            .unwrap()
    }

    proptest! {
        #[test]
        fn test_decode_never_panics_on_arbitrary_input(input in any::<String>()) {
            let codec = codec();
            prop_assert!(!codec.verify(&input));
            prop_assert!(codec.decode(&input).is_none());
        }

        #[test]
        fn test_dotted_noise_is_rejected(input in "[A-Za-z0-9_-]{0,64}\\.[A-Za-z0-9_-]{0,64}") {
            let codec = codec();
            prop_assert!(!codec.verify(&input));
            prop_assert!(codec.decode(&input).is_none());
        }

        #[test]
        fn test_any_byte_flip_breaks_verification(
            position in any::<prop::sample::Index>(),
            mask in 1u8..=u8::MAX,
        ) {
            let codec = codec();
            let mut tampered = signed_payload(&codec).into_bytes();
            let at = position.index(tampered.len());
            tampered[at] ^= mask;

            if let Ok(tampered) = String::from_utf8(tampered) {
                prop_assert!(!codec.verify(&tampered), "flip at {} with mask {:#x} still verified", at, mask);
                prop_assert!(codec.decode(&tampered).is_none());
            }
        }
    }

    #[tokio::test]
    async fn test_truncated_payloads_are_rejected() {
        let codec = codec();
        let (_, signed) = generate(&codec).await;

        for cut in 0..signed.payload.len() {
            assert!(codec.decode(&signed.payload[..cut]).is_none());
        }
    }

    #[test]
    fn test_payload_hash_is_hex_sha256() {
        let hash = payload_hash("anything");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, payload_hash("anything"));
    }
}
