//! Short human-readable codes printed next to the QR image.

use std::sync::Arc;

use rand::{rngs::OsRng, Rng};
use uuid::Uuid;

use super::CodecError;
use crate::store::{CodeRegistry, StoreError};

pub const DISPLAY_CODE_PREFIX: &str = "MT";

/// No `0`/`O` or `1`/`I`: codes get read aloud and typed in by hand.
pub const DISPLAY_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const DISPLAY_CODE_BLOCK_LEN: usize = 4;

pub const MAX_ALLOCATION_ATTEMPTS: u32 = 25;

/// Draws a candidate of the form `MT-XXXX-XXXX`. Uniqueness is not checked.
pub fn random_display_code() -> String {
    let mut rng = OsRng;
    let mut block = || -> String {
        (0..DISPLAY_CODE_BLOCK_LEN)
            .map(|_| char::from(DISPLAY_CODE_ALPHABET[rng.gen_range(0..DISPLAY_CODE_ALPHABET.len())]))
            .collect()
    };
    let first = block();
    let second = block();
    format!("{DISPLAY_CODE_PREFIX}-{first}-{second}")
}

/// True when `code` has the `MT-XXXX-XXXX` shape over the display alphabet.
pub fn is_well_formed(code: &str) -> bool {
    let mut parts = code.split('-');
    let (Some(prefix), Some(first), Some(second), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    let block_ok = |block: &str| {
        block.len() == DISPLAY_CODE_BLOCK_LEN
            && block.bytes().all(|b| DISPLAY_CODE_ALPHABET.contains(&b))
    };

    prefix == DISPLAY_CODE_PREFIX && block_ok(first) && block_ok(second)
}

/// Hands out display codes that were never used before, retired ones included.
#[derive(Clone)]
pub struct DisplayCodeAllocator {
    registry: Arc<dyn CodeRegistry>,
    max_attempts: u32,
}

impl DisplayCodeAllocator {
    pub fn new(registry: Arc<dyn CodeRegistry>) -> Self {
        Self {
            registry,
            max_attempts: MAX_ALLOCATION_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Allocates and claims a fresh code for `ticket_id`.
    pub async fn allocate(&self, ticket_id: Uuid) -> Result<String, CodecError> {
        for attempt in 1..=self.max_attempts {
            let candidate = random_display_code();

            if self.registry.exists(&candidate).await? {
                tracing::debug!(attempt, "Display code collision, retrying");
                continue;
            }

            match self.registry.claim(&candidate, ticket_id).await {
                Ok(()) => return Ok(candidate),
                // lost a race with a concurrent allocation
                Err(StoreError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        tracing::error!(
            attempts = self.max_attempts,
            %ticket_id,
            "Display code namespace exhausted"
        );
        Err(CodecError::DisplayCodeExhausted {
            attempts: self.max_attempts,
        })
    }
}
