//! # Signature Cache
//!
//! Makes extended-thinking signatures portable across providers within a
//! model group: a thinking block signed by one `claude-*` model can be
//! re-validated by any other `claude-*` model, but not by a `gpt-*` one.
//! Backed by the [`Cache`] abstraction so a distributed deployment shares
//! signatures across instances.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{hash_content, Cache};
use crate::error::CoreError;
use crate::models::model_group;

/// Thinking-block signatures survive for 3 hours: long enough to span a
/// multi-turn conversation, short enough that a signing key rotation
/// upstream doesn't leave stale signatures circulating indefinitely.
const SIGNATURE_TTL: Duration = Duration::from_secs(3 * 60 * 60);

pub struct SignatureCache {
    backend: Arc<dyn Cache>,
}

impl SignatureCache {
    pub fn new(backend: Arc<dyn Cache>) -> Self {
        Self { backend }
    }

    fn key(model: &str, thinking_text: &str) -> String {
        let group = model_group(model);
        let hash = hash_content(thinking_text);
        format!("sig:{group}:{hash:x}")
    }

    /// Look up a signature for `thinking_text` within `model`'s group.
    pub async fn get(&self, model: &str, thinking_text: &str) -> Result<Option<String>, CoreError> {
        let key = Self::key(model, thinking_text);
        let raw = self.backend.get(&key).await?;
        Ok(raw.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Record `signature` for `thinking_text` within `model`'s group, valid
    /// for 3 hours.
    pub async fn set(&self, model: &str, thinking_text: &str, signature: &str) -> Result<(), CoreError> {
        let key = Self::key(model, thinking_text);
        self.backend
            .set_with_ttl(&key, signature.as_bytes().to_vec(), SIGNATURE_TTL)
            .await
    }
}
