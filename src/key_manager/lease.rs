// src/key_manager/lease.rs

use super::key_state::ManagedKey;
use secrecy::SecretString;
use std::sync::Arc;
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit};
use tracing::trace;

/// Release token for one selected key. Owns the shared-use gate permit and
/// the (key, model) mutex guard; both return to the pool on [`release`] or
/// drop, whichever comes first. Releasing twice is a no-op.
///
/// [`release`]: KeyLease::release
pub struct KeyLease {
    key: Arc<ManagedKey>,
    model: String,
    permit: Option<OwnedSemaphorePermit>,
    guard: Option<OwnedMutexGuard<()>>,
    released: bool,
}

impl KeyLease {
    pub(crate) fn new(
        key: Arc<ManagedKey>,
        model: String,
        permit: OwnedSemaphorePermit,
        guard: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            key,
            model,
            permit: Some(permit),
            guard: Some(guard),
            released: false,
        }
    }

    /// The credential, for handing to the transport.
    pub fn secret(&self) -> &SecretString {
        self.key.secret()
    }

    pub fn fingerprint(&self) -> &str {
        &self.key.fingerprint
    }

    pub fn preview(&self) -> &str {
        &self.key.preview
    }

    pub fn provider(&self) -> &str {
        &self.key.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub(crate) fn managed(&self) -> &Arc<ManagedKey> {
        &self.key
    }

    /// Returns the key's locks to the pool. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.guard.take();
        self.permit.take();
        self.key.note_released();
        trace!(
            key.preview = %self.key.preview,
            model = %self.model,
            "Key lease released"
        );
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for KeyLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLease")
            .field("key", &self.key.preview)
            .field("model", &self.model)
            .field("released", &self.released)
            .finish()
    }
}
