use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::SessionVault;
use crate::token;
use crate::types::{Identity, Session, TokenPair};

struct Inner {
    current: RwLock<Option<Session>>,
    vault: Option<Arc<dyn SessionVault>>,
    skew_seconds: i64,
}

/// Sole owner of the session. Clones share the same state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl SessionStore {
    /// Store without a persisted form.
    pub fn in_memory() -> Self {
        Self::build(None, 0)
    }

    pub fn with_vault(vault: Arc<dyn SessionVault>, skew_seconds: i64) -> Self {
        Self::build(Some(vault), skew_seconds)
    }

    fn build(vault: Option<Arc<dyn SessionVault>>, skew_seconds: i64) -> Self {
        Self {
            inner: Arc::new(Inner {
                current: RwLock::new(None),
                vault,
                skew_seconds,
            }),
        }
    }

    /// Loads whatever the vault holds. A corrupt or unreadable entry leaves the
    /// store empty; a corrupt entry is also deleted.
    pub fn hydrate(&self) -> Option<Identity> {
        let Some(vault) = &self.inner.vault else {
            return self.identity();
        };

        let loaded = match vault.load() {
            Ok(session) => session,
            Err(super::VaultError::Corrupt(err)) => {
                warn!(error = %err, "discarding unreadable persisted session");
                if let Err(err) = vault.delete() {
                    warn!(error = %err, "failed to delete persisted session");
                }
                None
            }
            Err(err) => {
                warn!(error = %err, "failed to read persisted session");
                None
            }
        };

        let identity = loaded.as_ref().map(|s| s.identity.clone());
        *self.inner.current.write() = loaded;
        match &identity {
            Some(identity) => info!(user_id = identity.id, "session hydrated"),
            None => debug!("no persisted session"),
        }
        identity
    }

    pub fn get_access(&self) -> Option<String> {
        self.inner
            .current
            .read()
            .as_ref()
            .map(|s| s.access_token.clone())
    }

    pub fn get_refresh(&self) -> Option<String> {
        self.inner
            .current
            .read()
            .as_ref()
            .map(|s| s.refresh_token.clone())
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner
            .current
            .read()
            .as_ref()
            .map(|s| s.identity.clone())
    }

    pub fn snapshot(&self) -> Option<Session> {
        self.inner.current.read().clone()
    }

    pub fn is_present(&self) -> bool {
        self.inner.current.read().is_some()
    }

    /// Replaces the session wholesale.
    ///
    /// Vault I/O happens under the write guard in every mutator, so memory and
    /// the persisted copy never disagree after a concurrent `clear`.
    pub fn set(&self, session: Session) {
        let mut guard = self.inner.current.write();
        if let Some(vault) = &self.inner.vault {
            if let Err(err) = vault.store(&session) {
                warn!(error = %err, "failed to persist session");
            }
        }
        *guard = Some(session);
    }

    /// Swaps the credential pair and keeps the identity. Returns false when
    /// the session was cleared in the meantime, in which case nothing is stored.
    pub fn replace_tokens(&self, tokens: TokenPair) -> bool {
        let mut guard = self.inner.current.write();
        let Some(current) = guard.as_mut() else {
            return false;
        };
        current.access_token = tokens.access;
        current.refresh_token = tokens.refresh;
        if let Some(vault) = &self.inner.vault {
            if let Err(err) = vault.store(current) {
                warn!(error = %err, "failed to persist refreshed session");
            }
        }
        true
    }

    /// Idempotent. Returns whether a session was actually removed.
    pub fn clear(&self) -> bool {
        let previous = {
            let mut guard = self.inner.current.write();
            if let Some(vault) = &self.inner.vault {
                if let Err(err) = vault.delete() {
                    warn!(error = %err, "failed to delete persisted session");
                }
            }
            guard.take()
        };
        match previous {
            Some(previous) => {
                debug!(user_id = previous.identity.id, "session cleared");
                true
            }
            None => false,
        }
    }

    pub fn is_expired(&self, token: &str) -> bool {
        token::is_expired(token, self.inner.skew_seconds)
    }
}
