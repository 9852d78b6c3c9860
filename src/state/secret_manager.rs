use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

use crate::types::Session;

const KEYRING_SERVICE: &str = "com.softaworks.ticketsync";
pub const KEYRING_USER_SESSION: &str = "session";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("OS keychain/secret service is unavailable")]
    Unavailable,
    #[error("keychain error: {0}")]
    Keyring(String),
    #[error("stored session is not valid json")]
    Corrupt(#[from] serde_json::Error),
}

/// Persisted form of the session, read once at start-up.
pub trait SessionVault: Send + Sync {
    fn load(&self) -> Result<Option<Session>, VaultError>;
    fn store(&self, session: &Session) -> Result<(), VaultError>;
    fn delete(&self) -> Result<(), VaultError>;
}

#[derive(Clone)]
pub struct KeyringVault {
    user: &'static str,
}

impl KeyringVault {
    pub fn new(user: &'static str) -> Self {
        Self { user }
    }

    fn entry(&self) -> Result<keyring::Entry, VaultError> {
        keyring::Entry::new(KEYRING_SERVICE, self.user).map_err(map_keyring_error)
    }
}

fn map_keyring_error(err: keyring::Error) -> VaultError {
    match err {
        keyring::Error::NoStorageAccess(_) | keyring::Error::PlatformFailure(_) => {
            VaultError::Unavailable
        }
        other => VaultError::Keyring(other.to_string()),
    }
}

impl SessionVault for KeyringVault {
    fn load(&self) -> Result<Option<Session>, VaultError> {
        let entry = self.entry()?;
        match entry.get_password() {
            Ok(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                Ok(Some(serde_json::from_str(trimmed)?))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(map_keyring_error(err)),
        }
    }

    fn store(&self, session: &Session) -> Result<(), VaultError> {
        let raw = serde_json::to_string(session)?;
        self.entry()?.set_password(&raw).map_err(map_keyring_error)
    }

    fn delete(&self) -> Result<(), VaultError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(map_keyring_error(err)),
        }
    }
}

/// Vault for headless embeddings and tests; nothing outlives the process.
#[derive(Clone, Default)]
pub struct MemoryVault {
    slot: Arc<Mutex<Option<String>>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: &Session) -> Self {
        let vault = Self::new();
        *vault.slot.lock() = serde_json::to_string(session).ok();
        vault
    }

    /// Raw persisted value, for corrupt-state tests.
    pub fn with_raw(raw: &str) -> Self {
        let vault = Self::new();
        *vault.slot.lock() = Some(raw.to_string());
        vault
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl SessionVault for MemoryVault {
    fn load(&self) -> Result<Option<Session>, VaultError> {
        match self.slot.lock().as_deref() {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn store(&self, session: &Session) -> Result<(), VaultError> {
        *self.slot.lock() = Some(serde_json::to_string(session)?);
        Ok(())
    }

    fn delete(&self) -> Result<(), VaultError> {
        *self.slot.lock() = None;
        Ok(())
    }
}
