mod secret_manager;
mod session_bus;
mod session_store;

pub use secret_manager::{KeyringVault, MemoryVault, SessionVault, VaultError, KEYRING_USER_SESSION};
pub use session_bus::SessionBus;
pub use session_store::SessionStore;
