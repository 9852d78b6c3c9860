use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError, AuthApi, RegisterRequest, Service, ServiceUrls};
use crate::hub::FanoutHub;
use crate::refresh::{HttpRenewer, RefreshCoordinator};
use crate::settings::SettingsStore;
use crate::state::{KeyringVault, SessionBus, SessionStore, SessionVault, KEYRING_USER_SESSION};
use crate::stream::{MountOutcome, StreamConfig, StreamConsumer};
use crate::types::{Identity, SessionSignal};

/// Top-level owner of the session and the stream lifecycle. One per process.
pub struct App {
    settings: SettingsStore,
    store: SessionStore,
    bus: SessionBus,
    coordinator: RefreshCoordinator,
    api: ApiClient,
    auth: AuthApi,
    hub: FanoutHub,
    stream: StreamConsumer,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl App {
    /// Persists the session to the OS keychain when `rememberSession` is on.
    pub fn new(settings: SettingsStore) -> reqwest::Result<Self> {
        let vault: Option<Arc<dyn SessionVault>> = if settings.remember_session() {
            Some(Arc::new(KeyringVault::new(KEYRING_USER_SESSION)))
        } else {
            None
        };
        Self::with_vault(settings, vault)
    }

    pub fn with_vault(
        settings: SettingsStore,
        vault: Option<Arc<dyn SessionVault>>,
    ) -> reqwest::Result<Self> {
        let http = settings.http_client()?;
        let timeout = settings.request_timeout();
        let urls = ServiceUrls::from_settings(&settings);

        let store = match vault {
            Some(vault) => SessionStore::with_vault(vault, settings.expiry_skew_seconds()),
            None => SessionStore::in_memory(),
        };
        let bus = SessionBus::new();
        let renewer = HttpRenewer::new(http.clone(), urls.base(Service::Users), timeout);
        let coordinator = RefreshCoordinator::new(store.clone(), bus.clone(), Arc::new(renewer));
        let api = ApiClient::new(
            http.clone(),
            urls.clone(),
            store.clone(),
            coordinator.clone(),
            timeout,
        );
        let auth = AuthApi::new(http.clone(), urls, store.clone(), bus.clone(), timeout);
        let hub = FanoutHub::new();
        let stream = StreamConsumer::new(
            http,
            StreamConfig::from_settings(&settings),
            store.clone(),
            coordinator.clone(),
            hub.clone(),
        );

        Ok(Self {
            settings,
            store,
            bus,
            coordinator,
            api,
            auth,
            hub,
            stream,
            supervisor: Mutex::new(None),
        })
    }

    /// Hydrates the session, starts listening for session signals and opens
    /// the stream if the restored session qualifies.
    pub async fn start(&self) -> MountOutcome {
        match self.store.hydrate() {
            Some(identity) => info!(
                user_id = identity.id,
                role = identity.role.as_str(),
                "starting with restored session"
            ),
            None => info!("starting signed out"),
        }
        self.spawn_supervisor();
        self.stream.mount().await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Identity, ApiError> {
        let identity = self.auth.login(username, password).await?;
        self.remount().await;
        Ok(identity)
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<Identity, ApiError> {
        let identity = self.auth.register(request).await?;
        self.remount().await;
        Ok(identity)
    }

    pub async fn sign_out(&self) {
        let removed = self.store.clear();
        self.stream.unmount().await;
        if removed {
            info!("signed out");
        }
        self.bus.emit(SessionSignal::SignedOut);
    }

    /// Closes the stream and stops the signal supervisor. The session is kept.
    pub async fn shutdown(&self) {
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }
        self.stream.unmount().await;
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn bus(&self) -> &SessionBus {
        &self.bus
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn hub(&self) -> &FanoutHub {
        &self.hub
    }

    pub fn stream(&self) -> &StreamConsumer {
        &self.stream
    }

    async fn remount(&self) {
        let outcome = self.stream.mount().await;
        debug!(?outcome, "stream remounted after sign-in");
    }

    fn spawn_supervisor(&self) {
        let mut slot = self.supervisor.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let mut signals = self.bus.subscribe();
        let store = self.store.clone();
        let stream = self.stream.clone();
        *slot = Some(tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(SessionSignal::Expired | SessionSignal::SignedOut) => {
                        // A sign-in may have landed since the signal was sent.
                        if !store.is_present() && stream.unmount().await {
                            info!("session ended; notification stream torn down");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session signal supervisor lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }
}

impl Drop for App {
    fn drop(&mut self) {
        if let Some(task) = self.supervisor.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryVault;
    use crate::token::encode_for_test;
    use crate::types::{ConnectionState, Role, Session, TokenPair};
    use serde_json::{json, Map};

    fn settings() -> SettingsStore {
        let mut overrides = Map::new();
        for key in [
            crate::settings::KEY_TICKETS_BASE_URL,
            crate::settings::KEY_NOTIFICATIONS_BASE_URL,
            crate::settings::KEY_ASSIGNMENTS_BASE_URL,
            crate::settings::KEY_USERS_BASE_URL,
        ] {
            overrides.insert(key.to_string(), json!("http://127.0.0.1:9"));
        }
        SettingsStore::from_map(overrides)
    }

    fn persisted(role: Role) -> MemoryVault {
        let exp = time::OffsetDateTime::now_utc().unix_timestamp() + 3600;
        MemoryVault::with_session(&Session::new(
            TokenPair {
                access: encode_for_test(json!({ "exp": exp })),
                refresh: "r".to_string(),
            },
            Identity { id: 5, role },
        ))
    }

    #[tokio::test]
    async fn start_restores_session_without_stream_for_customers() {
        let vault = persisted(Role::Customer);
        let app = App::with_vault(settings(), Some(Arc::new(vault))).unwrap();

        assert_eq!(app.start().await, MountOutcome::NotEligible);
        assert_eq!(app.store().identity().map(|i| i.id), Some(5));
        assert_eq!(app.stream().state(), ConnectionState::Idle);
        assert_eq!(app.stream().connection_attempts(), 0);
    }

    #[tokio::test]
    async fn sign_out_clears_vault_and_signals() {
        let vault = persisted(Role::Customer);
        let app = App::with_vault(settings(), Some(Arc::new(vault.clone()))).unwrap();
        app.start().await;
        let mut signals = app.bus().subscribe();

        app.sign_out().await;

        assert!(!app.store().is_present());
        assert!(vault.is_empty());
        assert_eq!(signals.recv().await.unwrap(), SessionSignal::SignedOut);
    }
}
