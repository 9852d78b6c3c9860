use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::StatusCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::frame::{decode_frame, Decoded, FrameParser, SseFrame};
use super::policy::{compute_backoff_ms, should_connect};
use crate::hub::FanoutHub;
use crate::redact::redact_secrets;
use crate::refresh::RefreshCoordinator;
use crate::settings::{SettingsStore, KEY_NOTIFICATIONS_BASE_URL};
use crate::state::SessionStore;
use crate::types::{ConnectionState, Role, Session};

pub const STREAM_PATH: &str = "/notifications/stream";
const LAST_EVENT_ID: &str = "Last-Event-ID";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub notifications_base_url: String,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub privileged_role: Role,
}

impl StreamConfig {
    pub fn from_settings(settings: &SettingsStore) -> Self {
        Self {
            notifications_base_url: settings.base_url(KEY_NOTIFICATIONS_BASE_URL),
            retry_initial_ms: settings.stream_retry_initial_ms(),
            retry_max_ms: settings.stream_retry_max_ms(),
            privileged_role: settings.privileged_role(),
        }
    }

    pub fn stream_url(&self, user_id: i64) -> String {
        format!(
            "{}{STREAM_PATH}/{}/",
            self.notifications_base_url.trim_end_matches('/'),
            urlencoding::encode(&user_id.to_string())
        )
    }
}

#[derive(Debug, Error)]
enum StreamError {
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("stream rejected ({0})")]
    Status(u16),
    #[error("stream unauthorized")]
    Unauthorized,
    #[error("session changed while streaming")]
    SessionChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    Started,
    AlreadyOpen,
    /// No session, or the identity lacks the privileged role.
    NotEligible,
}

struct Mounted {
    user_id: i64,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Inner {
    http: reqwest::Client,
    config: StreamConfig,
    store: SessionStore,
    coordinator: RefreshCoordinator,
    hub: FanoutHub,
    state: watch::Sender<ConnectionState>,
    attempts: AtomicUsize,
    mounted: Mutex<Option<Mounted>>,
}

/// Supervises the single push connection of the current privileged session.
///
/// `reqwest` has no native reconnect, so this type reconnects itself with
/// exponential backoff, honouring `retry:` and resuming from the last event id.
#[derive(Clone)]
pub struct StreamConsumer {
    inner: Arc<Inner>,
}

impl StreamConsumer {
    pub fn new(
        http: reqwest::Client,
        config: StreamConfig,
        store: SessionStore,
        coordinator: RefreshCoordinator,
        hub: FanoutHub,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                http,
                config,
                store,
                coordinator,
                hub,
                state,
                attempts: AtomicUsize::new(0),
                mounted: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Number of times the consumer entered `Connecting`.
    pub fn connection_attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub async fn mounted_user(&self) -> Option<i64> {
        self.inner.mounted.lock().await.as_ref().map(|m| m.user_id)
    }

    /// Opens the connection for the current session. A connection owned by a
    /// different identity is fully closed before the new one starts.
    pub async fn mount(&self) -> MountOutcome {
        let mut mounted = self.inner.mounted.lock().await;
        let identity = self.inner.store.identity();
        let eligible = should_connect(identity.as_ref(), &self.inner.config.privileged_role);

        if let (Some(current), Some(identity)) = (mounted.as_ref(), identity.as_ref()) {
            if eligible && current.user_id == identity.id && !current.task.is_finished() {
                return MountOutcome::AlreadyOpen;
            }
        }

        if let Some(previous) = mounted.take() {
            self.inner.close(previous).await;
        }

        let Some(identity) = identity.filter(|_| eligible) else {
            debug!("session not eligible for the notification stream");
            return MountOutcome::NotEligible;
        };

        let (shutdown, shutdown_rx) = oneshot::channel();
        let inner = self.inner.clone();
        let user_id = identity.id;
        let task = tokio::spawn(async move { inner.run(user_id, shutdown_rx).await });
        *mounted = Some(Mounted {
            user_id,
            shutdown,
            task,
        });
        MountOutcome::Started
    }

    /// Closes the connection if one is mounted. Returns whether one was.
    /// Once this returns, no further events reach the hub from it.
    pub async fn unmount(&self) -> bool {
        let previous = self.inner.mounted.lock().await.take();
        match previous {
            Some(previous) => {
                self.inner.close(previous).await;
                true
            }
            None => false,
        }
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            trace!(state = ?next, "stream state");
        }
    }

    async fn close(&self, mounted: Mounted) {
        let _ = mounted.shutdown.send(());
        if let Err(err) = mounted.task.await {
            warn!(error = %err, "stream task ended abnormally");
        }
        self.set_state(ConnectionState::Closed);
        info!(user_id = mounted.user_id, "notification stream closed");
    }

    async fn run(self: Arc<Self>, user_id: i64, shutdown: oneshot::Receiver<()>) {
        tokio::select! {
            _ = shutdown => {}
            _ = self.supervise(user_id) => {}
        }
        self.set_state(ConnectionState::Closed);
    }

    async fn supervise(&self, user_id: i64) {
        let url = self.config.stream_url(user_id);
        let mut last_event_id: Option<String> = None;
        let mut retry_base_ms = self.config.retry_initial_ms;
        let mut failures: u32 = 0;
        let mut renewed_for_stream = false;

        loop {
            let Some(access) = self.credential_for(user_id).await else {
                info!(user_id, "session ended or changed; stopping notification stream");
                return;
            };

            self.set_state(ConnectionState::Connecting);
            self.attempts.fetch_add(1, Ordering::SeqCst);

            match self.connect(&url, &access, last_event_id.as_deref()).await {
                Ok(res) => {
                    self.set_state(ConnectionState::Open);
                    info!(user_id, "notification stream open");
                    failures = 0;
                    renewed_for_stream = false;
                    match self
                        .consume(user_id, res, &mut last_event_id, &mut retry_base_ms)
                        .await
                    {
                        Ok(()) => info!(user_id, "notification stream ended by server"),
                        Err(StreamError::SessionChanged) => {
                            info!(user_id, "session changed; stopping notification stream");
                            return;
                        }
                        Err(err) => warn!(
                            user_id,
                            error = %redact_secrets(&err.to_string()),
                            "notification stream failed"
                        ),
                    }
                }
                Err(StreamError::Unauthorized) if !renewed_for_stream => {
                    renewed_for_stream = true;
                    if self.coordinator.refresh().await.is_none() {
                        info!(user_id, "stream credential rejected and renewal failed");
                        return;
                    }
                    continue;
                }
                Err(err) => warn!(
                    user_id,
                    error = %redact_secrets(&err.to_string()),
                    "notification stream connect failed"
                ),
            }

            self.set_state(ConnectionState::Errored);
            let delay = compute_backoff_ms(retry_base_ms, failures, self.config.retry_max_ms);
            failures = failures.saturating_add(1);
            debug!(user_id, delay_ms = delay, "reconnecting notification stream");
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    /// Access token for `user_id`, renewed first if expired. `None` once the
    /// session is gone, belongs to someone else, or no longer qualifies.
    async fn credential_for(&self, user_id: i64) -> Option<String> {
        let session = self.session_for(user_id)?;
        if !self.store.is_expired(&session.access_token) {
            return Some(session.access_token);
        }
        self.coordinator.refresh().await?;
        self.session_for(user_id).map(|session| session.access_token)
    }

    fn session_for(&self, user_id: i64) -> Option<Session> {
        self.store.snapshot().filter(|session| {
            session.identity.id == user_id
                && should_connect(Some(&session.identity), &self.config.privileged_role)
        })
    }

    async fn connect(
        &self,
        url: &str,
        access: &str,
        last_event_id: Option<&str>,
    ) -> Result<reqwest::Response, StreamError> {
        let mut req = self
            .http
            .get(url)
            .bearer_auth(access)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = last_event_id {
            req = req.header(LAST_EVENT_ID, id);
        }

        let res = req.send().await?;
        match res.status() {
            StatusCode::UNAUTHORIZED => Err(StreamError::Unauthorized),
            status if !status.is_success() => Err(StreamError::Status(status.as_u16())),
            _ => Ok(res),
        }
    }

    async fn consume(
        &self,
        user_id: i64,
        res: reqwest::Response,
        last_event_id: &mut Option<String>,
        retry_base_ms: &mut u64,
    ) -> Result<(), StreamError> {
        let mut parser = FrameParser::new();
        let mut body = res.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if self.session_for(user_id).is_none() {
                return Err(StreamError::SessionChanged);
            }
            for frame in parser.feed(&chunk) {
                self.handle_frame(&frame);
            }
            if let Some(retry) = parser.take_retry() {
                debug!(retry_ms = retry, "server set reconnect delay");
                *retry_base_ms = retry;
            }
            if let Some(id) = parser.last_event_id() {
                if last_event_id.as_deref() != Some(id) {
                    *last_event_id = Some(id.to_string());
                }
            }
        }
        Ok(())
    }

    fn handle_frame(&self, frame: &SseFrame) {
        match decode_frame(frame) {
            Ok(Decoded::Notification(event)) => {
                let revision = self.hub.publish(&event);
                debug!(ticket_id = event.ticket_id, revision, "notification received");
            }
            Ok(Decoded::Heartbeat) => trace!("heartbeat"),
            Ok(Decoded::Ignored(name)) => debug!(event = %name, "ignoring stream event"),
            Err(err) => warn!(
                error = %err,
                data = %redact_secrets(&frame.data),
                "dropping malformed stream event"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::{RenewError, TokenRenewer};
    use crate::state::SessionBus;
    use crate::token::encode_for_test;
    use crate::types::{Identity, TokenPair};
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use serde_json::json;

    struct NoRenew;

    impl TokenRenewer for NoRenew {
        fn renew(&self, _: String) -> BoxFuture<'static, Result<TokenPair, RenewError>> {
            async { Err(RenewError::Rejected { status: 401 }) }.boxed()
        }
    }

    fn consumer_for(role: Option<Role>) -> (StreamConsumer, FanoutHub) {
        let store = SessionStore::in_memory();
        if let Some(role) = role {
            let exp = time::OffsetDateTime::now_utc().unix_timestamp() + 3600;
            store.set(Session::new(
                TokenPair {
                    access: encode_for_test(json!({ "exp": exp })),
                    refresh: "r".to_string(),
                },
                Identity { id: 11, role },
            ));
        }
        let coordinator =
            RefreshCoordinator::new(store.clone(), SessionBus::new(), Arc::new(NoRenew));
        let hub = FanoutHub::new();
        let config = StreamConfig {
            // Port 9 (discard) on loopback; nothing in these tests should dial it.
            notifications_base_url: "http://127.0.0.1:9".to_string(),
            retry_initial_ms: 10,
            retry_max_ms: 20,
            privileged_role: Role::Admin,
        };
        let consumer = StreamConsumer::new(
            reqwest::Client::new(),
            config,
            store,
            coordinator,
            hub.clone(),
        );
        (consumer, hub)
    }

    #[test]
    fn stream_url_encodes_user_id() {
        let config = StreamConfig {
            notifications_base_url: "http://notify/".to_string(),
            retry_initial_ms: 1,
            retry_max_ms: 1,
            privileged_role: Role::Admin,
        };
        assert_eq!(config.stream_url(42), "http://notify/notifications/stream/42/");
        assert_eq!(config.stream_url(-1), "http://notify/notifications/stream/-1/");
    }

    #[tokio::test]
    async fn unprivileged_session_stays_idle() {
        let (consumer, _hub) = consumer_for(Some(Role::Customer));
        assert_eq!(consumer.mount().await, MountOutcome::NotEligible);
        assert_eq!(consumer.state(), ConnectionState::Idle);
        assert_eq!(consumer.connection_attempts(), 0);
        assert_eq!(consumer.mounted_user().await, None);
    }

    #[tokio::test]
    async fn absent_session_stays_idle() {
        let (consumer, _hub) = consumer_for(None);
        assert_eq!(consumer.mount().await, MountOutcome::NotEligible);
        assert_eq!(consumer.state(), ConnectionState::Idle);
        assert_eq!(consumer.connection_attempts(), 0);
        assert!(!consumer.unmount().await);
        assert_eq!(consumer.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn credential_is_bound_to_the_mounted_user() {
        let (consumer, _hub) = consumer_for(Some(Role::Admin));
        let access = consumer.inner.store.get_access();
        assert_eq!(consumer.inner.credential_for(11).await, access);
        assert_eq!(consumer.inner.credential_for(12).await, None);

        consumer.inner.store.set(Session::new(
            TokenPair {
                access: access.unwrap_or_default(),
                refresh: "r".to_string(),
            },
            Identity {
                id: 11,
                role: Role::Customer,
            },
        ));
        assert_eq!(consumer.inner.credential_for(11).await, None);
    }

    #[test]
    fn malformed_frames_do_not_reach_the_hub() {
        let (consumer, hub) = consumer_for(Some(Role::Admin));
        let frame = SseFrame {
            event: Some("notification".to_string()),
            data: "{oops".to_string(),
            id: None,
        };
        consumer.inner.handle_frame(&frame);
        consumer.inner.handle_frame(&SseFrame {
            data: "heartbeat".to_string(),
            ..Default::default()
        });
        assert_eq!(hub.revision(), 0);

        consumer.inner.handle_frame(&SseFrame {
            event: Some("notification".to_string()),
            data: "{\"ticket_id\": 3}".to_string(),
            id: None,
        });
        assert_eq!(hub.revision(), 1);
    }
}
