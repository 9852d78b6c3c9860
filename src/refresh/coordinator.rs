use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use super::{RenewError, TokenRenewer};
use crate::state::{SessionBus, SessionStore};
use crate::types::SessionSignal;

type InFlight = Shared<BoxFuture<'static, Option<String>>>;

struct Inner {
    store: SessionStore,
    bus: SessionBus,
    renewer: Arc<dyn TokenRenewer>,
    in_flight: Mutex<Option<InFlight>>,
    renewals: AtomicUsize,
}

/// Single-flight credential renewal.
///
/// Concurrent callers share one in-flight renewal. The renewal runs on its
/// own task, so a caller being dropped never strands the others.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(store: SessionStore, bus: SessionBus, renewer: Arc<dyn TokenRenewer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                renewer,
                in_flight: Mutex::new(None),
                renewals: AtomicUsize::new(0),
            }),
        }
    }

    /// New access token, or `None` when the session is gone for good.
    pub async fn refresh(&self) -> Option<String> {
        let pending = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                Some(pending) => pending.clone(),
                None => {
                    let inner = self.inner.clone();
                    let task = tokio::spawn(async move {
                        let _release = ReleaseSlot(inner.clone());
                        inner.renew_once().await
                    });
                    let pending: InFlight = async move {
                        task.await.unwrap_or_else(|err| {
                            warn!(error = %err, "refresh task did not complete");
                            None
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }

    /// Number of renewal calls actually issued.
    pub fn renewal_count(&self) -> usize {
        self.inner.renewals.load(Ordering::SeqCst)
    }

    /// Clears the session and signals expiry, once per session.
    pub fn expire_session(&self) {
        self.inner.expire();
    }
}

/// Frees the in-flight slot when the renewal task ends, even by panic.
struct ReleaseSlot(Arc<Inner>);

impl Drop for ReleaseSlot {
    fn drop(&mut self) {
        *self.0.in_flight.lock() = None;
    }
}

impl Inner {
    async fn renew_once(&self) -> Option<String> {
        let result = match self.store.get_refresh() {
            Some(refresh) => {
                self.renewals.fetch_add(1, Ordering::SeqCst);
                self.renewer.renew(refresh).await
            }
            None => Err(RenewError::MissingRefreshToken),
        };

        match result {
            Ok(tokens) => {
                let access = tokens.access.clone();
                if !self.store.replace_tokens(tokens) {
                    info!("session ended while refreshing; dropping renewed credentials");
                    return None;
                }
                self.bus.emit(SessionSignal::Refreshed);
                Some(access)
            }
            Err(err) => {
                warn!(error = %err, "credential refresh failed");
                self.expire();
                None
            }
        }
    }

    fn expire(&self) {
        if self.store.clear() {
            info!("session expired");
            self.bus.emit(SessionSignal::Expired);
        }
    }
}
