//! Fan-out of stream events to independent observers.
//!
//! Global observers see every event together with the new revision number.
//! At most one scoped observer is registered at a time; it only sees events
//! for its ticket.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

use crate::types::NotificationEvent;

pub type GlobalCallback = Arc<dyn Fn(u64, &NotificationEvent) + Send + Sync>;
pub type ScopedCallback = Arc<dyn Fn(&NotificationEvent) + Send + Sync>;

struct GlobalEntry {
    id: u64,
    active: Arc<AtomicBool>,
    callback: GlobalCallback,
}

struct ScopedEntry {
    id: u64,
    ticket_id: i64,
    active: Arc<AtomicBool>,
    callback: ScopedCallback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    globals: Vec<GlobalEntry>,
    scoped: Option<ScopedEntry>,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct Inner {
    registry: Mutex<Registry>,
    revision: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct FanoutHub {
    inner: Arc<Inner>,
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new()
    }
}

impl FanoutHub {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                revision,
            }),
        }
    }

    /// Bumps the revision and notifies observers, in that order. Returns the
    /// new revision.
    pub fn publish(&self, event: &NotificationEvent) -> u64 {
        let mut revision = 0;
        self.inner.revision.send_modify(|r| {
            *r += 1;
            revision = *r;
        });

        // Callbacks run outside the lock so they may (un)subscribe.
        let (globals, scoped) = {
            let registry = self.inner.registry.lock();
            let globals: Vec<(Arc<AtomicBool>, GlobalCallback)> = registry
                .globals
                .iter()
                .map(|g| (g.active.clone(), g.callback.clone()))
                .collect();
            let scoped = registry
                .scoped
                .as_ref()
                .filter(|s| s.ticket_id == event.ticket_id)
                .map(|s| (s.active.clone(), s.callback.clone()));
            (globals, scoped)
        };

        for (active, callback) in globals {
            if active.load(Ordering::SeqCst) {
                callback(revision, event);
            }
        }
        if let Some((active, callback)) = scoped {
            if active.load(Ordering::SeqCst) {
                callback(event);
            }
        }
        revision
    }

    pub fn revision(&self) -> u64 {
        *self.inner.revision.borrow()
    }

    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    pub fn subscribe_global<F>(&self, on_change: F) -> Subscription
    where
        F: Fn(u64, &NotificationEvent) + Send + Sync + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let id = {
            let mut registry = self.inner.registry.lock();
            let id = registry.next_id();
            registry.globals.push(GlobalEntry {
                id,
                active: active.clone(),
                callback: Arc::new(on_change),
            });
            id
        };
        Subscription {
            hub: Arc::downgrade(&self.inner),
            id,
            kind: Kind::Global,
            active,
        }
    }

    /// Registers the scoped observer for `ticket_id`, replacing any previous one.
    pub fn subscribe_scoped<F>(&self, ticket_id: i64, on_match: F) -> Subscription
    where
        F: Fn(&NotificationEvent) + Send + Sync + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let id = {
            let mut registry = self.inner.registry.lock();
            let id = registry.next_id();
            let previous = registry.scoped.replace(ScopedEntry {
                id,
                ticket_id,
                active: active.clone(),
                callback: Arc::new(on_match),
            });
            if let Some(previous) = previous {
                previous.active.store(false, Ordering::SeqCst);
                tracing::debug!(
                    previous = previous.ticket_id,
                    ticket_id,
                    "scoped subscription replaced"
                );
            }
            id
        };
        Subscription {
            hub: Arc::downgrade(&self.inner),
            id,
            kind: Kind::Scoped,
            active,
        }
    }

    pub fn global_count(&self) -> usize {
        self.inner.registry.lock().globals.len()
    }

    pub fn scoped_ticket(&self) -> Option<i64> {
        self.inner.registry.lock().scoped.as_ref().map(|s| s.ticket_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Global,
    Scoped,
}

/// Registration handle. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    hub: Weak<Inner>,
    id: u64,
    kind: Kind,
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn unsubscribe(self) {}

    fn remove(&self) {
        self.active.store(false, Ordering::SeqCst);
        let Some(inner) = self.hub.upgrade() else {
            return;
        };
        let mut registry = inner.registry.lock();
        match self.kind {
            Kind::Global => registry.globals.retain(|g| g.id != self.id),
            Kind::Scoped => {
                if registry.scoped.as_ref().is_some_and(|s| s.id == self.id) {
                    registry.scoped = None;
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}
