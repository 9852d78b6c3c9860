//! Lifetime scope for one mounted view.

use std::future::Future;
use tokio::task::{AbortHandle, JoinSet};

use crate::hub::{FanoutHub, Subscription};
use crate::types::NotificationEvent;

/// Owns what a view started: its scoped subscription and any requests still in
/// flight. Closing or dropping the scope releases all of it.
#[derive(Default)]
pub struct ViewScope {
    subscription: Option<Subscription>,
    tasks: JoinSet<()>,
}

impl ViewScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scoped subscription for a detail view. Replaces the one this scope held.
    pub fn watch_ticket<F>(&mut self, hub: &FanoutHub, ticket_id: i64, on_match: F)
    where
        F: Fn(&NotificationEvent) + Send + Sync + 'static,
    {
        self.subscription = Some(hub.subscribe_scoped(ticket_id, on_match));
    }

    pub fn is_watching(&self) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(Subscription::is_active)
    }

    /// Runs `fut` until it completes or the scope closes.
    pub fn spawn<F>(&mut self, fut: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Reap finished tasks so long-lived views don't accumulate them.
        while self.tasks.try_join_next().is_some() {}
        self.tasks.spawn(fut)
    }

    pub fn outstanding(&self) -> usize {
        self.tasks.len()
    }

    /// Unsubscribes and aborts everything still running.
    pub fn close(&mut self) {
        self.subscription.take();
        self.tasks.abort_all();
    }
}

impl Drop for ViewScope {
    fn drop(&mut self) {
        self.close();
    }
}
