use super::models::{Change, NewChange};
use super::ChangeStore;
use crate::server::metrics;
use crate::timed_scheduler::{ChangeDisposition, TimedScheduler};
use anyhow::{Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Records incoming changes and offers each one to every subscribed scheduler.
pub struct ChangeHub {
    store: Arc<dyn ChangeStore>,
    subscribers: RwLock<Vec<TimedScheduler>>,
    /// Number of changes to keep; 0 keeps everything.
    change_horizon: usize,
}

impl ChangeHub {
    pub fn new(store: Arc<dyn ChangeStore>, change_horizon: usize) -> Self {
        Self {
            store,
            subscribers: RwLock::new(Vec::new()),
            change_horizon,
        }
    }

    pub async fn subscribe(&self, scheduler: TimedScheduler) {
        let mut subscribers = self.subscribers.write().await;
        if subscribers.iter().any(|s| s.name() == scheduler.name()) {
            warn!("Scheduler {} is already subscribed", scheduler.name());
            return;
        }
        debug!("Scheduler {} subscribed to changes", scheduler.name());
        subscribers.push(scheduler);
    }

    pub async fn unsubscribe(&self, name: &str) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let before = subscribers.len();
        subscribers.retain(|s| s.name() != name);
        subscribers.len() != before
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Record a change, then dispatch it. Returns the stored change.
    pub async fn add_change(&self, change: &NewChange) -> Result<Change> {
        let change = self
            .store
            .add_change(change)
            .context("Failed to record change")?;
        metrics::record_change_recorded();
        info!(
            "Recorded change {} on {}:{} by {}",
            change.id,
            change.repository,
            change.branch.as_deref().unwrap_or("<default>"),
            change.author
        );

        self.dispatch(&change).await;

        if self.change_horizon > 0 {
            match self.store.prune_changes(self.change_horizon) {
                Ok(0) => {}
                Ok(pruned) => {
                    debug!("Pruned {} changes beyond the horizon", pruned);
                    metrics::record_changes_pruned(pruned);
                }
                Err(e) => error!("Failed to prune changes: {:#}", e),
            }
        }

        Ok(change)
    }

    /// Offer `change` to all subscribers concurrently. A failing scheduler is
    /// logged and left out of the result.
    pub async fn dispatch(&self, change: &Change) -> Vec<(String, ChangeDisposition)> {
        let subscribers = self.subscribers.read().await.clone();
        let results = join_all(subscribers.iter().map(|scheduler| async move {
            (scheduler.name().to_string(), scheduler.got_change(change).await)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(name, result)| match result {
                Ok(disposition) => Some((name, disposition)),
                Err(e) => {
                    error!(
                        "Scheduler {} failed to handle change {}: {:#}",
                        name, change.id, e
                    );
                    None
                }
            })
            .collect()
    }
}
