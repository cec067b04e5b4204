use super::clock::Clock;
use super::scheduler::{SchedulerStatus, TimedScheduler};
use super::settings::TimedSchedulerSettings;
use crate::changes::ChangeHub;
use crate::scheduler_store::SqliteSchedulerStore;
use crate::server::metrics;
use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};

/// Owns the configured schedulers and their start/stop lifecycle.
pub struct SchedulerManager {
    schedulers: Vec<TimedScheduler>,
}

impl SchedulerManager {
    /// Create one scheduler per settings entry, resolving stable object ids
    /// from the store.
    pub fn new(
        store: Arc<SqliteSchedulerStore>,
        clock: Arc<dyn Clock>,
        settings: Vec<TimedSchedulerSettings>,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut schedulers = Vec::with_capacity(settings.len());
        for settings in settings {
            if !seen.insert(settings.name.clone()) {
                bail!("Duplicate scheduler name: {}", settings.name);
            }
            let objectid = store
                .get_object_id(&settings.name, settings.kind.class_name())
                .with_context(|| format!("Failed to get object id for {}", settings.name))?;
            info!(
                "Configured scheduler {}[{}] ({}, window {})",
                settings.name, objectid, settings.kind, settings.window
            );
            if let Some(delay) = settings.tree_stable_timer {
                info!(
                    "Scheduler {}: tree_stable_timer of {:?} is not used for timed scheduling",
                    settings.name, delay
                );
            }
            schedulers.push(TimedScheduler::new(
                settings,
                objectid,
                store.clone(),
                store.clone(),
                store.clone(),
                clock.clone(),
            ));
        }
        Ok(Self { schedulers })
    }

    pub fn schedulers(&self) -> &[TimedScheduler] {
        &self.schedulers
    }

    pub fn get(&self, name: &str) -> Option<&TimedScheduler> {
        self.schedulers.iter().find(|s| s.name() == name)
    }

    /// Subscribe every scheduler to the hub, then replay what was pending
    /// when the process last stopped. A scheduler that fails to recover is
    /// logged and keeps running.
    pub async fn start(&self, hub: &ChangeHub) {
        for scheduler in &self.schedulers {
            hub.subscribe(scheduler.clone()).await;
        }
        for scheduler in &self.schedulers {
            if let Err(e) = scheduler.scan_existing_classified_changes().await {
                error!(
                    "Error while starting scheduler {}[{}]: {:#}",
                    scheduler.name(),
                    scheduler.objectid(),
                    e
                );
            }
        }
        metrics::set_schedulers_running(self.schedulers.len());
        info!("Started {} schedulers", self.schedulers.len());
    }

    pub async fn stop(&self, hub: &ChangeHub) {
        for scheduler in &self.schedulers {
            hub.unsubscribe(scheduler.name()).await;
            scheduler.stop().await;
        }
        metrics::set_schedulers_running(0);
        info!("Stopped {} schedulers", self.schedulers.len());
    }

    pub async fn statuses(&self) -> Result<Vec<SchedulerStatus>> {
        let mut statuses = Vec::with_capacity(self.schedulers.len());
        for scheduler in &self.schedulers {
            statuses.push(scheduler.status().await?);
        }
        Ok(statuses)
    }
}
