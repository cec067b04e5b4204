use super::clock::Clock;
use super::settings::{SchedulerKind, TimedSchedulerSettings};
use super::sink::{BuildRequest, BuildRequestError, BuildRequestSink, BuildsetId};
use crate::changes::{Change, ChangeId, ChangeSource};
use crate::scheduler_store::{ClassificationStore, ObjectId};
use crate::server::metrics;
use crate::time_window::in_window;
use anyhow::{Context, Result};
use chrono::{NaiveDateTime, TimeDelta};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What happened to a change handed to [`TimedScheduler::on_change_arrived`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalOutcome {
    /// Inside the window with nothing pending: built right away.
    BuiltImmediately(BuildsetId),
    /// Recorded, and the timer (re)armed to fire at the given local time.
    Deferred { fire_at: NaiveDateTime },
    /// Recorded only; it rides along with the next triggered build.
    Recorded,
}

impl ArrivalOutcome {
    fn label(&self) -> &'static str {
        match self {
            ArrivalOutcome::BuiltImmediately(_) => "built",
            ArrivalOutcome::Deferred { .. } => "deferred",
            ArrivalOutcome::Recorded => "recorded",
        }
    }
}

/// What a scheduler did with a change offered by the change hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDisposition {
    Filtered,
    SkippedUnimportant,
    Arrived(ArrivalOutcome),
}

/// Snapshot of a scheduler for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub name: String,
    pub objectid: ObjectId,
    pub kind: SchedulerKind,
    pub window: String,
    pub armed: bool,
    pub pending_build_times: Vec<NaiveDateTime>,
    pub pending_changes: BTreeMap<ChangeId, bool>,
}

struct ArmedTimer {
    generation: u64,
    fire_at: NaiveDateTime,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TimerSlot {
    armed: Option<ArmedTimer>,
    next_generation: u64,
}

impl TimerSlot {
    fn cancel(&mut self) -> bool {
        match self.armed.take() {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }
}

struct SchedulerInner {
    settings: TimedSchedulerSettings,
    objectid: ObjectId,
    changes: Arc<dyn ChangeSource>,
    classifications: Arc<dyn ClassificationStore>,
    sink: Arc<dyn BuildRequestSink>,
    clock: Arc<dyn Clock>,
    /// Guards every read-modify-write of the timer slot and the classification store.
    slot: Mutex<TimerSlot>,
}

/// A scheduler that builds changes immediately inside its daily window and
/// coalesces everything that arrives outside it into one build when the
/// window next opens.
///
/// Cloning is cheap and every clone drives the same instance.
#[derive(Clone)]
pub struct TimedScheduler {
    inner: Arc<SchedulerInner>,
}

impl TimedScheduler {
    pub fn new(
        settings: TimedSchedulerSettings,
        objectid: ObjectId,
        changes: Arc<dyn ChangeSource>,
        classifications: Arc<dyn ClassificationStore>,
        sink: Arc<dyn BuildRequestSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                settings,
                objectid,
                changes,
                classifications,
                sink,
                clock,
                slot: Mutex::new(TimerSlot::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.settings.name
    }

    pub fn objectid(&self) -> ObjectId {
        self.inner.objectid
    }

    pub fn settings(&self) -> &TimedSchedulerSettings {
        &self.inner.settings
    }

    /// Apply this scheduler's filter and importance policy, then hand the
    /// change to the state machine.
    pub async fn got_change(&self, change: &Change) -> Result<ChangeDisposition> {
        let settings = &self.inner.settings;
        if !settings.filter.matches(change) {
            return Ok(ChangeDisposition::Filtered);
        }

        let important = settings.importance.is_important(change);
        if settings.only_important && !important {
            debug!(
                "{}[{}]: skipping unimportant change {}",
                self.name(),
                self.objectid(),
                change.id
            );
            metrics::record_change_disposition(self.name(), "skipped");
            return Ok(ChangeDisposition::SkippedUnimportant);
        }

        let outcome = self.on_change_arrived(change.id, important).await?;
        Ok(ChangeDisposition::Arrived(outcome))
    }

    /// Either build `change_id` now or record it and (re)arm the timer.
    pub async fn on_change_arrived(
        &self,
        change_id: ChangeId,
        important: bool,
    ) -> Result<ArrivalOutcome> {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;
        info!(
            "{}[{}]: got change {} (important: {})",
            self.name(),
            self.objectid(),
            change_id,
            important
        );

        let now = inner.clock.now();
        if in_window(&inner.settings.window, now) && slot.armed.is_none() {
            let buildset_id = self
                .submit_build(vec![change_id], "immediate")
                .await
                .with_context(|| format!("Failed to build change {}", change_id))?;
            let outcome = ArrivalOutcome::BuiltImmediately(buildset_id);
            metrics::record_change_disposition(self.name(), outcome.label());
            return Ok(outcome);
        }

        inner
            .classifications
            .classify_changes(inner.objectid, &BTreeMap::from([(change_id, important)]))
            .with_context(|| format!("Failed to classify change {}", change_id))?;

        if !important && slot.armed.is_none() {
            debug!(
                "{}[{}]: unimportant change {} recorded, no timer armed",
                self.name(),
                self.objectid(),
                change_id
            );
            metrics::record_change_disposition(self.name(), ArrivalOutcome::Recorded.label());
            return Ok(ArrivalOutcome::Recorded);
        }

        if slot.cancel() {
            debug!("{}[{}]: cancelling old timer", self.name(), self.objectid());
        }

        let delay = inner.settings.window.seconds_until_open(now);
        let outcome = match self.arm_timer(&mut slot, now, delay) {
            Ok(fire_at) => ArrivalOutcome::Deferred { fire_at },
            Err(e) => {
                error!(
                    "{}[{}]: failed to arm timer: {:#}",
                    self.name(),
                    self.objectid(),
                    e
                );
                ArrivalOutcome::Recorded
            }
        };
        metrics::set_timer_armed(self.name(), slot.armed.is_some());
        metrics::record_change_disposition(self.name(), outcome.label());
        Ok(outcome)
    }

    fn arm_timer(
        &self,
        slot: &mut TimerSlot,
        now: NaiveDateTime,
        delay: u64,
    ) -> Result<NaiveDateTime> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("No async runtime available to run the timer")?;

        let generation = slot.next_generation;
        slot.next_generation += 1;
        let fire_at = now + TimeDelta::seconds(delay as i64);

        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay)).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let scheduler = TimedScheduler { inner };
            if let Err(e) = scheduler.timer_fired(generation).await {
                error!(
                    "{}[{}]: error while firing timer: {:#}",
                    scheduler.name(),
                    scheduler.objectid(),
                    e
                );
            }
        });

        info!(
            "{}[{}]: timer armed for {} ({}s)",
            self.name(),
            self.objectid(),
            fire_at,
            delay
        );
        slot.armed = Some(ArmedTimer {
            generation,
            fire_at,
            handle,
        });
        Ok(fire_at)
    }

    /// Build everything classified so far and flush it. Returns the buildset
    /// id when a build was requested successfully.
    async fn timer_fired(&self, generation: u64) -> Result<Option<BuildsetId>> {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;

        match &slot.armed {
            Some(timer) if timer.generation == generation => {}
            _ => {
                debug!(
                    "{}[{}]: stale timer fired, ignoring",
                    self.name(),
                    self.objectid()
                );
                return Ok(None);
            }
        }
        slot.armed = None;
        metrics::set_timer_armed(self.name(), false);
        info!("{}[{}]: timer fired", self.name(), self.objectid());

        let classifications = inner
            .classifications
            .get_change_classifications(inner.objectid)
            .context("Failed to read change classifications")?;
        let Some(&max_change_id) = classifications.keys().next_back() else {
            warn!(
                "{}[{}]: no classifications found, nothing to build",
                self.name(),
                self.objectid()
            );
            return Ok(None);
        };

        let mut change_ids = Vec::with_capacity(classifications.len());
        for &change_id in classifications.keys() {
            let exists = inner
                .changes
                .get_change(change_id)
                .with_context(|| format!("Failed to look up change {}", change_id))?
                .is_some();
            if exists {
                debug!("{}[{}]: change {}", self.name(), self.objectid(), change_id);
                change_ids.push(change_id);
            } else {
                warn!(
                    "{}[{}]: change {} no longer exists, dropped",
                    self.name(),
                    self.objectid(),
                    change_id
                );
                metrics::record_change_dropped(self.name());
            }
        }

        if inner.settings.collapse_requests && change_ids.len() > 1 {
            change_ids.drain(..change_ids.len() - 1);
        }

        let mut buildset_id = None;
        if !change_ids.is_empty() {
            match self.submit_build(change_ids, "timer").await {
                Ok(id) => buildset_id = Some(id),
                Err(e) => error!(
                    "{}[{}]: build request failed, flushing anyway: {}",
                    self.name(),
                    self.objectid(),
                    e
                ),
            }
        }

        info!(
            "{}[{}]: flushing change ids up to {}",
            self.name(),
            self.objectid(),
            max_change_id
        );
        inner
            .classifications
            .flush_change_classifications(inner.objectid, max_change_id)
            .context("Failed to flush change classifications")?;

        Ok(buildset_id)
    }

    async fn submit_build(
        &self,
        change_ids: Vec<ChangeId>,
        path: &str,
    ) -> Result<BuildsetId, BuildRequestError> {
        let settings = &self.inner.settings;
        let request = BuildRequest {
            scheduler: settings.name.clone(),
            reason: settings.reason.clone(),
            change_ids,
            builder_names: settings.builder_names.clone(),
            properties: settings.properties.clone(),
        };
        debug!(
            "{}[{}]: requesting build for changes {:?}",
            self.name(),
            self.objectid(),
            request.change_ids
        );
        match self.inner.sink.create_build(request).await {
            Ok(id) => {
                info!(
                    "{}[{}]: buildset {} created ({})",
                    self.name(),
                    self.objectid(),
                    id,
                    path
                );
                metrics::record_build_triggered(self.name(), path);
                Ok(id)
            }
            Err(e) => {
                metrics::record_build_request_failure(self.name());
                Err(e)
            }
        }
    }

    /// Replay classified-but-unbuilt changes after a restart. Returns how many
    /// changes were replayed.
    pub async fn scan_existing_classified_changes(&self) -> Result<usize> {
        let inner = &self.inner;
        let classifications = inner
            .classifications
            .get_change_classifications(inner.objectid)
            .context("Failed to read change classifications")?;

        let mut replayed = 0;
        for (change_id, important) in classifications {
            if inner.changes.get_change(change_id)?.is_none() {
                continue;
            }
            self.on_change_arrived(change_id, important).await?;
            replayed += 1;
        }
        if replayed > 0 {
            info!(
                "{}[{}]: replayed {} pending changes",
                self.name(),
                self.objectid(),
                replayed
            );
        }
        Ok(replayed)
    }

    /// Cancel any armed timer. Pending classifications stay in the store.
    pub async fn stop(&self) {
        let mut slot = self.inner.slot.lock().await;
        if slot.cancel() {
            info!("{}[{}]: timer cancelled", self.name(), self.objectid());
        }
        metrics::set_timer_armed(self.name(), false);
    }

    /// Local time at which the armed timer fires, if any.
    pub async fn pending_build_times(&self) -> Vec<NaiveDateTime> {
        let slot = self.inner.slot.lock().await;
        slot.armed.iter().map(|t| t.fire_at).collect()
    }

    pub async fn status(&self) -> Result<SchedulerStatus> {
        let inner = &self.inner;
        let slot = inner.slot.lock().await;
        let pending_changes = inner
            .classifications
            .get_change_classifications(inner.objectid)?;
        Ok(SchedulerStatus {
            name: inner.settings.name.clone(),
            objectid: inner.objectid,
            kind: inner.settings.kind,
            window: inner.settings.window.to_string(),
            armed: slot.armed.is_some(),
            pending_build_times: slot.armed.iter().map(|t| t.fire_at).collect(),
            pending_changes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::{BranchSelection, ChangeFilter, ChangeStore, ImportancePolicy, NewChange};
    use crate::scheduler_store::SqliteSchedulerStore;
    use crate::time_window::TimeWindow;
    use crate::timed_scheduler::FakeClock;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    struct FailingSink;

    #[async_trait]
    impl BuildRequestSink for FailingSink {
        async fn create_build(
            &self,
            _request: BuildRequest,
        ) -> Result<BuildsetId, BuildRequestError> {
            Err(BuildRequestError::Other(anyhow::anyhow!("builders offline")))
        }
    }

    struct Fixture {
        store: Arc<SqliteSchedulerStore>,
        clock: Arc<FakeClock>,
        _temp_dir: TempDir,
    }

    impl Fixture {
        fn new(hour: u32, minute: u32) -> Self {
            let temp_dir = TempDir::new().unwrap();
            let store =
                Arc::new(SqliteSchedulerStore::new(temp_dir.path().join("sched.db")).unwrap());
            Self {
                store,
                clock: Arc::new(FakeClock::new(at(hour, minute))),
                _temp_dir: temp_dir,
            }
        }

        fn settings(&self, start: &str, end: &str) -> TimedSchedulerSettings {
            TimedSchedulerSettings::new("nightly", SchedulerKind::SingleBranch, vec!["b".into()])
                .with_window(TimeWindow::parse(start, end).unwrap())
        }

        fn scheduler(&self, settings: TimedSchedulerSettings) -> TimedScheduler {
            let objectid = self
                .store
                .get_object_id(&settings.name, settings.kind.class_name())
                .unwrap();
            TimedScheduler::new(
                settings,
                objectid,
                self.store.clone(),
                self.store.clone(),
                self.store.clone(),
                self.clock.clone(),
            )
        }

        fn add_change(&self) -> ChangeId {
            self.store
                .add_change(&NewChange {
                    author: "dev".into(),
                    repository: "repo".into(),
                    branch: Some("master".into()),
                    files: vec!["kernel/sched/core.c".into()],
                    ..Default::default()
                })
                .unwrap()
                .id
        }

        fn pending(&self, scheduler: &TimedScheduler) -> BTreeMap<ChangeId, bool> {
            self.store
                .get_change_classifications(scheduler.objectid())
                .unwrap()
        }
    }

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_inside_window_builds_immediately() {
        let fx = Fixture::new(10, 0);
        let scheduler = fx.scheduler(fx.settings("9:00", "17:00"));
        let id = fx.add_change();

        let outcome = scheduler.on_change_arrived(id, true).await.unwrap();

        assert!(matches!(outcome, ArrivalOutcome::BuiltImmediately(_)));
        assert!(fx.pending(&scheduler).is_empty());
        let buildsets = fx.store.get_buildsets(10).unwrap();
        assert_eq!(buildsets.len(), 1);
        assert_eq!(buildsets[0].change_ids, vec![id]);
        assert!(scheduler.pending_build_times().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_before_window_fires_when_window_opens() {
        let fx = Fixture::new(8, 0);
        let scheduler = fx.scheduler(fx.settings("9:00", "17:00"));
        let id = fx.add_change();

        let outcome = scheduler.on_change_arrived(id, true).await.unwrap();
        assert_eq!(outcome, ArrivalOutcome::Deferred { fire_at: at(9, 0) });
        assert_eq!(scheduler.pending_build_times().await, vec![at(9, 0)]);
        assert_eq!(fx.pending(&scheduler), BTreeMap::from([(id, true)]));

        tokio::time::sleep(Duration::from_secs(3599)).await;
        assert!(fx.store.get_buildsets(10).unwrap().is_empty());

        fx.clock.set(at(9, 0));
        tokio::time::sleep(Duration::from_secs(2)).await;

        let buildsets = fx.store.get_buildsets(10).unwrap();
        assert_eq!(buildsets.len(), 1);
        assert_eq!(buildsets[0].change_ids, vec![id]);
        assert!(fx.pending(&scheduler).is_empty());
        assert!(scheduler.pending_build_times().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_keeps_changes_above_batch_max() {
        let fx = Fixture::new(8, 0);
        let scheduler = fx.scheduler(fx.settings("9:00", "17:00"));
        let ids: Vec<_> = (0..4).map(|_| fx.add_change()).collect();
        for id in &ids[..3] {
            scheduler.on_change_arrived(*id, true).await.unwrap();
        }
        let generation = scheduler.inner.slot.lock().await.armed.as_ref().unwrap().generation;

        let buildset_id = scheduler.timer_fired(generation).await.unwrap().unwrap();

        // arrives after the fire read its batch
        fx.store
            .classify_changes(scheduler.objectid(), &BTreeMap::from([(ids[3], true)]))
            .unwrap();

        let buildsets = fx.store.get_buildsets(10).unwrap();
        assert_eq!(buildsets[0].id, buildset_id);
        assert_eq!(buildsets[0].change_ids, ids[..3].to_vec());
        assert_eq!(fx.pending(&scheduler), BTreeMap::from([(ids[3], true)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collapse_builds_only_latest_change() {
        let fx = Fixture::new(8, 0);
        let scheduler =
            fx.scheduler(fx.settings("9:00", "17:00").with_collapse_requests(true));
        let ids: Vec<_> = (0..3).map(|_| fx.add_change()).collect();
        for id in &ids {
            scheduler.on_change_arrived(*id, true).await.unwrap();
        }

        tokio::time::sleep(Duration::from_secs(3601)).await;

        let buildsets = fx.store.get_buildsets(10).unwrap();
        assert_eq!(buildsets.len(), 1);
        assert_eq!(buildsets[0].change_ids, vec![ids[2]]);
        assert!(fx.pending(&scheduler).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_arrivals_arm_a_single_timer() {
        let fx = Fixture::new(8, 59);
        fx.clock.set(at(8, 59) + TimeDelta::seconds(58));
        let scheduler = fx.scheduler(fx.settings("9:00", "17:00"));
        let ids: Vec<_> = (0..20).map(|_| fx.add_change()).collect();

        let tasks: Vec<_> = ids
            .iter()
            .map(|&id| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move { scheduler.on_change_arrived(id, true).await })
            })
            .collect();
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert!(matches!(outcome, ArrivalOutcome::Deferred { .. }));
        }
        assert_eq!(scheduler.pending_build_times().await.len(), 1);
        assert_eq!(fx.pending(&scheduler).len(), ids.len());

        fx.clock.set(at(9, 0));
        for _ in 0..100 {
            if !fx.store.get_buildsets(10).unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // a second build would come from a leaked timer
        tokio::time::sleep(Duration::from_millis(500)).await;
        let buildsets = fx.store.get_buildsets(10).unwrap();

        assert_eq!(buildsets.len(), 1);
        assert_eq!(buildsets[0].change_ids, ids);
        assert!(fx.pending(&scheduler).is_empty());
        assert!(scheduler.pending_build_times().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_arrival_racing_timer_fire_is_not_flushed() {
        let fx = Fixture::new(8, 0);
        let scheduler = fx.scheduler(fx.settings("9:00", "17:00"));
        let ids: Vec<_> = (0..5).map(|_| fx.add_change()).collect();
        let (batch, late) = (&ids[..4], ids[4]);
        for id in batch {
            scheduler.on_change_arrived(*id, true).await.unwrap();
        }
        let generation = scheduler.inner.slot.lock().await.armed.as_ref().unwrap().generation;

        let firing = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.timer_fired(generation).await })
        };
        let arriving = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.on_change_arrived(late, true).await })
        };
        firing.await.unwrap().unwrap();
        arriving.await.unwrap().unwrap();

        // Whichever ran first, the late change is still pending behind a timer
        // and nothing was lost.
        let pending = fx.pending(&scheduler);
        assert_eq!(pending.get(&late), Some(&true));
        assert_eq!(scheduler.pending_build_times().await, vec![at(9, 0)]);

        let mut seen: Vec<ChangeId> = fx
            .store
            .get_buildsets(10)
            .unwrap()
            .into_iter()
            .flat_map(|b| b.change_ids)
            .chain(pending.keys().copied())
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen, ids);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_arrival_keeps_one_timer_and_one_entry() {
        let fx = Fixture::new(8, 0);
        let scheduler = fx.scheduler(fx.settings("9:00", "17:00"));
        let id = fx.add_change();

        scheduler.on_change_arrived(id, true).await.unwrap();
        scheduler.on_change_arrived(id, true).await.unwrap();

        assert_eq!(scheduler.pending_build_times().await.len(), 1);
        assert_eq!(fx.pending(&scheduler).len(), 1);

        tokio::time::sleep(Duration::from_secs(3601)).await;
        let buildsets = fx.store.get_buildsets(10).unwrap();
        assert_eq!(buildsets.len(), 1);
        assert_eq!(buildsets[0].change_ids, vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unimportant_change_without_timer_only_records() {
        let fx = Fixture::new(8, 0);
        let scheduler = fx.scheduler(fx.settings("9:00", "17:00"));
        let id = fx.add_change();

        let outcome = scheduler.on_change_arrived(id, false).await.unwrap();

        assert_eq!(outcome, ArrivalOutcome::Recorded);
        assert!(scheduler.pending_build_times().await.is_empty());
        assert_eq!(fx.pending(&scheduler), BTreeMap::from([(id, false)]));

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert!(fx.store.get_buildsets(10).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unimportant_change_rides_along_with_armed_timer() {
        let fx = Fixture::new(8, 0);
        let scheduler = fx.scheduler(fx.settings("9:00", "17:00"));
        let unimportant = fx.add_change();
        let important = fx.add_change();
        let trailing = fx.add_change();

        scheduler.on_change_arrived(unimportant, false).await.unwrap();
        scheduler.on_change_arrived(important, true).await.unwrap();
        let outcome = scheduler.on_change_arrived(trailing, false).await.unwrap();
        assert!(matches!(outcome, ArrivalOutcome::Deferred { .. }));

        tokio::time::sleep(Duration::from_secs(3601)).await;
        let buildsets = fx.store.get_buildsets(10).unwrap();
        assert_eq!(buildsets.len(), 1);
        assert_eq!(
            buildsets[0].change_ids,
            vec![unimportant, important, trailing]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_inside_window_with_armed_timer_is_deferred() {
        let fx = Fixture::new(8, 0);
        let scheduler = fx.scheduler(fx.settings("9:00", "17:00"));
        let first = fx.add_change();
        let second = fx.add_change();

        scheduler.on_change_arrived(first, true).await.unwrap();
        // window open but a timer is still pending
        fx.clock.set(at(9, 0));
        let outcome = scheduler.on_change_arrived(second, true).await.unwrap();
        assert_eq!(outcome, ArrivalOutcome::Deferred { fire_at: at(9, 0) });

        tokio::time::sleep(Duration::from_secs(1)).await;
        let buildsets = fx.store.get_buildsets(10).unwrap();
        assert_eq!(buildsets.len(), 1);
        assert_eq!(buildsets[0].change_ids, vec![first, second]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_change_is_dropped_at_fire() {
        let fx = Fixture::new(8, 0);
        let scheduler = fx.scheduler(fx.settings("9:00", "17:00"));
        let ids: Vec<_> = (0..3).map(|_| fx.add_change()).collect();
        for id in &ids {
            scheduler.on_change_arrived(*id, true).await.unwrap();
        }
        fx.store.prune_changes(2).unwrap();

        tokio::time::sleep(Duration::from_secs(3601)).await;

        let buildsets = fx.store.get_buildsets(10).unwrap();
        assert_eq!(buildsets.len(), 1);
        assert_eq!(buildsets[0].change_ids, ids[1..].to_vec());
        assert!(fx.pending(&scheduler).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_changes_missing_flushes_without_build() {
        let fx = Fixture::new(8, 0);
        let scheduler = fx.scheduler(fx.settings("9:00", "17:00"));
        let gone = fx.add_change();
        scheduler.on_change_arrived(gone, true).await.unwrap();
        fx.add_change();
        fx.store.prune_changes(1).unwrap();

        tokio::time::sleep(Duration::from_secs(3601)).await;

        assert!(fx.store.get_buildsets(10).unwrap().is_empty());
        assert!(fx.pending(&scheduler).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_still_flushes() {
        let fx = Fixture::new(8, 0);
        let settings = fx.settings("9:00", "17:00");
        let objectid = fx.store.get_object_id("nightly", "TimedSingleBranchScheduler").unwrap();
        let scheduler = TimedScheduler::new(
            settings,
            objectid,
            fx.store.clone(),
            fx.store.clone(),
            Arc::new(FailingSink),
            fx.clock.clone(),
        );
        let id = fx.add_change();
        scheduler.on_change_arrived(id, true).await.unwrap();
        let generation = scheduler.inner.slot.lock().await.armed.as_ref().unwrap().generation;

        let result = scheduler.timer_fired(generation).await.unwrap();

        assert!(result.is_none());
        assert!(fx.pending(&scheduler).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_inside_window_propagates() {
        let fx = Fixture::new(10, 0);
        let scheduler = TimedScheduler::new(
            fx.settings("9:00", "17:00"),
            1,
            fx.store.clone(),
            fx.store.clone(),
            Arc::new(FailingSink),
            fx.clock.clone(),
        );
        assert!(scheduler.on_change_arrived(1, true).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_is_ignored() {
        let fx = Fixture::new(8, 0);
        let scheduler = fx.scheduler(fx.settings("9:00", "17:00"));
        let id = fx.add_change();
        scheduler.on_change_arrived(id, true).await.unwrap();
        let generation = scheduler.inner.slot.lock().await.armed.as_ref().unwrap().generation;

        assert_eq!(scheduler.timer_fired(generation + 1).await.unwrap(), None);
        assert_eq!(scheduler.pending_build_times().await.len(), 1);
        assert_eq!(fx.pending(&scheduler).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timer_and_keeps_classifications() {
        let fx = Fixture::new(8, 0);
        let scheduler = fx.scheduler(fx.settings("9:00", "17:00"));
        let id = fx.add_change();
        scheduler.on_change_arrived(id, true).await.unwrap();

        scheduler.stop().await;
        assert!(scheduler.pending_build_times().await.is_empty());

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert!(fx.store.get_buildsets(10).unwrap().is_empty());
        assert_eq!(fx.pending(&scheduler), BTreeMap::from([(id, true)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_recovers_pending_changes() {
        let fx = Fixture::new(8, 0);
        let first = fx.scheduler(fx.settings("9:00", "17:00"));
        let a = fx.add_change();
        let b = fx.add_change();
        first.on_change_arrived(a, true).await.unwrap();
        first.on_change_arrived(b, false).await.unwrap();
        first.stop().await;
        drop(first);

        fx.clock.set(at(8, 30));
        let second = fx.scheduler(fx.settings("9:00", "17:00"));
        let replayed = second.scan_existing_classified_changes().await.unwrap();
        assert_eq!(replayed, 2);
        assert_eq!(second.pending_build_times().await, vec![at(9, 0)]);

        tokio::time::sleep(Duration::from_secs(1801)).await;
        let buildsets = fx.store.get_buildsets(10).unwrap();
        assert_eq!(buildsets.len(), 1);
        assert_eq!(buildsets[0].change_ids, vec![a, b]);
        assert!(fx.pending(&second).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_skips_vanished_changes() {
        let fx = Fixture::new(8, 0);
        let scheduler = fx.scheduler(fx.settings("9:00", "17:00"));
        let gone = fx.add_change();
        let kept = fx.add_change();
        fx.store
            .classify_changes(scheduler.objectid(), &BTreeMap::from([(gone, true), (kept, true)]))
            .unwrap();
        fx.store.prune_changes(1).unwrap();

        assert_eq!(scheduler.scan_existing_classified_changes().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_inside_window_builds_each_change() {
        let fx = Fixture::new(10, 0);
        let scheduler = fx.scheduler(fx.settings("9:00", "17:00"));
        let id = fx.add_change();
        fx.store
            .classify_changes(scheduler.objectid(), &BTreeMap::from([(id, true)]))
            .unwrap();

        scheduler.scan_existing_classified_changes().await.unwrap();

        let buildsets = fx.store.get_buildsets(10).unwrap();
        assert_eq!(buildsets.len(), 1);
        assert_eq!(buildsets[0].change_ids, vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_crossing_midnight() {
        let fx = Fixture::new(23, 0);
        let scheduler = fx.scheduler(fx.settings("22:00", "6:00"));
        let id = fx.add_change();

        let outcome = scheduler.on_change_arrived(id, true).await.unwrap();
        assert!(matches!(outcome, ArrivalOutcome::BuiltImmediately(_)));

        fx.clock.set(at(12, 0));
        let id = fx.add_change();
        let outcome = scheduler.on_change_arrived(id, true).await.unwrap();
        assert_eq!(outcome, ArrivalOutcome::Deferred { fire_at: at(22, 0) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_got_change_applies_filter_and_importance() {
        let fx = Fixture::new(8, 0);
        let settings = fx
            .settings("9:00", "17:00")
            .with_filter(ChangeFilter {
                branch: BranchSelection::Exact(Some("master".into())),
                categories: None,
                repository: None,
            })
            .with_importance(ImportancePolicy::compile(&["^Documentation/"]).unwrap())
            .with_only_important(true);
        let scheduler = fx.scheduler(settings);

        let id = fx.add_change();
        let mut change = fx.store.get_change(id).unwrap().unwrap();

        change.branch = Some("next".into());
        assert_eq!(
            scheduler.got_change(&change).await.unwrap(),
            ChangeDisposition::Filtered
        );

        change.branch = Some("master".into());
        assert_eq!(
            scheduler.got_change(&change).await.unwrap(),
            ChangeDisposition::SkippedUnimportant
        );

        change.files = vec!["Documentation/index.rst".into()];
        assert!(matches!(
            scheduler.got_change(&change).await.unwrap(),
            ChangeDisposition::Arrived(ArrivalOutcome::Deferred { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_pending_state() {
        let fx = Fixture::new(8, 0);
        let scheduler = fx.scheduler(fx.settings("9:00", "17:00"));
        let id = fx.add_change();
        scheduler.on_change_arrived(id, true).await.unwrap();

        let status = scheduler.status().await.unwrap();
        assert_eq!(status.name, "nightly");
        assert!(status.armed);
        assert_eq!(status.window, "09:00:00-17:00:00");
        assert_eq!(status.pending_build_times, vec![at(9, 0)]);
        assert_eq!(status.pending_changes, BTreeMap::from([(id, true)]));
    }
}
