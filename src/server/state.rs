use crate::timed_scheduler::SchedulerManager;
use std::sync::Arc;
use std::time::Instant;

pub type GuardedSchedulerManager = Arc<SchedulerManager>;

#[derive(Clone)]
pub struct ServerState {
    pub start_time: Instant,
    pub schedulers: GuardedSchedulerManager,
}

impl ServerState {
    pub fn new(schedulers: GuardedSchedulerManager) -> Self {
        Self {
            start_time: Instant::now(),
            schedulers,
        }
    }
}
