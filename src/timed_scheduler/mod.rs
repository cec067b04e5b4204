//! Time-windowed, change-coalescing build schedulers.

mod clock;
mod manager;
mod scheduler;
mod settings;
mod sink;

pub use clock::{Clock, FakeClock, SystemClock};
pub use manager::SchedulerManager;
pub use scheduler::{ArrivalOutcome, ChangeDisposition, SchedulerStatus, TimedScheduler};
pub use settings::{
    render_reason, ChangeFilterDefinition, SchedulerConfigError, SchedulerDefinition,
    SchedulerKind, TimedSchedulerSettings, DEFAULT_REASON,
};
pub use sink::{BuildRequest, BuildRequestError, BuildRequestSink, BuildsetId};
