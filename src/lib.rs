//! Buildgate library
//!
//! Time-windowed build scheduling plus the helpers used by the build hosts.

pub mod build_counter;
pub mod changes;
pub mod config;
pub mod log_analysis;
pub mod scheduler_store;
pub mod server;
pub mod sqlite_persistence;
pub mod time_window;
pub mod timed_scheduler;

// Re-export commonly used types for convenience
pub use changes::{Change, ChangeHub, NewChange};
pub use scheduler_store::SqliteSchedulerStore;
pub use server::{run_server, ServerState};
pub use time_window::TimeWindow;
pub use timed_scheduler::{SchedulerManager, TimedScheduler, TimedSchedulerSettings};
