mod models;
mod schema;
mod sqlite_scheduler_store;

pub use models::*;
pub use schema::SCHEDULER_VERSIONED_SCHEMAS;
pub use sqlite_scheduler_store::SqliteSchedulerStore;

use crate::changes::ChangeId;
use anyhow::Result;
use std::collections::BTreeMap;

/// Per-scheduler record of changes that arrived but have not been built yet.
///
/// The store does no locking of its own beyond single-statement atomicity; each
/// scheduler serializes its read-modify-write sequences under its own lock.
pub trait ClassificationStore: Send + Sync {
    /// Upsert `change id -> important` entries for one scheduler.
    fn classify_changes(
        &self,
        objectid: ObjectId,
        classifications: &BTreeMap<ChangeId, bool>,
    ) -> Result<()>;

    fn get_change_classifications(&self, objectid: ObjectId) -> Result<BTreeMap<ChangeId, bool>>;

    /// Delete every entry with `changeid <= up_to_and_including`.
    /// Returns the number of deleted entries.
    fn flush_change_classifications(
        &self,
        objectid: ObjectId,
        up_to_and_including: ChangeId,
    ) -> Result<usize>;
}
