//! Source-control changes as seen by the schedulers.

mod filter;
mod hub;
mod models;

pub use filter::{BranchSelection, ChangeFilter, ImportancePolicy};
pub use hub::ChangeHub;
pub use models::{Change, ChangeId, NewChange};

use anyhow::Result;

/// Read access to recorded changes.
///
/// Changes can disappear upstream (pruned by the change horizon), so a lookup
/// for an id that once existed may legitimately return `None`.
pub trait ChangeSource: Send + Sync {
    fn get_change(&self, change_id: ChangeId) -> Result<Option<Change>>;
}

/// A change source that also accepts new changes.
pub trait ChangeStore: ChangeSource {
    /// Record a change and return it with its newly assigned id.
    fn add_change(&self, change: &NewChange) -> Result<Change>;

    /// Delete all but the newest `horizon` changes. Returns how many were removed.
    fn prune_changes(&self, horizon: usize) -> Result<usize>;
}
