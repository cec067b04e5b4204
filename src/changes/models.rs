use serde::{Deserialize, Serialize};

/// Change ids are assigned by the change store and only ever grow.
pub type ChangeId = i64;

/// A recorded source-control change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub author: String,
    pub repository: String,
    /// `None` is the repository's default branch.
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub category: Option<String>,
    pub files: Vec<String>,
    pub comments: String,
    /// Unix timestamp of the change itself.
    pub when_timestamp: i64,
}

/// A change as reported by an upstream change source, before it gets an id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewChange {
    pub author: String,
    pub repository: String,
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub category: Option<String>,
    pub files: Vec<String>,
    pub comments: String,
    pub when_timestamp: Option<i64>,
}
