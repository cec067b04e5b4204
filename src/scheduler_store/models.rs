use crate::changes::ChangeId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Stable identity of a scheduler instance across restarts.
pub type ObjectId = i64;

/// A build request as recorded by the SQLite sink.
#[derive(Debug, Clone, Serialize)]
pub struct Buildset {
    pub id: i64,
    pub scheduler: String,
    pub reason: String,
    pub builder_names: Vec<String>,
    pub properties: BTreeMap<String, String>,
    pub change_ids: Vec<ChangeId>,
    pub submitted_at: DateTime<Utc>,
}
