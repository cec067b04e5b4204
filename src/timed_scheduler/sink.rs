use crate::changes::ChangeId;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

pub type BuildsetId = i64;

/// One request to build a set of changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildRequest {
    pub scheduler: String,
    pub reason: String,
    /// Ascending change ids.
    pub change_ids: Vec<ChangeId>,
    pub builder_names: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum BuildRequestError {
    #[error("Build request has no changes")]
    NoChanges,

    #[error("Build request references unknown change {0}")]
    UnknownChange(ChangeId),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Destination for build requests issued by schedulers.
#[async_trait]
pub trait BuildRequestSink: Send + Sync {
    async fn create_build(&self, request: BuildRequest) -> Result<BuildsetId, BuildRequestError>;
}
