use super::models::{Buildset, ObjectId};
use super::schema::SCHEDULER_VERSIONED_SCHEMAS;
use super::ClassificationStore;
use crate::changes::{Change, ChangeId, ChangeSource, ChangeStore, NewChange};
use crate::sqlite_persistence::open_versioned_database;
use crate::timed_scheduler::{BuildRequest, BuildRequestError, BuildRequestSink, BuildsetId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// SQLite-backed change store, classification store and build request sink.
pub struct SqliteSchedulerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSchedulerStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned_database(db_path, SCHEDULER_VERSIONED_SCHEMAS, "scheduler")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up (or allocate) the stable id for a scheduler instance.
    pub fn get_object_id(&self, name: &str, class_name: &str) -> Result<ObjectId> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO objects (name, class_name) VALUES (?1, ?2)",
            params![name, class_name],
        )?;
        let id = conn.query_row(
            "SELECT id FROM objects WHERE name = ?1 AND class_name = ?2",
            params![name, class_name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Most recent buildsets first.
    pub fn get_buildsets(&self, limit: usize) -> Result<Vec<Buildset>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, scheduler, reason, builder_names, properties, submitted_at
             FROM buildsets ORDER BY id DESC LIMIT ?1",
        )?;
        let mut buildsets = stmt
            .query_map(params![limit as i64], Self::row_to_buildset)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut changes_stmt = conn.prepare(
            "SELECT changeid FROM buildset_changes WHERE buildsetid = ?1 ORDER BY changeid",
        )?;
        for buildset in &mut buildsets {
            buildset.change_ids = changes_stmt
                .query_map(params![buildset.id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
        }
        Ok(buildsets)
    }

    fn insert_buildset(&self, request: &BuildRequest) -> Result<BuildsetId, BuildRequestError> {
        if request.change_ids.is_empty() {
            return Err(BuildRequestError::NoChanges);
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for change_id in &request.change_ids {
            let exists = tx
                .query_row(
                    "SELECT 1 FROM changes WHERE changeid = ?1",
                    params![change_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !exists {
                return Err(BuildRequestError::UnknownChange(*change_id));
            }
        }

        let builder_names = serde_json::to_string(&request.builder_names)
            .context("Failed to encode builder names")?;
        let properties =
            serde_json::to_string(&request.properties).context("Failed to encode properties")?;
        tx.execute(
            "INSERT INTO buildsets (scheduler, reason, builder_names, properties, submitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                request.scheduler,
                request.reason,
                builder_names,
                properties,
                Utc::now().timestamp()
            ],
        )?;
        let buildset_id = tx.last_insert_rowid();
        for change_id in &request.change_ids {
            tx.execute(
                "INSERT OR IGNORE INTO buildset_changes (buildsetid, changeid) VALUES (?1, ?2)",
                params![buildset_id, change_id],
            )?;
        }
        tx.commit()?;

        debug!(
            "Recorded buildset {} for {} with changes {:?}",
            buildset_id, request.scheduler, request.change_ids
        );
        Ok(buildset_id)
    }

    fn json_column<T: serde::de::DeserializeOwned>(
        row: &rusqlite::Row,
        column: &str,
    ) -> rusqlite::Result<T> {
        let raw: String = row.get(column)?;
        serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
    }

    fn row_to_change(row: &rusqlite::Row) -> rusqlite::Result<Change> {
        Ok(Change {
            id: row.get("changeid")?,
            author: row.get("author")?,
            repository: row.get("repository")?,
            branch: row.get("branch")?,
            revision: row.get("revision")?,
            category: row.get("category")?,
            files: Self::json_column(row, "files")?,
            comments: row.get("comments")?,
            when_timestamp: row.get("when_timestamp")?,
        })
    }

    fn row_to_buildset(row: &rusqlite::Row) -> rusqlite::Result<Buildset> {
        let submitted_at: i64 = row.get("submitted_at")?;
        Ok(Buildset {
            id: row.get("id")?,
            scheduler: row.get("scheduler")?,
            reason: row.get("reason")?,
            builder_names: Self::json_column(row, "builder_names")?,
            properties: Self::json_column(row, "properties")?,
            change_ids: Vec::new(),
            submitted_at: DateTime::from_timestamp(submitted_at, 0).unwrap_or_else(Utc::now),
        })
    }
}

impl ChangeSource for SqliteSchedulerStore {
    fn get_change(&self, change_id: ChangeId) -> Result<Option<Change>> {
        let conn = self.conn();
        let change = conn
            .query_row(
                "SELECT changeid, author, repository, branch, revision, category, files, comments, when_timestamp
                 FROM changes WHERE changeid = ?1",
                params![change_id],
                Self::row_to_change,
            )
            .optional()?;
        Ok(change)
    }
}

impl ChangeStore for SqliteSchedulerStore {
    fn add_change(&self, change: &NewChange) -> Result<Change> {
        let files = serde_json::to_string(&change.files).context("Failed to encode file list")?;
        let when_timestamp = change
            .when_timestamp
            .unwrap_or_else(|| Utc::now().timestamp());

        let conn = self.conn();
        conn.execute(
            "INSERT INTO changes (author, repository, branch, revision, category, files, comments, when_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                change.author,
                change.repository,
                change.branch,
                change.revision,
                change.category,
                files,
                change.comments,
                when_timestamp
            ],
        )?;

        Ok(Change {
            id: conn.last_insert_rowid(),
            author: change.author.clone(),
            repository: change.repository.clone(),
            branch: change.branch.clone(),
            revision: change.revision.clone(),
            category: change.category.clone(),
            files: change.files.clone(),
            comments: change.comments.clone(),
            when_timestamp,
        })
    }

    fn prune_changes(&self, horizon: usize) -> Result<usize> {
        // The newest change is never pruned, which keeps rowid allocation monotonic.
        if horizon == 0 {
            return Ok(0);
        }
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM changes WHERE changeid NOT IN
                (SELECT changeid FROM changes ORDER BY changeid DESC LIMIT ?1)",
            params![horizon as i64],
        )?;
        Ok(removed)
    }
}

impl ClassificationStore for SqliteSchedulerStore {
    fn classify_changes(
        &self,
        objectid: ObjectId,
        classifications: &BTreeMap<ChangeId, bool>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for (change_id, important) in classifications {
            tx.execute(
                "INSERT INTO scheduler_changes (objectid, changeid, important) VALUES (?1, ?2, ?3)
                 ON CONFLICT (objectid, changeid) DO UPDATE SET important = excluded.important",
                params![objectid, change_id, *important as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_change_classifications(&self, objectid: ObjectId) -> Result<BTreeMap<ChangeId, bool>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT changeid, important FROM scheduler_changes WHERE objectid = ?1 ORDER BY changeid",
        )?;
        let classifications = stmt
            .query_map(params![objectid], |row| {
                Ok((row.get::<_, ChangeId>(0)?, row.get::<_, i64>(1)? != 0))
            })?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
        Ok(classifications)
    }

    fn flush_change_classifications(
        &self,
        objectid: ObjectId,
        up_to_and_including: ChangeId,
    ) -> Result<usize> {
        let conn = self.conn();
        let flushed = conn.execute(
            "DELETE FROM scheduler_changes WHERE objectid = ?1 AND changeid <= ?2",
            params![objectid, up_to_and_including],
        )?;
        Ok(flushed)
    }
}

#[async_trait]
impl BuildRequestSink for SqliteSchedulerStore {
    async fn create_build(&self, request: BuildRequest) -> Result<BuildsetId, BuildRequestError> {
        self.insert_buildset(&request)
    }
}
