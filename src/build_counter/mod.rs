//! Counter of concurrently running builds keyed by (repository, branch).
//!
//! Every build start increments its row and every completion decrements it.
//! Once the sum over all rows drops back to zero the whole wave of builds is
//! reported to a log file and the table is emptied.

mod reference;
mod schema;

pub use reference::{GitReferenceResolver, ReferenceResolver};
pub use schema::BUILD_COUNTER_VERSIONED_SCHEMAS;

use crate::sqlite_persistence::open_versioned_database;
use anyhow::{Context, Result};
use chrono::{Local, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_DB_PATH: &str = "/tmp/buildcounter.db";
pub const DEFAULT_LOG_PATH: &str = "/tmp/buildcounter.log";
pub const DEFAULT_GIT_CACHE: &str = "/opt/buildbot/cache";

const BUSY_TIMEOUT: Duration = Duration::from_secs(20);

/// One (repository, branch) row of the counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecord {
    pub repository: String,
    pub branch: String,
    pub reference: String,
    pub starttime: i64,
    pub endtime: i64,
    pub buildcount: i64,
}

impl BuildRecord {
    /// `Build <branch>:<reference> started <time> completed <time>`
    pub fn report_line(&self) -> String {
        format!(
            "Build {}:{} started {} completed {}",
            self.branch,
            self.reference,
            format_local_time(self.starttime),
            format_local_time(self.endtime)
        )
    }
}

/// Local time in the classic `asctime` layout, e.g. `Fri Mar  1 08:00:00 2024`.
pub fn format_local_time(timestamp: i64) -> String {
    match Local.timestamp_opt(timestamp, 0).single() {
        Some(time) => time.format("%a %b %e %H:%M:%S %Y").to_string(),
        None => timestamp.to_string(),
    }
}

pub struct SqliteBuildCounter {
    conn: Connection,
    resolver: Box<dyn ReferenceResolver>,
    log_path: PathBuf,
}

impl SqliteBuildCounter {
    /// Open the counter database, optionally deleting it first.
    pub fn open<P: AsRef<Path>>(
        db_path: P,
        remove: bool,
        resolver: Box<dyn ReferenceResolver>,
        log_path: PathBuf,
    ) -> Result<Self> {
        let db_path = db_path.as_ref();
        if remove {
            remove_database(db_path)?;
        }

        let conn =
            open_versioned_database(db_path, BUILD_COUNTER_VERSIONED_SCHEMAS, "build counter")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode=WAL;", [], |row| row.get(0))?;
        debug!("Build counter journal mode: {}", journal_mode);

        Ok(Self {
            conn,
            resolver,
            log_path,
        })
    }

    /// Count a started build; the first build of a row resolves its reference.
    /// Returns the row's new count.
    pub fn build_started(&mut self, repository: &str, branch: &str) -> Result<i64> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT buildcount FROM builds WHERE repository = ?1 AND branch = ?2",
                params![repository, branch],
                |row| row.get(0),
            )
            .optional()?;

        if existing.is_some() {
            self.conn.execute(
                "UPDATE builds SET buildcount = buildcount + 1 WHERE repository = ?1 AND branch = ?2",
                params![repository, branch],
            )?;
        } else {
            let reference = self
                .resolver
                .resolve(repository, branch)
                .with_context(|| {
                    format!("Failed to resolve reference for {}:{}", repository, branch)
                })?;
            self.conn.execute(
                "INSERT INTO builds (repository, branch, reference, starttime, endtime, buildcount)
                 VALUES (?1, ?2, ?3, ?4, 0, 1)
                 ON CONFLICT (repository, branch) DO UPDATE SET buildcount = buildcount + 1",
                params![repository, branch, reference, Utc::now().timestamp()],
            )?;
        }

        let count = self.count_for(repository, branch)?;
        info!("Build started for {}:{} ({} running)", repository, branch, count);
        Ok(count)
    }

    /// Count a finished build. When no build is left running anywhere, the
    /// finished rows are appended to the log, deleted, and returned.
    pub fn build_completed(
        &mut self,
        repository: &str,
        branch: &str,
    ) -> Result<Option<Vec<BuildRecord>>> {
        let now = Utc::now();
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE builds SET buildcount = buildcount - 1
             WHERE repository = ?1 AND branch = ?2 AND buildcount > 0",
            params![repository, branch],
        )?;
        tx.execute(
            "UPDATE builds SET endtime = ?1
             WHERE repository = ?2 AND branch = ?3 AND buildcount = 0",
            params![now.timestamp(), repository, branch],
        )?;

        let running: Option<i64> =
            tx.query_row("SELECT SUM(buildcount) FROM builds", [], |row| row.get(0))?;
        if running != Some(0) {
            tx.commit()?;
            debug!("{:?} builds still running", running);
            return Ok(None);
        }

        let records = {
            let mut stmt = tx.prepare(
                "SELECT repository, branch, reference, starttime, endtime, buildcount FROM builds",
            )?;
            let rows = stmt.query_map([], row_to_record)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        append_report(&self.log_path, &records)?;
        tx.execute("DELETE FROM builds", [])?;
        tx.commit()?;

        info!("All builds completed, reported {} entries", records.len());
        Ok(Some(records))
    }

    pub fn records(&self) -> Result<Vec<BuildRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT repository, branch, reference, starttime, endtime, buildcount
             FROM builds ORDER BY repository, branch",
        )?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn count_for(&self, repository: &str, branch: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT buildcount FROM builds WHERE repository = ?1 AND branch = ?2",
            params![repository, branch],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<BuildRecord> {
    Ok(BuildRecord {
        repository: row.get(0)?,
        branch: row.get(1)?,
        reference: row.get(2)?,
        starttime: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
        endtime: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
        buildcount: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
    })
}

fn append_report(log_path: &Path, records: &[BuildRecord]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open build log {:?}", log_path))?;
    for record in records {
        writeln!(file, "{}", record.report_line())?;
    }
    Ok(())
}

fn remove_database(db_path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut path = db_path.as_os_str().to_owned();
        path.push(suffix);
        let path = PathBuf::from(path);
        if path.exists() {
            std::fs::remove_file(&path).with_context(|| format!("Failed to remove {:?}", path))?;
        }
    }
    Ok(())
}
