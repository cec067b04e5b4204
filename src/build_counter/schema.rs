//! SQLite schema for the build counter database.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema};

/// Running builds per (repository, branch); times are unix seconds
const BUILDS_TABLE_V1: Table = Table {
    name: "builds",
    columns: &[
        sqlite_column!("repository", &SqlType::Text, non_null = true),
        sqlite_column!("branch", &SqlType::Text, non_null = true),
        sqlite_column!("reference", &SqlType::Text, non_null = true),
        sqlite_column!("starttime", &SqlType::Integer),
        sqlite_column!("endtime", &SqlType::Integer),
        sqlite_column!("buildcount", &SqlType::Integer),
    ],
    indices: &[("idx_builds_repository", "repository")],
    unique_constraints: &[&["repository", "branch"]],
};

pub const BUILD_COUNTER_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[BUILDS_TABLE_V1],
    migration: None,
}];
