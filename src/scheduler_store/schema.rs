//! SQLite schema definitions for the scheduler database.
//!
//! This database holds the recorded changes, the per-scheduler classification
//! of pending changes, and the buildsets the schedulers have requested.

use crate::sqlite_column;
use crate::sqlite_persistence::{ForeignKey, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Scheduler objects, changes and classifications
// =============================================================================

/// Stable identities for scheduler instances, keyed by (name, class name)
const OBJECTS_TABLE_V1: Table = Table {
    name: "objects",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("class_name", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[&["name", "class_name"]],
};

/// Changes recorded by the change hub; `files` is a JSON array
const CHANGES_TABLE_V1: Table = Table {
    name: "changes",
    columns: &[
        sqlite_column!("changeid", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("author", &SqlType::Text, non_null = true),
        sqlite_column!("repository", &SqlType::Text, non_null = true),
        sqlite_column!("branch", &SqlType::Text),
        sqlite_column!("revision", &SqlType::Text),
        sqlite_column!("category", &SqlType::Text),
        sqlite_column!("files", &SqlType::Text, non_null = true),
        sqlite_column!("comments", &SqlType::Text, non_null = true),
        sqlite_column!("when_timestamp", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_changes_branch", "branch")],
    unique_constraints: &[],
};

const OBJECTS_FK: ForeignKey = ForeignKey {
    foreign_table: "objects",
    foreign_column: "id",
};

/// Pending (classified, not yet built) changes per scheduler instance.
///
/// `changeid` deliberately has no foreign key: a classified change may be
/// pruned upstream and must then be dropped at fire time, not cascaded away.
const SCHEDULER_CHANGES_TABLE_V1: Table = Table {
    name: "scheduler_changes",
    columns: &[
        sqlite_column!(
            "objectid",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&OBJECTS_FK)
        ),
        sqlite_column!("changeid", &SqlType::Integer, non_null = true),
        sqlite_column!("important", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_scheduler_changes_objectid", "objectid")],
    unique_constraints: &[&["objectid", "changeid"]],
};

// =============================================================================
// Version 2 - Buildsets
// =============================================================================

/// Build requests issued by schedulers; list columns are JSON
const BUILDSETS_TABLE_V2: Table = Table {
    name: "buildsets",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("scheduler", &SqlType::Text, non_null = true),
        sqlite_column!("reason", &SqlType::Text, non_null = true),
        sqlite_column!("builder_names", &SqlType::Text, non_null = true),
        sqlite_column!("properties", &SqlType::Text, non_null = true),
        sqlite_column!("submitted_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_buildsets_scheduler", "scheduler")],
    unique_constraints: &[],
};

const BUILDSETS_FK: ForeignKey = ForeignKey {
    foreign_table: "buildsets",
    foreign_column: "id",
};

const BUILDSET_CHANGES_TABLE_V2: Table = Table {
    name: "buildset_changes",
    columns: &[
        sqlite_column!(
            "buildsetid",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&BUILDSETS_FK)
        ),
        sqlite_column!("changeid", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_buildset_changes_buildsetid", "buildsetid"),
        ("idx_buildset_changes_changeid", "changeid"),
    ],
    unique_constraints: &[&["buildsetid", "changeid"]],
};

/// Migration from version 1 to version 2: add buildset tables
fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    BUILDSETS_TABLE_V2.create(conn)?;
    BUILDSET_CHANGES_TABLE_V2.create(conn)?;
    Ok(())
}

// =============================================================================
// Versioned Schema Definition
// =============================================================================

/// Version 1: objects, changes, scheduler_changes
/// Version 2: buildsets, buildset_changes
pub const SCHEDULER_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[
            OBJECTS_TABLE_V1,
            CHANGES_TABLE_V1,
            SCHEDULER_CHANGES_TABLE_V1,
        ],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[
            OBJECTS_TABLE_V1,
            CHANGES_TABLE_V1,
            SCHEDULER_CHANGES_TABLE_V1,
            BUILDSETS_TABLE_V2,
            BUILDSET_CHANGES_TABLE_V2,
        ],
        migration: Some(migrate_v1_to_v2),
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_every_version_creates_and_validates() {
        for schema in SCHEDULER_VERSIONED_SCHEMAS {
            let conn = Connection::open_in_memory().unwrap();
            schema.create(&conn).unwrap();
            schema.validate(&conn).unwrap();
        }
    }

    #[test]
    fn test_migration_v1_to_v2() {
        let conn = Connection::open_in_memory().unwrap();
        SCHEDULER_VERSIONED_SCHEMAS[0].create(&conn).unwrap();
        assert!(SCHEDULER_VERSIONED_SCHEMAS[1].validate(&conn).is_err());

        migrate_v1_to_v2(&conn).unwrap();
        SCHEDULER_VERSIONED_SCHEMAS[1].validate(&conn).unwrap();
    }

    #[test]
    fn test_classification_unique_per_scheduler() {
        let conn = Connection::open_in_memory().unwrap();
        SCHEDULER_VERSIONED_SCHEMAS[1].create(&conn).unwrap();
        conn.execute(
            "INSERT INTO objects (id, name, class_name) VALUES (1, 'a', 'TimedSingleBranchScheduler')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO scheduler_changes (objectid, changeid, important) VALUES (1, 5, 1)",
            [],
        )
        .unwrap();
        let duplicate = conn.execute(
            "INSERT INTO scheduler_changes (objectid, changeid, important) VALUES (1, 5, 0)",
            [],
        );
        assert!(duplicate.is_err());
    }
}
