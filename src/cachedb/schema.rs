// src/cachedb/schema.rs

//! Database schema definitions and migrations for the action cache
//!
//! Mirrors the versioned-migration pattern the rest of the codebase uses
//! for its own tables: a `schema_version` table tracks what has been
//! applied, and `migrate` brings a fresh or older database up to date.

use crate::error::Result;
use rusqlite::Connection;
use tracing::{debug, info};

pub const SCHEMA_VERSION: i32 = 1;

fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    info!(current_version, "checking action-cache schema version");

    if current_version >= SCHEMA_VERSION {
        info!("schema is up to date");
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!(version, "applying migration");
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!(version = SCHEMA_VERSION, "schema migration complete");
    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => unreachable!("unknown migration version: {version}"),
    }
}

/// Initial schema - version 1.
///
/// Tables follow the entity model of §3: `blobs` (CAS rows), `acs` +
/// `acs_blobs` + `acs_gc` (actions and their edges/GC metadata), `reqs`
/// (live consumer locks), `deps_from`/`deps_to` (the action dependency
/// graph, indexed from both ends), `tasks`/`running_procs` (the reaper's
/// view of live consumers).
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("creating action-cache schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE blobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uid TEXT NOT NULL UNIQUE,
            size INTEGER NOT NULL,
            fs_size INTEGER NOT NULL,
            ref_count INTEGER NOT NULL DEFAULT 0,
            mode INTEGER NOT NULL DEFAULT 0,
            store_mode TEXT NOT NULL CHECK(store_mode IN ('on_fs', 'data_in_place', 'data_removed')) DEFAULT 'on_fs',
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE acs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uid TEXT NOT NULL UNIQUE,
            weight INTEGER NOT NULL DEFAULT 0,
            origin TEXT NOT NULL,
            num_deps INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE acs_blobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action_id INTEGER NOT NULL REFERENCES acs(id) ON DELETE CASCADE,
            blob_id INTEGER NOT NULL REFERENCES blobs(id),
            relative_path TEXT NOT NULL,
            UNIQUE(action_id, relative_path)
        );
        CREATE INDEX idx_acs_blobs_action ON acs_blobs(action_id);
        CREATE INDEX idx_acs_blobs_blob ON acs_blobs(blob_id);

        CREATE TABLE reqs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action_id INTEGER NOT NULL REFERENCES acs(id) ON DELETE CASCADE,
            task_id TEXT NOT NULL,
            UNIQUE(action_id, task_id)
        );
        CREATE INDEX idx_reqs_action ON reqs(action_id);
        CREATE INDEX idx_reqs_task ON reqs(task_id);

        CREATE TABLE acs_gc (
            action_id INTEGER PRIMARY KEY REFERENCES acs(id) ON DELETE CASCADE,
            last_access INTEGER NOT NULL,
            last_access_time INTEGER NOT NULL,
            request_count INTEGER NOT NULL DEFAULT 0,
            is_result INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX idx_acs_gc_last_access ON acs_gc(last_access);
        CREATE INDEX idx_acs_gc_last_access_time ON acs_gc(last_access_time);

        CREATE TABLE deps_from (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            from_action_id INTEGER NOT NULL REFERENCES acs(id) ON DELETE CASCADE,
            to_action_id INTEGER NOT NULL REFERENCES acs(id) ON DELETE CASCADE,
            edge_index INTEGER NOT NULL,
            UNIQUE(from_action_id, edge_index)
        );
        CREATE INDEX idx_deps_from_from ON deps_from(from_action_id);

        CREATE TABLE deps_to (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            to_action_id INTEGER NOT NULL REFERENCES acs(id) ON DELETE CASCADE,
            from_action_id INTEGER NOT NULL REFERENCES acs(id) ON DELETE CASCADE,
            edge_index INTEGER NOT NULL
        );
        CREATE INDEX idx_deps_to_to ON deps_to(to_action_id);

        CREATE TABLE tasks (
            task_id TEXT PRIMARY KEY,
            task_gsid TEXT
        );

        CREATE TABLE running_procs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL REFERENCES tasks(task_id) ON DELETE CASCADE,
            pid INTEGER NOT NULL,
            start_time INTEGER NOT NULL,
            expected_lifetime INTEGER,
            UNIQUE(task_id, pid, start_time)
        );
        CREATE INDEX idx_running_procs_task ON running_procs(task_id);
        ",
    )?;

    info!("action-cache schema version 1 created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn schema_version_starts_at_zero() {
        let (_temp, conn) = create_test_db();
        assert_eq!(get_schema_version(&conn).unwrap(), 0);
    }

    #[test]
    fn migrate_creates_all_tables() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for expected in [
            "blobs",
            "acs",
            "acs_blobs",
            "reqs",
            "acs_gc",
            "deps_from",
            "deps_to",
            "tasks",
            "running_procs",
            "schema_version",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing table {expected}");
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();
        let v1 = get_schema_version(&conn).unwrap();
        migrate(&conn).unwrap();
        let v2 = get_schema_version(&conn).unwrap();
        assert_eq!(v1, v2);
        assert_eq!(v1, SCHEMA_VERSION);
    }

    #[test]
    fn blobs_uid_is_unique() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO blobs (uid, size, fs_size, mode) VALUES ('abc', 1, 1, 0)",
            [],
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO blobs (uid, size, fs_size, mode) VALUES ('abc', 2, 2, 0)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn acs_blobs_foreign_key_enforced() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();
        let result = conn.execute(
            "INSERT INTO acs_blobs (action_id, blob_id, relative_path) VALUES (999, 999, 'x')",
            [],
        );
        assert!(result.is_err());
    }
}
