// src/cachedb/models/running_proc.rs

//! CRUD for `tasks`/`running_procs`: the reaper's durable view of live
//! consumer processes (§3 "Running proc").

use crate::cachedb::statements::StatementKind;
use crate::error::Result;
use rusqlite::{params, Connection};

#[derive(Debug, Clone, Copy)]
pub struct RunningProc {
    pub pid: i64,
    pub start_time: i64,
    pub expected_lifetime: Option<i64>,
}

pub fn upsert_task(conn: &Connection, task_id: &str, task_gsid: Option<&str>) -> Result<()> {
    conn.prepare_cached(StatementKind::UpsertTask.sql())?
        .execute(params![task_id, task_gsid])?;
    Ok(())
}

pub fn insert_proc(
    conn: &Connection,
    task_id: &str,
    pid: i64,
    start_time: i64,
    expected_lifetime: Option<i64>,
) -> Result<()> {
    conn.prepare_cached(StatementKind::InsertRunningProc.sql())?
        .execute(params![task_id, pid, start_time, expected_lifetime])?;
    Ok(())
}

pub fn list_for_task(conn: &Connection, task_id: &str) -> Result<Vec<RunningProc>> {
    let mut stmt = conn.prepare_cached(StatementKind::SelectRunningProcsForTask.sql())?;
    let rows = stmt.query_map(params![task_id], |row| {
        Ok(RunningProc {
            pid: row.get(0)?,
            start_time: row.get(1)?,
            expected_lifetime: row.get(2)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

pub fn delete_proc(conn: &Connection, task_id: &str, pid: i64, start_time: i64) -> Result<()> {
    conn.prepare_cached(StatementKind::DeleteRunningProc.sql())?
        .execute(params![task_id, pid, start_time])?;
    Ok(())
}

/// Delete the `tasks` row if it no longer has any `running_procs`
/// children, returning whether it was deleted.
pub fn delete_task_if_empty(conn: &Connection, task_id: &str) -> Result<bool> {
    let changed = conn
        .prepare_cached(StatementKind::DeleteTaskIfEmpty.sql())?
        .execute(params![task_id, task_id])?;
    Ok(changed > 0)
}

/// Every task id with at least one `running_procs` row, for the
/// reaper's periodic `AddRunningFromDB` backfill after a restart.
pub fn all_task_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(StatementKind::SelectAllTaskIds.sql())?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cachedb::schema;
    use tempfile::NamedTempFile;

    fn test_conn() -> (NamedTempFile, Connection) {
        let temp = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp.path()).unwrap();
        schema::migrate(&conn).unwrap();
        (temp, conn)
    }

    #[test]
    fn insert_and_list_round_trips() {
        let (_temp, conn) = test_conn();
        upsert_task(&conn, "task-1", None).unwrap();
        insert_proc(&conn, "task-1", 1234, 1000, Some(5000)).unwrap();

        let procs = list_for_task(&conn, "task-1").unwrap();
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].pid, 1234);
    }

    #[test]
    fn delete_task_if_empty_only_when_no_procs_remain() {
        let (_temp, conn) = test_conn();
        upsert_task(&conn, "task-2", None).unwrap();
        insert_proc(&conn, "task-2", 1, 1, None).unwrap();

        assert!(!delete_task_if_empty(&conn, "task-2").unwrap());

        delete_proc(&conn, "task-2", 1, 1).unwrap();
        assert!(delete_task_if_empty(&conn, "task-2").unwrap());
    }
}
