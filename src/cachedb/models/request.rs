// src/cachedb/models/request.rs

//! CRUD for the `reqs` table: live consumer locks on an action (§3
//! "Request").

use crate::cachedb::statements::StatementKind;
use crate::error::Result;
use rusqlite::{params, Connection};

pub fn insert(conn: &Connection, action_id: i64, task_id: &str) -> Result<()> {
    conn.prepare_cached(StatementKind::InsertReq.sql())?
        .execute(params![action_id, task_id])?;
    Ok(())
}

pub fn delete(conn: &Connection, action_id: i64, task_id: &str) -> Result<()> {
    conn.prepare_cached(StatementKind::DeleteReq.sql())?
        .execute(params![action_id, task_id])?;
    Ok(())
}

pub fn count_for_action(conn: &Connection, action_id: i64) -> Result<i64> {
    conn.prepare_cached(StatementKind::CountReqsForAction.sql())?
        .query_row(params![action_id], |row| row.get(0))
        .map_err(Into::into)
}

/// Drop every `reqs` row for an action outright, for the GC/forced-removal
/// path where the action itself is being deleted regardless of live locks.
pub fn delete_for_action(conn: &Connection, action_id: i64) -> Result<()> {
    conn.prepare_cached(StatementKind::DeleteReqsForAction.sql())?
        .execute(params![action_id])?;
    Ok(())
}

/// Delete every `reqs` row for a task, returning the affected action ids
/// so the caller can decrement each action's `acs_gc.request_count` and,
/// if it reaches zero, wake the integrity handler.
pub fn delete_for_task(conn: &Connection, task_id: &str) -> Result<Vec<i64>> {
    let action_ids: Vec<i64> = conn
        .prepare_cached(StatementKind::SelectReqActionIdsForTask.sql())?
        .query_map(params![task_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    conn.prepare_cached(StatementKind::DeleteReqsForTask.sql())?
        .execute(params![task_id])?;

    Ok(action_ids)
}
