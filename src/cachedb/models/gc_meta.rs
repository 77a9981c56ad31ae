// src/cachedb/models/gc_meta.rs

//! CRUD for the `acs_gc` table: per-action last-access bookkeeping used
//! for LRU eviction (§3 invariant I5, §4.4).

use crate::cachedb::statements::StatementKind;
use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone, Copy)]
pub struct AcsGc {
    pub last_access: i64,
    pub last_access_time: i64,
    pub request_count: i64,
    pub is_result: bool,
}

/// Insert or refresh an action's GC bookkeeping row. `request_count` is
/// only set on insert — subsequent calls that want to bump it must go
/// through [`crate::cachedb::models::request`] so it stays equal to the
/// count of `reqs` rows (invariant I7).
pub fn upsert(
    conn: &Connection,
    action_id: i64,
    last_access: i64,
    last_access_time: i64,
    request_count: i64,
    is_result: bool,
) -> Result<()> {
    conn.prepare_cached(StatementKind::UpsertAcsGc.sql())?.execute(params![
        action_id,
        last_access,
        last_access_time,
        request_count,
        is_result,
        last_access,
        last_access_time,
        is_result,
    ])?;
    Ok(())
}

pub fn find(conn: &Connection, action_id: i64) -> Result<Option<AcsGc>> {
    conn.prepare_cached(StatementKind::SelectAcsGc.sql())?
        .query_row(params![action_id], |row| {
            Ok(AcsGc {
                last_access: row.get(0)?,
                last_access_time: row.get(1)?,
                request_count: row.get(2)?,
                is_result: row.get::<_, i64>(3)? != 0,
            })
        })
        .optional()
        .map_err(Into::into)
}

pub fn decrement_request_count(conn: &Connection, action_id: i64) -> Result<()> {
    conn.prepare_cached(StatementKind::DecrementRequestCount.sql())?
        .execute(params![action_id])?;
    Ok(())
}

/// Drop an action's GC bookkeeping row entirely, for `remove_uid_nested`
/// once the action itself is being deleted.
pub fn delete(conn: &Connection, action_id: i64) -> Result<()> {
    conn.prepare_cached(StatementKind::DeleteAcsGcForAction.sql())?
        .execute(params![action_id])?;
    Ok(())
}

pub fn increment_request_count(conn: &Connection, action_id: i64) -> Result<()> {
    conn.prepare_cached(StatementKind::IncrementRequestCount.sql())?
        .execute(params![action_id])?;
    Ok(())
}

/// One page of eviction candidates ordered by ascending `last_access`,
/// excluding actions with a live request count, starting strictly after
/// `cursor`. Mirrors the LRU queries the rest of the codebase uses for
/// its own cache eviction (`get_lru_chunks`/`get_stale_chunks`).
pub fn eviction_candidates(conn: &Connection, cursor: i64, batch_size: usize) -> Result<Vec<(i64, i64)>> {
    let mut stmt = conn.prepare_cached(StatementKind::EvictionCandidates.sql())?;
    let rows = stmt.query_map(params![cursor, batch_size as i64], |row| {
        Ok((row.get(0)?, row.get(1)?))
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// Candidates with `last_access_time` older than `now_ms - age_limit_ms`,
/// for the synchronous `OldItems` GC selector.
pub fn candidates_older_than(conn: &Connection, cutoff_ms: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare_cached(StatementKind::CandidatesOlderThan.sql())?;
    let rows = stmt.query_map(params![cutoff_ms], |row| row.get(0))?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}
