// src/cachedb/models/dep_edge.rs

//! CRUD for `deps_from`/`deps_to`: the action dependency graph populated
//! by `put_deps` (§4.3), indexed from both ends so a GC pass can answer
//! "what does this depend on" and "what depends on this" equally fast.

use crate::cachedb::statements::StatementKind;
use crate::error::Result;
use rusqlite::{params, Connection};

pub fn insert(conn: &Connection, from_action_id: i64, to_action_id: i64, edge_index: i64) -> Result<()> {
    conn.prepare_cached(StatementKind::InsertDepsFrom.sql())?
        .execute(params![from_action_id, to_action_id, edge_index])?;
    conn.prepare_cached(StatementKind::InsertDepsTo.sql())?
        .execute(params![to_action_id, from_action_id, edge_index])?;
    Ok(())
}

pub fn delete_for_action(conn: &Connection, action_id: i64) -> Result<()> {
    conn.prepare_cached(StatementKind::DeleteDepsFromForAction.sql())?
        .execute(params![action_id, action_id])?;
    conn.prepare_cached(StatementKind::DeleteDepsToForAction.sql())?
        .execute(params![action_id, action_id])?;
    Ok(())
}
