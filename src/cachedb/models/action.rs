// src/cachedb/models/action.rs

//! CRUD for the `acs` table: a named action record (§3 "Action (AC)").

use crate::cachedb::statements::StatementKind;
use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

#[derive(Debug, Clone)]
pub struct Action {
    pub id: i64,
    pub uid: String,
    pub weight: i64,
    pub origin: String,
    pub num_deps: i64,
}

impl Action {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            uid: row.get(1)?,
            weight: row.get(2)?,
            origin: row.get(3)?,
            num_deps: row.get(4)?,
        })
    }
}

pub fn insert(conn: &Connection, uid: &str, weight: i64, origin: &str) -> Result<i64> {
    conn.prepare_cached(StatementKind::InsertAction.sql())?
        .execute(params![uid, weight, origin])?;
    Ok(conn.last_insert_rowid())
}

pub fn update(conn: &Connection, uid: &str, weight: i64, origin: &str) -> Result<()> {
    conn.prepare_cached(StatementKind::UpdateAction.sql())?
        .execute(params![weight, origin, uid])?;
    Ok(())
}

pub fn find_by_uid(conn: &Connection, uid: &str) -> Result<Option<Action>> {
    conn.prepare_cached(StatementKind::SelectActionByUid.sql())?
        .query_row(params![uid], Action::from_row)
        .optional()
        .map_err(Into::into)
}

pub fn rowid_by_uid(conn: &Connection, uid: &str) -> Result<Option<i64>> {
    conn.prepare_cached(StatementKind::SelectActionRowid.sql())?
        .query_row(params![uid], |row| row.get(0))
        .optional()
        .map_err(Into::into)
}

pub fn set_num_deps(conn: &Connection, action_id: i64, num_deps: i64) -> Result<()> {
    conn.prepare_cached(StatementKind::SetActionNumDeps.sql())?
        .execute(params![num_deps, action_id])?;
    Ok(())
}

pub fn delete(conn: &Connection, action_id: i64) -> Result<()> {
    conn.prepare_cached(StatementKind::DeleteAction.sql())?
        .execute(params![action_id])?;
    Ok(())
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
    fn insert_and_find_round_trips() {
        let (_temp, conn) = test_conn();
        insert(&conn, "action-1", 7, "build").unwrap();
        let action = find_by_uid(&conn, "action-1").unwrap().unwrap();
        assert_eq!(action.weight, 7);
        assert_eq!(action.origin, "build");
    }

    #[test]
    fn update_changes_weight() {
        let (_temp, conn) = test_conn();
        insert(&conn, "action-2", 1, "build").unwrap();
        update(&conn, "action-2", 9, "build").unwrap();
        let action = find_by_uid(&conn, "action-2").unwrap().unwrap();
        assert_eq!(action.weight, 9);
    }

    #[test]
    fn delete_removes_action() {
        let (_temp, conn) = test_conn();
        let id = insert(&conn, "action-3", 1, "build").unwrap();
        delete(&conn, id).unwrap();
        assert!(find_by_uid(&conn, "action-3").unwrap().is_none());
    }
}
