// src/cachedb/models/edge.rs

//! CRUD for the `acs_blobs` table: the `(action, blob, relative_path)`
//! edge described in §3 "ActionBlobEdge".

use crate::cachedb::statements::StatementKind;
use crate::error::Result;
use rusqlite::{params, Connection};

#[derive(Debug, Clone)]
pub struct BlobEdge {
    pub blob_id: i64,
    pub relative_path: String,
}

pub fn insert(conn: &Connection, action_id: i64, blob_id: i64, relative_path: &str) -> Result<()> {
    conn.prepare_cached(StatementKind::InsertAcsBlob.sql())?
        .execute(params![action_id, blob_id, relative_path])?;
    Ok(())
}

pub fn list_for_action(conn: &Connection, action_id: i64) -> Result<Vec<BlobEdge>> {
    let mut stmt = conn.prepare_cached(StatementKind::SelectAcsBlobsForAction.sql())?;
    let rows = stmt.query_map(params![action_id], |row| {
        Ok(BlobEdge {
            blob_id: row.get(0)?,
            relative_path: row.get(1)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

pub fn delete_for_action(conn: &Connection, action_id: i64) -> Result<()> {
    conn.prepare_cached(StatementKind::DeleteAcsBlobsForAction.sql())?
        .execute(params![action_id])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cachedb::models::{action, blob};
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
        let action_id = action::insert(&conn, "action-1", 0, "build").unwrap();
        let blob_id = blob::insert(&conn, "blob-1", 10, 10, 1, 0).unwrap();
        insert(&conn, action_id, blob_id, "out/a.out").unwrap();

        let edges = list_for_action(&conn, action_id).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relative_path, "out/a.out");
    }

    #[test]
    fn delete_for_action_clears_edges() {
        let (_temp, conn) = test_conn();
        let action_id = action::insert(&conn, "action-2", 0, "build").unwrap();
        let blob_id = blob::insert(&conn, "blob-2", 10, 10, 1, 0).unwrap();
        insert(&conn, action_id, blob_id, "out/a.out").unwrap();
        delete_for_action(&conn, action_id).unwrap();
        assert!(list_for_action(&conn, action_id).unwrap().is_empty());
    }
}
