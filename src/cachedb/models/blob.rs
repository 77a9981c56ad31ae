// src/cachedb/models/blob.rs

//! CRUD for the `blobs` table: the CAS row backing a content-addressed
//! file (§3 "Blob").

use crate::cachedb::statements::StatementKind;
use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    OnFs,
    DataInPlace,
    DataRemoved,
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OnFs => "on_fs",
            Self::DataInPlace => "data_in_place",
            Self::DataRemoved => "data_removed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for StoreMode {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "on_fs" => Ok(Self::OnFs),
            "data_in_place" => Ok(Self::DataInPlace),
            "data_removed" => Ok(Self::DataRemoved),
            other => Err(crate::error::Error::Invariant(format!(
                "unknown store_mode in database: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Blob {
    pub id: i64,
    pub uid: String,
    pub size: i64,
    pub fs_size: i64,
    pub ref_count: i64,
    pub mode: i64,
    pub store_mode: StoreMode,
}

impl Blob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let store_mode_str: String = row.get(6)?;
        Ok(Self {
            id: row.get(0)?,
            uid: row.get(1)?,
            size: row.get(2)?,
            fs_size: row.get(3)?,
            ref_count: row.get(4)?,
            mode: row.get(5)?,
            store_mode: StoreMode::from_str(&store_mode_str).unwrap_or(StoreMode::OnFs),
        })
    }
}

pub fn insert(conn: &Connection, uid: &str, size: i64, fs_size: i64, ref_count: i64, mode: i64) -> Result<i64> {
    conn.prepare_cached(StatementKind::InsertBlob.sql())?.execute(
        params![uid, size, fs_size, ref_count, mode],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn find_by_uid(conn: &Connection, uid: &str) -> Result<Option<Blob>> {
    conn.prepare_cached(StatementKind::SelectBlobByUid.sql())?
        .query_row(params![uid], Blob::from_row)
        .optional()
        .map_err(Into::into)
}

/// Look up a blob by its database rowid, for call sites that already
/// hold an `acs_blobs.blob_id` rather than the content digest.
pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Blob>> {
    conn.prepare_cached(StatementKind::SelectBlobById.sql())?
        .query_row(params![id], Blob::from_row)
        .optional()
        .map_err(Into::into)
}

pub fn update_ref_count(conn: &Connection, uid: &str, ref_count: i64) -> Result<()> {
    conn.prepare_cached(StatementKind::UpdateBlobRefCount.sql())?
        .execute(params![ref_count, uid])?;
    Ok(())
}

pub fn delete_by_uid(conn: &Connection, uid: &str) -> Result<()> {
    conn.prepare_cached(StatementKind::DeleteBlobByUid.sql())?
        .execute(params![uid])?;
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
        insert(&conn, "uid-1", 100, 4096, 1, 0o644).unwrap();
        let blob = find_by_uid(&conn, "uid-1").unwrap().unwrap();
        assert_eq!(blob.uid, "uid-1");
        assert_eq!(blob.size, 100);
        assert_eq!(blob.ref_count, 1);
        assert_eq!(blob.store_mode, StoreMode::OnFs);
    }

    #[test]
    fn find_missing_returns_none() {
        let (_temp, conn) = test_conn();
        assert!(find_by_uid(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn update_ref_count_persists() {
        let (_temp, conn) = test_conn();
        insert(&conn, "uid-2", 10, 10, 1, 0).unwrap();
        update_ref_count(&conn, "uid-2", 5).unwrap();
        let blob = find_by_uid(&conn, "uid-2").unwrap().unwrap();
        assert_eq!(blob.ref_count, 5);
    }

    #[test]
    fn delete_removes_row() {
        let (_temp, conn) = test_conn();
        insert(&conn, "uid-3", 10, 10, 1, 0).unwrap();
        delete_by_uid(&conn, "uid-3").unwrap();
        assert!(find_by_uid(&conn, "uid-3").unwrap().is_none());
    }
}
