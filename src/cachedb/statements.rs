// src/cachedb/statements.rs

//! Named, schema-checked SQL statements
//!
//! Every statement the core issues is declared here as a
//! [`StatementKind`] carrying its SQL text and the bound-parameter names
//! it expects. [`verify_all`] prepares each one against a live connection
//! at startup and checks the declared parameter set matches what SQLite
//! actually parsed out of the statement — catching a typo'd `:uid` or a
//! column that was renamed out from under a query before it becomes a
//! runtime failure deep inside a transaction.

use crate::error::{Error, Result};
use rusqlite::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    InsertBlob,
    SelectBlobByUid,
    UpdateBlobRefCount,
    DeleteBlobByUid,

    InsertAction,
    UpdateAction,
    SelectActionByUid,
    SelectActionRowid,

    InsertAcsBlob,
    SelectAcsBlobsForAction,
    DeleteAcsBlobsForAction,

    UpsertAcsGc,
    SelectAcsGc,
    DecrementRequestCount,

    InsertReq,
    DeleteReq,
    CountReqsForAction,
    DeleteReqsForTask,

    InsertDepsFrom,
    InsertDepsTo,

    UpsertTask,
    InsertRunningProc,
    SelectRunningProcsForTask,
    DeleteRunningProc,
    DeleteTaskIfEmpty,
    SelectAllTaskIds,

    SelectBlobById,
    SetActionNumDeps,
    DeleteAction,
    IncrementRequestCount,
    EvictionCandidates,
    CandidatesOlderThan,
    SelectReqActionIdsForTask,
    DeleteReqsForAction,
    DeleteAcsGcForAction,
    SelectBigBlobIds,
    SelectActionsForBlob,
    SelectBlobChunk,
    DeleteDepsFromForAction,
    DeleteDepsToForAction,
}

impl StatementKind {
    pub const ALL: &'static [StatementKind] = &[
        StatementKind::InsertBlob,
        StatementKind::SelectBlobByUid,
        StatementKind::UpdateBlobRefCount,
        StatementKind::DeleteBlobByUid,
        StatementKind::InsertAction,
        StatementKind::UpdateAction,
        StatementKind::SelectActionByUid,
        StatementKind::SelectActionRowid,
        StatementKind::InsertAcsBlob,
        StatementKind::SelectAcsBlobsForAction,
        StatementKind::DeleteAcsBlobsForAction,
        StatementKind::UpsertAcsGc,
        StatementKind::SelectAcsGc,
        StatementKind::DecrementRequestCount,
        StatementKind::InsertReq,
        StatementKind::DeleteReq,
        StatementKind::CountReqsForAction,
        StatementKind::DeleteReqsForTask,
        StatementKind::InsertDepsFrom,
        StatementKind::InsertDepsTo,
        StatementKind::UpsertTask,
        StatementKind::InsertRunningProc,
        StatementKind::SelectRunningProcsForTask,
        StatementKind::DeleteRunningProc,
        StatementKind::DeleteTaskIfEmpty,
        StatementKind::SelectAllTaskIds,
        StatementKind::SelectBlobById,
        StatementKind::SetActionNumDeps,
        StatementKind::DeleteAction,
        StatementKind::IncrementRequestCount,
        StatementKind::EvictionCandidates,
        StatementKind::CandidatesOlderThan,
        StatementKind::SelectReqActionIdsForTask,
        StatementKind::DeleteReqsForAction,
        StatementKind::DeleteAcsGcForAction,
        StatementKind::SelectBigBlobIds,
        StatementKind::SelectActionsForBlob,
        StatementKind::SelectBlobChunk,
        StatementKind::DeleteDepsFromForAction,
        StatementKind::DeleteDepsToForAction,
    ];

    pub fn sql(&self) -> &'static str {
        match self {
            Self::InsertBlob => {
                "INSERT INTO blobs (uid, size, fs_size, ref_count, mode) \
                 VALUES (:uid, :size, :fs_size, :ref_count, :mode)"
            }
            Self::SelectBlobByUid => {
                "SELECT id, uid, size, fs_size, ref_count, mode, store_mode FROM blobs WHERE uid = :uid"
            }
            Self::UpdateBlobRefCount => "UPDATE blobs SET ref_count = :ref_count WHERE uid = :uid",
            Self::DeleteBlobByUid => "DELETE FROM blobs WHERE uid = :uid",

            Self::InsertAction => {
                "INSERT INTO acs (uid, weight, origin) VALUES (:uid, :weight, :origin)"
            }
            Self::UpdateAction => "UPDATE acs SET weight = :weight, origin = :origin WHERE uid = :uid",
            Self::SelectActionByUid => "SELECT id, uid, weight, origin, num_deps FROM acs WHERE uid = :uid",
            Self::SelectActionRowid => "SELECT id FROM acs WHERE uid = :uid",

            Self::InsertAcsBlob => {
                "INSERT INTO acs_blobs (action_id, blob_id, relative_path) \
                 VALUES (:action_id, :blob_id, :relative_path)"
            }
            Self::SelectAcsBlobsForAction => {
                "SELECT blob_id, relative_path FROM acs_blobs WHERE action_id = :action_id"
            }
            Self::DeleteAcsBlobsForAction => "DELETE FROM acs_blobs WHERE action_id = :action_id",

            Self::UpsertAcsGc => {
                "INSERT INTO acs_gc (action_id, last_access, last_access_time, request_count, is_result) \
                 VALUES (:action_id, :last_access, :last_access_time, :request_count, :is_result) \
                 ON CONFLICT(action_id) DO UPDATE SET \
                   last_access = :last_access, last_access_time = :last_access_time, is_result = :is_result"
            }
            Self::SelectAcsGc => {
                "SELECT last_access, last_access_time, request_count, is_result FROM acs_gc WHERE action_id = :action_id"
            }
            Self::DecrementRequestCount => {
                "UPDATE acs_gc SET request_count = MAX(request_count - 1, 0) WHERE action_id = :action_id"
            }

            Self::InsertReq => "INSERT INTO reqs (action_id, task_id) VALUES (:action_id, :task_id)",
            Self::DeleteReq => "DELETE FROM reqs WHERE action_id = :action_id AND task_id = :task_id",
            Self::CountReqsForAction => "SELECT COUNT(*) FROM reqs WHERE action_id = :action_id",
            Self::DeleteReqsForTask => "DELETE FROM reqs WHERE task_id = :task_id",

            Self::InsertDepsFrom => {
                "INSERT INTO deps_from (from_action_id, to_action_id, edge_index) \
                 VALUES (:from_action_id, :to_action_id, :edge_index)"
            }
            Self::InsertDepsTo => {
                "INSERT INTO deps_to (to_action_id, from_action_id, edge_index) \
                 VALUES (:to_action_id, :from_action_id, :edge_index)"
            }

            Self::UpsertTask => {
                "INSERT INTO tasks (task_id, task_gsid) VALUES (:task_id, :task_gsid) \
                 ON CONFLICT(task_id) DO UPDATE SET task_gsid = :task_gsid"
            }
            Self::InsertRunningProc => {
                "INSERT OR IGNORE INTO running_procs (task_id, pid, start_time, expected_lifetime) \
                 VALUES (:task_id, :pid, :start_time, :expected_lifetime)"
            }
            Self::SelectRunningProcsForTask => {
                "SELECT pid, start_time, expected_lifetime FROM running_procs WHERE task_id = :task_id"
            }
            Self::DeleteRunningProc => {
                "DELETE FROM running_procs WHERE task_id = :task_id AND pid = :pid AND start_time = :start_time"
            }
            Self::DeleteTaskIfEmpty => {
                "DELETE FROM tasks WHERE task_id = :task_id \
                 AND NOT EXISTS (SELECT 1 FROM running_procs WHERE task_id = :task_id)"
            }
            Self::SelectAllTaskIds => "SELECT DISTINCT task_id FROM running_procs",

            Self::SelectBlobById => {
                "SELECT id, uid, size, fs_size, ref_count, mode, store_mode FROM blobs WHERE id = :id"
            }
            Self::SetActionNumDeps => "UPDATE acs SET num_deps = :num_deps WHERE id = :id",
            Self::DeleteAction => "DELETE FROM acs WHERE id = :id",
            Self::IncrementRequestCount => {
                "UPDATE acs_gc SET request_count = request_count + 1 WHERE action_id = :action_id"
            }
            Self::EvictionCandidates => {
                "SELECT action_id, last_access FROM acs_gc \
                 WHERE last_access > :cursor AND request_count = 0 \
                 ORDER BY last_access ASC LIMIT :batch_size"
            }
            Self::CandidatesOlderThan => {
                "SELECT action_id FROM acs_gc WHERE last_access_time < :cutoff_ms AND request_count = 0 \
                 ORDER BY last_access_time ASC"
            }
            Self::SelectReqActionIdsForTask => "SELECT action_id FROM reqs WHERE task_id = :task_id",
            Self::DeleteReqsForAction => "DELETE FROM reqs WHERE action_id = :action_id",
            Self::DeleteAcsGcForAction => "DELETE FROM acs_gc WHERE action_id = :action_id",
            Self::SelectBigBlobIds => "SELECT id FROM blobs WHERE fs_size >= :size_limit",
            Self::SelectActionsForBlob => {
                "SELECT DISTINCT action_id FROM acs_blobs WHERE blob_id = :blob_id"
            }
            Self::SelectBlobChunk => {
                "SELECT id, uid FROM blobs WHERE id >= :start_rowid ORDER BY id ASC LIMIT :limit"
            }
            Self::DeleteDepsFromForAction => {
                "DELETE FROM deps_from WHERE from_action_id = :action_id OR to_action_id = :action_id"
            }
            Self::DeleteDepsToForAction => {
                "DELETE FROM deps_to WHERE from_action_id = :action_id OR to_action_id = :action_id"
            }
        }
    }

    /// The bound-parameter names this statement's author declares it
    /// uses. Checked against what SQLite actually parsed in `verify_all`.
    pub fn expected_params(&self) -> &'static [&'static str] {
        match self {
            Self::InsertBlob => &[":uid", ":size", ":fs_size", ":ref_count", ":mode"],
            Self::SelectBlobByUid => &[":uid"],
            Self::UpdateBlobRefCount => &[":ref_count", ":uid"],
            Self::DeleteBlobByUid => &[":uid"],

            Self::InsertAction => &[":uid", ":weight", ":origin"],
            Self::UpdateAction => &[":weight", ":origin", ":uid"],
            Self::SelectActionByUid => &[":uid"],
            Self::SelectActionRowid => &[":uid"],

            Self::InsertAcsBlob => &[":action_id", ":blob_id", ":relative_path"],
            Self::SelectAcsBlobsForAction => &[":action_id"],
            Self::DeleteAcsBlobsForAction => &[":action_id"],

            Self::UpsertAcsGc => &[
                ":action_id",
                ":last_access",
                ":last_access_time",
                ":request_count",
                ":is_result",
                ":last_access",
                ":last_access_time",
                ":is_result",
            ],
            Self::SelectAcsGc => &[":action_id"],
            Self::DecrementRequestCount => &[":action_id"],

            Self::InsertReq => &[":action_id", ":task_id"],
            Self::DeleteReq => &[":action_id", ":task_id"],
            Self::CountReqsForAction => &[":action_id"],
            Self::DeleteReqsForTask => &[":task_id"],

            Self::InsertDepsFrom => &[":from_action_id", ":to_action_id", ":edge_index"],
            Self::InsertDepsTo => &[":to_action_id", ":from_action_id", ":edge_index"],

            Self::UpsertTask => &[":task_id", ":task_gsid", ":task_gsid"],
            Self::InsertRunningProc => &[":task_id", ":pid", ":start_time", ":expected_lifetime"],
            Self::SelectRunningProcsForTask => &[":task_id"],
            Self::DeleteRunningProc => &[":task_id", ":pid", ":start_time"],
            Self::DeleteTaskIfEmpty => &[":task_id", ":task_id"],
            Self::SelectAllTaskIds => &[],

            Self::SelectBlobById => &[":id"],
            Self::SetActionNumDeps => &[":num_deps", ":id"],
            Self::DeleteAction => &[":id"],
            Self::IncrementRequestCount => &[":action_id"],
            Self::EvictionCandidates => &[":cursor", ":batch_size"],
            Self::CandidatesOlderThan => &[":cutoff_ms"],
            Self::SelectReqActionIdsForTask => &[":task_id"],
            Self::DeleteReqsForAction => &[":action_id"],
            Self::DeleteAcsGcForAction => &[":action_id"],
            Self::SelectBigBlobIds => &[":size_limit"],
            Self::SelectActionsForBlob => &[":blob_id"],
            Self::SelectBlobChunk => &[":start_rowid", ":limit"],
            Self::DeleteDepsFromForAction => &[":action_id", ":action_id"],
            Self::DeleteDepsToForAction => &[":action_id", ":action_id"],
        }
    }
}

/// Prepare every declared statement against `conn` and verify that the
/// parameter names SQLite parsed out of the SQL text match what the
/// statement's author declared. Call once per connection at startup;
/// a mismatch is a fatal schema-drift error (§7).
pub fn verify_all(conn: &Connection) -> Result<()> {
    for kind in StatementKind::ALL {
        verify_one(conn, *kind)?;
    }
    Ok(())
}

fn verify_one(conn: &Connection, kind: StatementKind) -> Result<()> {
    let stmt = conn.prepare(kind.sql())?;
    let count = stmt.parameter_count();
    let expected = kind.expected_params();

    if count != expected.len() {
        return Err(Error::SchemaDrift {
            statement: format!("{kind:?}"),
            reason: format!(
                "parameter count mismatch: sql has {count}, declared {}",
                expected.len()
            ),
        });
    }

    for (i, name) in expected.iter().enumerate() {
        let actual = stmt.parameter_name(i + 1);
        if actual != Some(*name) {
            return Err(Error::SchemaDrift {
                statement: format!("{kind:?}"),
                reason: format!("parameter {} expected {name}, sql has {actual:?}", i + 1),
            });
        }
    }

    Ok(())
}
