// src/action_store.rs

//! Action Store (AS)
//!
//! Owns the `acs`, `acs_blobs`, `reqs`, `acs_gc`, `deps_from`/`deps_to`
//! tables and composes [`CasManager`] operations under a single DB+FS
//! transaction per request (§4.3).

use crate::cachedb::models::{action, dep_edge, edge, gc_meta, request};
use crate::cas_manager::{BlobIdentity, CasManager};
use crate::error::{Error, Result};
use crate::fs::path;
use crate::fs::transaction_log::TransactionLog;
use crate::types::{CacheResult, GetUid, HasUid, NodeDependencies, PutUid, RemoveUid, ReplacementMode};
use rusqlite::Connection;

pub struct ActionStore<'a> {
    cas: &'a CasManager<'a>,
}

impl<'a> ActionStore<'a> {
    pub fn new(cas: &'a CasManager<'a>) -> Self {
        Self { cas }
    }

    /// §4.3 `put_uid`. `conn` must be inside the caller's DB transaction;
    /// `tl` is committed or rolled back by the caller once the DB
    /// transaction itself has committed (§5 ordering: FS then DB is
    /// staged together, but the FS promotion only becomes durable after
    /// the DB commit succeeds).
    pub fn put_uid(
        &self,
        conn: &Connection,
        tl: &mut TransactionLog,
        req: &PutUid,
        access_cnt: i64,
        now_ms: i64,
    ) -> Result<CacheResult> {
        path::require_absolute(&req.root_path)?;
        for bi in &req.blob_info {
            if !bi.path.starts_with(&req.root_path) {
                return Err(Error::InvalidRequest(format!(
                    "blob_info path {} is not under root_path {}",
                    bi.path.display(),
                    req.root_path.display()
                )));
            }
        }
        if let Some(names) = &req.db_file_names
            && names.len() != req.blob_info.len()
        {
            return Err(Error::InvalidRequest(format!(
                "db_file_names has {} entries but blob_info has {}",
                names.len(),
                req.blob_info.len()
            )));
        }

        let existing = action::find_by_uid(conn, &req.ac_hash)?;

        if let Some(existing) = &existing {
            if req.replacement_mode == ReplacementMode::UseOldBlobs {
                let prior_request_count = gc_meta::find(conn, existing.id)?.map(|g| g.request_count).unwrap_or(0);
                gc_meta::upsert(conn, existing.id, access_cnt, now_ms, prior_request_count, req.is_result)?;
                self.lock_for_peer(conn, existing.id, req.peer.as_ref())?;
                return Ok(CacheResult {
                    success: true,
                    proc_id: req.peer.as_ref().map(|p| p.proc.pid),
                    acs_diff: 0,
                    ..Default::default()
                });
            }
            self.remove_blobs(conn, tl, existing.id)?;
        }

        let action_id = if let Some(existing) = &existing {
            action::update(conn, &req.ac_hash, req.weight, &req.origin)?;
            existing.id
        } else {
            action::insert(conn, &req.ac_hash, req.weight, &req.origin)?
        };

        let mut result = CacheResult {
            success: true,
            origin: Some(req.origin.clone()),
            acs_diff: if existing.is_some() { 0 } else { 1 },
            ..Default::default()
        };

        for bi in &req.blob_info {
            let (uid, put_result) = self
                .cas
                .put_blob(conn, tl, BlobIdentity::FromSource(&bi.path), 1)?;
            let blob_id = crate::cachedb::models::blob::find_by_uid(conn, uid.as_str())?
                .ok_or_else(|| Error::Invariant(format!("blob {uid} missing immediately after put_blob")))?
                .id;
            edge::insert(conn, action_id, blob_id, &bi.relative_path)?;

            result.total_size_diff += put_result.size_diff;
            result.total_fs_size_diff += put_result.fs_size_diff;
            result.blob_diff += 1;
            if let Some(optim) = put_result.optim {
                result.copy_mode = Some(match result.copy_mode {
                    Some(existing) => existing.meet(optim),
                    None => optim,
                });
            }
        }

        // Ensure the `acs_gc` row exists (preserving any prior request
        // count) before `lock_for_peer` issues a raw `UPDATE` against it.
        let prior_request_count = gc_meta::find(conn, action_id)?.map(|g| g.request_count).unwrap_or(0);
        gc_meta::upsert(conn, action_id, access_cnt, now_ms, prior_request_count, req.is_result)?;
        self.lock_for_peer(conn, action_id, req.peer.as_ref())?;
        result.proc_id = req.peer.as_ref().map(|p| p.proc.pid);

        Ok(result)
    }

    fn lock_for_peer(
        &self,
        conn: &Connection,
        action_id: i64,
        peer: Option<&crate::types::Peer>,
    ) -> Result<()> {
        if let Some(peer) = peer {
            let task_id = peer.task_gsid.as_deref().unwrap_or_default();
            request::insert(conn, action_id, task_id)?;
            gc_meta::increment_request_count(conn, action_id)?;
        }
        Ok(())
    }

    /// Drop every blob reference an action currently holds and remove its
    /// edges, without touching the action row itself.
    fn remove_blobs(&self, conn: &Connection, tl: &mut TransactionLog, action_id: i64) -> Result<()> {
        let edges = edge::list_for_action(conn, action_id)?;
        edge::delete_for_action(conn, action_id)?;

        for e in edges {
            let blob = blob_by_id(conn, e.blob_id)?;
            let uid = crate::hash::Uid::from_stored(self.cas.algorithm(), blob.uid);
            self.cas.put_blob(conn, tl, BlobIdentity::Known(uid), -1)?;
        }
        Ok(())
    }

    /// §4.3 `get_uid`.
    pub fn get_uid(
        &self,
        conn: &Connection,
        tl: &mut TransactionLog,
        req: &GetUid,
        access_cnt: i64,
        now_ms: i64,
    ) -> Result<CacheResult> {
        path::require_absolute(&req.dest_path)?;

        let Some(action) = action::find_by_uid(conn, &req.ac_hash)? else {
            return Ok(CacheResult::not_found());
        };

        let mut result = CacheResult {
            success: true,
            origin: Some(action.origin.clone()),
            ..Default::default()
        };

        for e in edge::list_for_action(conn, action.id)? {
            if let Some(filter) = &req.filter
                && &e.relative_path != filter
            {
                continue;
            }
            let blob = blob_by_id(conn, e.blob_id)?;
            let uid = crate::hash::Uid::from_stored(self.cas.algorithm(), blob.uid.clone());
            let dest = path::safe_join(&req.dest_path, &e.relative_path)?;
            let get_result = self.cas.get_blob(conn, tl, &uid, &dest)?;
            if !get_result.found {
                return Err(Error::BlobNotFound(blob.uid));
            }
            if let Some(optim) = get_result.optim {
                result.copy_mode = Some(match result.copy_mode {
                    Some(existing) => existing.meet(optim),
                    None => optim,
                });
            }
        }

        let gc = gc_meta::find(conn, action.id)?;
        let request_count = gc.map(|g| g.request_count).unwrap_or(0);
        gc_meta::upsert(conn, action.id, access_cnt, now_ms, request_count, req.is_result)?;

        if req.release {
            if let Some(peer) = &req.peer {
                let task_id = peer.task_gsid.as_deref().unwrap_or_default();
                request::delete(conn, action.id, task_id)?;
                gc_meta::decrement_request_count(conn, action.id)?;
            }
        }

        Ok(result)
    }

    /// §4.3 `has_uid`: read-only existence check that also refreshes
    /// `acs_gc` and optionally registers a request lock.
    pub fn has_uid(&self, conn: &Connection, req: &HasUid, access_cnt: i64, now_ms: i64) -> Result<CacheResult> {
        let Some(action) = action::find_by_uid(conn, &req.ac_hash)? else {
            return Ok(CacheResult::not_found());
        };

        let gc = gc_meta::find(conn, action.id)?;
        let request_count = gc.map(|g| g.request_count).unwrap_or(0);
        gc_meta::upsert(conn, action.id, access_cnt, now_ms, request_count, req.is_result)?;

        self.lock_for_peer(conn, action.id, req.peer.as_ref())?;

        Ok(CacheResult {
            success: true,
            origin: Some(action.origin),
            ..Default::default()
        })
    }

    /// §4.3 `remove_uid`.
    pub fn remove_uid(&self, conn: &Connection, tl: &mut TransactionLog, req: &RemoveUid) -> Result<CacheResult> {
        let Some(action) = action::find_by_uid(conn, &req.ac_hash)? else {
            return Ok(CacheResult::not_found());
        };

        let request_count = gc_meta::find(conn, action.id)?.map(|g| g.request_count).unwrap_or(0);
        if req.forced_removal || request_count == 0 {
            self.remove_uid_nested(conn, tl, action.id)?;
            Ok(CacheResult {
                success: true,
                acs_diff: -1,
                ..Default::default()
            })
        } else {
            Ok(CacheResult {
                success: false,
                ..Default::default()
            })
        }
    }

    /// §4.3 `remove_uid_nested`, shared with the GC's eviction sweep.
    pub fn remove_uid_nested(&self, conn: &Connection, tl: &mut TransactionLog, action_id: i64) -> Result<()> {
        self.remove_blobs(conn, tl, action_id)?;
        dep_edge::delete_for_action(conn, action_id)?;
        request::delete_for_action(conn, action_id)?;
        gc_meta::delete(conn, action_id)?;
        action::delete(conn, action_id)?;
        Ok(())
    }

    /// §4.3 `put_deps`: populate the dependency graph, skipping (and
    /// counting) dep uids that don't resolve to an existing action.
    pub fn put_deps(&self, conn: &Connection, req: &NodeDependencies) -> Result<i64> {
        let Some(from_id) = action::rowid_by_uid(conn, &req.node_hash)? else {
            return Err(Error::ActionNotFound(req.node_hash.clone()));
        };

        let mut linked = 0i64;
        let mut skipped = 0i64;
        for (edge_index, dep_uid) in req.required_hashes.iter().enumerate() {
            match action::rowid_by_uid(conn, dep_uid)? {
                Some(to_id) => {
                    dep_edge::insert(conn, from_id, to_id, edge_index as i64)?;
                    linked += 1;
                }
                None => skipped += 1,
            }
        }

        action::set_num_deps(conn, from_id, linked)?;
        if skipped > 0 {
            tracing::warn!(skipped, node = %req.node_hash, "put_deps: some dependency uids did not resolve");
        }
        Ok(linked)
    }
}

fn blob_by_id(conn: &Connection, blob_id: i64) -> Result<crate::cachedb::models::blob::Blob> {
    crate::cachedb::models::blob::find_by_id(conn, blob_id)?
        .ok_or_else(|| Error::Invariant(format!("acs_blobs references missing blob id {blob_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cachedb;
    use crate::fs::blob_processor::BlobProcessor;
    use crate::fs::cas_store::CasStore;
    use crate::hash::HashAlgorithm;
    use crate::types::{BlobInfo, Peer, Proc};
    use std::fs;
    use std::sync::Arc;
    use tempfile::{NamedTempFile, TempDir};

    fn setup() -> (TempDir, NamedTempFile, Arc<CasStore>, BlobProcessor, Connection) {
        let root = TempDir::new().unwrap();
        let dbfile = NamedTempFile::new().unwrap();
        let cas = Arc::new(CasStore::new(root.path()).unwrap());
        let bp = BlobProcessor::new(cas.clone(), HashAlgorithm::Xxh128, 4096);
        let conn = cachedb::open(dbfile.path()).unwrap();
        (root, dbfile, cas, bp, conn)
    }

    fn put_req(src_dir: &TempDir, ac_hash: &str, content: &[u8]) -> PutUid {
        let source = src_dir.path().join("a.out");
        fs::write(&source, content).unwrap();
        PutUid {
            ac_hash: ac_hash.to_string(),
            root_path: src_dir.path().to_path_buf(),
            blob_info: vec![BlobInfo {
                path: source,
                relative_path: "a.out".to_string(),
            }],
            db_file_names: None,
            weight: 0,
            origin: "build".to_string(),
            replacement_mode: ReplacementMode::Replace,
            is_result: true,
            peer: None,
        }
    }

    #[test]
    fn put_uid_creates_action_and_edge() {
        let (_root, _dbfile, cas, bp, conn) = setup();
        let manager = CasManager::new(&bp);
        let store = ActionStore::new(&manager);
        let src_dir = TempDir::new().unwrap();
        let req = put_req(&src_dir, "action-1", b"hello");

        let mut tl = TransactionLog::begin(cas.clone(), "task-1", true).unwrap();
        let result = store.put_uid(&conn, &mut tl, &req, 1, 1000).unwrap();
        tl.commit().unwrap();

        assert!(result.success);
        assert_eq!(result.acs_diff, 1);
        assert_eq!(result.blob_diff, 1);
        assert!(action::find_by_uid(&conn, "action-1").unwrap().is_some());
    }

    #[test]
    fn get_uid_materializes_blob_at_relative_path() {
        let (root, _dbfile, cas, bp, conn) = setup();
        let manager = CasManager::new(&bp);
        let store = ActionStore::new(&manager);
        let src_dir = TempDir::new().unwrap();
        let req = put_req(&src_dir, "action-2", b"payload");

        let mut tl = TransactionLog::begin(cas.clone(), "task-2", true).unwrap();
        store.put_uid(&conn, &mut tl, &req, 1, 1000).unwrap();
        tl.commit().unwrap();

        let get_req = GetUid {
            ac_hash: "action-2".to_string(),
            dest_path: root.path().join("out"),
            optimization: crate::types::GetOptimization::Hardlink,
            filter: None,
            release: false,
            is_result: true,
            peer: None,
        };
        let mut tl2 = TransactionLog::begin(cas.clone(), "task-3", true).unwrap();
        let result = store.get_uid(&conn, &mut tl2, &get_req, 2, 2000).unwrap();
        tl2.commit().unwrap();

        assert!(result.success);
        assert_eq!(fs::read(root.path().join("out").join("a.out")).unwrap(), b"payload");
    }

    #[test]
    fn get_uid_not_found_for_missing_action() {
        let (root, _dbfile, _cas, bp, conn) = setup();
        let manager = CasManager::new(&bp);
        let store = ActionStore::new(&manager);
        let cas = Arc::new(CasStore::new(root.path()).unwrap());
        let get_req = GetUid {
            ac_hash: "missing".to_string(),
            dest_path: root.path().join("out"),
            optimization: crate::types::GetOptimization::Hardlink,
            filter: None,
            release: false,
            is_result: true,
            peer: None,
        };
        let mut tl = TransactionLog::begin(cas, "task-4", true).unwrap();
        let result = store.get_uid(&conn, &mut tl, &get_req, 1, 1000).unwrap();
        tl.rollback().unwrap();
        assert!(!result.success);
    }

    #[test]
    fn remove_uid_drops_action_and_blob_when_unreferenced() {
        let (_root, _dbfile, cas, bp, conn) = setup();
        let manager = CasManager::new(&bp);
        let store = ActionStore::new(&manager);
        let src_dir = TempDir::new().unwrap();
        let req = put_req(&src_dir, "action-3", b"gone soon");

        let mut tl = TransactionLog::begin(cas.clone(), "task-5", true).unwrap();
        store.put_uid(&conn, &mut tl, &req, 1, 1000).unwrap();
        tl.commit().unwrap();

        let mut tl2 = TransactionLog::begin(cas.clone(), "task-6", true).unwrap();
        let result = store
            .remove_uid(&conn, &mut tl2, &RemoveUid { ac_hash: "action-3".to_string(), forced_removal: true })
            .unwrap();
        tl2.commit().unwrap();

        assert!(result.success);
        assert!(action::find_by_uid(&conn, "action-3").unwrap().is_none());
    }

    #[test]
    fn remove_uid_no_op_when_live_request_and_not_forced() {
        let (_root, _dbfile, cas, bp, conn) = setup();
        let manager = CasManager::new(&bp);
        let store = ActionStore::new(&manager);
        let src_dir = TempDir::new().unwrap();
        let mut req = put_req(&src_dir, "action-4", b"held");
        req.peer = Some(Peer {
            proc: Proc { pid: 42, start_time: 1, expected_lifetime: None },
            task_gsid: Some("task-7".to_string()),
        });

        let mut tl = TransactionLog::begin(cas.clone(), "task-7", true).unwrap();
        store.put_uid(&conn, &mut tl, &req, 1, 1000).unwrap();
        tl.commit().unwrap();

        let mut tl2 = TransactionLog::begin(cas.clone(), "task-8", true).unwrap();
        let result = store
            .remove_uid(&conn, &mut tl2, &RemoveUid { ac_hash: "action-4".to_string(), forced_removal: false })
            .unwrap();
        tl2.rollback().unwrap();

        assert!(!result.success);
        assert!(action::find_by_uid(&conn, "action-4").unwrap().is_some());
    }

    #[test]
    fn put_deps_links_existing_and_skips_missing() {
        let (_root, _dbfile, cas, bp, conn) = setup();
        let manager = CasManager::new(&bp);
        let store = ActionStore::new(&manager);
        let src_dir1 = TempDir::new().unwrap();
        let src_dir2 = TempDir::new().unwrap();

        let mut tl1 = TransactionLog::begin(cas.clone(), "task-9", true).unwrap();
        store.put_uid(&conn, &mut tl1, &put_req(&src_dir1, "node-a", b"a"), 1, 1000).unwrap();
        tl1.commit().unwrap();
        let mut tl2 = TransactionLog::begin(cas.clone(), "task-10", true).unwrap();
        store.put_uid(&conn, &mut tl2, &put_req(&src_dir2, "node-b", b"b"), 1, 1000).unwrap();
        tl2.commit().unwrap();

        let linked = store
            .put_deps(
                &conn,
                &NodeDependencies {
                    node_hash: "node-a".to_string(),
                    required_hashes: vec!["node-b".to_string(), "node-missing".to_string()],
                },
            )
            .unwrap();

        assert_eq!(linked, 1);
    }
}
