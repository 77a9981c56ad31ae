// src/gc.rs

//! GC selectors and the async eviction iterator (§4.4)
//!
//! A GC pass always does the same thing — find eviction candidates, call
//! [`ActionStore::remove_uid_nested`] for each under one DB+FS
//! transaction, and stop once the cache is back under its target size or
//! the candidate set is exhausted. What differs between the synchronous
//! selectors and the async iterator is only how candidates are chosen and
//! how large a batch runs before that transaction commits.

use crate::action_store::ActionStore;
use crate::cachedb;
use crate::cachedb::models::gc_meta;
use crate::error::Result;
use crate::fs::cas_store::CasStore;
use crate::fs::transaction_log::TransactionLog;
use rusqlite::{params, Connection};
use std::sync::Arc;
use tracing::{debug, info};

/// Batch size for both the async iterator and the synchronous `TotalSize`
/// selector, bounding how long any single transaction stays open.
pub const MAX_REMOVE_COUNT: usize = 500;

/// Headroom target: a pass aims to bring usage below
/// `CLEANUP_FACTOR * limit` rather than exactly to the limit, so a small
/// burst of puts doesn't immediately re-trigger GC.
pub const CLEANUP_FACTOR: f64 = 0.9;

/// The three synchronous GC selectors from §4.4.
#[derive(Debug, Clone, Copy)]
pub enum SyncSelector {
    /// Evict oldest-first until `current_bytes` falls below `target_bytes`.
    TotalSize { target_bytes: u64 },
    /// Evict every action whose `last_access_time` is older than
    /// `now_ms - age_limit_ms`.
    OldItems { age_limit_ms: i64, now_ms: i64 },
    /// Evict every action referencing a blob at or above `size_limit`.
    BigBlobs { size_limit: i64 },
}

/// Outcome of a completed GC pass (synchronous or the final result of
/// draining the async iterator to completion).
#[derive(Debug, Clone, Copy, Default)]
pub struct GcOutcome {
    pub actions_evicted: u64,
}

/// Run a synchronous selector to convergence. Unlike the async iterator,
/// this does not yield between batches for client requests — it is meant
/// for an explicit `force_gc` call, not the steady-state background pass.
pub fn run_synchronous(
    conn: &mut Connection,
    cas: &Arc<CasStore>,
    action_store: &ActionStore<'_>,
    selector: SyncSelector,
    task_id: &str,
    max_retries: u32,
) -> Result<GcOutcome> {
    match selector {
        SyncSelector::TotalSize { target_bytes } => {
            run_total_size(conn, cas, action_store, target_bytes, task_id, max_retries)
        }
        SyncSelector::OldItems { age_limit_ms, now_ms } => {
            run_old_items(conn, cas, action_store, now_ms - age_limit_ms, task_id, max_retries)
        }
        SyncSelector::BigBlobs { size_limit } => {
            run_big_blobs(conn, cas, action_store, size_limit, task_id, max_retries)
        }
    }
}

fn run_total_size(
    conn: &mut Connection,
    cas: &Arc<CasStore>,
    action_store: &ActionStore<'_>,
    target_bytes: u64,
    task_id: &str,
    max_retries: u32,
) -> Result<GcOutcome> {
    let mut outcome = GcOutcome::default();
    let mut iter = EvictionIterator::new();

    loop {
        if current_total_size(conn)? <= target_bytes {
            break;
        }
        match iter.step(conn, cas, action_store, task_id, max_retries)? {
            StepOutcome::Done => break,
            StepOutcome::Continued { evicted, .. } => {
                outcome.actions_evicted += evicted as u64;
            }
        }
    }

    info!(evicted = outcome.actions_evicted, "TotalSize GC pass complete");
    Ok(outcome)
}

fn run_old_items(
    conn: &mut Connection,
    cas: &Arc<CasStore>,
    action_store: &ActionStore<'_>,
    cutoff_ms: i64,
    task_id: &str,
    max_retries: u32,
) -> Result<GcOutcome> {
    let candidates = gc_meta::candidates_older_than(conn, cutoff_ms)?;
    let mut outcome = GcOutcome::default();

    for chunk in candidates.chunks(MAX_REMOVE_COUNT) {
        let mut tl = TransactionLog::begin(cas.clone(), task_id, true)?;
        let mut evicted = 0u64;
        let result = cachedb::with_retrying_txn(conn, true, max_retries, |txn| {
            for action_id in chunk {
                action_store.remove_uid_nested(txn, &mut tl, *action_id)?;
                evicted += 1;
            }
            Ok(())
        });
        match result {
            Ok(()) => tl.commit()?,
            Err(e) => {
                tl.rollback()?;
                return Err(e);
            }
        }
        outcome.actions_evicted += evicted;
    }

    info!(evicted = outcome.actions_evicted, cutoff_ms, "OldItems GC pass complete");
    Ok(outcome)
}

fn run_big_blobs(
    conn: &mut Connection,
    cas: &Arc<CasStore>,
    action_store: &ActionStore<'_>,
    size_limit: i64,
    task_id: &str,
    max_retries: u32,
) -> Result<GcOutcome> {
    let big_blob_ids: Vec<i64> = conn
        .prepare_cached(cachedb::statements::StatementKind::SelectBigBlobIds.sql())?
        .query_map(params![size_limit], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut outcome = GcOutcome::default();
    for blob_id in big_blob_ids {
        let action_ids: Vec<i64> = conn
            .prepare_cached(cachedb::statements::StatementKind::SelectActionsForBlob.sql())?
            .query_map(params![blob_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for chunk in action_ids.chunks(MAX_REMOVE_COUNT) {
            let mut tl = TransactionLog::begin(cas.clone(), task_id, true)?;
            let mut evicted = 0u64;
            let result = cachedb::with_retrying_txn(conn, true, max_retries, |txn| {
                for action_id in chunk {
                    action_store.remove_uid_nested(txn, &mut tl, *action_id)?;
                    evicted += 1;
                }
                Ok(())
            });
            match result {
                Ok(()) => tl.commit()?,
                Err(e) => {
                    tl.rollback()?;
                    return Err(e);
                }
            }
            outcome.actions_evicted += evicted;
        }
    }

    info!(evicted = outcome.actions_evicted, size_limit, "BigBlobs GC pass complete");
    Ok(outcome)
}

pub(crate) fn current_total_size(conn: &Connection) -> Result<u64> {
    let total: i64 = conn.query_row("SELECT COALESCE(SUM(fs_size), 0) FROM blobs", [], |row| row.get(0))?;
    Ok(total.max(0) as u64)
}

/// Outcome of a single asynchronous eviction batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continued { next_cursor: i64, evicted: usize },
    Done,
}

/// Cursor-resumable async eviction, batched at [`MAX_REMOVE_COUNT`] so a
/// background pass never holds a single DB+FS transaction open across
/// hundreds of evictions (§4.4 "works in batches ... after each batch
/// commits the DB+FS transaction to bound peak latency").
pub struct EvictionIterator {
    cursor: i64,
    batch_size: usize,
}

impl Default for EvictionIterator {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionIterator {
    pub fn new() -> Self {
        Self { cursor: 0, batch_size: MAX_REMOVE_COUNT }
    }

    pub fn resume_from(cursor: i64) -> Self {
        Self { cursor, batch_size: MAX_REMOVE_COUNT }
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Run one batch of up to `batch_size` evictions in a single DB+FS
    /// transaction. When the cursor reaches `0` after an empty candidate
    /// page, the pass is complete (§4.4).
    pub fn step(
        &mut self,
        conn: &mut Connection,
        cas: &Arc<CasStore>,
        action_store: &ActionStore<'_>,
        task_id: &str,
        max_retries: u32,
    ) -> Result<StepOutcome> {
        let candidates = gc_meta::eviction_candidates(conn, self.cursor, self.batch_size)?;
        if candidates.is_empty() {
            self.cursor = 0;
            return Ok(StepOutcome::Done);
        }

        let mut tl = TransactionLog::begin(cas.clone(), task_id, true)?;
        let mut evicted = 0usize;
        let result = cachedb::with_retrying_txn(conn, true, max_retries, |txn| {
            for (action_id, _last_access) in &candidates {
                action_store.remove_uid_nested(txn, &mut tl, *action_id)?;
                evicted += 1;
            }
            Ok(())
        });

        match result {
            Ok(()) => tl.commit()?,
            Err(e) => {
                tl.rollback()?;
                return Err(e);
            }
        }

        self.cursor = candidates.last().map(|(_, last_access)| *last_access).unwrap_or(0);
        debug!(cursor = self.cursor, evicted, "eviction batch committed");
        Ok(StepOutcome::Continued { next_cursor: self.cursor, evicted })
    }
}

/// `is_below_threshold` from §4.4's steady-state check: compares
/// `total_fs + total_db` against the effective limit.
pub fn is_below_threshold(total_fs_bytes: u64, total_db_bytes: u64, limit_bytes: u64) -> bool {
    total_fs_bytes.saturating_add(total_db_bytes) < limit_bytes
}

/// The headroom target a cleanup pass aims for: `CLEANUP_FACTOR * limit`.
pub fn target_bytes(limit_bytes: u64) -> u64 {
    (limit_bytes as f64 * CLEANUP_FACTOR) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cachedb;
    use crate::cas_manager::CasManager;
    use crate::fs::blob_processor::BlobProcessor;
    use crate::hash::HashAlgorithm;
    use crate::types::{BlobInfo, PutUid, ReplacementMode};
    use std::fs;
    use tempfile::{NamedTempFile, TempDir};

    fn setup() -> (TempDir, NamedTempFile, Arc<CasStore>, BlobProcessor, Connection) {
        let root = TempDir::new().unwrap();
        let dbfile = NamedTempFile::new().unwrap();
        let cas = Arc::new(CasStore::new(root.path()).unwrap());
        let bp = BlobProcessor::new(cas.clone(), HashAlgorithm::Xxh128, 4096);
        let conn = cachedb::open(dbfile.path()).unwrap();
        (root, dbfile, cas, bp, conn)
    }

    fn seed_action(
        cas: &Arc<CasStore>,
        bp: &BlobProcessor,
        conn: &Connection,
        action_store: &ActionStore<'_>,
        ac_hash: &str,
        content: &[u8],
        access_cnt: i64,
        now_ms: i64,
    ) {
        let src_dir = TempDir::new().unwrap();
        let source = src_dir.path().join("a.out");
        fs::write(&source, content).unwrap();
        let req = PutUid {
            ac_hash: ac_hash.to_string(),
            root_path: src_dir.path().to_path_buf(),
            blob_info: vec![BlobInfo { path: source, relative_path: "a.out".to_string() }],
            db_file_names: None,
            weight: 0,
            origin: "build".to_string(),
            replacement_mode: ReplacementMode::Replace,
            is_result: true,
            peer: None,
        };
        let mut tl = TransactionLog::begin(cas.clone(), &format!("seed-{ac_hash}"), true).unwrap();
        action_store.put_uid(conn, &mut tl, &req, access_cnt, now_ms).unwrap();
        tl.commit().unwrap();
        let _ = bp;
    }

    #[test]
    fn eviction_iterator_evicts_unreferenced_actions_oldest_first() {
        let (_root, _dbfile, cas, bp, mut conn) = setup();
        let manager = CasManager::new(&bp);
        let action_store = ActionStore::new(&manager);

        seed_action(&cas, &bp, &conn, &action_store, "old", b"old-content", 1, 1000);
        seed_action(&cas, &bp, &conn, &action_store, "new", b"new-content", 2, 2000);

        let mut iter = EvictionIterator::new();
        let outcome = iter.step(&mut conn, &cas, &action_store, "gc-task", cachedb::DEFAULT_MAX_RETRIES).unwrap();
        match outcome {
            StepOutcome::Continued { evicted, .. } => assert_eq!(evicted, 2),
            StepOutcome::Done => panic!("expected candidates"),
        }

        assert!(crate::cachedb::models::action::find_by_uid(&conn, "old").unwrap().is_none());
        assert!(crate::cachedb::models::action::find_by_uid(&conn, "new").unwrap().is_none());
    }

    #[test]
    fn eviction_iterator_skips_actions_with_live_requests() {
        let (_root, _dbfile, cas, bp, mut conn) = setup();
        let manager = CasManager::new(&bp);
        let action_store = ActionStore::new(&manager);

        seed_action(&cas, &bp, &conn, &action_store, "held", b"held-content", 1, 1000);
        let action_id = crate::cachedb::models::action::find_by_uid(&conn, "held").unwrap().unwrap().id;
        crate::cachedb::models::request::insert(&conn, action_id, "task-x").unwrap();
        crate::cachedb::models::gc_meta::increment_request_count(&conn, action_id).unwrap();

        let mut iter = EvictionIterator::new();
        let outcome = iter.step(&mut conn, &cas, &action_store, "gc-task", cachedb::DEFAULT_MAX_RETRIES).unwrap();
        assert_eq!(outcome, StepOutcome::Done);
        assert!(crate::cachedb::models::action::find_by_uid(&conn, "held").unwrap().is_some());
    }

    #[test]
    fn is_below_threshold_compares_combined_usage() {
        assert!(is_below_threshold(50, 10, 100));
        assert!(!is_below_threshold(90, 20, 100));
    }

    #[test]
    fn target_bytes_applies_cleanup_factor() {
        assert_eq!(target_bytes(1000), 900);
    }

    #[test]
    fn run_old_items_evicts_only_past_cutoff() {
        let (_root, _dbfile, cas, bp, mut conn) = setup();
        let manager = CasManager::new(&bp);
        let action_store = ActionStore::new(&manager);

        seed_action(&cas, &bp, &conn, &action_store, "ancient", b"ancient", 1, 1_000);
        seed_action(&cas, &bp, &conn, &action_store, "recent", b"recent", 2, 1_000_000);

        let outcome = run_synchronous(
            &mut conn,
            &cas,
            &action_store,
            SyncSelector::OldItems { age_limit_ms: 500_000, now_ms: 1_000_000 },
            "gc-old",
            cachedb::DEFAULT_MAX_RETRIES,
        )
        .unwrap();

        assert_eq!(outcome.actions_evicted, 1);
        assert!(crate::cachedb::models::action::find_by_uid(&conn, "ancient").unwrap().is_none());
        assert!(crate::cachedb::models::action::find_by_uid(&conn, "recent").unwrap().is_some());
    }
}
