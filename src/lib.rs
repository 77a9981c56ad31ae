// src/lib.rs

//! Transactional content-addressed store and action-cache database for a
//! local build/action cache daemon.
//!
//! # Architecture
//!
//! - **CAS Manager** ([`cas_manager`]): owns the digest-to-path mapping and
//!   the `blobs` table, staging every filesystem change through a
//!   [`fs::TransactionLog`].
//! - **Action Store** ([`action_store`]): composes CAS operations under one
//!   DB+FS transaction per client request (`put_uid`/`get_uid`/`has_uid`/
//!   `remove_uid`/`put_deps`).
//! - **Integrity Handler** ([`integrity_handler`]): background worker
//!   enforcing the disk budget via the async eviction iterator and the
//!   synchronous GC selectors in [`gc`].
//! - **Running-Process Reaper** ([`reaper`]): background worker releasing
//!   locks held by consumer processes that died without calling back.
//!
//! [`CacheDaemon`] wires all four together behind the two-writer model of
//! §5: client requests and the integrity handler's background passes
//! share one DB connection guarded by a mutex (the IH is the sole
//! mutation writer), the running-process reaper holds its own second
//! connection, and both are serialized further by SQLite's own locking
//! plus the retrying `BEGIN` wrapper in [`cachedb::with_retrying_txn`].

pub mod action_store;
pub mod cachedb;
pub mod cas_manager;
pub mod config;
mod error;
pub mod fs;
pub mod gc;
pub mod hash;
pub mod integrity_handler;
pub mod reaper;
pub mod types;

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use action_store::ActionStore;
use cas_manager::CasManager;
pub use config::CacheConfig;
pub use error::{Error, Result};
use fs::blob_processor::BlobProcessor;
use fs::cas_store::CasStore;
use fs::transaction_log::TransactionLog;
pub use hash::{HashAlgorithm, Uid};
pub use integrity_handler::{CacheMetricsSnapshot, IntegrityHandler, WorkTag};
pub use reaper::{NotifyGc, Reaper};
pub use types::{
    BlobInfo, CacheResult, ForceGc, GetOptimization, GetUid, HasUid, NodeDependencies, Peer,
    Proc, PutUid, RemoveUid, ReplacementMode, Status, SynchronousGc,
};

/// A running instance of the cache core: one DB writer connection plus the
/// two background workers, constructed from a validated [`CacheConfig`].
pub struct CacheDaemon {
    config: CacheConfig,
    cas: Arc<CasStore>,
    bp: BlobProcessor,
    conn: Arc<Mutex<Connection>>,
    integrity_handler: Arc<IntegrityHandler>,
    reaper: Reaper,
}

impl CacheDaemon {
    /// Open (creating if absent) the blob root and database, migrate the
    /// schema, and spawn the integrity handler and reaper.
    pub fn start(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.root)?;
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let marker = recreate_marker_path(&config.db_path);
        let recreate = marker.exists();
        if recreate {
            tracing::warn!(marker = %marker.display(), "RECREATE_DB marker present, rebuilding schema and clearing blob store");
            let _ = std::fs::remove_file(&config.db_path);
        }

        let cas = Arc::new(CasStore::new(&config.root)?);
        if recreate {
            cas.clear_all_buckets()?;
            std::fs::remove_file(&marker)?;
        }
        let bp = BlobProcessor::new(cas.clone(), config.hash_algorithm, config.digest_check_size);
        let conn = Arc::new(Mutex::new(cachedb::open(&config.db_path)?));

        // The IH shares this same connection/mutex for its own background
        // passes (§5 "IH owns the single database connection used for
        // mutations") rather than opening an independent third writer.
        let integrity_handler = Arc::new(IntegrityHandler::spawn(config.clone(), cas.clone(), conn.clone())?);
        let reaper = Reaper::spawn(config.db_path.clone(), integrity_handler.clone())?;

        info!(root = %config.root.display(), "cache daemon started");
        Ok(Self { config, cas, bp, conn, integrity_handler, reaper })
    }

    /// Register a consumer process so the reaper starts polling its
    /// liveness. Callers should do this once per `peer` they pass into a
    /// request that locks an action (`is_result` + a live `peer`).
    pub fn track_proc(&self, task_gsid: &str, proc: Proc) {
        self.reaper.track(task_gsid, proc.pid, proc.start_time);
    }

    /// Cooperative release: tell the reaper a tracked process exited
    /// cleanly, skipping the poll round-trip.
    pub fn release_proc(&self, task_gsid: &str, proc: Proc) {
        self.reaper.release(task_gsid, proc.pid, proc.start_time);
    }

    pub fn integrity_metrics(&self) -> CacheMetricsSnapshot {
        self.integrity_handler.metrics()
    }

    /// Combined DB+FS size counters and row counts, read directly rather
    /// than from the integrity handler's (possibly stale) cached stats.
    pub fn status(&self) -> Result<Status> {
        let conn = self.conn.lock();
        let total_fs_size_bytes = gc::current_total_size(&conn)?;
        let total_db_size_bytes = std::fs::metadata(&self.config.db_path).map(|m| m.len()).unwrap_or(0);
        let blob_count: i64 = conn.query_row("SELECT COUNT(*) FROM blobs", [], |row| row.get(0))?;
        let action_count: i64 = conn.query_row("SELECT COUNT(*) FROM acs", [], |row| row.get(0))?;
        Ok(Status {
            total_fs_size_bytes,
            total_db_size_bytes,
            blob_count: blob_count.max(0) as u64,
            action_count: action_count.max(0) as u64,
        })
    }

    /// On `StorageFull` (§7 "Storage full") this forces a synchronous GC
    /// pass down to the configured target and retries exactly once before
    /// giving up and writing the `RECREATE_DB` critical-error marker.
    pub fn put_uid(&self, req: &PutUid, access_cnt: i64, now_ms: i64) -> Result<CacheResult> {
        match self.run_txn(&req.ac_hash, true, |txn, tl, store| store.put_uid(txn, tl, req, access_cnt, now_ms)) {
            Ok(result) => {
                self.on_size_changed();
                Ok(result)
            }
            Err(e) if e.is_full() => {
                tracing::warn!("put_uid hit storage-full, forcing synchronous GC and retrying once");
                self.force_gc(ForceGc { target_size_bytes: self.config.target_bytes() })?;
                match self.run_txn(&req.ac_hash, true, |txn, tl, store| store.put_uid(txn, tl, req, access_cnt, now_ms)) {
                    Ok(result) => {
                        self.on_size_changed();
                        Ok(result)
                    }
                    Err(e2) if e2.is_full() || e2.is_io() => {
                        self.write_recreate_marker();
                        Err(Error::StorageFull)
                    }
                    Err(e2) => Err(e2),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn get_uid(&self, req: &GetUid, access_cnt: i64, now_ms: i64) -> Result<CacheResult> {
        self.run_txn(&req.ac_hash, false, |txn, tl, store| store.get_uid(txn, tl, req, access_cnt, now_ms))
    }

    pub fn has_uid(&self, req: &HasUid, access_cnt: i64, now_ms: i64) -> Result<CacheResult> {
        let mut conn = self.conn.lock();
        let bpmgr = CasManager::new(&self.bp);
        let store = ActionStore::new(&bpmgr);
        cachedb::with_retrying_txn(&mut conn, true, cachedb::DEFAULT_MAX_RETRIES, |txn| {
            store.has_uid(txn, req, access_cnt, now_ms)
        })
    }

    pub fn remove_uid(&self, req: &RemoveUid) -> Result<CacheResult> {
        self.run_txn(&req.ac_hash, true, |txn, tl, store| store.remove_uid(txn, tl, req))
            .inspect(|_| self.on_size_changed())
    }

    pub fn put_deps(&self, req: &NodeDependencies) -> Result<i64> {
        let mut conn = self.conn.lock();
        let bpmgr = CasManager::new(&self.bp);
        let store = ActionStore::new(&bpmgr);
        cachedb::with_retrying_txn(&mut conn, true, cachedb::DEFAULT_MAX_RETRIES, |txn| store.put_deps(txn, req))
    }

    /// `ForceGC` from §6: drive the `TotalSize` selector to convergence on
    /// the caller's thread, bypassing the async worker. Used when the
    /// handler's synchronous `BUSY`/`FULL` retry needs guaranteed headroom
    /// before it retries the request that triggered it.
    pub fn force_gc(&self, req: ForceGc) -> Result<gc::GcOutcome> {
        self.run_selector(gc::SyncSelector::TotalSize { target_bytes: req.target_size_bytes }, "force-gc")
    }

    /// `SynchronousGC` from §6: run whichever of the three selectors the
    /// caller names, to convergence, on the caller's thread.
    pub fn synchronous_gc(&self, req: SynchronousGc) -> Result<gc::GcOutcome> {
        let selector = match req {
            SynchronousGc::Timestamp { timestamp_ms } => {
                gc::SyncSelector::OldItems { age_limit_ms: 0, now_ms: timestamp_ms }
            }
            SynchronousGc::TotalSize { total_size_bytes } => {
                gc::SyncSelector::TotalSize { target_bytes: total_size_bytes }
            }
            SynchronousGc::BlobSize { blob_size_bytes } => {
                gc::SyncSelector::BigBlobs { size_limit: blob_size_bytes as i64 }
            }
        };
        self.run_selector(selector, "synchronous-gc")
    }

    fn run_selector(&self, selector: gc::SyncSelector, task_id: &str) -> Result<gc::GcOutcome> {
        let mut conn = self.conn.lock();
        let bpmgr = CasManager::new(&self.bp);
        let store = ActionStore::new(&bpmgr);
        gc::run_synchronous(&mut conn, &self.cas, &store, selector, task_id, cachedb::DEFAULT_MAX_RETRIES)
    }

    /// Shut down the background workers and drop the DB connection. Also
    /// happens implicitly on drop; provided for callers that want to
    /// observe shutdown completing before returning.
    pub fn shutdown(self) {
        drop(self);
    }

    fn on_size_changed(&self) {
        self.integrity_handler.notify(WorkTag::PerformGc);
    }

    fn write_recreate_marker(&self) {
        let marker = recreate_marker_path(&self.config.db_path);
        if let Err(e) = std::fs::write(&marker, b"") {
            tracing::error!(error = %e, "failed to write RECREATE_DB marker");
        }
    }

    fn run_txn<T>(
        &self,
        task_id: &str,
        exclusive: bool,
        mut f: impl FnMut(&rusqlite::Transaction, &mut TransactionLog, &ActionStore<'_>) -> Result<T>,
    ) -> Result<T> {
        let bpmgr = CasManager::new(&self.bp);
        let store = ActionStore::new(&bpmgr);
        let mut tl = TransactionLog::begin(self.cas.clone(), task_id, true)?;
        let mut conn = self.conn.lock();

        let result =
            cachedb::with_retrying_txn(&mut conn, exclusive, cachedb::DEFAULT_MAX_RETRIES, |txn| f(txn, &mut tl, &store));
        match result {
            Ok(value) => {
                tl.commit()?;
                Ok(value)
            }
            Err(e) => {
                tl.rollback()?;
                Err(e)
            }
        }
    }
}

/// Where the critical-error marker lives for a given DB path (§7): the
/// database's own directory, named `RECREATE_DB`.
fn recreate_marker_path(db_path: &std::path::Path) -> std::path::PathBuf {
    match db_path.parent() {
        Some(parent) => parent.join("RECREATE_DB"),
        None => std::path::PathBuf::from("RECREATE_DB"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn config(root: &TempDir) -> CacheConfig {
        let mut cfg = CacheConfig::new(
            root.path().join("cas"),
            root.path().join("cache.sqlite"),
            1 << 30,
        );
        cfg.hash_algorithm = HashAlgorithm::Xxh128;
        cfg
    }

    #[test]
    fn put_then_get_round_trips_through_the_daemon() {
        let root = TempDir::new().unwrap();
        let daemon = CacheDaemon::start(config(&root)).unwrap();

        let src_dir = TempDir::new().unwrap();
        let source = src_dir.path().join("out.bin");
        fs::write(&source, b"daemon payload").unwrap();

        let put_req = PutUid {
            ac_hash: "daemon-action".to_string(),
            root_path: src_dir.path().to_path_buf(),
            blob_info: vec![BlobInfo { path: source, relative_path: "out.bin".to_string() }],
            db_file_names: None,
            weight: 0,
            origin: "build".to_string(),
            replacement_mode: ReplacementMode::Replace,
            is_result: true,
            peer: None,
        };
        let put_result = daemon.put_uid(&put_req, 1, 1000).unwrap();
        assert!(put_result.success);

        let dest_dir = root.path().join("dest");
        let get_req = GetUid {
            ac_hash: "daemon-action".to_string(),
            dest_path: dest_dir.clone(),
            optimization: GetOptimization::Hardlink,
            filter: None,
            release: false,
            is_result: true,
            peer: None,
        };
        let get_result = daemon.get_uid(&get_req, 2, 2000).unwrap();
        assert!(get_result.success);
        assert_eq!(fs::read(dest_dir.join("out.bin")).unwrap(), b"daemon payload");

        let status = daemon.status().unwrap();
        assert_eq!(status.action_count, 1);
        assert_eq!(status.blob_count, 1);

        daemon.shutdown();
    }

    #[test]
    fn recreate_marker_present_at_start_clears_blob_store() {
        let root = TempDir::new().unwrap();
        let cfg = config(&root);
        {
            // Seed a stray file in a bucket as if left over from a prior
            // crash, then drop the store without ever opening the daemon.
            let cas = crate::fs::cas_store::CasStore::new(&cfg.root).unwrap();
            fs::write(cas.root().join("a").join("b").join("stray"), b"leftover").unwrap();
        }
        std::fs::write(recreate_marker_path(&cfg.db_path), b"").unwrap();

        let daemon = CacheDaemon::start(cfg.clone()).unwrap();
        assert!(!recreate_marker_path(&cfg.db_path).exists());
        assert!(!cfg.root.join("a").join("b").join("stray").exists());
        daemon.shutdown();
    }

    #[test]
    fn has_uid_reports_missing_action() {
        let root = TempDir::new().unwrap();
        let daemon = CacheDaemon::start(config(&root)).unwrap();
        let result = daemon
            .has_uid(&HasUid { ac_hash: "missing".to_string(), is_result: true, peer: None }, 1, 1000)
            .unwrap();
        assert!(!result.success);
    }
}
