// src/fs/transaction_log.rs

//! The per-request transaction log (TL)
//!
//! Every filesystem mutation the blob processor performs goes through a
//! `TransactionLog`. It records staged creates/renames/removes in memory,
//! owns the request's scratch directories, and exposes `commit`/`rollback`
//! as the only legal terminators. If neither is called before the log is
//! dropped — an early return, a `?`, a panic unwind — the destructor rolls
//! back, so a half-finished request can never leave the blob store in a
//! state between "old" and "new".

use crate::error::Result;
use crate::fs::cas_store::CasStore;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// How a blob was staged into place. Ordered from strongest to weakest so
/// `meet` can combine per-blob choices into the single weakest guarantee
/// that held across an entire action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OptimizationHint {
    Rename,
    Hardlink,
    Copy,
}

impl OptimizationHint {
    /// Lattice meet (⊓): the strongest hint that holds for both operands.
    /// Because the enum is ordered `Rename < Hardlink < Copy`, meet is
    /// simply `max`: once one of the inputs needed to fall back to a copy,
    /// the action-level result can only be as strong as a copy.
    pub fn meet(self, other: Self) -> Self {
        self.max(other)
    }
}

#[derive(Debug, Clone)]
pub struct PreprocessResult {
    /// Path under `<scratch>/new/<uid>` holding the staged content.
    pub staged_path: PathBuf,
    pub optim: OptimizationHint,
    pub size: u64,
}

struct ScratchDirs {
    root: PathBuf,
    new_dir: PathBuf,
    old_dir: PathBuf,
}

pub struct TransactionLog {
    cas: Arc<CasStore>,
    scratch: ScratchDirs,

    prepared_put: HashSet<String>,
    put: HashSet<String>,
    remove: HashSet<String>,
    new_get_files: HashSet<PathBuf>,
    preprocess_results: HashMap<String, PreprocessResult>,
    get_results: HashMap<String, PathBuf>,

    terminated: bool,
}

impl TransactionLog {
    pub fn begin(cas: Arc<CasStore>, task_id: &str, synchronous: bool) -> Result<Self> {
        let root = cas.scratch_root(task_id, synchronous)?;
        let new_dir = root.join("new");
        let old_dir = root.join("old");
        fs::create_dir_all(&new_dir)?;
        fs::create_dir_all(&old_dir)?;

        debug!(scratch = %root.display(), "opened transaction log");

        Ok(Self {
            cas,
            scratch: ScratchDirs { root, new_dir, old_dir },
            prepared_put: HashSet::new(),
            put: HashSet::new(),
            remove: HashSet::new(),
            new_get_files: HashSet::new(),
            preprocess_results: HashMap::new(),
            get_results: HashMap::new(),
            terminated: false,
        })
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch.root
    }

    /// Stage a source file into `new/<uid>` using the strongest operation
    /// the optimization policy allows, falling back Rename → Hardlink →
    /// Copy on failure. Records the outcome in `preprocess_results` and
    /// marks `uid` in `prepared_put`.
    pub fn preprocess_put(
        &mut self,
        uid: &str,
        source: &Path,
        allow_rename: bool,
    ) -> Result<PreprocessResult> {
        if let Some(existing) = self.preprocess_results.get(uid) {
            return Ok(existing.clone());
        }

        let dest = self.scratch.new_dir.join(uid);
        let size = fs::metadata(source)?.len();

        let optim = self.stage_with_fallback(source, &dest, allow_rename)?;

        let result = PreprocessResult {
            staged_path: dest,
            optim,
            size,
        };
        self.preprocess_results.insert(uid.to_string(), result.clone());
        self.prepared_put.insert(uid.to_string());
        Ok(result)
    }

    fn stage_with_fallback(&self, source: &Path, dest: &Path, allow_rename: bool) -> Result<OptimizationHint> {
        if allow_rename && fs::rename(source, dest).is_ok() {
            return Ok(OptimizationHint::Rename);
        }
        if fs::hard_link(source, dest).is_ok() {
            return Ok(OptimizationHint::Hardlink);
        }
        fs::copy(source, dest)?;
        Ok(OptimizationHint::Copy)
    }

    /// Mark a uid for promotion on commit, reusing a prior preprocess
    /// result if one exists, else staging it inline now.
    pub fn put(&mut self, uid: &str, source: Option<&Path>, allow_rename: bool) -> Result<OptimizationHint> {
        if let Some(result) = self.preprocess_results.get(uid) {
            self.put.insert(uid.to_string());
            return Ok(result.optim);
        }
        let source = source.ok_or_else(|| {
            crate::error::Error::Invariant(format!(
                "put({uid}) called with no preprocess result and no source"
            ))
        })?;
        let result = self.preprocess_put(uid, source, allow_rename)?;
        self.put.insert(uid.to_string());
        Ok(result.optim)
    }

    /// Stage a blob for removal: move the canonical file into `old/<uid>`
    /// so it can be restored on rollback.
    pub fn stage_remove(&mut self, uid: &str) -> Result<()> {
        let canonical = self.cas.blob_path(uid)?;
        let dest = self.scratch.old_dir.join(uid);
        if canonical.exists() {
            fs::rename(&canonical, &dest)?;
        }
        self.remove.insert(uid.to_string());
        Ok(())
    }

    /// Record a file materialized into the client's destination during a
    /// `get`, so rollback can delete it if the request fails later.
    pub fn record_get_file(&mut self, path: PathBuf) {
        self.new_get_files.insert(path);
    }

    pub fn record_get_result(&mut self, uid: &str, path: PathBuf) {
        self.get_results.insert(uid.to_string(), path);
    }

    pub fn prepared_put(&self) -> &HashSet<String> {
        &self.prepared_put
    }

    pub fn put_set(&self) -> &HashSet<String> {
        &self.put
    }

    pub fn preprocess_results(&self) -> &HashMap<String, PreprocessResult> {
        &self.preprocess_results
    }

    /// Combined optimization hint across every blob staged in this
    /// transaction so far.
    pub fn action_optim(&self) -> Option<OptimizationHint> {
        self.preprocess_results
            .values()
            .map(|r| r.optim)
            .reduce(OptimizationHint::meet)
    }

    /// Promote staged files. Order matters (§4.1): old removals land
    /// first, then unused preprocessed-but-unput files are pruned, then
    /// new files are promoted, so a put that replaces a blob with an
    /// identical digest never loses data.
    pub fn commit(mut self) -> Result<()> {
        self.commit_inner()?;
        self.terminated = true;
        Ok(())
    }

    fn commit_inner(&mut self) -> Result<()> {
        for uid in &self.remove {
            let staged = self.scratch.old_dir.join(uid);
            if staged.exists() {
                let canonical = self.cas.blob_path(uid)?;
                fs::rename(&staged, &canonical)?;
            }
        }

        for uid in self.prepared_put.difference(&self.put) {
            let staged = self.scratch.new_dir.join(uid);
            if staged.exists() {
                fs::remove_file(&staged)?;
            }
        }

        for uid in &self.put {
            let staged = self.scratch.new_dir.join(uid);
            if staged.exists() {
                let canonical = self.cas.blob_path(uid)?;
                fs::rename(&staged, &canonical)?;
            }
        }

        self.cleanup_scratch();
        debug!(scratch = %self.scratch.root.display(), "committed transaction log");
        Ok(())
    }

    /// Undo every staged change: delete staged puts, restore staged
    /// removals to their canonical location, and delete any files
    /// materialized into the client's destination during a `get`.
    pub fn rollback(mut self) -> Result<()> {
        self.rollback_inner()?;
        self.terminated = true;
        Ok(())
    }

    fn rollback_inner(&mut self) -> Result<()> {
        for uid in self.put.union(&self.prepared_put) {
            let staged = self.scratch.new_dir.join(uid);
            if staged.exists() {
                fs::remove_file(&staged)?;
            }
        }

        for uid in &self.remove {
            let staged = self.scratch.old_dir.join(uid);
            if staged.exists() {
                let canonical = self.cas.blob_path(uid)?;
                fs::rename(&staged, &canonical)?;
            }
        }

        for path in &self.new_get_files {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }

        self.cleanup_scratch();
        warn!(scratch = %self.scratch.root.display(), "rolled back transaction log");
        Ok(())
    }

    fn cleanup_scratch(&self) {
        let _ = fs::remove_dir_all(&self.scratch.root);
    }
}

impl Drop for TransactionLog {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        if let Err(e) = self.rollback_inner() {
            warn!(error = %e, "transaction log rollback on drop failed");
        }
    }
}

fn _assert_send_sync() {
    fn assert<T: Send>() {}
    assert::<TransactionLog>();
}

pub fn io_not_found(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::cas_store::CasStore;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<CasStore>) {
        let dir = TempDir::new().unwrap();
        let cas = Arc::new(CasStore::new(dir.path()).unwrap());
        (dir, cas)
    }

    #[test]
    fn commit_promotes_put_files() {
        let (dir, cas) = setup();
        let src_dir = TempDir::new().unwrap();
        let source = src_dir.path().join("payload");
        fs::write(&source, b"hello").unwrap();

        let mut tl = TransactionLog::begin(cas.clone(), "task-1", true).unwrap();
        tl.put("uid-a", Some(&source), true).unwrap();
        tl.commit().unwrap();

        assert!(cas.blob_path("uid-a").unwrap().exists());
        let _ = dir;
    }

    #[test]
    fn rollback_removes_staged_put() {
        let (_dir, cas) = setup();
        let src_dir = TempDir::new().unwrap();
        let source = src_dir.path().join("payload");
        fs::write(&source, b"hello").unwrap();

        let mut tl = TransactionLog::begin(cas.clone(), "task-2", true).unwrap();
        tl.put("uid-b", Some(&source), true).unwrap();
        tl.rollback().unwrap();

        assert!(!cas.blob_path("uid-b").unwrap().exists());
    }

    #[test]
    fn drop_without_commit_rolls_back() {
        let (_dir, cas) = setup();
        let src_dir = TempDir::new().unwrap();
        let source = src_dir.path().join("payload");
        fs::write(&source, b"hello").unwrap();

        {
            let mut tl = TransactionLog::begin(cas.clone(), "task-3", true).unwrap();
            tl.put("uid-c", Some(&source), true).unwrap();
        }

        assert!(!cas.blob_path("uid-c").unwrap().exists());
    }

    #[test]
    fn commit_restores_old_before_pruning_identical_digest_replace() {
        let (_dir, cas) = setup();
        let src_dir = TempDir::new().unwrap();
        let source = src_dir.path().join("payload");
        fs::write(&source, b"hello").unwrap();

        let mut tl = TransactionLog::begin(cas.clone(), "task-4", true).unwrap();
        tl.put("uid-d", Some(&source), true).unwrap();
        tl.commit().unwrap();

        let mut tl2 = TransactionLog::begin(cas.clone(), "task-4", true).unwrap();
        tl2.stage_remove("uid-d").unwrap();
        let source2 = src_dir.path().join("payload2");
        fs::write(&source2, b"world").unwrap();
        tl2.put("uid-d", Some(&source2), true).unwrap();
        tl2.commit().unwrap();

        let contents = fs::read(cas.blob_path("uid-d").unwrap()).unwrap();
        assert_eq!(contents, b"world");
    }

    #[test]
    fn optimization_hint_meet_is_weakest() {
        assert_eq!(
            OptimizationHint::Rename.meet(OptimizationHint::Hardlink),
            OptimizationHint::Hardlink
        );
        assert_eq!(
            OptimizationHint::Hardlink.meet(OptimizationHint::Copy),
            OptimizationHint::Copy
        );
        assert_eq!(
            OptimizationHint::Rename.meet(OptimizationHint::Copy),
            OptimizationHint::Copy
        );
    }
}
