// src/fs/cas_store.rs

//! On-disk layout for the content-addressed blob store
//!
//! A blob with uid `H` lives at `<root>/<h0>/<h1>/<H>` where `h0`/`h1` are
//! the first two characters of `H`, giving 256 fan-out buckets. This module
//! owns that layout plus the `<root>/rm/` scratch tree used by the
//! transaction log; it performs no database work.

use crate::error::{Error, Result};
use md5::{Digest as Md5Digest, Md5};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const FANOUT_CHARS: &str = "0123456789abcdef";

pub struct CasStore {
    root: PathBuf,
}

impl CasStore {
    /// Open (creating if necessary) a blob root. Creates all 256 fan-out
    /// buckets and the `rm/` scratch directory up front so later renames
    /// never need a `create_dir_all` on the hot path.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        for h0 in FANOUT_CHARS.chars() {
            for h1 in FANOUT_CHARS.chars() {
                let bucket = root.join(h0.to_string()).join(h1.to_string());
                fs::create_dir_all(&bucket)?;
            }
        }

        let rm_dir = root.join("rm");
        fs::create_dir_all(&rm_dir)?;

        debug!(root = %root.display(), "initialized blob store fan-out");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Empty every fan-out bucket, for the `RECREATE_DB` recovery path
    /// (§7): a critical-error marker from the previous run means the DB
    /// and blob store may have diverged, so the host rebuilds the schema
    /// and this clears the blobs it no longer has rows for.
    pub fn clear_all_buckets(&self) -> Result<()> {
        for h0 in FANOUT_CHARS.chars() {
            for h1 in FANOUT_CHARS.chars() {
                let bucket = self.root.join(h0.to_string()).join(h1.to_string());
                fs::remove_dir_all(&bucket)?;
                fs::create_dir_all(&bucket)?;
            }
        }
        debug!(root = %self.root.display(), "cleared all blob buckets");
        Ok(())
    }

    /// Canonical path for a blob's content, regardless of whether the file
    /// currently exists there.
    pub fn blob_path(&self, uid: &str) -> Result<PathBuf> {
        let mut chars = uid.chars();
        let h0 = chars.next().ok_or_else(|| Error::InvalidRequest("empty uid".to_string()))?;
        let h1 = chars.next().ok_or_else(|| Error::InvalidRequest("uid too short".to_string()))?;
        Ok(self
            .root
            .join(h0.to_string())
            .join(h1.to_string())
            .join(uid))
    }

    pub fn blob_exists(&self, uid: &str) -> Result<bool> {
        Ok(self.blob_path(uid)?.exists())
    }

    /// Physical on-disk size of the blob, in bytes, accounting for block
    /// allocation rather than logical length.
    pub fn fs_size(&self, uid: &str) -> Result<u64> {
        physical_size(&self.blob_path(uid)?)
    }

    /// Root directory for a request's scratch area. In synchronous mode
    /// this is `<root>/rm/<md5(task_id)>`; in asynchronous mode it is the
    /// first `<root>/rm/<md5(task_id)>-<k>` (`k` in `0..9`) that does not
    /// yet exist, isolating concurrent requests sharing a task id.
    pub fn scratch_root(&self, task_id: &str, synchronous: bool) -> Result<PathBuf> {
        let digest = {
            let mut hasher = Md5::new();
            hasher.update(task_id.as_bytes());
            format!("{:x}", hasher.finalize())
        };

        if synchronous {
            return Ok(self.root.join("rm").join(digest));
        }

        for k in 0..9u32 {
            let candidate = self.root.join("rm").join(format!("{digest}-{k}"));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(Error::Invariant(format!(
            "exhausted scratch slots for task {task_id}"
        )))
    }
}

/// Physical on-disk size of a file, in bytes, accounting for block
/// allocation (sparse files, hard links) rather than logical length.
#[cfg(unix)]
pub fn physical_size(path: &Path) -> Result<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(fs::metadata(path)?.blocks() as u64 * 512)
}

#[cfg(not(unix))]
pub fn physical_size(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path)?.len())
}
