// src/types.rs

//! External request/response types (§6)
//!
//! These are the typed requests the core expects to receive already
//! decoded from the (out-of-scope) RPC layer, and the typed responses it
//! hands back.

use crate::fs::transaction_log::OptimizationHint;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proc {
    pub pid: i64,
    pub start_time: i64,
    pub expected_lifetime: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub proc: Proc,
    pub task_gsid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementMode {
    UseOldBlobs,
    Replace,
}

#[derive(Debug, Clone)]
pub struct BlobInfo {
    /// Absolute path to the client-supplied source file.
    pub path: PathBuf,
    /// Destination path relative to `dest_path` on retrieval.
    pub relative_path: String,
}

#[derive(Debug, Clone)]
pub struct PutUid {
    pub ac_hash: String,
    pub root_path: PathBuf,
    pub blob_info: Vec<BlobInfo>,
    /// Per-blob display name for db-file listings, same length as
    /// `blob_info` when present. Stored nowhere yet — no part of this crate
    /// surfaces a file-name listing distinct from `relative_path`.
    pub db_file_names: Option<Vec<String>>,
    pub weight: i64,
    pub origin: String,
    pub replacement_mode: ReplacementMode,
    pub is_result: bool,
    pub peer: Option<Peer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetOptimization {
    Hardlink,
    Copy,
}

#[derive(Debug, Clone)]
pub struct GetUid {
    pub ac_hash: String,
    pub dest_path: PathBuf,
    pub optimization: GetOptimization,
    /// Restrict materialization to the single blob whose `relative_path`
    /// equals `filter`; `None` materializes every blob the action owns.
    pub filter: Option<String>,
    pub release: bool,
    pub is_result: bool,
    pub peer: Option<Peer>,
}

#[derive(Debug, Clone)]
pub struct HasUid {
    pub ac_hash: String,
    pub is_result: bool,
    pub peer: Option<Peer>,
}

#[derive(Debug, Clone)]
pub struct RemoveUid {
    pub ac_hash: String,
    pub forced_removal: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ForceGc {
    pub target_size_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum SynchronousGc {
    Timestamp { timestamp_ms: i64 },
    TotalSize { total_size_bytes: u64 },
    BlobSize { blob_size_bytes: u64 },
}

#[derive(Debug, Clone)]
pub struct NodeDependencies {
    pub node_hash: String,
    pub required_hashes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CacheResult {
    pub origin: Option<String>,
    pub proc_id: Option<i64>,
    pub total_size_diff: i64,
    pub total_fs_size_diff: i64,
    pub copy_mode: Option<OptimizationHint>,
    pub acs_diff: i64,
    pub blob_diff: i64,
    pub success: bool,
}

impl CacheResult {
    pub fn not_found() -> Self {
        Self { success: false, ..Default::default() }
    }

    pub fn ok() -> Self {
        Self { success: true, ..Default::default() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Status {
    pub total_fs_size_bytes: u64,
    pub total_db_size_bytes: u64,
    pub blob_count: u64,
    pub action_count: u64,
}
