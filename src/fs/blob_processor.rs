// src/fs/blob_processor.rs

//! Blob Processor (BP)
//!
//! Stateless helper that performs one filesystem operation on one blob
//! within a [`TransactionLog`]. It computes the blob's content digest,
//! stages files through the transaction log, and runs the bounded-window
//! integrity check after any copy.

use crate::error::{Error, Result};
use crate::fs::cas_store::CasStore;
use crate::fs::transaction_log::{OptimizationHint, TransactionLog};
use crate::hash::{bounded_window_matches, hash_reader, HashAlgorithm, Uid};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

pub struct BlobProcessor {
    cas: Arc<CasStore>,
    algorithm: HashAlgorithm,
    digest_check_size: usize,
}

impl BlobProcessor {
    pub fn new(cas: Arc<CasStore>, algorithm: HashAlgorithm, digest_check_size: usize) -> Self {
        Self {
            cas,
            algorithm,
            digest_check_size,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Compute the content digest of a source file without staging it.
    pub fn digest_source(&self, source: &Path) -> Result<Uid> {
        let mut file = File::open(source)?;
        Ok(hash_reader(self.algorithm, &mut file)?)
    }

    /// Stage `source` into the transaction log's scratch area, returning the
    /// computed uid and the optimization actually achieved.
    pub fn preprocess(
        &self,
        tl: &mut TransactionLog,
        source: &Path,
        allow_rename: bool,
    ) -> Result<(Uid, OptimizationHint)> {
        let uid = self.digest_source(source)?;
        let result = tl.preprocess_put(uid.as_str(), source, allow_rename)?;
        Ok((uid, result.optim))
    }

    /// Mark a previously preprocessed (or newly staged) blob for promotion.
    pub fn put(
        &self,
        tl: &mut TransactionLog,
        uid: &Uid,
        source: Option<&Path>,
        allow_rename: bool,
    ) -> Result<OptimizationHint> {
        tl.put(uid.as_str(), source, allow_rename)
    }

    /// Stage the blob's canonical file for removal (restorable on
    /// rollback).
    pub fn remove(&self, tl: &mut TransactionLog, uid: &Uid) -> Result<()> {
        tl.stage_remove(uid.as_str())
    }

    /// Materialize a blob into the client's destination path: hardlink
    /// when possible, copy otherwise, with a bounded-window integrity
    /// check after any copy. Records the materialized path in the
    /// transaction log so rollback can remove it.
    pub fn get(&self, tl: &mut TransactionLog, uid: &Uid, dest: &Path) -> Result<OptimizationHint> {
        let canonical = self.cas.blob_path(uid.as_str())?;
        if !canonical.exists() {
            return Err(Error::BlobNotFound(uid.to_string()));
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let optim = if fs::hard_link(&canonical, dest).is_ok() {
            OptimizationHint::Hardlink
        } else {
            fs::copy(&canonical, dest)?;
            self.verify_integrity(&canonical, dest)?;
            OptimizationHint::Copy
        };

        tl.record_get_file(dest.to_path_buf());
        tl.record_get_result(uid.as_str(), dest.to_path_buf());
        Ok(optim)
    }

    fn verify_integrity(&self, source: &Path, dest: &Path) -> Result<()> {
        let source_len = fs::metadata(source)?.len();
        let dest_len = fs::metadata(dest)?.len();
        if source_len != dest_len {
            warn!(
                source = %source.display(),
                dest = %dest.display(),
                "size mismatch after copy"
            );
            return Err(Error::IntegrityCheck {
                uid: dest.display().to_string(),
                reason: format!("size mismatch: source={source_len} dest={dest_len}"),
            });
        }

        let source_bytes = read_bounded(source, self.digest_check_size)?;
        let dest_bytes = read_bounded(dest, self.digest_check_size)?;

        if !bounded_window_matches(&source_bytes, &dest_bytes, self.digest_check_size) {
            return Err(Error::IntegrityCheck {
                uid: dest.display().to_string(),
                reason: "bounded-window digest mismatch after copy".to_string(),
            });
        }
        Ok(())
    }
}

/// Read up to `window * 2` bytes: the full file if it is small, otherwise
/// just the head and tail windows concatenated (matching what
/// `bounded_window_matches` compares).
fn read_bounded(path: &Path, window: usize) -> Result<Vec<u8>> {
    let len = fs::metadata(path)?.len() as usize;
    let mut file = File::open(path)?;

    if len <= window * 2 {
        let mut buf = Vec::with_capacity(len);
        file.read_to_end(&mut buf)?;
        return Ok(buf);
    }

    let mut head = vec![0u8; window];
    file.read_exact(&mut head)?;

    use std::io::{Seek, SeekFrom};
    file.seek(SeekFrom::End(-(window as i64)))?;
    let mut tail = vec![0u8; window];
    file.read_exact(&mut tail)?;

    let mut combined = head;
    combined.extend_from_slice(&tail);
    Ok(combined)
}
