// src/cas_manager.rs

//! CAS Manager (CAS)
//!
//! Owns the mapping from content digest to on-disk path and the
//! database's `blobs` table. Every operation composes a DB read/write
//! with a staged filesystem change through the caller's
//! [`TransactionLog`] (§4.2).

use crate::cachedb::models::blob;
use crate::cachedb::statements::StatementKind;
use crate::error::{Error, Result};
use crate::fs::blob_processor::BlobProcessor;
use crate::fs::cas_store::physical_size;
use crate::fs::transaction_log::{OptimizationHint, TransactionLog};
use crate::hash::Uid;
use rusqlite::Connection;
use std::path::Path;
use tracing::debug;

const REF_COUNT_MAX: i64 = i32::MAX as i64;

/// How to identify the blob a [`CasManager::put_blob`] call targets.
/// Ref-count-only decrements already know the uid from an existing
/// `acs_blobs` edge and have no client source file to digest; a fresh
/// insert only has the source file and must compute the uid from it.
pub enum BlobIdentity<'p> {
    Known(Uid),
    FromSource(&'p Path),
}

#[derive(Debug, Clone, Default)]
pub struct PutResult {
    pub existed_before: bool,
    pub exists_after: bool,
    pub ref_count_before: i64,
    pub ref_count_after: i64,
    pub size_diff: i64,
    pub fs_size_diff: i64,
    pub optim: Option<OptimizationHint>,
}

#[derive(Debug, Clone)]
pub struct GetResult {
    pub found: bool,
    pub optim: Option<OptimizationHint>,
}

pub struct CasManager<'a> {
    bp: &'a BlobProcessor,
}

impl<'a> CasManager<'a> {
    pub fn new(bp: &'a BlobProcessor) -> Self {
        Self { bp }
    }

    pub fn algorithm(&self) -> crate::hash::HashAlgorithm {
        self.bp.algorithm()
    }

    /// Adjust a blob's reference count by `ref_count_adj`, staging
    /// whatever filesystem change that implies through `tl`. The four
    /// cases from §4.2 are handled explicitly so each is independently
    /// testable.
    pub fn put_blob(
        &self,
        conn: &Connection,
        tl: &mut TransactionLog,
        identity: BlobIdentity<'_>,
        ref_count_adj: i64,
    ) -> Result<(Uid, PutResult)> {
        let (uid, source) = match identity {
            BlobIdentity::Known(uid) => (uid, None),
            BlobIdentity::FromSource(source) => (self.bp.digest_source(source)?, Some(source)),
        };
        let existing = blob::find_by_uid(conn, uid.as_str())?;
        let old = existing.as_ref().map(|b| b.ref_count).unwrap_or(0);

        let result = if ref_count_adj <= -old && existing.is_none() {
            debug!(uid = %uid, "put_blob: no-op, blob absent and net adjustment non-positive");
            PutResult {
                existed_before: false,
                exists_after: false,
                ref_count_before: 0,
                ref_count_after: 0,
                ..Default::default()
            }
        } else if ref_count_adj > -old && existing.is_some() {
            let new_ref = (old + ref_count_adj).clamp(0, REF_COUNT_MAX);
            blob::update_ref_count(conn, uid.as_str(), new_ref)?;
            PutResult {
                existed_before: true,
                exists_after: true,
                ref_count_before: old,
                ref_count_after: new_ref,
                ..Default::default()
            }
        } else if ref_count_adj <= -old {
            let row = existing.expect("existing checked above");
            self.bp.remove(tl, &uid)?;
            blob::delete_by_uid(conn, uid.as_str())?;
            PutResult {
                existed_before: true,
                exists_after: false,
                ref_count_before: old,
                ref_count_after: 0,
                size_diff: -row.size,
                fs_size_diff: -row.fs_size,
                ..Default::default()
            }
        } else {
            let source = source.ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "put_blob({uid}): blob absent and no source content supplied"
                ))
            })?;
            let (_uid, optim) = self.bp.preprocess(tl, source, true)?;
            self.bp.put(tl, &uid, None, true)?;

            let staged = tl
                .preprocess_results()
                .get(uid.as_str())
                .expect("just preprocessed");
            let size = staged.size as i64;
            let fs_size = physical_size(&staged.staged_path)? as i64;

            blob::insert(conn, uid.as_str(), size, fs_size, ref_count_adj, 0o644)?;

            PutResult {
                existed_before: false,
                exists_after: true,
                ref_count_before: 0,
                ref_count_after: ref_count_adj,
                size_diff: size,
                fs_size_diff: fs_size,
                optim: Some(optim),
            }
        };

        Ok((uid, result))
    }

    /// Materialize a blob into the client's destination. Does not change
    /// ref count.
    pub fn get_blob(&self, conn: &Connection, tl: &mut TransactionLog, uid: &Uid, dest: &Path) -> Result<GetResult> {
        if blob::find_by_uid(conn, uid.as_str())?.is_none() {
            return Ok(GetResult { found: false, optim: None });
        }
        let optim = self.bp.get(tl, uid, dest)?;
        Ok(GetResult {
            found: true,
            optim: Some(optim),
        })
    }

    /// Stream blob uids in rowid order starting at `start_rowid`,
    /// returning the next cursor for a subsequent call. Used by tooling,
    /// not by the hot path (§4.2 `get_next_chunk`).
    pub fn get_next_chunk(conn: &Connection, start_rowid: i64, limit: usize) -> Result<(Vec<String>, i64)> {
        let mut stmt = conn.prepare_cached(StatementKind::SelectBlobChunk.sql())?;
        let rows: Vec<(i64, String)> = stmt
            .query_map(rusqlite::params![start_rowid, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let next = rows.last().map(|(id, _)| id + 1).unwrap_or(start_rowid);
        Ok((rows.into_iter().map(|(_, uid)| uid).collect(), next))
    }
}
