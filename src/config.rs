// src/config.rs

//! Runtime configuration for the cache core
//!
//! Loading configuration from disk, environment variables, or an RPC
//! handshake is outside this crate's scope — the host process is expected
//! to construct a [`CacheConfig`] and hand it to [`crate::CacheDaemon`].
//! This module only validates the values it is given.

use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use std::path::PathBuf;

/// Default headroom multiplier applied to `disk_limit_bytes` before the
/// integrity handler stops evicting. Keeping 10% of the limit free absorbs
/// the writes that land between a GC pass completing and the next one
/// starting.
pub const DEFAULT_CLEANUP_FACTOR: f64 = 0.9;

/// Default upper bound on blobs removed by a single async eviction batch.
pub const DEFAULT_MAX_REMOVE_COUNT: usize = 500;

/// Default window size, in bytes, used for post-copy integrity checks.
pub const DEFAULT_DIGEST_CHECK_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root directory of the content-addressed blob store.
    pub root: PathBuf,

    /// Path to the SQLite database file.
    pub db_path: PathBuf,

    /// Soft disk budget in bytes. The integrity handler evicts blobs to
    /// keep total size under `disk_limit_bytes * cleanup_factor`.
    pub disk_limit_bytes: u64,

    /// Fraction of `disk_limit_bytes` the cache tries to stay under.
    pub cleanup_factor: f64,

    /// Maximum blobs removed per async eviction batch.
    pub max_remove_count: usize,

    /// Bytes compared from each end of a blob during integrity checks.
    pub digest_check_size: usize,

    /// Whether this instance owns garbage collection. A non-master
    /// instance can still read/write blobs but never evicts.
    pub master_mode: bool,

    /// Algorithm used to compute blob uids.
    pub hash_algorithm: HashAlgorithm,
}

impl CacheConfig {
    /// Construct a config with every tunable set to its documented default
    /// except `root`, `db_path`, and `disk_limit_bytes`, which callers must
    /// always choose deliberately.
    pub fn new(root: PathBuf, db_path: PathBuf, disk_limit_bytes: u64) -> Self {
        Self {
            root,
            db_path,
            disk_limit_bytes,
            cleanup_factor: DEFAULT_CLEANUP_FACTOR,
            max_remove_count: DEFAULT_MAX_REMOVE_COUNT,
            digest_check_size: DEFAULT_DIGEST_CHECK_SIZE,
            master_mode: true,
            hash_algorithm: HashAlgorithm::default(),
        }
    }

    /// Reject configurations the rest of the crate cannot operate under.
    pub fn validate(&self) -> Result<()> {
        if !self.root.is_absolute() {
            return Err(Error::InvalidRequest(format!(
                "cache root must be an absolute path: {}",
                self.root.display()
            )));
        }
        if !(0.0..=1.0).contains(&self.cleanup_factor) {
            return Err(Error::InvalidRequest(format!(
                "cleanup_factor must be in [0, 1], got {}",
                self.cleanup_factor
            )));
        }
        if self.max_remove_count == 0 {
            return Err(Error::InvalidRequest(
                "max_remove_count must be nonzero".to_string(),
            ));
        }
        if self.disk_limit_bytes == 0 {
            return Err(Error::InvalidRequest(
                "disk_limit_bytes must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective byte budget the integrity handler targets, below
    /// `disk_limit_bytes` by `cleanup_factor`.
    pub fn target_bytes(&self) -> u64 {
        (self.disk_limit_bytes as f64 * self.cleanup_factor) as u64
    }

    #[cfg(test)]
    pub fn for_tests(root: PathBuf, db_path: PathBuf) -> Self {
        Self::new(root, db_path, 1 << 30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_root() {
        let cfg = CacheConfig::new(PathBuf::from("relative"), PathBuf::from("/x/db.sqlite"), 100);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_cleanup_factor() {
        let mut cfg = CacheConfig::for_tests(PathBuf::from("/tmp/cache"), PathBuf::from("/tmp/cache/db.sqlite"));
        cfg.cleanup_factor = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn target_bytes_applies_factor() {
        let mut cfg = CacheConfig::new(PathBuf::from("/tmp/cache"), PathBuf::from("/tmp/cache/db.sqlite"), 1000);
        cfg.cleanup_factor = 0.9;
        assert_eq!(cfg.target_bytes(), 900);
    }
}
