// src/fs/mod.rs

//! Filesystem layer: blob storage layout, the transaction log, and the
//! blob processor that mediates every mutation between them.

pub mod blob_processor;
pub mod cas_store;
pub mod path;
pub mod transaction_log;

pub use blob_processor::BlobProcessor;
pub use cas_store::CasStore;
pub use transaction_log::{OptimizationHint, TransactionLog};
