// src/integrity_handler.rs

//! Integrity Handler (IH)
//!
//! Single background worker that owns the steady-state disk-usage check
//! and the async eviction pass (§4.4). Client-facing code never blocks on
//! GC directly — it enqueues a tag and the worker wakes, runs a pass, and
//! goes back to sleep. The queue is bounded and keyed by tag so repeated
//! wake-ups for the same reason collapse into one pending pass.

use crate::action_store::ActionStore;
use crate::cachedb;
use crate::cas_manager::CasManager;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::fs::blob_processor::BlobProcessor;
use crate::fs::cas_store::CasStore;
use crate::gc::{self, EvictionIterator, GcOutcome, StepOutcome};
use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, warn};

/// Upper bound on queued work items before the oldest is dropped.
const QUEUE_CAPACITY: usize = 16;

/// The two idempotent work-item tags the handler recognizes (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkTag {
    /// Disk usage is believed to be over the limit; run a pass.
    PerformGc,
    /// The running-process reaper dropped one or more dead consumers;
    /// request counts may have freed up eviction candidates.
    ReleaseAcs,
}

struct QueueState {
    items: VecDeque<WorkTag>,
    shutdown: bool,
}

/// Bounded, tag-deduplicating work queue (§4.4 "Queue").
struct WorkQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    lost_items: AtomicU64,
}

impl WorkQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState { items: VecDeque::new(), shutdown: false }),
            not_empty: Condvar::new(),
            lost_items: AtomicU64::new(0),
        }
    }

    /// Insert `tag` unless it is already queued. When the queue is full the
    /// oldest item is dropped and a `PerformGc` is guaranteed present so no
    /// wake-up is lost.
    fn push(&self, tag: WorkTag) {
        let mut state = self.state.lock();
        if state.items.len() >= self.capacity {
            state.items.pop_front();
            self.lost_items.fetch_add(1, Ordering::Relaxed);
            if !state.items.contains(&WorkTag::PerformGc) {
                state.items.push_back(WorkTag::PerformGc);
            }
        }
        if !state.items.contains(&tag) {
            state.items.push_back(tag);
        }
        self.not_empty.notify_one();
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.not_empty.notify_all();
    }

    /// Block until an item is available or the queue is shut down.
    fn wait_for_work(&self) -> Option<WorkTag> {
        let mut state = self.state.lock();
        self.not_empty.wait_while(&mut state, |s| s.items.is_empty() && !s.shutdown);
        state.items.pop_front()
    }

    fn lost_items(&self) -> u64 {
        self.lost_items.load(Ordering::Relaxed)
    }
}

/// The `CancelCallback`-style coordination block shared between the
/// worker and client request paths (§4.4 "GC coordination variables").
#[derive(Default)]
struct Coordination {
    last_access_in_out: AtomicI64,
    completed_out: AtomicBool,
    shutdown_signaled: AtomicBool,
    is_limit_reached: AtomicBool,
    pending: Mutex<i64>,
    pending_drained: Condvar,
}

impl Coordination {
    fn begin_request(&self) {
        *self.pending.lock() += 1;
    }

    fn end_request(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending <= 0 {
            self.pending_drained.notify_all();
        }
    }

    /// GC pauses here while any client request is in flight, so small
    /// puts/gets never see a stalled cache (§4.4).
    fn wait_while_requests_pending(&self) {
        let mut pending = self.pending.lock();
        self.pending_drained.wait_while(&mut pending, |p| *p > 0);
    }
}

/// Process-wide usage counters, reconciled from the DB on every pass
/// (§4.4 "Steady-state check").
#[derive(Default)]
pub struct CacheMetrics {
    total_fs_bytes: AtomicU64,
    total_db_bytes: AtomicU64,
    passes_run: AtomicU64,
    actions_evicted: AtomicU64,
}

impl CacheMetrics {
    fn record_usage(&self, total_fs: u64, total_db: u64) {
        self.total_fs_bytes.store(total_fs, Ordering::Relaxed);
        self.total_db_bytes.store(total_db, Ordering::Relaxed);
    }

    fn record_pass(&self, evicted: u64) {
        self.passes_run.fetch_add(1, Ordering::Relaxed);
        self.actions_evicted.fetch_add(evicted, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            total_fs_bytes: self.total_fs_bytes.load(Ordering::Relaxed),
            total_db_bytes: self.total_db_bytes.load(Ordering::Relaxed),
            passes_run: self.passes_run.load(Ordering::Relaxed),
            actions_evicted: self.actions_evicted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub total_fs_bytes: u64,
    pub total_db_bytes: u64,
    pub passes_run: u64,
    pub actions_evicted: u64,
}

/// Owns the background worker thread and the handles client code uses to
/// wake it and read back its statistics.
pub struct IntegrityHandler {
    queue: Arc<WorkQueue>,
    coordination: Arc<Coordination>,
    metrics: Arc<CacheMetrics>,
    worker: Option<thread::JoinHandle<()>>,
}

impl IntegrityHandler {
    /// Spawn the worker thread on the given connection. Per §5's two-writer
    /// model the IH is the sole connection used for mutations, so `conn` is
    /// the same handle client request paths lock for their own transactions
    /// rather than a third independent writer opened here.
    pub fn spawn(config: CacheConfig, cas: Arc<CasStore>, conn: Arc<Mutex<Connection>>) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(WorkQueue::new(QUEUE_CAPACITY));
        let coordination = Arc::new(Coordination::default());
        let metrics = Arc::new(CacheMetrics::default());

        let worker = {
            let queue = Arc::clone(&queue);
            let coordination = Arc::clone(&coordination);
            let metrics = Arc::clone(&metrics);
            thread::Builder::new()
                .name("integrity-handler".to_string())
                .spawn(move || run(config, cas, conn, queue, coordination, metrics))
                .map_err(crate::error::Error::Io)?
        };

        Ok(Self { queue, coordination, metrics, worker: Some(worker) })
    }

    /// Wake the worker for `tag`. Safe to call from any thread.
    pub fn notify(&self, tag: WorkTag) {
        self.queue.push(tag);
    }

    /// Mark a client request in flight so the worker defers its next pass
    /// until `end_request` brings the count back to zero.
    pub fn begin_request(&self) {
        self.coordination.begin_request();
    }

    pub fn end_request(&self) {
        self.coordination.end_request();
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn lost_items(&self) -> u64 {
        self.queue.lost_items()
    }

    pub fn is_limit_reached(&self) -> bool {
        self.coordination.is_limit_reached.load(Ordering::Relaxed)
    }

    /// Signal shutdown and join the worker thread.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.coordination.shutdown_signaled.store(true, Ordering::SeqCst);
        self.queue.shutdown();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IntegrityHandler {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn run(
    config: CacheConfig,
    cas: Arc<CasStore>,
    conn: Arc<Mutex<Connection>>,
    queue: Arc<WorkQueue>,
    coordination: Arc<Coordination>,
    metrics: Arc<CacheMetrics>,
) {
    let bp = BlobProcessor::new(cas.clone(), config.hash_algorithm, config.digest_check_size);
    let manager = CasManager::new(&bp);
    let action_store = ActionStore::new(&manager);

    while let Some(tag) = queue.wait_for_work() {
        if coordination.shutdown_signaled.load(Ordering::SeqCst) {
            break;
        }
        coordination.wait_while_requests_pending();

        let mut guard = conn.lock();
        match run_pass(&mut guard, &cas, &action_store, &config, &coordination) {
            Ok(outcome) => {
                metrics.record_pass(outcome.actions_evicted);
                debug!(?tag, evicted = outcome.actions_evicted, "integrity handler pass complete");
            }
            Err(e) => warn!(?tag, error = %e, "integrity handler pass failed"),
        }
        drop(guard);
        coordination.completed_out.store(true, Ordering::SeqCst);
    }
}

/// One steady-state check plus, if over the limit and in master mode, an
/// eviction pass driven down to `CLEANUP_FACTOR * limit` (§4.4).
fn run_pass(
    conn: &mut Connection,
    cas: &Arc<CasStore>,
    action_store: &ActionStore<'_>,
    config: &CacheConfig,
    coordination: &Coordination,
) -> Result<GcOutcome> {
    let total_fs = gc::current_total_size(conn)?;
    let total_db = std::fs::metadata(&config.db_path).map(|m| m.len()).unwrap_or(0);

    let effective_limit = if total_db > config.disk_limit_bytes {
        warn!(total_db, limit = config.disk_limit_bytes, "db file alone exceeds configured limit, raising effective limit");
        total_db
    } else {
        config.disk_limit_bytes
    };

    let below = gc::is_below_threshold(total_fs, total_db, effective_limit);
    coordination.is_limit_reached.store(!below, Ordering::Relaxed);
    if below || !config.master_mode {
        return Ok(GcOutcome::default());
    }

    let target = gc::target_bytes(effective_limit);
    let mut iter = EvictionIterator::resume_from(coordination.last_access_in_out.load(Ordering::Relaxed));
    let mut outcome = GcOutcome::default();

    loop {
        if coordination.shutdown_signaled.load(Ordering::SeqCst) {
            break;
        }
        if gc::current_total_size(conn)? <= target {
            break;
        }
        match iter.step(conn, cas, action_store, "integrity-handler", cachedb::UNLIMITED_RETRIES)? {
            StepOutcome::Done => break,
            StepOutcome::Continued { evicted, .. } => outcome.actions_evicted += evicted as u64,
        }
        coordination.last_access_in_out.store(iter.cursor(), Ordering::Relaxed);
    }

    Ok(outcome)
}
