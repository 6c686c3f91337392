//! Cheap per-worker metrics, merged after the run.
//!
//! Hot-path updates are plain integer ops on a worker-local struct — no
//! atomics, no cross-thread contention. Each worker ships its counters home
//! inside its `Complete` message and the orchestrator merges them into a
//! [`RunSnapshot`] once everyone has joined.
//!
//! `WorkerMetricsLocal` is cache-line aligned so per-worker instances held
//! in contiguous memory never share a line.

use serde::{Deserialize, Serialize};

/// One worker's counters. Saturating adds throughout: a pegged counter is
/// more useful than a wrapped one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(align(64))]
pub struct WorkerMetricsLocal {
    /// Protected or unprotected counter operations completed (mutex mode).
    pub ops_completed: u64,
    /// Successful lock acquisitions.
    pub lock_acquisitions: u64,
    /// Failed CAS attempts across all acquisitions — the contention signal.
    /// A worker whose retries dwarf its acquisitions is being starved; that
    /// is reported here, not treated as a failure.
    pub lock_retries: u64,
    /// Barrier rounds completed (barrier mode).
    pub rounds_completed: u64,
    /// Tasks executed to completion, failures included (stealing mode).
    pub tasks_executed: u64,
    /// Subset of `tasks_executed` whose body failed.
    pub tasks_failed: u64,
    /// Steal round-trips initiated.
    pub steal_attempts: u64,
    /// Steal round-trips that returned a task.
    pub steal_successes: u64,
    /// Requests this worker refused as victim (deque held <= 1 task by the
    /// time the request arrived).
    pub steals_refused: u64,
}

impl WorkerMetricsLocal {
    #[inline]
    pub fn record_op(&mut self) {
        self.ops_completed = self.ops_completed.saturating_add(1);
    }

    #[inline]
    pub fn record_lock(&mut self, retries: u64) {
        self.lock_acquisitions = self.lock_acquisitions.saturating_add(1);
        self.lock_retries = self.lock_retries.saturating_add(retries);
    }

    #[inline]
    pub fn record_round(&mut self) {
        self.rounds_completed = self.rounds_completed.saturating_add(1);
    }

    #[inline]
    pub fn record_task(&mut self, failed: bool) {
        self.tasks_executed = self.tasks_executed.saturating_add(1);
        if failed {
            self.tasks_failed = self.tasks_failed.saturating_add(1);
        }
    }

    #[inline]
    pub fn record_steal_attempt(&mut self) {
        self.steal_attempts = self.steal_attempts.saturating_add(1);
    }

    #[inline]
    pub fn record_steal_success(&mut self) {
        self.steal_successes = self.steal_successes.saturating_add(1);
    }

    #[inline]
    pub fn record_steal_refused(&mut self) {
        self.steals_refused = self.steals_refused.saturating_add(1);
    }
}

/// Run-wide aggregation: per-worker counters plus their totals.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// Indexed by worker id.
    pub per_worker: Vec<WorkerMetricsLocal>,
    pub totals: WorkerMetricsLocal,
}

impl RunSnapshot {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            per_worker: vec![WorkerMetricsLocal::default(); workers],
            totals: WorkerMetricsLocal::default(),
        }
    }

    /// Folds one worker's counters into the snapshot.
    pub fn merge_worker(&mut self, worker_id: usize, m: &WorkerMetricsLocal) {
        if worker_id < self.per_worker.len() {
            self.per_worker[worker_id] = *m;
        }
        let t = &mut self.totals;
        t.ops_completed = t.ops_completed.saturating_add(m.ops_completed);
        t.lock_acquisitions = t.lock_acquisitions.saturating_add(m.lock_acquisitions);
        t.lock_retries = t.lock_retries.saturating_add(m.lock_retries);
        t.rounds_completed = t.rounds_completed.saturating_add(m.rounds_completed);
        t.tasks_executed = t.tasks_executed.saturating_add(m.tasks_executed);
        t.tasks_failed = t.tasks_failed.saturating_add(m.tasks_failed);
        t.steal_attempts = t.steal_attempts.saturating_add(m.steal_attempts);
        t.steal_successes = t.steal_successes.saturating_add(m.steal_successes);
        t.steals_refused = t.steals_refused.saturating_add(m.steals_refused);
    }
}
