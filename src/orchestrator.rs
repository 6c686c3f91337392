//! Run orchestration: validate, allocate, spawn, drive, collect.
//!
//! The orchestrator owns the whole run lifecycle:
//!
//! 1. Validate the [`RunSpec`] before any thread exists. Everything that can
//!    be rejected up front is rejected up front; a bad spec never spawns.
//! 2. Allocate one [`SharedSegment`] sized for the chosen mode and hand the
//!    same handle to every worker.
//! 3. Spawn the cohort and walk each worker through `Init` → `Configure` →
//!    `Start`.
//! 4. Drain the event channel until every worker has sent its terminal
//!    `Complete` (or a `Fatal` aborted the run), then join all threads.
//!
//! A worker panic is not swallowed: joins propagate it via
//! [`std::panic::resume_unwind`] so a broken run fails loudly in the caller.

use std::panic;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{unbounded, Sender};

use crate::error::{ConfigError, RunError};
use crate::messages::{
    CompleteReport, ControlMsg, EventMsg, InitMsg, Progress, RunConfig, StealRequest, Task,
};
use crate::metrics::RunSnapshot;
use crate::shared::{barrier_layout, deque_layout, mutex_layout, SharedSegment};
use crate::worker::{worker_main, RunShared};

/// Which primitive to exercise, with its mode-specific parameters.
#[derive(Clone, Debug)]
pub enum RunMode {
    /// Every worker performs `operations` increments on the shared counter.
    Mutex {
        operations: u32,
        /// `false` runs the same workload on the unprotected path.
        use_mutex: bool,
        /// Progress cadence in operations; 0 disables progress events.
        progress_every: u32,
    },
    /// The whole cohort rendezvouses `rounds` times.
    Barrier { rounds: u32 },
    /// Each worker drains its partition, stealing from peers once idle.
    WorkStealing {
        /// Initial task partition per worker, indexed by worker id. Uneven
        /// (and empty) partitions are the interesting case.
        partitions: Vec<Vec<Task>>,
    },
}

/// A complete description of one run.
#[derive(Clone, Debug)]
pub struct RunSpec {
    pub workers: usize,
    pub mode: RunMode,
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunReport {
    /// Terminal reports, sorted by worker id.
    pub completes: Vec<CompleteReport>,
    /// Progress events in arrival order.
    pub progress: Vec<Progress>,
    /// Merged metrics.
    pub snapshot: RunSnapshot,
    /// The run's segment, post-run. Callers read final primitive state
    /// (counter value, generation) from here.
    pub segment: Arc<SharedSegment>,
    pub duration_ms: u64,
}

/// Runs a spec to completion and returns the collected report.
///
/// Blocks until every worker has joined. Configuration problems, whether
/// caught up front or reported by a worker, come back as `Err`; worker
/// panics propagate as panics.
pub fn run(spec: RunSpec) -> Result<RunReport, RunError> {
    validate(&spec)?;
    let started = Instant::now();
    let workers = spec.workers;

    let segment = Arc::new(allocate_segment(&spec));
    let total_tasks = match &spec.mode {
        RunMode::WorkStealing { partitions } => {
            partitions.iter().map(|p| p.len() as u64).sum()
        }
        _ => 0,
    };
    let shared = Arc::new(RunShared::new(total_tasks));

    // One control channel and one steal channel per worker, one event
    // channel for everyone. Steal senders fan out to the whole cohort
    // inside Init.
    let (event_tx, event_rx) = unbounded();
    let mut ctrl_txs = Vec::with_capacity(workers);
    let mut steal_txs: Vec<Sender<StealRequest>> = Vec::with_capacity(workers);
    let mut handles = Vec::with_capacity(workers);

    let mut ctrl_rxs = Vec::with_capacity(workers);
    let mut steal_rxs = Vec::with_capacity(workers);
    for _ in 0..workers {
        let (ctrl_tx, ctrl_rx) = unbounded();
        let (steal_tx, steal_rx) = unbounded();
        ctrl_txs.push(ctrl_tx);
        steal_txs.push(steal_tx);
        ctrl_rxs.push(ctrl_rx);
        steal_rxs.push(steal_rx);
    }

    for (id, (ctrl_rx, steal_rx)) in ctrl_rxs.into_iter().zip(steal_rxs).enumerate() {
        let events = event_tx.clone();
        // On spawn failure the already-spawned workers are still parked in
        // ctrl.recv(); dropping their senders on return unblocks them.
        let handle = thread::Builder::new()
            .name(format!("parkit-worker-{id}"))
            .spawn(move || worker_main(id, ctrl_rx, steal_rx, events))
            .map_err(RunError::Spawn)?;
        handles.push(handle);
    }
    // Workers hold the only remaining event senders; channel closes when the
    // last one exits.
    drop(event_tx);

    // Init, then configure, then release the whole cohort.
    let mut partitions = match spec.mode {
        RunMode::WorkStealing { ref partitions } => partitions.clone(),
        _ => Vec::new(),
    };
    for (id, ctrl) in ctrl_txs.iter().enumerate() {
        let init = InitMsg {
            worker_id: id,
            total_workers: workers,
            segment: Arc::clone(&segment),
            shared: Arc::clone(&shared),
            peers: steal_txs.clone(),
        };
        let config = per_worker_config(&spec.mode, workers, &mut partitions, id);
        let _ = ctrl.send(ControlMsg::Init(init));
        let _ = ctrl.send(ControlMsg::Configure(config));
    }
    for ctrl in &ctrl_txs {
        let _ = ctrl.send(ControlMsg::Start);
    }
    // The thief side of each steal channel is owned by the workers now.
    drop(steal_txs);

    // Event loop: every worker terminates with exactly one Complete or one
    // Fatal.
    let mut completes: Vec<CompleteReport> = Vec::with_capacity(workers);
    let mut progress = Vec::new();
    let mut snapshot = RunSnapshot::with_workers(workers);
    let mut fatal: Option<ConfigError> = None;
    let mut terminal = 0usize;

    while terminal < workers {
        let Ok(event) = event_rx.recv() else {
            // All senders gone; a worker exited without a terminal message.
            break;
        };
        match event {
            EventMsg::Progress(p) => progress.push(p),
            EventMsg::Complete(report) => {
                snapshot.merge_worker(report.worker_id, &report.metrics);
                completes.push(report);
                terminal += 1;
            }
            EventMsg::Fatal { error, .. } => {
                shared.abort();
                if fatal.is_none() {
                    fatal = Some(error);
                }
                terminal += 1;
            }
        }
    }

    drop(ctrl_txs);
    for handle in handles {
        if let Err(payload) = handle.join() {
            panic::resume_unwind(payload);
        }
    }

    if let Some(error) = fatal {
        return Err(RunError::Config(error));
    }

    completes.sort_by_key(|c| c.worker_id);
    Ok(RunReport {
        completes,
        progress,
        snapshot,
        segment,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

/// Rejects specs that could never run correctly.
fn validate(spec: &RunSpec) -> Result<(), ConfigError> {
    if spec.workers == 0 {
        return Err(ConfigError::NoWorkers);
    }
    match &spec.mode {
        RunMode::Mutex { operations, .. } => {
            if *operations == 0 {
                return Err(ConfigError::ZeroOperations);
            }
        }
        RunMode::Barrier { rounds } => {
            if *rounds == 0 {
                return Err(ConfigError::ZeroRounds);
            }
        }
        RunMode::WorkStealing { partitions } => {
            if partitions.len() != spec.workers {
                return Err(ConfigError::PartitionCountMismatch {
                    partitions: partitions.len(),
                    workers: spec.workers,
                });
            }
        }
    }
    Ok(())
}

/// Allocates and initializes the segment for the chosen mode. Sizing is
/// exact; a worker indexing past its mode's layout is a bug, not headroom.
fn allocate_segment(spec: &RunSpec) -> SharedSegment {
    match &spec.mode {
        RunMode::Mutex { .. } => {
            let seg = SharedSegment::new(mutex_layout::SEGMENT_LEN);
            // Fresh slots are zero, which reads as "owned by worker 0".
            seg.store(mutex_layout::OWNER, mutex_layout::OWNER_NONE);
            seg
        }
        RunMode::Barrier { .. } => SharedSegment::new(barrier_layout::SEGMENT_LEN),
        RunMode::WorkStealing { .. } => {
            SharedSegment::new(deque_layout::segment_len(spec.workers))
        }
    }
}

/// Splits the run mode into the per-worker config message.
fn per_worker_config(
    mode: &RunMode,
    workers: usize,
    partitions: &mut Vec<Vec<Task>>,
    worker_id: usize,
) -> RunConfig {
    match mode {
        RunMode::Mutex {
            operations,
            use_mutex,
            progress_every,
        } => RunConfig::Mutex {
            operations: *operations,
            use_mutex: *use_mutex,
            progress_every: *progress_every,
        },
        RunMode::Barrier { rounds } => RunConfig::Barrier {
            rounds: *rounds,
            parties: workers as u32,
        },
        RunMode::WorkStealing { .. } => RunConfig::WorkStealing {
            initial: std::mem::take(&mut partitions[worker_id]),
        },
    }
}
