//! The message protocol between orchestrator and workers.
//!
//! Every message kind is a closed, tagged type with a fixed field set, so a
//! malformed message is a compile error rather than a runtime surprise. The
//! logical shape is transport-agnostic; this in-process realization moves
//! them over `crossbeam_channel` and carries the shared-segment handle as an
//! `Arc` (a handle is process-local and deliberately not serialized). The
//! plain-data payloads — tasks, configuration, telemetry — derive serde so
//! external monitors can consume them as-is.
//!
//! Flow per worker: `Init` (exactly once, first) → `Configure` → `Start` →
//! zero or more `Progress` → `Complete`. Steal round-trips
//! (`StealRequest`/`StealResponse`) happen peer-to-peer in work-stealing
//! mode only. A worker that sees this order violated reports
//! [`crate::ConfigError`] and the run aborts.

use std::sync::Arc;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, TaskError};
use crate::metrics::WorkerMetricsLocal;
use crate::shared::SharedSegment;
use crate::worker::RunShared;

/// One unit of independent, side-effect-free work.
///
/// Immutable once created; owned by exactly one deque at a time; executed
/// exactly once. Ownership transfers atomically during a steal (the task
/// travels inside the [`StealResponse`]).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique within a run; work-conservation checks sum these.
    pub id: u64,
    /// What to compute.
    pub payload: TaskPayload,
    /// Optional scheduling hint. Informational; the scheduler ignores it.
    pub estimated_cost: Option<u32>,
}

/// Closed set of task bodies.
///
/// Domain algorithms that merely *use* parallelism are ordinary sequential
/// functions; these two variants are enough to exercise the scheduler and
/// its failure path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TaskPayload {
    /// Deterministic compute kernel: `iters` rounds of integer mixing
    /// seeded by `seed`. The result doubles as a checksum.
    Compute { seed: u64, iters: u32 },
    /// Always fails with `detail`. Exercises per-task failure isolation.
    Fail { detail: String },
}

/// Which primitive a run exercises, with its parameters.
///
/// Mode-specific fields live on their variant, so a barrier run cannot be
/// configured with an operation count and vice versa.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RunConfig {
    /// K increments per worker against the shared counter.
    Mutex {
        operations: u32,
        /// `false` selects the deliberately unprotected path.
        use_mutex: bool,
        /// Emit a `Progress` every this many operations.
        progress_every: u32,
    },
    /// R rendezvous rounds across the whole cohort.
    Barrier {
        rounds: u32,
        /// Must equal the cohort size; checked at configure time.
        parties: u32,
    },
    /// Drain a seeded deque, stealing from the richest peer when idle.
    WorkStealing {
        /// This worker's initial partition.
        initial: Vec<Task>,
    },
}

/// Everything a worker needs before it may touch any primitive.
///
/// Not serializable: the segment and channels are process-local handles.
pub struct InitMsg {
    pub worker_id: usize,
    pub total_workers: usize,
    /// Handle to the one segment the orchestrator allocated for this run.
    pub segment: Arc<SharedSegment>,
    /// Run-wide control state (abort flag, remaining-task counter).
    pub shared: Arc<RunShared>,
    /// Steal-request senders indexed by worker id (self included, unused).
    pub peers: Vec<Sender<StealRequest>>,
}

/// Orchestrator → worker control messages.
pub enum ControlMsg {
    Init(InitMsg),
    Configure(RunConfig),
    Start,
}

/// Peer → peer: "give me a task from your tail".
///
/// The reply channel closes the round trip; a dropped request (victim exited)
/// reads as an empty response on the thief's side.
pub struct StealRequest {
    pub from_worker: usize,
    pub to_worker: usize,
    pub reply: Sender<StealResponse>,
}

/// Victim's answer: a task, or nothing (empty deque, or exactly one task
/// remaining — size-1 victims are never stolen from).
#[derive(Debug)]
pub struct StealResponse {
    pub task: Option<Task>,
}

/// Periodic, purely informational status from a worker.
///
/// Never required for correctness; tests use it to observe round skew and
/// counter movement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Progress {
    pub worker_id: usize,
    /// Barrier round or operation/task index, depending on the mode.
    pub round_or_op: u32,
    /// Mode-dependent observation (counter value, generation, task id).
    pub observed: u64,
}

/// Result of executing one task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub id: u64,
    /// `Err` is a reported failure, not a retry trigger — the scheduler
    /// never retries; that policy belongs to the orchestrator's caller.
    pub result: Result<u64, TaskError>,
}

/// Mode-specific summary carried in [`CompleteReport`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WorkerOutcome {
    /// Final shared-counter value observed after the worker's last op.
    Counter { value: u32 },
    /// Rounds completed (equals the configured round count on success).
    Rounds { completed: u32 },
    /// Every task this worker executed, in execution order.
    Tasks { executed: Vec<TaskOutcome> },
}

/// Terminal message: one per worker, after which the worker exits.
///
/// The run is complete when every worker has sent one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompleteReport {
    pub worker_id: usize,
    pub duration_ms: u64,
    pub outcome: WorkerOutcome,
    pub metrics: WorkerMetricsLocal,
}

/// Worker → orchestrator events.
pub enum EventMsg {
    Progress(Progress),
    Complete(CompleteReport),
    /// Fatal configuration error; the whole run aborts.
    Fatal { worker_id: usize, error: ConfigError },
}
