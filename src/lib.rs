//! Message-coordinated worker cohorts over shared atomic memory.
//!
//! ## Scope
//! `parkit` is a toolkit of low-level coordination primitives for a fixed
//! cohort of worker threads that communicate two ways at once: structured
//! messages for lifecycle and results, and a shared block of atomic 32-bit
//! slots ([`SharedSegment`]) for the synchronization state itself. Three
//! primitives build on that substrate:
//!
//! - [`SpinMutex`]: CAS-acquired spin lock guarding a shared counter, with a
//!   deliberately unprotected counter path ([`RaceCounter`]) that makes the
//!   lost-update race observable for comparison.
//! - [`CyclicBarrier`]: arrival-count / generation-count rendezvous that is
//!   reusable across rounds with no reset step.
//! - Work stealing: per-worker deques ([`WorkerDeque`]) drained from the
//!   front by their owner and stolen from the back via a message round trip.
//!   Thieves target the richest victim; victims holding a single task refuse.
//!
//! ## Key invariants
//! - Segment slots are touched only through atomic operations. Layouts are
//!   named constants per primitive ([`shared::mutex_layout`],
//!   [`shared::barrier_layout`], [`shared::deque_layout`]).
//! - A task is owned by exactly one deque at a time and executes exactly
//!   once. A victim's last task is never stolen.
//! - Protocol-ordering violations and impossible configurations are
//!   [`ConfigError`]s that abort the run. A failing task body is a
//!   [`TaskError`] confined to that task's outcome.
//!
//! ## Run flow
//! `RunSpec -> validate -> allocate segment -> spawn cohort ->
//! Init/Configure/Start -> Progress stream -> Complete per worker -> RunReport`
//!
//! ## Notable entry points
//! - [`orchestrator::run`] / [`RunSpec`]: drive a full cohort run.
//! - [`SpinMutex`], [`CyclicBarrier`], [`WorkerDeque`]: the primitives
//!   directly, when a cohort is more machinery than needed.
//! - [`RunReport`] / [`RunSnapshot`]: everything a finished run produced.

pub mod barrier;
pub mod deque;
pub mod error;
pub mod messages;
pub mod metrics;
pub mod orchestrator;
pub mod shared;
pub mod spin;
pub mod worker;

pub use barrier::CyclicBarrier;
pub use deque::WorkerDeque;
pub use error::{ConfigError, RunError, TaskError};
pub use messages::{
    CompleteReport, ControlMsg, EventMsg, InitMsg, Progress, RunConfig, StealRequest,
    StealResponse, Task, TaskOutcome, TaskPayload, WorkerOutcome,
};
pub use metrics::{RunSnapshot, WorkerMetricsLocal};
pub use orchestrator::{run, RunMode, RunReport, RunSpec};
pub use shared::SharedSegment;
pub use spin::{RaceCounter, SpinMutex};
pub use worker::RunShared;
