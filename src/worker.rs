//! Worker runtime: the message-driven state machine each cohort member runs.
//!
//! # Lifecycle
//!
//! ```text
//!   spawn ──► await Init ──► await Configure ──► await Start ──► run mode
//!                                                                   │
//!             Progress events throughout ◄──────────────────────────┤
//!                                                                   ▼
//!                                                        Complete, thread exits
//! ```
//!
//! Ordering violations (`Start` before `Init`, etc.) are configuration
//! errors: the worker reports [`EventMsg::Fatal`] and exits, and the
//! orchestrator aborts the cohort. Nothing here tolerates them silently —
//! tolerated, they all manifest as permanent hangs.
//!
//! # Work-stealing mode
//!
//! Per-worker state machine: Idle → Running → Idle → … → Drained.
//!
//! - Idle → Running: pop own head; else pick the victim with the **most**
//!   remaining tasks (linear scan of published lengths each idle cycle,
//!   ties to the lowest id) and send it a steal request. Victims holding at
//!   most one task are skipped — a task about to be executed locally must
//!   not also travel to a thief.
//! - Running → Idle: the task ran; its outcome (success or failure) is
//!   recorded and the run-wide remaining counter drops by one. Failures are
//!   reported, never retried, and never disturb sibling tasks.
//! - Drained: the remaining counter hit zero. A worker cannot conclude this
//!   from its own empty deque — peers may be mid-task — so the counter is
//!   the single source of truth for termination.
//!
//! While waiting on a steal reply the thief keeps serving its own steal
//! queue. That breaks the request cycle two mutually-stale thieves could
//! otherwise form, where each blocks on a reply the other will only send
//! after being served.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::barrier::CyclicBarrier;
use crate::deque::WorkerDeque;
use crate::error::{ConfigError, TaskError};
use crate::messages::{
    CompleteReport, ControlMsg, EventMsg, InitMsg, Progress, RunConfig, StealRequest,
    StealResponse, Task, TaskOutcome, TaskPayload, WorkerOutcome,
};
use crate::metrics::WorkerMetricsLocal;
use crate::shared::{spin_until, SharedSegment};
use crate::spin::RaceCounter;

/// Run-wide control state shared by the cohort and the orchestrator.
///
/// This is deliberately *not* part of the worker-visible shared segment: the
/// segment belongs to the primitive under test, while this state belongs to
/// the run harness around it.
pub struct RunShared {
    /// Tasks not yet executed (work-stealing mode; zero otherwise).
    remaining: AtomicU64,
    /// Set once on fatal error; workers poll it between operations.
    abort: AtomicBool,
}

impl RunShared {
    pub fn new(total_tasks: u64) -> Self {
        Self {
            remaining: AtomicU64::new(total_tasks),
            abort: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Marks one task done; returns how many remain.
    #[inline]
    pub fn task_done(&self) -> u64 {
        self.remaining.fetch_sub(1, Ordering::AcqRel) - 1
    }

    #[inline]
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RunShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunShared")
            .field("remaining", &self.remaining())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Thread entry point. `slot` is the spawn index, used only to attribute a
/// fatal error raised before `Init` delivered the real worker id.
pub(crate) fn worker_main(
    slot: usize,
    ctrl: Receiver<ControlMsg>,
    steal_rx: Receiver<StealRequest>,
    events: Sender<EventMsg>,
) {
    let mut init: Option<InitMsg> = None;
    let mut config: Option<RunConfig> = None;

    loop {
        let msg = match ctrl.recv() {
            Ok(m) => m,
            // Orchestrator gone (abort path); nothing left to do.
            Err(_) => return,
        };
        match msg {
            ControlMsg::Init(m) => {
                init = Some(m);
            }
            ControlMsg::Configure(cfg) => {
                let Some(init) = init.as_ref() else {
                    fatal(&events, slot, ConfigError::ConfigureBeforeInit { worker_id: slot });
                    return;
                };
                if let RunConfig::Barrier { parties, .. } = &cfg {
                    if *parties != init.total_workers as u32 {
                        fatal(
                            &events,
                            init.worker_id,
                            ConfigError::PartyCountMismatch {
                                parties: *parties,
                                workers: init.total_workers as u32,
                            },
                        );
                        return;
                    }
                }
                config = Some(cfg);
            }
            ControlMsg::Start => {
                let Some(init) = init.take() else {
                    fatal(&events, slot, ConfigError::StartBeforeInit { worker_id: slot });
                    return;
                };
                let Some(config) = config.take() else {
                    fatal(
                        &events,
                        init.worker_id,
                        ConfigError::StartBeforeConfigure {
                            worker_id: init.worker_id,
                        },
                    );
                    return;
                };
                run(init, config, steal_rx, events);
                return;
            }
        }
    }
}

fn fatal(events: &Sender<EventMsg>, worker_id: usize, error: ConfigError) {
    let _ = events.send(EventMsg::Fatal { worker_id, error });
}

/// Dispatches to the configured mode and sends the terminal report.
fn run(
    init: InitMsg,
    config: RunConfig,
    steal_rx: Receiver<StealRequest>,
    events: Sender<EventMsg>,
) {
    let worker_id = init.worker_id;
    let started = Instant::now();
    let mut metrics = WorkerMetricsLocal::default();

    let outcome = match config {
        RunConfig::Mutex {
            operations,
            use_mutex,
            progress_every,
        } => run_mutex(
            &init,
            operations,
            use_mutex,
            progress_every,
            &events,
            &mut metrics,
        ),
        RunConfig::Barrier { rounds, parties } => {
            run_barrier(&init, rounds, parties, &events, &mut metrics)
        }
        RunConfig::WorkStealing { initial } => {
            run_stealing(&init, initial, &steal_rx, &events, &mut metrics)
        }
    };

    let _ = events.send(EventMsg::Complete(CompleteReport {
        worker_id,
        duration_ms: started.elapsed().as_millis() as u64,
        outcome,
        metrics,
    }));
}

// ---------------------------------------------------------------------------
// Mutex mode
// ---------------------------------------------------------------------------

fn run_mutex(
    init: &InitMsg,
    operations: u32,
    use_mutex: bool,
    progress_every: u32,
    events: &Sender<EventMsg>,
    metrics: &mut WorkerMetricsLocal,
) -> WorkerOutcome {
    let counter = RaceCounter::new(Arc::clone(&init.segment));
    let me = init.worker_id as u32;

    for op in 0..operations {
        if init.shared.is_aborted() {
            break;
        }
        if use_mutex {
            let retries = counter.increment_locked(me);
            metrics.record_lock(retries);
        } else {
            counter.increment_unprotected();
        }
        metrics.record_op();

        if progress_every > 0 && op % progress_every == 0 {
            let _ = events.send(EventMsg::Progress(Progress {
                worker_id: init.worker_id,
                round_or_op: op,
                observed: u64::from(counter.value()),
            }));
        }
    }

    WorkerOutcome::Counter {
        value: counter.value(),
    }
}

// ---------------------------------------------------------------------------
// Barrier mode
// ---------------------------------------------------------------------------

fn run_barrier(
    init: &InitMsg,
    rounds: u32,
    parties: u32,
    events: &Sender<EventMsg>,
    metrics: &mut WorkerMetricsLocal,
) -> WorkerOutcome {
    let barrier = CyclicBarrier::new(Arc::clone(&init.segment), parties);
    let mut completed = 0u32;

    for round in 0..rounds {
        if init.shared.is_aborted() {
            break;
        }
        // Per-round work with per-worker skew, so arrivals are staggered the
        // way real phased computations stagger.
        round_work(init.worker_id as u64, round);

        let gen = barrier.wait();
        debug_assert_eq!(gen, round);
        completed += 1;
        metrics.record_round();

        let _ = events.send(EventMsg::Progress(Progress {
            worker_id: init.worker_id,
            round_or_op: round,
            observed: u64::from(barrier.generation()),
        }));
    }

    WorkerOutcome::Rounds { completed }
}

/// Small deterministic compute burst; length varies by worker and round.
fn round_work(worker: u64, round: u32) {
    let mut x = worker
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(u64::from(round));
    let spins = (x % 511) + 1;
    for _ in 0..spins {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    }
    std::hint::black_box(x);
}

// ---------------------------------------------------------------------------
// Work-stealing mode
// ---------------------------------------------------------------------------

fn run_stealing(
    init: &InitMsg,
    initial: Vec<Task>,
    steal_rx: &Receiver<StealRequest>,
    events: &Sender<EventMsg>,
    metrics: &mut WorkerMetricsLocal,
) -> WorkerOutcome {
    let mut deque = WorkerDeque::new(Arc::clone(&init.segment), init.worker_id);
    deque.seed(initial);

    let mut executed: Vec<TaskOutcome> = Vec::new();

    loop {
        // Serve thieves between every unit of our own work.
        serve_steals(&mut deque, steal_rx, metrics);

        if let Some(task) = deque.pop_front() {
            finish_task(init, task, &mut executed, events, metrics);
            continue;
        }

        // Own deque is empty. Drained, or time to steal?
        if init.shared.remaining() == 0 || init.shared.is_aborted() {
            break;
        }
        match try_steal(init, &mut deque, steal_rx, metrics) {
            Some(task) => finish_task(init, task, &mut executed, events, metrics),
            // No eligible victim right now; peers are on their last tasks.
            None => idle_wait(init, steal_rx),
        }
    }

    WorkerOutcome::Tasks { executed }
}

/// Executes one task, records its outcome, and decrements the run counter.
fn finish_task(
    init: &InitMsg,
    task: Task,
    executed: &mut Vec<TaskOutcome>,
    events: &Sender<EventMsg>,
    metrics: &mut WorkerMetricsLocal,
) {
    let result = execute_task(&task);
    metrics.record_task(result.is_err());
    executed.push(TaskOutcome {
        id: task.id,
        result,
    });
    init.shared.task_done();

    let _ = events.send(EventMsg::Progress(Progress {
        worker_id: init.worker_id,
        round_or_op: metrics.tasks_executed as u32,
        observed: task.id,
    }));
}

/// Runs a task body. Failures become values; nothing propagates.
fn execute_task(task: &Task) -> Result<u64, TaskError> {
    match &task.payload {
        TaskPayload::Compute { seed, iters } => {
            let mut x = seed ^ 0x9E37_79B9_7F4A_7C15;
            for _ in 0..*iters {
                x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                x ^= x >> 33;
            }
            Ok(x)
        }
        TaskPayload::Fail { detail } => Err(TaskError::Execution {
            detail: detail.clone(),
        }),
    }
}

/// Answers every pending steal request. The deque's own size gate decides;
/// a refusal (<= 1 task on arrival) is counted but otherwise silent.
fn serve_steals(
    deque: &mut WorkerDeque,
    steal_rx: &Receiver<StealRequest>,
    metrics: &mut WorkerMetricsLocal,
) {
    while let Ok(req) = steal_rx.try_recv() {
        let task = deque.steal_tail();
        if task.is_none() {
            metrics.record_steal_refused();
        }
        // A thief that stopped listening is not our problem.
        let _ = req.reply.send(StealResponse { task });
    }
}

/// Idle wait between steal rounds, behind the crate-wide wait predicate.
///
/// Wakes when the run drains or aborts, a steal request needs serving, or a
/// peer's published length makes it an eligible victim again.
fn idle_wait(init: &InitMsg, steal_rx: &Receiver<StealRequest>) {
    spin_until(|| {
        init.shared.remaining() == 0
            || init.shared.is_aborted()
            || !steal_rx.is_empty()
            || richest_victim(&init.segment, init.total_workers, init.worker_id).is_some()
    });
}

/// Picks the victim with the most published tasks, skipping ourselves and
/// anyone at or below one task. Ties go to the lowest id, which keeps runs
/// reproducible. Linear scan, recomputed every idle cycle — the published
/// lengths move constantly, so caching would only serve stale data.
fn richest_victim(seg: &SharedSegment, total_workers: usize, me: usize) -> Option<usize> {
    let mut best: Option<(usize, u32)> = None;
    for w in 0..total_workers {
        if w == me {
            continue;
        }
        let len = WorkerDeque::published_len_of(seg, w);
        if len > 1 && best.map_or(true, |(_, b)| len > b) {
            best = Some((w, len));
        }
    }
    best.map(|(w, _)| w)
}

/// One full steal round trip. Returns the stolen task, or `None` when no
/// victim qualified or the chosen victim refused / exited.
fn try_steal(
    init: &InitMsg,
    deque: &mut WorkerDeque,
    steal_rx: &Receiver<StealRequest>,
    metrics: &mut WorkerMetricsLocal,
) -> Option<Task> {
    let victim = richest_victim(&init.segment, init.total_workers, init.worker_id)?;
    metrics.record_steal_attempt();

    let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
    init.peers[victim]
        .send(StealRequest {
            from_worker: init.worker_id,
            to_worker: victim,
            reply: reply_tx,
        })
        .ok()?;

    loop {
        // Keep serving our own queue while we wait; see module docs.
        serve_steals(deque, steal_rx, metrics);

        match reply_rx.try_recv() {
            Ok(StealResponse { task: Some(task) }) => {
                metrics.record_steal_success();
                return Some(task);
            }
            Ok(StealResponse { task: None }) => return None,
            Err(TryRecvError::Empty) => {
                if init.shared.remaining() == 0 || init.shared.is_aborted() {
                    return None;
                }
                // A victim that exits without replying does so only once the
                // run is drained or aborted, so the predicate covers the
                // dropped-reply case too.
                spin_until(|| {
                    !reply_rx.is_empty()
                        || !steal_rx.is_empty()
                        || init.shared.remaining() == 0
                        || init.shared.is_aborted()
                });
            }
            // Victim exited with our request queued; same as a refusal.
            Err(TryRecvError::Disconnected) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::deque_layout;
    use crossbeam_channel::unbounded;

    fn task(id: u64) -> Task {
        Task {
            id,
            payload: TaskPayload::Compute { seed: id, iters: 8 },
            estimated_cost: None,
        }
    }

    #[test]
    fn execute_task_is_deterministic() {
        let t = task(99);
        assert_eq!(execute_task(&t), execute_task(&t));
        assert!(execute_task(&t).is_ok());
    }

    #[test]
    fn execute_task_failure_is_a_value() {
        let t = Task {
            id: 1,
            payload: TaskPayload::Fail {
                detail: "injected".into(),
            },
            estimated_cost: None,
        };
        let err = execute_task(&t).unwrap_err();
        assert_eq!(
            err,
            TaskError::Execution {
                detail: "injected".into()
            }
        );
    }

    #[test]
    fn richest_victim_picks_the_largest_eligible() {
        let seg = SharedSegment::new(deque_layout::segment_len(4));
        seg.store(deque_layout::len_slot(0), 3);
        seg.store(deque_layout::len_slot(1), 15);
        seg.store(deque_layout::len_slot(2), 1); // ineligible: size 1
        seg.store(deque_layout::len_slot(3), 0);

        assert_eq!(richest_victim(&seg, 4, 0), Some(1));
        assert_eq!(richest_victim(&seg, 4, 3), Some(1));
        // The richest never targets itself.
        assert_eq!(richest_victim(&seg, 4, 1), Some(0));
    }

    #[test]
    fn richest_victim_skips_size_one_and_empty() {
        let seg = SharedSegment::new(deque_layout::segment_len(3));
        seg.store(deque_layout::len_slot(0), 1);
        seg.store(deque_layout::len_slot(1), 1);
        seg.store(deque_layout::len_slot(2), 0);
        assert_eq!(richest_victim(&seg, 3, 2), None);
    }

    #[test]
    fn richest_victim_ties_go_to_lowest_id() {
        let seg = SharedSegment::new(deque_layout::segment_len(4));
        seg.store(deque_layout::len_slot(1), 5);
        seg.store(deque_layout::len_slot(2), 5);
        seg.store(deque_layout::len_slot(3), 5);
        assert_eq!(richest_victim(&seg, 4, 0), Some(1));
    }

    #[test]
    fn serve_steals_refuses_and_counts_when_small() {
        let seg = Arc::new(SharedSegment::new(deque_layout::segment_len(2)));
        let mut dq = WorkerDeque::new(Arc::clone(&seg), 0);
        dq.seed(vec![task(1)]); // exactly one task: protected

        let (steal_tx, steal_rx) = unbounded();
        let (reply_tx, reply_rx) = unbounded();
        steal_tx
            .send(StealRequest {
                from_worker: 1,
                to_worker: 0,
                reply: reply_tx,
            })
            .unwrap();

        let mut m = WorkerMetricsLocal::default();
        serve_steals(&mut dq, &steal_rx, &mut m);

        let resp = reply_rx.try_recv().unwrap();
        assert!(resp.task.is_none());
        assert_eq!(m.steals_refused, 1);
        assert_eq!(dq.len(), 1);
    }

    #[test]
    fn serve_steals_hands_out_the_tail_when_rich() {
        let seg = Arc::new(SharedSegment::new(deque_layout::segment_len(2)));
        let mut dq = WorkerDeque::new(Arc::clone(&seg), 0);
        dq.seed((0..4).map(task).collect());

        let (steal_tx, steal_rx) = unbounded();
        let (reply_tx, reply_rx) = unbounded();
        steal_tx
            .send(StealRequest {
                from_worker: 1,
                to_worker: 0,
                reply: reply_tx,
            })
            .unwrap();

        let mut m = WorkerMetricsLocal::default();
        serve_steals(&mut dq, &steal_rx, &mut m);

        assert_eq!(reply_rx.try_recv().unwrap().task.unwrap().id, 3);
        assert_eq!(m.steals_refused, 0);
        assert_eq!(dq.len(), 3);
    }

    fn init_for(worker_id: usize, total: usize) -> (InitMsg, Vec<Receiver<StealRequest>>) {
        let seg = Arc::new(SharedSegment::new(deque_layout::segment_len(total)));
        let shared = Arc::new(RunShared::new(0));
        let mut peers = Vec::with_capacity(total);
        let mut peer_rxs = Vec::with_capacity(total);
        for _ in 0..total {
            let (tx, rx) = unbounded();
            peers.push(tx);
            peer_rxs.push(rx);
        }
        (
            InitMsg {
                worker_id,
                total_workers: total,
                segment: seg,
                shared,
                peers,
            },
            peer_rxs,
        )
    }

    #[test]
    fn idle_wait_wakes_when_run_drains() {
        let (mut init, _rxs) = init_for(0, 2);
        init.shared = Arc::new(RunShared::new(1));
        let (_tx, steal_rx) = unbounded();

        let shared = Arc::clone(&init.shared);
        let finisher = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            shared.task_done();
        });
        idle_wait(&init, &steal_rx);
        finisher.join().unwrap();
        assert_eq!(init.shared.remaining(), 0);
    }

    #[test]
    fn idle_wait_wakes_when_a_victim_appears() {
        let (mut init, _rxs) = init_for(0, 2);
        init.shared = Arc::new(RunShared::new(5));
        let (_tx, steal_rx) = unbounded();

        let seg = Arc::clone(&init.segment);
        let publisher = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            seg.store(deque_layout::len_slot(1), 3);
        });
        idle_wait(&init, &steal_rx);
        publisher.join().unwrap();
        assert_eq!(richest_victim(&init.segment, 2, 0), Some(1));
    }

    #[test]
    fn idle_wait_wakes_for_a_pending_steal_request() {
        let (mut init, _rxs) = init_for(0, 2);
        init.shared = Arc::new(RunShared::new(5));
        let (steal_tx, steal_rx) = unbounded();
        let (reply_tx, _reply_rx) = unbounded();

        let waker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            steal_tx
                .send(StealRequest {
                    from_worker: 1,
                    to_worker: 0,
                    reply: reply_tx,
                })
                .unwrap();
        });
        idle_wait(&init, &steal_rx);
        waker.join().unwrap();
        assert!(!steal_rx.is_empty());
    }

    #[test]
    fn try_steal_waits_out_a_slow_victim() {
        let (mut init, mut rxs) = init_for(0, 2);
        init.shared = Arc::new(RunShared::new(3));
        init.segment.store(deque_layout::len_slot(1), 3);
        let victim_rx = rxs.remove(1);
        let own_rx = rxs.remove(0);

        let victim = std::thread::spawn(move || {
            let req = victim_rx.recv().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(10));
            req.reply
                .send(StealResponse { task: Some(task(9)) })
                .unwrap();
        });

        let mut dq = WorkerDeque::new(Arc::clone(&init.segment), 0);
        let mut m = WorkerMetricsLocal::default();
        let got = try_steal(&init, &mut dq, &own_rx, &mut m);
        victim.join().unwrap();

        assert_eq!(got.unwrap().id, 9);
        assert_eq!(m.steal_attempts, 1);
        assert_eq!(m.steal_successes, 1);
    }

    #[test]
    fn run_shared_counts_down() {
        let s = RunShared::new(3);
        assert_eq!(s.remaining(), 3);
        assert_eq!(s.task_done(), 2);
        assert_eq!(s.task_done(), 1);
        assert_eq!(s.task_done(), 0);
        assert!(!s.is_aborted());
        s.abort();
        assert!(s.is_aborted());
    }
}
