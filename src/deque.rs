//! Owned work deque with a size-aware steal gate.
//!
//! Each worker owns exactly one [`WorkerDeque`]. The owner pushes seeds to
//! the back and pops from the front, so tasks that are never stolen execute
//! in seed order (FIFO from the owner's perspective). Steals come off the
//! back — the opposite end — so an owner and a thief contend on the same
//! element only when one task remains, and that case is refused outright.
//!
//! # Invariants
//! - [`steal_tail`](WorkerDeque::steal_tail) is the *only* way a task leaves
//!   the deque other than an owner pop, and it returns `None` unless the
//!   deque holds more than one task. A victim's in-flight last task can
//!   therefore never be stolen, which is what rules out the lost/duplicated
//!   task race.
//! - The owner mirrors the length into its shared-segment slot after every
//!   mutation, so thieves size up victims without touching the deque itself.
//!   The published value can be stale by one mutation; `steal_tail`'s
//!   re-check under ownership is the authoritative gate.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::messages::Task;
use crate::shared::{deque_layout, SharedSegment};

/// A single worker's task queue.
///
/// Not `Sync`: only the owning worker touches it. Thieves go through the
/// message protocol and the owner serves them via [`steal_tail`](Self::steal_tail).
pub struct WorkerDeque {
    items: VecDeque<Task>,
    seg: Arc<SharedSegment>,
    len_slot: usize,
}

impl WorkerDeque {
    /// Creates the deque for `worker_id`, publishing into the worker's slot
    /// of the scheduler segment (see [`deque_layout`]).
    pub fn new(seg: Arc<SharedSegment>, worker_id: usize) -> Self {
        let len_slot = deque_layout::len_slot(worker_id);
        assert!(len_slot < seg.len(), "segment too small for worker {worker_id}");
        let dq = Self {
            items: VecDeque::new(),
            seg,
            len_slot,
        };
        dq.publish();
        dq
    }

    /// Seeds the deque with an initial batch, preserving order.
    pub fn seed(&mut self, tasks: Vec<Task>) {
        self.items.extend(tasks);
        self.publish();
    }

    /// Owner-side push (tasks split off mid-run land here too).
    pub fn push_back(&mut self, task: Task) {
        self.items.push_back(task);
        self.publish();
    }

    /// Owner-side pop from the head.
    pub fn pop_front(&mut self) -> Option<Task> {
        let task = self.items.pop_front();
        self.publish();
        task
    }

    /// Thief-side pop from the tail, refused when at most one task remains.
    ///
    /// This is the single call site of the no-single-task-theft invariant.
    pub fn steal_tail(&mut self) -> Option<Task> {
        if self.items.len() > 1 {
            let task = self.items.pop_back();
            self.publish();
            task
        } else {
            None
        }
    }

    /// Current length (exact; owner-side view).
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Reads a peer's published length from the segment.
    #[inline]
    pub fn published_len_of(seg: &SharedSegment, worker_id: usize) -> u32 {
        seg.load(deque_layout::len_slot(worker_id))
    }

    fn publish(&self) {
        self.seg.store(self.len_slot, self.items.len() as u32);
    }
}

impl std::fmt::Debug for WorkerDeque {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerDeque")
            .field("len", &self.items.len())
            .field("len_slot", &self.len_slot)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::TaskPayload;

    fn task(id: u64) -> Task {
        Task {
            id,
            payload: TaskPayload::Compute { seed: id, iters: 1 },
            estimated_cost: None,
        }
    }

    fn deque_for(worker: usize, workers: usize) -> (Arc<SharedSegment>, WorkerDeque) {
        let seg = Arc::new(SharedSegment::new(deque_layout::segment_len(workers)));
        let dq = WorkerDeque::new(Arc::clone(&seg), worker);
        (seg, dq)
    }

    #[test]
    fn owner_sees_fifo_order() {
        let (_seg, mut dq) = deque_for(0, 1);
        dq.seed((0..5).map(task).collect());
        for expect in 0..5u64 {
            assert_eq!(dq.pop_front().unwrap().id, expect);
        }
        assert!(dq.pop_front().is_none());
    }

    #[test]
    fn steal_comes_from_the_tail() {
        let (_seg, mut dq) = deque_for(0, 1);
        dq.seed((0..4).map(task).collect());
        assert_eq!(dq.steal_tail().unwrap().id, 3);
        assert_eq!(dq.steal_tail().unwrap().id, 2);
        // Owner still sees the head untouched.
        assert_eq!(dq.pop_front().unwrap().id, 0);
    }

    #[test]
    fn single_task_is_never_stolen() {
        let (_seg, mut dq) = deque_for(0, 1);
        dq.seed(vec![task(7)]);
        assert!(dq.steal_tail().is_none());
        assert_eq!(dq.len(), 1);
        // The owner can still run it.
        assert_eq!(dq.pop_front().unwrap().id, 7);
    }

    #[test]
    fn empty_deque_refuses_steal() {
        let (_seg, mut dq) = deque_for(0, 1);
        assert!(dq.steal_tail().is_none());
    }

    #[test]
    fn length_is_published_after_every_mutation() {
        let (seg, mut dq) = deque_for(1, 3);
        assert_eq!(WorkerDeque::published_len_of(&seg, 1), 0);

        dq.seed((0..3).map(task).collect());
        assert_eq!(WorkerDeque::published_len_of(&seg, 1), 3);

        dq.pop_front();
        assert_eq!(WorkerDeque::published_len_of(&seg, 1), 2);

        dq.steal_tail();
        assert_eq!(WorkerDeque::published_len_of(&seg, 1), 1);

        dq.push_back(task(9));
        assert_eq!(WorkerDeque::published_len_of(&seg, 1), 2);

        // Other workers' slots untouched.
        assert_eq!(WorkerDeque::published_len_of(&seg, 0), 0);
        assert_eq!(WorkerDeque::published_len_of(&seg, 2), 0);
    }
}
