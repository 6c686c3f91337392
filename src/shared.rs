//! Shared atomic segment: the memory substrate for all synchronization.
//!
//! A [`SharedSegment`] is a fixed-size block of 32-bit slots shared by every
//! worker in a cohort. It is allocated once before any worker starts, handed
//! out behind an `Arc`, and never resized.
//!
//! # Invariants
//! - Every slot that feeds synchronization logic is accessed exclusively
//!   through the atomic operations on this type. Plain reads/writes do not
//!   exist in the API, so the "non-atomic access to a contended slot" bug
//!   class is unrepresentable.
//! - Slot offsets are named constants owned by the primitive using them
//!   (see [`mutex_layout`], [`barrier_layout`], [`deque_layout`]); callers
//!   never hand-compute indices.
//!
//! # Ordering
//! All operations use `SeqCst`. The mutex and barrier correctness arguments
//! assume a single global order of atomic operations; weaker orderings would
//! make those arguments unsound, and none of these paths are hot enough for
//! the fence cost to matter.

#[cfg(loom)]
use loom::sync::atomic::{AtomicU32, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(not(loom))]
use crossbeam_utils::Backoff;

/// Fixed-size block of atomically addressable 32-bit slots.
///
/// The segment itself carries no meaning; each primitive interprets a fixed,
/// named range of slots (its *layout*). Sizing is the orchestrator's job:
/// allocate exactly the slots the chosen primitive's layout requires.
///
/// # Examples
///
/// ```
/// use parkit::SharedSegment;
///
/// let seg = SharedSegment::new(2);
/// seg.store(0, 7);
/// assert_eq!(seg.add(0, 3), 7);
/// assert_eq!(seg.load(0), 10);
/// assert_eq!(seg.compare_exchange(1, 0, 1), Ok(0));
/// assert_eq!(seg.compare_exchange(1, 0, 2), Err(1));
/// ```
pub struct SharedSegment {
    slots: Vec<AtomicU32>,
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("len", &self.slots.len())
            .finish()
    }
}

impl SharedSegment {
    /// Allocates a segment of `len` slots, all zero.
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero (a zero-slot segment has no valid offsets and
    /// is always a bug at the call site).
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "SharedSegment requires len > 0");
        let mut slots = Vec::with_capacity(len);
        for _ in 0..len {
            slots.push(AtomicU32::new(0));
        }
        Self { slots }
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if the segment has no slots. Always false for a
    /// constructed segment; provided for API completeness.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Atomic load of slot `idx`.
    #[inline]
    pub fn load(&self, idx: usize) -> u32 {
        self.slots[idx].load(Ordering::SeqCst)
    }

    /// Atomic store of `value` into slot `idx`.
    #[inline]
    pub fn store(&self, idx: usize, value: u32) {
        self.slots[idx].store(value, Ordering::SeqCst);
    }

    /// Atomic wrapping add; returns the previous value.
    #[inline]
    pub fn add(&self, idx: usize, delta: u32) -> u32 {
        self.slots[idx].fetch_add(delta, Ordering::SeqCst)
    }

    /// Atomic wrapping subtract; returns the previous value.
    #[inline]
    pub fn sub(&self, idx: usize, delta: u32) -> u32 {
        self.slots[idx].fetch_sub(delta, Ordering::SeqCst)
    }

    /// Atomic compare-and-swap.
    ///
    /// Updates slot `idx` to `new` only if it currently holds `expected`.
    /// Returns `Ok(previous)` on success, `Err(actual)` on failure. This is
    /// the indivisible primitive every lock and barrier above it relies on.
    #[inline]
    pub fn compare_exchange(&self, idx: usize, expected: u32, new: u32) -> Result<u32, u32> {
        self.slots[idx].compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
    }
}

/// Spin until `pred` returns `true`.
///
/// This is the single wait point for every busy-wait in the crate
/// ([`crate::SpinMutex::lock`], [`crate::CyclicBarrier::wait`], the
/// scheduler's idle loop). Swapping busy-waiting for a blocking wait means
/// changing this one function, not its callers.
///
/// The backoff escalates from `spin_loop` hints to `yield_now`, mirroring the
/// spin-then-yield tier of a tiered idle strategy; it never parks, because
/// none of the callers has a notification channel to guarantee wakeup.
#[cfg(not(loom))]
#[inline]
pub fn spin_until(mut pred: impl FnMut() -> bool) {
    let backoff = Backoff::new();
    while !pred() {
        backoff.snooze();
    }
}

/// Loom builds replace the backoff with an explicit yield so the model
/// checker can bound the spin loop.
#[cfg(loom)]
#[inline]
pub fn spin_until(mut pred: impl FnMut() -> bool) {
    while !pred() {
        loom::thread::yield_now();
    }
}

/// Slot layout for the spin-mutex demo segment.
///
/// One lock word, one owner-telemetry word, one waiting count, one protected
/// counter.
pub mod mutex_layout {
    /// Lock flag: 0 = free, 1 = held.
    pub const LOCK: usize = 0;
    /// Telemetry only: id of the current holder, [`OWNER_NONE`] when free.
    pub const OWNER: usize = 1;
    /// Telemetry only: count of workers currently spinning for the lock.
    pub const WAITING: usize = 2;
    /// The payload guarded by the lock.
    pub const COUNTER: usize = 3;
    /// Sentinel owner id meaning "nobody".
    pub const OWNER_NONE: u32 = u32::MAX;
    /// Total slots the mutex demo needs.
    pub const SEGMENT_LEN: usize = 4;
}

/// Slot layout for the cyclic-barrier segment.
pub mod barrier_layout {
    /// Count of workers that reached the current round's rendezvous.
    pub const ARRIVED: usize = 0;
    /// Monotonically increasing round counter.
    pub const GENERATION: usize = 1;
    /// Total slots the barrier needs.
    pub const SEGMENT_LEN: usize = 2;
}

/// Slot layout for the work-stealing segment: one published deque length per
/// worker, indexed by worker id.
pub mod deque_layout {
    /// Slot holding worker `id`'s published deque length.
    #[inline]
    pub const fn len_slot(worker_id: usize) -> usize {
        worker_id
    }

    /// Total slots for a cohort of `workers`.
    #[inline]
    pub const fn segment_len(workers: usize) -> usize {
        workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn load_store_add_sub() {
        let seg = SharedSegment::new(4);
        assert_eq!(seg.load(0), 0);
        seg.store(0, 41);
        assert_eq!(seg.add(0, 1), 41);
        assert_eq!(seg.load(0), 42);
        assert_eq!(seg.sub(0, 2), 42);
        assert_eq!(seg.load(0), 40);
        // Other slots untouched.
        assert_eq!(seg.load(1), 0);
        assert_eq!(seg.load(3), 0);
    }

    #[test]
    fn compare_exchange_success_and_failure() {
        let seg = SharedSegment::new(1);
        assert_eq!(seg.compare_exchange(0, 0, 5), Ok(0));
        assert_eq!(seg.compare_exchange(0, 0, 9), Err(5));
        assert_eq!(seg.load(0), 5);
    }

    #[test]
    #[should_panic(expected = "len > 0")]
    fn zero_len_rejected() {
        let _ = SharedSegment::new(0);
    }

    /// fetch_add from many threads must not lose updates.
    #[test]
    fn concurrent_add_is_exact() {
        let seg = Arc::new(SharedSegment::new(1));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seg = Arc::clone(&seg);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        seg.add(0, 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(seg.load(0), 4000);
    }

    /// Exactly one of four racing CAS(0 -> id) attempts may win.
    #[test]
    fn cas_single_winner() {
        let seg = Arc::new(SharedSegment::new(1));
        let handles: Vec<_> = (1..=4u32)
            .map(|id| {
                let seg = Arc::clone(&seg);
                thread::spawn(move || seg.compare_exchange(0, 0, id).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(winners, 1);
        assert!(seg.load(0) >= 1 && seg.load(0) <= 4);
    }

    #[test]
    fn spin_until_returns_when_pred_holds() {
        let seg = Arc::new(SharedSegment::new(1));
        let writer = {
            let seg = Arc::clone(&seg);
            thread::spawn(move || seg.store(0, 1))
        };
        spin_until(|| seg.load(0) == 1);
        writer.join().unwrap();
    }
}
