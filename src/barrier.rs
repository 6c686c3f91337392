//! Cyclic barrier over two shared-segment slots.
//!
//! # Algorithm
//! `wait()` captures the current `GENERATION`, then atomically increments
//! `ARRIVED`. The last arriver (post-increment count == parties) resets
//! `ARRIVED` to 0 and bumps `GENERATION`; everyone — last arriver included —
//! then spins until `GENERATION` differs from the captured value.
//!
//! The two-counter design is what makes the barrier *cyclic*: resetting
//! `ARRIVED` before bumping `GENERATION` means an early arriver of round
//! r+1 increments a counter that late spinners of round r are no longer
//! reading, so rounds cannot bleed into each other.
//!
//! # Invariants
//! - No worker returns from `wait()` for round r until all `parties` workers
//!   have called `wait()` for round r.
//! - At any instant all workers observe the same `GENERATION`, except during
//!   the last arriver's reset-then-bump window.
//!
//! # Misconfiguration
//! If `parties` exceeds the number of live workers, `wait()` never returns
//! for anyone. That is a configuration error callers must catch before the
//! run starts ([`crate::ConfigError::PartyCountMismatch`]); the barrier
//! itself cannot detect it at runtime and does not try.

use std::sync::Arc;

use crate::shared::{barrier_layout, spin_until, SharedSegment};

/// Reusable rendezvous point for a fixed cohort.
#[derive(Clone)]
pub struct CyclicBarrier {
    seg: Arc<SharedSegment>,
    parties: u32,
}

impl CyclicBarrier {
    /// Wraps a segment laid out per [`barrier_layout`].
    ///
    /// # Panics
    ///
    /// Panics if `parties` is zero or the segment is smaller than the
    /// barrier layout.
    pub fn new(seg: Arc<SharedSegment>, parties: u32) -> Self {
        assert!(parties > 0, "barrier requires parties > 0");
        assert!(
            seg.len() >= barrier_layout::SEGMENT_LEN,
            "segment too small for barrier layout"
        );
        Self { seg, parties }
    }

    /// Blocks until all parties have called `wait()` for the current round,
    /// then releases everyone simultaneously and resets for reuse.
    ///
    /// Returns the generation value captured at entry — i.e. the index of
    /// the round that just completed (0 for the first rendezvous).
    pub fn wait(&self) -> u32 {
        let entry_gen = self.seg.load(barrier_layout::GENERATION);
        let arrived = self.seg.add(barrier_layout::ARRIVED, 1) + 1;

        if arrived == self.parties {
            // Last arriver: reset first, then advance. The order matters —
            // once GENERATION moves, released workers may re-enter and
            // increment ARRIVED for the next round.
            self.seg.store(barrier_layout::ARRIVED, 0);
            self.seg.add(barrier_layout::GENERATION, 1);
        }

        spin_until(|| self.seg.load(barrier_layout::GENERATION) != entry_gen);
        entry_gen
    }

    /// Configured cohort size.
    #[inline]
    pub fn parties(&self) -> u32 {
        self.parties
    }

    /// Telemetry: completed-round count so far. Racy; informational only.
    pub fn generation(&self) -> u32 {
        self.seg.load(barrier_layout::GENERATION)
    }

    /// Telemetry: workers currently parked at the rendezvous. Racy.
    pub fn arrived(&self) -> u32 {
        self.seg.load(barrier_layout::ARRIVED)
    }
}

impl std::fmt::Debug for CyclicBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CyclicBarrier")
            .field("parties", &self.parties)
            .field("generation", &self.generation())
            .field("arrived", &self.arrived())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn barrier(parties: u32) -> CyclicBarrier {
        CyclicBarrier::new(
            Arc::new(SharedSegment::new(barrier_layout::SEGMENT_LEN)),
            parties,
        )
    }

    #[test]
    fn single_party_never_blocks() {
        let b = barrier(1);
        assert_eq!(b.wait(), 0);
        assert_eq!(b.wait(), 1);
        assert_eq!(b.wait(), 2);
        assert_eq!(b.generation(), 3);
        assert_eq!(b.arrived(), 0);
    }

    /// 3 workers x 5 rounds: every wait() for round r returns r, and no
    /// worker observes a generation more than one round ahead of the
    /// slowest (checked via a shared max/min round tracker).
    #[test]
    fn rounds_stay_in_lockstep() {
        const WORKERS: u32 = 3;
        const ROUNDS: u32 = 5;

        let b = barrier(WORKERS);
        let completed: Arc<Vec<AtomicU32>> =
            Arc::new((0..WORKERS).map(|_| AtomicU32::new(0)).collect());

        let handles: Vec<_> = (0..WORKERS as usize)
            .map(|w| {
                let b = b.clone();
                let completed = Arc::clone(&completed);
                thread::spawn(move || {
                    for r in 0..ROUNDS {
                        let gen = b.wait();
                        assert_eq!(gen, r, "worker {w} saw wrong round");
                        completed[w].store(r + 1, Ordering::SeqCst);

                        // Lockstep check: nobody can be more than one full
                        // round ahead of anyone else.
                        let mine = r + 1;
                        for other in completed.iter() {
                            let theirs = other.load(Ordering::SeqCst);
                            assert!(
                                mine.saturating_sub(theirs) <= 1,
                                "round skew: {mine} vs {theirs}"
                            );
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(b.generation(), ROUNDS);
        assert_eq!(b.arrived(), 0);
    }

    /// Reuse across many rounds with varying per-round work.
    #[test]
    fn reusable_across_rounds_with_skew() {
        let b = barrier(4);
        let handles: Vec<_> = (0..4u64)
            .map(|w| {
                let b = b.clone();
                thread::spawn(move || {
                    for r in 0..10u32 {
                        // Uneven arrival times per worker per round.
                        let mut x = w.wrapping_mul(0x9E37_79B9).wrapping_add(r as u64);
                        for _ in 0..(x % 257) {
                            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
                        }
                        std::hint::black_box(x);
                        assert_eq!(b.wait(), r);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(b.generation(), 10);
    }
}

#[cfg(loom)]
mod loom_tests {
    use super::*;
    use loom::thread;
    use std::sync::Arc;

    /// Two parties, two rounds: exhaustively checks the reset/bump window
    /// cannot let one thread lap the other.
    #[test]
    fn two_parties_two_rounds() {
        loom::model(|| {
            let b = CyclicBarrier::new(
                Arc::new(SharedSegment::new(barrier_layout::SEGMENT_LEN)),
                2,
            );
            let b2 = b.clone();

            let h = thread::spawn(move || {
                assert_eq!(b2.wait(), 0);
                assert_eq!(b2.wait(), 1);
            });
            assert_eq!(b.wait(), 0);
            assert_eq!(b.wait(), 1);
            h.join().unwrap();

            assert_eq!(b.generation(), 2);
            assert_eq!(b.arrived(), 0);
        });
    }
}
