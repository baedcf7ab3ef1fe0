//! Reserve/commit primitive backing the multi-producer queues.
//!
//! A [`CommitBarrier`] pairs a monotonically increasing *write head* with a
//! *read head*. Producers reserve slots by fetch-incrementing the write
//! head, write their data, then commit. A commit only succeeds once every
//! earlier reservation has committed, so slots become visible to consumers
//! in strict reservation order.
//!
//! # Protocol
//!
//! 1. [`reserve`](CommitBarrier::reserve) atomically claims the next index;
//!    the returned value is the caller's exclusive slot.
//! 2. The producer writes its slot.
//! 3. [`commit`](CommitBarrier::commit) advances the read head from `index`
//!    to `index + 1`. A producer that finished out of order spins here until
//!    its predecessors commit.
//! 4. Consumers poll [`committed`](CommitBarrier::committed) for the upper
//!    bound of readable slots.
//!
//! Both heads are cache padded so concurrent producers and the consumer
//! never false-share.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Multi-producer commit barrier.
pub struct CommitBarrier {
    /// Next free index; incremented by producers to reserve.
    write_head: CachePadded<AtomicU64>,
    /// Next index not yet visible to consumers.
    read_head: CachePadded<AtomicU64>,
}

impl CommitBarrier {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            write_head: CachePadded::new(AtomicU64::new(0)),
            read_head: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Reserves a slot for writing and returns the caller-exclusive index.
    ///
    /// Safe for any number of concurrent producers.
    #[inline]
    pub fn reserve(&self) -> u64 {
        self.write_head.fetch_add(1, Ordering::AcqRel)
    }

    /// Snapshot of the consumer-visible read head.
    ///
    /// Every index below the returned value has been fully written and
    /// committed.
    #[inline]
    pub fn committed(&self) -> u64 {
        self.read_head.load(Ordering::Acquire)
    }

    /// Commits the slot at `index`, making it visible to consumers.
    ///
    /// Busy-waits until all earlier reservations have committed; the loop
    /// never fails and has no timeout. If a failed exchange observes the
    /// read head already past `index` another actor performed the advance
    /// (possible only after a spurious weak-exchange failure, since `index`
    /// has a unique owner) and the call returns immediately.
    #[inline]
    pub fn commit(&self, index: u64) {
        let desired = index + 1;
        let mut expected = index;
        while let Err(observed) =
            self.read_head
                .compare_exchange_weak(expected, desired, Ordering::Release, Ordering::Relaxed)
        {
            if observed >= desired {
                return;
            }
            expected = index;
            std::hint::spin_loop();
        }
    }
}

impl Default for CommitBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommitBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitBarrier")
            .field("write_head", &self.write_head.load(Ordering::Acquire))
            .field("read_head", &self.read_head.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reserve_returns_sequential_indices() {
        let barrier = CommitBarrier::new();
        assert_eq!(barrier.reserve(), 0);
        assert_eq!(barrier.reserve(), 1);
        assert_eq!(barrier.reserve(), 2);
        assert_eq!(barrier.committed(), 0);
    }

    #[test]
    fn in_order_commits_advance_the_read_head() {
        let barrier = CommitBarrier::new();
        for i in 0..10 {
            assert_eq!(barrier.reserve(), i);
            barrier.commit(i);
            assert_eq!(barrier.committed(), i + 1);
        }
    }

    #[test]
    fn out_of_order_commit_waits_for_predecessor() {
        let barrier = Arc::new(CommitBarrier::new());
        assert_eq!(barrier.reserve(), 0);
        assert_eq!(barrier.reserve(), 1);

        let late = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.commit(1))
        };

        // Slot 1 must stay invisible until slot 0 commits.
        thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(barrier.committed(), 0);

        barrier.commit(0);
        late.join().unwrap();
        assert_eq!(barrier.committed(), 2);
    }

    #[test]
    fn many_producers_commit_in_reservation_order() {
        let barrier = Arc::new(CommitBarrier::new());
        let mut workers = Vec::new();
        for _ in 0..4 {
            let barrier = Arc::clone(&barrier);
            workers.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let index = barrier.reserve();
                    barrier.commit(index);
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(barrier.committed(), 4000);
    }
}
