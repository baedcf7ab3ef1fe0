//! Bounded multi-producer / single-consumer ring.
//!
//! Producers share a [`CommitBarrier`]: a single fetch-add reserves a slot,
//! and a commit makes it visible once every earlier reservation has
//! committed. Delivery to the consumer is therefore strict FIFO in
//! *reservation* order; a slow writer at index `i` delays visibility of
//! every later index, which is the stated price of in-order delivery.
//!
//! The consumer side is identical to the SPSC ring except that the upper
//! bound of readable slots comes from the barrier's committed index.
//!
//! # Example
//!
//! ```ignore
//! let (tx, mut rx) = ringcast::mpsc::channel::<u64, ringcast::Pow2>(1, 0);
//! let tx2 = tx.clone();
//! tx.push(1);
//! tx2.push(2);
//! assert_eq!(rx.pop(), Some(1));
//! ```

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::barrier::CommitBarrier;
use crate::cache::{PackedBuffer, Pow2, SizePolicy};

struct Shared<T, P: SizePolicy> {
    buffer: PackedBuffer<T, P>,
    barrier: CommitBarrier,
    /// First unconsumed slot; advanced only by the consumer, polled by
    /// producers for the full check.
    tail: CachePadded<AtomicU64>,
}

impl<T, P: SizePolicy> Shared<T, P> {
    fn size(&self) -> usize {
        // Tail first so the committed index read afterwards can only be
        // larger; the difference never wraps.
        let tail = self.tail.load(Ordering::Relaxed);
        (self.barrier.committed() - tail) as usize
    }
}

/// Creates a bounded MPSC ring sized to at least `min_lines` cache lines or
/// `min_elements` elements, whichever is larger.
///
/// The producer handle is cheaply cloneable; every clone pushes into the
/// same ring. Exactly one consumer exists.
#[must_use]
pub fn channel<T, P>(min_lines: usize, min_elements: usize) -> (Producer<T, P>, Consumer<T, P>)
where
    T: Default,
    P: SizePolicy,
{
    let shared = Arc::new(Shared {
        buffer: PackedBuffer::new(min_lines, min_elements),
        barrier: CommitBarrier::new(),
        tail: CachePadded::new(AtomicU64::new(0)),
    });
    (
        Producer {
            shared: Arc::clone(&shared),
        },
        Consumer { shared },
    )
}

/// Producing handle of an MPSC ring. Clone one per producer thread.
pub struct Producer<T, P: SizePolicy = Pow2> {
    shared: Arc<Shared<T, P>>,
}

impl<T: Default, P: SizePolicy> Producer<T, P> {
    /// Reserves a slot, spinning while the ring is full.
    #[inline]
    fn claim(&self) -> u64 {
        let index = self.shared.barrier.reserve();
        let free_needed = self.shared.buffer.len() as u64 - 1;
        while index - self.shared.tail.load(Ordering::Relaxed) >= free_needed {
            std::hint::spin_loop();
        }
        index
    }

    /// Moves `value` into the ring.
    ///
    /// Busy-waits while the ring is full. Visibility to the consumer is in
    /// reservation order: this push becomes visible only after every
    /// earlier reservation has committed.
    #[inline]
    pub fn push(&self, value: T) {
        let index = self.claim();
        // SAFETY: the barrier handed out `index` exactly once, and the full
        // check keeps it ahead of the consumer; this slot is exclusively
        // ours until commit.
        unsafe { *self.shared.buffer.get_mut(index) = value };
        self.shared.barrier.commit(index);
    }

    /// Clones `value` into the ring without consuming it.
    #[inline]
    pub fn push_from(&self, value: &T)
    where
        T: Clone,
    {
        let index = self.claim();
        // SAFETY: as in `push`.
        unsafe { self.shared.buffer.get_mut(index).clone_from(value) };
        self.shared.barrier.commit(index);
    }

    /// Elements committed and not yet consumed. At most `capacity() - 1`.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Flat ring size; one slot is always kept vacant.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.buffer.len()
    }
}

impl<T, P: SizePolicy> Clone for Producer<T, P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Consuming half of an MPSC ring.
pub struct Consumer<T, P: SizePolicy = Pow2> {
    shared: Arc<Shared<T, P>>,
}

impl<T: Default, P: SizePolicy> Consumer<T, P> {
    /// Takes the oldest committed element, or returns `None` when nothing
    /// has been committed. Never blocks.
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        let committed = self.shared.barrier.committed();
        let tail = self.shared.tail.load(Ordering::Relaxed);
        if committed <= tail {
            return None;
        }
        // SAFETY: `tail < committed` means the owning producer finished
        // writing this slot; producers stay `capacity - 1` ahead of the
        // tail, so none of them touches it until we advance.
        let value = unsafe { mem::take(self.shared.buffer.get_mut(tail)) };
        self.shared.tail.store(tail + 1, Ordering::Release);
        Some(value)
    }

    /// Elements committed and not yet consumed. At most `capacity() - 1`.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Flat ring size; one slot is always kept vacant.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.buffer.len()
    }
}

impl<T, P: SizePolicy> fmt::Debug for Producer<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("mpsc::Producer")
            .field("barrier", &self.shared.barrier)
            .field("tail", &self.shared.tail.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T, P: SizePolicy> fmt::Debug for Consumer<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("mpsc::Consumer")
            .field("barrier", &self.shared.barrier)
            .field("tail", &self.shared.tail.load(Ordering::Relaxed))
            .finish()
    }
}
