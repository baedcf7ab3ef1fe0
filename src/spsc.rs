//! Bounded single-producer / single-consumer ring.
//!
//! The simplest container in the crate: the producer reserves space with a
//! private (non-atomic) counter and publishes writes through a single
//! release store of the public head; the consumer polls the head and
//! advances the tail. No compare-and-swap anywhere on the fast path.
//!
//! # Ordering rationale
//!
//! ```text
//! Producer writes slot, then Release-stores head  →  consumer Acquire-loads head, then reads slot
//! Consumer takes slot, then Release-stores tail   →  producer sees space via Relaxed tail polls
//! ```
//!
//! One slot is always left vacant, so a ring with flat size `N` holds at
//! most `N - 1` elements; this keeps full and empty distinguishable.
//!
//! # Blocking behavior
//!
//! [`Producer::push`] busy-waits (with a pause hint) while the ring is
//! full. [`Consumer::pop`] never blocks; it returns `None` when empty.
//!
//! # Example
//!
//! ```ignore
//! let (mut tx, mut rx) = ringcast::spsc::channel::<u64, ringcast::Pow2>(1, 0);
//! tx.push(42);
//! assert_eq!(rx.pop(), Some(42));
//! ```

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::cache::{PackedBuffer, Pow2, SizePolicy};

struct Shared<T, P: SizePolicy> {
    buffer: PackedBuffer<T, P>,
    /// Public head: next index the producer will publish.
    head: CachePadded<AtomicU64>,
    /// Consumer cursor: next index to read.
    tail: CachePadded<AtomicU64>,
}

impl<T, P: SizePolicy> Shared<T, P> {
    fn size(&self) -> usize {
        // Tail first: the head only grows, so `head >= tail` holds for this
        // pair of loads and the subtraction cannot wrap.
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        (head - tail) as usize
    }
}

/// Creates a bounded SPSC ring sized to at least `min_lines` cache lines or
/// `min_elements` elements, whichever is larger.
///
/// The producer and consumer handles may be sent to different threads. The
/// ring storage is freed once both handles are dropped; elements still in
/// the ring are dropped with it.
#[must_use]
pub fn channel<T, P>(min_lines: usize, min_elements: usize) -> (Producer<T, P>, Consumer<T, P>)
where
    T: Default,
    P: SizePolicy,
{
    let shared = Arc::new(Shared {
        buffer: PackedBuffer::new(min_lines, min_elements),
        head: CachePadded::new(AtomicU64::new(0)),
        tail: CachePadded::new(AtomicU64::new(0)),
    });
    (
        Producer {
            shared: Arc::clone(&shared),
            next: 0,
        },
        Consumer { shared },
    )
}

/// Producing half of an SPSC ring.
///
/// Not `Clone`: exactly one producer exists per ring. The handle can be
/// moved to another thread but all pushes go through `&mut self`.
pub struct Producer<T, P: SizePolicy = Pow2> {
    shared: Arc<Shared<T, P>>,
    /// Producer-private head; published to `shared.head` after each write.
    next: u64,
}

impl<T: Default, P: SizePolicy> Producer<T, P> {
    /// Claims the next slot index, spinning while the ring is full.
    #[inline]
    fn claim(&mut self) -> u64 {
        let index = self.next;
        self.next += 1;
        let free_needed = self.shared.buffer.len() as u64 - 1;
        while index - self.shared.tail.load(Ordering::Relaxed) >= free_needed {
            std::hint::spin_loop();
        }
        index
    }

    /// Moves `value` into the ring.
    ///
    /// Busy-waits while the ring is full; there is no timeout.
    #[inline]
    pub fn push(&mut self, value: T) {
        let index = self.claim();
        // SAFETY: `index` is beyond every index the consumer may read until
        // the head store below, and behind `tail + capacity`, so this slot
        // is exclusively ours.
        unsafe { *self.shared.buffer.get_mut(index) = value };
        self.shared.head.store(index + 1, Ordering::Release);
    }

    /// Clones `value` into the ring without consuming it.
    ///
    /// Same blocking behavior as [`push`](Self::push).
    #[inline]
    pub fn push_from(&mut self, value: &T)
    where
        T: Clone,
    {
        let index = self.claim();
        // SAFETY: as in `push`.
        unsafe { self.shared.buffer.get_mut(index).clone_from(value) };
        self.shared.head.store(index + 1, Ordering::Release);
    }

    /// Elements currently buffered. At most `capacity() - 1`.
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

/// Consuming half of an SPSC ring.
pub struct Consumer<T, P: SizePolicy = Pow2> {
    shared: Arc<Shared<T, P>>,
}

impl<T: Default, P: SizePolicy> Consumer<T, P> {
    /// Takes the oldest element out of the ring, or returns `None` when the
    /// ring is empty. Never blocks.
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Acquire);
        if tail >= head {
            return None;
        }
        // SAFETY: `tail < head` means the producer has published this slot
        // and will not touch it again until we advance the tail.
        let value = unsafe { mem::take(self.shared.buffer.get_mut(tail)) };
        self.shared.tail.store(tail + 1, Ordering::Release);
        Some(value)
    }

    /// Elements currently buffered. At most `capacity() - 1`.
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
        f.debug_struct("spsc::Producer")
            .field("next", &self.next)
            .field("tail", &self.shared.tail.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T, P: SizePolicy> fmt::Debug for Consumer<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("spsc::Consumer")
            .field("head", &self.shared.head.load(Ordering::Relaxed))
            .field("tail", &self.shared.tail.load(Ordering::Relaxed))
            .finish()
    }
}
