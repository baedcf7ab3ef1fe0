//! Multi-producer / multi-consumer fan-out queue.
//!
//! A classic ring supports one consumer. This container lets any number of
//! consumers subscribe to the same write stream, each with its own cursor:
//! every subscriber sees every committed element, in the same global order.
//!
//! Producers share the same reserve/commit hot path as the MPSC ring. Ring
//! space is recovered cooperatively: a maintenance sweep, driven by a
//! [`Ticker`], periodically walks the subscriptions, prunes unsubscribed
//! handles and publishes the minimum cursor. Producers consult only that
//! published minimum for their full check, so the subscription registry
//! never sits on a fast path.
//!
//! Consequences of the design:
//!
//! * Back-pressure relief is granular to the tick interval. Size the ring
//!   to absorb roughly `push_rate * tick_interval` extra elements even when
//!   consumers keep up.
//! * `pop` copies (clones) rather than moves, so every subscriber can
//!   materialize the element independently.
//! * A subscriber that stops popping eventually stalls all producers; the
//!   escape hatch is [`Subscription::unsubscribe`].
//! * A late subscriber starts at the current commit point and sees only
//!   future elements, so it can never hold back slots it never saw.
//!
//! # Example
//!
//! ```ignore
//! let queue = ringcast::Fanout::<u64>::new(1, 0);
//! let mut sub = queue.subscribe();
//! queue.push(7);
//! assert_eq!(sub.pop(), Some(7));
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::barrier::CommitBarrier;
use crate::cache::{PackedBuffer, Pow2, SizePolicy};
use crate::ticker::{TickToken, Ticker};

/// Per-subscriber cursor state, owned by the queue's registry and shared
/// with the handle that reads through it.
struct SubscriberState {
    /// Next index this subscriber will read. Always at most the committed
    /// index while subscribed.
    cursor: CachePadded<AtomicU64>,
    /// Monotonic true-to-false flag; flipped by `unsubscribe`, observed by
    /// the maintenance sweep.
    subscribed: AtomicBool,
}

struct Shared<T, P: SizePolicy> {
    buffer: PackedBuffer<T, P>,
    barrier: CommitBarrier,
    /// Minimum of the committed index and all live cursors, as of the last
    /// maintenance sweep. Producers use this, never the live cursors.
    min_tail: CachePadded<AtomicU64>,
    /// Owning registry of subscriber cursors. Locked on subscribe and
    /// during the sweep only.
    subscribers: Mutex<Vec<Arc<SubscriberState>>>,
}

impl<T, P: SizePolicy> Shared<T, P> {
    /// Maintenance sweep: recompute the published minimum cursor and prune
    /// unsubscribed handles. Runs on the ticker thread.
    fn sweep(&self) {
        let mut subscribers = self.subscribers.lock();
        let mut min = self.barrier.committed();
        subscribers.retain(|state| {
            if state.subscribed.load(Ordering::Acquire) {
                min = min.min(state.cursor.load(Ordering::Acquire));
                true
            } else {
                false
            }
        });
        self.min_tail.store(min, Ordering::Release);
    }

    fn size(&self) -> usize {
        let min_tail = self.min_tail.load(Ordering::Relaxed);
        (self.barrier.committed() - min_tail) as usize
    }
}

/// Keeps the maintenance sweep registered for as long as any queue handle
/// lives; unregisters when the last one drops.
struct SweepRegistration {
    ticker: Ticker,
    token: TickToken,
}

impl Drop for SweepRegistration {
    fn drop(&mut self) {
        self.ticker.unregister(self.token);
    }
}

/// Fan-out queue handle. Cloning is cheap; all clones push into and
/// subscribe to the same queue.
pub struct Fanout<T, P: SizePolicy = Pow2> {
    shared: Arc<Shared<T, P>>,
    _registration: Arc<SweepRegistration>,
}

impl<T, P> Fanout<T, P>
where
    T: Clone + Default + Send + Sync + 'static,
    P: SizePolicy,
{
    /// Creates a queue sized to at least `min_lines` cache lines or
    /// `min_elements` elements, whichever is larger, with its maintenance
    /// sweep driven by the process-wide [`Ticker::global`].
    #[must_use]
    pub fn new(min_lines: usize, min_elements: usize) -> Self {
        Self::with_ticker(min_lines, min_elements, &Ticker::global())
    }

    /// Creates a queue whose maintenance sweep runs on an explicit ticker.
    #[must_use]
    pub fn with_ticker(min_lines: usize, min_elements: usize, ticker: &Ticker) -> Self {
        let shared = Arc::new(Shared {
            buffer: PackedBuffer::new(min_lines, min_elements),
            barrier: CommitBarrier::new(),
            min_tail: CachePadded::new(AtomicU64::new(0)),
            subscribers: Mutex::new(Vec::new()),
        });

        // The sweep holds a weak reference so a registered callback never
        // keeps the queue alive on its own.
        let weak = Arc::downgrade(&shared);
        let token = ticker.register(move || {
            if let Some(shared) = weak.upgrade() {
                shared.sweep();
            }
        });

        Self {
            shared,
            _registration: Arc::new(SweepRegistration {
                ticker: ticker.clone(),
                token,
            }),
        }
    }

    /// Reserves a slot, spinning while the ring is full relative to the
    /// last published minimum cursor.
    #[inline]
    fn claim(&self) -> u64 {
        let index = self.shared.barrier.reserve();
        let free_needed = self.shared.buffer.len() as u64 - 1;
        while index - self.shared.min_tail.load(Ordering::Relaxed) >= free_needed {
            std::hint::spin_loop();
        }
        index
    }

    /// Moves `value` into the queue.
    ///
    /// Busy-waits while the ring is full. If no subscriber ever advances,
    /// this spins forever; unsubscribing the stalled reader is the escape
    /// hatch.
    #[inline]
    pub fn push(&self, value: T) {
        let index = self.claim();
        // SAFETY: the barrier handed out `index` exactly once, and the full
        // check against the published minimum cursor guarantees every
        // subscriber has moved past the slot this index overwrites.
        unsafe { *self.shared.buffer.get_mut(index) = value };
        self.shared.barrier.commit(index);
    }

    /// Clones `value` into the queue without consuming it.
    #[inline]
    pub fn push_from(&self, value: &T) {
        let index = self.claim();
        // SAFETY: as in `push`.
        unsafe { self.shared.buffer.get_mut(index).clone_from(value) };
        self.shared.barrier.commit(index);
    }

    /// Creates a new independent subscription.
    ///
    /// The cursor starts at the current commit point, so the subscriber
    /// observes only elements pushed after this call.
    #[must_use]
    pub fn subscribe(&self) -> Subscription<T, P> {
        let mut subscribers = self.shared.subscribers.lock();
        let state = Arc::new(SubscriberState {
            cursor: CachePadded::new(AtomicU64::new(self.shared.barrier.committed())),
            subscribed: AtomicBool::new(true),
        });
        subscribers.push(Arc::clone(&state));
        Subscription {
            shared: Arc::clone(&self.shared),
            state,
        }
    }

    /// Committed elements not yet passed by the slowest subscriber, as of
    /// the last maintenance sweep.
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

impl<T, P: SizePolicy> Clone for Fanout<T, P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _registration: Arc::clone(&self._registration),
        }
    }
}

impl<T, P: SizePolicy> fmt::Debug for Fanout<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fanout")
            .field("barrier", &self.shared.barrier)
            .field("min_tail", &self.shared.min_tail.load(Ordering::Relaxed))
            .field("capacity", &self.shared.buffer.len())
            .finish()
    }
}

/// Per-consumer cursor into a [`Fanout`] queue.
///
/// Each subscription reads the full committed stream independently of the
/// others. Dropping the handle unsubscribes it; the registry entry is
/// reclaimed by the next maintenance sweep either way.
pub struct Subscription<T, P: SizePolicy = Pow2> {
    shared: Arc<Shared<T, P>>,
    state: Arc<SubscriberState>,
}

impl<T, P> Subscription<T, P>
where
    T: Clone + Default + Send + Sync + 'static,
    P: SizePolicy,
{
    /// Clones the next committed element, or returns `None` when this
    /// subscriber has seen everything committed so far. Never blocks.
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        let committed = self.shared.barrier.committed();
        let cursor = self.state.cursor.load(Ordering::Relaxed);
        if committed <= cursor {
            return None;
        }
        // SAFETY: `cursor < committed` means the slot is fully written, and
        // producers cannot overwrite it because the published minimum
        // cursor is at most our cursor while we are subscribed.
        let value = unsafe { self.shared.buffer.get(cursor) }.clone();
        self.state.cursor.store(cursor + 1, Ordering::Release);
        Some(value)
    }

    /// Current read cursor.
    #[must_use]
    pub fn tail(&self) -> u64 {
        self.state.cursor.load(Ordering::Relaxed)
    }

    /// Whether this handle still holds ring space.
    #[must_use]
    pub fn subscribed(&self) -> bool {
        self.state.subscribed.load(Ordering::Acquire)
    }

    /// Releases this subscriber's claim on ring space.
    ///
    /// Takes effect at the next maintenance sweep, which also prunes the
    /// registry entry. Calling it more than once is harmless.
    pub fn unsubscribe(&self) {
        self.state.subscribed.store(false, Ordering::Release);
    }
}

impl<T, P: SizePolicy> Drop for Subscription<T, P> {
    fn drop(&mut self) {
        self.state.subscribed.store(false, Ordering::Release);
    }
}

impl<T, P: SizePolicy> fmt::Debug for Subscription<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("cursor", &self.state.cursor.load(Ordering::Relaxed))
            .field("subscribed", &self.state.subscribed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn late_subscriber_sees_only_future_elements() {
        let queue = Fanout::<u64, Pow2>::new(1, 0);
        for i in 0..5 {
            queue.push(i);
        }

        let mut sub = queue.subscribe();
        assert_eq!(sub.pop(), None);

        queue.push(42);
        assert_eq!(sub.pop(), Some(42));
        assert_eq!(sub.pop(), None);
    }

    #[test]
    fn every_subscriber_sees_every_element_in_order() {
        let queue = Fanout::<u64, Pow2>::new(1, 16);
        let mut a = queue.subscribe();
        let mut b = queue.subscribe();

        for i in 0..10 {
            queue.push(i);
        }

        let drain = |sub: &mut Subscription<u64, Pow2>| {
            let mut out = Vec::new();
            while let Some(v) = sub.pop() {
                out.push(v);
            }
            out
        };
        let expected: Vec<u64> = (0..10).collect();
        assert_eq!(drain(&mut a), expected);
        assert_eq!(drain(&mut b), expected);
    }

    #[test]
    fn pop_does_not_consume_for_other_subscribers() {
        let queue = Fanout::<String, Pow2>::new(1, 0);
        let mut a = queue.subscribe();
        let mut b = queue.subscribe();

        queue.push_from(&String::from("shared"));
        assert_eq!(a.pop().as_deref(), Some("shared"));
        assert_eq!(b.pop().as_deref(), Some("shared"));
    }

    #[test]
    fn tail_tracks_the_cursor() {
        let queue = Fanout::<u64, Pow2>::new(1, 0);
        let mut sub = queue.subscribe();
        assert_eq!(sub.tail(), 0);

        queue.push(1);
        queue.push(2);
        sub.pop();
        assert_eq!(sub.tail(), 1);
        sub.pop();
        assert_eq!(sub.tail(), 2);
    }

    #[test]
    fn unsubscribe_releases_ring_space() {
        let ticker = Ticker::new();
        let queue = Fanout::<u64, Pow2>::with_ticker(1, 16, &ticker);
        assert_eq!(queue.capacity(), 16);

        let mut active = queue.subscribe();
        let idle = queue.subscribe();

        for i in 0..10 {
            queue.push(i);
        }
        for _ in 0..10 {
            active.pop();
        }
        // The idle subscriber pins the minimum cursor at zero.
        assert!(wait_until(Duration::from_secs(2), || queue.size() == 10));

        idle.unsubscribe();
        assert!(!idle.subscribed());
        assert!(wait_until(Duration::from_secs(2), || queue.size() == 0));
    }

    #[test]
    fn dropping_a_subscription_unsubscribes_it() {
        let ticker = Ticker::new();
        let queue = Fanout::<u64, Pow2>::with_ticker(1, 0, &ticker);

        let sub = queue.subscribe();
        for i in 0..3 {
            queue.push(i);
        }
        assert!(wait_until(Duration::from_secs(2), || queue.size() == 3));

        drop(sub);
        assert!(wait_until(Duration::from_secs(2), || queue.size() == 0));
    }

    #[test]
    fn zero_subscribers_do_not_limit_producers() {
        let ticker = Ticker::new();
        let queue = Fanout::<u64, Pow2>::with_ticker(1, 8, &ticker);

        // Push several rings' worth of data; the sweep keeps the published
        // minimum at the committed index, so nothing blocks for long.
        for i in 0..4 * queue.capacity() as u64 {
            queue.push(i);
        }
        assert!(wait_until(Duration::from_secs(2), || queue.size() == 0));
    }

    #[test]
    fn full_ring_blocks_producer_until_slow_subscriber_advances() {
        use std::sync::atomic::AtomicBool;

        let ticker = Ticker::new();
        let queue = Fanout::<u64, Pow2>::with_ticker(1, 8, &ticker);
        let mut sub = queue.subscribe();

        for i in 0..7 {
            queue.push(i);
        }

        let done = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = queue.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                queue.push(999);
                done.store(true, Ordering::Release);
            })
        };

        std::thread::sleep(Duration::from_millis(10));
        assert!(!done.load(Ordering::Acquire), "push completed on a full ring");

        assert_eq!(sub.pop(), Some(0));
        producer.join().unwrap();
        assert!(done.load(Ordering::Acquire));

        let mut rest = Vec::new();
        while let Some(v) = sub.pop() {
            rest.push(v);
        }
        assert_eq!(rest, vec![1, 2, 3, 4, 5, 6, 999]);
    }

    #[test]
    fn concurrent_subscribers_agree_on_the_stream() {
        const COUNT: u64 = 20_000;

        let ticker = Ticker::new();
        let queue = Fanout::<u64, Pow2>::with_ticker(1, 1024, &ticker);

        let mut readers = Vec::new();
        for _ in 0..3 {
            let mut sub = queue.subscribe();
            readers.push(std::thread::spawn(move || {
                let mut out = Vec::with_capacity(COUNT as usize);
                while out.len() < COUNT as usize {
                    if let Some(v) = sub.pop() {
                        out.push(v);
                    } else {
                        std::hint::spin_loop();
                    }
                }
                out
            }));
        }

        let writer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..COUNT {
                    queue.push(i);
                }
            })
        };

        writer.join().unwrap();
        let expected: Vec<u64> = (0..COUNT).collect();
        for reader in readers {
            assert_eq!(reader.join().unwrap(), expected);
        }
    }
}
