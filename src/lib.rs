//! # Lock-free message-passing containers for low-latency pipelines
//!
//! In-process containers for shared-memory multi-core pipelines, differing
//! only in the cardinality of their producers and consumers:
//!
//! * [`spsc`]: bounded single-producer / single-consumer ring.
//! * [`mpsc`]: bounded multi-producer / single-consumer ring with strict
//!   FIFO delivery in reservation order.
//! * [`fanout`]: multi-producer / multi-consumer fan-out queue in which
//!   every subscriber sees every element.
//! * [`append_vec`]: single-producer append-only vector whose elements
//!   live forever and whose iterators survive reallocation.
//!
//! # Features
//!
//! * **Lock-free fast paths**: producers and consumers synchronize through
//!   atomic counters only; the one mutex in the crate guards the fan-out
//!   subscription registry and is never taken on a push or pop.
//! * **Reserve/commit producers**: multi-producer queues share a
//!   [`CommitBarrier`]: one fetch-add to reserve, one compare-exchange to
//!   commit, strict FIFO visibility in reservation order.
//! * **Cache-friendly layout**: shared counters are [`CachePadded`] and
//!   element storage is striped so neighboring indices never share a cache
//!   line (see [`cache`]).
//! * **Cooperative reclamation**: the fan-out queue recovers ring space
//!   from its slowest subscriber on a periodic maintenance sweep driven by
//!   a [`Ticker`], keeping the subscription registry off the hot path.
//!
//! # Spin-wait behavior
//!
//! `push` on a full ring busy-waits (with a pause hint) until space frees;
//! commits busy-wait for earlier reservations. There are no timeouts and
//! no OS blocking. `pop` never blocks. This trades CPU for the lowest
//! possible latency and predictable behavior; size rings generously.
//!
//! # Quick example
//!
//! ```ignore
//! use ringcast::{Fanout, Pow2};
//!
//! let queue = Fanout::<u64, Pow2>::new(1, 1024);
//! let mut sub = queue.subscribe();
//!
//! queue.push(42);
//! assert_eq!(sub.pop(), Some(42));
//! ```
//!
//! # Design overview
//!
//! All ring indices are monotonically increasing 64-bit counters, mapped
//! into the backing buffer modulo its flat size; they are never reset and
//! never wrap in any realistic runtime. A ring with flat size `N` holds at
//! most `N - 1` elements so that full and empty remain distinguishable.
//!
//! Containers are pinned behind shared allocations once constructed; the
//! handles returned by the constructors are the only way to move them
//! between threads.

pub mod append_vec;
pub mod barrier;
pub mod cache;
pub mod fanout;
pub mod mpsc;
pub mod spsc;
pub mod ticker;

pub use append_vec::ShrinkError;
pub use barrier::CommitBarrier;
pub use cache::{CACHE_LINE_SIZE, CachePadded, Exact, PackedBuffer, Pow2, SizePolicy};
pub use fanout::{Fanout, Subscription};
pub use ticker::{TickToken, Ticker};
