//! Periodic callback dispatcher used by the fan-out queue's maintenance
//! sweep.
//!
//! A [`Ticker`] owns one background thread that repeatedly walks a registry
//! of zero-argument callbacks. Registration returns an opaque
//! [`TickToken`]; unregistering with it guarantees that, once the call
//! returns, the callback will not run again (an invocation already in
//! flight completes first, because callbacks run under the same lock that
//! `unregister` takes).
//!
//! The invocation rate is unspecified; the dispatch thread sleeps briefly
//! between sweeps so it makes progress without monopolizing a core. A
//! panicking callback is caught and does not stop dispatch of the others.
//!
//! Callbacks must not register or unregister on the ticker that is
//! invoking them; the registry lock is not reentrant.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

/// Pause between dispatch sweeps.
const TICK_PAUSE: Duration = Duration::from_micros(50);

/// Opaque handle to a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TickToken(u64);

type Callback = Box<dyn FnMut() + Send>;

struct Registry {
    callbacks: HashMap<u64, Callback>,
    next_token: u64,
}

struct Inner {
    registry: Mutex<Registry>,
}

impl Inner {
    fn run_once(&self) {
        let mut registry = self.registry.lock();
        for callback in registry.callbacks.values_mut() {
            // A panicking callback must not take down the dispatch thread
            // or starve the remaining callbacks.
            let _ = panic::catch_unwind(AssertUnwindSafe(|| callback()));
        }
    }
}

/// Handle to a background callback dispatcher.
///
/// Cloning is cheap; all clones share the same dispatch thread. The thread
/// exits shortly after the last handle is dropped.
#[derive(Clone)]
pub struct Ticker {
    inner: Arc<Inner>,
}

impl Ticker {
    /// Spawns a dispatcher with its own background thread.
    #[must_use]
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            registry: Mutex::new(Registry {
                callbacks: HashMap::new(),
                next_token: 0,
            }),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        thread::Builder::new()
            .name("ringcast-ticker".into())
            .spawn(move || {
                // The thread holds only a weak reference, so dropping the
                // last handle lets it wind down on its next iteration.
                while let Some(inner) = weak.upgrade() {
                    inner.run_once();
                    drop(inner);
                    thread::sleep(TICK_PAUSE);
                }
            })
            .expect("failed to spawn ticker thread");

        Self { inner }
    }

    /// Process-wide shared dispatcher, created on first use.
    #[must_use]
    pub fn global() -> Ticker {
        static GLOBAL: OnceLock<Ticker> = OnceLock::new();
        GLOBAL.get_or_init(Ticker::new).clone()
    }

    /// Registers `callback` for repeated invocation on the dispatch thread.
    pub fn register(&self, callback: impl FnMut() + Send + 'static) -> TickToken {
        let mut registry = self.inner.registry.lock();
        let token = registry.next_token;
        registry.next_token += 1;
        registry.callbacks.insert(token, Box::new(callback));
        TickToken(token)
    }

    /// Removes a previously registered callback.
    ///
    /// After this returns the callback will not be invoked again. Unknown
    /// tokens are ignored.
    pub fn unregister(&self, token: TickToken) {
        self.inner.registry.lock().callbacks.remove(&token.0);
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Ticker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticker")
            .field("callbacks", &self.inner.registry.lock().callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn registered_callback_fires_repeatedly() {
        let ticker = Ticker::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let token = ticker.register({
            let hits = Arc::clone(&hits);
            move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }
        });

        assert!(wait_until(Duration::from_secs(1), || {
            hits.load(Ordering::Relaxed) >= 3
        }));
        ticker.unregister(token);
    }

    #[test]
    fn unregister_stops_invocations() {
        let ticker = Ticker::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let token = ticker.register({
            let hits = Arc::clone(&hits);
            move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }
        });

        assert!(wait_until(Duration::from_secs(1), || {
            hits.load(Ordering::Relaxed) > 0
        }));
        ticker.unregister(token);

        let snapshot = hits.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::Relaxed), snapshot);
    }

    #[test]
    fn unregistering_an_unknown_token_is_a_no_op() {
        let ticker = Ticker::new();
        let token = ticker.register(|| {});
        ticker.unregister(token);
        ticker.unregister(token);
    }

    #[test]
    fn a_panicking_callback_does_not_starve_others() {
        let ticker = Ticker::new();

        let mut panicked = false;
        let bad = ticker.register(move || {
            if !panicked {
                panicked = true;
                panic!("callback failure");
            }
        });

        let hits = Arc::new(AtomicUsize::new(0));
        let good = ticker.register({
            let hits = Arc::clone(&hits);
            move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }
        });

        assert!(wait_until(Duration::from_secs(1), || {
            hits.load(Ordering::Relaxed) >= 3
        }));
        ticker.unregister(bad);
        ticker.unregister(good);
    }

    #[test]
    fn global_ticker_is_shared() {
        let a = Ticker::global();
        let b = Ticker::global();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));

        let hits = Arc::new(AtomicUsize::new(0));
        let token = a.register({
            let hits = Arc::clone(&hits);
            move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }
        });
        assert!(wait_until(Duration::from_secs(1), || {
            hits.load(Ordering::Relaxed) > 0
        }));
        b.unregister(token);
    }
}
