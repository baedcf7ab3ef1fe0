//! Append-only vector with one producer and many concurrent readers.
//!
//! The producer appends through a [`Writer`]; any number of [`Reader`]s
//! observe a prefix of the insertion order with plain indexed reads. Once
//! an element is published it lives for the lifetime of the container, and
//! never changes, so readers need no locks and no retries.
//!
//! # How growth works
//!
//! Elements live in a backing array. When the array is full the producer
//! clone-constructs its contents into a fresh array of doubled capacity,
//! appends there, and publishes the new array with a release store of the
//! active pointer. The superseded array is *not* freed: it is parked in a
//! graveyard owned by the container, so references and iterators obtained
//! before the reallocation keep reading valid (and equal) elements.
//!
//! Each backing array carries its own constructed-element count, which is
//! the synchronization point for its slots: the producer writes a slot and
//! then release-stores the count, and readers acquire-load the count before
//! touching slots. A reader that observes a stale active pointer therefore
//! bounds its reads by the count of the array it actually loaded and can
//! never reach an unconstructed slot, even if the global size has moved on.
//!
//! # Iterators
//!
//! [`Iter`] carries a container reference and an index and performs a fresh
//! indexed read on every step. It never caches a backing pointer, so it is
//! naturally stable across reallocation.
//!
//! # Example
//!
//! ```ignore
//! let (mut writer, reader) = ringcast::append_vec::with_capacity::<u64>(4);
//! writer.push_back(7);
//! assert_eq!(reader.get(0), Some(&7));
//! ```

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use thiserror::Error;

/// Rejected attempt to shrink the vector. The container is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot shrink append-only vector: requested {requested}, current size is {current}")]
pub struct ShrinkError {
    /// Requested new size.
    pub requested: usize,
    /// Size at the time of the call.
    pub current: usize,
}

/// One backing array: slot storage plus the count of constructed slots.
struct Backing<T> {
    /// Constructed prefix length. Written by the producer with `Release`
    /// after constructing a slot; readers `Acquire` it before reading.
    len: AtomicUsize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T> Backing<T> {
    fn with_capacity(capacity: usize) -> Arc<Self> {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));
        Arc::new(Self {
            len: AtomicUsize::new(0),
            slots: slots.into_boxed_slice(),
        })
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Raw pointer to slot `index`; no bounds or construction check.
    #[inline]
    unsafe fn slot_ptr(&self, index: usize) -> *mut T {
        unsafe { (*self.slots.get_unchecked(index).get()).as_mut_ptr() }
    }
}

impl<T> Drop for Backing<T> {
    fn drop(&mut self) {
        if mem::needs_drop::<T>() {
            let len = *self.len.get_mut();
            for slot in &mut self.slots[..len] {
                // SAFETY: slots below `len` are constructed.
                unsafe { slot.get_mut().assume_init_drop() };
            }
        }
    }
}

struct Shared<T> {
    /// The backing array the producer currently appends to.
    active: AtomicPtr<Backing<T>>,
    /// Published logical size. Grows monotonically.
    size: AtomicUsize,
    /// Every backing array ever activated, newest last. The producer is the
    /// sole mutator; readers never touch it. Arrays parked here keep old
    /// references alive across reallocation.
    graveyard: UnsafeCell<Vec<Arc<Backing<T>>>>,
}

// SAFETY: moving the container moves the owned elements (`T: Send`);
// sharing it hands out `&T` to concurrent readers (`T: Sync`). The
// graveyard behind the `UnsafeCell` is only ever mutated by the single
// `Writer`, which holds `&mut self` for every mutating operation.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

/// Indexed read against whatever backing array is currently published.
fn read_at<T>(shared: &Shared<T>, index: usize) -> Option<&T> {
    let backing = unsafe { &*shared.active.load(Ordering::Acquire) };
    let len = backing.len.load(Ordering::Acquire);
    if index < len {
        // SAFETY: slots below the acquired `len` are constructed and never
        // mutated again; the backing array outlives `shared` via the
        // graveyard.
        Some(unsafe { &*backing.slot_ptr(index).cast_const() })
    } else {
        None
    }
}

/// Creates an append-only vector with room for `initial_capacity` elements
/// before the first reallocation.
///
/// Returns the single [`Writer`] and a cloneable [`Reader`].
#[must_use]
pub fn with_capacity<T>(initial_capacity: usize) -> (Writer<T>, Reader<T>) {
    let first = Backing::<T>::with_capacity(initial_capacity);
    let active = Arc::as_ptr(&first).cast_mut();
    let shared = Arc::new(Shared {
        active: AtomicPtr::new(active),
        size: AtomicUsize::new(0),
        graveyard: UnsafeCell::new(vec![first]),
    });
    (
        Writer {
            shared: Arc::clone(&shared),
        },
        Reader { shared },
    )
}

/// Producing handle. Exactly one exists per container; all mutating
/// operations take `&mut self`.
pub struct Writer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Writer<T> {
    #[inline]
    fn active(&self) -> &Backing<T> {
        // Relaxed: the producer is the only thread that ever stores the
        // active pointer.
        unsafe { &*self.shared.active.load(Ordering::Relaxed) }
    }

    /// Clones the first `copy_len` elements into a fresh backing array of
    /// `new_capacity` slots and parks it in the graveyard. The array is
    /// *not* yet published; the caller stores the active pointer once any
    /// extra construction into it is done.
    fn park_fresh(&mut self, new_capacity: usize, copy_len: usize) -> *mut Backing<T>
    where
        T: Clone,
    {
        let fresh = Backing::with_capacity(new_capacity);
        let old = self.active();
        for i in 0..copy_len {
            // SAFETY: slots below `copy_len == size` are constructed in the
            // old array; the fresh array is not yet visible to anyone else.
            unsafe {
                let value = (*old.slot_ptr(i).cast_const()).clone();
                ptr::write(fresh.slot_ptr(i), value);
            }
        }
        // Not yet published; the release store of the active pointer will
        // carry this count.
        fresh.len.store(copy_len, Ordering::Relaxed);

        let raw = Arc::as_ptr(&fresh).cast_mut();
        // SAFETY: the producer is the graveyard's only mutator.
        let graveyard = unsafe { &mut *self.shared.graveyard.get() };
        graveyard.push(fresh);
        raw
    }

    /// Appends `value`.
    ///
    /// Amortized O(1); a capacity doubling clones the current contents so
    /// outstanding readers keep their stable view of the old array.
    pub fn push_back(&mut self, value: T)
    where
        T: Clone,
    {
        self.push_with(|| value);
    }

    /// Constructs an element via `make`, appends it, and returns a
    /// reference to the stored element.
    pub fn push_with<F>(&mut self, make: F) -> &T
    where
        F: FnOnce() -> T,
        T: Clone,
    {
        let size = self.shared.size.load(Ordering::Relaxed);
        if size == self.active().capacity() {
            let fresh = self.park_fresh((size * 2).max(1), size);
            // The new element is constructed before either the pointer or
            // the size becomes visible.
            unsafe {
                ptr::write((*fresh).slot_ptr(size), make());
                (*fresh).len.store(size + 1, Ordering::Relaxed);
            }
            self.shared.active.store(fresh, Ordering::Release);
            self.shared.size.store(size + 1, Ordering::Release);
            unsafe { &*(*fresh).slot_ptr(size).cast_const() }
        } else {
            let backing = self.active();
            // SAFETY: slot `size` is unconstructed and no reader touches
            // slots at or above the published `len`.
            unsafe { ptr::write(backing.slot_ptr(size), make()) };
            backing.len.store(size + 1, Ordering::Release);
            self.shared.size.store(size + 1, Ordering::Release);
            unsafe { &*backing.slot_ptr(size).cast_const() }
        }
    }

    /// Ensures capacity for at least `elements` elements.
    ///
    /// Reallocates (clone + publish) if the current backing array is too
    /// small; the logical size is unchanged.
    pub fn reserve(&mut self, elements: usize)
    where
        T: Clone,
    {
        if elements > self.active().capacity() {
            let size = self.shared.size.load(Ordering::Relaxed);
            let fresh = self.park_fresh(elements, size);
            self.shared.active.store(fresh, Ordering::Release);
        }
    }

    /// Grows the vector to `elements`, default-constructing the new tail.
    ///
    /// Shrinking is not supported; a request below the current size returns
    /// [`ShrinkError`] and leaves the container unchanged.
    pub fn resize(&mut self, elements: usize) -> Result<(), ShrinkError>
    where
        T: Clone + Default,
    {
        let size = self.shared.size.load(Ordering::Relaxed);
        if elements < size {
            return Err(ShrinkError {
                requested: elements,
                current: size,
            });
        }
        self.reserve(elements);
        let backing = self.active();
        for i in size..elements {
            // SAFETY: slots in `size..elements` are unconstructed and
            // invisible to readers until the `len` store below.
            unsafe { ptr::write(backing.slot_ptr(i), T::default()) };
        }
        backing.len.store(elements, Ordering::Release);
        self.shared.size.store(elements, Ordering::Release);
        Ok(())
    }

    /// Discards every superseded backing array, keeping only the active
    /// one.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no reference or iterator obtained
    /// before the last reallocation is still alive: those point into the
    /// arrays this call frees.
    pub unsafe fn drop_old(&mut self) {
        // SAFETY: the producer is the graveyard's only mutator.
        let graveyard = unsafe { &mut *self.shared.graveyard.get() };
        let active = graveyard.pop().expect("graveyard always holds the active array");
        graveyard.clear();
        graveyard.push(active);
    }

    /// Published element count.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Capacity of the active backing array.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.active().capacity()
    }

    /// Reference to element `index`, or `None` past the published prefix.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        read_at(&self.shared, index)
    }

    /// Forward iterator over the published prefix.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            shared: &self.shared,
            index: 0,
        }
    }
}

impl<T> std::ops::Index<usize> for Writer<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        self.get(index).expect("index past published size")
    }
}

impl<T> fmt::Debug for Writer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("append_vec::Writer")
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Reading handle. Cloneable; every clone observes the same published
/// prefix.
pub struct Reader<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Reader<T> {
    /// Published element count at some instant no later than the call.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Reference to element `index`, or `None` past the published prefix.
    ///
    /// Once this returns `Some` for an index, it returns an equal element
    /// forever (reallocation copies, never mutates).
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        read_at(&self.shared, index)
    }

    /// Forward iterator over the published prefix. Stable across
    /// reallocation: every step performs a fresh indexed read.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            shared: &self.shared,
            index: 0,
        }
    }
}

impl<T> Clone for Reader<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::ops::Index<usize> for Reader<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        self.get(index).expect("index past published size")
    }
}

impl<'a, T> IntoIterator for &'a Reader<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

impl<T> fmt::Debug for Reader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("append_vec::Reader")
            .field("size", &self.size())
            .finish()
    }
}

/// Index-carrying forward iterator over an append-only vector.
///
/// Dereferencing performs an indexed read against the currently published
/// backing array, so the iterator survives any number of reallocations.
pub struct Iter<'a, T> {
    shared: &'a Shared<T>,
    index: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let value = read_at(self.shared, self.index)?;
        self.index += 1;
        Some(value)
    }
}
