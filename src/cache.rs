//! Cache-layout primitives shared by all ring containers.
//!
//! The containers in this crate keep their hot counters on dedicated cache
//! lines (via [`CachePadded`]) and stripe their element storage so that
//! *consecutive* logical indices land on *different* cache lines. Two
//! producers that reserve neighboring slots therefore write to different
//! lines and never false-share, as long as the buffer spans at least two
//! lines.
//!
//! # Index mapping
//!
//! A buffer with `L` lines of `E` elements each exposes a flat index space
//! `[0, L * E)`. A flat index `i` maps to line `i mod L`, slot
//! `(i div L) mod E` within that line. Callers may pass *any* monotonically
//! increasing 64-bit index; the buffer reduces it internally, so ring
//! positions never need an explicit modulo at the call site.
//!
//! # Sizing policies
//!
//! * [`Exact`] packs as many elements per line as physically fit and keeps
//!   the requested line count as-is. Index mapping costs one `%` and one `/`.
//! * [`Pow2`] rounds the elements-per-line *down* and the line count *up* to
//!   powers of two, so both mapping operations become a mask and a shift.
//!   The flat size is then itself a power of two.

use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

pub use crossbeam_utils::CachePadded;

/// Conventional x86-64 cache line size in bytes.
pub const CACHE_LINE_SIZE: usize = 64;

mod sealed {
    pub trait Sealed {}

    impl Sealed for super::Exact {}
    impl Sealed for super::Pow2 {}
}

/// Element-packing policy for [`PackedBuffer`].
///
/// Implemented only by [`Exact`] and [`Pow2`]; the trait is sealed. The
/// methods are the raw geometry/mapping rules and are not meant to be called
/// outside this crate.
pub trait SizePolicy: sealed::Sealed + 'static {
    /// Number of elements stored per cache line for elements of `elem_size`
    /// bytes.
    fn elements_per_line(elem_size: usize) -> usize;

    /// Rounds a requested line count up to the policy's allocation grain.
    fn round_line_count(min_lines: usize) -> usize;

    /// Line holding flat index `index`.
    fn line_of(index: u64, line_count: usize) -> usize;

    /// Slot within the line for flat index `index`.
    fn slot_of(index: u64, line_count: usize, elems_per_line: usize) -> usize;
}

/// Pack elements exactly; index with `%` and `/`.
pub struct Exact;

/// Round to powers of two; index with masks and shifts.
pub struct Pow2;

/// Greatest power of two less than or equal to `value` (which must be > 0).
fn prev_power_of_two(value: usize) -> usize {
    debug_assert!(value > 0);
    1 << (usize::BITS - 1 - value.leading_zeros())
}

fn exact_elements_per_line(elem_size: usize) -> usize {
    if elem_size == 0 {
        // Zero-sized elements: any count works; one line's worth keeps the
        // geometry arithmetic uniform.
        CACHE_LINE_SIZE
    } else if elem_size > CACHE_LINE_SIZE {
        1
    } else {
        CACHE_LINE_SIZE / elem_size
    }
}

impl SizePolicy for Exact {
    #[inline]
    fn elements_per_line(elem_size: usize) -> usize {
        exact_elements_per_line(elem_size)
    }

    #[inline]
    fn round_line_count(min_lines: usize) -> usize {
        min_lines
    }

    #[inline]
    fn line_of(index: u64, line_count: usize) -> usize {
        (index % line_count as u64) as usize
    }

    #[inline]
    fn slot_of(index: u64, line_count: usize, elems_per_line: usize) -> usize {
        ((index / line_count as u64) % elems_per_line as u64) as usize
    }
}

impl SizePolicy for Pow2 {
    #[inline]
    fn elements_per_line(elem_size: usize) -> usize {
        prev_power_of_two(exact_elements_per_line(elem_size))
    }

    #[inline]
    fn round_line_count(min_lines: usize) -> usize {
        min_lines.next_power_of_two()
    }

    #[inline]
    fn line_of(index: u64, line_count: usize) -> usize {
        (index & (line_count as u64 - 1)) as usize
    }

    #[inline]
    fn slot_of(index: u64, line_count: usize, elems_per_line: usize) -> usize {
        ((index >> line_count.trailing_zeros()) & (elems_per_line as u64 - 1)) as usize
    }
}

/// Contiguous element storage striped across cache lines.
///
/// All slots are default-constructed at creation and overwritten in place
/// afterwards, so every slot always holds a live `T`. Access is not
/// bounds-checked: any 64-bit index is reduced modulo the flat size.
///
/// # Safety contract
///
/// [`get`](Self::get) and [`get_mut`](Self::get_mut) are `unsafe` because
/// the buffer itself enforces no aliasing discipline. The containers built
/// on top guarantee, via their index protocols, that a slot handed out
/// mutably has no concurrent reader or writer.
pub struct PackedBuffer<T, P: SizePolicy = Pow2> {
    ptr: NonNull<u8>,
    layout: Layout,
    line_count: usize,
    elems_per_line: usize,
    line_stride: usize,
    flat_len: usize,
    _policy: PhantomData<P>,
    _owns: PhantomData<T>,
}

impl<T: Default, P: SizePolicy> PackedBuffer<T, P> {
    /// Allocates a buffer with at least `min_lines` cache lines *or* enough
    /// lines to hold `min_elements` elements, whichever is larger.
    ///
    /// Every slot is initialized with `T::default()`.
    ///
    /// # Panics
    ///
    /// Panics if the resulting allocation size overflows, and aborts via the
    /// global allocation error handler if the allocation itself fails.
    #[must_use]
    pub fn new(min_lines: usize, min_elements: usize) -> Self {
        let elem_size = mem::size_of::<T>();
        let elems_per_line = P::elements_per_line(elem_size);
        let lines_for_elements = min_elements.div_ceil(elems_per_line);
        let line_count = P::round_line_count(min_lines.max(lines_for_elements).max(1));
        let flat_len = line_count * elems_per_line;

        // Each line starts on its own cache-line boundary. Elements with
        // alignment above the line size widen the grain instead.
        let line_align = CACHE_LINE_SIZE.max(mem::align_of::<T>());
        let line_stride = (elem_size * elems_per_line)
            .next_multiple_of(line_align)
            .max(line_align);
        let layout = Layout::from_size_align(line_count * line_stride, line_align)
            .expect("buffer layout overflow");

        let raw = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };

        // Default-construct every slot. If a constructor panics the raw
        // allocation leaks, which keeps the partially initialized region
        // from ever being treated as live elements.
        for line in 0..line_count {
            let line_ptr = unsafe { ptr.as_ptr().add(line * line_stride).cast::<T>() };
            for slot in 0..elems_per_line {
                unsafe { ptr::write(line_ptr.add(slot), T::default()) };
            }
        }

        Self {
            ptr,
            layout,
            line_count,
            elems_per_line,
            line_stride,
            flat_len,
            _policy: PhantomData,
            _owns: PhantomData,
        }
    }
}

impl<T, P: SizePolicy> PackedBuffer<T, P> {
    #[inline]
    fn slot_ptr(&self, index: u64) -> *mut T {
        let line = P::line_of(index, self.line_count);
        let slot = P::slot_of(index, self.line_count, self.elems_per_line);
        unsafe {
            self.ptr
                .as_ptr()
                .add(line * self.line_stride)
                .cast::<T>()
                .add(slot)
        }
    }

    /// Returns a reference to the slot for `index` (reduced modulo the flat
    /// size).
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no thread writes this slot for the
    /// lifetime of the returned reference.
    #[inline]
    pub unsafe fn get(&self, index: u64) -> &T {
        unsafe { &*self.slot_ptr(index) }
    }

    /// Returns a mutable reference to the slot for `index` (reduced modulo
    /// the flat size).
    ///
    /// # Safety
    ///
    /// The caller must guarantee exclusive access to this slot for the
    /// lifetime of the returned reference.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, index: u64) -> &mut T {
        unsafe { &mut *self.slot_ptr(index) }
    }

    /// Flat size `N = lines * elements_per_line`.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.flat_len
    }

    /// Number of cache lines backing the buffer.
    #[inline]
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.line_count
    }

    /// Elements stored per cache line.
    #[inline]
    #[must_use]
    pub fn elements_per_line(&self) -> usize {
        self.elems_per_line
    }
}

// SAFETY: The buffer owns its storage; moving it between threads moves the
// contained `T`s. Shared access is mediated entirely by the callers of the
// unsafe accessors, which promise slot-level exclusivity.
unsafe impl<T: Send, P: SizePolicy> Send for PackedBuffer<T, P> {}
unsafe impl<T: Send, P: SizePolicy> Sync for PackedBuffer<T, P> {}

impl<T, P: SizePolicy> Drop for PackedBuffer<T, P> {
    fn drop(&mut self) {
        if mem::needs_drop::<T>() {
            for line in 0..self.line_count {
                let line_ptr = unsafe { self.ptr.as_ptr().add(line * self.line_stride).cast::<T>() };
                for slot in 0..self.elems_per_line {
                    // SAFETY: every slot holds a live `T` at all times.
                    unsafe { ptr::drop_in_place(line_ptr.add(slot)) };
                }
            }
        }
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl<T, P: SizePolicy> fmt::Debug for PackedBuffer<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackedBuffer")
            .field("line_count", &self.line_count)
            .field("elements_per_line", &self.elems_per_line)
            .field("len", &self.flat_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow2_rounds_lines_up_and_elements_down() {
        // u64: 8 exact elements per line, already a power of two.
        let buf = PackedBuffer::<u64, Pow2>::new(3, 0);
        assert_eq!(buf.line_count(), 4);
        assert_eq!(buf.elements_per_line(), 8);
        assert_eq!(buf.len(), 32);
        assert!(buf.len().is_power_of_two());
    }

    #[test]
    fn exact_keeps_requested_line_count() {
        let buf = PackedBuffer::<u64, Exact>::new(3, 0);
        assert_eq!(buf.line_count(), 3);
        assert_eq!(buf.len(), 24);
    }

    #[test]
    fn minimum_elements_dominates_line_request() {
        let buf = PackedBuffer::<u64, Pow2>::new(1, 100);
        // ceil(100 / 8) = 13 lines, rounded up to 16.
        assert_eq!(buf.line_count(), 16);
        assert_eq!(buf.len(), 128);
        assert!(buf.len() >= 100);
    }

    #[test]
    fn pow2_flat_size_is_power_of_two_when_elements_dominate() {
        let buf = PackedBuffer::<u32, Pow2>::new(1, 1000);
        assert!(buf.len() >= 1000);
        assert!(buf.len().is_power_of_two());
        assert!(buf.line_count().is_power_of_two());
    }

    #[test]
    fn odd_sized_elements_pack_exactly() {
        // 12-byte element: 5 per line exact, 4 per line under pow2.
        #[derive(Default)]
        struct Odd([u32; 3]);

        let exact = PackedBuffer::<Odd, Exact>::new(2, 0);
        assert_eq!(exact.elements_per_line(), 5);
        assert_eq!(exact.len(), 10);

        let pow2 = PackedBuffer::<Odd, Pow2>::new(2, 0);
        assert_eq!(pow2.elements_per_line(), 4);
        assert_eq!(pow2.len(), 8);
    }

    #[test]
    fn oversized_elements_get_one_per_line() {
        #[derive(Default)]
        struct Big([u64; 12]);

        let buf = PackedBuffer::<Big, Exact>::new(4, 0);
        assert_eq!(buf.elements_per_line(), 1);
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn mapping_is_a_bijection_on_the_flat_range() {
        let buf = PackedBuffer::<u64, Exact>::new(3, 0);
        for i in 0..buf.len() as u64 {
            unsafe { *buf.get_mut(i) = i };
        }
        for i in 0..buf.len() as u64 {
            assert_eq!(unsafe { *buf.get(i) }, i, "slot {i} was clobbered");
        }
    }

    #[test]
    fn consecutive_indices_land_on_different_lines() {
        let buf = PackedBuffer::<u64, Pow2>::new(4, 0);
        for i in 0..buf.len() as u64 - 1 {
            let a = unsafe { buf.get(i) } as *const u64 as usize;
            let b = unsafe { buf.get(i + 1) } as *const u64 as usize;
            assert_ne!(
                a / CACHE_LINE_SIZE,
                b / CACHE_LINE_SIZE,
                "indices {i} and {} share a cache line",
                i + 1
            );
        }
    }

    #[test]
    fn indices_reduce_modulo_flat_size() {
        let buf = PackedBuffer::<u64, Pow2>::new(2, 0);
        let n = buf.len() as u64;
        for i in 0..n {
            let base = unsafe { buf.get(i) } as *const u64;
            let wrapped = unsafe { buf.get(i + 3 * n) } as *const u64;
            assert_eq!(base, wrapped);
        }
    }

    #[test]
    fn lines_start_on_cache_line_boundaries() {
        let buf = PackedBuffer::<u64, Exact>::new(4, 0);
        for i in 0..buf.len() as u64 {
            let addr = unsafe { buf.get(i) } as *const u64 as usize;
            if Exact::slot_of(i, buf.line_count(), buf.elements_per_line()) == 0 {
                assert_eq!(addr % CACHE_LINE_SIZE, 0, "line for index {i} is unaligned");
            }
        }
    }

    #[test]
    fn drops_every_slot_exactly_once() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Default)]
        struct Tracked(Option<Arc<AtomicUsize>>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                if let Some(count) = &self.0 {
                    count.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let len;
        {
            let buf = PackedBuffer::<Tracked, Pow2>::new(1, 0);
            len = buf.len();
            for i in 0..len as u64 {
                unsafe { *buf.get_mut(i) = Tracked(Some(drops.clone())) };
            }
        }
        assert_eq!(drops.load(Ordering::Relaxed), len);
    }
}
