//! Arena allocator for `OxideC` runtime metadata.
//!
//! The runtime never frees its metadata: a class record, once loaded, is
//! referenced from object isa words, method caches and subclass lists for the
//! rest of the process. A bump arena fits that lifetime exactly and gives
//! every record a stable address.
//!
//! # Architecture
//!
//! - [`GlobalArena`]: thread-safe arena built from a growing list of chunks
//! - `Chunk`: one contiguous region with an atomic bump pointer
//!
//! Allocation is a CAS on the current chunk's bump pointer. When a chunk is
//! exhausted a new one (twice the configured size, capped at 1 MiB, or larger
//! for oversized requests) is pushed under a mutex and becomes current.
//!
//! Values placed in the arena are never dropped. Their memory is returned to
//! the system allocator when the arena itself is dropped, which for the
//! runtime means never.
//!
//! # Examples
//!
//! ```
//! use oxidex_mem::GlobalArena;
//!
//! let arena = GlobalArena::new(65536);
//!
//! let value = arena.alloc(42u32);
//! let name = arena.alloc_str("initWithFrame:");
//!
//! assert_eq!(*value, 42);
//! assert_eq!(name, "initWithFrame:");
//! ```

use parking_lot::Mutex;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Alignment of every chunk's base address.
const CHUNK_ALIGNMENT: usize = 16;

/// Minimum chunk size (8 KiB).
const MIN_CHUNK_SIZE: usize = 8192;

/// Maximum size of a chunk created by normal growth (1 MiB).
const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Arena allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Total number of bytes handed out across all chunks.
    pub total_allocated: usize,
    /// Number of chunks in the arena.
    pub chunk_count: usize,
    /// Total capacity of all chunks in bytes.
    pub total_capacity: usize,
}

/// A fixed-size memory region with an atomic bump pointer.
struct Chunk {
    start: NonNull<u8>,
    /// Current bump pointer. Kept as a pointer (not an address) so that every
    /// returned allocation carries the provenance of `start`.
    ptr: AtomicPtr<u8>,
    end: usize,
    capacity: usize,
}

impl Chunk {
    /// Allocates a new chunk from the system allocator.
    ///
    /// Aborts through `handle_alloc_error` if the system is out of memory;
    /// the runtime has no recovery path for losing its metadata arena.
    fn new(size: usize) -> NonNull<Chunk> {
        let size = size.max(MIN_CHUNK_SIZE);
        let Ok(layout) = Layout::from_size_align(size, CHUNK_ALIGNMENT) else {
            panic!("arena chunk size {size} overflows a layout");
        };

        // SAFETY: layout has a non-zero size (at least MIN_CHUNK_SIZE).
        let raw = unsafe { alloc::alloc(layout) };
        let Some(start) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };

        let chunk = Box::new(Chunk {
            start,
            ptr: AtomicPtr::new(start.as_ptr()),
            end: start.as_ptr().addr() + size,
            capacity: size,
        });

        NonNull::from(Box::leak(chunk))
    }

    /// Bumps the pointer by `size` bytes at `align`, or returns `None` if the
    /// chunk cannot fit the request.
    #[inline]
    fn try_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let mut current = self.ptr.load(Ordering::Acquire);

        loop {
            let aligned = current.addr().checked_add(align - 1)? & !(align - 1);
            let new_addr = aligned.checked_add(size)?;
            if new_addr > self.end {
                return None;
            }

            match self.ptr.compare_exchange_weak(
                current,
                current.with_addr(new_addr),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                // The range [aligned, new_addr) now belongs to this caller.
                Ok(_) => return NonNull::new(current.with_addr(aligned)),
                Err(observed) => current = observed,
            }
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: start was allocated in Chunk::new with exactly this layout.
        unsafe {
            let layout =
                Layout::from_size_align_unchecked(self.capacity, CHUNK_ALIGNMENT);
            alloc::dealloc(self.start.as_ptr(), layout);
        }
    }
}

/// Thread-safe arena for process-lifetime runtime metadata.
///
/// References returned by [`alloc`](Self::alloc) and
/// [`alloc_str`](Self::alloc_str) are valid for as long as the arena is; a
/// runtime that leaks its arena therefore gets `'static` records.
///
/// # Thread Safety
///
/// Any number of threads may allocate concurrently. Chunk growth is
/// serialized by an internal mutex; the common path is a single CAS.
pub struct GlobalArena {
    chunks: Mutex<Vec<NonNull<Chunk>>>,
    current: AtomicPtr<Chunk>,
    chunk_size: usize,
    total_allocated: AtomicUsize,
}

// SAFETY: chunks are only mutated under the mutex, the current chunk is
// published through an atomic pointer, and chunk memory is only handed out
// through the atomic bump pointer. Stored values are required to be Sync.
unsafe impl Send for GlobalArena {}
unsafe impl Sync for GlobalArena {}

impl GlobalArena {
    /// Creates an arena whose chunks are `chunk_size` bytes (at least 8 KiB,
    /// rounded up to a power of two).
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(MIN_CHUNK_SIZE).next_power_of_two();
        let first = Chunk::new(chunk_size);

        GlobalArena {
            chunks: Mutex::new(vec![first]),
            current: AtomicPtr::new(first.as_ptr()),
            chunk_size,
            total_allocated: AtomicUsize::new(0),
        }
    }

    /// Moves `value` into the arena and returns a shared reference to it.
    ///
    /// The value's destructor never runs. Mutable state inside `T` must use
    /// interior mutability, which is why `T: Sync` is required.
    pub fn alloc<T: Sync>(&self, value: T) -> &T {
        let ptr = self.alloc_raw(Layout::new::<T>()).cast::<T>();

        // SAFETY: ptr is freshly reserved, correctly sized and aligned for T,
        // and nothing else can observe it before this write.
        unsafe {
            ptr.as_ptr().write(value);
            &*ptr.as_ptr()
        }
    }

    /// Copies `s` into the arena.
    pub fn alloc_str(&self, s: &str) -> &str {
        if s.is_empty() {
            return "";
        }

        let ptr = self.alloc_raw(Layout::for_value(s.as_bytes()));

        // SAFETY: the reserved region is s.len() bytes and does not overlap s;
        // the copied bytes are valid UTF-8 because they come from a str.
        unsafe {
            std::ptr::copy_nonoverlapping(s.as_ptr(), ptr.as_ptr(), s.len());
            let bytes = std::slice::from_raw_parts(ptr.as_ptr(), s.len());
            std::str::from_utf8_unchecked(bytes)
        }
    }

    /// Returns allocation statistics for this arena.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let chunks = self.chunks.lock();
        let total_capacity = chunks
            .iter()
            // SAFETY: every pointer in the list is a live chunk owned by self.
            .map(|chunk| unsafe { chunk.as_ref().capacity })
            .sum();

        ArenaStats {
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            chunk_count: chunks.len(),
            total_capacity,
        }
    }

    fn alloc_raw(&self, layout: Layout) -> NonNull<u8> {
        loop {
            let current = self.current.load(Ordering::Acquire);

            // SAFETY: current always points at a chunk in self.chunks, and
            // chunks are only freed when the arena is dropped.
            let chunk = unsafe { &*current };
            if let Some(ptr) = chunk.try_alloc(layout.size(), layout.align()) {
                self.total_allocated
                    .fetch_add(layout.size(), Ordering::Relaxed);
                return ptr;
            }

            self.grow(current, layout);
        }
    }

    #[cold]
    fn grow(&self, exhausted: *mut Chunk, layout: Layout) {
        let mut chunks = self.chunks.lock();

        // Another thread already replaced the exhausted chunk.
        if self.current.load(Ordering::Acquire) != exhausted {
            return;
        }

        let size = (self.chunk_size * 2)
            .min(MAX_CHUNK_SIZE)
            .max(layout.size() + layout.align())
            .next_power_of_two();
        let chunk = Chunk::new(size);
        chunks.push(chunk);
        self.current.store(chunk.as_ptr(), Ordering::Release);
    }
}

impl Drop for GlobalArena {
    fn drop(&mut self) {
        for chunk in self.chunks.get_mut().drain(..) {
            // SAFETY: each chunk was leaked from a Box in Chunk::new and is
            // owned solely by this arena.
            drop(unsafe { Box::from_raw(chunk.as_ptr()) });
        }
    }
}

impl std::fmt::Debug for GlobalArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalArena")
            .field("chunk_size", &self.chunk_size)
            .field("stats", &self.stats())
            .finish()
    }
}
