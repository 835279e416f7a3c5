//! # Allocator Interface
//!
//! The leaf of the runtime. Every handle obtains its storage from an
//! [`Allocator`] and returns it to the same allocator. The contract is
//! deliberately small:
//!
//! - `allocate(layout, destructor)` returns storage for `layout`, or an
//!   [`AllocError`]. A `Some(destructor)` asks for *collected* storage: the
//!   allocator must run the destructor when it is itself torn down, in
//!   reverse order of allocation.
//! - `deallocate(ptr, layout)` frees storage handed out by `allocate`.
//! - `retire(ptr, layout)` hands storage back without freeing it; the
//!   allocator may reclaim it in bulk later, or never.
//!
//! Allocators are shared by reference (`&'a dyn Allocator`), and every handle
//! carries that borrow, so an allocator always outlives the storage it
//! handed out.
//!
//! Two implementations ship with the runtime: [`SystemAllocator`] (the global
//! heap, see [`system()`]) and [`crate::arena::Arena`].

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::panic::{self, Fault};

/// Type-erased in-place destructor.
pub type DropFn = unsafe fn(*mut u8);

/// Drop the `T` stored at `ptr`.
///
/// # Safety
/// `ptr` must point to a live, properly aligned `T` that is not used again.
pub unsafe fn drop_erased<T>(ptr: *mut u8) {
    std::ptr::drop_in_place(ptr.cast::<T>());
}

/// A destructor for a value stored at a fixed offset inside an allocation.
#[derive(Clone, Copy)]
pub struct Destructor {
    drop_fn: DropFn,
    offset: usize,
}

impl Destructor {
    /// Destructor for a `T` stored `offset` bytes into an allocation.
    pub fn of<T>(offset: usize) -> Self {
        Self {
            drop_fn: drop_erased::<T>,
            offset,
        }
    }

    /// Byte offset of the value within the allocation.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Run the destructor against the allocation starting at `base`.
    ///
    /// # Safety
    /// `base` must be the allocation this destructor was registered with,
    /// the value must be initialized, and this must run at most once.
    pub unsafe fn run(&self, base: NonNull<u8>) {
        (self.drop_fn)(base.as_ptr().add(self.offset));
    }
}

impl fmt::Debug for Destructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destructor")
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

/// Allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The allocator has no memory left for the request.
    OutOfMemory {
        /// Requested size in bytes.
        size: usize,
        /// Requested alignment in bytes.
        align: usize,
    },
    /// Collected storage was requested from an allocator that cannot run
    /// deferred destructors.
    CollectUnsupported,
    /// The combined control block and value layout overflows `isize`.
    InvalidLayout,
}

impl AllocError {
    pub(crate) fn out_of_memory(layout: Layout) -> Self {
        AllocError::OutOfMemory {
            size: layout.size(),
            align: layout.align(),
        }
    }

    /// Convert into the fault reported for this failure.
    pub fn into_fault(self, allocator: &str) -> Fault {
        match self {
            AllocError::OutOfMemory { size, align } => Fault::OutOfMemory {
                size,
                align,
                allocator: allocator.to_string(),
            },
            AllocError::CollectUnsupported => Fault::CollectUnsupported {
                allocator: allocator.to_string(),
            },
            AllocError::InvalidLayout => Fault::OutOfMemory {
                size: usize::MAX,
                align: 1,
                allocator: allocator.to_string(),
            },
        }
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory { size, align } => {
                write!(f, "out of memory allocating {} bytes (align {})", size, align)
            }
            AllocError::CollectUnsupported => {
                write!(f, "allocator does not support collected storage")
            }
            AllocError::InvalidLayout => write!(f, "allocation layout overflows"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Point-in-time copy of an allocator's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocSnapshot {
    /// Successful `allocate` calls.
    pub allocations: u64,
    /// `deallocate` calls.
    pub deallocations: u64,
    /// `retire` calls.
    pub retirements: u64,
    /// Allocations registered with a destructor.
    pub collected: u64,
    /// Live allocations written off by a teardown.
    pub abandoned: u64,
    /// Bytes handed out by `allocate`.
    pub bytes_allocated: u64,
    /// Bulk releases performed by teardown.
    pub bulk_releases: u64,
}

impl AllocSnapshot {
    /// Allocations handed out one by one that have not been deallocated or
    /// retired yet.
    pub fn live(&self) -> u64 {
        self.allocations
            .saturating_sub(self.deallocations)
            .saturating_sub(self.retirements)
            .saturating_sub(self.collected)
            .saturating_sub(self.abandoned)
    }
}

/// Lock-free allocator counters.
#[derive(Debug, Default)]
pub struct AllocStats {
    allocations: AtomicU64,
    deallocations: AtomicU64,
    retirements: AtomicU64,
    collected: AtomicU64,
    abandoned: AtomicU64,
    bytes_allocated: AtomicU64,
    bulk_releases: AtomicU64,
}

impl AllocStats {
    /// Zeroed counters.
    pub const fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            retirements: AtomicU64::new(0),
            collected: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            bulk_releases: AtomicU64::new(0),
        }
    }

    /// Record a successful allocation.
    pub fn record_alloc(&self, layout: Layout, collected: bool) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated
            .fetch_add(layout.size() as u64, Ordering::Relaxed);
        if collected {
            self.collected.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a deallocation.
    pub fn record_dealloc(&self) {
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retirement.
    pub fn record_retire(&self) {
        self.retirements.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a bulk release that wrote off `abandoned` live allocations.
    pub fn record_bulk_release(&self, abandoned: u64) {
        self.bulk_releases.fetch_add(1, Ordering::Relaxed);
        self.abandoned.fetch_add(abandoned, Ordering::Relaxed);
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> AllocSnapshot {
        AllocSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
            retirements: self.retirements.load(Ordering::Relaxed),
            collected: self.collected.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            bulk_releases: self.bulk_releases.load(Ordering::Relaxed),
        }
    }
}

/// A pluggable memory provider.
///
/// # Safety
///
/// Implementations must return storage that is valid for `layout.size()`
/// bytes, aligned to `layout.align()`, and not handed out again until it has
/// been deallocated (or, for retired and collected storage, until the
/// allocator has been torn down). A collecting implementation must run every
/// registered destructor exactly once, in reverse registration order, before
/// releasing the storage.
pub unsafe trait Allocator: Send + Sync {
    /// Human-readable name used in diagnostics.
    fn name(&self) -> &str;

    /// Allocate storage for `layout`. With `Some(destructor)`, the storage is
    /// collected: the allocator runs the destructor at teardown.
    fn allocate(
        &self,
        layout: Layout,
        destructor: Option<Destructor>,
    ) -> Result<NonNull<u8>, AllocError>;

    /// Free storage previously returned by `allocate` without a destructor.
    ///
    /// # Safety
    /// `ptr` and `layout` must come from a matching `allocate` call on this
    /// allocator, and the storage must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);

    /// Give storage back without freeing it individually.
    ///
    /// # Safety
    /// Same as [`Allocator::deallocate`].
    unsafe fn retire(&self, ptr: NonNull<u8>, layout: Layout);

    /// Current counters.
    fn stats(&self) -> AllocSnapshot;
}

/// Allocate through `allocator`, raising a fatal fault on failure.
#[track_caller]
pub(crate) fn allocate_or_fault(
    allocator: &dyn Allocator,
    layout: Layout,
    destructor: Option<Destructor>,
) -> NonNull<u8> {
    match allocator.allocate(layout, destructor) {
        Ok(ptr) => ptr,
        Err(err) => panic::fatal(err.into_fault(allocator.name())),
    }
}

/// A well-aligned, non-null pointer for zero-sized requests.
pub(crate) fn dangling(align: usize) -> NonNull<u8> {
    // Alignments are non-zero powers of two, so the address is never null.
    NonNull::new(align as *mut u8).unwrap_or(NonNull::dangling())
}

/// The process heap.
///
/// Thread-safe and never torn down, so it refuses collected storage and
/// leaks retired storage.
#[derive(Debug, Default)]
pub struct SystemAllocator {
    stats: AllocStats,
}

impl SystemAllocator {
    /// A new heap front end with its own counters.
    pub const fn new() -> Self {
        Self {
            stats: AllocStats::new(),
        }
    }
}

unsafe impl Allocator for SystemAllocator {
    fn name(&self) -> &str {
        "system"
    }

    fn allocate(
        &self,
        layout: Layout,
        destructor: Option<Destructor>,
    ) -> Result<NonNull<u8>, AllocError> {
        if destructor.is_some() {
            return Err(AllocError::CollectUnsupported);
        }

        let ptr = if layout.size() == 0 {
            dangling(layout.align())
        } else {
            // SAFETY: the layout has a non-zero size.
            NonNull::new(unsafe { alloc::alloc(layout) })
                .ok_or_else(|| AllocError::out_of_memory(layout))?
        };

        self.stats.record_alloc(layout, false);
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            alloc::dealloc(ptr.as_ptr(), layout);
        }
        self.stats.record_dealloc();
    }

    unsafe fn retire(&self, _ptr: NonNull<u8>, _layout: Layout) {
        self.stats.record_retire();
    }

    fn stats(&self) -> AllocSnapshot {
        self.stats.snapshot()
    }
}

static SYSTEM: SystemAllocator = SystemAllocator::new();

/// The process-wide system allocator.
pub fn system() -> &'static SystemAllocator {
    &SYSTEM
}
