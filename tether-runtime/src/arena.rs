//! # Arena Allocator
//!
//! A chunked bump allocator that is torn down as a unit.
//!
//! Individually owned storage (`Own`, `Unique`, shared handles) is handed out
//! from the current chunk and counted; freeing it only updates the counters.
//! Retired storage (`Discard`) and collected storage (`Collect`) stay in
//! place until teardown.
//!
//! Teardown happens on [`Arena::teardown`], [`Arena::reset`] or drop:
//!
//! 1. Destructors registered by collected allocations run in reverse order
//!    of allocation.
//! 2. Every chunk is returned to the system heap in one bulk release.
//! 3. If individually owned allocations are still live (a handle was
//!    forgotten), the arena's [`LeakPolicy`] decides whether a
//!    `not-all-pointers-deallocated` fault is raised, logged or ignored.
//!
//! Handles borrow the arena, so the compiler already rejects tearing down an
//! arena that a handle still refers to; the leak check only fires for
//! handles leaked with `mem::forget`.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::alloc::{dangling, AllocError, AllocSnapshot, AllocStats, Allocator, Destructor};
use crate::config::{ArenaConfig, LeakPolicy};
use crate::log::{LogBuilder, LogLevel};
use crate::panic::{self, Fault, Severity};

/// Alignment of every chunk obtained from the heap.
const CHUNK_ALIGN: usize = 16;

/// Arena identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaId(pub u64);

impl ArenaId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

fn next_arena_id() -> ArenaId {
    ArenaId(NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed))
}

/// Outcome of a teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TeardownReport {
    /// Collected values whose destructors ran.
    pub destroyed: usize,
    /// Chunks returned to the heap.
    pub chunks_released: usize,
    /// Bytes returned to the heap.
    pub bytes_released: usize,
    /// Individually owned allocations that were still live.
    pub leaked: u64,
}

impl TeardownReport {
    /// Whether the teardown released anything at all.
    pub fn is_empty(&self) -> bool {
        self.destroyed == 0 && self.chunks_released == 0 && self.leaked == 0
    }
}

struct Chunk {
    base: NonNull<u8>,
    layout: Layout,
}

/// The bump cursor into the chunk currently being filled.
#[derive(Clone, Copy)]
struct Cursor {
    base: NonNull<u8>,
    size: usize,
    used: usize,
}

impl Cursor {
    /// Carve `layout` out of the chunk, if it fits.
    fn bump(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let addr = self.base.as_ptr() as usize + self.used;
        let aligned = addr.checked_add(layout.align() - 1)? & !(layout.align() - 1);
        let offset = self.used + (aligned - addr);
        let end = offset.checked_add(layout.size())?;
        if end > self.size {
            return None;
        }
        self.used = end;
        // SAFETY: offset + size stays within the chunk.
        Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }
}

#[derive(Default)]
struct ArenaState {
    chunks: Vec<Chunk>,
    cursor: Option<Cursor>,
    reserved: usize,
    used: usize,
    collected: Vec<(NonNull<u8>, Destructor)>,
}

// SAFETY: the raw pointers refer to chunks exclusively owned by the arena.
// Collected destructors only exist for `Send` values.
unsafe impl Send for ArenaState {}

impl ArenaState {
    fn allocate(&mut self, layout: Layout, config: &ArenaConfig) -> Result<NonNull<u8>, AllocError> {
        if let Some(ptr) = self.cursor.as_mut().and_then(|c| c.bump(layout)) {
            self.used += layout.size();
            return Ok(ptr);
        }

        // Requests that would not leave room for others get a dedicated chunk.
        let oversized = layout.size() > config.chunk_size / 2;
        let chunk_layout = if oversized {
            Layout::from_size_align(layout.size(), layout.align().max(CHUNK_ALIGN))
        } else {
            Layout::from_size_align(config.chunk_size, layout.align().max(CHUNK_ALIGN))
        }
        .map_err(|_| AllocError::InvalidLayout)?;

        if config.max_size != 0 && self.reserved + chunk_layout.size() > config.max_size {
            return Err(AllocError::out_of_memory(layout));
        }

        // SAFETY: chunk layouts are never zero-sized.
        let base = NonNull::new(unsafe { alloc::alloc(chunk_layout) })
            .ok_or_else(|| AllocError::out_of_memory(layout))?;
        self.chunks.push(Chunk {
            base,
            layout: chunk_layout,
        });
        self.reserved += chunk_layout.size();
        self.used += layout.size();

        if oversized {
            return Ok(base);
        }

        let mut cursor = Cursor {
            base,
            size: chunk_layout.size(),
            used: 0,
        };
        let ptr = cursor
            .bump(layout)
            .ok_or_else(|| AllocError::out_of_memory(layout))?;
        self.cursor = Some(cursor);
        Ok(ptr)
    }
}

/// A chunked bump allocator torn down as a unit.
pub struct Arena {
    id: ArenaId,
    name: String,
    config: ArenaConfig,
    state: Mutex<ArenaState>,
    stats: AllocStats,
}

impl Arena {
    /// Create an arena configured from the runtime configuration.
    pub fn new() -> Self {
        let id = next_arena_id();
        Self::build(id, format!("arena-{}", id.0), crate::runtime_config().arena)
    }

    /// Create a named arena configured from the runtime configuration.
    pub fn named(name: impl Into<String>) -> Self {
        Self::with_config(name, crate::runtime_config().arena)
    }

    /// Create a named arena with an explicit configuration.
    pub fn with_config(name: impl Into<String>, config: ArenaConfig) -> Self {
        Self::build(next_arena_id(), name.into(), config)
    }

    fn build(id: ArenaId, name: String, config: ArenaConfig) -> Self {
        Self {
            id,
            name,
            config,
            state: Mutex::new(ArenaState::default()),
            stats: AllocStats::new(),
        }
    }

    /// Get the arena ID.
    pub fn id(&self) -> ArenaId {
        self.id
    }

    /// Get the arena configuration.
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Bytes handed out since the last teardown.
    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    /// Bytes reserved from the heap since the last teardown.
    pub fn capacity(&self) -> usize {
        self.state.lock().reserved
    }

    /// Number of chunks currently held.
    pub fn chunk_count(&self) -> usize {
        self.state.lock().chunks.len()
    }

    /// Number of collected values awaiting teardown.
    pub fn pending_destructors(&self) -> usize {
        self.state.lock().collected.len()
    }

    /// Individually owned allocations still live.
    pub fn live(&self) -> u64 {
        self.stats.snapshot().live()
    }

    /// Tear the arena down and report what was released.
    pub fn teardown(mut self) -> TeardownReport {
        self.release_all()
    }

    /// Tear down every allocation and keep the arena usable.
    pub fn reset(&mut self) -> TeardownReport {
        self.release_all()
    }

    fn release_all(&mut self) -> TeardownReport {
        let leaked = self.stats.snapshot().live();
        let state = self.state.get_mut();

        let collected = std::mem::take(&mut state.collected);
        for (base, destructor) in collected.iter().rev() {
            // SAFETY: each collected value was initialized by its handle and
            // is destroyed exactly once, here.
            unsafe { destructor.run(*base) };
        }

        let chunks = std::mem::take(&mut state.chunks);
        let bytes_released = chunks.iter().map(|c| c.layout.size()).sum();
        for chunk in &chunks {
            // SAFETY: the chunk came from `alloc::alloc` with this layout.
            unsafe { alloc::dealloc(chunk.base.as_ptr(), chunk.layout) };
        }
        state.cursor = None;
        state.reserved = 0;
        state.used = 0;

        let report = TeardownReport {
            destroyed: collected.len(),
            chunks_released: chunks.len(),
            bytes_released,
            leaked,
        };
        if report.is_empty() {
            return report;
        }

        self.stats.record_bulk_release(leaked);
        LogBuilder::new(LogLevel::Debug)
            .target("tether::arena")
            .message("arena torn down")
            .field("arena", self.name.as_str())
            .field("destroyed", report.destroyed)
            .field("chunks", report.chunks_released)
            .field("bytes", report.bytes_released)
            .field("leaked", report.leaked)
            .emit();

        if leaked > 0 {
            let fault = Fault::NotAllPointersDeallocated {
                allocator: self.name.clone(),
                live: leaked as usize,
            };
            match self.config.leak_policy {
                LeakPolicy::Fatal => panic::report(fault, Severity::Fatal),
                LeakPolicy::Warn => panic::report(fault, Severity::Warning),
                LeakPolicy::Ignore => {}
            }
        }

        report
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.release_all();
    }
}

unsafe impl Allocator for Arena {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(
        &self,
        layout: Layout,
        destructor: Option<Destructor>,
    ) -> Result<NonNull<u8>, AllocError> {
        let mut state = self.state.lock();
        let ptr = if layout.size() == 0 {
            dangling(layout.align())
        } else {
            state.allocate(layout, &self.config)?
        };
        if let Some(destructor) = destructor {
            state.collected.push((ptr, destructor));
        }
        self.stats.record_alloc(layout, destructor.is_some());
        Ok(ptr)
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {
        self.stats.record_dealloc();
    }

    unsafe fn retire(&self, _ptr: NonNull<u8>, _layout: Layout) {
        self.stats.record_retire();
    }

    fn stats(&self) -> AllocSnapshot {
        self.stats.snapshot()
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("used", &state.used)
            .field("capacity", &state.reserved)
            .field("chunks", &state.chunks.len())
            .field("pending_destructors", &state.collected.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn small() -> ArenaConfig {
        ArenaConfig {
            chunk_size: 1024,
            max_size: 0,
            leak_policy: LeakPolicy::Ignore,
        }
    }

    #[test]
    fn test_arena_bump_allocation() {
        let arena = Arena::with_config("bump", small());
        let a = arena.allocate(Layout::new::<u64>(), None).unwrap();
        let b = arena.allocate(Layout::new::<u64>(), None).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 8);
        assert_eq!(arena.used(), 16);
        assert_eq!(arena.chunk_count(), 1);
        assert_eq!(arena.capacity(), 1024);
        unsafe {
            arena.deallocate(a, Layout::new::<u64>());
            arena.deallocate(b, Layout::new::<u64>());
        }
    }

    #[test]
    fn test_arena_alignment() {
        let arena = Arena::with_config("align", small());
        arena.allocate(Layout::new::<u8>(), None).unwrap();
        let wide = arena
            .allocate(Layout::from_size_align(32, 64).unwrap(), None)
            .unwrap();
        assert_eq!(wide.as_ptr() as usize % 64, 0);
    }

    #[test]
    fn test_arena_grows_new_chunks() {
        let arena = Arena::with_config("grow", small());
        for _ in 0..10 {
            arena
                .allocate(Layout::from_size_align(256, 8).unwrap(), None)
                .unwrap();
        }
        assert!(arena.chunk_count() >= 3);
        assert_eq!(arena.live(), 10);
    }

    #[test]
    fn test_arena_oversized_request() {
        let arena = Arena::with_config("big", small());
        let small_ptr = arena.allocate(Layout::new::<u32>(), None).unwrap();
        arena
            .allocate(Layout::from_size_align(4096, 8).unwrap(), None)
            .unwrap();
        // The dedicated chunk does not replace the bump chunk.
        let next = arena.allocate(Layout::new::<u32>(), None).unwrap();
        assert_eq!(next.as_ptr() as usize - small_ptr.as_ptr() as usize, 4);
        assert_eq!(arena.chunk_count(), 2);
    }

    #[test]
    fn test_arena_max_size() {
        let config = ArenaConfig {
            max_size: 1024,
            ..small()
        };
        let arena = Arena::with_config("capped", config);
        assert!(arena
            .allocate(Layout::from_size_align(512, 8).unwrap(), None)
            .is_ok());
        let err = arena
            .allocate(Layout::from_size_align(1024, 8).unwrap(), None)
            .unwrap_err();
        assert_eq!(err, AllocError::OutOfMemory { size: 1024, align: 8 });
    }

    #[test]
    fn test_arena_runs_destructors_in_reverse() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        struct Tag(u8, Arc<parking_lot::Mutex<Vec<u8>>>);
        impl Drop for Tag {
            fn drop(&mut self) {
                self.1.lock().push(self.0);
            }
        }

        let arena = Arena::with_config("order", small());
        for tag in [b'A', b'B', b'C'] {
            let layout = Layout::new::<Tag>();
            let ptr = arena
                .allocate(layout, Some(Destructor::of::<Tag>(0)))
                .unwrap();
            unsafe { ptr.as_ptr().cast::<Tag>().write(Tag(tag, order.clone())) };
        }
        assert_eq!(arena.pending_destructors(), 3);

        let report = arena.teardown();
        assert_eq!(*order.lock(), vec![b'C', b'B', b'A']);
        assert_eq!(report.destroyed, 3);
        assert_eq!(report.chunks_released, 1);
        assert_eq!(report.leaked, 0);
    }

    #[test]
    fn test_arena_reset_reuses() {
        let hits = Arc::new(AtomicUsize::new(0));
        struct Bump(Arc<AtomicUsize>);
        impl Drop for Bump {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut arena = Arena::with_config("reset", small());
        let ptr = arena
            .allocate(Layout::new::<Bump>(), Some(Destructor::of::<Bump>(0)))
            .unwrap();
        unsafe { ptr.as_ptr().cast::<Bump>().write(Bump(hits.clone())) };

        let report = arena.reset();
        assert_eq!(report.destroyed, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.chunk_count(), 0);
        assert_eq!(arena.stats().bulk_releases, 1);

        arena.allocate(Layout::new::<u64>(), None).unwrap();
        assert_eq!(arena.chunk_count(), 1);
    }

    #[test]
    fn test_arena_leak_warning() {
        let config = ArenaConfig {
            leak_policy: LeakPolicy::Warn,
            ..small()
        };
        let arena = Arena::with_config("leak-warning-arena", config);
        arena.allocate(Layout::new::<u64>(), None).unwrap();
        let report = arena.teardown();
        assert_eq!(report.leaked, 1);
    }

    #[test]
    fn test_arena_leak_fatal() {
        let config = ArenaConfig {
            leak_policy: LeakPolicy::Fatal,
            ..small()
        };
        let result = panic::catch_panic(|| {
            let arena = Arena::with_config("leak-fatal-arena", config);
            arena.allocate(Layout::new::<u64>(), None).unwrap();
            arena.teardown()
        });
        let caught = result.panic().expect("teardown should raise");
        assert_eq!(
            caught.fault(),
            Some(&Fault::NotAllPointersDeallocated {
                allocator: "leak-fatal-arena".into(),
                live: 1
            })
        );
    }

    #[test]
    fn test_arena_retired_is_not_leaked() {
        let config = ArenaConfig {
            leak_policy: LeakPolicy::Fatal,
            ..small()
        };
        let arena = Arena::with_config("retire", config);
        let layout = Layout::new::<u64>();
        let ptr = arena.allocate(layout, None).unwrap();
        unsafe { arena.retire(ptr, layout) };
        assert_eq!(arena.teardown().leaked, 0);
    }

    #[test]
    fn test_arena_ids_are_unique() {
        let a = Arena::with_config("a", small());
        let b = Arena::with_config("b", small());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), "a");
    }

    #[test]
    fn test_arena_debug() {
        let arena = Arena::with_config("debug", small());
        let text = format!("{:?}", arena);
        assert!(text.contains("Arena"));
        assert!(text.contains("debug"));
    }
}
