//! # Control Blocks
//!
//! Every handle except `Raw` and `Unique` points at a control block allocated
//! together with the instance it manages:
//!
//! ```text
//! +----------------------------+----------+
//! | ControlBlock               | T        |
//! |  state / drop_fn / layout  |          |
//! +----------------------------+----------+
//! ^ allocation base            ^ value
//! ```
//!
//! The block's [`BlockState`] records which qualifier currently governs the
//! allocation and carries that qualifier's counters. Conversions between
//! qualifiers re-tag the state in place; the instance never moves.
//!
//! For `Strong` groups the strong owners collectively hold one weak
//! reference. The instance is destroyed when the strong count reaches zero;
//! the allocation is returned when the weak count reaches zero.

use std::alloc::Layout;
use std::any::type_name;
use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicUsize, Ordering};

use crate::alloc::{drop_erased, AllocError, Allocator, Destructor, DropFn};
use crate::panic::{self, Fault};
use crate::qualifier::Qualifier;

/// Counts above this are treated as overflow.
const MAX_REFCOUNT: usize = isize::MAX as usize;

/// Qualifier-specific state of a control block.
#[derive(Debug)]
pub enum BlockState {
    /// Exclusively owned; freed individually.
    Own,
    /// Exclusively owned; storage retired on release.
    Discard,
    /// Exclusively owned; destroyed at allocator teardown.
    Collect,
    /// Thread-safe shared ownership.
    Strong {
        /// Strong owners.
        strong: AtomicUsize,
        /// Weak observers, plus one held by the strong owners together.
        weak: AtomicUsize,
    },
    /// Single-threaded shared ownership.
    Handle {
        /// Owners.
        count: Cell<usize>,
    },
}

impl BlockState {
    /// State of a fresh `Strong` group with one owner.
    pub fn strong() -> Self {
        BlockState::Strong {
            strong: AtomicUsize::new(1),
            weak: AtomicUsize::new(1),
        }
    }

    /// State of a fresh `Handle` group with one owner.
    pub fn handle() -> Self {
        BlockState::Handle {
            count: Cell::new(1),
        }
    }

    /// The qualifier this state belongs to.
    pub fn qualifier(&self) -> Qualifier {
        match self {
            BlockState::Own => Qualifier::Own,
            BlockState::Discard => Qualifier::Discard,
            BlockState::Collect => Qualifier::Collect,
            BlockState::Strong { .. } => Qualifier::Strong,
            BlockState::Handle { .. } => Qualifier::Handle,
        }
    }
}

/// Header stored in front of a managed instance.
pub struct ControlBlock<'a> {
    state: BlockState,
    value: NonNull<u8>,
    drop_fn: DropFn,
    type_name: &'static str,
    allocator: &'a dyn Allocator,
    layout: Layout,
}

/// A handle's view into a block: the address it refers to, which is the
/// instance itself or a sub-object of it, plus the block that governs it.
pub(crate) struct Link<'a, T> {
    pub(crate) ptr: NonNull<T>,
    pub(crate) block: NonNull<ControlBlock<'a>>,
    /// Set once the link has been narrowed to a sub-object, even one that
    /// shares the instance's address.
    pub(crate) projected: bool,
}

impl<T> Clone for Link<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Link<'_, T> {}

impl<'a, T> Link<'a, T> {
    /// The control block.
    ///
    /// # Safety
    /// The block must still be allocated.
    pub(crate) unsafe fn block(&self) -> &ControlBlock<'a> {
        self.block.as_ref()
    }

    /// Whether the link refers to the block's instance itself rather than a
    /// sub-object. A field at offset 0 shares the instance's address, so the
    /// projection flag decides, not the pointer.
    pub(crate) fn is_whole(&self) -> bool {
        !self.projected
    }

    /// Same block, different address.
    pub(crate) fn project<U>(&self, ptr: NonNull<U>) -> Link<'a, U> {
        Link {
            ptr,
            block: self.block,
            projected: true,
        }
    }
}

impl<'a> ControlBlock<'a> {
    /// Layout of a block followed by a `T`, and the offset of the `T`.
    pub fn layout_for<T>() -> Result<(Layout, usize), AllocError> {
        let (layout, offset) = Layout::new::<ControlBlock<'static>>()
            .extend(Layout::new::<T>())
            .map_err(|_| AllocError::InvalidLayout)?;
        Ok((layout.pad_to_align(), offset))
    }

    /// Allocate a block and move `value` in behind it.
    ///
    /// A `Collect` state registers the value's destructor with the allocator.
    pub(crate) fn allocate<T>(
        allocator: &'a dyn Allocator,
        state: BlockState,
        value: T,
    ) -> Result<Link<'a, T>, AllocError> {
        let (layout, offset) = Self::layout_for::<T>()?;
        let destructor = match state {
            BlockState::Collect => Some(Destructor::of::<T>(offset)),
            _ => None,
        };
        let base = allocator.allocate(layout, destructor)?;

        // SAFETY: `base` is valid for `layout`, which holds a block at offset
        // 0 and a `T` at `offset`, both suitably aligned.
        unsafe {
            let value_ptr = NonNull::new_unchecked(base.as_ptr().add(offset).cast::<T>());
            value_ptr.as_ptr().write(value);
            let block = base.cast::<ControlBlock<'a>>();
            block.as_ptr().write(ControlBlock {
                state,
                value: value_ptr.cast(),
                drop_fn: drop_erased::<T>,
                type_name: type_name::<T>(),
                allocator,
                layout,
            });
            Ok(Link {
                ptr: value_ptr,
                block,
                projected: false,
            })
        }
    }

    /// Current state.
    pub fn state(&self) -> &BlockState {
        &self.state
    }

    /// Qualifier currently governing the block.
    pub fn qualifier(&self) -> Qualifier {
        self.state.qualifier()
    }

    /// The allocator that owns the storage.
    pub fn allocator(&self) -> &'a dyn Allocator {
        self.allocator
    }

    /// Name of the managed type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Layout of the combined allocation.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Owners of the instance: the strong count for shared groups, 1 for
    /// exclusive owners.
    pub fn strong_count(&self) -> usize {
        match &self.state {
            BlockState::Strong { strong, .. } => strong.load(Ordering::Acquire),
            BlockState::Handle { count } => count.get(),
            _ => 1,
        }
    }

    /// Weak observers, not counting the reference the strong owners share.
    pub fn weak_count(&self) -> usize {
        match &self.state {
            BlockState::Strong { strong, weak } => {
                let weak = weak.load(Ordering::Acquire);
                if strong.load(Ordering::Acquire) > 0 {
                    weak.saturating_sub(1)
                } else {
                    weak
                }
            }
            _ => 0,
        }
    }

    /// Replace the state.
    ///
    /// # Safety
    /// The caller must be the block's only owner and nothing may observe the
    /// old counters afterwards.
    pub(crate) unsafe fn retag(block: NonNull<Self>, state: BlockState) {
        (*block.as_ptr()).state = state;
    }

    /// Destroy the instance in place.
    ///
    /// # Safety
    /// The instance must be alive and must not be used again.
    pub(crate) unsafe fn drop_value(&self) {
        (self.drop_fn)(self.value.as_ptr());
    }

    /// Return the allocation to its allocator.
    ///
    /// # Safety
    /// The instance must already be destroyed or moved out, and the block
    /// must not be used again.
    pub(crate) unsafe fn release(block: NonNull<Self>) {
        let (allocator, layout) = {
            let this = block.as_ref();
            (this.allocator, this.layout)
        };
        allocator.deallocate(block.cast(), layout);
    }

    /// Retire the allocation with its allocator.
    ///
    /// # Safety
    /// Same as [`ControlBlock::release`].
    pub(crate) unsafe fn retire(block: NonNull<Self>) {
        let (allocator, layout) = {
            let this = block.as_ref();
            (this.allocator, this.layout)
        };
        allocator.retire(block.cast(), layout);
    }

    // ------------------------------------------------------------------------
    // Strong groups
    // ------------------------------------------------------------------------

    fn atomics(&self) -> (&AtomicUsize, &AtomicUsize) {
        match &self.state {
            BlockState::Strong { strong, weak } => (strong, weak),
            other => unreachable!("{:?} block used as a strong group", other.qualifier()),
        }
    }

    /// Add a strong owner.
    #[track_caller]
    pub(crate) fn increment_strong(&self) {
        let (strong, _) = self.atomics();
        let old = strong.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            strong.fetch_sub(1, Ordering::Relaxed);
            panic::fatal(Fault::RefCountOverflow {
                type_name: self.type_name,
            });
        }
    }

    /// Remove a strong owner. Returns `true` if it was the last one.
    #[track_caller]
    pub(crate) fn decrement_strong(&self) -> bool {
        let (strong, _) = self.atomics();
        let old = strong.fetch_sub(1, Ordering::Release);
        if old == 1 {
            // Last owner: synchronize with every earlier release.
            atomic::fence(Ordering::Acquire);
            true
        } else if old == 0 {
            panic::fatal(Fault::DoubleFree {
                type_name: self.type_name,
            });
        } else {
            false
        }
    }

    /// Add a weak observer.
    #[track_caller]
    pub(crate) fn increment_weak(&self) {
        let (_, weak) = self.atomics();
        let old = weak.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            weak.fetch_sub(1, Ordering::Relaxed);
            panic::fatal(Fault::RefCountOverflow {
                type_name: self.type_name,
            });
        }
    }

    /// Remove a weak reference. Returns `true` if it was the last one.
    #[track_caller]
    pub(crate) fn decrement_weak(&self) -> bool {
        let (_, weak) = self.atomics();
        let old = weak.fetch_sub(1, Ordering::Release);
        if old == 1 {
            atomic::fence(Ordering::Acquire);
            true
        } else if old == 0 {
            panic::fatal(Fault::DoubleFree {
                type_name: self.type_name,
            });
        } else {
            false
        }
    }

    /// Add a strong owner unless the instance is already gone.
    pub(crate) fn try_upgrade(&self) -> bool {
        let (strong, _) = self.atomics();
        let mut current = strong.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            if current > MAX_REFCOUNT {
                panic::fatal(Fault::RefCountOverflow {
                    type_name: self.type_name,
                });
            }
            match strong.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether a strong group has exactly one owner and no weak observers.
    pub(crate) fn is_unique_strong(&self) -> bool {
        let (strong, weak) = self.atomics();
        // Lock out new weak references by checking weak first.
        weak.load(Ordering::Acquire) == 1 && strong.load(Ordering::Acquire) == 1
    }

    // ------------------------------------------------------------------------
    // Handle groups
    // ------------------------------------------------------------------------

    fn local(&self) -> &Cell<usize> {
        match &self.state {
            BlockState::Handle { count } => count,
            other => unreachable!("{:?} block used as a handle group", other.qualifier()),
        }
    }

    /// Add a local owner.
    #[track_caller]
    pub(crate) fn increment_local(&self) {
        let count = self.local();
        match count.get().checked_add(1) {
            Some(next) if next <= MAX_REFCOUNT => count.set(next),
            _ => panic::fatal(Fault::RefCountOverflow {
                type_name: self.type_name,
            }),
        }
    }

    /// Remove a local owner. Returns `true` if it was the last one.
    #[track_caller]
    pub(crate) fn decrement_local(&self) -> bool {
        let count = self.local();
        match count.get() {
            0 => panic::fatal(Fault::DoubleFree {
                type_name: self.type_name,
            }),
            n => {
                count.set(n - 1);
                n == 1
            }
        }
    }
}

impl fmt::Debug for ControlBlock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBlock")
            .field("state", &self.state)
            .field("type_name", &self.type_name)
            .field("allocator", &self.allocator.name())
            .field("layout", &self.layout)
            .finish()
    }
}
