//! # Allocation Context
//!
//! A [`Context`] names three allocators:
//!
//! - **standard**: general-purpose storage for `Unique`, `Own` and `Handle`.
//! - **sequential**: storage torn down as a unit, used for `Discard` and
//!   `Collect`.
//! - **parallel**: storage for values shared between threads through
//!   `Strong`.
//!
//! Contexts are plain values passed down explicitly. Swapping an allocator is
//! scoped: `with_*` derives a child context and leaves the parent alone,
//! `replace_*` swaps in place and restores on guard drop.

use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::alloc::{self, Allocator};
use crate::owned::{Collect, Discard, Own, Unique};
use crate::shared::{Handle, Strong};

/// One of a context's allocator slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// General-purpose storage.
    Standard,
    /// Storage torn down as a unit.
    Sequential,
    /// Storage for values shared between threads.
    Parallel,
}

/// A set of allocators used by the convenience constructors.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    standard: &'a dyn Allocator,
    sequential: &'a dyn Allocator,
    parallel: &'a dyn Allocator,
}

impl Context<'static> {
    /// A context whose three slots are the system allocator.
    pub fn global() -> Self {
        Self::uniform(alloc::system())
    }
}

impl<'a> Context<'a> {
    /// A context with explicit allocators for every slot.
    pub fn new(
        standard: &'a dyn Allocator,
        sequential: &'a dyn Allocator,
        parallel: &'a dyn Allocator,
    ) -> Self {
        Self {
            standard,
            sequential,
            parallel,
        }
    }

    /// A context using `allocator` for every slot.
    pub fn uniform(allocator: &'a dyn Allocator) -> Self {
        Self::new(allocator, allocator, allocator)
    }

    /// The standard allocator.
    pub fn standard(&self) -> &'a dyn Allocator {
        self.standard
    }

    /// The sequential allocator.
    pub fn sequential(&self) -> &'a dyn Allocator {
        self.sequential
    }

    /// The parallel allocator.
    pub fn parallel(&self) -> &'a dyn Allocator {
        self.parallel
    }

    /// The allocator in `slot`.
    pub fn get(&self, slot: Slot) -> &'a dyn Allocator {
        match slot {
            Slot::Standard => self.standard,
            Slot::Sequential => self.sequential,
            Slot::Parallel => self.parallel,
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut &'a dyn Allocator {
        match slot {
            Slot::Standard => &mut self.standard,
            Slot::Sequential => &mut self.sequential,
            Slot::Parallel => &mut self.parallel,
        }
    }

    /// A child context with `allocator` in `slot`.
    pub fn with<'b>(&self, slot: Slot, allocator: &'b dyn Allocator) -> Context<'b>
    where
        'a: 'b,
    {
        let mut child: Context<'b> = *self;
        *child.slot_mut(slot) = allocator;
        child
    }

    /// A child context with a different standard allocator.
    pub fn with_standard<'b>(&self, allocator: &'b dyn Allocator) -> Context<'b>
    where
        'a: 'b,
    {
        self.with(Slot::Standard, allocator)
    }

    /// A child context with a different sequential allocator.
    pub fn with_sequential<'b>(&self, allocator: &'b dyn Allocator) -> Context<'b>
    where
        'a: 'b,
    {
        self.with(Slot::Sequential, allocator)
    }

    /// A child context with a different parallel allocator.
    pub fn with_parallel<'b>(&self, allocator: &'b dyn Allocator) -> Context<'b>
    where
        'a: 'b,
    {
        self.with(Slot::Parallel, allocator)
    }

    /// Put `allocator` in `slot` until the returned guard is dropped.
    pub fn replace(&mut self, slot: Slot, allocator: &'a dyn Allocator) -> ContextGuard<'_, 'a> {
        let previous = std::mem::replace(self.slot_mut(slot), allocator);
        ContextGuard {
            context: self,
            slot,
            previous,
        }
    }

    /// Swap the standard allocator until the guard is dropped.
    pub fn replace_standard(&mut self, allocator: &'a dyn Allocator) -> ContextGuard<'_, 'a> {
        self.replace(Slot::Standard, allocator)
    }

    /// Swap the sequential allocator until the guard is dropped.
    pub fn replace_sequential(&mut self, allocator: &'a dyn Allocator) -> ContextGuard<'_, 'a> {
        self.replace(Slot::Sequential, allocator)
    }

    /// Swap the parallel allocator until the guard is dropped.
    pub fn replace_parallel(&mut self, allocator: &'a dyn Allocator) -> ContextGuard<'_, 'a> {
        self.replace(Slot::Parallel, allocator)
    }

    /// `Unique` in the standard allocator.
    #[track_caller]
    pub fn unique<T>(&self, value: T) -> Unique<'a, T> {
        Unique::new_in(value, self.standard)
    }

    /// `Own` in the standard allocator.
    #[track_caller]
    pub fn own<T>(&self, value: T) -> Own<'a, T> {
        Own::new_in(value, self.standard)
    }

    /// `Handle` in the standard allocator.
    #[track_caller]
    pub fn handle<T>(&self, value: T) -> Handle<'a, T> {
        Handle::new_in(value, self.standard)
    }

    /// `Strong` in the parallel allocator.
    #[track_caller]
    pub fn strong<T>(&self, value: T) -> Strong<'a, T> {
        Strong::new_in(value, self.parallel)
    }

    /// `Discard` in the sequential allocator.
    #[track_caller]
    pub fn discard<T>(&self, value: T) -> Discard<'a, T> {
        Discard::new_in(value, self.sequential)
    }

    /// `Collect` in the sequential allocator.
    #[track_caller]
    pub fn collect<T: Send>(&self, value: T) -> Collect<'a, T> {
        Collect::new_in(value, self.sequential)
    }
}

impl Default for Context<'static> {
    fn default() -> Self {
        Self::global()
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("standard", &self.standard.name())
            .field("sequential", &self.sequential.name())
            .field("parallel", &self.parallel.name())
            .finish()
    }
}

/// Restores a context slot when dropped.
pub struct ContextGuard<'c, 'a> {
    context: &'c mut Context<'a>,
    slot: Slot,
    previous: &'a dyn Allocator,
}

impl ContextGuard<'_, '_> {
    /// The slot being overridden.
    pub fn slot(&self) -> Slot {
        self.slot
    }
}

impl<'a> Deref for ContextGuard<'_, 'a> {
    type Target = Context<'a>;

    fn deref(&self) -> &Context<'a> {
        self.context
    }
}

impl<'a> DerefMut for ContextGuard<'_, 'a> {
    fn deref_mut(&mut self) -> &mut Context<'a> {
        self.context
    }
}

impl Drop for ContextGuard<'_, '_> {
    fn drop(&mut self) {
        *self.context.slot_mut(self.slot) = self.previous;
    }
}
