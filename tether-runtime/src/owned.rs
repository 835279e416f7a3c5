//! # Exclusive Owners
//!
//! Four handles own their instance alone and differ only in what happens
//! when they let go:
//!
//! | handle       | control block | on release                                  |
//! |--------------|---------------|---------------------------------------------|
//! | [`Unique`]   | no            | destroy, free storage                       |
//! | [`Own`]      | yes           | destroy, free block and storage             |
//! | [`Discard`]  | yes           | destroy, retire storage to the allocator    |
//! | [`Collect`]  | yes           | nothing; the allocator destroys at teardown |
//!
//! Every handle can be empty. Ownership moves with `take` and `assign`,
//! which leave the source empty. Crossing qualifiers is explicit
//! (`Unique::into_own`, `Own::into_strong`, ...) and never implicit.

use std::alloc::Layout;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

use crate::alloc::{self, allocate_or_fault, AllocError, Allocator};
use crate::block::{BlockState, ControlBlock, Link};
use crate::nothing::{self, dereferenced_nothing, FromNothing};
use crate::panic;
use crate::qualifier::{Managed, Qualifier};
use crate::shared::{Handle, Strong};

// ============================================================================
// Unique
// ============================================================================

/// Exclusive owner of a bare allocation.
pub struct Unique<'a, T> {
    ptr: Option<NonNull<T>>,
    allocator: &'a dyn Allocator,
    _owns: PhantomData<T>,
}

impl<'a, T> Unique<'a, T> {
    /// Allocate `value` on the system heap.
    #[track_caller]
    pub fn new(value: T) -> Self {
        Self::new_in(value, alloc::system())
    }

    /// An empty handle bound to the system heap.
    pub fn empty() -> Self {
        Self::empty_in(alloc::system())
    }

    /// An empty handle bound to `allocator`.
    pub fn empty_in(allocator: &'a dyn Allocator) -> Self {
        Self {
            ptr: None,
            allocator,
            _owns: PhantomData,
        }
    }

    /// Allocate `value` in `allocator`, raising `out-of-memory` on failure.
    #[track_caller]
    pub fn new_in(value: T, allocator: &'a dyn Allocator) -> Self {
        let ptr = allocate_or_fault(allocator, Layout::new::<T>(), None).cast::<T>();
        // SAFETY: fresh storage for one `T`.
        unsafe { ptr.as_ptr().write(value) };
        Self {
            ptr: Some(ptr),
            allocator,
            _owns: PhantomData,
        }
    }

    /// Allocate `value` in `allocator`.
    pub fn try_new_in(value: T, allocator: &'a dyn Allocator) -> Result<Self, AllocError> {
        let ptr = allocator.allocate(Layout::new::<T>(), None)?.cast::<T>();
        // SAFETY: fresh storage for one `T`.
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self {
            ptr: Some(ptr),
            allocator,
            _owns: PhantomData,
        })
    }

    /// The allocator the handle allocates from.
    pub fn allocator(&self) -> &'a dyn Allocator {
        self.allocator
    }

    /// Borrow the value, if any.
    pub fn get(&self) -> Option<&T> {
        // SAFETY: a present pointer refers to a live, exclusively owned value.
        self.ptr.as_ref().map(|p| unsafe { p.as_ref() })
    }

    /// Mutably borrow the value, if any.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.ptr.as_mut().map(|p| unsafe { p.as_mut() })
    }

    /// Move ownership out, leaving this handle empty.
    pub fn take(&mut self) -> Self {
        Self {
            ptr: self.ptr.take(),
            allocator: self.allocator,
            _owns: PhantomData,
        }
    }

    /// Destroy the value and leave the handle empty.
    pub fn reset(&mut self) {
        drop(self.take());
    }

    /// Release the current value, then take ownership of `src`'s.
    pub fn assign(&mut self, src: &mut Self) {
        *self = src.take();
    }

    /// Move the value out and free its storage.
    pub fn into_inner(self) -> Option<T> {
        let this = ManuallyDrop::new(self);
        let ptr = this.ptr?;
        // SAFETY: the value is read exactly once and the storage is freed
        // without running the destructor again.
        unsafe {
            let value = ptr.as_ptr().read();
            this.allocator.deallocate(ptr.cast(), Layout::new::<T>());
            Some(value)
        }
    }

    /// Move the value behind an `Own` control block in the same allocator.
    #[track_caller]
    pub fn into_own(self) -> Own<'a, T> {
        let allocator = self.allocator;
        match self.into_inner() {
            Some(value) => Own::new_in(value, allocator),
            None => Own::empty(),
        }
    }

    /// Move the value behind a `Discard` control block in the same allocator.
    #[track_caller]
    pub fn into_discard(self) -> Discard<'a, T> {
        let allocator = self.allocator;
        match self.into_inner() {
            Some(value) => Discard::new_in(value, allocator),
            None => Discard::empty(),
        }
    }

    /// Move the value behind a `Collect` control block in the same allocator.
    #[track_caller]
    pub fn into_collect(self) -> Collect<'a, T>
    where
        T: Send,
    {
        let allocator = self.allocator;
        match self.into_inner() {
            Some(value) => Collect::new_in(value, allocator),
            None => Collect::empty(),
        }
    }

    /// A new handle owning a clone of the value, in the same allocator.
    #[track_caller]
    pub fn deep_copy(&self) -> Self
    where
        T: Clone,
    {
        match self.get() {
            Some(value) => Self::new_in(value.clone(), self.allocator),
            None => Self::empty_in(self.allocator),
        }
    }
}

impl<T: FromNothing> Unique<'_, T> {
    /// The value, or the nothing instance when empty.
    pub fn or_nothing(&self) -> &T {
        self.get().unwrap_or_else(|| nothing::nothing())
    }
}

impl<T> Drop for Unique<'_, T> {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            // SAFETY: the handle owns the value and its storage.
            unsafe {
                ptr::drop_in_place(ptr.as_ptr());
                self.allocator.deallocate(ptr.cast(), Layout::new::<T>());
            }
        }
    }
}

impl<T> Default for Unique<'_, T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Deref for Unique<'_, T> {
    type Target = T;

    #[track_caller]
    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => dereferenced_nothing::<T>(),
        }
    }
}

impl<T> DerefMut for Unique<'_, T> {
    #[track_caller]
    fn deref_mut(&mut self) -> &mut T {
        match self.ptr {
            // SAFETY: exclusive access through `&mut self`.
            Some(mut ptr) => unsafe { ptr.as_mut() },
            None => dereferenced_nothing::<T>(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Unique<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Unique").field(&self.get()).finish()
    }
}

impl<T> Managed for Unique<'_, T> {
    type Target = T;
    const QUALIFIER: Qualifier = Qualifier::Unique;

    fn as_ptr(&self) -> *const T {
        self.ptr.map_or(ptr::null(), |p| p.as_ptr() as *const T)
    }
}

unsafe impl<T: Send> Send for Unique<'_, T> {}
unsafe impl<T: Sync> Sync for Unique<'_, T> {}

// ============================================================================
// Control-block owners
// ============================================================================

macro_rules! impl_exclusive {
    ($name:ident, $qualifier:expr) => {
        impl<'a, T> $name<'a, T> {
            /// An empty handle.
            pub const fn empty() -> Self {
                Self {
                    link: None,
                    _owns: PhantomData,
                }
            }

            pub(crate) fn from_link(link: Link<'a, T>) -> Self {
                Self {
                    link: Some(link),
                    _owns: PhantomData,
                }
            }

            /// Borrow the value, if any.
            pub fn get(&self) -> Option<&T> {
                // SAFETY: a present link refers to a live, exclusively owned value.
                self.link.as_ref().map(|l| unsafe { l.ptr.as_ref() })
            }

            /// Mutably borrow the value, if any.
            pub fn get_mut(&mut self) -> Option<&mut T> {
                self.link.as_mut().map(|l| unsafe { l.ptr.as_mut() })
            }

            /// The allocator holding the value, if any.
            pub fn allocator(&self) -> Option<&'a dyn Allocator> {
                self.link.map(|l| unsafe { l.block().allocator() })
            }

            /// Move ownership out, leaving this handle empty.
            pub fn take(&mut self) -> Self {
                Self {
                    link: self.link.take(),
                    _owns: PhantomData,
                }
            }

            /// Release the value and leave the handle empty.
            pub fn reset(&mut self) {
                drop(self.take());
            }

            /// Release the current value, then take ownership of `src`'s.
            pub fn assign(&mut self, src: &mut Self) {
                *self = src.take();
            }
        }

        impl<T: FromNothing> $name<'_, T> {
            /// The value, or the nothing instance when empty.
            pub fn or_nothing(&self) -> &T {
                self.get().unwrap_or_else(|| nothing::nothing())
            }
        }

        impl<T> Default for $name<'_, T> {
            fn default() -> Self {
                Self::empty()
            }
        }

        impl<T> Deref for $name<'_, T> {
            type Target = T;

            #[track_caller]
            fn deref(&self) -> &T {
                match self.get() {
                    Some(value) => value,
                    None => dereferenced_nothing::<T>(),
                }
            }
        }

        impl<T> DerefMut for $name<'_, T> {
            #[track_caller]
            fn deref_mut(&mut self) -> &mut T {
                match self.link {
                    // SAFETY: exclusive access through `&mut self`.
                    Some(mut link) => unsafe { link.ptr.as_mut() },
                    None => dereferenced_nothing::<T>(),
                }
            }
        }

        impl<T: fmt::Debug> fmt::Debug for $name<'_, T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.get()).finish()
            }
        }

        impl<T> Managed for $name<'_, T> {
            type Target = T;
            const QUALIFIER: Qualifier = $qualifier;

            fn as_ptr(&self) -> *const T {
                self.link.map_or(ptr::null(), |l| l.ptr.as_ptr() as *const T)
            }
        }

        unsafe impl<T: Send> Send for $name<'_, T> {}
        unsafe impl<T: Sync> Sync for $name<'_, T> {}
    };
}

// ============================================================================
// Own
// ============================================================================

/// Exclusive owner behind a control block; frees everything on release.
///
/// The control block lets an `Own` become a [`Strong`] or [`Handle`]
/// without moving the value.
pub struct Own<'a, T> {
    link: Option<Link<'a, T>>,
    _owns: PhantomData<T>,
}

impl_exclusive!(Own, Qualifier::Own);

impl<'a, T> Own<'a, T> {
    /// Allocate `value` on the system heap.
    #[track_caller]
    pub fn new(value: T) -> Self {
        Self::new_in(value, alloc::system())
    }

    /// Allocate `value` in `allocator`, raising `out-of-memory` on failure.
    #[track_caller]
    pub fn new_in(value: T, allocator: &'a dyn Allocator) -> Self {
        match Self::try_new_in(value, allocator) {
            Ok(own) => own,
            Err(err) => panic::fatal(err.into_fault(allocator.name())),
        }
    }

    /// Allocate `value` in `allocator`.
    pub fn try_new_in(value: T, allocator: &'a dyn Allocator) -> Result<Self, AllocError> {
        ControlBlock::allocate(allocator, BlockState::Own, value).map(Self::from_link)
    }

    /// Move the value out and free the allocation.
    pub fn into_inner(self) -> Option<T> {
        let this = ManuallyDrop::new(self);
        let link = this.link?;
        // SAFETY: the value is read exactly once; the block is released
        // without running the destructor.
        unsafe {
            let value = link.ptr.as_ptr().read();
            ControlBlock::release(link.block);
            Some(value)
        }
    }

    /// Move the value into a bare allocation from the same allocator.
    #[track_caller]
    pub fn into_unique(self) -> Unique<'a, T> {
        let Some(allocator) = self.allocator() else {
            return Unique::empty();
        };
        match self.into_inner() {
            Some(value) => Unique::new_in(value, allocator),
            None => Unique::empty_in(allocator),
        }
    }

    /// Share the value between threads. The block is re-tagged in place.
    pub fn into_strong(self) -> Strong<'a, T> {
        let this = ManuallyDrop::new(self);
        match this.link {
            Some(link) => {
                // SAFETY: an `Own` is the block's only owner.
                unsafe { ControlBlock::retag(link.block, BlockState::strong()) };
                Strong::from_link(link)
            }
            None => Strong::empty(),
        }
    }

    /// Share the value within this thread. The block is re-tagged in place.
    pub fn into_handle(self) -> Handle<'a, T> {
        let this = ManuallyDrop::new(self);
        match this.link {
            Some(link) => {
                // SAFETY: an `Own` is the block's only owner.
                unsafe { ControlBlock::retag(link.block, BlockState::handle()) };
                Handle::from_link(link)
            }
            None => Handle::empty(),
        }
    }

    /// A new handle owning a clone of the value, in the same allocator.
    #[track_caller]
    pub fn deep_copy(&self) -> Self
    where
        T: Clone,
    {
        match (self.get(), self.allocator()) {
            (Some(value), Some(allocator)) => Self::new_in(value.clone(), allocator),
            _ => Self::empty(),
        }
    }
}

impl<T> Drop for Own<'_, T> {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            // SAFETY: the handle owns the value and the allocation.
            unsafe {
                link.block().drop_value();
                ControlBlock::release(link.block);
            }
        }
    }
}

// ============================================================================
// Discard
// ============================================================================

/// Exclusive owner that destroys its value on release but hands the storage
/// back to the allocator for bulk reclamation.
pub struct Discard<'a, T> {
    link: Option<Link<'a, T>>,
    _owns: PhantomData<T>,
}

impl_exclusive!(Discard, Qualifier::Discard);

impl<'a, T> Discard<'a, T> {
    /// Allocate `value` in `allocator`, raising `out-of-memory` on failure.
    #[track_caller]
    pub fn new_in(value: T, allocator: &'a dyn Allocator) -> Self {
        match Self::try_new_in(value, allocator) {
            Ok(discard) => discard,
            Err(err) => panic::fatal(err.into_fault(allocator.name())),
        }
    }

    /// Allocate `value` in `allocator`.
    pub fn try_new_in(value: T, allocator: &'a dyn Allocator) -> Result<Self, AllocError> {
        ControlBlock::allocate(allocator, BlockState::Discard, value).map(Self::from_link)
    }

    /// A new handle owning a clone of the value, in the same allocator.
    #[track_caller]
    pub fn deep_copy(&self) -> Self
    where
        T: Clone,
    {
        match (self.get(), self.allocator()) {
            (Some(value), Some(allocator)) => Self::new_in(value.clone(), allocator),
            _ => Self::empty(),
        }
    }
}

impl<T> Drop for Discard<'_, T> {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            // SAFETY: the handle owns the value; the storage goes back
            // untouched.
            unsafe {
                link.block().drop_value();
                ControlBlock::retire(link.block);
            }
        }
    }
}

// ============================================================================
// Collect
// ============================================================================

/// Exclusive owner whose value is destroyed by the allocator at teardown.
///
/// Releasing the handle only forgets the value; it stays in place and its
/// destructor runs when the allocator is torn down, in reverse order of
/// construction. Requires an allocator that supports collection, such as
/// [`Arena`](crate::arena::Arena).
pub struct Collect<'a, T> {
    link: Option<Link<'a, T>>,
    _owns: PhantomData<T>,
}

impl_exclusive!(Collect, Qualifier::Collect);

impl<'a, T: Send> Collect<'a, T> {
    /// Allocate `value` in `allocator`, raising a fault if the allocator is
    /// out of memory or cannot collect.
    #[track_caller]
    pub fn new_in(value: T, allocator: &'a dyn Allocator) -> Self {
        match Self::try_new_in(value, allocator) {
            Ok(collect) => collect,
            Err(err) => panic::fatal(err.into_fault(allocator.name())),
        }
    }

    /// Allocate `value` in `allocator`.
    pub fn try_new_in(value: T, allocator: &'a dyn Allocator) -> Result<Self, AllocError> {
        ControlBlock::allocate(allocator, BlockState::Collect, value).map(Self::from_link)
    }

    /// A new handle owning a clone of the value, in the same allocator.
    #[track_caller]
    pub fn deep_copy(&self) -> Self
    where
        T: Clone,
    {
        match (self.get(), self.allocator()) {
            (Some(value), Some(allocator)) => Self::new_in(value.clone(), allocator),
            _ => Self::empty(),
        }
    }
}
