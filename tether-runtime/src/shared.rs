//! # Shared Owners
//!
//! - [`Strong`]: atomically reference-counted, may cross threads.
//! - [`Weak`]: observes a `Strong` group without keeping the value alive;
//!   [`Weak::upgrade`] succeeds only while at least one `Strong` remains.
//! - [`Handle`]: reference-counted with plain counters, confined to one
//!   thread, no weak counterpart.
//!
//! A shared handle may refer to a sub-object of the managed instance (see
//! [`crate::project`]); it still keeps the whole instance alive.

use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr;

use crate::alloc::{self, AllocError, Allocator};
use crate::block::{BlockState, ControlBlock, Link};
use crate::log::{LogBuilder, LogLevel};
use crate::nothing::{self, dereferenced_nothing, FromNothing};
use crate::owned::Own;
use crate::panic;
use crate::qualifier::{Managed, Qualifier};

fn log_failed_conversion(from: Qualifier, type_name: &str, owners: usize) {
    LogBuilder::new(LogLevel::Debug)
        .target("tether::convert")
        .message("conversion to own released a shared reference")
        .field("from", from.as_str())
        .field("type", type_name)
        .field("owners", owners)
        .emit();
}

// ============================================================================
// Strong
// ============================================================================

/// Thread-safe shared owner.
pub struct Strong<'a, T> {
    link: Option<Link<'a, T>>,
    _owns: PhantomData<T>,
}

impl<'a, T> Strong<'a, T> {
    /// Allocate `value` on the system heap.
    #[track_caller]
    pub fn new(value: T) -> Self {
        Self::new_in(value, alloc::system())
    }

    /// An empty handle.
    pub const fn empty() -> Self {
        Self {
            link: None,
            _owns: PhantomData,
        }
    }

    /// Allocate `value` in `allocator`, raising `out-of-memory` on failure.
    #[track_caller]
    pub fn new_in(value: T, allocator: &'a dyn Allocator) -> Self {
        match Self::try_new_in(value, allocator) {
            Ok(strong) => strong,
            Err(err) => panic::fatal(err.into_fault(allocator.name())),
        }
    }

    /// Allocate `value` in `allocator`.
    pub fn try_new_in(value: T, allocator: &'a dyn Allocator) -> Result<Self, AllocError> {
        ControlBlock::allocate(allocator, BlockState::strong(), value).map(Self::from_link)
    }

    /// Adopt a link whose strong reference the caller already holds.
    pub(crate) fn from_link(link: Link<'a, T>) -> Self {
        Self {
            link: Some(link),
            _owns: PhantomData,
        }
    }

    pub(crate) fn link(&self) -> Option<Link<'a, T>> {
        self.link
    }

    /// Borrow the value, if any.
    pub fn get(&self) -> Option<&T> {
        // SAFETY: a strong reference keeps the value alive.
        self.link.as_ref().map(|l| unsafe { l.ptr.as_ref() })
    }

    /// Mutably borrow the value when this is the only handle to it.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        let link = self.link.as_mut()?;
        // SAFETY: no other strong or weak reference exists, so nothing else
        // can reach the value.
        unsafe {
            if link.block().is_unique_strong() {
                Some(link.ptr.as_mut())
            } else {
                None
            }
        }
    }

    /// The allocator holding the value, if any.
    pub fn allocator(&self) -> Option<&'a dyn Allocator> {
        self.link.map(|l| unsafe { l.block().allocator() })
    }

    /// Number of `Strong` handles to the value; 0 when empty.
    pub fn strong_count(&self) -> usize {
        self.link.map_or(0, |l| unsafe { l.block().strong_count() })
    }

    /// Number of `Weak` handles to the value; 0 when empty.
    pub fn weak_count(&self) -> usize {
        self.link.map_or(0, |l| unsafe { l.block().weak_count() })
    }

    /// A `Weak` observer of the value; dangling when empty.
    #[track_caller]
    pub fn downgrade(&self) -> Weak<'a, T> {
        match self.link {
            Some(link) => {
                unsafe { link.block().increment_weak() };
                Weak {
                    link: Some(link),
                    _observes: PhantomData,
                }
            }
            None => Weak::new(),
        }
    }

    /// Move ownership out, leaving this handle empty.
    pub fn take(&mut self) -> Self {
        Self {
            link: self.link.take(),
            _owns: PhantomData,
        }
    }

    /// Release this reference and leave the handle empty.
    pub fn reset(&mut self) {
        drop(self.take());
    }

    /// Release the current reference and share `src`'s value.
    pub fn assign(&mut self, src: &Self) {
        *self = src.clone();
    }

    /// Take sole ownership back.
    ///
    /// Succeeds only when this is the last `Strong` and no `Weak` observes
    /// the value. Otherwise this reference is released and the result is
    /// empty. A handle to a sub-object never converts.
    pub fn into_own(self) -> Own<'a, T> {
        let this = ManuallyDrop::new(self);
        let Some(link) = this.link else {
            return Own::empty();
        };
        unsafe {
            let block = link.block();
            if link.is_whole() && block.is_unique_strong() {
                ControlBlock::retag(link.block, BlockState::Own);
                return Own::from_link(link);
            }
            log_failed_conversion(Qualifier::Strong, block.type_name(), block.strong_count());
        }
        drop(Self::from_link(link));
        Own::empty()
    }

    /// A new `Strong` owning a clone of the value, in the same allocator.
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

impl<T: FromNothing> Strong<'_, T> {
    /// The value, or the nothing instance when empty.
    pub fn or_nothing(&self) -> &T {
        self.get().unwrap_or_else(|| nothing::nothing())
    }
}

impl<T> Clone for Strong<'_, T> {
    #[track_caller]
    fn clone(&self) -> Self {
        if let Some(link) = self.link {
            unsafe { link.block().increment_strong() };
        }
        Self {
            link: self.link,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for Strong<'_, T> {
    fn drop(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        // SAFETY: this handle held one strong reference.
        unsafe {
            let block = link.block();
            if block.decrement_strong() {
                block.drop_value();
                if block.decrement_weak() {
                    ControlBlock::release(link.block);
                }
            }
        }
    }
}

impl<T> Default for Strong<'_, T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Deref for Strong<'_, T> {
    type Target = T;

    #[track_caller]
    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => dereferenced_nothing::<T>(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Strong<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Strong").field(&self.get()).finish()
    }
}

impl<T> Managed for Strong<'_, T> {
    type Target = T;
    const QUALIFIER: Qualifier = Qualifier::Strong;

    fn as_ptr(&self) -> *const T {
        self.link.map_or(ptr::null(), |l| l.ptr.as_ptr() as *const T)
    }
}

unsafe impl<T: Send + Sync> Send for Strong<'_, T> {}
unsafe impl<T: Send + Sync> Sync for Strong<'_, T> {}

// ============================================================================
// Weak
// ============================================================================

/// Non-owning observer of a [`Strong`] group.
pub struct Weak<'a, T> {
    link: Option<Link<'a, T>>,
    _observes: PhantomData<T>,
}

impl<'a, T> Weak<'a, T> {
    /// A dangling observer that never upgrades.
    pub const fn new() -> Self {
        Self {
            link: None,
            _observes: PhantomData,
        }
    }

    /// A `Strong` to the value, or `None` once the last `Strong` is gone.
    pub fn upgrade(&self) -> Option<Strong<'a, T>> {
        let link = self.link?;
        // SAFETY: the weak reference keeps the block allocated.
        if unsafe { link.block().try_upgrade() } {
            Some(Strong::from_link(link))
        } else {
            None
        }
    }

    /// Number of `Strong` handles to the value; 0 when dangling.
    pub fn strong_count(&self) -> usize {
        self.link.map_or(0, |l| unsafe { l.block().strong_count() })
    }

    /// Number of `Weak` handles to the value; 0 when dangling.
    pub fn weak_count(&self) -> usize {
        self.link.map_or(0, |l| unsafe { l.block().weak_count() })
    }

    /// Move the observer out, leaving this one dangling.
    pub fn take(&mut self) -> Self {
        Self {
            link: self.link.take(),
            _observes: PhantomData,
        }
    }

    /// Stop observing.
    pub fn reset(&mut self) {
        drop(self.take());
    }

    /// Stop observing the current value and observe `src`'s.
    pub fn assign(&mut self, src: &Self) {
        *self = src.clone();
    }
}

impl<T> Clone for Weak<'_, T> {
    #[track_caller]
    fn clone(&self) -> Self {
        if let Some(link) = self.link {
            unsafe { link.block().increment_weak() };
        }
        Self {
            link: self.link,
            _observes: PhantomData,
        }
    }
}

impl<T> Drop for Weak<'_, T> {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            // SAFETY: this handle held one weak reference.
            unsafe {
                if link.block().decrement_weak() {
                    ControlBlock::release(link.block);
                }
            }
        }
    }
}

impl<T> Default for Weak<'_, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Weak<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(Weak)")
    }
}

impl<T> Managed for Weak<'_, T> {
    type Target = T;
    const QUALIFIER: Qualifier = Qualifier::Weak;

    /// The observed address; it may dangle once the value is destroyed.
    fn as_ptr(&self) -> *const T {
        self.link.map_or(ptr::null(), |l| l.ptr.as_ptr() as *const T)
    }
}

unsafe impl<T: Send + Sync> Send for Weak<'_, T> {}
unsafe impl<T: Send + Sync> Sync for Weak<'_, T> {}

// ============================================================================
// Handle
// ============================================================================

/// Single-threaded shared owner.
pub struct Handle<'a, T> {
    link: Option<Link<'a, T>>,
    _owns: PhantomData<T>,
}

impl<'a, T> Handle<'a, T> {
    /// Allocate `value` on the system heap.
    #[track_caller]
    pub fn new(value: T) -> Self {
        Self::new_in(value, alloc::system())
    }

    /// An empty handle.
    pub const fn empty() -> Self {
        Self {
            link: None,
            _owns: PhantomData,
        }
    }

    /// Allocate `value` in `allocator`, raising `out-of-memory` on failure.
    #[track_caller]
    pub fn new_in(value: T, allocator: &'a dyn Allocator) -> Self {
        match Self::try_new_in(value, allocator) {
            Ok(handle) => handle,
            Err(err) => panic::fatal(err.into_fault(allocator.name())),
        }
    }

    /// Allocate `value` in `allocator`.
    pub fn try_new_in(value: T, allocator: &'a dyn Allocator) -> Result<Self, AllocError> {
        ControlBlock::allocate(allocator, BlockState::handle(), value).map(Self::from_link)
    }

    pub(crate) fn from_link(link: Link<'a, T>) -> Self {
        Self {
            link: Some(link),
            _owns: PhantomData,
        }
    }

    pub(crate) fn link(&self) -> Option<Link<'a, T>> {
        self.link
    }

    /// Borrow the value, if any.
    pub fn get(&self) -> Option<&T> {
        self.link.as_ref().map(|l| unsafe { l.ptr.as_ref() })
    }

    /// Mutably borrow the value when this is the only handle to it.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        let link = self.link.as_mut()?;
        unsafe {
            if link.block().strong_count() == 1 {
                Some(link.ptr.as_mut())
            } else {
                None
            }
        }
    }

    /// The allocator holding the value, if any.
    pub fn allocator(&self) -> Option<&'a dyn Allocator> {
        self.link.map(|l| unsafe { l.block().allocator() })
    }

    /// Number of handles to the value; 0 when empty.
    pub fn count(&self) -> usize {
        self.link.map_or(0, |l| unsafe { l.block().strong_count() })
    }

    /// Move ownership out, leaving this handle empty.
    pub fn take(&mut self) -> Self {
        Self {
            link: self.link.take(),
            _owns: PhantomData,
        }
    }

    /// Release this reference and leave the handle empty.
    pub fn reset(&mut self) {
        drop(self.take());
    }

    /// Release the current reference and share `src`'s value.
    pub fn assign(&mut self, src: &Self) {
        *self = src.clone();
    }

    /// Take sole ownership back.
    ///
    /// Succeeds only when this is the last handle; otherwise this reference
    /// is released and the result is empty.
    pub fn into_own(self) -> Own<'a, T> {
        let this = ManuallyDrop::new(self);
        let Some(link) = this.link else {
            return Own::empty();
        };
        unsafe {
            let block = link.block();
            if link.is_whole() && block.strong_count() == 1 {
                ControlBlock::retag(link.block, BlockState::Own);
                return Own::from_link(link);
            }
            log_failed_conversion(Qualifier::Handle, block.type_name(), block.strong_count());
        }
        drop(Self::from_link(link));
        Own::empty()
    }

    /// A new `Handle` owning a clone of the value, in the same allocator.
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

impl<T: FromNothing> Handle<'_, T> {
    /// The value, or the nothing instance when empty.
    pub fn or_nothing(&self) -> &T {
        self.get().unwrap_or_else(|| nothing::nothing())
    }
}

impl<T> Clone for Handle<'_, T> {
    #[track_caller]
    fn clone(&self) -> Self {
        if let Some(link) = self.link {
            unsafe { link.block().increment_local() };
        }
        Self {
            link: self.link,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for Handle<'_, T> {
    fn drop(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        unsafe {
            let block = link.block();
            if block.decrement_local() {
                block.drop_value();
                ControlBlock::release(link.block);
            }
        }
    }
}

impl<T> Default for Handle<'_, T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Deref for Handle<'_, T> {
    type Target = T;

    #[track_caller]
    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => dereferenced_nothing::<T>(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Handle<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.get()).finish()
    }
}

impl<T> Managed for Handle<'_, T> {
    type Target = T;
    const QUALIFIER: Qualifier = Qualifier::Handle;

    fn as_ptr(&self) -> *const T {
        self.link.map_or(ptr::null(), |l| l.ptr.as_ptr() as *const T)
    }
}
