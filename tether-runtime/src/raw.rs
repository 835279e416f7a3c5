//! Non-owning, unchecked pointers.

use std::fmt;
use std::ptr::NonNull;

use crate::nothing::{self, FromNothing};

/// A copyable pointer that neither owns nor keeps alive what it points to.
///
/// Obtained from any handle through [`Managed::raw`](crate::Managed::raw),
/// from a reference, or from a nothing instance.
pub struct Raw<T> {
    ptr: Option<NonNull<T>>,
}

impl<T> Raw<T> {
    /// A null pointer.
    pub const fn null() -> Self {
        Self { ptr: None }
    }

    /// Point at `value`.
    pub fn from_ref(value: &T) -> Self {
        Self {
            ptr: Some(NonNull::from(value)),
        }
    }

    /// Wrap a possibly null pointer.
    pub fn from_ptr(ptr: *const T) -> Self {
        Self {
            ptr: NonNull::new(ptr as *mut T),
        }
    }

    /// Whether the pointer is null.
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    /// The address, or null.
    pub fn as_ptr(&self) -> *const T {
        self.ptr
            .map_or(std::ptr::null(), |p| p.as_ptr() as *const T)
    }

    /// Borrow the pointee.
    ///
    /// # Safety
    /// The pointee must be alive for `'r` and not mutated meanwhile.
    pub unsafe fn as_ref<'r>(&self) -> Option<&'r T> {
        self.ptr.map(|p| &*p.as_ptr())
    }
}

impl<T: FromNothing> Raw<T> {
    /// Point at the nothing instance of `T`.
    pub fn nothing() -> Self {
        Self::from_ref(nothing::nothing::<T>())
    }

    /// Whether the pointer refers to the nothing instance.
    pub fn is_nothing(&self) -> bool {
        // SAFETY: only the address is compared.
        unsafe { self.as_ref() }.map_or(false, nothing::is_nothing)
    }

    /// Borrow the pointee, falling back to the nothing instance when null and
    /// reporting access through a nothing instance when that check is on.
    ///
    /// # Safety
    /// Same as [`Raw::as_ref`].
    #[track_caller]
    pub unsafe fn get_checked<'r>(&self) -> &'r T {
        match self.as_ref() {
            Some(value) => nothing::check_access(value),
            None => nothing::check_access(nothing::nothing::<T>()),
        }
    }
}

impl<T> Clone for Raw<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Raw<T> {}

impl<T> PartialEq for Raw<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Raw<T> {}

impl<T> Default for Raw<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for Raw<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Raw").field(&self.as_ptr()).finish()
    }
}

impl<T> crate::qualifier::Managed for Raw<T> {
    type Target = T;
    const QUALIFIER: crate::qualifier::Qualifier = crate::qualifier::Qualifier::Raw;

    fn as_ptr(&self) -> *const T {
        Raw::as_ptr(self)
    }
}
