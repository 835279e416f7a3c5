//! # Lifetime Projection
//!
//! A shared handle to a container can hand out handles to its fields. The
//! projected handle shares the container's reference count, so the field
//! stays valid for as long as any projection or the original handle lives:
//!
//! ```
//! use tether_runtime::{lifelink, Strong};
//!
//! struct Pair {
//!     left: String,
//!     right: String,
//! }
//!
//! let mut pair = Strong::new(Pair { left: "l".into(), right: "r".into() });
//! let right = lifelink(&pair.right, &pair);
//! pair.reset();
//! assert_eq!(right.as_str(), "r");
//! ```

use std::mem::size_of;
use std::ptr::NonNull;

use crate::shared::{Handle, Strong};

/// Whether `[sub, sub + size_of::<U>())` lies within
/// `[container, container + size_of::<T>())`.
///
/// A zero-sized `U` must start strictly before the container's end, so a
/// trailing `()` or `PhantomData` field addressed one past the end is rejected.
pub fn contains<T, U>(container: *const T, sub: *const U) -> bool {
    let start = container as usize;
    let Some(end) = start.checked_add(size_of::<T>()) else {
        return false;
    };
    let first = sub as usize;
    let Some(last) = first.checked_add(size_of::<U>()) else {
        return false;
    };
    first >= start && first < end && last <= end
}

/// Shared handles that can project onto their sub-objects.
pub trait Lifelink<'a>: Sized {
    /// The same kind of handle, pointing at a `U`.
    type Projected<U>;

    /// A handle to `sub`, sharing ownership of this handle's value.
    ///
    /// Returns an empty handle when `sub` does not lie inside the value this
    /// handle points to, or when this handle is empty.
    fn lifelink<U>(&self, sub: &U) -> Self::Projected<U>;

    /// A handle to `sub` without checking containment.
    ///
    /// # Safety
    /// `sub` must point to a valid `U` that lives as long as this handle's
    /// value.
    unsafe fn lifecast<U>(&self, sub: *const U) -> Self::Projected<U>;
}

impl<'a, T> Lifelink<'a> for Strong<'a, T> {
    type Projected<U> = Strong<'a, U>;

    #[track_caller]
    fn lifelink<U>(&self, sub: &U) -> Strong<'a, U> {
        match self.link() {
            Some(link) if contains(link.ptr.as_ptr(), sub) => unsafe { self.lifecast(sub) },
            _ => Strong::empty(),
        }
    }

    #[track_caller]
    unsafe fn lifecast<U>(&self, sub: *const U) -> Strong<'a, U> {
        match (self.link(), NonNull::new(sub as *mut U)) {
            (Some(link), Some(ptr)) => {
                link.block().increment_strong();
                Strong::from_link(link.project(ptr))
            }
            _ => Strong::empty(),
        }
    }
}

impl<'a, T> Lifelink<'a> for Handle<'a, T> {
    type Projected<U> = Handle<'a, U>;

    #[track_caller]
    fn lifelink<U>(&self, sub: &U) -> Handle<'a, U> {
        match self.link() {
            Some(link) if contains(link.ptr.as_ptr(), sub) => unsafe { self.lifecast(sub) },
            _ => Handle::empty(),
        }
    }

    #[track_caller]
    unsafe fn lifecast<U>(&self, sub: *const U) -> Handle<'a, U> {
        match (self.link(), NonNull::new(sub as *mut U)) {
            (Some(link), Some(ptr)) => {
                link.block().increment_local();
                Handle::from_link(link.project(ptr))
            }
            _ => Handle::empty(),
        }
    }
}

/// A handle to `sub` sharing ownership with `container`; empty when `sub`
/// lies outside the container's value.
#[track_caller]
pub fn lifelink<'a, C, U>(sub: &U, container: &C) -> C::Projected<U>
where
    C: Lifelink<'a>,
{
    container.lifelink(sub)
}

/// A handle to `sub` sharing ownership with `container`, unchecked.
///
/// # Safety
/// See [`Lifelink::lifecast`].
#[track_caller]
pub unsafe fn lifecast<'a, C, U>(sub: *const U, container: &C) -> C::Projected<U>
where
    C: Lifelink<'a>,
{
    container.lifecast(sub)
}
