//! # Nothing Instances
//!
//! A type may designate one distinguished, immutable value, its *nothing
//! instance*, that stands in for "no value". Empty handles of such types
//! resolve to it through `or_nothing()` instead of faulting.
//!
//! There is exactly one nothing instance per type per process. It is created
//! lazily on first request, exactly once even when many threads race for it,
//! and is never destroyed.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::panic::{self, Fault, Severity};

/// Argument passed to [`FromNothing::from_nothing`].
///
/// Only the runtime constructs it, so a nothing instance can only be built
/// through [`nothing`].
#[derive(Debug)]
pub struct Nothing(());

/// Types that have a nothing instance.
///
/// Methods of the type called on its nothing instance should be harmless
/// no-ops that return neutral values.
pub trait FromNothing: Sized + Send + Sync + 'static {
    /// Build the nothing instance.
    fn from_nothing(token: Nothing) -> Self;

    /// Whether `self` is this type's nothing instance.
    fn is_nothing(&self) -> bool {
        is_nothing(self)
    }
}

type Cell = &'static (dyn Any + Send + Sync);

static REGISTRY: OnceLock<RwLock<HashMap<TypeId, Cell>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<TypeId, Cell>> {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

fn lookup<T: FromNothing>() -> Option<&'static OnceLock<T>> {
    let cell: Cell = *registry().read().get(&TypeId::of::<T>())?;
    cell.downcast_ref::<OnceLock<T>>()
}

fn cell<T: FromNothing>() -> &'static OnceLock<T> {
    if let Some(cell) = lookup::<T>() {
        return cell;
    }

    let cell: Cell = *registry()
        .write()
        .entry(TypeId::of::<T>())
        .or_insert_with(|| Box::leak(Box::new(OnceLock::<T>::new())) as Cell);
    match cell.downcast_ref::<OnceLock<T>>() {
        Some(cell) => cell,
        None => unreachable!("nothing registry entry for {} has the wrong type", type_name::<T>()),
    }
}

/// The nothing instance of `T`, created on first use.
///
/// The registry lock is not held while the instance is built, so
/// `from_nothing` may itself request other nothing instances.
pub fn nothing<T: FromNothing>() -> &'static T {
    cell::<T>().get_or_init(|| T::from_nothing(Nothing(())))
}

/// Whether `value` is the nothing instance of `T`.
///
/// Never creates the instance.
pub fn is_nothing<T: FromNothing>(value: &T) -> bool {
    lookup::<T>()
        .and_then(|cell| cell.get())
        .map_or(false, |instance| std::ptr::eq(instance, value))
}

/// Number of types whose nothing instance has been requested.
pub fn registered_count() -> usize {
    registry().read().len()
}

/// Report direct value access through a nothing instance.
///
/// Active when `diagnostics.check_nothing_access` is set; returns `value`
/// unchanged either way.
#[track_caller]
pub fn check_access<T: FromNothing>(value: &T) -> &T {
    if crate::runtime_config().diagnostics.check_nothing_access && is_nothing(value) {
        panic::report(
            Fault::PointerToNothingAccessed {
                type_name: type_name::<T>(),
            },
            Severity::Warning,
        );
    }
    value
}

/// Fault raised when an empty handle is dereferenced.
#[track_caller]
pub(crate) fn dereferenced_nothing<T>() -> ! {
    panic::fatal(Fault::NothingDereferenced {
        type_name: type_name::<T>(),
    })
}
