//! Ownership qualifiers and the interface shared by every handle.

use std::fmt;

use crate::raw::Raw;

/// The eight ownership qualifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qualifier {
    /// Non-owning, unchecked.
    Raw,
    /// Exclusive owner without a control block.
    Unique,
    /// Exclusive owner; frees the instance and its storage.
    Own,
    /// Exclusive owner; destroys the instance and retires its storage.
    Discard,
    /// Exclusive owner; destruction deferred to allocator teardown.
    Collect,
    /// Thread-safe shared owner.
    Strong,
    /// Non-owning observer of a `Strong` group.
    Weak,
    /// Single-threaded shared owner.
    Handle,
}

impl Qualifier {
    /// All qualifiers.
    pub const ALL: [Qualifier; 8] = [
        Qualifier::Raw,
        Qualifier::Unique,
        Qualifier::Own,
        Qualifier::Discard,
        Qualifier::Collect,
        Qualifier::Strong,
        Qualifier::Weak,
        Qualifier::Handle,
    ];

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Qualifier::Raw => "raw",
            Qualifier::Unique => "unique",
            Qualifier::Own => "own",
            Qualifier::Discard => "discard",
            Qualifier::Collect => "collect",
            Qualifier::Strong => "strong",
            Qualifier::Weak => "weak",
            Qualifier::Handle => "handle",
        }
    }

    /// Whether holding the handle keeps the instance alive.
    pub fn is_owning(&self) -> bool {
        !matches!(self, Qualifier::Raw | Qualifier::Weak)
    }

    /// Whether several handles may own the same instance.
    pub fn is_shared(&self) -> bool {
        matches!(self, Qualifier::Strong | Qualifier::Handle)
    }

    /// Whether the instance lives behind a control block.
    pub fn has_control_block(&self) -> bool {
        !matches!(self, Qualifier::Raw | Qualifier::Unique)
    }

    /// Whether the handle may be sent to another thread.
    pub fn is_thread_safe(&self) -> bool {
        !matches!(self, Qualifier::Raw | Qualifier::Handle)
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations common to all handles.
pub trait Managed {
    /// The pointee type.
    type Target;

    /// The handle's qualifier.
    const QUALIFIER: Qualifier;

    /// Address of the referenced value, or null for an empty handle.
    fn as_ptr(&self) -> *const Self::Target;

    /// The handle's qualifier.
    fn qualifier(&self) -> Qualifier {
        Self::QUALIFIER
    }

    /// Whether the handle refers to nothing.
    fn is_empty(&self) -> bool {
        self.as_ptr().is_null()
    }

    /// A non-owning view of the referenced value.
    fn raw(&self) -> Raw<Self::Target> {
        Raw::from_ptr(self.as_ptr())
    }

    /// Whether both handles refer to the same address.
    fn ptr_eq<M>(&self, other: &M) -> bool
    where
        M: Managed<Target = Self::Target>,
    {
        std::ptr::eq(self.as_ptr(), other.as_ptr())
    }
}
