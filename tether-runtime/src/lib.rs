//! # Tether Runtime Library
//!
//! Ownership-qualified pointers over pluggable allocators:
//!
//! - **Exclusive owners**: [`Unique`], [`Own`], [`Discard`], [`Collect`]
//! - **Shared owners**: [`Strong`] (atomic) with [`Weak`] observers, and the
//!   single-threaded [`Handle`]
//! - **Raw pointers**: [`Raw`], non-owning and unchecked
//! - **Allocators**: the [`Allocator`] trait, the system heap and [`Arena`]
//! - **Nothing instances**: per-type sentinel values that stand in for "no
//!   value" ([`FromNothing`], [`nothing()`])
//! - **Projection**: handles to sub-objects that keep the container alive
//!   ([`lifelink()`], [`lifecast()`])
//! - **Context**: scoped sets of allocators ([`Context`])
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        TETHER RUNTIME                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │  Exclusive   │  │    Shared    │  │  Projection  │          │
//! │  │  (owned.rs)  │  │ (shared.rs)  │  │ (project.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Context    │  │Control Block │  │   Nothing    │          │
//! │  │ (context.rs) │  │  (block.rs)  │  │ (nothing.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                                     │
//! │  ┌──────────────┐  ┌──────────────┐                            │
//! │  │  Allocator   │  │    Arena     │                            │
//! │  │  (alloc.rs)  │  │  (arena.rs)  │                            │
//! │  └──────────────┘  └──────────────┘                            │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use tether_runtime::{Arena, Collect, Own, Strong};
//!
//! let arena = Arena::named("frame");
//!
//! let config = Own::new_in(String::from("on"), &arena);
//! let shared = Strong::new_in(vec![1, 2, 3], &arena);
//! let observer = shared.downgrade();
//! let deferred = Collect::new_in(42u64, &arena);
//!
//! assert_eq!(config.as_str(), "on");
//! assert_eq!(observer.upgrade().map(|s| s.len()), Some(3));
//! assert_eq!(*deferred, 42);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod arena;
pub mod block;
pub mod config;
pub mod context;
pub mod log;
pub mod nothing;
pub mod owned;
pub mod panic;
pub mod project;
pub mod qualifier;
pub mod raw;
pub mod shared;

// Re-exports
pub use alloc::{system, AllocError, AllocSnapshot, Allocator, Destructor, SystemAllocator};
pub use arena::{Arena, ArenaId, TeardownReport};
pub use block::{BlockState, ControlBlock};
pub use config::{ArenaConfig, ConfigError, LeakPolicy, RuntimeConfig, RuntimeConfigBuilder};
pub use context::{Context, ContextGuard, Slot};
pub use log::{LogFormat, LogLevel};
pub use nothing::{nothing, FromNothing, Nothing};
pub use owned::{Collect, Discard, Own, Unique};
pub use panic::{catch_panic, CatchResult, Diagnostic, Fault, Severity};
pub use project::{lifecast, lifelink, Lifelink};
pub use qualifier::{Managed, Qualifier};
pub use raw::Raw;
pub use shared::{Handle, Strong, Weak};

use std::sync::OnceLock;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Global runtime configuration.
static RUNTIME_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Initialize the runtime with `config`.
///
/// Validates the configuration, applies its log settings and makes it
/// visible through [`runtime_config`]. The first successful call wins; later
/// calls only validate and log.
///
/// # Example
///
/// ```
/// use tether_runtime::{init, LeakPolicy, RuntimeConfig};
///
/// let config = RuntimeConfig::builder()
///     .arena_chunk_size(4096)
///     .leak_policy(LeakPolicy::Fatal)
///     .build()
///     .unwrap();
///
/// init(config).unwrap();
/// ```
pub fn init(config: RuntimeConfig) -> Result<(), ConfigError> {
    config.validate()?;

    if RUNTIME_CONFIG.set(config).is_err() {
        log::LogBuilder::new(LogLevel::Debug)
            .target("tether::init")
            .message("runtime already initialized; keeping the first configuration")
            .emit();
        return Ok(());
    }

    log::set_level(config.log.level);
    log::set_format(config.log.format);
    log::LogBuilder::new(LogLevel::Debug)
        .target("tether::init")
        .message("runtime initialized")
        .field("version", VERSION)
        .field("arena_chunk_size", config.arena.chunk_size)
        .field("leak_policy", config.arena.leak_policy.as_str())
        .emit();
    Ok(())
}

/// Initialize the runtime from `TETHER_*` environment variables.
///
/// See [`RuntimeConfig::from_env`] for the supported variables.
pub fn init_from_env() -> Result<(), ConfigError> {
    init(RuntimeConfig::from_env())
}

/// The active runtime configuration, or the defaults before [`init`].
pub fn runtime_config() -> RuntimeConfig {
    RUNTIME_CONFIG.get().copied().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let config = RuntimeConfig::builder()
            .arena_chunk_size(100)
            .build_unchecked();
        assert!(init(config).is_err());
    }

    #[test]
    fn test_runtime_config_defaults_are_valid() {
        assert!(runtime_config().validate().is_ok());
    }
}
