//! Faults, Diagnostic Hooks and Panic Capture
//!
//! The runtime never returns error codes for misuse it detects at runtime.
//! Every detected fault is turned into a [`Diagnostic`] and routed through
//! [`report`]:
//!
//! 1. the fault is counted and remembered as the last diagnostic,
//! 2. it is logged through [`crate::log`],
//! 3. every registered diagnostic hook is invoked,
//! 4. fatal faults then unwind with the diagnostic as panic payload (or abort
//!    the process when `diagnostics.abort_on_fatal` is configured).
//!
//! Hooks make the instrumentation swappable without touching call sites.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_runtime::panic::{register_diagnostic_hook, Severity};
//!
//! let id = register_diagnostic_hook(|diag| {
//!     if diag.severity() == Severity::Warning {
//!         eprintln!("tether: {}", diag);
//!     }
//! });
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::log::{LogBuilder, LogLevel};

/// Counter for reported faults.
static FAULT_COUNT: AtomicU64 = AtomicU64::new(0);

type DiagnosticHook = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

static HOOKS: OnceLock<Mutex<Vec<(HookId, DiagnosticHook)>>> = OnceLock::new();

static LAST_DIAGNOSTIC: OnceLock<Mutex<Option<Diagnostic>>> = OnceLock::new();

fn hooks() -> &'static Mutex<Vec<(HookId, DiagnosticHook)>> {
    HOOKS.get_or_init(|| Mutex::new(Vec::new()))
}

fn last() -> &'static Mutex<Option<Diagnostic>> {
    LAST_DIAGNOSTIC.get_or_init(|| Mutex::new(None))
}

/// How a fault affects the running program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Logged and delivered to hooks; execution continues.
    Warning,
    /// Logged, delivered to hooks, then the thread unwinds (or the process
    /// aborts).
    Fatal,
}

impl Severity {
    fn log_level(self) -> LogLevel {
        match self {
            Severity::Warning => LogLevel::Warn,
            Severity::Fatal => LogLevel::Error,
        }
    }
}

/// A fault detected by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// An allocator could not satisfy a request.
    OutOfMemory {
        /// Requested size in bytes.
        size: usize,
        /// Requested alignment in bytes.
        align: usize,
        /// Name of the allocator that failed.
        allocator: String,
    },
    /// Collected storage was requested from an allocator that is never torn
    /// down and therefore cannot run deferred destructors.
    CollectUnsupported {
        /// Name of the allocator.
        allocator: String,
    },
    /// An empty handle was dereferenced.
    NothingDereferenced {
        /// Type behind the handle.
        type_name: &'static str,
    },
    /// A value was read directly through a nothing instance.
    PointerToNothingAccessed {
        /// Type of the nothing instance.
        type_name: &'static str,
    },
    /// An allocator was torn down while allocations it handed out one by one
    /// were still live.
    NotAllPointersDeallocated {
        /// Name of the allocator.
        allocator: String,
        /// Number of allocations still live.
        live: usize,
    },
    /// A reference count would overflow.
    RefCountOverflow {
        /// Type behind the handle.
        type_name: &'static str,
    },
    /// A reference count was released more often than it was acquired.
    DoubleFree {
        /// Type behind the handle.
        type_name: &'static str,
    },
}

impl Fault {
    /// Stable identifier for the fault kind.
    pub fn code(&self) -> &'static str {
        match self {
            Fault::OutOfMemory { .. } => "out-of-memory",
            Fault::CollectUnsupported { .. } => "collect-unsupported",
            Fault::NothingDereferenced { .. } => "nothing-dereferenced",
            Fault::PointerToNothingAccessed { .. } => "pointer-to-nothing-accessed",
            Fault::NotAllPointersDeallocated { .. } => {
                "not-all-pointers-deallocated-during-allocator-cleanup"
            }
            Fault::RefCountOverflow { .. } => "ref-count-overflow",
            Fault::DoubleFree { .. } => "double-free",
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::OutOfMemory { size, align, allocator } => write!(
                f,
                "allocator '{}' is out of memory ({} bytes, align {})",
                allocator, size, align
            ),
            Fault::CollectUnsupported { allocator } => {
                write!(f, "allocator '{}' cannot hold collected values", allocator)
            }
            Fault::NothingDereferenced { type_name } => {
                write!(f, "dereferenced an empty pointer to `{}`", type_name)
            }
            Fault::PointerToNothingAccessed { type_name } => {
                write!(f, "accessed the nothing instance of `{}`", type_name)
            }
            Fault::NotAllPointersDeallocated { allocator, live } => write!(
                f,
                "allocator '{}' cleaned up with {} allocation(s) still live",
                allocator, live
            ),
            Fault::RefCountOverflow { type_name } => {
                write!(f, "reference count overflow on `{}`", type_name)
            }
            Fault::DoubleFree { type_name } => {
                write!(f, "reference to `{}` released twice", type_name)
            }
        }
    }
}

/// Source location information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// File name.
    pub file: &'static str,
    /// Line number.
    pub line: u32,
    /// Column number.
    pub column: u32,
}

impl From<&'static std::panic::Location<'static>> for Location {
    fn from(loc: &'static std::panic::Location<'static>) -> Self {
        Self {
            file: loc.file(),
            line: loc.line(),
            column: loc.column(),
        }
    }
}

/// A fault together with the context in which it was reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    fault: Fault,
    severity: Severity,
    location: Option<Location>,
    sequence: u64,
    thread_name: Option<String>,
}

impl Diagnostic {
    /// The reported fault.
    pub fn fault(&self) -> &Fault {
        &self.fault
    }

    /// Severity the fault was reported with.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Where the fault was reported, if known.
    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    /// Process-wide sequence number of this diagnostic (1-based).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Name of the reporting thread, if it has one.
    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.severity {
            Severity::Warning => "warning",
            Severity::Fatal => "fatal",
        };
        write!(f, "{}[{}]: {}", kind, self.fault.code(), self.fault)?;
        if let Some(loc) = &self.location {
            write!(f, " at {}:{}:{}", loc.file, loc.line, loc.column)?;
        }
        Ok(())
    }
}

/// Identifier returned by [`register_diagnostic_hook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Register a hook invoked for every reported diagnostic.
///
/// Hooks run on the reporting thread, in registration order, before a fatal
/// fault unwinds. A panicking hook is contained and does not stop the others.
pub fn register_diagnostic_hook<F>(hook: F) -> HookId
where
    F: Fn(&Diagnostic) + Send + Sync + 'static,
{
    static NEXT_HOOK_ID: AtomicU64 = AtomicU64::new(1);

    let id = HookId(NEXT_HOOK_ID.fetch_add(1, Ordering::Relaxed));
    hooks().lock().push((id, Arc::new(hook)));
    id
}

/// Remove a previously registered hook. Returns `false` if it was not found.
pub fn unregister_diagnostic_hook(id: HookId) -> bool {
    let mut hooks = hooks().lock();
    let before = hooks.len();
    hooks.retain(|(hook_id, _)| *hook_id != id);
    hooks.len() != before
}

/// Remove all registered hooks.
pub fn clear_diagnostic_hooks() {
    hooks().lock().clear();
}

/// Number of faults reported since process start.
pub fn fault_count() -> u64 {
    FAULT_COUNT.load(Ordering::SeqCst)
}

/// The most recently reported diagnostic, if any.
pub fn last_diagnostic() -> Option<Diagnostic> {
    last().lock().clone()
}

#[track_caller]
fn build(fault: Fault, severity: Severity) -> Diagnostic {
    Diagnostic {
        fault,
        severity,
        location: Some(std::panic::Location::caller().into()),
        sequence: FAULT_COUNT.fetch_add(1, Ordering::SeqCst) + 1,
        thread_name: std::thread::current().name().map(|s| s.to_string()),
    }
}

fn deliver(diag: &Diagnostic) {
    *last().lock() = Some(diag.clone());

    LogBuilder::new(diag.severity.log_level())
        .target("tether::fault")
        .message(diag.to_string())
        .field("code", diag.fault.code())
        .field("sequence", diag.sequence)
        .emit();

    // Snapshot the hooks so a hook may register or remove hooks itself.
    let snapshot: Vec<DiagnosticHook> = hooks().lock().iter().map(|(_, h)| h.clone()).collect();
    for hook in snapshot {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(diag)));
    }
}

/// Report a fault.
///
/// Warnings return normally. Fatal faults unwind, except while the thread is
/// already panicking (a destructor running during unwinding), where they are
/// logged and delivered only.
#[track_caller]
pub fn report(fault: Fault, severity: Severity) {
    let diag = build(fault, severity);
    deliver(&diag);
    if severity == Severity::Fatal && !std::thread::panicking() {
        raise(diag);
    }
}

/// Report a fatal fault and unwind.
#[track_caller]
pub fn fatal(fault: Fault) -> ! {
    let diag = build(fault, Severity::Fatal);
    deliver(&diag);
    if std::thread::panicking() {
        // A second unwind would abort anyway; make the reason visible first.
        eprintln!("{}", diag);
        std::process::abort();
    }
    raise(diag)
}

fn raise(diag: Diagnostic) -> ! {
    if crate::runtime_config().diagnostics.abort_on_fatal {
        eprintln!("{}", diag);
        std::process::abort();
    }
    std::panic::panic_any(diag)
}

/// A panic captured by [`catch_panic`].
#[derive(Debug, Clone, PartialEq)]
pub struct CaughtPanic {
    message: String,
    diagnostic: Option<Diagnostic>,
}

impl CaughtPanic {
    /// The panic message (the formatted diagnostic for runtime faults).
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The diagnostic, when the panic was a runtime fault.
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        self.diagnostic.as_ref()
    }

    /// The fault, when the panic was a runtime fault.
    pub fn fault(&self) -> Option<&Fault> {
        self.diagnostic.as_ref().map(|d| d.fault())
    }
}

/// Result of catching a panic.
#[derive(Debug)]
pub enum CatchResult<T> {
    /// The closure completed successfully.
    Ok(T),
    /// The closure panicked.
    Panicked(CaughtPanic),
}

impl<T> CatchResult<T> {
    /// Returns true if the result is Ok.
    pub fn is_ok(&self) -> bool {
        matches!(self, CatchResult::Ok(_))
    }

    /// Returns true if the closure panicked.
    pub fn is_panicked(&self) -> bool {
        matches!(self, CatchResult::Panicked(_))
    }

    /// Converts to a standard Result.
    pub fn into_result(self) -> Result<T, CaughtPanic> {
        match self {
            CatchResult::Ok(v) => Ok(v),
            CatchResult::Panicked(info) => Err(info),
        }
    }

    /// The captured panic, if any.
    pub fn panic(&self) -> Option<&CaughtPanic> {
        match self {
            CatchResult::Ok(_) => None,
            CatchResult::Panicked(info) => Some(info),
        }
    }
}

/// Run `f`, capturing a panic instead of unwinding further.
///
/// Runtime faults arrive as their [`Diagnostic`]; other panics keep their
/// message only.
pub fn catch_panic<F, R>(f: F) -> CatchResult<R>
where
    F: FnOnce() -> R,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(value) => CatchResult::Ok(value),
        Err(payload) => {
            let caught = if let Some(diag) = payload.downcast_ref::<Diagnostic>() {
                CaughtPanic {
                    message: diag.to_string(),
                    diagnostic: Some(diag.clone()),
                }
            } else if let Some(s) = payload.downcast_ref::<&str>() {
                CaughtPanic {
                    message: s.to_string(),
                    diagnostic: None,
                }
            } else if let Some(s) = payload.downcast_ref::<String>() {
                CaughtPanic {
                    message: s.clone(),
                    diagnostic: None,
                }
            } else {
                CaughtPanic {
                    message: "unknown panic".to_string(),
                    diagnostic: None,
                }
            };
            CatchResult::Panicked(caught)
        }
    }
}
