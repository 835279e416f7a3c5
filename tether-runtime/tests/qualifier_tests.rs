//! Integration tests for the qualifier handles.
//!
//! These exercise the runtime through its public API only: concurrent weak
//! upgrades, arena teardown order, projection, nothing instances, context
//! scoping and fault reporting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use parking_lot::Mutex;
use tether_runtime::panic::{register_diagnostic_hook, unregister_diagnostic_hook};
use tether_runtime::{
    catch_panic, lifelink, nothing, Allocator, Arena, ArenaConfig, Collect, Context, Discard,
    Fault, FromNothing, Handle, LeakPolicy, Managed, Nothing, Own, Raw, Severity, Strong, Unique,
    Weak,
};

fn arena(name: &str, leak_policy: LeakPolicy) -> Arena {
    Arena::with_config(
        name,
        ArenaConfig {
            chunk_size: 4096,
            max_size: 0,
            leak_policy,
        },
    )
}

struct Tracked {
    drops: Arc<AtomicUsize>,
}

impl Tracked {
    fn new(drops: &Arc<AtomicUsize>) -> Self {
        Self {
            drops: drops.clone(),
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Strong / Weak
// ============================================================================

#[test]
fn test_weak_upgrade_scenarios() {
    // Strong a, Weak w, reset a: upgrade fails.
    let mut a = Strong::new(1u32);
    let w = a.downgrade();
    a.reset();
    assert!(w.upgrade().is_none());

    // Strong a, Weak w, b = a, reset a: upgrade succeeds; reset b: fails.
    let mut a = Strong::new(2u32);
    let w = a.downgrade();
    let mut b: Strong<'_, u32> = Strong::empty();
    b.assign(&a);
    a.reset();
    assert_eq!(w.upgrade().as_deref(), Some(&2));
    b.reset();
    assert!(w.upgrade().is_none());
}

#[test]
fn test_weak_upgrade_race() {
    for _ in 0..2000 {
        let drops = Arc::new(AtomicUsize::new(0));
        let strong = Strong::new(Tracked::new(&drops));
        let weak = strong.downgrade();
        let barrier = Arc::new(Barrier::new(2));

        let upgrader = {
            let barrier = barrier.clone();
            let drops = drops.clone();
            thread::spawn(move || {
                barrier.wait();
                match weak.upgrade() {
                    Some(upgraded) => {
                        // A successful upgrade always observes a live value.
                        assert_eq!(drops.load(Ordering::SeqCst), 0);
                        assert!(upgraded.strong_count() >= 1);
                        true
                    }
                    None => false,
                }
            })
        };

        barrier.wait();
        drop(strong);
        upgrader.join().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn test_strong_shared_between_threads() {
    let arena = arena("threads-arena", LeakPolicy::Fatal);
    let drops = Arc::new(AtomicUsize::new(0));
    let counter = Strong::new_in(AtomicUsize::new(0), &arena);
    let tracked = Strong::new_in(Tracked::new(&drops), &arena);

    thread::scope(|s| {
        for _ in 0..16 {
            let counter = counter.clone();
            let tracked = tracked.clone();
            s.spawn(move || {
                for _ in 0..100 {
                    let local = counter.clone();
                    local.fetch_add(1, Ordering::Relaxed);
                }
                drop(tracked);
            });
        }
    });

    assert_eq!(counter.load(Ordering::SeqCst), 1600);
    assert_eq!(counter.strong_count(), 1);
    assert_eq!(tracked.strong_count(), 1);
    drop(tracked);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    drop(counter);
    assert_eq!(arena.teardown().leaked, 0);
}

#[test]
fn test_weak_only_survivorship() {
    let arena = arena("weak-only", LeakPolicy::Fatal);
    let drops = Arc::new(AtomicUsize::new(0));
    let weak: Weak<'_, Tracked> = Strong::new_in(Tracked::new(&drops), &arena).downgrade();

    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(weak.strong_count(), 0);
    assert_eq!(arena.live(), 1);

    drop(weak);
    assert_eq!(arena.live(), 0);
}

// ============================================================================
// Arena teardown
// ============================================================================

#[test]
fn test_collect_reverse_order_and_single_bulk_release() {
    struct Named(&'static str, Arc<Mutex<Vec<&'static str>>>);
    impl Drop for Named {
        fn drop(&mut self) {
            self.1.lock().push(self.0);
        }
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let arena = arena("collect-order", LeakPolicy::Fatal);
    {
        let _a = Collect::new_in(Named("A", order.clone()), &arena);
        let _b = Collect::new_in(Named("B", order.clone()), &arena);
        let _c = Collect::new_in(Named("C", order.clone()), &arena);
    }
    assert!(order.lock().is_empty());
    assert_eq!(arena.stats().bulk_releases, 0);

    let report = arena.teardown();
    assert_eq!(*order.lock(), vec!["C", "B", "A"]);
    assert_eq!(report.destroyed, 3);
    assert_eq!(report.chunks_released, 1);
}

#[test]
fn test_discard_memory_reclaimed_in_bulk() {
    let drops = Arc::new(AtomicUsize::new(0));
    let mut arena = arena("discard-bulk", LeakPolicy::Fatal);
    for _ in 0..10 {
        let handle = Discard::new_in(Tracked::new(&drops), &arena);
        drop(handle);
    }
    assert_eq!(drops.load(Ordering::SeqCst), 10);
    assert!(arena.used() > 0);

    let report = arena.reset();
    assert_eq!(report.leaked, 0);
    assert_eq!(report.destroyed, 0);
    assert_eq!(arena.used(), 0);
}

#[test]
fn test_forgotten_handle_is_reported() {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let hook = {
        let reports = reports.clone();
        register_diagnostic_hook(move |diag| {
            if let Fault::NotAllPointersDeallocated { allocator, live } = diag.fault() {
                if allocator == "forgetful-arena" {
                    reports.lock().push((*live, diag.severity()));
                }
            }
        })
    };

    let arena = arena("forgetful-arena", LeakPolicy::Warn);
    std::mem::forget(Own::new_in(5u8, &arena));
    std::mem::forget(Unique::new_in(6u8, &arena));
    let report = arena.teardown();
    unregister_diagnostic_hook(hook);

    assert_eq!(report.leaked, 2);
    assert_eq!(*reports.lock(), vec![(2, Severity::Warning)]);
}

#[test]
fn test_fatal_leak_policy_panics() {
    let result = catch_panic(|| {
        let arena = arena("fatal-leak", LeakPolicy::Fatal);
        std::mem::forget(Handle::new_in(1u16, &arena));
        drop(arena);
    });
    let fault = result.panic().and_then(|p| p.fault()).cloned();
    assert_eq!(
        fault,
        Some(Fault::NotAllPointersDeallocated {
            allocator: "fatal-leak".into(),
            live: 1,
        })
    );
}

#[test]
fn test_arena_out_of_memory() {
    let arena = Arena::with_config(
        "tiny",
        ArenaConfig {
            chunk_size: 256,
            max_size: 256,
            leak_policy: LeakPolicy::Ignore,
        },
    );
    assert!(Own::try_new_in([0u8; 1024], &arena).is_err());

    let result = catch_panic(|| {
        Own::new_in([0u8; 1024], &arena);
    });
    assert_eq!(
        result.panic().and_then(|p| p.fault()).map(Fault::code),
        Some("out-of-memory")
    );
}

// ============================================================================
// Conversions
// ============================================================================

#[test]
fn test_conversion_rules() {
    let arena = arena("conversions", LeakPolicy::Fatal);

    // Own -> Strong always succeeds and keeps the address.
    let own = Own::new_in(String::from("value"), &arena);
    let addr = own.as_ptr();
    let strong = own.into_strong();
    assert_eq!(strong.as_ptr(), addr);

    // Strong -> Own fails while shared.
    let copy = strong.clone();
    assert!(strong.into_own().is_empty());
    let own = copy.into_own();
    assert_eq!(own.as_ptr(), addr);

    // Own -> Handle -> Own.
    let handle = own.into_handle();
    let second = handle.clone();
    drop(second);
    let own = handle.into_own();
    assert_eq!(own.as_str(), "value");

    // Own -> Unique moves into a fresh allocation.
    let unique = own.into_unique();
    assert_eq!(unique.as_str(), "value");
    let discard = unique.into_discard();
    assert_eq!(discard.as_str(), "value");
    drop(discard);

    assert_eq!(arena.teardown().leaked, 0);
}

// ============================================================================
// Projection
// ============================================================================

struct Frame {
    header: [u8; 8],
    body: Vec<u32>,
    drops: Arc<AtomicUsize>,
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_lifelink_containment() {
    let drops = Arc::new(AtomicUsize::new(0));
    let mut frame = Strong::new(Frame {
        header: [7; 8],
        body: vec![1, 2, 3],
        drops: drops.clone(),
    });

    let outside = vec![9u32];
    assert!(lifelink(&outside, &frame).is_empty());

    let body = lifelink(&frame.body, &frame);
    let header = lifelink(&frame.header, &frame);
    frame.reset();
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert_eq!(*body, vec![1, 2, 3]);
    assert_eq!(header[0], 7);

    drop(body);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    drop(header);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Nothing instances
// ============================================================================

static SETTINGS_BUILT: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
struct Settings {
    verbose: bool,
}

impl FromNothing for Settings {
    fn from_nothing(_: Nothing) -> Self {
        SETTINGS_BUILT.fetch_add(1, Ordering::SeqCst);
        Settings { verbose: false }
    }
}

impl Settings {
    fn describe(&self) -> &'static str {
        if self.is_nothing() {
            return "";
        }
        if self.verbose {
            "verbose"
        } else {
            "quiet"
        }
    }
}

#[test]
fn test_nothing_instance_across_threads() {
    let barrier = Arc::new(Barrier::new(100));
    let handles: Vec<_> = (0..100)
        .map(|_| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                nothing::<Settings>() as *const Settings as usize
            })
        })
        .collect();

    let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(addrs.iter().all(|&a| a == addrs[0]));
    assert_eq!(SETTINGS_BUILT.load(Ordering::SeqCst), 1);
}

#[test]
fn test_empty_handles_fall_back_to_nothing() {
    let empty: Own<'_, Settings> = Own::empty();
    assert_eq!(empty.or_nothing().describe(), "");

    let real = Strong::new(Settings { verbose: true });
    assert_eq!(real.or_nothing().describe(), "verbose");

    let raw = Raw::<Settings>::nothing();
    assert!(raw.is_nothing());
}

#[test]
fn test_empty_dereference_is_fatal() {
    let result = catch_panic(|| {
        let strong: Strong<'_, Settings> = Strong::empty();
        strong.verbose
    });
    let caught = result.panic().expect("dereference should fail");
    assert_eq!(
        caught.fault().map(Fault::code),
        Some("nothing-dereferenced")
    );
    assert!(caught.message().contains("Settings"));
}

// ============================================================================
// Context
// ============================================================================

#[test]
fn test_context_scoping() {
    let frame = arena("frame-arena", LeakPolicy::Fatal);
    let mut ctx = Context::global();

    {
        let scoped = ctx.replace_sequential(&frame);
        let collected = scoped.collect(String::from("deferred"));
        assert_eq!(collected.allocator().map(|a| a.name()), Some("frame-arena"));
        let own = scoped.own(1u8);
        assert_eq!(own.allocator().map(|a| a.name()), Some("system"));
    }
    assert_eq!(ctx.sequential().name(), "system");

    let child = ctx.with_standard(&frame);
    let unique = child.unique(3u64);
    assert_eq!(unique.allocator().name(), "frame-arena");
    assert_eq!(ctx.standard().name(), "system");
    drop(unique);

    let report = frame.teardown();
    assert_eq!(report.destroyed, 1);
    assert_eq!(report.leaked, 0);
}

#[test]
fn test_raw_views_do_not_own() {
    let drops = Arc::new(AtomicUsize::new(0));
    let own = Own::new(Tracked::new(&drops));
    let raw = own.raw();
    let copy = raw;
    assert_eq!(copy.as_ptr(), own.as_ptr());
    drop(own);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(!raw.is_null());
}
