//! Property-based tests for the Tether runtime.
//!
//! Uses proptest to generate random operation sequences and verify the
//! ownership invariants hold.

use std::alloc::Layout;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;
use tether_runtime::project::contains;
use tether_runtime::{
    Allocator, Arena, ArenaConfig, Collect, Discard, LeakPolicy, Managed, Own, Strong, Unique,
    Weak,
};

fn strict_arena(name: &str) -> Arena {
    Arena::with_config(
        name,
        ArenaConfig {
            chunk_size: 1024,
            max_size: 0,
            leak_policy: LeakPolicy::Fatal,
        },
    )
}

struct Tracked(Arc<AtomicUsize>);

impl Drop for Tracked {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
enum SharedOp {
    Clone(usize),
    Reset(usize),
    Downgrade(usize),
    Upgrade(usize),
    DropWeak(usize),
}

fn shared_op() -> impl Strategy<Value = SharedOp> {
    prop_oneof![
        (0usize..8).prop_map(SharedOp::Clone),
        (0usize..8).prop_map(SharedOp::Reset),
        (0usize..8).prop_map(SharedOp::Downgrade),
        (0usize..8).prop_map(SharedOp::Upgrade),
        (0usize..8).prop_map(SharedOp::DropWeak),
    ]
}

#[derive(Debug, Clone)]
enum MoveOp {
    Assign(usize, usize),
    Take(usize, usize),
    Reset(usize),
}

fn move_op() -> impl Strategy<Value = MoveOp> {
    prop_oneof![
        (0usize..4, 0usize..4).prop_map(|(a, b)| MoveOp::Assign(a, b)),
        (0usize..4, 0usize..4).prop_map(|(a, b)| MoveOp::Take(a, b)),
        (0usize..4).prop_map(MoveOp::Reset),
    ]
}

/// Apply `op` to two distinct slots of `slots`.
fn pair_mut<T>(slots: &mut [T], a: usize, b: usize) -> Option<(&mut T, &mut T)> {
    if a == b {
        return None;
    }
    if a < b {
        let (left, right) = slots.split_at_mut(b);
        Some((&mut left[a], &mut right[0]))
    } else {
        let (left, right) = slots.split_at_mut(a);
        Some((&mut right[0], &mut left[b]))
    }
}

/// Random assign/take/reset sequences over four slots of one exclusive
/// qualifier. Moving ownership leaves exactly the destination owning. With
/// `destroys_on_release` a released value is destroyed at once; otherwise it
/// waits for the arena's teardown. Either way each value goes exactly once.
macro_rules! exclusive_moves {
    ($name:ident, $handle:ident, destroys_on_release: $eager:expr) => {
        proptest! {
            #[test]
            fn $name(ops in prop::collection::vec(move_op(), 0..48)) {
                let hits = Arc::new(AtomicUsize::new(0));
                let arena = strict_arena(stringify!($name));
                let created = 4;
                {
                    let mut slots: Vec<$handle<'_, Tracked>> = (0..created)
                        .map(|_| $handle::new_in(Tracked(hits.clone()), &arena))
                        .collect();
                    let mut owned = created;

                    for op in ops {
                        match op {
                            MoveOp::Assign(a, b) => {
                                if let Some((dst, src)) = pair_mut(&mut slots, a, b) {
                                    let released = !dst.is_empty();
                                    let moved = !src.is_empty();
                                    dst.assign(src);
                                    prop_assert!(src.is_empty());
                                    if released {
                                        owned -= 1;
                                    }
                                    prop_assert_eq!(dst.is_empty(), !moved);
                                }
                            }
                            MoveOp::Take(a, b) => {
                                if let Some((dst, src)) = pair_mut(&mut slots, a, b) {
                                    if !dst.is_empty() {
                                        owned -= 1;
                                    }
                                    *dst = src.take();
                                    prop_assert!(src.is_empty());
                                }
                            }
                            MoveOp::Reset(a) => {
                                if !slots[a].is_empty() {
                                    owned -= 1;
                                }
                                slots[a].reset();
                            }
                        }

                        let non_empty = slots.iter().filter(|s| !s.is_empty()).count();
                        prop_assert_eq!(non_empty, owned);
                        let destroyed = if $eager { created - owned } else { 0 };
                        prop_assert_eq!(hits.load(Ordering::SeqCst), destroyed);
                    }
                }
                let before_teardown = if $eager { created } else { 0 };
                prop_assert_eq!(hits.load(Ordering::SeqCst), before_teardown);
                prop_assert_eq!(arena.live(), 0);

                drop(arena);
                prop_assert_eq!(hits.load(Ordering::SeqCst), created);
            }
        }
    };
}

exclusive_moves!(unique_moves_invalidate_source, Unique, destroys_on_release: true);
exclusive_moves!(own_moves_invalidate_source, Own, destroys_on_release: true);
exclusive_moves!(discard_moves_invalidate_source, Discard, destroys_on_release: true);
exclusive_moves!(collect_moves_defer_to_teardown, Collect, destroys_on_release: false);

proptest! {
    /// Strong count equals live strong handles; the value is destroyed
    /// exactly once, when the last one goes.
    #[test]
    fn strong_count_tracks_copies(ops in prop::collection::vec(shared_op(), 0..64)) {
        let hits = Arc::new(AtomicUsize::new(0));
        let arena = strict_arena("prop-strong");
        {
            let mut strongs: Vec<Strong<'_, Tracked>> = vec![Strong::new_in(Tracked(hits.clone()), &arena)];
            let mut weaks: Vec<Weak<'_, Tracked>> = Vec::new();

            for op in ops {
                match op {
                    SharedOp::Clone(i) => {
                        if let Some(s) = strongs.get(i % strongs.len().max(1)) {
                            let copy = s.clone();
                            strongs.push(copy);
                        }
                    }
                    SharedOp::Reset(i) => {
                        if !strongs.is_empty() {
                            let idx = i % strongs.len();
                            strongs.swap_remove(idx);
                        }
                    }
                    SharedOp::Downgrade(i) => {
                        if let Some(s) = strongs.get(i % strongs.len().max(1)) {
                            weaks.push(s.downgrade());
                        }
                    }
                    SharedOp::Upgrade(i) => {
                        if let Some(w) = weaks.get(i % weaks.len().max(1)) {
                            let upgraded = w.upgrade();
                            prop_assert_eq!(upgraded.is_some(), !strongs.is_empty());
                            if let Some(s) = upgraded {
                                strongs.push(s);
                            }
                        }
                    }
                    SharedOp::DropWeak(i) => {
                        if !weaks.is_empty() {
                            let idx = i % weaks.len();
                            weaks.swap_remove(idx);
                        }
                    }
                }

                let live = strongs.len();
                for s in &strongs {
                    prop_assert_eq!(s.strong_count(), live);
                    prop_assert_eq!(s.weak_count(), weaks.len());
                }
                for w in &weaks {
                    prop_assert_eq!(w.strong_count(), live);
                }
                let expected_drops = if live == 0 { 1 } else { 0 };
                prop_assert_eq!(hits.load(Ordering::SeqCst), expected_drops);
            }
        }
        prop_assert_eq!(hits.load(Ordering::SeqCst), 1);
        prop_assert_eq!(arena.live(), 0);
    }

    /// Arena allocations honor alignment and never overlap.
    #[test]
    fn arena_allocations_aligned_and_disjoint(
        requests in prop::collection::vec((1usize..300, 0u32..7), 1..64)
    ) {
        let arena = Arena::with_config(
            "prop-bump",
            ArenaConfig { chunk_size: 512, max_size: 0, leak_policy: LeakPolicy::Ignore },
        );
        let mut ranges = Vec::new();
        for (size, align_pow) in requests {
            let layout = Layout::from_size_align(size, 1 << align_pow).unwrap();
            let ptr = arena.allocate(layout, None).unwrap();
            let start = ptr.as_ptr() as usize;
            prop_assert_eq!(start % layout.align(), 0);
            ranges.push((start, start + size));
        }
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].0);
        }
    }

    /// Collected values are destroyed in reverse order of construction.
    #[test]
    fn collect_destroys_in_reverse(count in 0usize..40) {
        struct Ordered(usize, Arc<Mutex<Vec<usize>>>);
        impl Drop for Ordered {
            fn drop(&mut self) {
                self.1.lock().push(self.0);
            }
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        let arena = strict_arena("prop-collect");
        for i in 0..count {
            let handle = Collect::new_in(Ordered(i, order.clone()), &arena);
            drop(handle);
        }
        let report = arena.teardown();

        let expected: Vec<usize> = (0..count).rev().collect();
        prop_assert_eq!(&*order.lock(), &expected);
        prop_assert_eq!(report.destroyed, count);
        prop_assert!(report.chunks_released <= count);
    }

    /// Containment accepts exactly the sub-ranges of the container.
    #[test]
    fn containment_matches_ranges(offset in 0usize..64) {
        let buffer = [0u8; 32];
        let base = buffer.as_ptr();
        let sub = base.wrapping_add(offset) as *const [u8; 4];
        prop_assert_eq!(contains(&buffer as *const [u8; 32], sub), offset + 4 <= 32);
    }

    /// Unique round trips through Own keep the value.
    #[test]
    fn unique_own_round_trip(value in any::<u64>()) {
        let arena = strict_arena("prop-round-trip");
        let own = Unique::new_in(value, &arena).into_own();
        prop_assert_eq!(own.qualifier(), tether_runtime::Qualifier::Own);
        let unique = own.into_unique();
        prop_assert_eq!(*unique, value);
        drop(unique);
        prop_assert_eq!(arena.live(), 0);
    }
}
