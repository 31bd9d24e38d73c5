//! Cross-container scenario tests.
//!
//! The per-module tests cover each component in isolation; these exercise the properties that
//! hold across the whole family — handle stability, stamp monotony, and behavior under actual
//! multi-threaded load.

use std::sync::Arc;
use std::thread;

use element::{ElementContainer, ValueFind};
use hash::HashSet;
use list::TreeList;
use lock::LockStrategy;
use sorted::{TreeMap, TreeSet};

/// Invariant: a handle either resolves to its original value, or reports absence — never a
/// third thing — across arbitrary unrelated churn.
#[test]
fn handles_resolve_or_report_absence() {
    let list = TreeList::new();
    let mut live = Vec::new();
    for i in 0..100u32 {
        live.push((list.add_last(i), i));
    }
    // Churn: drop every third element, add some more.
    let mut dropped = Vec::new();
    for chunk in live.chunks(3) {
        if let Some(&(id, value)) = chunk.get(2) {
            list.remove_element(id).unwrap();
            dropped.push((id, value));
        }
    }
    for i in 100..150u32 {
        live.push((list.add_last(i), i));
    }
    for &(id, value) in &live {
        if list.is_present(id) {
            assert_eq!(list.get_cloned(id).unwrap(), value);
        }
    }
    for &(id, _) in &dropped {
        assert!(!list.is_present(id));
        assert!(list.get_cloned(id).is_err());
    }
    // Size equals the number of distinct present handles.
    let present = live.iter().filter(|&&(id, _)| list.is_present(id)).count();
    assert_eq!(list.len(), present);
}

/// Invariant: both stamps are monotone; every write moves the general stamp, structural writes
/// move both.
#[test]
fn stamps_are_monotone_over_mixed_operations() {
    let set = TreeSet::new();
    let mut last_any = set.stamp(false);
    let mut last_structural = set.stamp(true);
    let mut check = |set: &TreeSet<u32>, structural_expected: bool| {
        let any = set.stamp(false);
        let structural = set.stamp(true);
        assert!(any > last_any);
        if structural_expected {
            assert!(structural > last_structural);
        } else {
            assert_eq!(structural, last_structural);
        }
        last_any = any;
        last_structural = structural;
    };

    let id = set.add(10).unwrap();
    check(&set, true);
    set.add(20).unwrap();
    check(&set, true);
    set.set_value(id, 15).unwrap();
    check(&set, false);
    set.remove_element(id).unwrap();
    check(&set, true);
    set.clear();
    check(&set, true);
}

/// Round trip: add-then-remove restores the observable container.
#[test]
fn add_remove_round_trip() {
    let set = HashSet::new();
    set.add(1u32).unwrap();
    set.add(2).unwrap();
    let before = set.values();
    let len = set.len();

    let id = set.add(99).unwrap();
    assert_eq!(set.remove_element(id).unwrap(), 99);

    assert_eq!(set.len(), len);
    assert_eq!(set.values(), before);
    assert!(!set.is_present(id));
    assert!(set.element_of(&99).is_none());
}

/// The spam test, in the chashmap manner: many threads adding disjoint ranges concurrently.
#[test]
fn spam_hash_adds() {
    let set = Arc::new(HashSet::new());
    let mut joins = Vec::new();

    for t in 0..10u64 {
        let set = set.clone();
        joins.push(thread::spawn(move || {
            for i in t * 1000..(t + 1) * 1000 {
                set.add(i).unwrap();
            }
        }));
    }
    for join in joins.drain(..) {
        join.join().unwrap();
    }

    assert_eq!(set.len(), 10_000);
    assert_eq!(set.stamp(true), 10_000);
    for t in 0..5u64 {
        let set = set.clone();
        joins.push(thread::spawn(move || {
            for i in t * 2000..(t + 1) * 2000 {
                assert!(set.contains(&i));
            }
        }));
    }
    for join in joins {
        join.join().unwrap();
    }
}

/// Concurrent get-or-add on the same values: every thread sees the same handles.
#[test]
fn spam_get_or_add_converges() {
    let set = Arc::new(HashSet::new());
    let mut joins = Vec::new();
    for _ in 0..8 {
        let set = set.clone();
        joins.push(thread::spawn(move || {
            let mut ids = Vec::new();
            for i in 0..500u64 {
                ids.push(set.get_or_add(i, None, None, false).unwrap().0);
            }
            ids
        }));
    }
    let all: Vec<_> = joins.into_iter().map(|join| join.join().unwrap()).collect();
    assert_eq!(set.len(), 500);
    for ids in &all {
        assert_eq!(*ids, all[0]);
    }
}

/// Concurrent list appends interleave without losing elements.
#[test]
fn spam_list_appends() {
    let list = Arc::new(TreeList::new());
    let mut joins = Vec::new();
    for t in 0..8u32 {
        let list = list.clone();
        joins.push(thread::spawn(move || {
            for i in 0..500u32 {
                list.add_last(t * 1000 + i);
            }
        }));
    }
    for join in joins {
        join.join().unwrap();
    }
    assert_eq!(list.len(), 4000);
    // Each thread's own elements appear in its order.
    let values = list.values();
    for t in 0..8u32 {
        let mine: Vec<u32> = values.iter().cloned().filter(|v| v / 1000 == t).collect();
        assert_eq!(mine, (0..500).map(|i| t * 1000 + i).collect::<Vec<_>>());
    }
}

/// A whole-container sweep under one read transaction sees a consistent snapshot even while
/// writers queue up.
#[test]
fn cursor_sweep_under_a_read_transaction() {
    let list = Arc::new(TreeList::<u32>::build().locking(LockStrategy::Stamped).build());
    for i in 0..100u32 {
        list.add_last(i);
    }
    let writer_list = list.clone();
    let writer = thread::spawn(move || {
        for i in 100..200u32 {
            writer_list.add_last(i);
        }
    });
    let seen = list.locker().read(false, || {
        let mut cursor = list.cursor();
        let mut seen = Vec::new();
        cursor.for_each(true, |id| seen.push(list.get_cloned(id).unwrap())).unwrap();
        seen
    });
    writer.join().unwrap();
    // The sweep saw a prefix of the final list: a consistent cut, no tearing.
    assert!(seen.len() >= 100);
    assert_eq!(seen, (0..seen.len() as u32).collect::<Vec<_>>());
    assert_eq!(list.len(), 200);
}

/// Handles from one container are meaningless — and fatal — in another.
#[test]
fn containers_do_not_share_handles() {
    let a = TreeList::new();
    let b = TreeList::new();
    let id_a = a.add_last(1);
    let id_b = b.add_last(1);
    assert!(id_a != id_b);
    assert!(!b.is_present(id_a));
    let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
        b.get_cloned(id_a)
    }));
    assert!(result.is_err());
}

/// The map and set agree on the element-facet protocol.
#[test]
fn facets_work_across_container_kinds() {
    let map = TreeMap::new();
    let (id, _) = map.put("k", 1u32).unwrap();
    let element = map.mutable_element(id);
    assert_eq!(element.can_remove().unwrap(), None);
    assert_eq!(element.set(2).unwrap(), 1);
    assert_eq!(element.get().unwrap(), 2);
    assert_eq!(element.remove().unwrap(), 2);
    assert!(!element.is_present());

    let set = HashSet::new();
    let id = set.add(5u32).unwrap();
    let element = set.element(id);
    assert_eq!(element.get().unwrap(), 5);
}

/// Collecting into a container and consuming it back preserves each one's order.
#[test]
fn from_iter_and_into_iter_round_trip() {
    let list: TreeList<u32> = vec![3, 1, 2].into_iter().collect();
    assert_eq!(list.into_iter().collect::<Vec<_>>(), vec![3, 1, 2]);

    let set: HashSet<u32> = vec![3, 1, 2, 1].into_iter().collect();
    assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![3, 1, 2]);

    let sorted: TreeSet<u32> = vec![3, 1, 2].into_iter().collect();
    assert_eq!(sorted.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);

    let map: TreeMap<u32, char> = vec![(2, 'b'), (1, 'a')].into_iter().collect();
    assert_eq!(map.into_iter().collect::<Vec<_>>(), vec![(1, 'a'), (2, 'b')]);
}

/// The none-strategy containers still keep stamps and handles honest, single-threaded.
#[test]
fn unlocked_containers_work_single_threaded() {
    let list = TreeList::<i32>::build().locking(LockStrategy::None).build();
    let id = list.add_last(1);
    list.add_last(2);
    assert_eq!(list.stamp(true), 2);
    list.set_value(id, 10).unwrap();
    assert_eq!(list.stamp(false), 3);
    assert_eq!(list.values(), vec![10, 2]);
}
