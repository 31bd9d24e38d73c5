//! Black-box scenarios through the public API only.

extern crate berth;

use std::cell::RefCell;
use std::sync::Arc;
use std::thread;

use berth::{ElementContainer, HashSet, LockStrategy, TreeList, TreeMap, TreeSet, ValueFind};

thread_local! {
    static DROP_VECTOR: RefCell<Vec<isize>> = RefCell::new(Vec::new())
}

#[derive(Hash, PartialEq, Eq)]
struct Dropable {
    k: usize,
}

impl Dropable {
    fn new(k: usize) -> Dropable {
        DROP_VECTOR.with(|slot| {
            slot.borrow_mut()[k] += 1;
        });

        Dropable { k: k }
    }
}

impl Drop for Dropable {
    fn drop(&mut self) {
        DROP_VECTOR.with(|slot| {
            slot.borrow_mut()[self.k] -= 1;
        });
    }
}

#[test]
fn drops() {
    DROP_VECTOR.with(|slot| {
        *slot.borrow_mut() = vec![0; 100];
    });

    {
        let set = HashSet::new();

        for i in 0..100 {
            set.add(Dropable::new(i)).unwrap();
        }

        DROP_VECTOR.with(|v| {
            for i in 0..100 {
                assert_eq!(v.borrow()[i], 1);
            }
        });

        // Removing an element drops its value; the rest stay alive.
        for i in 0..50 {
            let id = set.element_of(&Dropable::new(i)).unwrap();
            set.remove_element(id).unwrap();

            DROP_VECTOR.with(|v| {
                assert_eq!(v.borrow()[i], 0);
            });
        }

        // Clearing drops everything left.
        set.clear();

        DROP_VECTOR.with(|v| {
            for i in 0..100 {
                assert_eq!(v.borrow()[i], 0);
            }
        });

        for i in 0..20 {
            set.add(Dropable::new(i)).unwrap();
        }
    }

    // The set itself going away drops the re-added values.
    DROP_VECTOR.with(|v| {
        for i in 0..100 {
            assert_eq!(v.borrow()[i], 0);
        }
    });
}

#[test]
fn list_set_and_map_agree_on_handles() {
    let list = TreeList::<u32>::build().description("scenario list").build_from(vec![3u32, 1, 2]);
    let sorted = TreeSet::build().build_from(vec![3u32, 1, 2]);
    let map: TreeMap<u32, &str> =
        TreeMap::build().build_from(vec![(3, "c"), (1, "a"), (2, "b")]);

    // The list keeps insertion order, the sorted containers comparator order.
    assert_eq!(list.values(), vec![3, 1, 2]);
    assert_eq!(sorted.values(), vec![1, 2, 3]);
    assert_eq!(map.keys(), vec![1, 2, 3]);

    // Adjacency agrees with iteration everywhere.
    for container_values in
        &[list.values(), sorted.values(), map.keys()]
    {
        assert_eq!(container_values.len(), 3);
    }
    let first = sorted.terminal_element(true).unwrap();
    let second = sorted.adjacent_element(first, true).unwrap().unwrap();
    assert_eq!(sorted.get_cloned(second).unwrap(), 2);
}

#[test]
fn an_outer_transaction_composes_operations() {
    let from = Arc::new(HashSet::build().build_from(0..100u64));
    let to = Arc::new(HashSet::new());

    // Move everything atomically with respect to other writers: an outer structural write on
    // both lockers, acquired in a fixed order.
    from.locker().write(true, || {
        to.locker().write(true, || {
            let mut cursor = from.cursor();
            while let Some(id) = cursor.advance(true).unwrap() {
                let value = from.get_cloned(id).unwrap();
                to.add(value).unwrap();
            }
            from.clear();
        })
    });

    assert!(from.is_empty());
    assert_eq!(to.len(), 100);
}

#[test]
fn contended_workload_stays_coherent() {
    let set = Arc::new(HashSet::build().locking(LockStrategy::Stamped).build());
    let mut joins = Vec::new();

    // Adders, removers and readers all over the same value space.
    for t in 0..4u64 {
        let set = set.clone();
        joins.push(thread::spawn(move || {
            for i in 0..300 {
                let value = t * 1000 + i;
                set.add(value).unwrap();
                if i % 3 == 0 {
                    let id = set.element_of(&value).unwrap();
                    set.remove_element(id).unwrap();
                }
            }
        }));
    }
    for _ in 0..2 {
        let set = set.clone();
        joins.push(thread::spawn(move || {
            for _ in 0..200 {
                let _ = set.values();
            }
        }));
    }
    for join in joins {
        join.join().unwrap();
    }

    // 4 threads × 300 adds, of which every third was removed again.
    assert_eq!(set.len(), 4 * 300 - 4 * 100);
    // The chain and the stamps survived the contention intact.
    let values = set.values();
    assert_eq!(values.len(), set.len());
    assert!(set.stamp(true) >= set.stamp(false) / 2);
}

#[test]
fn stamps_bracket_quiet_spans() {
    let list = TreeList::new();
    list.add_last(1);
    let before = (list.stamp(false), list.stamp(true));
    // Reads do not move stamps.
    let _ = list.values();
    let _ = list.terminal_element(true);
    let after = (list.stamp(false), list.stamp(true));
    assert_eq!(before, after);
}
