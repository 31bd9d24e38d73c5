//! The tree list.
//!
//! `TreeList` is an ordered sequence over the red-black forest: positional lookups in both
//! directions (`element_at`, `elements_before`) are O(log n) through the cached subtree sizes,
//! and insertion is anchored — a new value goes first, last, adjacent to an element, or between
//! two elements — rather than indexed, so concurrent writers do not race over shifting indices.
//!
//! Every operation takes `&self`; the list's locker arbitrates access. Structural operations
//! (add, remove, clear) take the structural write lock and bump the structural stamp; `set`
//! replaces a value in place under the update write lock.

use std::cell::UnsafeCell;
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{self, AtomicUsize};

use slog::Logger;

use element::{self, ElementContainer, ElementId, Error, Refusal, ValueFind};
use lock::Locker;
use node::{Forest, NIL};

/// The atomic ordering used throughout the code.
const ORDERING: atomic::Ordering = atomic::Ordering::SeqCst;

/// The lock-guarded interior.
struct ListCore<T> {
    /// The nodes.
    forest: Forest<T>,
    /// The root of the one tree.
    root: u32,
}

/// An ordered sequence with stable element handles.
///
/// ```rust
/// use berth::TreeList;
///
/// let list = TreeList::new();
/// let b = list.add_last(2);
/// list.add_last(3);
/// list.add_between(None, Some(b), true, 1).unwrap();
/// assert_eq!(list.values(), vec![1, 2, 3]);
/// ```
pub struct TreeList<T> {
    /// The interior, guarded by `locker`.
    inner: UnsafeCell<ListCore<T>>,
    /// The lock.
    locker: Locker,
    /// This container's identity, branded onto its element ids.
    id: u64,
    /// The element count, readable without a lock.
    len: AtomicUsize,
    /// The log exitpoint.
    log: Logger,
}

unsafe impl<T: Send> Send for TreeList<T> {}
unsafe impl<T: Send + Sync> Sync for TreeList<T> {}

impl<T> TreeList<T> {
    /// Create an empty list with the default (stamped) locking strategy.
    pub fn new() -> TreeList<T> {
        TreeList::<T>::build().build()
    }

    /// A builder for a configured list.
    pub fn build() -> ::builder::ListBuilder {
        ::builder::ListBuilder::new()
    }

    /// Assemble a list from builder parts.
    pub(crate) fn with_options(locker: Locker, log: Logger) -> TreeList<T> {
        TreeList {
            inner: UnsafeCell::new(ListCore { forest: Forest::new(), root: NIL }),
            locker: locker,
            id: element::next_container_id(),
            len: AtomicUsize::new(0),
            log: log,
        }
    }

    /// The interior. Caller must hold at least the matching read lock.
    fn core(&self) -> &ListCore<T> {
        unsafe { &*self.inner.get() }
    }

    /// The interior, mutably. Caller must hold the matching write lock.
    fn core_mut(&self) -> &mut ListCore<T> {
        unsafe { &mut *self.inner.get() }
    }

    /// The list's locker, for callers composing multi-operation transactions.
    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    /// Brand an element id for a slot.
    fn make_id(&self, core: &ListCore<T>, slot: u32) -> ElementId {
        ElementId {
            source: self.id,
            slot: slot,
            gen: core.forest.gen_of(slot),
            seq: core.forest.node(slot).seq,
        }
    }

    /// Panic on a foreign id; that is a caller bug, not a recoverable condition.
    fn check_source(&self, id: ElementId) {
        assert!(id.source == self.id, "element id from a different collection");
    }

    /// Resolve an id of this list to its slot, or `not found` once removed.
    fn resolve(&self, core: &ListCore<T>, id: ElementId) -> Result<u32, Error> {
        self.check_source(id);
        if core.forest.contains(id.slot, id.gen) {
            Ok(id.slot)
        } else {
            Err(Error::refused(Refusal::NotFound))
        }
    }

    /// Append a value, returning its handle.
    pub fn add_last(&self, value: T) -> ElementId {
        self.locker.write(true, || {
            let core = self.core_mut();
            let slot = core.forest.alloc(value);
            let anchor = core.forest.last(core.root);
            core.forest.attach(&mut core.root, anchor, false, slot);
            self.len.fetch_add(1, ORDERING);
            self.locker.bump(true);
            self.make_id(self.core(), slot)
        })
    }

    /// Prepend a value, returning its handle.
    pub fn add_first(&self, value: T) -> ElementId {
        self.locker.write(true, || {
            let core = self.core_mut();
            let slot = core.forest.alloc(value);
            let anchor = core.forest.first(core.root);
            core.forest.attach(&mut core.root, anchor, true, slot);
            self.len.fetch_add(1, ORDERING);
            self.locker.bump(true);
            self.make_id(self.core(), slot)
        })
    }

    /// Add a value between two anchors.
    ///
    /// With both anchors given (`after` must precede `before`), the value lands between them:
    /// right after `after` when `prefer_first`, right before `before` otherwise. A missing
    /// anchor unconstrains that side, so `prefer_first` pulls the value toward the front of the
    /// list and `!prefer_first` toward the back.
    pub fn add_between(&self,
                       after: Option<ElementId>,
                       before: Option<ElementId>,
                       prefer_first: bool,
                       value: T)
                       -> Result<ElementId, Error> {
        self.locker.write(true, || {
            let core = self.core_mut();
            let after_slot = match after {
                Some(id) => Some(self.resolve(core, id)?),
                None => None,
            };
            let before_slot = match before {
                Some(id) => Some(self.resolve(core, id)?),
                None => None,
            };
            if let (Some(a), Some(b)) = (after_slot, before_slot) {
                assert!(core.forest.rank(a) < core.forest.rank(b), "anchors out of order");
            }
            let (anchor, ins_before) = if prefer_first {
                match after_slot {
                    Some(a) => (a, false),
                    None => (core.forest.first(core.root), true),
                }
            } else {
                match before_slot {
                    Some(b) => (b, true),
                    None => (core.forest.last(core.root), false),
                }
            };
            let slot = core.forest.alloc(value);
            core.forest.attach(&mut core.root, anchor, ins_before, slot);
            self.len.fetch_add(1, ORDERING);
            self.locker.bump(true);
            Ok(self.make_id(self.core(), slot))
        })
    }

    /// The handle of the element at `index`, if in bounds.
    pub fn element_at(&self, index: usize) -> Option<ElementId> {
        self.locker.read(true, || {
            let core = self.core();
            let slot = core.forest.select(core.root, index);
            if slot == NIL { None } else { Some(self.make_id(core, slot)) }
        })
    }

    /// The number of elements before this one; its current index.
    pub fn elements_before(&self, id: ElementId) -> Result<usize, Error> {
        self.locker.read(true, || {
            let core = self.core();
            let slot = self.resolve(core, id)?;
            Ok(core.forest.rank(slot))
        })
    }

    /// The number of elements after this one.
    pub fn elements_after(&self, id: ElementId) -> Result<usize, Error> {
        self.locker.read(true, || {
            let core = self.core();
            let slot = self.resolve(core, id)?;
            Ok(core.forest.total(core.root) - core.forest.rank(slot) - 1)
        })
    }

    /// A snapshot of the values in order.
    pub fn values(&self) -> Vec<T>
        where T: Clone
    {
        let mut out = Vec::with_capacity(self.len());
        self.for_each(|value| out.push(value.clone()));
        out
    }

    /// Visit every element in order under one read transaction.
    pub fn for_each<F: FnMut(&T)>(&self, mut f: F) {
        self.for_each_element(|_, value| f(value));
    }

    /// Visit every element and its handle in order under one read transaction.
    pub fn for_each_element<F: FnMut(ElementId, &T)>(&self, mut f: F) {
        self.locker.read(false, || {
            let core = self.core();
            let mut slot = core.forest.first(core.root);
            while slot != NIL {
                f(self.make_id(core, slot), &core.forest.node(slot).value);
                slot = core.forest.successor(slot);
            }
        })
    }
}

impl<T> ElementContainer for TreeList<T> {
    type Value = T;

    fn len(&self) -> usize {
        self.len.load(ORDERING)
    }

    fn is_present(&self, id: ElementId) -> bool {
        if id.source != self.id {
            return false;
        }
        self.locker.read(true, || self.core().forest.contains(id.slot, id.gen))
    }

    fn compare_elements(&self, a: ElementId, b: ElementId) -> Ordering {
        self.check_source(a);
        self.check_source(b);
        if a == b {
            return Ordering::Equal;
        }
        self.locker.read(true, || {
            let core = self.core();
            if core.forest.contains(a.slot, a.gen) && core.forest.contains(b.slot, b.gen) {
                core.forest.rank(a.slot).cmp(&core.forest.rank(b.slot))
            } else {
                // One of them is gone; the stable creation order is all that is left.
                a.seq.cmp(&b.seq)
            }
        })
    }

    fn terminal_element(&self, first: bool) -> Option<ElementId> {
        self.locker.read(true, || {
            let core = self.core();
            let slot = if first {
                core.forest.first(core.root)
            } else {
                core.forest.last(core.root)
            };
            if slot == NIL { None } else { Some(self.make_id(core, slot)) }
        })
    }

    fn adjacent_element(&self, id: ElementId, next: bool) -> Result<Option<ElementId>, Error> {
        self.locker.read(true, || {
            let core = self.core();
            let slot = self.resolve(core, id)?;
            let adjacent = if next {
                core.forest.successor(slot)
            } else {
                core.forest.predecessor(slot)
            };
            Ok(if adjacent == NIL { None } else { Some(self.make_id(core, adjacent)) })
        })
    }

    fn get_with<R, F>(&self, id: ElementId, f: F) -> Result<R, Error>
        where F: FnOnce(&T) -> R
    {
        self.locker.read(false, || {
            let core = self.core();
            let slot = self.resolve(core, id)?;
            Ok(f(&core.forest.node(slot).value))
        })
    }

    fn can_remove(&self, id: ElementId) -> Result<Option<Refusal>, Error> {
        self.locker.read(true, || {
            let core = self.core();
            self.check_source(id);
            Ok(if core.forest.contains(id.slot, id.gen) {
                None
            } else {
                Some(Refusal::NotFound)
            })
        })
    }

    fn is_acceptable(&self, id: ElementId, _value: &T) -> Result<Option<Refusal>, Error> {
        // A plain list holds anything anywhere.
        self.can_remove(id)
    }

    fn can_add(&self, id: ElementId, _value: &T, _before: bool) -> Result<Option<Refusal>, Error> {
        self.can_remove(id)
    }

    fn set_value(&self, id: ElementId, value: T) -> Result<T, Error> {
        self.locker.write(false, || {
            let core = self.core_mut();
            let slot = self.resolve(core, id)?;
            let old = ::std::mem::replace(core.forest.value_mut(slot), value);
            self.locker.bump(false);
            Ok(old)
        })
    }

    fn remove_element(&self, id: ElementId) -> Result<T, Error> {
        self.locker.write(true, || {
            let core = self.core_mut();
            let slot = self.resolve(core, id)?;
            core.forest.detach(&mut core.root, slot);
            let value = core.forest.release(slot);
            self.len.fetch_sub(1, ORDERING);
            self.locker.bump(true);
            Ok(value)
        })
    }

    fn add_adjacent(&self, id: ElementId, value: T, before: bool) -> Result<ElementId, Error> {
        self.locker.write(true, || {
            let core = self.core_mut();
            let anchor = self.resolve(core, id)?;
            let slot = core.forest.alloc(value);
            core.forest.attach(&mut core.root, anchor, before, slot);
            self.len.fetch_add(1, ORDERING);
            self.locker.bump(true);
            Ok(self.make_id(self.core(), slot))
        })
    }

    fn clear(&self) {
        self.locker.write(true, || {
            let len = self.len.load(ORDERING);
            let core = self.core_mut();
            core.forest.release_all();
            core.root = NIL;
            self.len.store(0, ORDERING);
            if len > 0 {
                self.locker.bump(true);
            }
            trace!(self.log, "cleared"; "had" => len);
        })
    }

    fn stamp(&self, structural: bool) -> u64 {
        self.locker.stamp(structural)
    }

    fn split_point(&self, low: Option<ElementId>, high: Option<ElementId>) -> Option<ElementId> {
        self.locker.read(true, || {
            let core = self.core();
            let total = core.forest.total(core.root);
            if total == 0 {
                return None;
            }
            let low_rank = match low {
                Some(id) => self.resolve(core, id).ok().map(|slot| core.forest.rank(slot))?,
                None => 0,
            };
            let high_rank = match high {
                Some(id) => self.resolve(core, id).ok().map(|slot| core.forest.rank(slot))?,
                None => total - 1,
            };
            if high_rank < low_rank + 2 {
                // Nothing strictly between the bounds; not worth splitting.
                return None;
            }
            let mid = low_rank + (high_rank - low_rank) / 2;
            let slot = core.forest.select(core.root, mid);
            if slot == NIL { None } else { Some(self.make_id(core, slot)) }
        })
    }
}

impl<T: PartialEq> ValueFind for TreeList<T> {
    fn element_of(&self, value: &T) -> Option<ElementId> {
        self.locker.read(false, || {
            let core = self.core();
            let mut slot = core.forest.first(core.root);
            while slot != NIL {
                if core.forest.node(slot).value == *value {
                    return Some(self.make_id(core, slot));
                }
                slot = core.forest.successor(slot);
            }
            None
        })
    }
}

impl<T> Default for TreeList<T> {
    fn default() -> TreeList<T> {
        TreeList::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for TreeList<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut list = f.debug_list();
        self.for_each(|value| {
            list.entry(value);
        });
        list.finish()
    }
}

impl<T> ::std::iter::FromIterator<T> for TreeList<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> TreeList<T> {
        TreeList::<T>::build().build_from(iter)
    }
}

/// A consuming iterator over a list, in order.
pub struct IntoIter<T> {
    /// The torn-down interior.
    forest: Forest<T>,
    /// The slots in list order.
    order: ::std::vec::IntoIter<u32>,
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.order.next().map(|slot| self.forest.release(slot))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.order.size_hint()
    }
}

impl<T> IntoIterator for TreeList<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        // The list is owned now; the walk is snapshotted up front and the slots drained from
        // the slab one by one, no rebalancing needed.
        let core = self.inner.into_inner();
        let mut order = Vec::with_capacity(core.forest.total(core.root));
        let mut slot = core.forest.first(core.root);
        while slot != NIL {
            order.push(slot);
            slot = core.forest.successor(slot);
        }
        IntoIter { forest: core.forest, order: order.into_iter() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use element::ElementContainer;

    #[test]
    fn anchored_insertion() {
        let list = TreeList::new();
        let b = list.add_last(2);
        let d = list.add_last(4);
        list.add_first(0);
        list.add_between(Some(b), Some(d), true, 3).unwrap();
        list.add_between(None, Some(b), false, 1).unwrap();
        assert_eq!(list.values(), vec![0, 1, 2, 3, 4]);
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn positions_are_log_queries() {
        let list = TreeList::new();
        let mut ids = Vec::new();
        for i in 0..100 {
            ids.push(list.add_last(i));
        }
        for (index, id) in ids.iter().enumerate() {
            assert_eq!(list.elements_before(*id).unwrap(), index);
            assert_eq!(list.elements_after(*id).unwrap(), 99 - index);
            assert_eq!(list.element_at(index), Some(*id));
        }
        assert_eq!(list.element_at(100), None);
    }

    #[test]
    fn handles_survive_unrelated_mutation() {
        let list = TreeList::new();
        let a = list.add_last('a');
        let b = list.add_last('b');
        let c = list.add_last('c');
        assert_eq!(list.remove_element(b).unwrap(), 'b');
        assert!(!list.is_present(b));
        assert!(list.is_present(a));
        assert!(list.is_present(c));
        assert_eq!(list.get_cloned(a).unwrap(), 'a');
        assert_eq!(list.get_cloned(c).unwrap(), 'c');
        assert_eq!(list.get_cloned(b), Err(Error::refused(Refusal::NotFound)));
        assert_eq!(list.adjacent_element(a, true).unwrap(), Some(c));
        assert_eq!(list.adjacent_element(c, false).unwrap(), Some(a));
    }

    #[test]
    fn terminals_and_adjacency_edges() {
        let list: TreeList<u32> = TreeList::new();
        assert_eq!(list.terminal_element(true), None);
        assert_eq!(list.terminal_element(false), None);

        let only = list.add_last(1);
        assert_eq!(list.terminal_element(true), Some(only));
        assert_eq!(list.terminal_element(false), Some(only));
        assert_eq!(list.adjacent_element(only, true).unwrap(), None);
        assert_eq!(list.adjacent_element(only, false).unwrap(), None);
    }

    #[test]
    fn handle_order_matches_iteration_order() {
        let list = TreeList::new();
        let c = list.add_last(3);
        let a = list.add_first(1);
        let b = list.add_between(Some(a), Some(c), false, 2).unwrap();

        let mut seen = Vec::new();
        list.for_each_element(|id, _| seen.push(id));
        assert_eq!(seen, vec![a, b, c]);
        for window in seen.windows(2) {
            assert_eq!(list.compare_elements(window[0], window[1]), Ordering::Less);
            assert_eq!(list.compare_elements(window[1], window[0]), Ordering::Greater);
        }
        assert_eq!(list.compare_elements(a, a), Ordering::Equal);

        // Dead handles fall back to creation order.
        list.remove_element(b).unwrap();
        assert_eq!(list.compare_elements(b, c), Ordering::Greater);
    }

    #[test]
    fn stamps_track_write_kinds() {
        let list = TreeList::new();
        let s0 = list.stamp(true);
        let a0 = list.stamp(false);

        let id = list.add_last(5);
        assert_eq!(list.stamp(true), s0 + 1);
        assert_eq!(list.stamp(false), a0 + 1);

        list.set_value(id, 6).unwrap();
        assert_eq!(list.stamp(true), s0 + 1);
        assert_eq!(list.stamp(false), a0 + 2);

        list.remove_element(id).unwrap();
        assert_eq!(list.stamp(true), s0 + 2);
        assert_eq!(list.stamp(false), a0 + 3);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn mutable_element_facet() {
        let list = TreeList::new();
        let id = list.add_last(10);
        let element = list.mutable_element(id);
        assert_eq!(element.can_remove().unwrap(), None);
        assert_eq!(element.is_acceptable(&11).unwrap(), None);
        assert_eq!(element.set(11).unwrap(), 10);
        let after = element.add(12, false).unwrap();
        assert_eq!(list.values(), vec![11, 12]);
        assert_eq!(element.remove().unwrap(), 11);
        assert!(!element.is_present());
        assert_eq!(element.can_remove().unwrap(), Some(Refusal::NotFound));
        assert!(list.is_present(after));
    }

    #[test]
    fn value_find() {
        use element::ValueFind;
        let list = TreeList::new();
        list.add_last("a");
        let b = list.add_last("b");
        assert_eq!(list.element_of(&"b"), Some(b));
        assert_eq!(list.element_of(&"z"), None);
    }

    #[test]
    #[should_panic(expected = "different collection")]
    fn foreign_id_is_fatal() {
        let list: TreeList<i32> = TreeList::new();
        let other = TreeList::new();
        let id = other.add_last(1);
        let _ = list.get_cloned(id);
    }

    #[test]
    fn clear_kills_all_handles() {
        let list = TreeList::new();
        let a = list.add_last(1);
        let b = list.add_last(2);
        list.clear();
        assert_eq!(list.len(), 0);
        assert!(!list.is_present(a));
        assert!(!list.is_present(b));
        assert_eq!(list.values(), Vec::<i32>::new());
        // Fresh elements must not be confused with the dead ones.
        let c = list.add_last(3);
        assert!(list.is_present(c));
        assert!(!list.is_present(a));
    }
}
