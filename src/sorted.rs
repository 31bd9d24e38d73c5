//! The sorted containers.
//!
//! `TreeSet` keys the red-black tree directly by a comparator: the tree *is* the sort order, so
//! search and rank queries are O(log n) and iteration is ascending. `TreeMap` is the same tree
//! over key/value entries, keyed by the keys; entry handles expose both halves. Both are
//! distinct containers — an element comparing equal to an incumbent is refused with
//! `element exists`.
//!
//! Search goes through *comparables*: a closure answering how an element (or key) compares
//! against the caller's target, combined with a [`SearchFilter`] choosing which neighbor to
//! settle for when there is no exact match.
//!
//! `sub_set`/`sub_map` carve a live, bounded view out of a backing container: bounds are
//! themselves comparables, every search is clamped, and mutation outside the bounds is refused
//! with `illegal element`.
//!
//! Like the hash set, the sorted containers can be driven inconsistent by mutating the part of
//! a value the comparator reads. `set` refuses a replacement that would change the element's
//! position (re-sorting on update is deliberately not a thing); the explicit repair moves such
//! entries to where their current key sorts, with the usual listener protocol.

use std::cell::UnsafeCell;
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{self, AtomicUsize};

use slog::Logger;

use element::{self, ElementContainer, ElementId, Error, Refusal, RepairListener, ValueFind};
use lock::Locker;
use node::{Forest, NIL};

pub use node::SearchFilter;

/// The atomic ordering used throughout the code.
const ORDERING: atomic::Ordering = atomic::Ordering::SeqCst;

/// The lock-guarded interior of a set.
struct SortedCore<T> {
    /// The nodes, in comparator order.
    forest: Forest<T>,
    /// The root.
    root: u32,
}

/// A comparator-ordered set with stable element handles.
///
/// ```rust
/// use berth::{SearchFilter, TreeSet};
///
/// let set = TreeSet::new();
/// for value in &[30, 10, 20] {
///     set.add(*value).unwrap();
/// }
/// assert_eq!(set.values(), vec![10, 20, 30]);
/// let near = set.search(|value| value.cmp(&25), SearchFilter::PreferLess).unwrap();
/// assert_eq!(set.get_cloned(near).unwrap(), 20);
/// # use berth::ElementContainer;
/// ```
pub struct TreeSet<T> {
    /// The interior, guarded by `locker`.
    inner: UnsafeCell<SortedCore<T>>,
    /// The lock.
    locker: Locker,
    /// This container's identity, branded onto its element ids.
    id: u64,
    /// The element count, readable without a lock.
    len: AtomicUsize,
    /// The sort order.
    cmp: Box<Fn(&T, &T) -> Ordering + Send + Sync>,
    /// The log exitpoint.
    log: Logger,
}

unsafe impl<T: Send> Send for TreeSet<T> {}
unsafe impl<T: Send + Sync> Sync for TreeSet<T> {}

impl<T: Ord> TreeSet<T> {
    /// Create a set ordered by `Ord`, with the default (stamped) locking strategy.
    pub fn new() -> TreeSet<T> {
        TreeSet::build().build()
    }

    /// A builder ordering by `Ord`.
    pub fn build() -> ::builder::SetBuilder<T> {
        ::builder::SetBuilder::new()
    }
}

impl<T> TreeSet<T> {
    /// A builder with an explicit comparator, for value types without (or beyond) `Ord`.
    pub fn build_with_comparator<C>(cmp: C) -> ::builder::SetBuilder<T>
        where C: Fn(&T, &T) -> Ordering + Send + Sync + 'static
    {
        ::builder::SetBuilder::with_comparator(Box::new(cmp))
    }

    /// Assemble a set from builder parts.
    pub(crate) fn with_options(locker: Locker,
                               log: Logger,
                               cmp: Box<Fn(&T, &T) -> Ordering + Send + Sync>)
                               -> TreeSet<T> {
        TreeSet {
            inner: UnsafeCell::new(SortedCore { forest: Forest::new(), root: NIL }),
            locker: locker,
            id: element::next_container_id(),
            len: AtomicUsize::new(0),
            cmp: cmp,
            log: log,
        }
    }

    /// The interior. Caller must hold at least the matching read lock.
    fn core(&self) -> &SortedCore<T> {
        unsafe { &*self.inner.get() }
    }

    /// The interior, mutably. Caller must hold the matching write lock.
    fn core_mut(&self) -> &mut SortedCore<T> {
        unsafe { &mut *self.inner.get() }
    }

    /// The set's locker, for callers composing multi-operation transactions.
    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    /// Brand an element id for a slot.
    fn make_id(&self, core: &SortedCore<T>, slot: u32) -> ElementId {
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

    /// Resolve an id of this set to its slot, or `not found` once removed.
    fn resolve(&self, core: &SortedCore<T>, id: ElementId) -> Result<u32, Error> {
        self.check_source(id);
        if core.forest.contains(id.slot, id.gen) {
            Ok(id.slot)
        } else {
            Err(Error::refused(Refusal::NotFound))
        }
    }

    /// Add a value at its comparator position, or report `element exists`.
    pub fn add(&self, value: T) -> Result<ElementId, Error> {
        match self.get_or_add(value)? {
            (id, true) => Ok(id),
            (_, false) => Err(Error::refused(Refusal::ElementExists)),
        }
    }

    /// Find the element comparing equal to `value`, or add the value.
    ///
    /// Answers the element and whether it was added; on a hit the candidate is dropped.
    pub fn get_or_add(&self, value: T) -> Result<(ElementId, bool), Error> {
        self.get_or_add_with(value, |_| None, |_| ())
    }

    /// [`TreeSet::get_or_add`] with hooks: `pre_add` may veto the addition with a refusal,
    /// `post_add` runs with the new handle only when an addition happened.
    pub fn get_or_add_with<Pre, Post>(&self,
                                      value: T,
                                      pre_add: Pre,
                                      post_add: Post)
                                      -> Result<(ElementId, bool), Error>
        where Pre: FnOnce(&T) -> Option<Refusal>,
              Post: FnOnce(ElementId)
    {
        self.locker.write(true, || {
            let core = self.core_mut();
            let anchor = core.forest
                .find_closest(core.root,
                              |element| (self.cmp)(element, &value),
                              SearchFilter::PreferLess,
                              &|| true);
            let (anchor, before) = match anchor {
                None => (NIL, false),
                Some(near) => {
                    match (self.cmp)(core.forest.value(near), &value) {
                        Ordering::Equal => return Ok((self.make_id(core, near), false)),
                        Ordering::Less => (near, false),
                        Ordering::Greater => (near, true),
                    }
                }
            };
            if let Some(reason) = pre_add(&value) {
                return Err(Error::refused(reason));
            }
            let slot = core.forest.alloc(value);
            core.forest.attach(&mut core.root, anchor, before, slot);
            self.len.fetch_add(1, ORDERING);
            self.locker.bump(true);
            let id = self.make_id(self.core(), slot);
            post_add(id);
            Ok((id, true))
        })
    }

    /// Search by a comparable.
    ///
    /// `cmp(element)` answers `element.cmp(&target)`; the filter picks the neighbor to settle
    /// for when no element compares equal.
    pub fn search<F>(&self, cmp: F, filter: SearchFilter) -> Option<ElementId>
        where F: FnMut(&T) -> Ordering
    {
        self.locker.read(false, || {
            let core = self.core();
            core.forest
                .find_closest(core.root, cmp, filter, &|| true)
                .map(|slot| self.make_id(core, slot))
        })
    }

    /// The index of the comparable's match, or `-(insertion index + 1)` when absent.
    pub fn index_of<F>(&self, cmp: F) -> isize
        where F: FnMut(&T) -> Ordering
    {
        self.locker.read(false, || {
            let core = self.core();
            core.forest.index_of(core.root, cmp)
        })
    }

    /// Is an element comparing equal to `value` present?
    pub fn contains(&self, value: &T) -> bool {
        self.search(|element| (self.cmp)(element, value), SearchFilter::OnlyMatch)
            .is_some()
    }

    /// Is the element still where its current value sorts?
    pub fn is_consistent(&self, id: ElementId) -> Result<bool, Error> {
        self.locker.read(false, || {
            let core = self.core();
            let slot = self.resolve(core, id)?;
            Ok(self.slot_consistent(core, slot))
        })
    }

    /// Does any element sit out of order? `true` means at least one inconsistency exists.
    pub fn check_consistency(&self) -> bool {
        self.locker.read(false, || {
            let core = self.core();
            let mut slot = core.forest.first(core.root);
            while slot != NIL {
                if !self.slot_consistent(core, slot) {
                    return true;
                }
                slot = core.forest.successor(slot);
            }
            false
        })
    }

    /// Is the slot strictly between its neighbors?
    fn slot_consistent(&self, core: &SortedCore<T>, slot: u32) -> bool {
        let value = core.forest.value(slot);
        let prev = core.forest.predecessor(slot);
        if prev != NIL && (self.cmp)(core.forest.value(prev), value) != Ordering::Less {
            return false;
        }
        let next = core.forest.successor(slot);
        if next != NIL && (self.cmp)(value, core.forest.value(next)) != Ordering::Less {
            return false;
        }
        true
    }

    /// Move one element to where its current value sorts, if out of place.
    ///
    /// Answers whether anything was done. An equal-comparing incumbent at the target position
    /// is removed (`removed`, then `disposed`); otherwise the move is bracketed by
    /// `pre_transfer`/`post_transfer`.
    pub fn repair_element<L>(&self, id: ElementId, listener: &mut L) -> Result<bool, Error>
        where L: RepairListener<T>
    {
        self.locker.write(true, || {
            let slot = self.resolve(self.core(), id)?;
            Ok(self.repair_slot(slot, listener))
        })
    }

    /// Move every out-of-place element, as [`TreeSet::repair_element`] does for one.
    pub fn repair<L>(&self, listener: &mut L) -> bool
        where L: RepairListener<T>
    {
        self.locker.write(true, || {
            let mut pending = Vec::with_capacity(self.len.load(ORDERING));
            {
                let core = self.core();
                let mut slot = core.forest.first(core.root);
                while slot != NIL {
                    pending.push((slot, core.forest.gen_of(slot)));
                    slot = core.forest.successor(slot);
                }
            }
            let mut any = false;
            for (slot, gen) in pending {
                if !self.core().forest.contains(slot, gen) {
                    continue;
                }
                any |= self.repair_slot(slot, listener);
            }
            if any {
                debug!(self.log, "repaired"; "elements" => self.len.load(ORDERING));
            }
            any
        })
    }

    /// The single-element repair. Caller holds the structural write lock.
    fn repair_slot<L>(&self, slot: u32, listener: &mut L) -> bool
        where L: RepairListener<T>
    {
        if self.slot_consistent(self.core(), slot) {
            return false;
        }
        let core = self.core_mut();
        // Pull the element out first so the searches below cannot trip over it.
        core.forest.detach(&mut core.root, slot);
        let incumbent = core.forest.find_closest(core.root, |element| {
            (self.cmp)(element, core.forest.value(slot))
        }, SearchFilter::OnlyMatch, &|| true);
        match incumbent {
            Some(incumbent) => {
                let incumbent_id = self.make_id(core, incumbent);
                let data = listener.removed(incumbent_id, core.forest.value(incumbent));
                core.forest.detach(&mut core.root, incumbent);
                let carved = core.forest.release(incumbent);
                self.len.fetch_sub(1, ORDERING);
                self.reattach(core, slot);
                self.locker.bump(true);
                listener.disposed(carved, data);
            }
            None => {
                let id = self.make_id(core, slot);
                let data = listener.pre_transfer(id, core.forest.value(slot));
                self.reattach(core, slot);
                self.locker.bump(true);
                let core = self.core();
                listener.post_transfer(id, core.forest.value(slot), data);
            }
        }
        true
    }

    /// Attach a detached slot at the position its current value sorts.
    fn reattach(&self, core: &mut SortedCore<T>, slot: u32) {
        let (anchor, before) = {
            let near = core.forest.find_closest(core.root, |element| {
                (self.cmp)(element, core.forest.value(slot))
            }, SearchFilter::PreferLess, &|| true);
            match near {
                None => (NIL, false),
                Some(near) => {
                    let side = (self.cmp)(core.forest.value(near), core.forest.value(slot));
                    (near, side == Ordering::Greater)
                }
            }
        };
        core.forest.attach(&mut core.root, anchor, before, slot);
    }

    /// A bounded live view of this set.
    ///
    /// Each bound is a comparable over the elements (`element.cmp(&bound)`); `None` leaves that
    /// side open. Bounds are inclusive of exact matches. The view delegates everything to this
    /// set, clamped to the range.
    pub fn sub_set<'a>(&'a self,
                       lower: Option<Box<Fn(&T) -> Ordering + 'a>>,
                       upper: Option<Box<Fn(&T) -> Ordering + 'a>>)
                       -> SubSet<'a, T> {
        SubSet { set: self, lower: lower, upper: upper }
    }

    /// A snapshot of the values in comparator order.
    pub fn values(&self) -> Vec<T>
        where T: Clone
    {
        let mut out = Vec::with_capacity(self.len());
        self.for_each(|value| out.push(value.clone()));
        out
    }

    /// Visit every value in order under one read transaction.
    pub fn for_each<F: FnMut(&T)>(&self, mut f: F) {
        self.for_each_element(|_, value| f(value));
    }

    /// Visit every element and its handle in order under one read transaction.
    pub fn for_each_element<F: FnMut(ElementId, &T)>(&self, mut f: F) {
        self.locker.read(false, || {
            let core = self.core();
            let mut slot = core.forest.first(core.root);
            while slot != NIL {
                f(self.make_id(core, slot), core.forest.value(slot));
                slot = core.forest.successor(slot);
            }
        })
    }

    /// Where would `value` land relative to the element: acceptable in place, a duplicate, or
    /// out of order? Shared by the probes and `set_value`.
    fn placement(&self, core: &SortedCore<T>, slot: u32, value: &T) -> Option<Refusal> {
        let prev = core.forest.predecessor(slot);
        if prev != NIL && (self.cmp)(core.forest.value(prev), value) != Ordering::Less {
            return Some(if (self.cmp)(core.forest.value(prev), value) == Ordering::Equal {
                Refusal::ElementExists
            } else {
                Refusal::IllegalElement
            });
        }
        let next = core.forest.successor(slot);
        if next != NIL && (self.cmp)(value, core.forest.value(next)) != Ordering::Less {
            return Some(if (self.cmp)(value, core.forest.value(next)) == Ordering::Equal {
                Refusal::ElementExists
            } else {
                Refusal::IllegalElement
            });
        }
        None
    }
}

impl<T> ElementContainer for TreeSet<T> {
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
            Ok(f(core.forest.value(slot)))
        })
    }

    fn can_remove(&self, id: ElementId) -> Result<Option<Refusal>, Error> {
        self.locker.read(true, || {
            self.check_source(id);
            Ok(if self.core().forest.contains(id.slot, id.gen) {
                None
            } else {
                Some(Refusal::NotFound)
            })
        })
    }

    fn is_acceptable(&self, id: ElementId, value: &T) -> Result<Option<Refusal>, Error> {
        self.locker.read(false, || {
            let core = self.core();
            self.check_source(id);
            if !core.forest.contains(id.slot, id.gen) {
                return Ok(Some(Refusal::NotFound));
            }
            Ok(self.placement(core, id.slot, value))
        })
    }

    fn can_add(&self, id: ElementId, value: &T, before: bool) -> Result<Option<Refusal>, Error> {
        self.locker.read(false, || {
            let core = self.core();
            self.check_source(id);
            if !core.forest.contains(id.slot, id.gen) {
                return Ok(Some(Refusal::NotFound));
            }
            Ok(self.addable_adjacent(core, id.slot, value, before))
        })
    }

    /// Replace the element's value. An update write.
    ///
    /// The replacement must sort exactly where the element already is; a replacement that
    /// belongs elsewhere is refused with `illegal element` (moving elements is what
    /// [`TreeSet::repair_element`] is for), and one comparing equal to a neighbor with
    /// `element exists`.
    fn set_value(&self, id: ElementId, value: T) -> Result<T, Error> {
        self.locker.write(false, || {
            let core = self.core_mut();
            let slot = self.resolve(core, id)?;
            if let Some(reason) = self.placement(core, slot, &value) {
                return Err(Error::refused(reason));
            }
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
            if let Some(reason) = self.addable_adjacent(core, anchor, &value, before) {
                return Err(Error::refused(reason));
            }
            let slot = core.forest.alloc(value);
            core.forest.attach(&mut core.root, anchor, before, slot);
            self.len.fetch_add(1, ORDERING);
            self.locker.bump(true);
            Ok(self.make_id(self.core(), slot))
        })
    }

    fn clear(&self) {
        self.locker.write(true, || {
            let had = self.len.load(ORDERING);
            let core = self.core_mut();
            core.forest.release_all();
            core.root = NIL;
            self.len.store(0, ORDERING);
            if had > 0 {
                self.locker.bump(true);
            }
            trace!(self.log, "cleared"; "had" => had);
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
                return None;
            }
            let mid = low_rank + (high_rank - low_rank) / 2;
            let slot = core.forest.select(core.root, mid);
            if slot == NIL { None } else { Some(self.make_id(core, slot)) }
        })
    }
}

impl<T> TreeSet<T> {
    /// Would adding `value` directly before/after `anchor` keep the sort order?
    fn addable_adjacent(&self,
                        core: &SortedCore<T>,
                        anchor: u32,
                        value: &T,
                        before: bool)
                        -> Option<Refusal> {
        let anchor_value = core.forest.value(anchor);
        match (self.cmp)(value, anchor_value) {
            Ordering::Equal => return Some(Refusal::ElementExists),
            Ordering::Less if !before => return Some(Refusal::IllegalElement),
            Ordering::Greater if before => return Some(Refusal::IllegalElement),
            _ => {}
        }
        let outer = if before {
            core.forest.predecessor(anchor)
        } else {
            core.forest.successor(anchor)
        };
        if outer != NIL {
            let outer_value = core.forest.value(outer);
            let side = if before {
                (self.cmp)(outer_value, value)
            } else {
                (self.cmp)(value, outer_value)
            };
            match side {
                Ordering::Equal => return Some(Refusal::ElementExists),
                Ordering::Greater => return Some(Refusal::IllegalElement),
                Ordering::Less => {}
            }
        }
        None
    }
}

impl<T> ValueFind for TreeSet<T> {
    fn element_of(&self, value: &T) -> Option<ElementId> {
        self.search(|element| (self.cmp)(element, value), SearchFilter::OnlyMatch)
    }
}

impl<T: Ord> Default for TreeSet<T> {
    fn default() -> TreeSet<T> {
        TreeSet::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for TreeSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut set = f.debug_set();
        self.for_each(|value| {
            set.entry(value);
        });
        set.finish()
    }
}

impl<T: Ord> ::std::iter::FromIterator<T> for TreeSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> TreeSet<T> {
        TreeSet::build().build_from(iter)
    }
}

/// A consuming iterator over a sorted set, ascending.
pub struct SetIntoIter<T> {
    /// The torn-down interior.
    forest: Forest<T>,
    /// The slots in comparator order.
    order: ::std::vec::IntoIter<u32>,
}

impl<T> Iterator for SetIntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.order.next().map(|slot| self.forest.release(slot))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.order.size_hint()
    }
}

impl<T> IntoIterator for TreeSet<T> {
    type Item = T;
    type IntoIter = SetIntoIter<T>;

    fn into_iter(self) -> SetIntoIter<T> {
        let core = self.inner.into_inner();
        let mut order = Vec::with_capacity(core.forest.total(core.root));
        let mut slot = core.forest.first(core.root);
        while slot != NIL {
            order.push(slot);
            slot = core.forest.successor(slot);
        }
        SetIntoIter { forest: core.forest, order: order.into_iter() }
    }
}

/// One key/value entry of a map.
struct MapEntry<K, V> {
    /// The key; the tree is ordered by these.
    key: K,
    /// The value.
    value: V,
}

/// The lock-guarded interior of a map.
struct MapCore<K, V> {
    /// The entries, in key order.
    forest: Forest<MapEntry<K, V>>,
    /// The root.
    root: u32,
}

/// A comparator-keyed map whose entry handles expose both key and value.
///
/// The container's *elements* are the values — `get_with`, `set_value` and friends act on the
/// value half, and replacing a value is an update write that never moves the entry. Keys are
/// reached through [`TreeMap::entry_with`] and [`TreeMap::key_cloned`].
///
/// ```rust
/// use berth::TreeMap;
///
/// let map = TreeMap::new();
/// map.put("pier", 7).unwrap();
/// map.put("berth", 3).unwrap();
/// assert_eq!(map.get(&"pier"), Some(7));
/// assert_eq!(map.keys(), vec!["berth", "pier"]);
/// ```
pub struct TreeMap<K, V> {
    /// The interior, guarded by `locker`.
    inner: UnsafeCell<MapCore<K, V>>,
    /// The lock.
    locker: Locker,
    /// This container's identity, branded onto its element ids.
    id: u64,
    /// The entry count, readable without a lock.
    len: AtomicUsize,
    /// The key order.
    cmp: Box<Fn(&K, &K) -> Ordering + Send + Sync>,
    /// The log exitpoint.
    log: Logger,
}

unsafe impl<K: Send, V: Send> Send for TreeMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for TreeMap<K, V> {}

impl<K: Ord, V> TreeMap<K, V> {
    /// Create a map keyed by `Ord`, with the default (stamped) locking strategy.
    pub fn new() -> TreeMap<K, V> {
        TreeMap::build().build()
    }

    /// A builder keyed by `Ord`.
    pub fn build() -> ::builder::MapBuilder<K, V> {
        ::builder::MapBuilder::new()
    }
}

impl<K, V> TreeMap<K, V> {
    /// A builder with an explicit key comparator.
    pub fn build_with_comparator<C>(cmp: C) -> ::builder::MapBuilder<K, V>
        where C: Fn(&K, &K) -> Ordering + Send + Sync + 'static
    {
        ::builder::MapBuilder::with_comparator(Box::new(cmp))
    }

    /// Assemble a map from builder parts.
    pub(crate) fn with_options(locker: Locker,
                               log: Logger,
                               cmp: Box<Fn(&K, &K) -> Ordering + Send + Sync>)
                               -> TreeMap<K, V> {
        TreeMap {
            inner: UnsafeCell::new(MapCore { forest: Forest::new(), root: NIL }),
            locker: locker,
            id: element::next_container_id(),
            len: AtomicUsize::new(0),
            cmp: cmp,
            log: log,
        }
    }

    /// The interior. Caller must hold at least the matching read lock.
    fn core(&self) -> &MapCore<K, V> {
        unsafe { &*self.inner.get() }
    }

    /// The interior, mutably. Caller must hold the matching write lock.
    fn core_mut(&self) -> &mut MapCore<K, V> {
        unsafe { &mut *self.inner.get() }
    }

    /// The map's locker, for callers composing multi-operation transactions.
    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    /// Brand an element id for a slot.
    fn make_id(&self, core: &MapCore<K, V>, slot: u32) -> ElementId {
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

    /// Resolve an id of this map to its slot, or `not found` once removed.
    fn resolve(&self, core: &MapCore<K, V>, id: ElementId) -> Result<u32, Error> {
        self.check_source(id);
        if core.forest.contains(id.slot, id.gen) {
            Ok(id.slot)
        } else {
            Err(Error::refused(Refusal::NotFound))
        }
    }

    /// The entry whose key compares equal to `key`.
    pub fn entry_of(&self, key: &K) -> Option<ElementId> {
        self.search_keys(|candidate| (self.cmp)(candidate, key), SearchFilter::OnlyMatch)
    }

    /// Search the keys by a comparable; `cmp(key)` answers `key.cmp(&target)`.
    pub fn search_keys<F>(&self, cmp: F, filter: SearchFilter) -> Option<ElementId>
        where F: FnMut(&K) -> Ordering
    {
        let mut cmp = cmp;
        self.locker.read(false, || {
            let core = self.core();
            core.forest
                .find_closest(core.root, |entry| cmp(&entry.key), filter, &|| true)
                .map(|slot| self.make_id(core, slot))
        })
    }

    /// The index of the comparable's key match, or `-(insertion index + 1)` when absent.
    pub fn index_of_key<F>(&self, cmp: F) -> isize
        where F: FnMut(&K) -> Ordering
    {
        let mut cmp = cmp;
        self.locker.read(false, || {
            let core = self.core();
            core.forest.index_of(core.root, |entry| cmp(&entry.key))
        })
    }

    /// The value under `key`, cloned.
    pub fn get(&self, key: &K) -> Option<V>
        where V: Clone
    {
        self.locker.read(false, || {
            let id = self.entry_of(key)?;
            self.get_with(id, |value| value.clone()).ok()
        })
    }

    /// Read an entry's key and value through a closure.
    pub fn entry_with<R, F>(&self, id: ElementId, f: F) -> Result<R, Error>
        where F: FnOnce(&K, &V) -> R
    {
        self.locker.read(false, || {
            let core = self.core();
            let slot = self.resolve(core, id)?;
            let entry = &core.forest.node(slot).value;
            Ok(f(&entry.key, &entry.value))
        })
    }

    /// An entry's key, cloned.
    pub fn key_cloned(&self, id: ElementId) -> Result<K, Error>
        where K: Clone
    {
        self.entry_with(id, |key, _| key.clone())
    }

    /// Insert or replace. Answers the entry and the replaced value, if any.
    ///
    /// A replacement is an update write; only a fresh insertion moves the structural stamp.
    pub fn put(&self, key: K, value: V) -> Result<(ElementId, Option<V>), Error> {
        self.locker.write(true, || {
            let core = self.core_mut();
            let found = core.forest.find_closest(core.root, |entry| {
                (self.cmp)(&entry.key, &key)
            }, SearchFilter::OnlyMatch, &|| true);
            if let Some(slot) = found {
                let old = ::std::mem::replace(&mut core.forest.node_mut(slot).value.value, value);
                self.locker.bump(false);
                return Ok((self.make_id(self.core(), slot), Some(old)));
            }
            let (id, _) = self.insert_entry(core, key, value);
            Ok((id, None))
        })
    }

    /// Find the entry under `key`, or create it from `value_factory`.
    ///
    /// The factory runs only on a miss, as does `on_added`. The anchors are placement hints
    /// carried by callers that track neighboring entries; they must sit on the correct sides of
    /// `key` (the comparator has the final word on position).
    pub fn get_or_put<F, A>(&self,
                            key: K,
                            value_factory: F,
                            after: Option<ElementId>,
                            before: Option<ElementId>,
                            _prefer_first: bool,
                            on_added: A)
                            -> Result<(ElementId, bool), Error>
        where F: FnOnce() -> V,
              A: FnOnce(ElementId)
    {
        self.locker.write(true, || {
            let core = self.core_mut();
            let found = core.forest.find_closest(core.root, |entry| {
                (self.cmp)(&entry.key, &key)
            }, SearchFilter::OnlyMatch, &|| true);
            if let Some(slot) = found {
                return Ok((self.make_id(core, slot), false));
            }
            if let Some(id) = after {
                let slot = self.resolve(core, id)?;
                assert!((self.cmp)(&core.forest.node(slot).value.key, &key) == Ordering::Less,
                        "anchors out of order");
            }
            if let Some(id) = before {
                let slot = self.resolve(core, id)?;
                assert!((self.cmp)(&key, &core.forest.node(slot).value.key) == Ordering::Less,
                        "anchors out of order");
            }
            let (id, _) = self.insert_entry(core, key, value_factory());
            on_added(id);
            Ok((id, true))
        })
    }

    /// Attach a fresh entry at its key's position. Caller holds the structural write lock and
    /// has established the key is absent.
    fn insert_entry(&self, core: &mut MapCore<K, V>, key: K, value: V) -> (ElementId, u32) {
        let (anchor, before) = {
            let near = core.forest.find_closest(core.root, |entry| {
                (self.cmp)(&entry.key, &key)
            }, SearchFilter::PreferLess, &|| true);
            match near {
                None => (NIL, false),
                Some(near) => {
                    let side = (self.cmp)(&core.forest.node(near).value.key, &key);
                    (near, side == Ordering::Greater)
                }
            }
        };
        let slot = core.forest.alloc(MapEntry { key: key, value: value });
        core.forest.attach(&mut core.root, anchor, before, slot);
        self.len.fetch_add(1, ORDERING);
        self.locker.bump(true);
        (self.make_id(self.core(), slot), slot)
    }

    /// Remove the entry under `key`, answering its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.locker.write(true, || {
            let id = self.entry_of(key)?;
            self.remove_element(id).ok()
        })
    }

    /// Is the entry still where its current key sorts?
    pub fn is_consistent(&self, id: ElementId) -> Result<bool, Error> {
        self.locker.read(false, || {
            let core = self.core();
            let slot = self.resolve(core, id)?;
            Ok(self.slot_consistent(core, slot))
        })
    }

    /// Does any entry sit out of key order? `true` means at least one inconsistency exists.
    pub fn check_consistency(&self) -> bool {
        self.locker.read(false, || {
            let core = self.core();
            let mut slot = core.forest.first(core.root);
            while slot != NIL {
                if !self.slot_consistent(core, slot) {
                    return true;
                }
                slot = core.forest.successor(slot);
            }
            false
        })
    }

    /// Is the slot's key strictly between its neighbors?
    fn slot_consistent(&self, core: &MapCore<K, V>, slot: u32) -> bool {
        let key = &core.forest.node(slot).value.key;
        let prev = core.forest.predecessor(slot);
        if prev != NIL && (self.cmp)(&core.forest.node(prev).value.key, key) != Ordering::Less {
            return false;
        }
        let next = core.forest.successor(slot);
        if next != NIL && (self.cmp)(key, &core.forest.node(next).value.key) != Ordering::Less {
            return false;
        }
        true
    }

    /// Move one entry to where its current key sorts, if out of place.
    ///
    /// The listener rides on the *values*: a collision carves out the incumbent entry and hands
    /// its value to `disposed`. Answers whether anything was done.
    pub fn repair_element<L>(&self, id: ElementId, listener: &mut L) -> Result<bool, Error>
        where L: RepairListener<V>
    {
        self.locker.write(true, || {
            let slot = self.resolve(self.core(), id)?;
            Ok(self.repair_slot(slot, listener))
        })
    }

    /// Move every out-of-place entry, as [`TreeMap::repair_element`] does for one.
    pub fn repair<L>(&self, listener: &mut L) -> bool
        where L: RepairListener<V>
    {
        self.locker.write(true, || {
            let mut pending = Vec::with_capacity(self.len.load(ORDERING));
            {
                let core = self.core();
                let mut slot = core.forest.first(core.root);
                while slot != NIL {
                    pending.push((slot, core.forest.gen_of(slot)));
                    slot = core.forest.successor(slot);
                }
            }
            let mut any = false;
            for (slot, gen) in pending {
                if !self.core().forest.contains(slot, gen) {
                    continue;
                }
                any |= self.repair_slot(slot, listener);
            }
            if any {
                debug!(self.log, "repaired"; "entries" => self.len.load(ORDERING));
            }
            any
        })
    }

    /// The single-entry repair. Caller holds the structural write lock.
    fn repair_slot<L>(&self, slot: u32, listener: &mut L) -> bool
        where L: RepairListener<V>
    {
        if self.slot_consistent(self.core(), slot) {
            return false;
        }
        let core = self.core_mut();
        core.forest.detach(&mut core.root, slot);
        let incumbent = core.forest.find_closest(core.root, |entry| {
            (self.cmp)(&entry.key, &core.forest.node(slot).value.key)
        }, SearchFilter::OnlyMatch, &|| true);
        match incumbent {
            Some(incumbent) => {
                let incumbent_id = self.make_id(core, incumbent);
                let data = listener.removed(incumbent_id, &core.forest.node(incumbent).value.value);
                core.forest.detach(&mut core.root, incumbent);
                let carved = core.forest.release(incumbent);
                self.len.fetch_sub(1, ORDERING);
                self.reattach(core, slot);
                self.locker.bump(true);
                listener.disposed(carved.value, data);
            }
            None => {
                let id = self.make_id(core, slot);
                let data = listener.pre_transfer(id, &core.forest.node(slot).value.value);
                self.reattach(core, slot);
                self.locker.bump(true);
                let core = self.core();
                listener.post_transfer(id, &core.forest.node(slot).value.value, data);
            }
        }
        true
    }

    /// Attach a detached slot at the position its current key sorts.
    fn reattach(&self, core: &mut MapCore<K, V>, slot: u32) {
        let (anchor, before) = {
            let near = core.forest.find_closest(core.root, |entry| {
                (self.cmp)(&entry.key, &core.forest.node(slot).value.key)
            }, SearchFilter::PreferLess, &|| true);
            match near {
                None => (NIL, false),
                Some(near) => {
                    let side = (self.cmp)(&core.forest.node(near).value.key,
                                          &core.forest.node(slot).value.key);
                    (near, side == Ordering::Greater)
                }
            }
        };
        core.forest.attach(&mut core.root, anchor, before, slot);
    }

    /// A bounded live view of this map, bounded by key comparables.
    pub fn sub_map<'a>(&'a self,
                       lower: Option<Box<Fn(&K) -> Ordering + 'a>>,
                       upper: Option<Box<Fn(&K) -> Ordering + 'a>>)
                       -> SubMap<'a, K, V> {
        SubMap { map: self, lower: lower, upper: upper }
    }

    /// A snapshot of the keys in order.
    pub fn keys(&self) -> Vec<K>
        where K: Clone
    {
        let mut out = Vec::with_capacity(self.len());
        self.for_each_entry(|_, key, _| out.push(key.clone()));
        out
    }

    /// A snapshot of the entries in key order.
    pub fn entries(&self) -> Vec<(K, V)>
        where K: Clone,
              V: Clone
    {
        let mut out = Vec::with_capacity(self.len());
        self.for_each_entry(|_, key, value| out.push((key.clone(), value.clone())));
        out
    }

    /// Visit every entry in key order under one read transaction.
    pub fn for_each_entry<F: FnMut(ElementId, &K, &V)>(&self, mut f: F) {
        self.locker.read(false, || {
            let core = self.core();
            let mut slot = core.forest.first(core.root);
            while slot != NIL {
                let entry = &core.forest.node(slot).value;
                f(self.make_id(core, slot), &entry.key, &entry.value);
                slot = core.forest.successor(slot);
            }
        })
    }
}

impl<K, V> ElementContainer for TreeMap<K, V> {
    type Value = V;

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
        where F: FnOnce(&V) -> R
    {
        self.locker.read(false, || {
            let core = self.core();
            let slot = self.resolve(core, id)?;
            Ok(f(&core.forest.node(slot).value.value))
        })
    }

    fn can_remove(&self, id: ElementId) -> Result<Option<Refusal>, Error> {
        self.locker.read(true, || {
            self.check_source(id);
            Ok(if self.core().forest.contains(id.slot, id.gen) {
                None
            } else {
                Some(Refusal::NotFound)
            })
        })
    }

    fn is_acceptable(&self, id: ElementId, _value: &V) -> Result<Option<Refusal>, Error> {
        // Values do not participate in the ordering; any replacement is fine.
        self.can_remove(id)
    }

    fn can_add(&self, id: ElementId, _value: &V, _before: bool) -> Result<Option<Refusal>, Error> {
        self.locker.read(true, || {
            self.check_source(id);
            // A value cannot be added without a key; use `put`/`get_or_put`.
            Ok(Some(if self.core().forest.contains(id.slot, id.gen) {
                Refusal::Unsupported
            } else {
                Refusal::NotFound
            }))
        })
    }

    fn set_value(&self, id: ElementId, value: V) -> Result<V, Error> {
        self.locker.write(false, || {
            let core = self.core_mut();
            let slot = self.resolve(core, id)?;
            let old = ::std::mem::replace(&mut core.forest.node_mut(slot).value.value, value);
            self.locker.bump(false);
            Ok(old)
        })
    }

    fn remove_element(&self, id: ElementId) -> Result<V, Error> {
        self.locker.write(true, || {
            let core = self.core_mut();
            let slot = self.resolve(core, id)?;
            core.forest.detach(&mut core.root, slot);
            let entry = core.forest.release(slot);
            self.len.fetch_sub(1, ORDERING);
            self.locker.bump(true);
            Ok(entry.value)
        })
    }

    fn add_adjacent(&self, _id: ElementId, _value: V, _before: bool) -> Result<ElementId, Error> {
        Err(Error::refused(Refusal::Unsupported))
    }

    fn clear(&self) {
        self.locker.write(true, || {
            let had = self.len.load(ORDERING);
            let core = self.core_mut();
            core.forest.release_all();
            core.root = NIL;
            self.len.store(0, ORDERING);
            if had > 0 {
                self.locker.bump(true);
            }
            trace!(self.log, "cleared"; "had" => had);
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
                return None;
            }
            let mid = low_rank + (high_rank - low_rank) / 2;
            let slot = core.forest.select(core.root, mid);
            if slot == NIL { None } else { Some(self.make_id(core, slot)) }
        })
    }
}

impl<K: Ord, V> Default for TreeMap<K, V> {
    fn default() -> TreeMap<K, V> {
        TreeMap::new()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for TreeMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut map = f.debug_map();
        self.for_each_entry(|_, key, value| {
            map.entry(key, value);
        });
        map.finish()
    }
}

impl<K: Ord, V> ::std::iter::FromIterator<(K, V)> for TreeMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> TreeMap<K, V> {
        TreeMap::build().build_from(iter)
    }
}

/// A consuming iterator over a map, in key order.
pub struct MapIntoIter<K, V> {
    /// The torn-down interior.
    forest: Forest<MapEntry<K, V>>,
    /// The slots in key order.
    order: ::std::vec::IntoIter<u32>,
}

impl<K, V> Iterator for MapIntoIter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        self.order.next().map(|slot| {
            let entry = self.forest.release(slot);
            (entry.key, entry.value)
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.order.size_hint()
    }
}

impl<K, V> IntoIterator for TreeMap<K, V> {
    type Item = (K, V);
    type IntoIter = MapIntoIter<K, V>;

    fn into_iter(self) -> MapIntoIter<K, V> {
        let core = self.inner.into_inner();
        let mut order = Vec::with_capacity(core.forest.total(core.root));
        let mut slot = core.forest.first(core.root);
        while slot != NIL {
            order.push(slot);
            slot = core.forest.successor(slot);
        }
        MapIntoIter { forest: core.forest, order: order.into_iter() }
    }
}

/// A bounded live view of a [`TreeSet`].
///
/// The view is a thin adapter: a reference to the backing set plus the two bound comparables.
/// Nothing is copied; changes to the backing set are reflected, every search is clamped to the
/// range, and mutation outside the range is refused with `illegal element`. Bounds crossing
/// each other simply yield an empty view.
pub struct SubSet<'a, T: 'a> {
    /// The backing set.
    set: &'a TreeSet<T>,
    /// The lower bound: `element.cmp(&bound)`, inclusive at `Equal`. `None` is unbounded.
    lower: Option<Box<Fn(&T) -> Ordering + 'a>>,
    /// The upper bound, likewise.
    upper: Option<Box<Fn(&T) -> Ordering + 'a>>,
}

impl<'a, T> SubSet<'a, T> {
    /// Is the value below the range?
    fn too_low(&self, value: &T) -> bool {
        match self.lower {
            Some(ref bound) => bound(value) == Ordering::Less,
            None => false,
        }
    }

    /// Is the value above the range?
    fn too_high(&self, value: &T) -> bool {
        match self.upper {
            Some(ref bound) => bound(value) == Ordering::Greater,
            None => false,
        }
    }

    /// Does the value fall inside the view's range?
    pub fn in_range(&self, value: &T) -> bool {
        !self.too_low(value) && !self.too_high(value)
    }

    /// The number of elements in range. O(log n): two rank walks on the backing tree.
    pub fn len(&self) -> usize {
        self.set.locker().read(false, || {
            let below = match self.lower {
                Some(ref bound) => {
                    let index = self.set.index_of(|element| {
                        if bound(element) == Ordering::Less {
                            Ordering::Less
                        } else {
                            Ordering::Greater
                        }
                    });
                    (-index - 1) as usize
                }
                None => 0,
            };
            let not_above = match self.upper {
                Some(ref bound) => {
                    let index = self.set.index_of(|element| {
                        if bound(element) == Ordering::Greater {
                            Ordering::Greater
                        } else {
                            Ordering::Less
                        }
                    });
                    (-index - 1) as usize
                }
                None => self.set.len(),
            };
            if not_above > below { not_above - below } else { 0 }
        })
    }

    /// Is the range empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The first or last element inside the range.
    pub fn terminal_element(&self, first: bool) -> Option<ElementId> {
        self.set.locker().read(false, || {
            let candidate = if first {
                match self.lower {
                    Some(ref bound) => self.set.search(|element| {
                        if bound(element) == Ordering::Less {
                            Ordering::Less
                        } else {
                            Ordering::Greater
                        }
                    }, SearchFilter::Greater),
                    None => self.set.terminal_element(true),
                }
            } else {
                match self.upper {
                    Some(ref bound) => self.set.search(|element| {
                        if bound(element) == Ordering::Greater {
                            Ordering::Greater
                        } else {
                            Ordering::Less
                        }
                    }, SearchFilter::Less),
                    None => self.set.terminal_element(false),
                }
            };
            let id = match candidate {
                Some(id) => id,
                None => return None,
            };
            // The far bound may still exclude it.
            match self.set.get_with(id, |value| self.in_range(value)) {
                Ok(true) => Some(id),
                _ => None,
            }
        })
    }

    /// The neighbor of an element, clamped to the range.
    pub fn adjacent_element(&self, id: ElementId, next: bool) -> Result<Option<ElementId>, Error> {
        self.set.locker().read(false, || {
            let adjacent = match self.set.adjacent_element(id, next)? {
                Some(adjacent) => adjacent,
                None => return Ok(None),
            };
            if self.set.get_with(adjacent, |value| self.in_range(value))? {
                Ok(Some(adjacent))
            } else {
                Ok(None)
            }
        })
    }

    /// Search inside the range; a hit outside the bounds is out of range, hence `None`.
    pub fn search<F>(&self, cmp: F, filter: SearchFilter) -> Option<ElementId>
        where F: FnMut(&T) -> Ordering
    {
        self.set.locker().read(false, || {
            let id = self.set.search(cmp, filter)?;
            match self.set.get_with(id, |value| self.in_range(value)) {
                Ok(true) => Some(id),
                _ => None,
            }
        })
    }

    /// Is an equal element present inside the range?
    pub fn contains(&self, value: &T) -> bool {
        self.in_range(value) && self.set.contains(value)
    }

    /// Find the element equal to `value`, if it falls inside the range.
    pub fn element_of(&self, value: &T) -> Option<ElementId> {
        if !self.in_range(value) {
            return None;
        }
        ::element::ValueFind::element_of(self.set, value)
    }

    /// Could `value` be added through this view?
    pub fn is_addable(&self, value: &T) -> Option<Refusal> {
        if !self.in_range(value) {
            Some(Refusal::IllegalElement)
        } else if self.set.contains(value) {
            Some(Refusal::ElementExists)
        } else {
            None
        }
    }

    /// Add a value through the view. Out-of-range values are refused with `illegal element`.
    pub fn add(&self, value: T) -> Result<ElementId, Error> {
        if !self.in_range(&value) {
            return Err(Error::refused(Refusal::IllegalElement));
        }
        self.set.add(value)
    }

    /// Remove an element through the view; elements outside the range are refused.
    pub fn remove_element(&self, id: ElementId) -> Result<T, Error> {
        self.set.locker().write(true, || {
            if !self.set.get_with(id, |value| self.in_range(value))? {
                return Err(Error::refused(Refusal::IllegalElement));
            }
            self.set.remove_element(id)
        })
    }

    /// A snapshot of the in-range values, in order.
    pub fn values(&self) -> Vec<T>
        where T: Clone
    {
        self.set.locker().read(false, || {
            let mut out = Vec::new();
            let mut cursor = self.terminal_element(true);
            while let Some(id) = cursor {
                if let Ok(value) = self.set.get_cloned(id) {
                    out.push(value);
                }
                cursor = match self.adjacent_element(id, true) {
                    Ok(next) => next,
                    Err(..) => None,
                };
            }
            out
        })
    }
}

/// A bounded live view of a [`TreeMap`], bounded by key comparables.
///
/// The same adapter shape as [`SubSet`]: reference plus bounds, everything delegated and
/// clamped.
pub struct SubMap<'a, K: 'a, V: 'a> {
    /// The backing map.
    map: &'a TreeMap<K, V>,
    /// The lower key bound: `key.cmp(&bound)`, inclusive at `Equal`. `None` is unbounded.
    lower: Option<Box<Fn(&K) -> Ordering + 'a>>,
    /// The upper key bound, likewise.
    upper: Option<Box<Fn(&K) -> Ordering + 'a>>,
}

impl<'a, K, V> SubMap<'a, K, V> {
    /// Does the key fall inside the view's range?
    pub fn in_range(&self, key: &K) -> bool {
        let low = match self.lower {
            Some(ref bound) => bound(key) != Ordering::Less,
            None => true,
        };
        let high = match self.upper {
            Some(ref bound) => bound(key) != Ordering::Greater,
            None => true,
        };
        low && high
    }

    /// The number of entries in range. O(log n).
    pub fn len(&self) -> usize {
        self.map.locker().read(false, || {
            let below = match self.lower {
                Some(ref bound) => {
                    let index = self.map.index_of_key(|key| {
                        if bound(key) == Ordering::Less {
                            Ordering::Less
                        } else {
                            Ordering::Greater
                        }
                    });
                    (-index - 1) as usize
                }
                None => 0,
            };
            let not_above = match self.upper {
                Some(ref bound) => {
                    let index = self.map.index_of_key(|key| {
                        if bound(key) == Ordering::Greater {
                            Ordering::Greater
                        } else {
                            Ordering::Less
                        }
                    });
                    (-index - 1) as usize
                }
                None => self.map.len(),
            };
            if not_above > below { not_above - below } else { 0 }
        })
    }

    /// Is the range empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The entry under `key`, if the key is in range.
    pub fn entry_of(&self, key: &K) -> Option<ElementId> {
        if !self.in_range(key) {
            return None;
        }
        self.map.entry_of(key)
    }

    /// The value under `key`, cloned, if the key is in range.
    pub fn get(&self, key: &K) -> Option<V>
        where V: Clone
    {
        if !self.in_range(key) {
            return None;
        }
        self.map.get(key)
    }

    /// Insert or replace through the view; out-of-range keys are refused.
    pub fn put(&self, key: K, value: V) -> Result<(ElementId, Option<V>), Error> {
        if !self.in_range(&key) {
            return Err(Error::refused(Refusal::IllegalElement));
        }
        self.map.put(key, value)
    }

    /// Remove through the view; out-of-range keys are refused.
    pub fn remove(&self, key: &K) -> Result<Option<V>, Error> {
        if !self.in_range(key) {
            return Err(Error::refused(Refusal::IllegalElement));
        }
        Ok(self.map.remove(key))
    }

    /// The first or last entry inside the range.
    pub fn terminal_entry(&self, first: bool) -> Option<ElementId> {
        self.map.locker().read(false, || {
            let candidate = if first {
                match self.lower {
                    Some(ref bound) => self.map.search_keys(|key| {
                        if bound(key) == Ordering::Less {
                            Ordering::Less
                        } else {
                            Ordering::Greater
                        }
                    }, SearchFilter::Greater),
                    None => self.map.terminal_element(true),
                }
            } else {
                match self.upper {
                    Some(ref bound) => self.map.search_keys(|key| {
                        if bound(key) == Ordering::Greater {
                            Ordering::Greater
                        } else {
                            Ordering::Less
                        }
                    }, SearchFilter::Less),
                    None => self.map.terminal_element(false),
                }
            };
            let id = match candidate {
                Some(id) => id,
                None => return None,
            };
            match self.map.entry_with(id, |key, _| self.in_range(key)) {
                Ok(true) => Some(id),
                _ => None,
            }
        })
    }

    /// A snapshot of the in-range keys, in order.
    pub fn keys(&self) -> Vec<K>
        where K: Clone
    {
        let mut out = Vec::new();
        self.map.for_each_entry(|_, key, _| {
            if self.in_range(key) {
                out.push(key.clone());
            }
        });
        out
    }
}
