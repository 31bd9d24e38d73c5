//! The hash set.
//!
//! `HashSet` is a value-addressed set with deterministic iteration: every entry belongs to a
//! doubly-linked chain threaded through the whole set in insertion order, while lookup goes
//! through a power-of-two table of buckets, each bucket being a small red-black tree of its
//! hash-colliding entries ordered by full hash code. Iteration never touches the table, so the
//! observable order is independent of the hasher; lookup never touches the chain, so it stays
//! O(1 + collisions) even under adversarial hashing.
//!
//! Chain positions are encoded as 64-bit order stamps drawn from two counters: `add_first`
//! allocates downwards from −1, `add_last` upwards from 0, and an insertion between two
//! neighbors takes the predecessor's stamp plus one, renumbering forward only when that stamp is
//! already taken — so stamps order any two entries in O(1) and typical inserts never renumber.
//!
//! Because values are stored by hash, a value mutated out-of-band leaves its entry filed under a
//! stale hash. The set can detect this (`is_consistent`, `check_consistency`) and explicitly
//! move such entries to the bucket their current hash demands (`repair`), reporting collisions
//! to a [`RepairListener`]. Repair is never automatic.

use std::cell::UnsafeCell;
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{self, AtomicUsize};

use slog::Logger;

use element::{self, ElementContainer, ElementId, Error, Refusal, RepairListener, ValueFind};
use lock::Locker;
use node::{Forest, SearchFilter, NIL};

/// The atomic ordering used throughout the code.
const ORDERING: atomic::Ordering = atomic::Ordering::SeqCst;
/// The smallest bucket table.
pub(crate) const MIN_TABLE: usize = 4;
/// Growth factor over the needed size when rehashing, as a fraction.
const GROWTH_NUM: usize = 3;
/// See `GROWTH_NUM`.
const GROWTH_DENOM: usize = 2;

/// One entry: the value plus its filing state.
struct HashEntry<T> {
    /// The user value.
    value: T,
    /// The hash the entry is filed under. Equal to `hasher(value)` at rest; stale between an
    /// out-of-band value mutation and a repair.
    hash: u64,
    /// The insertion-order stamp. Strictly increasing along the chain.
    order: i64,
    /// The previous entry in the insertion-order chain.
    prev: u32,
    /// The next entry in the insertion-order chain.
    next: u32,
}

/// The lock-guarded interior.
struct HashCore<T> {
    /// The entry nodes. The bucket trees all live in this one forest.
    forest: Forest<HashEntry<T>>,
    /// The bucket roots; always a power of two long.
    table: Vec<u32>,
    /// The head of the insertion-order chain.
    first: u32,
    /// The tail of the insertion-order chain.
    last: u32,
    /// The next `add_first` stamp. Starts at −1 and decrements.
    first_ctr: i64,
    /// The next `add_last` stamp. Starts at 0 and increments.
    last_ctr: i64,
}

/// Where a lookup landed.
enum Found {
    /// An equivalent entry at this slot.
    Match(u32),
    /// No equivalent entry; a new one belongs adjacent to `anchor` in the bucket tree
    /// (`NIL` for an empty bucket).
    Insert {
        /// The bucket-tree neighbor of the would-be entry.
        anchor: u32,
        /// Whether the new entry goes before (`true`) or after the anchor.
        before: bool,
    },
}

impl<T> HashCore<T> {
    /// The entry at an occupied slot.
    fn entry(&self, slot: u32) -> &HashEntry<T> {
        &self.forest.node(slot).value
    }

    /// The entry at an occupied slot, mutably.
    fn entry_mut(&mut self, slot: u32) -> &mut HashEntry<T> {
        &mut self.forest.node_mut(slot).value
    }

    /// The bucket index of a hash under the current table.
    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.table.len() - 1)
    }

    /// Link a detached entry at the front of the chain, stamped from the front counter.
    fn link_front(&mut self, slot: u32) {
        let order = self.first_ctr;
        self.first_ctr -= 1;
        let old_first = self.first;
        {
            let entry = self.entry_mut(slot);
            entry.order = order;
            entry.prev = NIL;
            entry.next = old_first;
        }
        if old_first != NIL {
            self.entry_mut(old_first).prev = slot;
        } else {
            self.last = slot;
        }
        self.first = slot;
    }

    /// Link a detached entry at the back of the chain, stamped from the back counter.
    fn link_back(&mut self, slot: u32) {
        let order = self.last_ctr;
        self.last_ctr += 1;
        let old_last = self.last;
        {
            let entry = self.entry_mut(slot);
            entry.order = order;
            entry.prev = old_last;
            entry.next = NIL;
        }
        if old_last != NIL {
            self.entry_mut(old_last).next = slot;
        } else {
            self.first = slot;
        }
        self.last = slot;
    }

    /// Link a detached entry right after `anchor`.
    ///
    /// The entry takes the anchor's stamp plus one; if the anchor's successor already owns that
    /// stamp, the collision renumbers forward until the stamps spread out again. With stamps
    /// allocated gap-free only at the two ends, this cascade is O(1) amortized.
    fn link_after(&mut self, anchor: u32, slot: u32) {
        let next = self.entry(anchor).next;
        if next == NIL {
            return self.link_back(slot);
        }
        let order = self.entry(anchor).order + 1;
        if self.entry(next).order == order {
            let mut bump = order + 1;
            let mut cursor = next;
            while cursor != NIL && self.entry(cursor).order < bump {
                self.entry_mut(cursor).order = bump;
                bump += 1;
                cursor = self.entry(cursor).next;
            }
            if cursor == NIL && self.last_ctr < bump {
                self.last_ctr = bump;
            }
        }
        {
            let entry = self.entry_mut(slot);
            entry.order = order;
            entry.prev = anchor;
            entry.next = next;
        }
        self.entry_mut(anchor).next = slot;
        self.entry_mut(next).prev = slot;
    }

    /// Link a detached entry right before `anchor`.
    fn link_before(&mut self, anchor: u32, slot: u32) {
        let prev = self.entry(anchor).prev;
        if prev == NIL {
            self.link_front(slot)
        } else {
            self.link_after(prev, slot)
        }
    }

    /// Unlink an entry from the chain, leaving its slot and bucket placement alone.
    fn unlink(&mut self, slot: u32) {
        let (prev, next) = {
            let entry = self.entry(slot);
            (entry.prev, entry.next)
        };
        if prev != NIL {
            self.entry_mut(prev).next = next;
        } else {
            self.first = next;
        }
        if next != NIL {
            self.entry_mut(next).prev = prev;
        } else {
            self.last = prev;
        }
        let entry = self.entry_mut(slot);
        entry.prev = NIL;
        entry.next = NIL;
    }

    /// Insert a detached, link-reset entry into the bucket tree its hash selects.
    fn bucket_attach(&mut self, slot: u32, hash: u64) {
        let bucket = self.bucket_of(hash);
        if self.table[bucket] == NIL {
            self.forest.attach(&mut self.table[bucket], NIL, false, slot);
            return;
        }
        let anchor = self.forest
            .find_closest(self.table[bucket],
                          |entry| entry.hash.cmp(&hash),
                          SearchFilter::PreferLess,
                          &|| true)
            .expect("empty bucket tree under a non-nil root");
        let before = self.forest.node(anchor).value.hash > hash;
        self.forest.attach(&mut self.table[bucket], anchor, before, slot);
    }

    /// Detach an entry from the bucket tree its *stored* hash selects.
    fn bucket_detach(&mut self, slot: u32) {
        let bucket = self.bucket_of(self.entry(slot).hash);
        self.forest.detach(&mut self.table[bucket], slot);
    }
}

/// A hash set with stable handles, deterministic iteration order, and explicit repair.
///
/// ```rust
/// use berth::HashSet;
/// use berth::ElementContainer;
///
/// let set = HashSet::new();
/// set.add("dock").unwrap();
/// let quay = set.add("quay").unwrap();
/// assert!(set.add("dock").is_err());
/// assert_eq!(set.get_cloned(quay).unwrap(), "quay");
/// assert_eq!(set.values(), vec!["dock", "quay"]);
/// ```
pub struct HashSet<T> {
    /// The interior, guarded by `locker`.
    inner: UnsafeCell<HashCore<T>>,
    /// The lock.
    locker: Locker,
    /// This container's identity, branded onto its element ids.
    id: u64,
    /// The entry count, readable without a lock.
    len: AtomicUsize,
    /// The hash half of the equivalence.
    hasher: Box<Fn(&T) -> u64 + Send + Sync>,
    /// The equality half of the equivalence. Always called as `equals(incumbent, candidate)`.
    equals: Box<Fn(&T, &T) -> bool + Send + Sync>,
    /// The rehash threshold, in [0.2, 0.9].
    load_factor: f64,
    /// The log exitpoint.
    log: Logger,
}

unsafe impl<T: Send> Send for HashSet<T> {}
unsafe impl<T: Send + Sync> Sync for HashSet<T> {}

impl<T: ::std::hash::Hash + PartialEq> HashSet<T> {
    /// Create a set with the default equivalence (seahash over `Hash`, `PartialEq` equality)
    /// and the default (stamped) locking strategy.
    pub fn new() -> HashSet<T> {
        HashSet::build().build()
    }

    /// A builder with the default equivalence installed.
    pub fn build() -> ::builder::HashBuilder<T> {
        ::builder::HashBuilder::new()
    }
}

impl<T> HashSet<T> {
    /// A builder with a user equivalence, for value types without `Hash`/`PartialEq`.
    ///
    /// `equals` is always invoked as `equals(incumbent, candidate)` — the stored value first.
    pub fn build_custom<H, E>(hasher: H, equals: E) -> ::builder::HashBuilder<T>
        where H: Fn(&T) -> u64 + Send + Sync + 'static,
              E: Fn(&T, &T) -> bool + Send + Sync + 'static
    {
        ::builder::HashBuilder::with_equivalence(Box::new(hasher), Box::new(equals))
    }

    /// Assemble a set from builder parts.
    pub(crate) fn with_options(locker: Locker,
                               log: Logger,
                               hasher: Box<Fn(&T) -> u64 + Send + Sync>,
                               equals: Box<Fn(&T, &T) -> bool + Send + Sync>,
                               load_factor: f64,
                               initial_capacity: usize)
                               -> HashSet<T> {
        let mut table = MIN_TABLE;
        while (table as f64) * load_factor < initial_capacity as f64 {
            table <<= 1;
        }
        HashSet {
            inner: UnsafeCell::new(HashCore {
                forest: Forest::new(),
                table: vec![NIL; table],
                first: NIL,
                last: NIL,
                first_ctr: -1,
                last_ctr: 0,
            }),
            locker: locker,
            id: element::next_container_id(),
            len: AtomicUsize::new(0),
            hasher: hasher,
            equals: equals,
            load_factor: load_factor,
            log: log,
        }
    }

    /// The interior. Caller must hold at least the matching read lock.
    fn core(&self) -> &HashCore<T> {
        unsafe { &*self.inner.get() }
    }

    /// The interior, mutably. Caller must hold the matching write lock.
    fn core_mut(&self) -> &mut HashCore<T> {
        unsafe { &mut *self.inner.get() }
    }

    /// The set's locker, for callers composing multi-operation transactions.
    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    /// The number of buckets in the table.
    pub fn buckets(&self) -> usize {
        self.locker.read(true, || self.core().table.len())
    }

    /// Brand an element id for a slot.
    fn make_id(&self, core: &HashCore<T>, slot: u32) -> ElementId {
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
    fn resolve(&self, core: &HashCore<T>, id: ElementId) -> Result<u32, Error> {
        self.check_source(id);
        if core.forest.contains(id.slot, id.gen) {
            Ok(id.slot)
        } else {
            Err(Error::refused(Refusal::NotFound))
        }
    }

    /// Walk the bucket of `hash` for an entry equal to `value` (skipping slot `skip`), or the
    /// insertion point a new entry belongs at.
    fn locate(&self, core: &HashCore<T>, hash: u64, value: &T, skip: u32) -> Found {
        let root = core.table[core.bucket_of(hash)];
        if root == NIL {
            return Found::Insert { anchor: NIL, before: false };
        }
        let near = core.forest
            .find_closest(root, |entry| entry.hash.cmp(&hash), SearchFilter::PreferLess, &|| true)
            .expect("empty bucket tree under a non-nil root");
        let near_hash = core.forest.node(near).value.hash;
        if near_hash != hash {
            return Found::Insert { anchor: near, before: near_hash > hash };
        }
        // Ties are adjacent in the bucket tree; scan outward from the hit in both directions.
        let mut cursor = near;
        while cursor != NIL {
            let entry = core.entry(cursor);
            if entry.hash != hash {
                break;
            }
            if cursor != skip && (self.equals)(&entry.value, value) {
                return Found::Match(cursor);
            }
            cursor = core.forest.successor(cursor);
        }
        let mut cursor = core.forest.predecessor(near);
        while cursor != NIL {
            let entry = core.entry(cursor);
            if entry.hash != hash {
                break;
            }
            if cursor != skip && (self.equals)(&entry.value, value) {
                return Found::Match(cursor);
            }
            cursor = core.forest.predecessor(cursor);
        }
        Found::Insert { anchor: near, before: false }
    }

    /// Rebuild the table with at least `needed / load_factor` buckets (times the growth
    /// factor), re-filing every entry. Entry slots — and therefore handles — are untouched.
    fn grow(&self, core: &mut HashCore<T>, needed: usize) {
        let target = needed * GROWTH_NUM / GROWTH_DENOM;
        let mut buckets = MIN_TABLE;
        while (buckets as f64) * self.load_factor < target as f64 {
            buckets <<= 1;
        }
        if buckets <= core.table.len() {
            return;
        }
        debug!(self.log, "rehashing";
               "buckets" => buckets,
               "was" => core.table.len(),
               "entries" => self.len.load(ORDERING));
        core.table = vec![NIL; buckets];
        let mut slot = core.first;
        while slot != NIL {
            core.forest.reset_links(slot);
            let hash = core.entry(slot).hash;
            core.bucket_attach(slot, hash);
            slot = core.entry(slot).next;
        }
    }

    /// Pre-size the table for `expected` entries, rehashing if it grows. The table never
    /// shrinks.
    pub fn rehash(&self, expected: usize) {
        self.locker.write(true, || {
            let needed = ::std::cmp::max(expected, self.len.load(ORDERING));
            self.grow(self.core_mut(), needed);
        })
    }

    /// Add a value at the back, or report `element exists`.
    pub fn add(&self, value: T) -> Result<ElementId, Error> {
        self.checked_add(value, None, None, false)
    }

    /// Add a value at the front, or report `element exists`.
    pub fn add_first(&self, value: T) -> Result<ElementId, Error> {
        self.checked_add(value, None, None, true)
    }

    /// Add a value at the back, or report `element exists`.
    pub fn add_last(&self, value: T) -> Result<ElementId, Error> {
        self.checked_add(value, None, None, false)
    }

    fn checked_add(&self,
                   value: T,
                   after: Option<ElementId>,
                   before: Option<ElementId>,
                   prefer_first: bool)
                   -> Result<ElementId, Error> {
        match self.get_or_add(value, after, before, prefer_first)? {
            (id, true) => Ok(id),
            (_, false) => Err(Error::refused(Refusal::ElementExists)),
        }
    }

    /// Find the entry equal to `value`, or add it in the chain position the anchors select.
    ///
    /// Answers the element and whether it was added. On a hit the candidate value is dropped
    /// and the anchors ignored. `prefer_first` pulls the new entry toward the `after` anchor
    /// (or the chain front); otherwise it lands toward `before` (or the chain back).
    pub fn get_or_add(&self,
                      value: T,
                      after: Option<ElementId>,
                      before: Option<ElementId>,
                      prefer_first: bool)
                      -> Result<(ElementId, bool), Error> {
        self.get_or_add_with(value, after, before, prefer_first, |_| None, |_| ())
    }

    /// [`HashSet::get_or_add`] with hooks.
    ///
    /// `pre_add` runs after the miss is established and may veto the addition with a refusal
    /// (range views veto out-of-bounds values this way); `post_add` runs with the new handle,
    /// and only when an addition actually happened.
    pub fn get_or_add_with<Pre, Post>(&self,
                                      value: T,
                                      after: Option<ElementId>,
                                      before: Option<ElementId>,
                                      prefer_first: bool,
                                      pre_add: Pre,
                                      post_add: Post)
                                      -> Result<(ElementId, bool), Error>
        where Pre: FnOnce(&T) -> Option<Refusal>,
              Post: FnOnce(ElementId)
    {
        self.locker.write(true, || {
            let hash = (self.hasher)(&value);
            let core = self.core_mut();
            let (mut anchor, mut ins_before) = match self.locate(core, hash, &value, NIL) {
                Found::Match(slot) => return Ok((self.make_id(core, slot), false)),
                Found::Insert { anchor, before } => (anchor, before),
            };
            if let Some(reason) = pre_add(&value) {
                return Err(Error::refused(reason));
            }
            let after_slot = match after {
                Some(id) => Some(self.resolve(core, id)?),
                None => None,
            };
            let before_slot = match before {
                Some(id) => Some(self.resolve(core, id)?),
                None => None,
            };
            // Make room first; growing re-files every entry, so the bucket anchor must be
            // looked up again. Chain anchors are slots and survive the rehash.
            let len = self.len.load(ORDERING);
            if (len + 1) as f64 > core.table.len() as f64 * self.load_factor {
                self.grow(core, len + 1);
                match self.locate(core, hash, &value, NIL) {
                    Found::Insert { anchor: a, before: b } => {
                        anchor = a;
                        ins_before = b;
                    }
                    // Growing cannot add members.
                    Found::Match(..) => unreachable!(),
                }
            }
            let slot = core.forest.alloc(HashEntry {
                value: value,
                hash: hash,
                order: 0,
                prev: NIL,
                next: NIL,
            });
            if prefer_first {
                match after_slot {
                    Some(a) => core.link_after(a, slot),
                    None => core.link_front(slot),
                }
            } else {
                match before_slot {
                    Some(b) => core.link_before(b, slot),
                    None => core.link_back(slot),
                }
            }
            let bucket = core.bucket_of(hash);
            core.forest.attach(&mut core.table[bucket], anchor, ins_before, slot);
            self.len.fetch_add(1, ORDERING);
            self.locker.bump(true);
            let id = self.make_id(self.core(), slot);
            post_add(id);
            Ok((id, true))
        })
    }

    /// Is an entry equal to `value` present?
    pub fn contains(&self, value: &T) -> bool {
        self.element_of_value(value).is_some()
    }

    /// Find the element equal to `value`.
    pub fn element_of_value(&self, value: &T) -> Option<ElementId> {
        self.locker.read(false, || {
            let core = self.core();
            let hash = (self.hasher)(value);
            match self.locate(core, hash, value, NIL) {
                Found::Match(slot) => Some(self.make_id(core, slot)),
                Found::Insert { .. } => None,
            }
        })
    }

    /// Move an entry to a new chain position without re-hashing it.
    ///
    /// The entry is unlinked, `after_remove` runs, and the entry is relinked by the same anchor
    /// rules as [`HashSet::get_or_add`]. The callback must not perform structural writes on
    /// this set — the structural stamp is compared around it and a change panics. The anchors
    /// must not name the moved entry itself.
    pub fn move_element<F: FnOnce()>(&self,
                                     id: ElementId,
                                     after: Option<ElementId>,
                                     before: Option<ElementId>,
                                     prefer_first: bool,
                                     after_remove: F)
                                     -> Result<ElementId, Error> {
        assert!(after != Some(id) && before != Some(id),
                "cannot anchor a move on the moved element");
        self.locker.write(true, || {
            let core = self.core_mut();
            let slot = self.resolve(core, id)?;
            core.unlink(slot);
            let snapshot = self.locker.stamp(true);
            after_remove();
            assert_eq!(self.locker.stamp(true),
                       snapshot,
                       "the insertion-order stamp changed across the move callback");
            let core = self.core_mut();
            let after_slot = match after {
                Some(id) => Some(self.resolve(core, id)?),
                None => None,
            };
            let before_slot = match before {
                Some(id) => Some(self.resolve(core, id)?),
                None => None,
            };
            if prefer_first {
                match after_slot {
                    Some(a) => core.link_after(a, slot),
                    None => core.link_front(slot),
                }
            } else {
                match before_slot {
                    Some(b) => core.link_before(b, slot),
                    None => core.link_back(slot),
                }
            }
            self.locker.bump(true);
            Ok(id)
        })
    }

    /// Is the entry filed under the hash its value currently produces?
    pub fn is_consistent(&self, id: ElementId) -> Result<bool, Error> {
        self.locker.read(false, || {
            let core = self.core();
            let slot = self.resolve(core, id)?;
            let entry = core.entry(slot);
            Ok((self.hasher)(&entry.value) == entry.hash)
        })
    }

    /// Does any entry sit under a stale hash? `true` means at least one inconsistency exists.
    pub fn check_consistency(&self) -> bool {
        self.locker.read(false, || {
            let core = self.core();
            let mut slot = core.first;
            while slot != NIL {
                let entry = core.entry(slot);
                if (self.hasher)(&entry.value) != entry.hash {
                    return true;
                }
                slot = entry.next;
            }
            false
        })
    }

    /// Re-file one entry under its current hash, if stale.
    ///
    /// Answers whether anything was done. A clean entry is a no-op with no listener calls. If
    /// the entry's current hash collides with an equivalent incumbent, the incumbent is removed
    /// (`removed`, then `disposed`); otherwise the move is bracketed by
    /// `pre_transfer`/`post_transfer`. Chain position — the insertion order — is preserved
    /// either way.
    pub fn repair_element<L>(&self, id: ElementId, listener: &mut L) -> Result<bool, Error>
        where L: RepairListener<T>
    {
        self.locker.write(true, || {
            let slot = self.resolve(self.core(), id)?;
            Ok(self.repair_slot(slot, listener))
        })
    }

    /// Re-file every stale entry, as [`HashSet::repair_element`] does for one.
    ///
    /// Answers whether anything was done.
    pub fn repair<L>(&self, listener: &mut L) -> bool
        where L: RepairListener<T>
    {
        self.locker.write(true, || {
            // Snapshot the chain first: collision removals may carve out entries not yet
            // visited.
            let mut pending = Vec::with_capacity(self.len.load(ORDERING));
            {
                let core = self.core();
                let mut slot = core.first;
                while slot != NIL {
                    pending.push((slot, core.forest.gen_of(slot)));
                    slot = core.entry(slot).next;
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
        where L: RepairListener<T>
    {
        let core = self.core_mut();
        let current = (self.hasher)(&core.entry(slot).value);
        if current == core.entry(slot).hash {
            return false;
        }
        // Pull the entry out of its stale bucket before searching, so the lookup cannot trip
        // over the entry itself, then re-file it under the hash its value now produces.
        core.bucket_detach(slot);
        core.entry_mut(slot).hash = current;
        let collision = match self.locate(core, current, &core.entry(slot).value, slot) {
            Found::Match(incumbent) => Some(incumbent),
            Found::Insert { .. } => None,
        };
        match collision {
            Some(incumbent) => {
                let incumbent_id = self.make_id(core, incumbent);
                let data = listener.removed(incumbent_id, &core.entry(incumbent).value);
                core.unlink(incumbent);
                core.bucket_detach(incumbent);
                let carved = core.forest.release(incumbent);
                self.len.fetch_sub(1, ORDERING);
                core.bucket_attach(slot, current);
                self.locker.bump(true);
                listener.disposed(carved.value, data);
            }
            None => {
                let id = self.make_id(core, slot);
                let data = listener.pre_transfer(id, &core.entry(slot).value);
                core.bucket_attach(slot, current);
                self.locker.bump(true);
                listener.post_transfer(id, &core.entry(slot).value, data);
            }
        }
        true
    }

    /// A snapshot of the values in insertion order.
    pub fn values(&self) -> Vec<T>
        where T: Clone
    {
        let mut out = Vec::with_capacity(self.len());
        self.for_each(|value| out.push(value.clone()));
        out
    }

    /// Visit every value in insertion order under one read transaction.
    pub fn for_each<F: FnMut(&T)>(&self, mut f: F) {
        self.for_each_element(|_, value| f(value));
    }

    /// Visit every element and its handle in insertion order under one read transaction.
    pub fn for_each_element<F: FnMut(ElementId, &T)>(&self, mut f: F) {
        self.locker.read(false, || {
            let core = self.core();
            let mut slot = core.first;
            while slot != NIL {
                f(self.make_id(core, slot), &core.entry(slot).value);
                slot = core.entry(slot).next;
            }
        })
    }
}

impl<T> ElementContainer for HashSet<T> {
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
                // The chain stamps order any two live entries.
                core.entry(a.slot).order.cmp(&core.entry(b.slot).order)
            } else {
                a.seq.cmp(&b.seq)
            }
        })
    }

    fn terminal_element(&self, first: bool) -> Option<ElementId> {
        self.locker.read(true, || {
            let core = self.core();
            let slot = if first { core.first } else { core.last };
            if slot == NIL { None } else { Some(self.make_id(core, slot)) }
        })
    }

    fn adjacent_element(&self, id: ElementId, next: bool) -> Result<Option<ElementId>, Error> {
        self.locker.read(true, || {
            let core = self.core();
            let slot = self.resolve(core, id)?;
            let adjacent = if next { core.entry(slot).next } else { core.entry(slot).prev };
            Ok(if adjacent == NIL { None } else { Some(self.make_id(core, adjacent)) })
        })
    }

    fn get_with<R, F>(&self, id: ElementId, f: F) -> Result<R, Error>
        where F: FnOnce(&T) -> R
    {
        self.locker.read(false, || {
            let core = self.core();
            let slot = self.resolve(core, id)?;
            Ok(f(&core.entry(slot).value))
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
            let hash = (self.hasher)(value);
            match self.locate(core, hash, value, id.slot) {
                Found::Match(..) => Ok(Some(Refusal::ElementExists)),
                Found::Insert { .. } => Ok(None),
            }
        })
    }

    fn can_add(&self, id: ElementId, value: &T, _before: bool) -> Result<Option<Refusal>, Error> {
        self.locker.read(false, || {
            let core = self.core();
            self.check_source(id);
            if !core.forest.contains(id.slot, id.gen) {
                return Ok(Some(Refusal::NotFound));
            }
            let hash = (self.hasher)(value);
            match self.locate(core, hash, value, NIL) {
                Found::Match(..) => Ok(Some(Refusal::ElementExists)),
                Found::Insert { .. } => Ok(None),
            }
        })
    }

    /// Replace the value of an entry.
    ///
    /// If the new value hashes differently, the entry is re-filed under the new hash on the
    /// spot — its chain position, and thus the iteration order, is unchanged, which is why this
    /// counts as an update write. A replacement equal to a *different* entry is refused with
    /// `element exists`.
    fn set_value(&self, id: ElementId, value: T) -> Result<T, Error> {
        self.locker.write(false, || {
            let core = self.core_mut();
            let slot = self.resolve(core, id)?;
            let hash = (self.hasher)(&value);
            match self.locate(core, hash, &value, slot) {
                Found::Match(..) => return Err(Error::refused(Refusal::ElementExists)),
                Found::Insert { .. } => {}
            }
            if hash == core.entry(slot).hash {
                let old = ::std::mem::replace(&mut core.entry_mut(slot).value, value);
                self.locker.bump(false);
                return Ok(old);
            }
            core.bucket_detach(slot);
            let old = ::std::mem::replace(&mut core.entry_mut(slot).value, value);
            core.entry_mut(slot).hash = hash;
            core.bucket_attach(slot, hash);
            self.locker.bump(false);
            Ok(old)
        })
    }

    fn remove_element(&self, id: ElementId) -> Result<T, Error> {
        self.locker.write(true, || {
            let core = self.core_mut();
            let slot = self.resolve(core, id)?;
            core.unlink(slot);
            core.bucket_detach(slot);
            let entry = core.forest.release(slot);
            self.len.fetch_sub(1, ORDERING);
            self.locker.bump(true);
            Ok(entry.value)
        })
    }

    fn add_adjacent(&self, id: ElementId, value: T, before: bool) -> Result<ElementId, Error> {
        if before {
            self.checked_add(value, None, Some(id), false)
        } else {
            self.checked_add(value, Some(id), None, true)
        }
    }

    fn clear(&self) {
        self.locker.write(true, || {
            let had = self.len.load(ORDERING);
            let core = self.core_mut();
            core.forest.release_all();
            for root in core.table.iter_mut() {
                *root = NIL;
            }
            core.first = NIL;
            core.last = NIL;
            core.first_ctr = -1;
            core.last_ctr = 0;
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

    fn split_point(&self, _low: Option<ElementId>, _high: Option<ElementId>) -> Option<ElementId> {
        // The insertion-order chain has no positional index to bisect; decline.
        None
    }
}

impl<T> ValueFind for HashSet<T> {
    fn element_of(&self, value: &T) -> Option<ElementId> {
        self.element_of_value(value)
    }
}

impl<T: ::std::hash::Hash + PartialEq> Default for HashSet<T> {
    fn default() -> HashSet<T> {
        HashSet::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for HashSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut set = f.debug_set();
        self.for_each(|value| {
            set.entry(value);
        });
        set.finish()
    }
}

impl<T: ::std::hash::Hash + PartialEq> ::std::iter::FromIterator<T> for HashSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> HashSet<T> {
        HashSet::build().build_from(iter)
    }
}

/// A consuming iterator over a set, in insertion order.
pub struct IntoIter<T> {
    /// The torn-down interior.
    forest: Forest<HashEntry<T>>,
    /// The next chain slot.
    next: u32,
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.next == NIL {
            return None;
        }
        // The set is owned; the chain can be drained without any tree upkeep.
        let entry = self.forest.release(self.next);
        self.next = entry.next;
        Some(entry.value)
    }
}

impl<T> IntoIterator for HashSet<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        let core = self.inner.into_inner();
        IntoIter { forest: core.forest, next: core.first }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// A set where everything collides, to exercise the bucket trees.
    fn colliding() -> HashSet<u64> {
        HashSet::build_custom(|_| 0, |a: &u64, b: &u64| a == b).build()
    }

    #[test]
    fn insertion_order_survives_collisions() {
        let set = colliding();
        set.add(1).unwrap();
        let two = set.add(2).unwrap();
        set.add(3).unwrap();
        assert_eq!(set.values(), vec![1, 2, 3]);
        assert_eq!(set.remove_element(two).unwrap(), 2);
        assert_eq!(set.values(), vec![1, 3]);
        assert!(set.contains(&1));
        assert!(!set.contains(&2));
        assert!(set.contains(&3));
    }

    #[test]
    fn duplicate_add_reports_element_exists() {
        let set = HashSet::new();
        set.add("x").unwrap();
        assert_eq!(set.add("x"), Err(Error::refused(Refusal::ElementExists)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn get_or_add_is_idempotent() {
        let set = HashSet::new();
        let added = Cell::new(0);
        let (first, fresh) = set.get_or_add_with(9, None, None, false, |_| None, |_| {
            added.set(added.get() + 1);
        }).unwrap();
        assert!(fresh);
        let (second, fresh) = set.get_or_add_with(9, None, None, false, |_| None, |_| {
            added.set(added.get() + 1);
        }).unwrap();
        assert!(!fresh);
        assert_eq!(first, second);
        assert_eq!(added.get(), 1);
    }

    #[test]
    fn pre_add_vetoes() {
        let set = HashSet::new();
        let result = set.get_or_add_with(1, None, None, false,
                                         |_| Some(Refusal::IllegalElement),
                                         |_| ());
        assert_eq!(result, Err(Error::refused(Refusal::IllegalElement)));
        assert!(set.is_empty());
    }

    #[test]
    fn anchored_insertion_orders_the_chain() {
        let set = HashSet::new();
        let b = set.add(2u32).unwrap();
        let d = set.add(4).unwrap();
        set.add_first(1).unwrap();
        let (c, fresh) = set.get_or_add(3, Some(b), Some(d), true).unwrap();
        assert!(fresh);
        assert_eq!(set.values(), vec![1, 2, 3, 4]);

        // Handle order is the chain order, including across the negative-stamp front.
        let mut ids = Vec::new();
        set.for_each_element(|id, _| ids.push(id));
        for window in ids.windows(2) {
            assert_eq!(set.compare_elements(window[0], window[1]), Ordering::Less);
        }
        assert_eq!(set.compare_elements(b, c), Ordering::Less);
        assert_eq!(set.compare_elements(d, c), Ordering::Greater);
    }

    #[test]
    fn between_inserts_renumber_forward_only_on_collision() {
        let set = HashSet::new();
        let mut left = set.add(0u32).unwrap();
        let right = set.add(1).unwrap();
        // Repeatedly squeeze between the same neighbors; each insert collides with the right
        // neighbor's stamp and renumbers forward, but the order must stay coherent.
        for value in 2..10 {
            left = set.get_or_add(value, Some(left), Some(right), true).unwrap().0;
        }
        assert_eq!(set.values(), vec![0, 2, 3, 4, 5, 6, 7, 8, 9, 1]);
    }

    #[test]
    fn load_factor_triggers_power_of_two_rehash() {
        let set = HashSet::build().capacity(1).load_factor(0.75).build();
        let initial = set.buckets();
        assert_eq!(initial, MIN_TABLE);
        let mut ids = Vec::new();
        for i in 0..200u64 {
            // The insertion that would exceed buckets × load factor must rehash first.
            if (set.len() + 1) as f64 > set.buckets() as f64 * 0.75 {
                let before = set.buckets();
                ids.push(set.add(i).unwrap());
                let after = set.buckets();
                assert!(after > before);
                // Power of two, and big enough for 1.5× the new size.
                assert_eq!(after & (after - 1), 0);
                let needed = (set.len() * 3 / 2) as f64 / 0.75;
                assert!(after as f64 >= needed.ceil() - 1.0);
            } else {
                ids.push(set.add(i).unwrap());
            }
        }
        // Rehashing kept every handle and the insertion order.
        assert_eq!(set.values(), (0..200).collect::<Vec<_>>());
        for (i, id) in ids.iter().enumerate() {
            assert!(set.is_present(*id));
            assert_eq!(set.get_cloned(*id).unwrap(), i as u64);
        }
    }

    #[test]
    fn explicit_rehash_never_shrinks() {
        let set: HashSet<u64> = HashSet::new();
        set.rehash(1000);
        let grown = set.buckets();
        assert!(grown as f64 * 0.75 >= 1500.0);
        set.rehash(1);
        assert_eq!(set.buckets(), grown);
    }

    #[test]
    fn move_relocates_without_rehashing() {
        let set = HashSet::new();
        let a = set.add('a').unwrap();
        set.add('b').unwrap();
        set.add('c').unwrap();
        let called = Cell::new(false);
        set.move_element(a, None, None, false, || called.set(true)).unwrap();
        assert!(called.get());
        assert_eq!(set.values(), vec!['b', 'c', 'a']);
        assert!(set.contains(&'a'));
    }

    #[test]
    #[should_panic(expected = "stamp changed across the move callback")]
    fn move_callback_must_not_mutate() {
        let set = HashSet::new();
        let a = set.add(1u32).unwrap();
        set.add(2).unwrap();
        let _ = set.move_element(a, None, None, false, || {
            // A structural write from the callback is the documented violation.
            set.add(3).unwrap();
        });
    }

    #[test]
    fn set_value_refiles_under_new_hash() {
        let set = HashSet::build_custom(|v: &u64| *v, |a, b| a == b).build();
        let id = set.add(5).unwrap();
        set.add(9).unwrap();
        // Same entry, new hash: still found, order unchanged.
        assert_eq!(set.set_value(id, 6).unwrap(), 5);
        assert!(set.contains(&6));
        assert!(!set.contains(&5));
        assert_eq!(set.values(), vec![6, 9]);
        assert!(set.is_consistent(id).unwrap());
        // Colliding with another entry is refused.
        assert_eq!(set.set_value(id, 9), Err(Error::refused(Refusal::ElementExists)));
        assert_eq!(set.is_acceptable(id, &9).unwrap(), Some(Refusal::ElementExists));
        assert_eq!(set.is_acceptable(id, &7).unwrap(), None);
    }

    /// A mutable-keyed value: the hash reads through the cell.
    fn mutable_set() -> HashSet<Rc<Cell<u64>>> {
        HashSet::build_custom(|v: &Rc<Cell<u64>>| v.get(), |a, b| a.get() == b.get()).build()
    }

    /// Records the listener protocol as strings.
    struct Recording {
        events: Vec<String>,
    }

    impl RepairListener<Rc<Cell<u64>>> for Recording {
        type Data = u64;

        fn removed(&mut self, _id: ElementId, value: &Rc<Cell<u64>>) -> u64 {
            self.events.push(format!("removed {}", value.get()));
            value.get()
        }

        fn disposed(&mut self, value: Rc<Cell<u64>>, data: u64) {
            self.events.push(format!("disposed {} {}", value.get(), data));
        }

        fn pre_transfer(&mut self, _id: ElementId, value: &Rc<Cell<u64>>) -> u64 {
            self.events.push(format!("pre {}", value.get()));
            value.get()
        }

        fn post_transfer(&mut self, _id: ElementId, value: &Rc<Cell<u64>>, data: u64) {
            self.events.push(format!("post {} {}", value.get(), data));
        }
    }

    #[test]
    fn repair_transfers_a_mutated_entry() {
        let set = mutable_set();
        let value = Rc::new(Cell::new(5));
        let id = set.add(value.clone()).unwrap();
        assert!(set.is_consistent(id).unwrap());
        assert!(!set.check_consistency());

        // Mutate the field the hasher reads.
        value.set(7);
        assert!(!set.is_consistent(id).unwrap());
        assert!(set.check_consistency());

        let mut listener = Recording { events: Vec::new() };
        assert!(set.repair_element(id, &mut listener).unwrap());
        assert_eq!(listener.events, vec!["pre 7", "post 7 7"]);
        assert!(set.is_consistent(id).unwrap());
        assert!(!set.check_consistency());
        assert!(set.contains(&Rc::new(Cell::new(7))));
        assert!(!set.contains(&Rc::new(Cell::new(5))));
    }

    #[test]
    fn repair_collision_removes_the_incumbent() {
        let set = mutable_set();
        let moved = Rc::new(Cell::new(5));
        let moved_id = set.add(moved.clone()).unwrap();
        let incumbent_id = set.add(Rc::new(Cell::new(7))).unwrap();

        moved.set(7);
        let mut listener = Recording { events: Vec::new() };
        assert!(set.repair(&mut listener));
        assert_eq!(listener.events, vec!["removed 7", "disposed 7 7"]);
        assert_eq!(set.len(), 1);
        assert!(set.is_present(moved_id));
        assert!(!set.is_present(incumbent_id));
        assert!(set.is_consistent(moved_id).unwrap());
    }

    /// A listener that must never be called.
    struct Untouchable;

    impl<T> RepairListener<T> for Untouchable {
        type Data = ();

        fn removed(&mut self, _id: ElementId, _value: &T) {
            panic!("repair of a consistent set called the listener");
        }

        fn disposed(&mut self, _value: T, _data: ()) {
            panic!("repair of a consistent set called the listener");
        }

        fn pre_transfer(&mut self, _id: ElementId, _value: &T) {
            panic!("repair of a consistent set called the listener");
        }

        fn post_transfer(&mut self, _id: ElementId, _value: &T, _data: ()) {
            panic!("repair of a consistent set called the listener");
        }
    }

    #[test]
    fn repair_of_a_consistent_set_is_a_noop() {
        let set = mutable_set();
        set.add(Rc::new(Cell::new(1))).unwrap();
        set.add(Rc::new(Cell::new(2))).unwrap();
        let stamp = set.stamp(true);
        assert!(!set.repair(&mut Untouchable));
        assert_eq!(set.stamp(true), stamp);
    }

    #[test]
    fn chain_navigation() {
        let set = HashSet::new();
        assert_eq!(set.terminal_element(true), None);
        assert_eq!(set.terminal_element(false), None);
        let a = set.add(1u8).unwrap();
        let b = set.add(2).unwrap();
        let c = set.add(3).unwrap();
        assert_eq!(set.terminal_element(true), Some(a));
        assert_eq!(set.terminal_element(false), Some(c));
        assert_eq!(set.adjacent_element(b, true).unwrap(), Some(c));
        assert_eq!(set.adjacent_element(b, false).unwrap(), Some(a));
        assert_eq!(set.adjacent_element(a, false).unwrap(), None);
        assert_eq!(set.adjacent_element(c, true).unwrap(), None);
    }

    #[test]
    fn clear_resets_the_stamp_counters() {
        let set = HashSet::new();
        let a = set.add_first(1u32).unwrap();
        set.add(2).unwrap();
        set.clear();
        assert!(set.is_empty());
        assert!(!set.is_present(a));
        // Fresh stamps: a new front insert starts at −1 again, back at 0.
        let x = set.add(3).unwrap();
        let y = set.add_first(4).unwrap();
        assert_eq!(set.values(), vec![4, 3]);
        assert_eq!(set.compare_elements(y, x), Ordering::Less);
    }
}
