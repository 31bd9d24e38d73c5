//! The container builders.
//!
//! Every container is created through a builder carrying the options that make sense for it —
//! the type system plays the role of the option validator, so hash-only knobs (capacity, load
//! factor, equivalence) exist only on the hash builder and the comparator only on the sorted
//! ones. The options shared by all containers:
//!
//! - `locking` — the concurrency substrate: stamped (the default), fast-fail, or none.
//! - `description` — an opaque debug identifier, attached to the container's log context.
//! - `logger` — the `slog` exitpoint; everything is discarded without one.
//!
//! `build_from` loads initial contents before handing the container out; since nothing else can
//! observe it yet, this costs no contention.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use seahash::SeaHasher;
use slog::{Discard, Logger};

use hash::HashSet;
use list::TreeList;
use lock::{LockStrategy, Locker};
use sorted::{TreeMap, TreeSet};

/// The default rehash threshold of the hash set.
const DEFAULT_LOAD_FACTOR: f64 = 0.75;

/// The options every builder carries.
struct Common {
    /// The locking strategy.
    locking: LockStrategy,
    /// The opaque debug identifier.
    description: Option<String>,
    /// The log exitpoint.
    logger: Option<Logger>,
}

impl Common {
    fn new() -> Common {
        Common {
            locking: LockStrategy::Stamped,
            description: None,
            logger: None,
        }
    }

    /// Turn the options into the locker and the (description-tagged) logger.
    fn finish(self) -> (Locker, Logger) {
        let locker = Locker::new(self.locking);
        let logger = self.logger.unwrap_or_else(|| Logger::root(Discard, o!()));
        let logger = match self.description {
            Some(description) => logger.new(o!("collection" => description)),
            None => logger,
        };
        (locker, logger)
    }
}

/// Reference identity, for the hash set's `identity` equivalence.
///
/// An identity set hashes and compares the *referent address* of pointer-like values: two
/// clones of one `Rc` are the same element, while two separately allocated values that compare
/// equal by content are distinct elements.
pub trait Identity {
    /// The address standing for this value's identity.
    fn identity(&self) -> usize;
}

impl<'a, T> Identity for &'a T {
    fn identity(&self) -> usize {
        *self as *const T as usize
    }
}

impl<T> Identity for Box<T> {
    fn identity(&self) -> usize {
        &**self as *const T as usize
    }
}

impl<T> Identity for Rc<T> {
    fn identity(&self) -> usize {
        &**self as *const T as usize
    }
}

impl<T> Identity for Arc<T> {
    fn identity(&self) -> usize {
        &**self as *const T as usize
    }
}

/// A builder for [`TreeList`].
pub struct ListBuilder {
    common: Common,
}

impl ListBuilder {
    /// Start from the defaults.
    pub fn new() -> ListBuilder {
        ListBuilder { common: Common::new() }
    }

    /// Choose the locking strategy.
    pub fn locking(mut self, strategy: LockStrategy) -> ListBuilder {
        self.common.locking = strategy;
        self
    }

    /// Attach an opaque debug identifier.
    pub fn description<S: Into<String>>(mut self, description: S) -> ListBuilder {
        self.common.description = Some(description.into());
        self
    }

    /// Attach a log exitpoint.
    pub fn logger(mut self, logger: Logger) -> ListBuilder {
        self.common.logger = Some(logger);
        self
    }

    /// Build an empty list.
    pub fn build<T>(self) -> TreeList<T> {
        let (locker, logger) = self.common.finish();
        TreeList::with_options(locker, logger)
    }

    /// Build a list pre-loaded with `contents`, in order.
    pub fn build_from<T, I: IntoIterator<Item = T>>(self, contents: I) -> TreeList<T> {
        let list = self.build();
        for value in contents {
            list.add_last(value);
        }
        list
    }
}

impl Default for ListBuilder {
    fn default() -> ListBuilder {
        ListBuilder::new()
    }
}

/// A builder for [`HashSet`].
pub struct HashBuilder<T> {
    common: Common,
    /// The minimum number of entries to size the initial table for.
    initial_capacity: usize,
    /// The rehash threshold, in [0.2, 0.9].
    load_factor: f64,
    /// The hash half of the equivalence.
    hasher: Box<Fn(&T) -> u64 + Send + Sync>,
    /// The equality half of the equivalence.
    equals: Box<Fn(&T, &T) -> bool + Send + Sync>,
}

impl<T: Hash + PartialEq> HashBuilder<T> {
    /// Start from the defaults: seahash over `Hash`, `PartialEq` equality.
    pub fn new() -> HashBuilder<T> {
        HashBuilder::with_equivalence(Box::new(|value: &T| {
                                          let mut hasher = SeaHasher::new();
                                          value.hash(&mut hasher);
                                          hasher.finish()
                                      }),
                                      Box::new(|incumbent: &T, candidate: &T| {
                                          incumbent == candidate
                                      }))
    }
}

impl<T> HashBuilder<T> {
    /// Start from an explicit equivalence.
    pub(crate) fn with_equivalence(hasher: Box<Fn(&T) -> u64 + Send + Sync>,
                                   equals: Box<Fn(&T, &T) -> bool + Send + Sync>)
                                   -> HashBuilder<T> {
        HashBuilder {
            common: Common::new(),
            initial_capacity: 0,
            load_factor: DEFAULT_LOAD_FACTOR,
            hasher: hasher,
            equals: equals,
        }
    }

    /// Size the initial table for at least this many entries.
    pub fn capacity(mut self, entries: usize) -> HashBuilder<T> {
        self.initial_capacity = entries;
        self
    }

    /// Set the rehash threshold. Must lie in [0.2, 0.9].
    pub fn load_factor(mut self, load_factor: f64) -> HashBuilder<T> {
        assert!(load_factor >= 0.2 && load_factor <= 0.9,
                "load factor outside [0.2, 0.9]");
        self.load_factor = load_factor;
        self
    }

    /// Replace the equivalence.
    ///
    /// `equals` is always invoked as `equals(incumbent, candidate)` — the stored value first,
    /// the probe second. A symmetric predicate will not notice; an asymmetric one should count
    /// on that order.
    pub fn equivalence<H, E>(mut self, hasher: H, equals: E) -> HashBuilder<T>
        where H: Fn(&T) -> u64 + Send + Sync + 'static,
              E: Fn(&T, &T) -> bool + Send + Sync + 'static
    {
        self.hasher = Box::new(hasher);
        self.equals = Box::new(equals);
        self
    }

    /// Install reference identity as the equivalence; see [`Identity`].
    pub fn identity(self) -> HashBuilder<T>
        where T: Identity
    {
        self.equivalence(|value: &T| value.identity() as u64,
                         |incumbent: &T, candidate: &T| {
                             incumbent.identity() == candidate.identity()
                         })
    }

    /// Choose the locking strategy.
    pub fn locking(mut self, strategy: LockStrategy) -> HashBuilder<T> {
        self.common.locking = strategy;
        self
    }

    /// Attach an opaque debug identifier.
    pub fn description<S: Into<String>>(mut self, description: S) -> HashBuilder<T> {
        self.common.description = Some(description.into());
        self
    }

    /// Attach a log exitpoint.
    pub fn logger(mut self, logger: Logger) -> HashBuilder<T> {
        self.common.logger = Some(logger);
        self
    }

    /// Build an empty set.
    pub fn build(self) -> HashSet<T> {
        let (locker, logger) = self.common.finish();
        HashSet::with_options(locker,
                              logger,
                              self.hasher,
                              self.equals,
                              self.load_factor,
                              self.initial_capacity)
    }

    /// Build a set pre-loaded with `contents`, in order; duplicates collapse.
    pub fn build_from<I: IntoIterator<Item = T>>(self, contents: I) -> HashSet<T> {
        let set = self.build();
        for value in contents {
            let _ = set.get_or_add(value, None, None, false);
        }
        set
    }
}

impl<T: Hash + PartialEq> Default for HashBuilder<T> {
    fn default() -> HashBuilder<T> {
        HashBuilder::new()
    }
}

/// A builder for [`TreeSet`].
pub struct SetBuilder<T> {
    common: Common,
    /// The sort order.
    cmp: Box<Fn(&T, &T) -> Ordering + Send + Sync>,
}

impl<T: Ord> SetBuilder<T> {
    /// Start from the defaults: `Ord` order.
    pub fn new() -> SetBuilder<T> {
        SetBuilder::with_comparator(Box::new(|a: &T, b: &T| a.cmp(b)))
    }
}

impl<T> SetBuilder<T> {
    /// Start from an explicit comparator.
    pub(crate) fn with_comparator(cmp: Box<Fn(&T, &T) -> Ordering + Send + Sync>)
                                  -> SetBuilder<T> {
        SetBuilder { common: Common::new(), cmp: cmp }
    }

    /// Replace the comparator.
    pub fn comparator<C>(mut self, cmp: C) -> SetBuilder<T>
        where C: Fn(&T, &T) -> Ordering + Send + Sync + 'static
    {
        self.cmp = Box::new(cmp);
        self
    }

    /// Choose the locking strategy.
    pub fn locking(mut self, strategy: LockStrategy) -> SetBuilder<T> {
        self.common.locking = strategy;
        self
    }

    /// Attach an opaque debug identifier.
    pub fn description<S: Into<String>>(mut self, description: S) -> SetBuilder<T> {
        self.common.description = Some(description.into());
        self
    }

    /// Attach a log exitpoint.
    pub fn logger(mut self, logger: Logger) -> SetBuilder<T> {
        self.common.logger = Some(logger);
        self
    }

    /// Build an empty set.
    pub fn build(self) -> TreeSet<T> {
        let (locker, logger) = self.common.finish();
        TreeSet::with_options(locker, logger, self.cmp)
    }

    /// Build a set pre-loaded with `contents`; duplicates collapse.
    pub fn build_from<I: IntoIterator<Item = T>>(self, contents: I) -> TreeSet<T> {
        let set = self.build();
        for value in contents {
            let _ = set.get_or_add(value);
        }
        set
    }
}

impl<T: Ord> Default for SetBuilder<T> {
    fn default() -> SetBuilder<T> {
        SetBuilder::new()
    }
}

/// A builder for [`TreeMap`].
pub struct MapBuilder<K, V> {
    common: Common,
    /// The key order.
    cmp: Box<Fn(&K, &K) -> Ordering + Send + Sync>,
    _values: PhantomData<V>,
}

impl<K: Ord, V> MapBuilder<K, V> {
    /// Start from the defaults: `Ord` key order.
    pub fn new() -> MapBuilder<K, V> {
        MapBuilder::with_comparator(Box::new(|a: &K, b: &K| a.cmp(b)))
    }
}

impl<K, V> MapBuilder<K, V> {
    /// Start from an explicit key comparator.
    pub(crate) fn with_comparator(cmp: Box<Fn(&K, &K) -> Ordering + Send + Sync>)
                                  -> MapBuilder<K, V> {
        MapBuilder {
            common: Common::new(),
            cmp: cmp,
            _values: PhantomData,
        }
    }

    /// Replace the key comparator.
    pub fn comparator<C>(mut self, cmp: C) -> MapBuilder<K, V>
        where C: Fn(&K, &K) -> Ordering + Send + Sync + 'static
    {
        self.cmp = Box::new(cmp);
        self
    }

    /// Choose the locking strategy.
    pub fn locking(mut self, strategy: LockStrategy) -> MapBuilder<K, V> {
        self.common.locking = strategy;
        self
    }

    /// Attach an opaque debug identifier.
    pub fn description<S: Into<String>>(mut self, description: S) -> MapBuilder<K, V> {
        self.common.description = Some(description.into());
        self
    }

    /// Attach a log exitpoint.
    pub fn logger(mut self, logger: Logger) -> MapBuilder<K, V> {
        self.common.logger = Some(logger);
        self
    }

    /// Build an empty map.
    pub fn build(self) -> TreeMap<K, V> {
        let (locker, logger) = self.common.finish();
        TreeMap::with_options(locker, logger, self.cmp)
    }

    /// Build a map pre-loaded with `contents`; later duplicates replace earlier values.
    pub fn build_from<I: IntoIterator<Item = (K, V)>>(self, contents: I) -> TreeMap<K, V> {
        let map = self.build();
        for (key, value) in contents {
            let _ = map.put(key, value);
        }
        map
    }
}

impl<K: Ord, V> Default for MapBuilder<K, V> {
    fn default() -> MapBuilder<K, V> {
        MapBuilder::new()
    }
}
