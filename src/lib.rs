//! Ordered collections with stable element handles.
//!
//! This crate implements a family of ordered containers — a positional list, a hash set, a sorted
//! set, and a sorted map — which share three capabilities that the standard containers lack:
//!
//! 1. **Stable element handles.** Every occupied slot is identified by an opaque, comparable
//!    token (`ElementId`) which stays valid across insertions and removals of *other* elements,
//!    and supports O(1) adjacency navigation. Tokens outlive their elements; removal is observed
//!    through `is_present`.
//! 2. **Stamped locking.** Each container is armed with a locking strategy providing shared and
//!    exclusive access in two separate domains (structural and update), stamped optimistic reads,
//!    and cross-thread modification detection. See the `lock` module.
//! 3. **Consistency repair.** Value-addressed containers (the hash set and the sorted
//!    containers) can detect entries whose hash or sort key was mutated out-of-band, and move
//!    them back to the position their current key demands, reporting collisions to a listener.
//!
//! All containers are backed by the same red-black tree engine with cached subtree sizes, so
//! positional queries (index of an element, element at an index) are O(log n), and the hash set's
//! collision chains are themselves balanced trees keyed by hash code.
//!
//! The containers take `&self` for every operation, including mutation; interior state is guarded
//! by the container's locker, so a container behind an `Arc` can be shared freely between
//! threads (given `Send + Sync` values).

#![deny(missing_docs)]

#[macro_use]
extern crate quick_error;
#[macro_use]
extern crate slog;
extern crate parking_lot;
extern crate seahash;

#[cfg(test)]
extern crate rand;

mod builder;
mod cursor;
mod element;
mod hash;
mod list;
mod node;
mod sorted;
pub mod lock;

#[cfg(test)]
mod tests;

pub use builder::{HashBuilder, Identity, ListBuilder, MapBuilder, SetBuilder};
pub use cursor::Cursor;
pub use element::{CollectionElement, ElementContainer, ElementId, Error, MutableElement,
                  Refusal, RepairListener, ValueFind};
pub use hash::HashSet;
pub use list::TreeList;
pub use lock::{LockStrategy, Locker};
pub use sorted::{SearchFilter, SubMap, SubSet, TreeMap, TreeSet};
