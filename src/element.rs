//! Element handles and the container contract.
//!
//! Every container in this crate exposes its values through opaque element identifiers. An
//! identifier names one occupied slot, stays valid while unrelated elements come and go, and
//! outlives its own element: once the slot is removed, the identifier merely starts answering
//! `false` to `is_present`, but it can still be compared and hashed forever.
//!
//! The `ElementContainer` trait is the contract the identifiers are used through. The element
//! "facets" (`CollectionElement`, `MutableElement`) are thin views pairing a container reference
//! with an identifier; they re-locate the slot on every call and cache nothing, so they can be
//! held across arbitrary mutation of the container.

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as Atomic};

/// The source of container identities.
///
/// Every container draws one value from this counter at construction, and brands the element
/// identifiers it hands out with it. This is what makes identifiers from distinct containers
/// never compare equal, and lets a container recognize (and refuse) a foreign identifier.
static CONTAINER_ID: AtomicU64 = AtomicU64::new(0);

/// Allocate a fresh container identity.
pub(crate) fn next_container_id() -> u64 {
    CONTAINER_ID.fetch_add(1, Atomic::Relaxed)
}

/// An opaque token identifying one occupied slot in a container.
///
/// Identifiers are cheap (`Copy`) and long-lived: they survive insertions and removals of other
/// elements, and removal of their own element only makes the container's `is_present` answer
/// `false` — equality and hashing keep working.
///
/// The *positional* total order of identifiers is a property of the container, not the token
/// (the token cannot know its current rank), so it is exposed as
/// [`ElementContainer::compare_elements`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementId {
    /// The identity of the container that issued this token.
    pub(crate) source: u64,
    /// The slab slot of the element.
    pub(crate) slot: u32,
    /// The generation the slot had when the element was created.
    ///
    /// Slots are reused; the generation is bumped on every removal, so a stale token can never
    /// resurrect against a newer occupant of the same slot.
    pub(crate) gen: u32,
    /// The creation sequence number of the element.
    ///
    /// This is the fallback order of identifiers whose element is gone: present elements compare
    /// by current position, dead ones by the order they were created in.
    pub(crate) seq: u64,
}

impl fmt::Debug for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ElementId({}:{}g{})", self.source, self.slot, self.gen)
    }
}

/// The reason a container (or a view of it) refuses an operation.
///
/// Query methods (`can_remove`, `is_acceptable`, `can_add`) answer `Option<Refusal>`: `None`
/// means the operation is permitted, `Some(reason)` explains the refusal. Performing the
/// operation anyway yields `Error::Refused` carrying the same reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Refusal {
    /// The operation is not supported by this container or view.
    Unsupported,
    /// An equivalent element is already present.
    ElementExists,
    /// The element is no longer present.
    NotFound,
    /// The value cannot be placed at this position (out of a view's bounds, or violating the
    /// container's ordering).
    IllegalElement,
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // The reason strings are a fixed vocabulary; callers match on them in messages.
        f.write_str(match *self {
            Refusal::Unsupported => "unsupported",
            Refusal::ElementExists => "element exists",
            Refusal::NotFound => "not found",
            Refusal::IllegalElement => "illegal element",
        })
    }
}

quick_error! {
    /// A container operation error.
    #[derive(Debug, PartialEq)]
    pub enum Error {
        /// The operation was refused for the contained reason.
        ///
        /// This is what the matching `can_*` query would have answered; performing the operation
        /// regardless turns the reason into an error.
        Refused(reason: Refusal) {
            description("operation refused")
            display("operation refused: {}", reason)
        }
        /// A structural change invalidated an iteration anchor.
        ///
        /// Cursors verify their anchor on every step; if the anchor (or a range bound) was
        /// removed underneath the cursor, the next step fails with this.
        Modified {
            description("concurrent modification")
            display("concurrent modification: an iteration anchor was removed")
        }
    }
}

impl Error {
    /// Shorthand for a refused-for-reason error.
    pub(crate) fn refused(reason: Refusal) -> Error {
        Error::Refused(reason)
    }
}

/// The contract of a container addressed through element handles.
///
/// Everything here takes `&self`: the container's locker arbitrates concurrent access
/// internally. Methods taking an `ElementId` panic if the identifier was issued by a *different*
/// container (that is a caller bug, not a recoverable condition); an identifier of a removed
/// element of *this* container is answered with `Refusal::NotFound`.
pub trait ElementContainer {
    /// The type of the values stored in the container.
    type Value;

    /// The number of present elements.
    fn len(&self) -> usize;

    /// Is the container empty?
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Does this identifier currently name a present element?
    ///
    /// Identifiers from other containers answer `false`.
    fn is_present(&self, id: ElementId) -> bool;

    /// Compare two identifiers by their position in this container.
    ///
    /// Two present elements compare by current position (so the order of handles matches the
    /// iteration order); once either element is removed, the comparison falls back to creation
    /// sequence. Panics if either identifier is foreign.
    fn compare_elements(&self, a: ElementId, b: ElementId) -> Ordering;

    /// The first (`first == true`) or last element, if any.
    fn terminal_element(&self, first: bool) -> Option<ElementId>;

    /// The element after (`next == true`) or before the given one, if any.
    fn adjacent_element(&self, id: ElementId, next: bool) -> Result<Option<ElementId>, Error>;

    /// Read the value of an element through a closure.
    fn get_with<R, F>(&self, id: ElementId, f: F) -> Result<R, Error>
        where F: FnOnce(&Self::Value) -> R;

    /// Read the value of an element by cloning it.
    fn get_cloned(&self, id: ElementId) -> Result<Self::Value, Error>
        where Self::Value: Clone
    {
        self.get_with(id, |value| value.clone())
    }

    /// Could the element be removed?
    fn can_remove(&self, id: ElementId) -> Result<Option<Refusal>, Error>;

    /// Could the element's value be replaced by `value`?
    fn is_acceptable(&self, id: ElementId, value: &Self::Value) -> Result<Option<Refusal>, Error>;

    /// Could `value` be added adjacent to the element?
    fn can_add(&self, id: ElementId, value: &Self::Value, before: bool)
               -> Result<Option<Refusal>, Error>;

    /// Replace the element's value, returning the old one. An update write.
    fn set_value(&self, id: ElementId, value: Self::Value) -> Result<Self::Value, Error>;

    /// Remove the element, returning its value. A structural write.
    fn remove_element(&self, id: ElementId) -> Result<Self::Value, Error>;

    /// Add `value` directly before or after the element. A structural write.
    fn add_adjacent(&self, id: ElementId, value: Self::Value, before: bool)
                    -> Result<ElementId, Error>;

    /// Remove every element. A structural write.
    fn clear(&self);

    /// The current stamp of the container.
    ///
    /// The structural stamp counts additions and removals; the general stamp counts every write.
    /// Both are monotone, so two equal readings bracket a span with no (structural) writes.
    fn stamp(&self, structural: bool) -> u64;

    /// A present element roughly midway between the two bounds, for cursor splitting.
    ///
    /// Containers without an efficient positional midpoint (the hash set's insertion-order
    /// chain) answer `None`, declining to split.
    fn split_point(&self, low: Option<ElementId>, high: Option<ElementId>) -> Option<ElementId>;

    /// An immutable element facet for the identifier.
    fn element(&self, id: ElementId) -> CollectionElement<Self>
        where Self: Sized
    {
        CollectionElement { source: self, id: id }
    }

    /// A mutable element facet for the identifier.
    fn mutable_element(&self, id: ElementId) -> MutableElement<Self>
        where Self: Sized
    {
        MutableElement { source: self, id: id }
    }

    /// A cursor over the whole container, positioned before the first element.
    fn cursor(&self) -> ::cursor::Cursor<Self>
        where Self: Sized
    {
        ::cursor::Cursor::over(self)
    }

    /// A cursor anchored at the given element, which becomes the first element yielded.
    fn cursor_from(&self, id: ElementId) -> ::cursor::Cursor<Self>
        where Self: Sized
    {
        ::cursor::Cursor::anchored(self, id)
    }
}

/// Value-addressed lookup, for containers that can find an element by value.
///
/// The matching rule is the container's own: the list matches by `PartialEq`, the hash set by
/// its equivalence, the sorted set by its comparator.
pub trait ValueFind: ElementContainer {
    /// Find an element holding (an equivalent of) `value`.
    fn element_of(&self, value: &Self::Value) -> Option<ElementId>;
}

/// An immutable element facet: a `(container, id)` pair yielding only the value.
///
/// The facet holds no interior pointers; every call re-locates the element, so the facet stays
/// sound across arbitrary container mutation.
pub struct CollectionElement<'a, C: ElementContainer + 'a> {
    /// The container the element lives in.
    source: &'a C,
    /// The element's identifier.
    id: ElementId,
}

impl<'a, C: ElementContainer> CollectionElement<'a, C> {
    /// The element's identifier.
    pub fn id(&self) -> ElementId {
        self.id
    }

    /// Is the element still present?
    pub fn is_present(&self) -> bool {
        self.source.is_present(self.id)
    }

    /// Read the value through a closure.
    pub fn get_with<R, F>(&self, f: F) -> Result<R, Error>
        where F: FnOnce(&C::Value) -> R
    {
        self.source.get_with(self.id, f)
    }

    /// Read the value by cloning it.
    pub fn get(&self) -> Result<C::Value, Error>
        where C::Value: Clone
    {
        self.source.get_cloned(self.id)
    }
}

/// A mutable element facet: the immutable facet plus probes and mutators.
///
/// The probes (`can_remove`, `is_acceptable`, `can_add`) answer `None` when the matching
/// mutator would succeed, and the refusal reason otherwise. They never mutate, so a facet
/// obtained inside a read transaction may probe freely; invoking a mutator escalates to the
/// required write lock.
pub struct MutableElement<'a, C: ElementContainer + 'a> {
    /// The container the element lives in.
    source: &'a C,
    /// The element's identifier.
    id: ElementId,
}

impl<'a, C: ElementContainer> MutableElement<'a, C> {
    /// The element's identifier.
    pub fn id(&self) -> ElementId {
        self.id
    }

    /// Is the element still present?
    pub fn is_present(&self) -> bool {
        self.source.is_present(self.id)
    }

    /// Read the value through a closure.
    pub fn get_with<R, F>(&self, f: F) -> Result<R, Error>
        where F: FnOnce(&C::Value) -> R
    {
        self.source.get_with(self.id, f)
    }

    /// Read the value by cloning it.
    pub fn get(&self) -> Result<C::Value, Error>
        where C::Value: Clone
    {
        self.source.get_cloned(self.id)
    }

    /// Could the element be removed?
    pub fn can_remove(&self) -> Result<Option<Refusal>, Error> {
        self.source.can_remove(self.id)
    }

    /// Could the element's value be replaced by `value`?
    pub fn is_acceptable(&self, value: &C::Value) -> Result<Option<Refusal>, Error> {
        self.source.is_acceptable(self.id, value)
    }

    /// Could `value` be added adjacent to this element?
    pub fn can_add(&self, value: &C::Value, before: bool) -> Result<Option<Refusal>, Error> {
        self.source.can_add(self.id, value, before)
    }

    /// Replace the element's value, returning the old one.
    pub fn set(&self, value: C::Value) -> Result<C::Value, Error> {
        self.source.set_value(self.id, value)
    }

    /// Remove the element, returning its value.
    pub fn remove(&self) -> Result<C::Value, Error> {
        self.source.remove_element(self.id)
    }

    /// Add `value` directly before or after this element.
    pub fn add(&self, value: C::Value, before: bool) -> Result<ElementId, Error> {
        self.source.add_adjacent(self.id, value, before)
    }
}

/// A listener riding along with consistency repair.
///
/// Repair moves entries whose current key no longer matches their stored position. Two things
/// can happen to an entry, and the listener hears about both:
///
/// - *Transfer*: the entry moves to the position its current key demands. `pre_transfer` runs
///   before the move and may return opaque data; `post_transfer` receives the data back after
///   the move.
/// - *Collision*: the target position is already occupied by an equivalent entry. The incumbent
///   is removed; `removed` fires first (returning opaque data), and once the incumbent's value
///   is carved out of the container, `disposed` receives the value together with the data.
///
/// `()` implements the listener with no data, for callers who only want the repair itself.
pub trait RepairListener<T> {
    /// The data carried from the pre-callbacks to the post-callbacks.
    type Data;

    /// An incumbent entry at the repaired entry's target position is about to be removed.
    fn removed(&mut self, id: ElementId, value: &T) -> Self::Data;

    /// The incumbent's value has been carved out of the container.
    ///
    /// Fires only after `removed` has fired for the same entry.
    fn disposed(&mut self, value: T, data: Self::Data);

    /// The entry is about to be moved to the position its current key demands.
    fn pre_transfer(&mut self, id: ElementId, value: &T) -> Self::Data;

    /// The entry has been moved; `data` is what `pre_transfer` returned.
    fn post_transfer(&mut self, id: ElementId, value: &T, data: Self::Data);
}

impl<T> RepairListener<T> for () {
    type Data = ();

    fn removed(&mut self, _id: ElementId, _value: &T) {}

    fn disposed(&mut self, _value: T, _data: ()) {}

    fn pre_transfer(&mut self, _id: ElementId, _value: &T) {}

    fn post_transfer(&mut self, _id: ElementId, _value: &T, _data: ()) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusal_strings() {
        assert_eq!(Refusal::Unsupported.to_string(), "unsupported");
        assert_eq!(Refusal::ElementExists.to_string(), "element exists");
        assert_eq!(Refusal::NotFound.to_string(), "not found");
        assert_eq!(Refusal::IllegalElement.to_string(), "illegal element");
    }

    #[test]
    fn container_ids_are_distinct() {
        let a = next_container_id();
        let b = next_container_id();
        assert!(a != b);
    }

    #[test]
    fn foreign_ids_never_equal() {
        let a = ElementId { source: next_container_id(), slot: 0, gen: 0, seq: 0 };
        let b = ElementId { source: next_container_id(), slot: 0, gen: 0, seq: 0 };
        assert!(a != b);
        assert_eq!(a, a);
    }
}
