//! The element cursor.
//!
//! A cursor is a bi-directional walk anchored at one element of a container. The anchor is an
//! element id, not an interior pointer, so the cursor tolerates arbitrary mutation of *other*
//! elements: on every step it merely asks the container for the anchor's neighbor. What it does
//! not tolerate is losing its anchor — if the anchor (or a range bound) is removed underneath
//! it, the next step fails with [`Error::Modified`], the distinguished
//! modification-under-iteration channel.
//!
//! The cursor holds no lock of its own. Each step takes the container's read lock reentrantly,
//! so a caller wanting a consistent sweep wraps the iteration in one read transaction on the
//! container's locker; a caller iterating bare gets the per-step guarantees only.
//!
//! `try_split` divides the remaining range in two for parallel consumption, when the container
//! can name a well-spaced element between the cursor's bounds (the tree containers bisect by
//! rank; the hash set's insertion-order chain declines).

use std::cmp::Ordering;

use element::{ElementContainer, ElementId, Error, Refusal};

/// A bi-directional, optionally splittable cursor over a container segment.
pub struct Cursor<'a, C: ElementContainer + 'a> {
    /// The container walked over.
    source: &'a C,
    /// The inclusive lower bound of the segment, `None` for the container's start.
    lower: Option<ElementId>,
    /// The inclusive upper bound of the segment, `None` for the container's end.
    upper: Option<ElementId>,
    /// The anchor element, `None` once the walk ran off an unbounded end.
    anchor: Option<ElementId>,
    /// Whether the anchor is the *next* element to yield walking forward (`true`), or the
    /// previously yielded one (`false`).
    anchor_is_next: bool,
}

impl<'a, C: ElementContainer> Cursor<'a, C> {
    /// A cursor over the whole container, positioned before the first element.
    pub fn over(source: &'a C) -> Cursor<'a, C> {
        Cursor {
            source: source,
            lower: None,
            upper: None,
            anchor: source.terminal_element(true),
            anchor_is_next: true,
        }
    }

    /// A cursor anchored at `id`, which becomes the first element yielded forward.
    pub fn anchored(source: &'a C, id: ElementId) -> Cursor<'a, C> {
        Cursor {
            source: source,
            lower: None,
            upper: None,
            anchor: Some(id),
            anchor_is_next: true,
        }
    }

    /// The current anchor, if any.
    pub fn anchor(&self) -> Option<ElementId> {
        self.anchor
    }

    /// Fail with the modification error if the anchor or a bound has been removed.
    fn check_anchors(&self, anchor: ElementId) -> Result<(), Error> {
        if !self.source.is_present(anchor) {
            return Err(Error::Modified);
        }
        for bound in &[self.lower, self.upper] {
            if let Some(bound) = *bound {
                if !self.source.is_present(bound) {
                    return Err(Error::Modified);
                }
            }
        }
        Ok(())
    }

    /// Is `id` inside the segment on the side being walked toward?
    fn within(&self, id: ElementId, forward: bool) -> bool {
        if forward {
            match self.upper {
                Some(upper) => self.source.compare_elements(id, upper) != Ordering::Greater,
                None => true,
            }
        } else {
            match self.lower {
                Some(lower) => self.source.compare_elements(id, lower) != Ordering::Less,
                None => true,
            }
        }
    }

    /// Yield the next element in the given direction, `None` at the segment end.
    ///
    /// Every step verifies that the anchor (and the bounds) are still present; a vanished
    /// anchor means the container was structurally changed underneath the cursor, surfaced as
    /// [`Error::Modified`]. Changes to any other element are invisible to the walk.
    pub fn advance(&mut self, forward: bool) -> Result<Option<ElementId>, Error> {
        let anchor = match self.anchor {
            Some(anchor) => anchor,
            None => return Ok(None),
        };
        self.check_anchors(anchor)?;
        if forward == self.anchor_is_next {
            // The anchor itself is the element on this side; yield it and flip over it.
            self.anchor_is_next = !forward;
            return Ok(Some(anchor));
        }
        let step = match self.source.adjacent_element(anchor, forward)? {
            Some(step) => step,
            None => return Ok(None),
        };
        if !self.within(step, forward) {
            return Ok(None);
        }
        self.anchor = Some(step);
        self.anchor_is_next = !forward;
        Ok(Some(step))
    }

    /// Walk the rest of the segment in one direction, feeding every element id to `action`.
    pub fn for_each<F>(&mut self, forward: bool, mut action: F) -> Result<(), Error>
        where F: FnMut(ElementId)
    {
        while let Some(id) = self.advance(forward)? {
            action(id);
        }
        Ok(())
    }

    /// Walk the rest of the segment, feeding every element id and value to `action`.
    pub fn for_each_value<F>(&mut self, forward: bool, mut action: F) -> Result<(), Error>
        where F: FnMut(ElementId, &C::Value)
    {
        while let Some(id) = self.advance(forward)? {
            self.source.get_with(id, |value| action(id, value))?;
        }
        Ok(())
    }

    /// Remove the anchor element through the cursor, answering its value.
    ///
    /// The anchor is advanced to its successor (falling back to the predecessor at the segment
    /// end) *before* the removal, so the walk continues seamlessly — this is the one legal way
    /// to remove the element a cursor stands on.
    pub fn remove_current(&mut self) -> Result<C::Value, Error> {
        let anchor = match self.anchor {
            Some(anchor) => anchor,
            None => return Err(Error::refused(Refusal::NotFound)),
        };
        self.check_anchors(anchor)?;
        let successor = match self.source.adjacent_element(anchor, true)? {
            Some(step) if self.within(step, true) => Some((step, true)),
            _ => match self.source.adjacent_element(anchor, false)? {
                Some(step) if self.within(step, false) => Some((step, false)),
                _ => None,
            },
        };
        match successor {
            Some((step, forward)) => {
                self.anchor = Some(step);
                // A forward fallback is next to yield; a backward one was conceptually
                // already passed.
                self.anchor_is_next = forward;
            }
            None => self.anchor = None,
        }
        self.source.remove_element(anchor)
    }

    /// Split the remaining forward range in two, if the container can bisect it.
    ///
    /// On success, this cursor keeps the first half and the returned cursor owns the second;
    /// the two share the container but yield disjoint elements. Containers without positional
    /// structure (the hash set) never split.
    pub fn try_split(&mut self) -> Option<Cursor<'a, C>> {
        let anchor = self.anchor?;
        let mid = self.source.split_point(Some(anchor), self.upper)?;
        if self.source.compare_elements(mid, anchor) != Ordering::Greater {
            return None;
        }
        let boundary = match self.source.adjacent_element(mid, false) {
            Ok(Some(boundary)) => boundary,
            _ => return None,
        };
        let other = Cursor {
            source: self.source,
            lower: Some(mid),
            upper: self.upper,
            anchor: Some(mid),
            anchor_is_next: true,
        };
        self.upper = Some(boundary);
        Some(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use element::ElementContainer;
    use hash::HashSet;
    use list::TreeList;

    #[test]
    fn walks_both_directions() {
        let list = TreeList::new();
        for i in 0..5 {
            list.add_last(i);
        }
        let mut cursor = list.cursor();
        let mut seen = Vec::new();
        cursor.for_each_value(true, |_, value| seen.push(*value)).unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        // The cursor now stands past the end; walking back yields everything reversed.
        let mut seen = Vec::new();
        cursor.for_each_value(false, |_, value| seen.push(*value)).unwrap();
        assert_eq!(seen, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn tolerates_mutation_of_other_elements() {
        let list = TreeList::new();
        let ids: Vec<_> = "abcde".chars().map(|c| list.add_last(c)).collect();
        let mut cursor = list.cursor_from(ids[0]);
        assert_eq!(cursor.advance(true).unwrap(), Some(ids[0]));

        // Remove an element the cursor is not standing on.
        list.remove_element(ids[2]).unwrap();

        let mut rest = Vec::new();
        cursor.for_each_value(true, |_, value| rest.push(*value)).unwrap();
        assert_eq!(rest, vec!['b', 'd', 'e']);
    }

    #[test]
    fn losing_the_anchor_is_a_modification_error() {
        let list = TreeList::new();
        let a = list.add_last(1);
        list.add_last(2);
        let mut cursor = list.cursor_from(a);
        assert_eq!(cursor.advance(true).unwrap(), Some(a));
        // The anchor is removed behind the cursor's back.
        list.remove_element(a).unwrap();
        assert_eq!(cursor.advance(true), Err(Error::Modified));
    }

    #[test]
    fn remove_current_advances_first() {
        let list = TreeList::new();
        for c in "abc".chars() {
            list.add_last(c);
        }
        let mut cursor = list.cursor();
        cursor.advance(true).unwrap();
        assert_eq!(cursor.remove_current().unwrap(), 'a');
        // The walk continues at the successor; no modification error.
        let mut rest = Vec::new();
        cursor.for_each_value(true, |_, value| rest.push(*value)).unwrap();
        assert_eq!(rest, vec!['b', 'c']);
        assert_eq!(list.values(), vec!['b', 'c']);
    }

    #[test]
    fn remove_current_at_the_end_falls_back() {
        let list = TreeList::new();
        list.add_last(1);
        let b = list.add_last(2);
        let mut cursor = list.cursor_from(b);
        cursor.advance(true).unwrap();
        assert_eq!(cursor.remove_current().unwrap(), 2);
        // Fell back to the predecessor, which was already conceptually passed.
        assert_eq!(cursor.advance(true).unwrap(), None);
        assert_eq!(cursor.advance(false).unwrap().map(|id| list.get_cloned(id).unwrap()),
                   Some(1));
    }

    #[test]
    fn split_covers_the_range_disjointly() {
        let list = TreeList::new();
        for i in 0..16 {
            list.add_last(i);
        }
        let mut first = list.cursor();
        let mut second = first.try_split().expect("a 16-element list splits");

        let mut left = Vec::new();
        first.for_each_value(true, |_, value| left.push(*value)).unwrap();
        let mut right = Vec::new();
        second.for_each_value(true, |_, value| right.push(*value)).unwrap();

        assert!(!left.is_empty());
        assert!(!right.is_empty());
        let mut all = left.clone();
        all.extend(right.iter().cloned());
        assert_eq!(all, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn tiny_ranges_do_not_split() {
        let list = TreeList::new();
        list.add_last(1);
        list.add_last(2);
        let mut cursor = list.cursor();
        assert!(cursor.try_split().is_none());
    }

    #[test]
    fn hash_cursor_follows_the_chain_and_declines_split() {
        let set = HashSet::new();
        set.add_first(2u32).unwrap();
        set.add(3).unwrap();
        set.add_first(1).unwrap();
        let mut cursor = set.cursor();
        assert!(cursor.try_split().is_none());
        let mut seen = Vec::new();
        cursor.for_each_value(true, |_, value| seen.push(*value)).unwrap();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn empty_container_cursor() {
        let list: TreeList<u8> = TreeList::new();
        let mut cursor = list.cursor();
        assert_eq!(cursor.advance(true).unwrap(), None);
        assert_eq!(cursor.advance(false).unwrap(), None);
        assert!(cursor.try_split().is_none());
    }
}
