//! The red-black forest.
//!
//! Every container in the crate stores its elements in one of these: a slab of red-black nodes
//! addressed by slot index. The slab ("forest") can carry several independent trees at once —
//! the hash set keeps one small tree per bucket in a single shared forest — so all tree
//! operations take the root explicitly.
//!
//! Three properties matter to the containers:
//!
//! - **Slot identity is element identity.** A node never moves between slots, and removal never
//!   copies a surviving value into another node: the CLRS two-children case is implemented by
//!   transplanting the *successor node itself* into the removed node's place. This is what keeps
//!   element handles stable. Freed slots bump their generation before reuse, so a stale handle
//!   can never alias a newer occupant.
//! - **Cached subtree sizes.** Every node counts the nodes beneath it, maintained along
//!   rotations and attach/detach paths, giving O(log n) `rank` and `select`.
//! - **Validated walks.** `find_closest` re-checks a caller-supplied validator at every step and
//!   gives up when it trips, which is how optimistic traversal aborts cleanly.
//!
//! The forest is a pure data structure: callers are responsible for holding whatever lock the
//! surrounding container requires.

use std::cmp::Ordering;

/// The null slot.
pub const NIL: u32 = !0;

/// Which candidate a closest-match search settles for when there is no exact match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchFilter {
    /// The greatest element below the target, or nothing.
    Less,
    /// The greatest element below the target, else the least above it.
    PreferLess,
    /// An exact match or nothing.
    OnlyMatch,
    /// The least element above the target, else the greatest below it.
    PreferGreater,
    /// The least element above the target, or nothing.
    Greater,
}

/// One tree node.
pub struct Node<T> {
    /// The stored value.
    pub value: T,
    /// The creation sequence number, immutable for the node's lifetime.
    pub seq: u64,
    /// The parent slot, `NIL` at a root.
    parent: u32,
    /// The left child slot.
    left: u32,
    /// The right child slot.
    right: u32,
    /// The number of nodes in this subtree, including this one.
    size: u32,
    /// The color: red or black.
    red: bool,
}

/// One slab slot.
struct Slot<T> {
    /// The reuse generation. Bumped when the slot is freed, so old handles die with the element.
    gen: u32,
    /// The node, if the slot is occupied.
    node: Option<Node<T>>,
}

/// A slab of red-black nodes carrying any number of trees.
pub struct Forest<T> {
    /// The slots.
    slots: Vec<Slot<T>>,
    /// Free slot indices, reused before the slab grows.
    free: Vec<u32>,
    /// The next creation sequence number.
    next_seq: u64,
}

impl<T> Forest<T> {
    /// Create an empty forest.
    pub fn new() -> Forest<T> {
        Forest {
            slots: Vec::new(),
            free: Vec::new(),
            next_seq: 0,
        }
    }

    /// Allocate a detached node holding `value`.
    ///
    /// The node starts red, size one, with no links; it must be attached (or freed) by the
    /// caller.
    pub fn alloc(&mut self, value: T) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let node = Node {
            value: value,
            seq: seq,
            parent: NIL,
            left: NIL,
            right: NIL,
            size: 1,
            red: true,
        };
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize].node = Some(node);
                slot
            }
            None => {
                self.slots.push(Slot { gen: 0, node: Some(node) });
                (self.slots.len() - 1) as u32
            }
        }
    }

    /// Free a detached node, returning its value. The slot's generation is bumped.
    pub fn release(&mut self, slot: u32) -> T {
        let entry = &mut self.slots[slot as usize];
        entry.gen = entry.gen.wrapping_add(1);
        let node = entry.node.take().expect("releasing a vacant slot");
        self.free.push(slot);
        node.value
    }

    /// Free every occupied slot, bumping all generations.
    pub fn release_all(&mut self) {
        for (index, entry) in self.slots.iter_mut().enumerate() {
            if entry.node.take().is_some() {
                entry.gen = entry.gen.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
    }

    /// Does `(slot, gen)` name a present element?
    pub fn contains(&self, slot: u32, gen: u32) -> bool {
        match self.slots.get(slot as usize) {
            Some(entry) => entry.gen == gen && entry.node.is_some(),
            None => false,
        }
    }

    /// The current generation of a slot.
    pub fn gen_of(&self, slot: u32) -> u32 {
        self.slots[slot as usize].gen
    }

    /// The node at an occupied slot.
    pub fn node(&self, slot: u32) -> &Node<T> {
        self.slots[slot as usize].node.as_ref().expect("vacant node slot")
    }

    /// The node at an occupied slot, mutably.
    pub fn node_mut(&mut self, slot: u32) -> &mut Node<T> {
        self.slots[slot as usize].node.as_mut().expect("vacant node slot")
    }

    /// The value at an occupied slot.
    pub fn value(&self, slot: u32) -> &T {
        &self.node(slot).value
    }

    /// The value at an occupied slot, mutably.
    pub fn value_mut(&mut self, slot: u32) -> &mut T {
        &mut self.node_mut(slot).value
    }

    /// The size of a subtree, tolerating `NIL`.
    fn size(&self, slot: u32) -> u32 {
        if slot == NIL { 0 } else { self.node(slot).size }
    }

    /// The number of nodes under a root, tolerating `NIL`.
    pub fn total(&self, root: u32) -> usize {
        self.size(root) as usize
    }

    /// The leftmost node under `root`, or `NIL`.
    pub fn first(&self, root: u32) -> u32 {
        let mut slot = root;
        if slot == NIL {
            return NIL;
        }
        loop {
            let left = self.node(slot).left;
            if left == NIL {
                return slot;
            }
            slot = left;
        }
    }

    /// The rightmost node under `root`, or `NIL`.
    pub fn last(&self, root: u32) -> u32 {
        let mut slot = root;
        if slot == NIL {
            return NIL;
        }
        loop {
            let right = self.node(slot).right;
            if right == NIL {
                return slot;
            }
            slot = right;
        }
    }

    /// The in-order successor within the node's tree, or `NIL`.
    pub fn successor(&self, slot: u32) -> u32 {
        let right = self.node(slot).right;
        if right != NIL {
            return self.first(right);
        }
        let mut child = slot;
        let mut parent = self.node(slot).parent;
        while parent != NIL && self.node(parent).right == child {
            child = parent;
            parent = self.node(parent).parent;
        }
        parent
    }

    /// The in-order predecessor within the node's tree, or `NIL`.
    pub fn predecessor(&self, slot: u32) -> u32 {
        let left = self.node(slot).left;
        if left != NIL {
            return self.last(left);
        }
        let mut child = slot;
        let mut parent = self.node(slot).parent;
        while parent != NIL && self.node(parent).left == child {
            child = parent;
            parent = self.node(parent).parent;
        }
        parent
    }

    /// The number of nodes before this one in its tree. O(log n) through the size cache.
    pub fn rank(&self, slot: u32) -> usize {
        let mut before = self.size(self.node(slot).left) as usize;
        let mut child = slot;
        let mut parent = self.node(slot).parent;
        while parent != NIL {
            if self.node(parent).right == child {
                before += self.size(self.node(parent).left) as usize + 1;
            }
            child = parent;
            parent = self.node(parent).parent;
        }
        before
    }

    /// The node at in-order position `index` under `root`, or `NIL` when out of bounds.
    pub fn select(&self, root: u32, mut index: usize) -> u32 {
        let mut slot = root;
        while slot != NIL {
            let before = self.size(self.node(slot).left) as usize;
            if index < before {
                slot = self.node(slot).left;
            } else if index == before {
                return slot;
            } else {
                index -= before + 1;
                slot = self.node(slot).right;
            }
        }
        NIL
    }

    /// Attach a freshly allocated node directly before or after `anchor`.
    ///
    /// An `anchor` of `NIL` attaches into an empty tree (the root must be `NIL`). Rebalances and
    /// maintains sizes.
    pub fn attach(&mut self, root: &mut u32, anchor: u32, before: bool, slot: u32) {
        if anchor == NIL {
            debug_assert_eq!(*root, NIL);
            *root = slot;
            self.node_mut(slot).red = false;
            return;
        }
        // The in-order neighbor position: hang off the anchor's free side, or off the
        // nearest-in-order descendant on the occupied side.
        let parent = if before {
            let left = self.node(anchor).left;
            if left == NIL {
                self.node_mut(anchor).left = slot;
                anchor
            } else {
                let parent = self.last(left);
                self.node_mut(parent).right = slot;
                parent
            }
        } else {
            let right = self.node(anchor).right;
            if right == NIL {
                self.node_mut(anchor).right = slot;
                anchor
            } else {
                let parent = self.first(right);
                self.node_mut(parent).left = slot;
                parent
            }
        };
        self.node_mut(slot).parent = parent;

        // Every ancestor gained a node.
        let mut ancestor = parent;
        while ancestor != NIL {
            self.node_mut(ancestor).size += 1;
            ancestor = self.node(ancestor).parent;
        }

        self.insert_fixup(root, slot);
    }

    /// Unlink a node from its tree, leaving the slot occupied but detached.
    ///
    /// The caller either re-attaches the node (possibly under another root — that is how the
    /// hash set migrates entries between buckets) after [`Forest::reset_links`], or frees it
    /// with [`Forest::release`]. Rebalances and maintains sizes.
    pub fn detach(&mut self, root: &mut u32, z: u32) {
        let z_left = self.node(z).left;
        let z_right = self.node(z).right;

        // `y` is the node that physically leaves its place: `z` itself when it has at most one
        // child, else its successor (which has no left child).
        let y = if z_left == NIL || z_right == NIL { z } else { self.first(z_right) };
        let y_red = self.node(y).red;
        let y_left = self.node(y).left;
        let x = if y_left != NIL { y_left } else { self.node(y).right };
        let x_parent;

        // Every proper ancestor of `y` loses one node. When `y != z` this walk passes through
        // `z`, whose decremented size is exactly the size `y` will take over.
        let mut ancestor = self.node(y).parent;
        while ancestor != NIL {
            self.node_mut(ancestor).size -= 1;
            ancestor = self.node(ancestor).parent;
        }

        if y == z {
            x_parent = self.node(z).parent;
            self.transplant(root, z, x);
        } else {
            let z_size = self.node(z).size;
            if self.node(y).parent == z {
                x_parent = y;
            } else {
                x_parent = self.node(y).parent;
                self.transplant(root, y, x);
                let z_right = self.node(z).right;
                self.node_mut(y).right = z_right;
                self.node_mut(z_right).parent = y;
            }
            // The successor node itself takes z's place: same position, same color, z's (already
            // decremented) size. The value never moves, so y's handle stays valid.
            self.transplant(root, z, y);
            self.node_mut(y).left = z_left;
            self.node_mut(z_left).parent = y;
            let z_red = self.node(z).red;
            self.node_mut(y).red = z_red;
            self.node_mut(y).size = z_size;
        }

        if !y_red {
            self.delete_fixup(root, x, x_parent);
        }

        self.reset_links(z);
    }

    /// Reset a detached node to the freshly-allocated link state, ready for re-attachment.
    pub fn reset_links(&mut self, slot: u32) {
        let node = self.node_mut(slot);
        node.parent = NIL;
        node.left = NIL;
        node.right = NIL;
        node.size = 1;
        node.red = true;
    }

    /// Replace the subtree rooted at `u` by the one rooted at `v` (`v` may be `NIL`).
    fn transplant(&mut self, root: &mut u32, u: u32, v: u32) {
        let parent = self.node(u).parent;
        if parent == NIL {
            *root = v;
        } else if self.node(parent).left == u {
            self.node_mut(parent).left = v;
        } else {
            self.node_mut(parent).right = v;
        }
        if v != NIL {
            self.node_mut(v).parent = parent;
        }
    }

    /// Left rotation around `x`. Sizes are carried over locally.
    fn rotate_left(&mut self, root: &mut u32, x: u32) {
        let y = self.node(x).right;
        debug_assert!(y != NIL);
        let y_left = self.node(y).left;
        self.node_mut(x).right = y_left;
        if y_left != NIL {
            self.node_mut(y_left).parent = x;
        }
        let x_parent = self.node(x).parent;
        self.node_mut(y).parent = x_parent;
        if x_parent == NIL {
            *root = y;
        } else if self.node(x_parent).left == x {
            self.node_mut(x_parent).left = y;
        } else {
            self.node_mut(x_parent).right = y;
        }
        self.node_mut(y).left = x;
        self.node_mut(x).parent = y;
        // y now spans what x spanned; x is recomputed from its children.
        let x_size = self.node(x).size;
        self.node_mut(y).size = x_size;
        let new_x_size = self.size(self.node(x).left) + self.size(self.node(x).right) + 1;
        self.node_mut(x).size = new_x_size;
    }

    /// Right rotation around `x`. Mirror of [`Forest::rotate_left`].
    fn rotate_right(&mut self, root: &mut u32, x: u32) {
        let y = self.node(x).left;
        debug_assert!(y != NIL);
        let y_right = self.node(y).right;
        self.node_mut(x).left = y_right;
        if y_right != NIL {
            self.node_mut(y_right).parent = x;
        }
        let x_parent = self.node(x).parent;
        self.node_mut(y).parent = x_parent;
        if x_parent == NIL {
            *root = y;
        } else if self.node(x_parent).left == x {
            self.node_mut(x_parent).left = y;
        } else {
            self.node_mut(x_parent).right = y;
        }
        self.node_mut(y).right = x;
        self.node_mut(x).parent = y;
        let x_size = self.node(x).size;
        self.node_mut(y).size = x_size;
        let new_x_size = self.size(self.node(x).left) + self.size(self.node(x).right) + 1;
        self.node_mut(x).size = new_x_size;
    }

    /// Restore the red-black invariants after attaching the red node `x`.
    fn insert_fixup(&mut self, root: &mut u32, mut x: u32) {
        while x != *root {
            let parent = self.node(x).parent;
            if !self.node(parent).red {
                break;
            }
            // A red parent is never the root, so the grandparent exists.
            let grand = self.node(parent).parent;
            if parent == self.node(grand).left {
                let uncle = self.node(grand).right;
                if uncle != NIL && self.node(uncle).red {
                    self.node_mut(parent).red = false;
                    self.node_mut(uncle).red = false;
                    self.node_mut(grand).red = true;
                    x = grand;
                } else {
                    if x == self.node(parent).right {
                        x = parent;
                        self.rotate_left(root, x);
                    }
                    let parent = self.node(x).parent;
                    let grand = self.node(parent).parent;
                    self.node_mut(parent).red = false;
                    self.node_mut(grand).red = true;
                    self.rotate_right(root, grand);
                }
            } else {
                let uncle = self.node(grand).left;
                if uncle != NIL && self.node(uncle).red {
                    self.node_mut(parent).red = false;
                    self.node_mut(uncle).red = false;
                    self.node_mut(grand).red = true;
                    x = grand;
                } else {
                    if x == self.node(parent).left {
                        x = parent;
                        self.rotate_right(root, x);
                    }
                    let parent = self.node(x).parent;
                    let grand = self.node(parent).parent;
                    self.node_mut(parent).red = false;
                    self.node_mut(grand).red = true;
                    self.rotate_left(root, grand);
                }
            }
        }
        let top = *root;
        self.node_mut(top).red = false;
    }

    /// Restore the red-black invariants after detaching a black node.
    ///
    /// `x` is the node that took the detached node's place (possibly `NIL`), `x_parent` its
    /// parent, tracked explicitly because `x` may be `NIL`.
    fn delete_fixup(&mut self, root: &mut u32, mut x: u32, mut x_parent: u32) {
        while x != *root && (x == NIL || !self.node(x).red) {
            if x_parent == NIL {
                break;
            }
            if x == self.node(x_parent).left {
                let mut w = self.node(x_parent).right;
                if w != NIL && self.node(w).red {
                    self.node_mut(w).red = false;
                    self.node_mut(x_parent).red = true;
                    self.rotate_left(root, x_parent);
                    w = self.node(x_parent).right;
                }
                if w == NIL {
                    x = x_parent;
                    x_parent = self.node(x).parent;
                    continue;
                }
                let w_left = self.node(w).left;
                let w_right = self.node(w).right;
                let left_red = w_left != NIL && self.node(w_left).red;
                let right_red = w_right != NIL && self.node(w_right).red;
                if !left_red && !right_red {
                    self.node_mut(w).red = true;
                    x = x_parent;
                    x_parent = self.node(x).parent;
                } else {
                    if !right_red {
                        self.node_mut(w_left).red = false;
                        self.node_mut(w).red = true;
                        self.rotate_right(root, w);
                        w = self.node(x_parent).right;
                    }
                    let parent_red = self.node(x_parent).red;
                    self.node_mut(w).red = parent_red;
                    self.node_mut(x_parent).red = false;
                    let w_right = self.node(w).right;
                    if w_right != NIL {
                        self.node_mut(w_right).red = false;
                    }
                    self.rotate_left(root, x_parent);
                    x = *root;
                    x_parent = NIL;
                }
            } else {
                let mut w = self.node(x_parent).left;
                if w != NIL && self.node(w).red {
                    self.node_mut(w).red = false;
                    self.node_mut(x_parent).red = true;
                    self.rotate_right(root, x_parent);
                    w = self.node(x_parent).left;
                }
                if w == NIL {
                    x = x_parent;
                    x_parent = self.node(x).parent;
                    continue;
                }
                let w_left = self.node(w).left;
                let w_right = self.node(w).right;
                let left_red = w_left != NIL && self.node(w_left).red;
                let right_red = w_right != NIL && self.node(w_right).red;
                if !left_red && !right_red {
                    self.node_mut(w).red = true;
                    x = x_parent;
                    x_parent = self.node(x).parent;
                } else {
                    if !left_red {
                        self.node_mut(w_right).red = false;
                        self.node_mut(w).red = true;
                        self.rotate_left(root, w);
                        w = self.node(x_parent).left;
                    }
                    let parent_red = self.node(x_parent).red;
                    self.node_mut(w).red = parent_red;
                    self.node_mut(x_parent).red = false;
                    let w_left = self.node(w).left;
                    if w_left != NIL {
                        self.node_mut(w_left).red = false;
                    }
                    self.rotate_right(root, x_parent);
                    x = *root;
                    x_parent = NIL;
                }
            }
        }
        if x != NIL {
            self.node_mut(x).red = false;
        }
    }

    /// Walk from `root` toward the element closest to a target described by `cmp`.
    ///
    /// `cmp(element)` answers how the *element* compares against the target: `Less` means the
    /// element sits below it. An exact match is always preferred; otherwise the filter picks
    /// among the nearest element on either side. The `validator` is consulted before every step;
    /// when it trips the walk aborts with `None`, which is how optimistic traversal bails out.
    pub fn find_closest<F>(&self,
                           root: u32,
                           mut cmp: F,
                           filter: SearchFilter,
                           validator: &Fn() -> bool)
                           -> Option<u32>
        where F: FnMut(&T) -> Ordering
    {
        let mut slot = root;
        let mut below = NIL;
        let mut above = NIL;
        while slot != NIL {
            if !validator() {
                return None;
            }
            match cmp(&self.node(slot).value) {
                Ordering::Equal => return Some(slot),
                Ordering::Less => {
                    below = slot;
                    slot = self.node(slot).right;
                }
                Ordering::Greater => {
                    above = slot;
                    slot = self.node(slot).left;
                }
            }
        }
        let below = if below == NIL { None } else { Some(below) };
        let above = if above == NIL { None } else { Some(above) };
        match filter {
            SearchFilter::OnlyMatch => None,
            SearchFilter::Less => below,
            SearchFilter::Greater => above,
            SearchFilter::PreferLess => below.or(above),
            SearchFilter::PreferGreater => above.or(below),
        }
    }

    /// Like [`Forest::find_closest`], but answering the in-order index of the match, or
    /// `-(insertion index + 1)` when there is none.
    pub fn index_of<F>(&self, root: u32, mut cmp: F) -> isize
        where F: FnMut(&T) -> Ordering
    {
        let mut slot = root;
        // Number of elements known to sit before the current subtree.
        let mut before = 0usize;
        while slot != NIL {
            let left = self.size(self.node(slot).left) as usize;
            match cmp(&self.node(slot).value) {
                Ordering::Equal => return (before + left) as isize,
                Ordering::Less => {
                    before += left + 1;
                    slot = self.node(slot).right;
                }
                Ordering::Greater => slot = self.node(slot).left,
            }
        }
        -(before as isize) - 1
    }
}

#[cfg(test)]
impl<T> Forest<T> {
    /// Assert every red-black, size, and parent-link invariant under `root`; answers the black
    /// height.
    pub fn audit(&self, root: u32) -> usize {
        if root == NIL {
            return 1;
        }
        assert!(!self.node(root).red, "red root");
        assert_eq!(self.node(root).parent, NIL, "root with a parent");
        self.audit_node(root)
    }

    fn audit_node(&self, slot: u32) -> usize {
        let node = self.node(slot);
        if node.red {
            for &child in &[node.left, node.right] {
                assert!(child == NIL || !self.node(child).red, "red node with red child");
            }
        }
        let left_height = if node.left == NIL {
            1
        } else {
            assert_eq!(self.node(node.left).parent, slot, "broken parent link");
            self.audit_node(node.left)
        };
        let right_height = if node.right == NIL {
            1
        } else {
            assert_eq!(self.node(node.right).parent, slot, "broken parent link");
            self.audit_node(node.right)
        };
        assert_eq!(left_height, right_height, "unequal black heights");
        assert_eq!(node.size,
                   self.size(node.left) + self.size(node.right) + 1,
                   "wrong cached size");
        left_height + if node.red { 0 } else { 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Collect the in-order values under `root`.
    fn walk(forest: &Forest<u64>, root: u32) -> Vec<u64> {
        let mut out = Vec::new();
        let mut slot = forest.first(root);
        while slot != NIL {
            out.push(forest.node(slot).value);
            slot = forest.successor(slot);
        }
        out
    }

    /// Attach `value` at position `index` under `root`.
    fn insert_at(forest: &mut Forest<u64>, root: &mut u32, index: usize, value: u64) -> u32 {
        let slot = forest.alloc(value);
        if *root == NIL {
            forest.attach(root, NIL, false, slot);
        } else if index == 0 {
            let first = forest.first(*root);
            forest.attach(root, first, true, slot);
        } else {
            let anchor = forest.select(*root, index - 1);
            assert!(anchor != NIL);
            forest.attach(root, anchor, false, slot);
        }
        slot
    }

    #[test]
    fn appends_stay_ordered() {
        let mut forest = Forest::new();
        let mut root = NIL;
        for i in 0..100 {
            let n = forest.total(root);
            insert_at(&mut forest, &mut root, n, i);
            forest.audit(root);
        }
        assert_eq!(walk(&forest, root), (0..100).collect::<Vec<_>>());
        assert_eq!(forest.total(root), 100);
    }

    #[test]
    fn select_and_rank_agree() {
        let mut forest = Forest::new();
        let mut root = NIL;
        for i in 0..128 {
            let n = forest.total(root);
            insert_at(&mut forest, &mut root, n, i);
        }
        for index in 0..128 {
            let slot = forest.select(root, index);
            assert_eq!(forest.node(slot).value, index as u64);
            assert_eq!(forest.rank(slot), index);
        }
        assert_eq!(forest.select(root, 128), NIL);
    }

    #[test]
    fn detach_keeps_surviving_slots() {
        let mut forest = Forest::new();
        let mut root = NIL;
        let mut slots = Vec::new();
        for i in 0..50 {
            let n = forest.total(root);
            slots.push(insert_at(&mut forest, &mut root, n, i));
        }
        // Remove the even-valued nodes; the odd ones must keep their slots and values.
        for (i, &slot) in slots.iter().enumerate() {
            if i % 2 == 0 {
                forest.detach(&mut root, slot);
                forest.release(slot);
                forest.audit(root);
            }
        }
        for (i, &slot) in slots.iter().enumerate() {
            if i % 2 == 1 {
                assert_eq!(forest.node(slot).value, i as u64);
            }
        }
        assert_eq!(walk(&forest, root),
                   (0..50u64).filter(|value| value % 2 == 1).collect::<Vec<_>>());
    }

    #[test]
    fn generations_kill_stale_handles() {
        let mut forest = Forest::new();
        let mut root = NIL;
        let slot = insert_at(&mut forest, &mut root, 0, 7);
        let gen = forest.gen_of(slot);
        assert!(forest.contains(slot, gen));
        forest.detach(&mut root, slot);
        forest.release(slot);
        assert!(!forest.contains(slot, gen));
        // Reusing the slot must not resurrect the old handle.
        let again = insert_at(&mut forest, &mut root, 0, 9);
        assert_eq!(again, slot);
        assert!(!forest.contains(slot, gen));
        assert!(forest.contains(slot, forest.gen_of(slot)));
    }

    #[test]
    fn random_ops_match_model() {
        let mut rng = StdRng::seed_from_u64(0xbe27);
        let mut forest = Forest::new();
        let mut root = NIL;
        let mut model: Vec<u64> = Vec::new();
        let mut slots: Vec<u32> = Vec::new();

        for step in 0..2000u64 {
            let grow = model.is_empty() || rng.gen_range(0..100) < 60;
            if grow {
                let index = rng.gen_range(0..model.len() + 1);
                let slot = insert_at(&mut forest, &mut root, index, step);
                model.insert(index, step);
                slots.insert(index, slot);
            } else {
                let index = rng.gen_range(0..model.len());
                let slot = slots.remove(index);
                model.remove(index);
                forest.detach(&mut root, slot);
                forest.release(slot);
            }
            forest.audit(root);
            assert_eq!(forest.total(root), model.len());
        }
        assert_eq!(walk(&forest, root), model);
        for (index, &slot) in slots.iter().enumerate() {
            assert_eq!(forest.rank(slot), index);
        }
    }

    #[test]
    fn closest_match_filters() {
        let mut forest = Forest::new();
        let mut root = NIL;
        // A comparator-ordered tree: 10, 20, 30.
        for value in &[10u64, 20, 30] {
            let n = forest.total(root);
            insert_at(&mut forest, &mut root, n, *value);
        }
        let always = || true;
        let to = |target: u64| move |value: &u64| value.cmp(&target);

        let exact = forest.find_closest(root, to(20), SearchFilter::OnlyMatch, &always);
        assert_eq!(exact.map(|slot| forest.node(slot).value), Some(20));

        let less = forest.find_closest(root, to(25), SearchFilter::PreferLess, &always);
        assert_eq!(less.map(|slot| forest.node(slot).value), Some(20));
        let greater = forest.find_closest(root, to(25), SearchFilter::PreferGreater, &always);
        assert_eq!(greater.map(|slot| forest.node(slot).value), Some(30));
        assert_eq!(forest.find_closest(root, to(25), SearchFilter::OnlyMatch, &always), None);
        assert_eq!(forest.find_closest(root, to(5), SearchFilter::Less, &always), None);
        assert_eq!(forest.find_closest(root, to(35), SearchFilter::Greater, &always), None);

        // Tripping the validator aborts the walk.
        assert_eq!(forest.find_closest(root, to(20), SearchFilter::OnlyMatch, &|| false), None);
    }

    #[test]
    fn index_of_convention() {
        let mut forest = Forest::new();
        let mut root = NIL;
        for value in &[10u64, 20, 30] {
            let n = forest.total(root);
            insert_at(&mut forest, &mut root, n, *value);
        }
        let to = |target: u64| move |value: &u64| value.cmp(&target);
        assert_eq!(forest.index_of(root, to(10)), 0);
        assert_eq!(forest.index_of(root, to(30)), 2);
        assert_eq!(forest.index_of(root, to(25)), -3);
        assert_eq!(forest.index_of(root, to(5)), -1);
        assert_eq!(forest.index_of(root, to(45)), -4);
    }
}
