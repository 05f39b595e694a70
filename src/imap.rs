//! An ordered map keyed by half-open address intervals.
//!
//! [`Imap`] stores non-overlapping intervals and automatically splits,
//! truncates, and merges stored intervals as new ones are inserted. Two
//! abutting intervals with equal values are coalesced into one. This is the
//! data structure behind every "address to X" lookup in the crate.

use std::fmt;

/// A half-open `[low, high)` interval of addresses.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Interval {
    pub low: u64,
    pub high: u64,
}

impl Interval {
    pub fn empty(self) -> bool {
        self.high <= self.low
    }

    pub fn contains(self, addr: u64) -> bool {
        self.low <= addr && addr < self.high
    }

    /// Removes interval `o` from `self` and returns the part (if any) that
    /// falls below `o` and the part (if any) that falls above `o`.
    pub fn subtract(self, o: Interval) -> (Interval, Interval) {
        let mut below = Interval::default();
        let mut above = Interval::default();
        if self.low < o.low {
            below = Interval {
                low: self.low,
                high: o.low,
            };
        }
        if o.high < self.high {
            above = Interval {
                low: o.high,
                high: self.high,
            };
        }
        (below, above)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.empty() {
            f.write_str("∅")
        } else {
            write!(f, "[{:#x},{:#x})", self.low, self.high)
        }
    }
}

/// The AVL tree below is stored in an index-addressed arena. Node deletion
/// unlinks and relinks nodes rather than copying values between them, so a
/// node index continues to identify the same logical interval across
/// unrelated deletions.
#[derive(Clone, Debug)]
struct Node<V> {
    key: u64, // interval low
    high: u64,
    left: Option<u32>,
    right: Option<u32>,
    parent: Option<u32>,
    height: i32,
    value: Option<V>, // None only while on the free list
}

/// Identifies the link that points at a node: the root slot or one of a
/// parent's child slots.
#[derive(Copy, Clone)]
enum Slot {
    Root,
    Left(u32),
    Right(u32),
}

/// An ordered mapping from non-overlapping address intervals to values.
#[derive(Clone, Debug)]
pub struct Imap<V> {
    nodes: Vec<Node<V>>,
    root: Option<u32>,
    free: Vec<u32>,
}

impl<V> Default for Imap<V> {
    fn default() -> Self {
        Imap {
            nodes: Vec::new(),
            root: None,
            free: Vec::new(),
        }
    }
}

impl<V: Clone + PartialEq> Imap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `key` with `value`, splitting or truncating any stored
    /// intervals it overlaps and coalescing with abutting intervals that
    /// carry an equal value. Inserting an empty interval has no effect.
    pub fn insert(&mut self, key: Interval, value: V) {
        if key.empty() {
            return;
        }
        let (low, high) = (key.low, key.high);

        // Find the node that overlaps or just abuts the new range. If an
        // existing range abuts the new range, we'll extend the existing
        // range.
        let mut n = self.search_by(|nd| low <= nd.high);
        let pred = n;

        // Split intervals that intersect low or high (one interval could do
        // both) and delete fully overlapping intervals.
        while let Some(idx) = n {
            if self.nodes[idx as usize].key >= high {
                break;
            }
            // Fetch the next node in case we delete this node.
            let n_next = self.next_node(idx);

            let (l, h) = self.interval_of(idx).subtract(Interval { low, high });
            let lok = !l.empty();
            let hok = !h.empty();
            if lok && !hok {
                // idx overlaps the low end of the new interval. Adjust its
                // high. Order doesn't change.
                self.nodes[idx as usize].high = l.high;
            } else if !lok && hok {
                // idx overlaps the high end of the new interval. Adjust its
                // low. Order doesn't change.
                self.nodes[idx as usize].key = h.low;
                break;
            } else if lok && hok {
                // The new interval falls in the middle of an existing
                // interval. Split the existing interval.
                if *self.value_of(idx) == value {
                    // Nothing needs to be done.
                    return;
                }
                self.nodes[idx as usize].high = l.high;
                let v = self.value_of(idx).clone();
                let n2 = self.insert_key(h.low);
                self.nodes[n2 as usize].high = h.high;
                self.nodes[n2 as usize].value = Some(v);
                n = Some(n2);
                break;
            } else {
                // The new interval covers this interval. Delete it.
                self.delete(idx);
            }

            n = n_next;
        }

        // Merge with existing intervals if possible. We already handled the
        // completely overlapping case above.
        if let Some(p) = pred {
            if self.nodes[p as usize].high == low && *self.value_of(p) == value {
                // Extend the predecessor over the new range.
                self.nodes[p as usize].high = high;
                if let Some(nn) = n {
                    if self.nodes[nn as usize].key == high && *self.value_of(nn) == value {
                        // We merged right into the successor. Extend the
                        // predecessor and delete the successor.
                        self.nodes[p as usize].high = self.nodes[nn as usize].high;
                        self.delete(nn);
                    }
                }
                return;
            }
        }
        if let Some(nn) = n {
            if self.nodes[nn as usize].key == high && *self.value_of(nn) == value {
                // Extend the successor over the new range.
                self.nodes[nn as usize].key = low;
                return;
            }
        }

        // We should now have space for the new interval.
        let idx = self.insert_key(low);
        self.nodes[idx as usize].high = high;
        self.nodes[idx as usize].value = Some(value);
    }

    /// Returns the value at `addr` and the interval over which the value is
    /// the same (which may be smaller than the interval originally
    /// inserted), or `None` if no stored interval contains `addr`.
    pub fn find(&self, addr: u64) -> Option<(Interval, &V)> {
        let n = self.search_by(|nd| addr < nd.high)?;
        if self.nodes[n as usize].key <= addr {
            Some((self.interval_of(n), self.value_of(n)))
        } else {
            None
        }
    }

    /// Returns an iterator positioned on the interval containing `addr` or
    /// the lowest interval following `addr`.
    pub fn iter(&self, addr: u64) -> Iter<'_, V> {
        Iter {
            map: self,
            n: self.search_by(|nd| addr < nd.high),
        }
    }
}

impl<V> Imap<V> {
    fn interval_of(&self, n: u32) -> Interval {
        let nd = &self.nodes[n as usize];
        Interval {
            low: nd.key,
            high: nd.high,
        }
    }

    fn value_of(&self, n: u32) -> &V {
        self.nodes[n as usize]
            .value
            .as_ref()
            .expect("value read from freed interval node")
    }

    /// Returns the first node in sort order for which `pred` returns true.
    /// `pred` must be monotone: false for a prefix of the nodes in key order
    /// and true for the rest.
    fn search_by(&self, pred: impl Fn(&Node<V>) -> bool) -> Option<u32> {
        let mut best = None;
        let mut n = self.root;
        while let Some(idx) = n {
            let nd = &self.nodes[idx as usize];
            if pred(nd) {
                // Try going smaller.
                best = Some(idx);
                n = nd.left;
            } else {
                // Try going larger.
                n = nd.right;
            }
        }
        best
    }

    fn next_node(&self, n: u32) -> Option<u32> {
        let nd = &self.nodes[n as usize];
        if nd.right.is_none() {
            // Go up left until we can go up right.
            let mut n = n;
            while let Some(p) = self.nodes[n as usize].parent {
                if self.nodes[p as usize].right == Some(n) {
                    n = p;
                } else {
                    return Some(p);
                }
            }
            return None;
        }
        // Go right, and then left as much as we can.
        let mut n = nd.right.unwrap();
        while let Some(l) = self.nodes[n as usize].left {
            n = l;
        }
        Some(n)
    }

    fn slot_of(&self, n: u32) -> Slot {
        match self.nodes[n as usize].parent {
            None => Slot::Root,
            Some(p) => {
                if self.nodes[p as usize].left == Some(n) {
                    Slot::Left(p)
                } else {
                    Slot::Right(p)
                }
            }
        }
    }

    fn set_slot(&mut self, slot: Slot, n: Option<u32>) {
        match slot {
            Slot::Root => self.root = n,
            Slot::Left(p) => self.nodes[p as usize].left = n,
            Slot::Right(p) => self.nodes[p as usize].right = n,
        }
    }

    fn alloc(&mut self, key: u64, parent: Option<u32>) -> u32 {
        let node = Node {
            key,
            high: 0,
            left: None,
            right: None,
            parent,
            height: 1,
            value: None,
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        }
    }

    /// Inserts a node with the given sort key, or returns the existing node
    /// with that key.
    fn insert_key(&mut self, key: u64) -> u32 {
        // Find the insertion point and its parent node.
        let mut parent = None;
        let mut slot = Slot::Root;
        let mut cur = self.root;
        while let Some(idx) = cur {
            let nd = &self.nodes[idx as usize];
            parent = Some(idx);
            if key < nd.key {
                slot = Slot::Left(idx);
                cur = nd.left;
            } else if key > nd.key {
                slot = Slot::Right(idx);
                cur = nd.right;
            } else {
                return idx;
            }
        }

        let n = self.alloc(key, parent);
        self.set_slot(slot, Some(n));
        self.rebalance(parent);
        n
    }

    /// Unlinks `node` from the tree and returns its slot to the free list.
    ///
    /// A node with two children is transposed with its in-order successor
    /// rather than having the successor's fields copied over it, so other
    /// node indices keep identifying the same intervals.
    fn delete(&mut self, node: u32) {
        let mut node_p = self.slot_of(node);

        if self.nodes[node as usize].left.is_some() && self.nodes[node as usize].right.is_some() {
            // Two children. We need to move node to where it has at most one
            // child. Find node's in-order successor.
            let mut succ_p = Slot::Right(node);
            let mut succ = self.nodes[node as usize].right.unwrap();
            while let Some(l) = self.nodes[succ as usize].left {
                succ_p = Slot::Left(succ);
                succ = l;
            }

            // Transpose node and succ. This messes up the tree order until
            // node is actually removed below. succ.left is nil, so between
            // the two nodes there are up to 11 links to update.
            let parent = self.nodes[node as usize].parent;
            let nl = self.nodes[node as usize].left;
            let nr = self.nodes[node as usize].right;
            let sp = self.nodes[succ as usize].parent;
            let sr = self.nodes[succ as usize].right;

            self.set_slot(node_p, Some(succ));
            if Some(succ) == nr {
                // When succ and node are linked to each other, two of the
                // six relations are the same link, so handle it differently.
                self.nodes[succ as usize].right = Some(node);
                node_p = Slot::Right(succ);
            } else {
                self.nodes[succ as usize].right = nr;
                self.nodes[node as usize].parent = sp;
                self.set_slot(succ_p, Some(node));
                node_p = succ_p;
            }
            self.nodes[node as usize].left = None;
            self.nodes[node as usize].right = sr;
            self.nodes[succ as usize].left = nl;
            self.nodes[succ as usize].parent = parent;
            let h = self.nodes[node as usize].height;
            self.nodes[node as usize].height = self.nodes[succ as usize].height;
            self.nodes[succ as usize].height = h;
            // Fix parent pointers.
            if let Some(c) = self.nodes[succ as usize].left {
                self.nodes[c as usize].parent = Some(succ);
            }
            if let Some(c) = self.nodes[succ as usize].right {
                self.nodes[c as usize].parent = Some(succ);
            }
            if let Some(c) = self.nodes[node as usize].right {
                self.nodes[c as usize].parent = Some(node);
            }
            // Now node has at most one child.
        }

        // Node has at most one child, so we can just remove it.
        if self.nodes[node as usize].left.is_none() {
            let r = self.nodes[node as usize].right;
            self.set_slot(node_p, r);
            if let Some(r) = r {
                self.nodes[r as usize].parent = self.nodes[node as usize].parent;
            }
        } else if self.nodes[node as usize].right.is_none() {
            let l = self.nodes[node as usize].left.unwrap();
            self.set_slot(node_p, Some(l));
            self.nodes[l as usize].parent = self.nodes[node as usize].parent;
        }

        // Walk up the tree and rebalance, then recycle the slot.
        self.rebalance(Some(node));
        self.nodes[node as usize].value = None;
        self.nodes[node as usize].left = None;
        self.nodes[node as usize].right = None;
        self.nodes[node as usize].parent = None;
        self.free.push(node);
    }

    fn height(&self, n: Option<u32>) -> i32 {
        match n {
            None => 0,
            Some(idx) => self.nodes[idx as usize].height,
        }
    }

    fn update_height(&mut self, n: u32) {
        let l = self.height(self.nodes[n as usize].left);
        let r = self.height(self.nodes[n as usize].right);
        self.nodes[n as usize].height = l.max(r) + 1;
    }

    fn balance(&self, n: u32) -> i32 {
        self.height(self.nodes[n as usize].left) - self.height(self.nodes[n as usize].right)
    }

    /// Fixes out-of-balance nodes in the path from `from` to the root.
    fn rebalance(&mut self, from: Option<u32>) {
        let mut cur = from;
        while let Some(n) = cur {
            self.update_height(n);
            let b = self.balance(n);
            if b > 1 {
                let l = self.nodes[n as usize].left.unwrap();
                if self.balance(l) < 0 {
                    self.rotate_left(l);
                }
                self.rotate_right(n);
            } else if b < -1 {
                let r = self.nodes[n as usize].right.unwrap();
                if self.balance(r) > 0 {
                    self.rotate_right(r);
                }
                self.rotate_left(n);
            }
            cur = self.nodes[n as usize].parent;
        }
    }

    fn rotate_left(&mut self, n: u32) {
        let slot = self.slot_of(n);
        let p = self.nodes[n as usize].parent;
        let nr = self.nodes[n as usize].right.unwrap();
        let nrl = self.nodes[nr as usize].left;
        self.nodes[n as usize].parent = Some(nr);
        self.nodes[n as usize].right = nrl;
        self.nodes[nr as usize].parent = p;
        self.nodes[nr as usize].left = Some(n);
        if let Some(c) = nrl {
            self.nodes[c as usize].parent = Some(n);
        }
        self.update_height(n);
        self.update_height(nr);
        self.set_slot(slot, Some(nr));
    }

    fn rotate_right(&mut self, n: u32) {
        let slot = self.slot_of(n);
        let p = self.nodes[n as usize].parent;
        let nl = self.nodes[n as usize].left.unwrap();
        let nlr = self.nodes[nl as usize].right;
        self.nodes[n as usize].parent = Some(nl);
        self.nodes[n as usize].left = nlr;
        self.nodes[nl as usize].parent = p;
        self.nodes[nl as usize].right = Some(n);
        if let Some(c) = nlr {
            self.nodes[c as usize].parent = Some(n);
        }
        self.update_height(n);
        self.update_height(nl);
        self.set_slot(slot, Some(nl));
    }
}

/// An in-order iterator over an [`Imap`], created by [`Imap::iter`].
pub struct Iter<'a, V> {
    map: &'a Imap<V>,
    n: Option<u32>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (Interval, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.n?;
        self.n = self.map.next_node(n);
        Some((self.map.interval_of(n), self.map.value_of(n)))
    }
}
