//! S-bags, P-bags and the disjoint-set forest over them.
//!
//! Every strand of the program is a member of exactly one bag.  An S-bag
//! collects the strands of a frame that have already rejoined serially; a
//! P-bag collects everything a frame has spawned in one sync region that
//! has not yet rejoined.  Series composition unions into an S-bag, parallel
//! composition into a P-bag, and a previous access is logically parallel
//! with the current strand exactly when the root of its set is a P-bag.
//!
//! Nodes live in an arena keyed by 32-bit indices with free-list reuse.
//! Reference counts track handles held by frames, shadow-memory entries and
//! lockers, plus child-to-parent links inside the forest.  Each node also
//! carries the call stack of the frame it was created for; race reports
//! read it back regardless of what set the node has since been merged into.

use typed_index_collections::TiVec;

use crate::callstack::{CallStack, CallStackArena};
use crate::errors::fatal;

/// 16-bit version counter distinguishing iterations of a parallel loop that
/// share one iter-bag.
pub(crate) type Version = u16;

/// Index of a disjoint-set node in the arena.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub(crate) struct DsIndex(u32);

impl From<usize> for DsIndex {
    fn from(v: usize) -> Self {
        DsIndex(u32::try_from(v).unwrap())
    }
}

impl From<DsIndex> for usize {
    fn from(v: DsIndex) -> usize {
        v.0 as usize
    }
}

impl DsIndex {
    /// Stable ordering key; locker lists sort by it.
    pub(crate) fn raw(self) -> u32 {
        self.0
    }
}

/// The two kinds of bag a set root can be.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum BagKind {
    S,
    P,
}

enum Parent {
    /// Root of a set whose identity is an S-bag.
    SRoot { version: Version },
    /// Root of a set whose identity is a P-bag.
    PRoot,
    /// Linked under another node in the forest.
    Link(DsIndex),
}

struct Node {
    parent: Parent,
    rank: u32,
    ref_count: u32,
    /// Call stack of the frame this node was created for.  Immutable and
    /// independent of later merges.
    stack: CallStack,
}

enum Slot {
    Free { next: Option<DsIndex> },
    Node(Node),
}

/// Arena holding the disjoint-set forest.
pub(crate) struct DsArena {
    nodes: TiVec<DsIndex, Slot>,
    free: Option<DsIndex>,
    /// Reusable scratch list for path compression.
    scratch: Vec<DsIndex>,
    #[cfg(debug_assertions)]
    live: i64,
}

impl DsArena {
    pub fn new() -> Self {
        DsArena {
            nodes: TiVec::new(),
            free: None,
            scratch: Vec::with_capacity(128),
            #[cfg(debug_assertions)]
            live: 0,
        }
    }

    fn node(&self, idx: DsIndex) -> &Node {
        match &self.nodes[idx] {
            Slot::Node(n) => n,
            Slot::Free { .. } => fatal("use of freed disjoint-set node"),
        }
    }

    fn node_mut(&mut self, idx: DsIndex) -> &mut Node {
        match &mut self.nodes[idx] {
            Slot::Node(n) => n,
            Slot::Free { .. } => fatal("use of freed disjoint-set node"),
        }
    }

    fn alloc(&mut self, node: Node) -> DsIndex {
        #[cfg(debug_assertions)]
        {
            self.live += 1;
        }
        match self.free {
            Some(idx) => {
                self.free = match self.nodes[idx] {
                    Slot::Free { next } => next,
                    Slot::Node(_) => fatal("corrupt disjoint-set free list"),
                };
                self.nodes[idx] = Slot::Node(node);
                idx
            }
            None => {
                let idx = DsIndex::from(self.nodes.len());
                self.nodes.push(Slot::Node(node));
                idx
            }
        }
    }

    /// Create a fresh singleton S-bag for a frame with the given call
    /// stack.  The returned handle carries one reference, owned by the
    /// caller; the node takes its own reference on the call stack.
    pub fn new_sbag(&mut self, cs: &mut CallStackArena, stack: CallStack) -> DsIndex {
        cs.retain(stack);
        self.alloc(Node {
            parent: Parent::SRoot { version: 0 },
            rank: 0,
            ref_count: 1,
            stack,
        })
    }

    /// Create a fresh singleton P-bag.
    pub fn new_pbag(&mut self) -> DsIndex {
        self.alloc(Node {
            parent: Parent::PRoot,
            rank: 0,
            ref_count: 1,
            stack: CallStack::empty(),
        })
    }

    fn is_root(&self, idx: DsIndex) -> bool {
        !matches!(self.node(idx).parent, Parent::Link(_))
    }

    /// Find the root of `h`'s set, compressing the path walked.
    ///
    /// The fast paths cover `h` itself and its direct parent.  Otherwise
    /// the chain is collected into the scratch list and re-parented to the
    /// root in reverse, so a node freed by losing its last reference is
    /// never touched afterwards.
    pub fn find(&mut self, cs: &mut CallStackArena, h: DsIndex) -> DsIndex {
        let parent = match self.node(h).parent {
            Parent::Link(p) => p,
            _ => return h,
        };
        if self.is_root(parent) {
            return parent;
        }

        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        let mut node = h;
        loop {
            match self.node(node).parent {
                Parent::Link(next) => {
                    if !self.is_root(next) {
                        scratch.push(node);
                    }
                    node = next;
                }
                _ => break,
            }
        }
        let root = node;
        for &n in scratch.iter().rev() {
            self.reparent(cs, n, root);
        }
        self.scratch = scratch;
        root
    }

    /// Re-point `n` directly at `root`.  The new reference is taken before
    /// the old parent is released.
    fn reparent(&mut self, cs: &mut CallStackArena, n: DsIndex, root: DsIndex) {
        let old = match self.node(n).parent {
            Parent::Link(p) => p,
            _ => fatal("reparent of a root node"),
        };
        self.node_mut(root).ref_count += 1;
        self.node_mut(n).parent = Parent::Link(root);
        self.dec_ref(cs, old, 1);
    }

    /// Is the set containing `h` identified by a P-bag?
    pub fn is_pbag(&mut self, cs: &mut CallStackArena, h: DsIndex) -> bool {
        self.bag_of(cs, h) == BagKind::P
    }

    /// Kind of the bag identifying the set containing `h`.
    pub fn bag_of(&mut self, cs: &mut CallStackArena, h: DsIndex) -> BagKind {
        let root = self.find(cs, h);
        match self.node(root).parent {
            Parent::SRoot { .. } => BagKind::S,
            Parent::PRoot => BagKind::P,
            Parent::Link(_) => unreachable!(),
        }
    }

    /// Current version of the S-bag root `h`.  `h` must be an active
    /// frame's S-bag or iter-bag, which is always a root.
    pub fn version(&self, h: DsIndex) -> Version {
        match self.node(h).parent {
            Parent::SRoot { version } => version,
            _ => fatal("version query on a non-S-bag root"),
        }
    }

    /// Bump the version of the S-bag root `h`.  Returns false when the
    /// counter wraps to zero, signalling that the iter-bag must rotate.
    pub fn inc_version(&mut self, h: DsIndex) -> bool {
        match &mut self.node_mut(h).parent {
            Parent::SRoot { version } => {
                *version = version.wrapping_add(1);
                *version != 0
            }
            _ => fatal("version bump on a non-S-bag root"),
        }
    }

    /// Call stack recorded on node `h` at creation time.
    pub fn stack_of(&self, h: DsIndex) -> CallStack {
        self.node(h).stack
    }

    /// Union the sets of `receiver` and `donor`.
    ///
    /// Linking is by rank, but the merged set is always identified by the
    /// *receiver's* bag: merging a child S-bag into a P-bag must leave the
    /// set a P-bag, and syncing a P-bag into an S-bag must leave it an
    /// S-bag, no matter which root wins the rank comparison.
    pub fn combine(&mut self, cs: &mut CallStackArena, receiver: DsIndex, donor: DsIndex) {
        let ra = self.find(cs, receiver);
        let rb = self.find(cs, donor);
        debug_assert_ne!(ra, rb, "combine on two handles of the same set");
        if ra == rb {
            return;
        }

        let (winner, loser) = if self.node(ra).rank > self.node(rb).rank {
            (ra, rb)
        } else {
            if self.node(ra).rank == self.node(rb).rank {
                self.node_mut(rb).rank += 1;
            }
            (rb, ra)
        };

        let loser_bag = std::mem::replace(&mut self.node_mut(loser).parent, Parent::Link(winner));
        self.node_mut(winner).ref_count += 1;

        if winner != ra {
            // The donor's root won the rank race; move the receiver's bag
            // onto it so the set keeps the receiver's identity.  The
            // donor's own bag is discarded.
            self.node_mut(winner).parent = loser_bag;
        }
    }

    pub fn inc_ref(&mut self, h: DsIndex, count: u32) {
        self.node_mut(h).ref_count += count;
    }

    /// Drop `count` references to `h`.  The last release frees the node
    /// and transitively releases its parent link and call stack.
    pub fn dec_ref(&mut self, cs: &mut CallStackArena, h: DsIndex, count: u32) {
        let mut idx = h;
        let mut count = count;
        loop {
            let node = self.node_mut(idx);
            if node.ref_count < count {
                fatal("unbalanced disjoint-set reference count");
            }
            node.ref_count -= count;
            if node.ref_count > 0 {
                return;
            }
            let parent = std::mem::replace(&mut node.parent, Parent::PRoot);
            let stack = node.stack;
            cs.release(stack);
            self.nodes[idx] = Slot::Free { next: self.free };
            self.free = Some(idx);
            #[cfg(debug_assertions)]
            {
                self.live -= 1;
            }
            match parent {
                Parent::Link(p) => {
                    idx = p;
                    count = 1;
                }
                _ => return,
            }
        }
    }

    /// Number of live nodes; used by the teardown balance check.
    #[cfg(debug_assertions)]
    pub fn live_nodes(&self) -> i64 {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arenas() -> (DsArena, CallStackArena) {
        (DsArena::new(), CallStackArena::new())
    }

    #[test]
    fn singletons_are_roots_of_their_own_kind() {
        let (mut ds, mut cs) = arenas();
        let s = ds.new_sbag(&mut cs, CallStack::empty());
        let p = ds.new_pbag();
        assert_eq!(ds.bag_of(&mut cs, s), BagKind::S);
        assert_eq!(ds.bag_of(&mut cs, p), BagKind::P);
        assert!(!ds.is_pbag(&mut cs, s));
        assert!(ds.is_pbag(&mut cs, p));
    }

    #[test]
    fn receiver_identity_survives_rank_loss() {
        let (mut ds, mut cs) = arenas();
        // Build an S set with rank 1 so it wins the rank comparison when a
        // fresh P-bag receives it.
        let s1 = ds.new_sbag(&mut cs, CallStack::empty());
        let s2 = ds.new_sbag(&mut cs, CallStack::empty());
        ds.combine(&mut cs, s1, s2);
        let p = ds.new_pbag();
        ds.combine(&mut cs, p, s1);
        assert!(ds.is_pbag(&mut cs, s1));
        assert!(ds.is_pbag(&mut cs, s2));
        assert!(ds.is_pbag(&mut cs, p));
        // Syncing the P set back into an S-bag flips the identity again.
        let parent = ds.new_sbag(&mut cs, CallStack::empty());
        ds.combine(&mut cs, parent, p);
        assert!(!ds.is_pbag(&mut cs, s2));
        assert_eq!(ds.bag_of(&mut cs, s1), BagKind::S);
    }

    #[test]
    fn path_compression_points_at_root() {
        let (mut ds, mut cs) = arenas();
        let mut bags = Vec::new();
        for _ in 0..8 {
            bags.push(ds.new_sbag(&mut cs, CallStack::empty()));
        }
        for pair in bags.windows(2) {
            ds.combine(&mut cs, pair[1], pair[0]);
        }
        let root = ds.find(&mut cs, bags[0]);
        for &b in &bags {
            assert_eq!(ds.find(&mut cs, b), root);
            // After compression every node is at most one link from the
            // root.
            match ds.node(b).parent {
                Parent::Link(p) => assert_eq!(p, root),
                _ => assert_eq!(b, root),
            }
        }
    }

    #[test]
    fn version_wraps_to_zero() {
        let (mut ds, mut cs) = arenas();
        let s = ds.new_sbag(&mut cs, CallStack::empty());
        for _ in 0..u16::MAX {
            assert!(ds.inc_version(s));
        }
        // The 2^16-th increment wraps.
        assert!(!ds.inc_version(s));
        assert_eq!(ds.version(s), 0);
    }

    #[test]
    fn release_frees_transitively() {
        let (mut ds, mut cs) = arenas();
        let a = ds.new_sbag(&mut cs, CallStack::empty());
        let b = ds.new_sbag(&mut cs, CallStack::empty());
        ds.combine(&mut cs, a, b);
        ds.dec_ref(&mut cs, b, 1);
        ds.dec_ref(&mut cs, a, 1);
        #[cfg(debug_assertions)]
        assert_eq!(ds.live_nodes(), 0);
    }
}
