//! The classification tree arena.
//!
//! Nodes and leaves are stored in slabs and referenced by index, so parent
//! back-pointers are plain indices and structural surgery (combining,
//! pruning, leaf replacement) never fights the borrow checker. The arena
//! owns the [`FcbPool`] as well: build-phase leaves are double-size FCBs
//! allocated individually, runtime leaves are recycled per thread.
//!
//! Build-phase operations live in the sibling modules:
//! [`combine`](self::combine), [`prune`](self::prune),
//! [`optimize`](self::optimize) and [`replace`](self::replace). Runtime
//! classification — including dynamic child creation and hash-table
//! growth — is [`Tree::match_packet`].

mod combine;
mod optimize;
mod prune;
mod replace;

use crate::fcb::FcbId;
use crate::level::FlowLevel;
use crate::node::{Edge, EdgeTarget, FlowNode, NodeId};
use crate::packet::Packet;
use crate::pool::FcbPool;
use log::trace;

/// Which edge of a node a traversal stopped at.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlotRef {
    /// The keyed edge carrying this data.
    Keyed(u64),
    /// The default edge.
    Default,
}

/// A stable reference to one edge of one node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EdgeRef {
    /// The node owning the edge.
    pub node: NodeId,
    /// Which edge.
    pub slot: SlotRef,
}

/// Node/leaf arena plus the FCB pool.
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Option<FlowNode>>,
    free_nodes: Vec<NodeId>,
    /// The FCB pool backing this tree's leaves.
    pub pool: FcbPool,
}

impl Tree {
    /// An empty tree whose leaves carry `data_size` payload bytes.
    #[must_use]
    pub fn new(data_size: usize) -> Self {
        Self {
            nodes: Vec::new(),
            free_nodes: Vec::new(),
            pool: FcbPool::new(data_size),
        }
    }

    /// Store a node, returning its id.
    pub fn alloc(&mut self, node: FlowNode) -> NodeId {
        if let Some(id) = self.free_nodes.pop() {
            self.nodes[id.0 as usize] = Some(node);
            id
        } else {
            let id = NodeId(self.nodes.len() as u32);
            self.nodes.push(Some(node));
            id
        }
    }

    /// Drop a node (its edges are not followed).
    pub fn free(&mut self, id: NodeId) {
        debug_assert!(self.nodes[id.0 as usize].is_some());
        self.nodes[id.0 as usize] = None;
        self.free_nodes.push(id);
    }

    /// Borrow a node.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not live.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &FlowNode {
        self.nodes[id.0 as usize].as_ref().expect("live node")
    }

    /// Mutably borrow a node.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not live.
    pub fn node_mut(&mut self, id: NodeId) -> &mut FlowNode {
        self.nodes[id.0 as usize].as_mut().expect("live node")
    }

    /// True if `id` references a live node.
    #[must_use]
    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.get(id.0 as usize).is_some_and(Option::is_some)
    }

    /// Number of live nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Point `parent`'s edge `slot` at `target`, fixing the child's parent
    /// back-pointer and `node_data`.
    pub fn set_edge(&mut self, parent: NodeId, slot: SlotRef, target: EdgeTarget) {
        match slot {
            SlotRef::Keyed(data) => {
                self.node_mut(parent).insert(Edge { data, target });
                self.set_parent_of(target, Some(parent), Some(data));
            }
            SlotRef::Default => {
                self.node_mut(parent).default = Some(target);
                self.set_parent_of(target, Some(parent), None);
            }
        }
    }

    /// Read the target of `edge`, if present.
    #[must_use]
    pub fn edge_target(&self, edge: EdgeRef) -> Option<EdgeTarget> {
        let node = self.node(edge.node);
        match edge.slot {
            SlotRef::Keyed(data) => node.find(data).map(|e| e.target),
            SlotRef::Default => node.default,
        }
    }

    pub(crate) fn set_parent_of(
        &mut self,
        target: EdgeTarget,
        parent: Option<NodeId>,
        data: Option<u64>,
    ) {
        match target {
            EdgeTarget::Node(id) => {
                let node = self.node_mut(id);
                node.parent = parent;
                if let Some(data) = data {
                    node.node_data = data;
                }
            }
            EdgeTarget::Leaf(id) => {
                let fcb = self.pool.get_mut(id);
                fcb.parent = parent;
                if let Some(data) = data {
                    fcb.node_data = data;
                }
            }
        }
    }

    /// Collect every leaf edge under `root`.
    ///
    /// `do_final` visits leaves stored on keyed edges; `do_default` visits
    /// leaves stored on default edges.
    #[must_use]
    pub fn leaf_edges(&self, root: NodeId, do_final: bool, do_default: bool) -> Vec<EdgeRef> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        let mut seen = std::collections::HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let node = self.node(id);
            for edge in node.edges() {
                match edge.target {
                    EdgeTarget::Node(child) => stack.push(child),
                    EdgeTarget::Leaf(_) => {
                        if do_final {
                            out.push(EdgeRef {
                                node: id,
                                slot: SlotRef::Keyed(edge.data),
                            });
                        }
                    }
                }
            }
            match node.default {
                Some(EdgeTarget::Node(child)) => stack.push(child),
                Some(EdgeTarget::Leaf(_)) => {
                    if do_default {
                        out.push(EdgeRef {
                            node: id,
                            slot: SlotRef::Default,
                        });
                    }
                }
                None => {}
            }
        }
        out
    }

    /// Collect every node id under `root` (including `root`), parents
    /// before children.
    #[must_use]
    pub fn all_nodes(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        let mut seen = std::collections::HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            out.push(id);
            let node = self.node(id);
            for edge in node.edges() {
                if let EdgeTarget::Node(child) = edge.target {
                    stack.push(child);
                }
            }
            if let Some(EdgeTarget::Node(child)) = node.default {
                stack.push(child);
            }
        }
        out
    }

    /// Collect every node under `root` whose default edge is missing or a
    /// leaf; these are the attach points for "else" rules.
    #[must_use]
    pub fn default_leaf_nodes(&self, root: NodeId) -> Vec<NodeId> {
        self.all_nodes(root)
            .into_iter()
            .filter(|&id| {
                !matches!(self.node(id).default, Some(EdgeTarget::Node(_)))
            })
            .collect()
    }

    /// Deep-copy the subtree at `target`.
    ///
    /// Leaves are duplicated when `duplicate_leaves` is set; otherwise they
    /// are shared and their use count bumped.
    pub fn duplicate(&mut self, target: EdgeTarget, duplicate_leaves: bool) -> EdgeTarget {
        match target {
            EdgeTarget::Leaf(id) => {
                if duplicate_leaves {
                    let copy = self.pool.get(id).duplicate(1);
                    let nid = self.pool.init_allocate();
                    *self.pool.get_mut(nid) = copy;
                    EdgeTarget::Leaf(nid)
                } else {
                    self.pool.get_mut(id).acquire(1);
                    EdgeTarget::Leaf(id)
                }
            }
            EdgeTarget::Node(id) => {
                let src = self.node(id).clone();
                let mut copy = src.clone();
                // Duplicate children depth-first, then re-point the copy.
                let edges = src.edges();
                for edge in edges {
                    let dup = self.duplicate(edge.target, duplicate_leaves);
                    copy.insert(Edge {
                        data: edge.data,
                        target: dup,
                    });
                }
                if let Some(def) = src.default {
                    copy.default = Some(self.duplicate(def, duplicate_leaves));
                }
                copy.parent = None;
                let nid = self.alloc(copy);
                let child_edges = self.node(nid).edges();
                for edge in child_edges {
                    self.set_parent_of(edge.target, Some(nid), Some(edge.data));
                }
                if let Some(def) = self.node(nid).default {
                    self.set_parent_of(def, Some(nid), None);
                }
                EdgeTarget::Node(nid)
            }
        }
    }

    /// Release the whole subtree at `target`: leaves first, then nodes.
    pub fn free_subtree(&mut self, target: EdgeTarget) {
        match target {
            EdgeTarget::Leaf(id) => {
                if self.pool.contains(id) {
                    let fcb = self.pool.get_mut(id);
                    if fcb.count() > 1 {
                        fcb.release(1);
                    } else {
                        self.pool.init_release(id);
                    }
                }
            }
            EdgeTarget::Node(id) => {
                let edges = self.node(id).edges();
                for edge in edges {
                    self.free_subtree(edge.target);
                }
                if let Some(def) = self.node(id).default {
                    self.free_subtree(def);
                }
                self.free(id);
            }
        }
    }

    /// Classify a packet starting at `root`, creating children under
    /// dynamic nodes on miss. Returns `None` for unclassified traffic
    /// (no match, no default).
    pub fn match_packet(&mut self, root: NodeId, p: &Packet, cpu: usize) -> Option<FcbId> {
        let mut cur = root;
        loop {
            let node = self.node(cur);
            let key = node.level.key(p, cpu);
            let target = if let Some(edge) = node.find(key) {
                edge.target
            } else if node.level.is_dynamic() {
                // A dynamic node's default is a prototype, not a route.
                self.insert_dynamic(cur, key, cpu)?
            } else {
                node.default?
            };
            match target {
                EdgeTarget::Leaf(id) => return Some(id),
                EdgeTarget::Node(next) => cur = next,
            }
        }
    }

    /// Follow default edges through a growth chain down to the prototype
    /// this dynamic node duplicates for new keys.
    fn prototype_of(&self, node: NodeId) -> Option<EdgeTarget> {
        let mut cur = node;
        loop {
            let n = self.node(cur);
            match n.default? {
                EdgeTarget::Node(next) if self.node(next).level.equals(&n.level) => cur = next,
                other => return Some(other),
            }
        }
    }

    /// Create the child for `key` under dynamic node `node`, growing the
    /// container when it is full.
    fn insert_dynamic(&mut self, node: NodeId, key: u64, cpu: usize) -> Option<EdgeTarget> {
        // Reuse an already-learned key anywhere along the growth chain.
        let mut probe = node;
        loop {
            if let Some(edge) = self.node(probe).find(key) {
                return Some(edge.target);
            }
            match self.node(probe).default {
                Some(EdgeTarget::Node(next))
                    if self.node(next).level.equals(&self.node(probe).level) =>
                {
                    probe = next;
                }
                _ => break,
            }
        }

        let proto = self.prototype_of(node)?;
        let target = self.duplicate_runtime(proto, cpu)?;

        let mut insert_at = node;
        if self.node(node).container_wants_grow() {
            insert_at = self.grow_node(node, cpu);
        }
        self.node_mut(insert_at).insert(Edge { data: key, target });
        self.set_parent_of(target, Some(insert_at), Some(key));
        trace!(
            "dynamic insert key {key:#x} under node {} (container {})",
            insert_at.raw(),
            self.node(insert_at).children.name()
        );
        Some(target)
    }

    /// Runtime duplication of a prototype: leaves come from the per-thread
    /// pool, subtrees are deep-copied with fresh runtime leaves.
    fn duplicate_runtime(&mut self, proto: EdgeTarget, cpu: usize) -> Option<EdgeTarget> {
        match proto {
            EdgeTarget::Leaf(id) => {
                let (data, flags) = {
                    let src = self.pool.get(id);
                    (src.data().to_vec(), src.flags)
                };
                let nid = self.pool.allocate(cpu);
                let fcb = self.pool.get_mut(nid);
                fcb.data_mut().copy_from_slice(&data);
                fcb.flags = flags;
                if let Some(f) = self.pool.get(id).release_fnt.clone() {
                    self.pool.get_mut(nid).release_fnt = Some(f);
                }
                Some(EdgeTarget::Leaf(nid))
            }
            EdgeTarget::Node(id) => {
                let src = self.node(id).clone();
                let mut copy = src.clone();
                for edge in src.edges() {
                    let dup = self.duplicate_runtime(edge.target, cpu)?;
                    copy.insert(Edge {
                        data: edge.data,
                        target: dup,
                    });
                }
                if let Some(def) = src.default {
                    copy.default = Some(self.duplicate_runtime(def, cpu)?);
                }
                copy.parent = None;
                let nid = self.alloc(copy);
                for edge in self.node(nid).edges() {
                    self.set_parent_of(edge.target, Some(nid), Some(edge.data));
                }
                if let Some(def) = self.node(nid).default {
                    self.set_parent_of(def, Some(nid), None);
                }
                Some(EdgeTarget::Node(nid))
            }
        }
    }

    /// Splice a wider container above a full dynamic node. The node id
    /// keeps addressing the (new, wider) table — references held by
    /// parents and by the published root stay valid — while the drained
    /// table moves to a fresh id hanging off the replacement's default
    /// edge. The release path unsplices it once it empties.
    fn grow_node(&mut self, old: NodeId, _cpu: usize) -> NodeId {
        let level = self.node(old).level.clone();
        let class = match &self.node(old).children {
            crate::node::Children::Hash(h) => h.class() + 1,
            _ => 0,
        };
        let mut replacement = FlowNode::new(level.clone());
        replacement.children = optimize::container_for_class(&level, class);
        replacement.growing = true;
        replacement.threads = self.node(old).threads.clone();
        replacement.node_data = self.node(old).node_data;
        replacement.parent = self.node(old).parent;

        let moved = self.alloc(FlowNode::dummy());
        let drained = std::mem::replace(self.node_mut(old), replacement);
        *self.node_mut(moved) = drained;
        self.node_mut(moved).parent = Some(old);
        self.node_mut(old).default = Some(EdgeTarget::Node(moved));
        for edge in self.node(moved).edges() {
            self.set_parent_of(edge.target, Some(moved), Some(edge.data));
        }
        if let Some(def) = self.node(moved).default {
            self.set_parent_of(def, Some(moved), None);
        }
        trace!(
            "grew node {} into a class {class} table, drained table moved to {}",
            old.raw(),
            moved.raw()
        );
        old
    }

    /// Verify that classifying `p` again would reach exactly `fcb`: keyed
    /// edges on the leaf's root path must match their data and default
    /// edges must match no sibling.
    #[must_use]
    pub fn reverse_match(&self, fcb: FcbId, p: &Packet, cpu: usize) -> bool {
        let f = self.pool.get(fcb);
        let Some(mut cur) = f.parent else {
            return false;
        };
        let mut child_data = f.node_data;
        let mut child_keyed = self
            .node(cur)
            .find(child_data)
            .is_some_and(|e| e.target == EdgeTarget::Leaf(fcb));
        // Walk up, checking each decision against the packet.
        loop {
            let node = self.node(cur);
            let key = node.level.key(p, cpu);
            let ok = if child_keyed {
                key == child_data
            } else {
                node.find(key).is_none()
            };
            if !ok {
                return false;
            }
            match node.parent {
                None => return true,
                Some(parent) => {
                    child_data = node.node_data;
                    child_keyed = self
                        .node(parent)
                        .find(child_data)
                        .is_some_and(|e| e.target == EdgeTarget::Node(cur));
                    cur = parent;
                }
            }
        }
    }

    /// Debug invariant check over the subtree at `root` (active only with
    /// debug assertions): edge counts, parent back-pointers and edge data
    /// must all be consistent.
    pub fn check(&self, root: NodeId) {
        if !cfg!(debug_assertions) {
            return;
        }
        for id in self.all_nodes(root) {
            let node = self.node(id);
            assert_eq!(
                node.num(),
                node.find_num(),
                "node {} child count out of sync",
                id.raw()
            );
            for edge in node.edges() {
                match edge.target {
                    EdgeTarget::Node(child) => {
                        let c = self.node(child);
                        assert_eq!(c.parent, Some(id), "child parent mismatch");
                        assert_eq!(c.node_data, edge.data, "child data mismatch");
                    }
                    EdgeTarget::Leaf(leaf) => {
                        let f = self.pool.get(leaf);
                        if let Some(parent) = f.parent {
                            assert_eq!(parent, id, "leaf parent mismatch");
                            assert_eq!(f.node_data, edge.data, "leaf data mismatch");
                        }
                    }
                }
            }
            if let Some(EdgeTarget::Node(child)) = node.default {
                assert_eq!(self.node(child).parent, Some(id), "default parent mismatch");
            }
        }
    }

    /// Render the subtree for debugging.
    #[must_use]
    pub fn dump(&self, root: NodeId) -> String {
        let mut out = String::new();
        self.dump_into(EdgeTarget::Node(root), 0, &mut out);
        out
    }

    fn dump_into(&self, target: EdgeTarget, depth: usize, out: &mut String) {
        use std::fmt::Write;
        let pad = "  ".repeat(depth);
        match target {
            EdgeTarget::Leaf(id) => {
                let fcb = self.pool.get(id);
                let _ = writeln!(
                    out,
                    "{pad}leaf #{} data {} uc {} ed {}",
                    id.raw(),
                    fcb.node_data,
                    fcb.count(),
                    fcb.is_early_drop()
                );
            }
            EdgeTarget::Node(id) => {
                let node = self.node(id);
                let _ = writeln!(
                    out,
                    "{pad}node #{} level {} [{}] num {}{}",
                    id.raw(),
                    node.level,
                    node.children.name(),
                    node.num(),
                    if node.growing { " growing" } else { "" }
                );
                for edge in node.edges() {
                    let _ = writeln!(out, "{pad} {:#x}:", edge.data);
                    self.dump_into(edge.target, depth + 1, out);
                }
                if let Some(def) = node.default {
                    let _ = writeln!(out, "{pad} default:");
                    self.dump_into(def, depth + 1, out);
                }
            }
        }
    }
}
