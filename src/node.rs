//! Classification nodes and their child containers.
//!
//! A node pairs a [`FlowLevel`] with a set of keyed child edges plus one
//! *default* edge taken when no child's data matches the computed key. The
//! child container is polymorphic: rule building uses a plain vector; the
//! optimiser rewrites it into the cheapest shape for the child count
//! (dummy, two-case, three-case, open-addressed hash with a capacity
//! class, or a dense array when the key space is small and finite).
//!
//! Invariants maintained here and checked in debug builds:
//! - no two keyed edges share the same data;
//! - `num()` equals the number of keyed edges;
//! - a child's `node_data` equals the data on the edge that stores it.

use crate::fcb::FcbId;
use crate::level::FlowLevel;
use crate::utils::ThreadSet;

/// Index of a node inside the tree arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Underlying arena index, for debugging.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// What an edge points at.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EdgeTarget {
    /// An interior node.
    Node(NodeId),
    /// A leaf FCB.
    Leaf(FcbId),
}

impl EdgeTarget {
    /// The node id, if this edge targets a node.
    #[must_use]
    pub fn as_node(self) -> Option<NodeId> {
        match self {
            EdgeTarget::Node(id) => Some(id),
            EdgeTarget::Leaf(_) => None,
        }
    }

    /// The FCB id, if this edge targets a leaf.
    #[must_use]
    pub fn as_leaf(self) -> Option<FcbId> {
        match self {
            EdgeTarget::Leaf(id) => Some(id),
            EdgeTarget::Node(_) => None,
        }
    }
}

/// A keyed edge: the data value plus the child it leads to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Edge {
    /// The key value matched on this edge.
    pub data: u64,
    /// The child reached when the level's key equals `data`.
    pub target: EdgeTarget,
}

/// Capacity (prime) of each hash container class.
pub const HASH_CAPACITIES: [usize; 10] = [61, 127, 251, 509, 1021, 2039, 4093, 8191, 16381, 32749];

/// Capacity of hash class `class`.
#[must_use]
pub fn capacity_for(class: u8) -> usize {
    HASH_CAPACITIES[class as usize]
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Slot {
    Empty,
    Tomb,
    Full(Edge),
}

/// Fixed-capacity open-addressed table keyed by edge data.
///
/// Dynamic nodes insert at packet time; when the table is too full the
/// caller escalates to the next capacity class (or an array) and splices
/// the new node in as a *growing* replacement.
#[derive(Clone, Debug)]
pub struct HashChildren {
    class: u8,
    slots: Vec<Slot>,
    used: usize,
}

impl HashChildren {
    /// A fresh table of the given capacity class.
    #[must_use]
    pub fn new(class: u8) -> Self {
        Self {
            class,
            slots: vec![Slot::Empty; capacity_for(class)],
            used: 0,
        }
    }

    /// This table's capacity class.
    #[must_use]
    pub fn class(&self) -> u8 {
        self.class
    }

    fn find_idx(&self, data: u64) -> Option<usize> {
        let cap = self.slots.len();
        let mut idx = (data % cap as u64) as usize;
        for _ in 0..cap {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Full(edge) if edge.data == data => return Some(idx),
                _ => idx = (idx + 1) % cap,
            }
        }
        None
    }

    fn find(&self, data: u64) -> Option<&Edge> {
        self.find_idx(data).map(|i| match &self.slots[i] {
            Slot::Full(edge) => edge,
            _ => unreachable!(),
        })
    }

    /// True when an insert should escalate to a wider container first.
    #[must_use]
    pub fn needs_grow(&self) -> bool {
        self.used * 4 >= self.slots.len() * 3
    }

    fn insert(&mut self, edge: Edge) -> bool {
        if let Some(idx) = self.find_idx(edge.data) {
            self.slots[idx] = Slot::Full(edge);
            return true;
        }
        if self.needs_grow() {
            return false;
        }
        let cap = self.slots.len();
        let mut idx = (edge.data % cap as u64) as usize;
        loop {
            match &self.slots[idx] {
                Slot::Empty | Slot::Tomb => {
                    if matches!(self.slots[idx], Slot::Empty) {
                        self.used += 1;
                    }
                    self.slots[idx] = Slot::Full(edge);
                    return true;
                }
                Slot::Full(_) => idx = (idx + 1) % cap,
            }
        }
    }

    fn remove(&mut self, data: u64) -> Option<Edge> {
        let idx = self.find_idx(data)?;
        let Slot::Full(edge) = std::mem::replace(&mut self.slots[idx], Slot::Tomb) else {
            unreachable!()
        };
        Some(edge)
    }

    fn edges(&self) -> Vec<Edge> {
        self.slots
            .iter()
            .filter_map(|s| match s {
                Slot::Full(edge) => Some(*edge),
                _ => None,
            })
            .collect()
    }
}

/// Container hint parsed from a rule (`:HASH-n` / `:ARRAY`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ContainerHint {
    /// Start hashing at the given capacity class.
    Hash(u8),
    /// Use a dense array sized by the level's key space.
    Array,
}

/// The polymorphic child container.
#[derive(Clone, Debug)]
pub enum Children {
    /// Build-time container: unordered vector, linear find.
    Vec(Vec<Edge>),
    /// No keyed children; classification always takes the default edge.
    Dummy,
    /// A single keyed child (plus the default edge on the node).
    TwoCase(Option<Edge>),
    /// Two keyed children (plus default).
    ThreeCase([Option<Edge>; 2]),
    /// Open-addressed hash table of a fixed capacity class.
    Hash(HashChildren),
    /// Dense array indexed by key data.
    Array(Vec<Option<EdgeTarget>>),
}

impl Children {
    /// Variant name, for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Children::Vec(_) => "vec",
            Children::Dummy => "dummy",
            Children::TwoCase(_) => "twocase",
            Children::ThreeCase(_) => "threecase",
            Children::Hash(_) => "hash",
            Children::Array(_) => "array",
        }
    }
}

/// A classification node.
#[derive(Clone, Debug)]
pub struct FlowNode {
    /// The key-extraction function this node classifies by.
    pub level: FlowLevel,
    /// Keyed children.
    pub children: Children,
    /// The unconditional edge taken when no keyed child matches.
    pub default: Option<EdgeTarget>,
    /// The data stored in this node's own parent edge.
    pub node_data: u64,
    /// Back-pointer to the parent node.
    pub parent: Option<NodeId>,
    /// CPUs that may ever walk through this node.
    pub threads: ThreadSet,
    /// True while this node is a spliced-in replacement table whose default
    /// edge still points at the table it replaces.
    pub growing: bool,
    /// `!` in the rule: no default route after this node.
    pub else_drop: bool,
    /// Container hint from the rule.
    pub hint: Option<ContainerHint>,
    /// Name of the element whose rule created this node.
    pub owner: Option<String>,
    num: u32,
}

impl FlowNode {
    /// A build-time node for `level`.
    #[must_use]
    pub fn new(level: FlowLevel) -> Self {
        let children = if matches!(level, FlowLevel::Dummy) {
            Children::Dummy
        } else {
            Children::Vec(Vec::new())
        };
        Self {
            level,
            children,
            default: None,
            node_data: 0,
            parent: None,
            threads: ThreadSet::none(1),
            growing: false,
            else_drop: false,
            hint: None,
            owner: None,
            num: 0,
        }
    }

    /// A dummy node: no keyed children, only a default edge.
    #[must_use]
    pub fn dummy() -> Self {
        Self::new(FlowLevel::Dummy)
    }

    /// True if this node's level is the dummy level.
    #[must_use]
    pub fn is_dummy(&self) -> bool {
        matches!(self.level, FlowLevel::Dummy)
    }

    /// Number of keyed children.
    #[must_use]
    pub fn num(&self) -> u32 {
        self.num
    }

    /// Find the keyed edge matching `data`.
    #[must_use]
    pub fn find(&self, data: u64) -> Option<Edge> {
        match &self.children {
            Children::Vec(v) => v.iter().find(|e| e.data == data).copied(),
            Children::Dummy => None,
            Children::TwoCase(slot) => slot.filter(|e| e.data == data),
            Children::ThreeCase(slots) => slots
                .iter()
                .flatten()
                .find(|e| e.data == data)
                .copied(),
            Children::Hash(h) => h.find(data).copied(),
            Children::Array(a) => a
                .get(data as usize)
                .copied()
                .flatten()
                .map(|target| Edge { data, target }),
        }
    }

    /// Insert or replace the keyed edge for `edge.data`. Returns false when
    /// the container is full and must grow first; `num()` is maintained.
    pub fn insert(&mut self, edge: Edge) -> bool {
        let existed = self.find(edge.data).is_some();
        let inserted = match &mut self.children {
            Children::Vec(v) => {
                if let Some(slot) = v.iter_mut().find(|e| e.data == edge.data) {
                    *slot = edge;
                } else {
                    v.push(edge);
                }
                true
            }
            Children::Dummy => false,
            Children::TwoCase(slot) => match slot {
                Some(e) if e.data == edge.data => {
                    *slot = Some(edge);
                    true
                }
                Some(_) => false,
                None => {
                    *slot = Some(edge);
                    true
                }
            },
            Children::ThreeCase(slots) => {
                if let Some(slot) = slots
                    .iter_mut()
                    .find(|s| s.is_some_and(|e| e.data == edge.data))
                {
                    *slot = Some(edge);
                    true
                } else if let Some(slot) = slots.iter_mut().find(|s| s.is_none()) {
                    *slot = Some(edge);
                    true
                } else {
                    false
                }
            }
            Children::Hash(h) => h.insert(edge),
            Children::Array(a) => {
                let idx = edge.data as usize;
                if idx < a.len() {
                    a[idx] = Some(edge.target);
                    true
                } else {
                    false
                }
            }
        };
        if inserted && !existed {
            self.num += 1;
        }
        inserted
    }

    /// Remove and return the keyed edge for `data`.
    pub fn remove(&mut self, data: u64) -> Option<Edge> {
        let removed = match &mut self.children {
            Children::Vec(v) => {
                let idx = v.iter().position(|e| e.data == data)?;
                Some(v.swap_remove(idx))
            }
            Children::Dummy => None,
            Children::TwoCase(slot) => {
                if slot.is_some_and(|e| e.data == data) {
                    slot.take()
                } else {
                    None
                }
            }
            Children::ThreeCase(slots) => slots
                .iter_mut()
                .find(|s| s.is_some_and(|e| e.data == data))
                .and_then(Option::take),
            Children::Hash(h) => h.remove(data),
            Children::Array(a) => {
                let target = a.get_mut(data as usize)?.take()?;
                Some(Edge { data, target })
            }
        };
        if removed.is_some() {
            self.num -= 1;
        }
        removed
    }

    /// Replace the child container, resetting the child count; the caller
    /// re-inserts the edges.
    pub(crate) fn replace_children(&mut self, children: Children) {
        self.children = children;
        self.num = 0;
    }

    /// Snapshot of the keyed edges, in container order.
    #[must_use]
    pub fn edges(&self) -> Vec<Edge> {
        match &self.children {
            Children::Vec(v) => v.clone(),
            Children::Dummy => Vec::new(),
            Children::TwoCase(slot) => slot.iter().copied().collect(),
            Children::ThreeCase(slots) => slots.iter().flatten().copied().collect(),
            Children::Hash(h) => h.edges(),
            Children::Array(a) => a
                .iter()
                .enumerate()
                .filter_map(|(data, t)| {
                    t.map(|target| Edge {
                        data: data as u64,
                        target,
                    })
                })
                .collect(),
        }
    }

    /// True when the hash container should escalate before inserting.
    #[must_use]
    pub fn container_wants_grow(&self) -> bool {
        match &self.children {
            Children::Hash(h) => h.needs_grow(),
            Children::TwoCase(slot) => slot.is_some(),
            Children::ThreeCase(slots) => slots.iter().all(Option::is_some),
            _ => false,
        }
    }

    /// Count the keyed edges the slow way; used by invariant checks.
    #[must_use]
    pub fn find_num(&self) -> u32 {
        self.edges().len() as u32
    }

    /// True if this node has no default edge anywhere below itself. A node
    /// with no default can never misroute unmatched traffic.
    #[must_use]
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(data: u64) -> Edge {
        Edge {
            data,
            target: EdgeTarget::Leaf(FcbId(data as u32)),
        }
    }

    #[test]
    fn vec_container_inserts_and_finds() {
        let mut node = FlowNode::new(FlowLevel::generic(12, 0xFFFF));
        assert!(node.insert(edge(0x0800)));
        assert!(node.insert(edge(0x0806)));
        assert_eq!(node.num(), 2);
        assert_eq!(node.find(0x0800), Some(edge(0x0800)));
        assert_eq!(node.find(0x86DD), None);
        assert_eq!(node.remove(0x0800), Some(edge(0x0800)));
        assert_eq!(node.num(), 1);
    }

    #[test]
    fn hash_container_probes_past_collisions() {
        let mut h = HashChildren::new(0);
        let cap = capacity_for(0) as u64;
        // Two keys in the same bucket.
        assert!(h.insert(edge(5)));
        assert!(h.insert(edge(5 + cap)));
        assert_eq!(h.find(5 + cap), Some(&edge(5 + cap)));
        h.remove(5);
        // Tombstone keeps the probe chain intact.
        assert_eq!(h.find(5 + cap), Some(&edge(5 + cap)));
    }

    #[test]
    fn hash_container_reports_grow_pressure() {
        let mut h = HashChildren::new(0);
        let mut inserted = 0u64;
        while !h.needs_grow() {
            assert!(h.insert(edge(inserted)));
            inserted += 1;
        }
        assert!(inserted as usize * 4 >= capacity_for(0) * 3);
    }

    #[test]
    fn array_container_is_keyed_by_index() {
        let mut node = FlowNode::new(FlowLevel::Thread { max_cpus: 4 });
        node.children = Children::Array(vec![None; 4]);
        assert!(node.insert(edge(2)));
        assert_eq!(node.find(2), Some(edge(2)));
        assert_eq!(node.find(3), None);
        assert!(!node.insert(edge(9)), "out-of-range key is rejected");
    }
}
