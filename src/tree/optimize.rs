//! Tree optimisation: container selection and the per-thread fan-out.
//!
//! Runs bottom-up over a fully built tree. Useless dynamic levels collapse
//! into their default, child containers are rewritten into the cheapest
//! shape for their population (dummy, two-case, three-case, hash class,
//! dense array), and any dynamic subtree reachable from several CPUs gets
//! an explicit thread level spliced above it so every CPU owns a private
//! copy. The pass is idempotent: optimising an optimised tree is a no-op
//! up to container choice.

use super::{SlotRef, Tree};
use crate::level::FlowLevel;
use crate::node::{
    Children, ContainerHint, Edge, EdgeTarget, FlowNode, HashChildren, NodeId, capacity_for,
};
use crate::utils::ThreadSet;
use log::{debug, warn};

/// Largest key space a dense array container may span.
const ARRAY_LIMIT: u64 = 65536;

/// Pick the container for a dynamic level at the given hash class,
/// escalating to a dense array once the class covers the key space.
pub(crate) fn container_for_class(level: &FlowLevel, class: u8) -> Children {
    let class = class.min(9);
    if let Some(max) = level.max_value() {
        let space = max.saturating_add(1);
        if space <= ARRAY_LIMIT
            && (level.is_mt_safe() || capacity_for(class) as u64 >= space)
        {
            return Children::Array(vec![None; space as usize]);
        }
    }
    Children::Hash(HashChildren::new(class))
}

impl Tree {
    /// Optimise the subtree at `root` for the given traversing thread set,
    /// returning the (possibly new) root.
    pub fn optimize(&mut self, root: NodeId, threads: &ThreadSet) -> NodeId {
        let out = self.optimize_node(root, threads);
        self.check(out);
        out
    }

    fn optimize_node(&mut self, node: NodeId, threads: &ThreadSet) -> NodeId {
        // A dynamic level whose mask was pruned empty classifies nothing.
        if self.node(node).level.is_dynamic() && !self.node(node).level.is_useful() {
            if let Some(EdgeTarget::Node(def)) = self.node(node).default {
                debug!("optimize: dropping useless dynamic level");
                self.node_mut(node).default = None;
                self.node_mut(def).parent = None;
                self.free(node);
                return self.optimize_node(def, threads);
            }
            warn!("optimize: useless dynamic level with a leaf default, keeping it");
        }

        // Shared dynamic state: splice a thread fan-out so each CPU gets a
        // private copy of the subtree.
        if self.node(node).level.is_dynamic()
            && !self.node(node).level.is_mt_safe()
            && threads.weight() > 1
        {
            debug!("optimize: inserting thread fan-out above dynamic subtree");
            return self.splice_thread_fanout(node, threads);
        }

        // Children first. Below a thread level each branch belongs to a
        // single CPU.
        let is_thread = self.node(node).level.is_mt_safe();
        for edge in self.node(node).edges() {
            if let EdgeTarget::Node(child) = edge.target {
                let tset = if is_thread {
                    ThreadSet::single(edge.data as usize, threads.len())
                } else {
                    threads.clone()
                };
                let opt = self.optimize_node(child, &tset);
                if opt != child {
                    self.set_edge(node, SlotRef::Keyed(edge.data), EdgeTarget::Node(opt));
                }
            }
        }
        if let Some(EdgeTarget::Node(def)) = self.node(node).default {
            let opt = self.optimize_node(def, threads);
            if opt != def {
                self.set_edge(node, SlotRef::Default, EdgeTarget::Node(opt));
            }
        }

        self.node_mut(node).threads = threads.clone();

        if self.node(node).level.is_dynamic() {
            debug!("optimize: dynamic level keeps a growable container");
            self.rebuild_container(node, None);
            return node;
        }

        match self.node(node).num() {
            0 => {
                if let Some(EdgeTarget::Node(def)) = self.node(node).default {
                    debug!("optimize: childless level removed");
                    self.node_mut(node).default = None;
                    self.node_mut(def).parent = None;
                    let data = self.node(node).node_data;
                    self.node_mut(def).node_data = data;
                    self.free(node);
                    return def;
                }
                // A bare default leaf still needs its node.
                self.node_mut(node).children = Children::Dummy;
                node
            }
            1 => {
                let child = self.node(node).edges()[0];
                match (self.node(node).default, child.target) {
                    (None, EdgeTarget::Leaf(_)) => {
                        debug!("optimize: single leaf child, demoting to dummy container");
                        self.node_mut(node).remove(child.data);
                        self.node_mut(node).children = Children::Dummy;
                        self.set_edge(node, SlotRef::Default, child.target);
                        node
                    }
                    (None, EdgeTarget::Node(grand)) => {
                        if self.node(node).else_drop {
                            self.node_mut(node).children =
                                Children::TwoCase(Some(child));
                            node
                        } else {
                            debug!("optimize: single-branch level removed");
                            self.node_mut(node).remove(child.data);
                            self.node_mut(grand).parent = None;
                            let data = self.node(node).node_data;
                            self.node_mut(grand).node_data = data;
                            self.free(node);
                            grand
                        }
                    }
                    (Some(_), _) => {
                        self.node_mut(node).children = Children::TwoCase(Some(child));
                        node
                    }
                }
            }
            2 => {
                let edges = self.node(node).edges();
                let (mut a, mut b) = (edges[0], edges[1]);
                // The else-drop branch goes first so it keeps a keyed case.
                if self.edge_else_drop(b) && !self.edge_else_drop(a) {
                    std::mem::swap(&mut a, &mut b);
                }
                if self.node(node).default.is_none() && !self.edge_else_drop(b) {
                    debug!("optimize: two children and no default, second becomes default");
                    self.node_mut(node).remove(a.data);
                    self.node_mut(node).remove(b.data);
                    self.node_mut(node).children = Children::TwoCase(None);
                    self.node_mut(node).insert(a);
                    self.set_edge(node, SlotRef::Default, b.target);
                    node
                } else {
                    self.node_mut(node).remove(a.data);
                    self.node_mut(node).remove(b.data);
                    self.node_mut(node).children = Children::ThreeCase([None, None]);
                    self.node_mut(node).insert(a);
                    self.node_mut(node).insert(b);
                    node
                }
            }
            n => {
                debug!("optimize: {n} children, picking hash/array container");
                self.rebuild_container(node, None);
                node
            }
        }
    }

    fn edge_else_drop(&self, edge: Edge) -> bool {
        match edge.target {
            EdgeTarget::Node(id) => self.node(id).else_drop,
            EdgeTarget::Leaf(_) => false,
        }
    }

    /// Rebuild the node's container as hash or array, re-inserting every
    /// edge. `force_class` overrides the hint-derived starting class.
    fn rebuild_container(&mut self, node: NodeId, force_class: Option<u8>) {
        let edges = self.node(node).edges();
        let level = self.node(node).level.clone();
        let base_class = force_class.or(match self.node(node).hint {
            Some(ContainerHint::Hash(n)) => Some(n),
            Some(ContainerHint::Array) => {
                let space = level.max_value().map_or(u64::MAX, |m| m.saturating_add(1));
                if space <= ARRAY_LIMIT {
                    self.node_mut(node)
                        .replace_children(Children::Array(vec![None; space as usize]));
                    self.reinsert(node, edges);
                    return;
                }
                warn!("optimize: ARRAY hint ignored, key space too large");
                None
            }
            None => None,
        });
        // Smallest class comfortably holding the current population.
        let class = base_class.unwrap_or_else(|| {
            (0u8..=9)
                .find(|&c| capacity_for(c) >= edges.len() * 2)
                .unwrap_or(9)
        });
        let container = container_for_class(&level, class);
        self.node_mut(node).replace_children(container);
        self.reinsert(node, edges);
    }

    fn reinsert(&mut self, node: NodeId, edges: Vec<Edge>) {
        for edge in edges {
            let ok = self.node_mut(node).insert(edge);
            debug_assert!(ok, "rebuilt container rejected an edge");
        }
    }

    /// Duplicate the subtree per CPU under a new thread-level array node.
    fn splice_thread_fanout(&mut self, node: NodeId, threads: &ThreadSet) -> NodeId {
        let max_cpus = threads.len();
        let mut fanout = FlowNode::new(FlowLevel::Thread { max_cpus });
        fanout.children = Children::Array(vec![None; max_cpus]);
        fanout.node_data = self.node(node).node_data;
        fanout.threads = threads.clone();
        let fanout_id = self.alloc(fanout);

        self.node_mut(node).parent = None;
        for cpu in threads.iter() {
            let copy = self.duplicate(EdgeTarget::Node(node), true);
            let EdgeTarget::Node(copy_id) = copy else {
                unreachable!("duplicate of a node is a node");
            };
            let single = ThreadSet::single(cpu, max_cpus);
            let opt = self.optimize_node(copy_id, &single);
            self.set_edge(fanout_id, SlotRef::Keyed(cpu as u64), EdgeTarget::Node(opt));
        }
        // The original subtree was only a template for the per-CPU copies.
        self.free_subtree(EdgeTarget::Node(node));
        fanout_id
    }
}
