//! NIC offload bridge: export the static prefix of a finished tree as
//! flow patterns.
//!
//! A down-traversal walks keyed edges from the root and converts every
//! static classification step into a pattern item. The walk stops at the
//! first dynamic node; that node's subtree is registered under a *mark*
//! id. A NIC programmed with the emitted rules stamps the mark on
//! matching packets, and the runtime fast path jumps straight to the
//! registered dynamic subtree, skipping the static levels entirely.

use crate::level::FlowLevel;
use crate::node::{EdgeTarget, NodeId};
use crate::tree::Tree;
use log::debug;
use std::collections::HashMap;

/// Protocol layer a pattern item belongs to, advanced by byte offset.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PatternLayer {
    /// Link layer (offsets below the IP base).
    Ethernet,
    /// IPv4 header.
    Ipv4,
    /// Transport header.
    Transport,
}

/// One exact-match step of an offload rule.
#[derive(Clone, Copy, Debug)]
pub struct PatternItem {
    /// Layer the step matches in.
    pub layer: PatternLayer,
    /// Byte offset within the packet.
    pub offset: usize,
    /// Read width in bytes.
    pub width: usize,
    /// Expected (masked) value.
    pub value: u64,
    /// Mask applied before comparison.
    pub mask: u64,
}

/// A complete rule: the static pattern plus the mark identifying the
/// dynamic subtree the rule leads to.
#[derive(Clone, Debug)]
pub struct OffloadRule {
    /// Exact-match steps, root-first.
    pub items: Vec<PatternItem>,
    /// Mark stamped by the NIC on matching packets.
    pub mark: u32,
}

/// The emitted rules plus the mark→subtree registry.
#[derive(Debug, Default)]
pub struct OffloadPlan {
    /// Rules to install, in traversal order.
    pub rules: Vec<OffloadRule>,
    marks: HashMap<u32, NodeId>,
}

impl OffloadPlan {
    /// The dynamic subtree registered under `mark`.
    #[must_use]
    pub fn subtree(&self, mark: u32) -> Option<NodeId> {
        self.marks.get(&mark).copied()
    }

    /// Number of registered marks.
    #[must_use]
    pub fn mark_count(&self) -> usize {
        self.marks.len()
    }
}

fn layer_for(offset: usize, ip_base: usize) -> PatternLayer {
    if offset < ip_base {
        PatternLayer::Ethernet
    } else if offset < ip_base + 20 {
        PatternLayer::Ipv4
    } else {
        PatternLayer::Transport
    }
}

/// Convert one classification step into a pattern item; `None` for levels
/// a NIC cannot match on.
#[must_use]
pub fn to_offload_item(level: &FlowLevel, data: u64, ip_base: usize) -> Option<PatternItem> {
    match level {
        FlowLevel::Generic(g) if !level.is_dynamic() => Some(PatternItem {
            layer: layer_for(g.offset, ip_base),
            offset: g.offset,
            width: g.width.bytes(),
            value: data,
            mask: g.mask,
        }),
        _ => None,
    }
}

/// Walk the static prefix of the tree at `root`, emitting one rule per
/// reachable dynamic subtree. `ip_base` anchors the layer classification
/// (14 in an Ethernet context).
#[must_use]
pub fn build_plan(tree: &Tree, root: NodeId, ip_base: usize) -> OffloadPlan {
    let mut plan = OffloadPlan::default();
    let mut next_mark = 1u32;
    let mut stack: Vec<(NodeId, Vec<PatternItem>)> = vec![(root, Vec::new())];
    while let Some((id, path)) = stack.pop() {
        let node = tree.node(id);
        if node.level.is_dynamic() {
            // First dynamic level: everything below is runtime state.
            let mark = next_mark;
            next_mark += 1;
            plan.marks.insert(mark, id);
            plan.rules.push(OffloadRule {
                items: path,
                mark,
            });
            continue;
        }
        for edge in node.edges() {
            let EdgeTarget::Node(child) = edge.target else {
                continue;
            };
            let mut items = path.clone();
            if let Some(item) = to_offload_item(&node.level, edge.data, ip_base) {
                items.push(item);
                stack.push((child, items));
            }
        }
        // Default edges carry no matchable pattern; the slow path keeps
        // handling them.
        if let Some(EdgeTarget::Node(child)) = node.default {
            if node.num() == 0 {
                stack.push((child, path));
            }
        }
    }
    debug!(
        "offload plan: {} rules over {} marks",
        plan.rules.len(),
        plan.mark_count()
    );
    plan
}
