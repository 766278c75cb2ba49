//! Combining two classification trees into one.
//!
//! `combine` unifies tree B into tree A either *as child* (B is installed
//! downstream of every A decision) or *as else* (B handles whatever A's
//! rules do not match — the normal cascading-rules semantics). Both inputs
//! must be detached from any parent. Leaves merge under the payload
//! conflict rule; an overlap between two complete rules is only a warning,
//! with the winner picked by `priority`.

use super::{SlotRef, Tree};
use crate::fcb::FcbId;
use crate::node::{EdgeTarget, NodeId};
use anyhow::{Result, bail};
use log::{debug, warn};

impl Tree {
    /// Unify the tree rooted at `other` into the tree rooted at `this`.
    ///
    /// Returns the root of the combined tree (which may be `other` when
    /// `this` collapses, or a swapped root when a dynamic parent would
    /// otherwise own a static child).
    ///
    /// # Errors
    ///
    /// Fails on payload conflicts and on attaching a static subtree under a
    /// dynamic node with `priority` set.
    pub fn combine(
        &mut self,
        this: NodeId,
        other: NodeId,
        as_child: bool,
        priority: bool,
        duplicate_leaf: bool,
    ) -> Result<NodeId> {
        self.check(this);
        self.check(other);
        debug_assert!(self.node(other).parent.is_none());

        // A dummy on either side dissolves into the other tree.
        if self.node(this).is_dummy() {
            debug!("combine: left side is dummy (as_child {as_child})");
            return match self.node(this).default {
                Some(EdgeTarget::Leaf(leaf)) => {
                    self.leaf_combine_data(other, leaf, as_child, !as_child && priority)?;
                    self.free(this);
                    self.free_leaf_ref(leaf);
                    Ok(other)
                }
                Some(EdgeTarget::Node(inner)) => {
                    self.node_mut(this).default = None;
                    self.node_mut(inner).parent = None;
                    self.free(this);
                    self.combine(inner, other, as_child, priority, duplicate_leaf)
                }
                None => {
                    self.free(this);
                    Ok(other)
                }
            };
        }

        if self.node(other).is_dummy() {
            debug!("combine: other side is dummy (as_child {as_child})");
            match self.node(other).default {
                Some(EdgeTarget::Leaf(leaf)) => {
                    if as_child {
                        self.leaf_combine_data(this, leaf, true, true)?;
                    } else {
                        // Duplicate the leaf onto every empty default route;
                        // without priority it also overrides early-drop
                        // defaults.
                        for id in self.default_leaf_nodes(this) {
                            match self.node(id).default {
                                None => {
                                    let dup =
                                        self.duplicate(EdgeTarget::Leaf(leaf), duplicate_leaf);
                                    self.set_edge(id, SlotRef::Default, dup);
                                }
                                Some(EdgeTarget::Leaf(existing))
                                    if !priority
                                        && self.pool.get(existing).is_early_drop() =>
                                {
                                    self.free_leaf_ref(existing);
                                    let dup =
                                        self.duplicate(EdgeTarget::Leaf(leaf), duplicate_leaf);
                                    self.set_edge(id, SlotRef::Default, dup);
                                }
                                _ => {}
                            }
                        }
                    }
                    self.node_mut(other).default = None;
                    self.free(other);
                    self.free_leaf_ref(leaf);
                    return Ok(this);
                }
                Some(EdgeTarget::Node(inner)) => {
                    self.node_mut(other).default = None;
                    self.node_mut(inner).parent = None;
                    self.free(other);
                    return self.combine(this, inner, as_child, priority, duplicate_leaf);
                }
                None => {
                    self.free(other);
                    return Ok(this);
                }
            }
        }

        // A dynamic parent cannot own a static child: swap when allowed.
        if self.node(this).level.is_dynamic() && !self.node(other).level.is_dynamic() {
            if priority {
                bail!(
                    "cannot attach a static classification under the dynamic node \
                     created by {}; insert a new context manager below the dynamic \
                     element instead",
                    self.node(this)
                        .owner
                        .as_deref()
                        .unwrap_or("<unknown element>")
                );
            }
            debug!("combine: inverting dynamic parent and static child");
            let data = self.node(this).node_data;
            self.node_mut(this).parent = None;
            let root = self.combine(other, this, as_child, false, duplicate_leaf)?;
            self.node_mut(root).node_data = data;
            return Ok(root);
        }

        if as_child {
            self.combine_child(this, other, priority, duplicate_leaf)?;
        } else {
            self.combine_else(this, other, priority, duplicate_leaf)?;
        }
        self.check(this);
        Ok(this)
    }

    /// Merge `other` downstream of every rule of `this`.
    fn combine_child(
        &mut self,
        this: NodeId,
        other: NodeId,
        priority: bool,
        duplicate_leaf: bool,
    ) -> Result<()> {
        if self.node(this).level.equals(&self.node(other).level) {
            debug!("combine-child: same level");
            for other_edge in self.node(other).edges() {
                self.node_mut(other).remove(other_edge.data);
                match self.node(this).find(other_edge.data) {
                    None => {
                        self.set_edge(this, SlotRef::Keyed(other_edge.data), other_edge.target);
                    }
                    Some(mine) => match (mine.target, other_edge.target) {
                        (EdgeTarget::Node(a), EdgeTarget::Node(b)) => {
                            self.node_mut(b).parent = None;
                            let merged = self.combine(a, b, true, priority, duplicate_leaf)?;
                            self.set_edge(this, SlotRef::Keyed(other_edge.data), EdgeTarget::Node(merged));
                        }
                        _ => bail!(
                            "rules of {} and {} overlap at value {:#x}; merging two \
                             complete rules as children is not meaningful",
                            self.node(this).owner.as_deref().unwrap_or("<unknown>"),
                            self.node(other).owner.as_deref().unwrap_or("<unknown>"),
                            other_edge.data,
                        ),
                    },
                }
            }
            if let Some(other_default) = self.node_mut(other).default.take() {
                self.default_combine(this, other_default, true, priority)?;
            }
            self.free(other);
            return Ok(());
        }

        debug!(
            "combine-child: different levels ({} under {}), replacing leaves",
            self.node(other).level,
            self.node(this).level
        );
        // Discard the child FCB data: in the as-child path the downstream
        // table owns the payload.
        self.replace_leaves(this, other, true)?;
        self.free_subtree(EdgeTarget::Node(other));
        Ok(())
    }

    /// Merge `other` into every default path of `this`.
    fn combine_else(
        &mut self,
        this: NodeId,
        other: NodeId,
        priority: bool,
        duplicate_leaf: bool,
    ) -> Result<()> {
        if self.node(this).level.equals(&self.node(other).level) {
            debug!("combine-else: same level");
            if self.node(other).level.is_dynamic() {
                self.node_mut(this).level.set_dynamic();
            }
            for other_edge in self.node(other).edges() {
                self.node_mut(other).remove(other_edge.data);
                let mine = self.node(this).find(other_edge.data);
                match mine {
                    None => {
                        match self.node(this).default {
                            // No default: adopt the other child as-is.
                            None => {
                                self.set_edge(
                                    this,
                                    SlotRef::Keyed(other_edge.data),
                                    other_edge.target,
                                );
                                continue;
                            }
                            Some(EdgeTarget::Leaf(def_leaf)) => {
                                if let EdgeTarget::Leaf(other_leaf) = other_edge.target {
                                    // The incoming leaf is more specific than
                                    // our default; it takes the slot.
                                    let dup = self
                                        .duplicate(EdgeTarget::Leaf(other_leaf), true);
                                    self.set_edge(this, SlotRef::Keyed(other_edge.data), dup);
                                    self.free_leaf_ref(other_leaf);
                                    continue;
                                }
                                let dup =
                                    self.duplicate(EdgeTarget::Leaf(def_leaf), duplicate_leaf);
                                self.set_edge(this, SlotRef::Keyed(other_edge.data), dup);
                            }
                            Some(EdgeTarget::Node(def_node)) => {
                                let dup =
                                    self.duplicate(EdgeTarget::Node(def_node), duplicate_leaf);
                                self.set_edge(this, SlotRef::Keyed(other_edge.data), dup);
                            }
                        }
                        self.attach_into_child(
                            this,
                            other_edge.data,
                            other_edge.target,
                            priority,
                            duplicate_leaf,
                        )?;
                    }
                    Some(_) => {
                        self.attach_into_child(
                            this,
                            other_edge.data,
                            other_edge.target,
                            priority,
                            duplicate_leaf,
                        )?;
                    }
                }
            }
            if let Some(other_default) = self.node_mut(other).default.take() {
                debug!("combine-else: merging other default (priority {priority})");
                self.default_combine(this, other_default, false, priority)?;
            }
            self.free(other);
            self.check(this);
            return Ok(());
        }

        debug!(
            "combine-else: no easy combine of {} and {}",
            self.node(this).level,
            self.node(other).level
        );
        // Other goes below every child and, pruned by everything the
        // children already decided, below the default.
        let this_level = self.node(this).level.clone();
        let mut pruned_default = Some(self.duplicate(EdgeTarget::Node(other), duplicate_leaf));
        for edge in self.node(this).edges() {
            match edge.target {
                EdgeTarget::Node(child) => {
                    let dup = self.duplicate(EdgeTarget::Node(other), duplicate_leaf);
                    let EdgeTarget::Node(dup_node) = dup else {
                        unreachable!("duplicate of a node is a node");
                    };
                    let mut changed = false;
                    if let Some(pruned) =
                        self.prune(dup_node, &this_level, edge.data, false, &mut changed)?
                    {
                        self.target_combine(
                            this,
                            SlotRef::Keyed(edge.data),
                            EdgeTarget::Node(child),
                            pruned,
                            false,
                            priority,
                        )?;
                    }
                }
                EdgeTarget::Leaf(_) => {
                    if let Some(EdgeTarget::Node(def)) = pruned_default {
                        let mut changed = false;
                        pruned_default =
                            self.prune(def, &this_level, edge.data, true, &mut changed)?;
                    }
                }
            }
        }
        if let Some(pruned) = pruned_default {
            self.default_combine(this, pruned, false, priority)?;
        }
        self.free_subtree(EdgeTarget::Node(other));
        self.check(this);
        Ok(())
    }

    /// Merge `incoming` into the existing child at `data` of `this`.
    fn attach_into_child(
        &mut self,
        this: NodeId,
        data: u64,
        incoming: EdgeTarget,
        priority: bool,
        duplicate_leaf: bool,
    ) -> Result<()> {
        let mine = self
            .node(this)
            .find(data)
            .expect("attach site exists")
            .target;
        match (mine, incoming) {
            (EdgeTarget::Leaf(a), EdgeTarget::Leaf(b)) => {
                if !self.pool.get(a).keep && !self.pool.get(b).keep {
                    warn!(
                        "rules of {} and {} overlap at value {data:#x}; \
                         keeping the higher-priority payload",
                        self.pool.get(a).origin.as_deref().unwrap_or("<unknown>"),
                        self.pool.get(b).origin.as_deref().unwrap_or("<unknown>"),
                    );
                }
                self.combine_fcb_data(a, b)?;
                self.free_leaf_ref(b);
            }
            (EdgeTarget::Node(a), EdgeTarget::Node(b)) => {
                self.node_mut(b).parent = None;
                let merged = self.combine(a, b, false, priority, duplicate_leaf)?;
                self.set_edge(this, SlotRef::Keyed(data), EdgeTarget::Node(merged));
            }
            (EdgeTarget::Leaf(a), EdgeTarget::Node(b)) => {
                // The node subsumes the leaf: push the leaf's payload into
                // the node's leaves (creating defaults), then take the slot.
                self.leaf_combine_data_create(b, a, false)?;
                self.set_edge(this, SlotRef::Keyed(data), EdgeTarget::Node(b));
                self.free_leaf_ref(a);
            }
            (EdgeTarget::Node(a), EdgeTarget::Leaf(b)) => {
                // Else case: the leaf becomes the default action of every
                // default route under the node, except dynamic defaults
                // which are prototypes, not else routes.
                self.leaf_onto_defaults(a, b, false, priority, true)?;
                self.free_leaf_ref(b);
            }
        }
        Ok(())
    }

    /// Combine `incoming` into the edge of `parent` at `slot` currently
    /// holding `mine`.
    fn target_combine(
        &mut self,
        parent: NodeId,
        slot: SlotRef,
        mine: EdgeTarget,
        incoming: EdgeTarget,
        as_child: bool,
        priority: bool,
    ) -> Result<()> {
        match (mine, incoming) {
            (EdgeTarget::Node(a), EdgeTarget::Node(b)) => {
                self.node_mut(b).parent = None;
                let merged = self.combine(a, b, as_child, priority, true)?;
                self.set_edge(parent, slot, EdgeTarget::Node(merged));
            }
            (EdgeTarget::Node(a), EdgeTarget::Leaf(b)) => {
                self.leaf_onto_defaults(a, b, as_child, priority, true)?;
                self.free_leaf_ref(b);
            }
            (EdgeTarget::Leaf(a), EdgeTarget::Leaf(b)) => {
                if priority || self.pool.get(a).keep {
                    self.combine_fcb_data(a, b)?;
                    self.free_leaf_ref(b);
                } else {
                    self.free_leaf_ref(a);
                    self.set_edge(parent, slot, EdgeTarget::Leaf(b));
                }
            }
            (EdgeTarget::Leaf(a), EdgeTarget::Node(b)) => {
                let discard = !priority || self.node(b).level.is_dynamic();
                self.leaf_combine_data_create(b, a, discard)?;
                self.set_edge(parent, slot, EdgeTarget::Node(b));
                self.free_leaf_ref(a);
            }
        }
        Ok(())
    }

    /// Combine `incoming` with `this`'s default edge.
    pub(crate) fn default_combine(
        &mut self,
        this: NodeId,
        incoming: EdgeTarget,
        as_child: bool,
        priority: bool,
    ) -> Result<()> {
        match self.node(this).default {
            None => {
                debug!("default-combine: no default, attaching other");
                self.set_edge(this, SlotRef::Default, incoming);
            }
            Some(mine) => {
                self.target_combine(this, SlotRef::Default, mine, incoming, as_child, priority)?;
            }
        }
        Ok(())
    }

    /// Attach leaf `leaf` to every empty or overridable default route in
    /// the subtree at `node`. `no_dynamic` skips dynamic nodes, whose
    /// default is a per-key prototype rather than an else route.
    pub(crate) fn leaf_onto_defaults(
        &mut self,
        node: NodeId,
        leaf: FcbId,
        as_child: bool,
        priority: bool,
        no_dynamic: bool,
    ) -> Result<()> {
        for id in self.default_leaf_nodes(node) {
            if no_dynamic && self.node(id).level.is_dynamic() {
                continue;
            }
            match self.node(id).default {
                None => {
                    let dup = self.duplicate(EdgeTarget::Leaf(leaf), true);
                    self.set_edge(id, SlotRef::Default, dup);
                }
                Some(EdgeTarget::Leaf(existing)) => {
                    if as_child || !priority {
                        let data = self.pool.get(existing).node_data;
                        let dup = self.duplicate(EdgeTarget::Leaf(leaf), true);
                        self.free_leaf_ref(existing);
                        self.set_edge(id, SlotRef::Default, dup);
                        if let EdgeTarget::Leaf(new_leaf) = dup {
                            self.pool.get_mut(new_leaf).node_data = data;
                        }
                    } else {
                        self.combine_fcb_data(existing, leaf)?;
                    }
                }
                Some(EdgeTarget::Node(_)) => unreachable!("default_leaf_nodes filtered these"),
            }
        }
        Ok(())
    }

    /// Merge `leaf`'s payload into every leaf of the subtree at `root`,
    /// without creating new leaves.
    pub(crate) fn leaf_combine_data(
        &mut self,
        root: NodeId,
        leaf: FcbId,
        do_final: bool,
        do_default: bool,
    ) -> Result<()> {
        for edge in self.leaf_edges(root, do_final, do_default) {
            let Some(EdgeTarget::Leaf(target)) = self.edge_target(edge) else {
                continue;
            };
            self.combine_fcb_data(target, leaf)?;
        }
        Ok(())
    }

    /// Merge `leaf`'s payload into every leaf of the subtree at `root`,
    /// installing a duplicate of `leaf` on every empty default route.
    /// `discard` keeps the subtree's own payloads untouched.
    pub(crate) fn leaf_combine_data_create(
        &mut self,
        root: NodeId,
        leaf: FcbId,
        discard: bool,
    ) -> Result<()> {
        for id in self.all_nodes(root) {
            if self.node(id).default.is_none() {
                let dup = self.duplicate(EdgeTarget::Leaf(leaf), true);
                self.set_edge(id, SlotRef::Default, dup);
            }
        }
        if !discard {
            self.leaf_combine_data(root, leaf, true, true)?;
        }
        Ok(())
    }

    /// Payload-merge `from` into `into` under the conflict rule, clearing
    /// the early-drop flag when the incoming leaf routes traffic.
    pub(crate) fn combine_fcb_data(&mut self, into: FcbId, from: FcbId) -> Result<()> {
        if into == from {
            return Ok(());
        }
        let from_fcb = self.pool.get(from).clone();
        let into_fcb = self.pool.get_mut(into);
        if let Err(e) = into_fcb.combine_data(&from_fcb) {
            warn!("conflicting classification while merging rules");
            return Err(e);
        }
        if into_fcb.is_early_drop() && !from_fcb.is_early_drop() {
            into_fcb.set_early_drop(false);
        }
        Ok(())
    }

    /// Drop one build-phase reference to `leaf`, freeing it at zero.
    pub(crate) fn free_leaf_ref(&mut self, leaf: FcbId) {
        if !self.pool.contains(leaf) {
            return;
        }
        let fcb = self.pool.get_mut(leaf);
        if fcb.count() > 1 {
            fcb.release(1);
        } else {
            self.pool.init_release(leaf);
        }
    }
}
