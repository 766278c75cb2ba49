//! Leaf replacement: attaching downstream tables below rule outcomes and
//! the final swap of build-phase leaves for pool FCBs.

use super::{EdgeRef, SlotRef, Tree};
use crate::fcb::FcbId;
use crate::node::{EdgeTarget, NodeId};
use anyhow::Result;
use log::{debug, trace};
use std::collections::HashMap;

impl Tree {
    /// Substitute a pruned copy of the tree at `other` for every keyed leaf
    /// of `this`, folding each old leaf's payload into the copy's leaves.
    ///
    /// Default-edge leaves are left alone: they are else/drop routes, not
    /// outcomes a downstream table runs after.
    ///
    /// # Errors
    ///
    /// Fails on payload conflicts.
    pub fn replace_leaves(&mut self, this: NodeId, other: NodeId, discard_fcb_data: bool) -> Result<()> {
        debug_assert!(!self.node(other).is_dummy());
        for edge in self.leaf_edges(this, true, false) {
            self.replace_leaf_with_node(edge, other, discard_fcb_data)?;
        }
        Ok(())
    }

    /// Substitute a pruned copy of the tree at `other` for the leaf at
    /// `edge`. Returns true when ancestor knowledge pruned the copy.
    ///
    /// The copy is pruned by every level already decided on the leaf's
    /// ancestor chain: a keyed edge fixes its level to the edge data, a
    /// default edge excludes every sibling's data.
    ///
    /// # Errors
    ///
    /// Fails on payload conflicts.
    pub fn replace_leaf_with_node(
        &mut self,
        edge: EdgeRef,
        other: NodeId,
        discard_fcb_data: bool,
    ) -> Result<bool> {
        let Some(EdgeTarget::Leaf(old_leaf)) = self.edge_target(edge) else {
            panic!("replace_leaf_with_node called on a non-leaf edge");
        };
        let mut changed = false;
        let dup = self.duplicate(EdgeTarget::Node(other), true);
        let EdgeTarget::Node(dup_node) = dup else {
            unreachable!("duplicate of a node is a node");
        };
        let mut no = Some(EdgeTarget::Node(dup_node));

        let mut gparent = Some(edge.node);
        let mut gdata = match edge.slot {
            SlotRef::Keyed(data) => data,
            SlotRef::Default => 0,
        };
        let mut was_default = matches!(edge.slot, SlotRef::Default);
        while let Some(gp) = gparent {
            let level = self.node(gp).level.clone();
            match no {
                Some(EdgeTarget::Node(n)) => {
                    if was_default && !level.is_dynamic() {
                        // Default path: every sibling value is excluded.
                        let mut cur = Some(EdgeTarget::Node(n));
                        for sibling in self.node(gp).edges() {
                            let Some(EdgeTarget::Node(cn)) = cur else {
                                break;
                            };
                            cur = self.prune(cn, &level, sibling.data, true, &mut changed)?;
                        }
                        no = cur;
                    } else {
                        no = self.prune(n, &level, gdata, was_default, &mut changed)?;
                    }
                }
                _ => break,
            }
            if no.is_none() {
                // Completely pruned: keep the FCB as it is.
                trace!("replacement completely pruned, keeping leaf");
                return Ok(true);
            }
            gdata = self.node(gp).node_data;
            let child = gp;
            gparent = self.node(gp).parent;
            was_default = match gparent {
                Some(p) => self.node(p).default == Some(EdgeTarget::Node(child)),
                None => false,
            };
        }

        let no = no.expect("checked above");
        self.set_edge(edge.node, edge.slot, no);

        if !discard_fcb_data {
            match no {
                EdgeTarget::Leaf(new_leaf) => {
                    self.combine_fcb_data(new_leaf, old_leaf)?;
                }
                EdgeTarget::Node(new_node) => {
                    self.leaf_combine_data(new_node, old_leaf, true, true)?;
                }
            }
        }
        self.free_leaf_ref(old_leaf);
        Ok(changed)
    }

    /// Swap every build-phase leaf for a pool-allocated runtime FCB,
    /// de-duplicating byte-equal static leaves so equal outcomes share one
    /// block. Returns the number of distinct runtime FCBs installed.
    pub fn finalize_leaves(&mut self, root: NodeId) -> usize {
        let mut known: HashMap<(u32, Vec<u8>), Vec<FcbId>> = HashMap::new();
        let mut installed = 0usize;
        for edge in self.leaf_edges(root, true, true) {
            let Some(EdgeTarget::Leaf(old)) = self.edge_target(edge) else {
                continue;
            };
            if !self.pool.get(old).is_build() {
                // Already replaced through another shared edge.
                continue;
            }
            let parent_dynamic = self.node(edge.node).level.is_dynamic();
            let key = self.pool.get(old).dedup_key();
            let node_data = self.pool.get(old).node_data;

            let mut chosen: Option<FcbId> = None;
            if !parent_dynamic {
                if let Some(candidates) = known.get(&key) {
                    // A shared FCB keeps a single node_data; only reuse when
                    // the data matches or the edge is a default route.
                    let is_default = matches!(edge.slot, SlotRef::Default);
                    chosen = candidates
                        .iter()
                        .copied()
                        .find(|&c| is_default || self.pool.get(c).node_data == node_data);
                }
            }

            let nfcb = match chosen {
                Some(shared) => {
                    // Multiple parents: the back-pointer loses its meaning.
                    self.pool.get_mut(shared).parent = None;
                    shared
                }
                None => {
                    let id = self.pool.allocate(0);
                    let (payload, flags) = {
                        let src = self.pool.get(old);
                        (src.data().to_vec(), src.flags)
                    };
                    let fcb = self.pool.get_mut(id);
                    fcb.data_mut().copy_from_slice(&payload);
                    fcb.flags = flags;
                    fcb.node_data = node_data;
                    fcb.parent = Some(edge.node);
                    fcb.reset_count(1);
                    known.entry(key).or_default().push(id);
                    installed += 1;
                    id
                }
            };
            self.free_leaf_ref(old);
            self.set_edge(edge.node, edge.slot, EdgeTarget::Leaf(nfcb));
            if chosen.is_some() {
                self.pool.get_mut(nfcb).parent = None;
            }
        }
        debug!("leaf replacement installed {installed} runtime FCBs");
        installed
    }
}
