//! Pruning a subtree with knowledge decided higher up the final tree.
//!
//! `prune(T, L, d, inverted)` removes from `T` every branch inconsistent
//! with the fact that, above `T`, `L.key(p) == d` (or `!= d` when
//! `inverted`). Dynamic levels lose the already-fixed mask bits and
//! collapse into their default once useless; a static node classifying on
//! `L` itself is replaced by the decided child.

use super::Tree;
use crate::level::FlowLevel;
use crate::node::{EdgeTarget, NodeId};
use anyhow::{Result, bail};
use log::trace;

impl Tree {
    /// Prune the subtree rooted at `node`. Returns the replacement target,
    /// or `None` when the subtree is pruned away entirely. `changed` is set
    /// whenever the structure was altered.
    ///
    /// # Errors
    ///
    /// Fails on the unsupported static-below-dynamic layout.
    pub fn prune(
        &mut self,
        node: NodeId,
        olevel: &FlowLevel,
        data: u64,
        inverted: bool,
        changed: &mut bool,
    ) -> Result<Option<EdgeTarget>> {
        if self.node(node).is_dummy() {
            return Ok(Some(EdgeTarget::Node(node)));
        }
        trace!(
            "prune node {} level {} with {} data {data:#x} inverted {inverted}",
            node.raw(),
            self.node(node).level,
            olevel
        );

        let mut ptr = Some(EdgeTarget::Node(node));
        if self.node(node).level.is_dynamic() {
            // Knowing a value we will NOT see does not help a dynamic mask.
            if !(inverted && !olevel.is_dynamic())
                && self.node_mut(node).level.prune_with(olevel)
            {
                *changed = true;
                if !self.node(node).level.is_useful() {
                    trace!("dynamic level no longer useful, collapsing to default");
                    debug_assert_eq!(self.node(node).num(), 0);
                    ptr = match self.node_mut(node).default.take() {
                        Some(EdgeTarget::Node(def)) => {
                            self.node_mut(def).parent = None;
                            self.free(node);
                            self.prune(def, olevel, data, inverted, changed)?
                        }
                        other => {
                            self.free(node);
                            other
                        }
                    };
                }
            }
        } else if olevel.is_dynamic() {
            bail!("static classification below a dynamic level is not supported");
        } else if inverted {
            if olevel.equals(&self.node(node).level) {
                // The decided value is elsewhere: this child is dead.
                if let Some(edge) = self.node_mut(node).remove(data) {
                    self.free_subtree(edge.target);
                    *changed = true;
                }
            }
        } else if olevel.equals(&self.node(node).level) {
            // The value is already decided: replace this node by the taken
            // branch.
            *changed = true;
            let taken = self
                .node(node)
                .find(data)
                .map(|e| e.target)
                .or(self.node(node).default);
            for edge in self.node(node).edges() {
                if Some(edge.target) != taken {
                    self.free_subtree(edge.target);
                }
                self.node_mut(node).remove(edge.data);
            }
            if let Some(def) = self.node(node).default {
                if Some(def) != taken {
                    self.free_subtree(def);
                }
            }
            self.node_mut(node).default = None;
            self.free(node);
            ptr = match taken {
                Some(EdgeTarget::Node(next)) => {
                    self.node_mut(next).parent = None;
                    self.prune(next, olevel, data, inverted, changed)?
                }
                other => other,
            };
        }

        let Some(EdgeTarget::Node(cur)) = ptr else {
            return Ok(ptr);
        };

        // Prune all children, the default included.
        for edge in self.node(cur).edges() {
            let EdgeTarget::Node(child) = edge.target else {
                continue;
            };
            let newcur = self.prune(child, olevel, data, inverted, changed)?;
            if newcur != Some(edge.target) {
                *changed = true;
                match newcur {
                    Some(target) => {
                        self.set_edge(cur, super::SlotRef::Keyed(edge.data), target);
                    }
                    None => {
                        self.node_mut(cur).remove(edge.data);
                    }
                }
            }
        }
        if let Some(EdgeTarget::Node(def)) = self.node(cur).default {
            let newdef = self.prune(def, olevel, data, inverted, changed)?;
            if newdef != Some(EdgeTarget::Node(def)) {
                *changed = true;
                self.node_mut(cur).default = newdef;
                if let Some(target) = newdef {
                    self.set_parent_of(target, Some(cur), None);
                }
            }
        }

        // An inverted prune may empty a static node entirely.
        if inverted && self.node(cur).num() == 0 && !self.node(cur).level.is_dynamic() {
            let def = self.node_mut(cur).default.take();
            if let Some(target) = def {
                self.set_parent_of(target, None, None);
            }
            self.free(cur);
            *changed = true;
            return Ok(def);
        }
        Ok(Some(EdgeTarget::Node(cur)))
    }
}
