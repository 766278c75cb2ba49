//! Rule dispatchers: per-element rule lists merged into one table.
//!
//! A dispatcher owns the classification rules of one element. It numbers
//! their outputs (a rule without an explicit output takes the previous
//! output plus one), appends the implicit `- drop` rule when the list has
//! no default, writes each rule's output label into its leaves, and folds
//! the single-path trees into one table with the else-combine. Downstream
//! elements hang their own tables below specific outputs; attaching prunes
//! the child table by everything the parent path already decided.

use crate::fcb::FcbId;
use crate::node::{EdgeTarget, NodeId};
use crate::parser::{self, OUTPUT_UNSET, ParseContext, Rule};
use crate::tree::Tree;
use anyhow::{Context, Result, bail};
use log::{debug, warn};

/// Payload bytes each dispatcher reserves for its output label.
pub const OUTPUT_RESERVE: usize = 4;

/// One element's rule list plus its downstream elements per output.
#[derive(Debug)]
pub struct Dispatcher {
    name: String,
    lines: Vec<String>,
    noutputs: usize,
    children: Vec<Option<Dispatcher>>,
    /// Offset of this element's output label inside the FCB payload,
    /// assigned by the context manager before tables are built.
    pub data_offset: usize,
}

impl Dispatcher {
    /// A dispatcher for an element called `name` with one rule per line.
    #[must_use]
    pub fn new(name: &str, noutputs: usize, lines: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            lines: lines.iter().map(|s| (*s).to_string()).collect(),
            noutputs,
            children: (0..noutputs).map(|_| None).collect(),
            data_offset: 0,
        }
    }

    /// Element name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of outputs.
    #[must_use]
    pub fn noutputs(&self) -> usize {
        self.noutputs
    }

    /// Hang `child` below `output`.
    ///
    /// # Panics
    ///
    /// Panics when `output` is out of range.
    pub fn set_child(&mut self, output: usize, child: Dispatcher) {
        assert!(output < self.noutputs, "output {output} out of range");
        self.children[output] = Some(child);
    }

    /// Walk the dispatcher graph assigning each element its payload
    /// offset; returns the total reservation. The context manager calls
    /// this before building tables; call it yourself when driving
    /// [`Dispatcher::table`] directly.
    pub fn assign_offsets(&mut self, base: usize) -> usize {
        self.data_offset = base;
        let mut next = base + OUTPUT_RESERVE;
        for child in self.children.iter_mut().flatten() {
            next = child.assign_offsets(next);
        }
        next
    }

    /// Parse this element's rules, resolving implicit outputs and
    /// appending the implicit drop rule.
    fn parse_rules(&self, tree: &mut Tree, ctx: ParseContext) -> Result<Vec<Rule>> {
        let mut rules = Vec::with_capacity(self.lines.len() + 1);
        let mut default_output: i32 = -1;
        for (i, line) in self.lines.iter().enumerate() {
            let mut rule = parser::parse(tree, &self.name, line, ctx)
                .with_context(|| format!("{}: rule {}", self.name, i + 1))?;
            if rule.output == OUTPUT_UNSET {
                default_output += 1;
                rule.output = default_output;
                if rule.output >= self.noutputs as i32 {
                    rule.output = if rule.is_default {
                        -1
                    } else {
                        self.noutputs as i32 - 1
                    };
                }
            } else if rule.output < 0 {
                rule.output = -1;
            } else {
                default_output = default_output.max(rule.output);
            }
            debug!("{}: rule {}/{} to output {}", self.name, i + 1, self.lines.len(), rule.output);
            rules.push(rule);
        }

        if rules.is_empty() {
            if self.noutputs == 1 {
                rules.push(parser::parse(tree, &self.name, "- 0", ctx)?);
            } else {
                bail!(
                    "{}: no rules and more than one output; cannot infer a rule set",
                    self.name
                );
            }
        } else if !rules.last().expect("nonempty").is_default {
            let all_dynamic = rules.iter().all(|r| {
                let node = tree.node(r.root);
                node.level.is_dynamic() || node.is_dummy()
            });
            if !all_dynamic {
                warn!(
                    "{} has no default rule; non-matching traffic will be dropped. \
                     Add a last rule '-' to avoid this message.",
                    self.name
                );
            }
            let mut drop = parser::make_drop_rule(tree, &self.name);
            if default_output < self.noutputs as i32 - 1 {
                // The last output is a reject port.
                drop.output = self.noutputs as i32 - 1;
            }
            rules.push(drop);
        }
        Ok(rules)
    }

    /// Write `output` into every leaf of `root` at this element's payload
    /// offset, flagging drop outputs.
    fn write_outputs(&self, tree: &mut Tree, root: NodeId, output: i32) {
        for edge in tree.leaf_edges(root, true, true) {
            let Some(EdgeTarget::Leaf(leaf)) = tree.edge_target(edge) else {
                continue;
            };
            self.set_leaf_output(tree, leaf, output);
        }
    }

    fn set_leaf_output(&self, tree: &mut Tree, leaf: FcbId, output: i32) {
        let fcb = tree.pool.get_mut(leaf);
        fcb.write_data(self.data_offset, &output.to_le_bytes());
        if output < 0 || output >= self.noutputs as i32 {
            fcb.set_early_drop(true);
        }
    }

    /// Read the output label of a leaf, if assigned. Build-phase leaves
    /// consult the shadow mask; runtime leaves read the payload directly.
    #[must_use]
    pub fn leaf_output(&self, tree: &Tree, leaf: FcbId) -> Option<i32> {
        let fcb = tree.pool.get(leaf);
        if fcb.is_build() && fcb.mask().get(self.data_offset).copied() != Some(0xFF) {
            return None;
        }
        let bytes = fcb.data()[self.data_offset..self.data_offset + OUTPUT_RESERVE]
            .try_into()
            .ok()?;
        Some(i32::from_le_bytes(bytes))
    }

    /// Build this element's table: merged rules with every child element's
    /// table attached below its output.
    ///
    /// # Errors
    ///
    /// Fails on parse errors, payload conflicts and unsupported merges.
    pub fn table(&self, tree: &mut Tree, ctx: ParseContext) -> Result<NodeId> {
        let rules = self.parse_rules(tree, ctx)?;
        debug!("{}: computing table with {} rules", self.name, rules.len());

        let mut samples: Vec<(Vec<(usize, usize, u64, u64)>, i32)> = Vec::new();
        let mut merged: Option<NodeId> = None;
        let mut prev_output = None;
        for rule in &rules {
            self.write_outputs(tree, rule.root, rule.output);
            if cfg!(debug_assertions) {
                if let Some(constraints) = rule_constraints(tree, rule.root) {
                    if !rule.is_default {
                        samples.push((constraints, rule.output));
                    }
                }
            }
            merged = Some(match merged {
                None => rule.root,
                Some(m) => {
                    let priority = prev_output.is_some_and(|p: i32| p != rule.output);
                    tree.combine(m, rule.root, false, priority, true)?
                }
            });
            prev_output = Some(rule.output);
            tree.check(merged.expect("just set"));
        }
        let mut merged = merged.expect("at least the implicit rule");

        // Attach child element tables below their outputs.
        for (output, child) in self.children.iter().enumerate() {
            let Some(child) = child else { continue };
            let child_root = child.table(tree, ctx)?;
            merged = self.attach_child(tree, merged, output as i32, child_root)?;
        }

        if cfg!(debug_assertions) {
            verify_outputs(self, tree, merged, &samples);
        }
        Ok(merged)
    }

    /// Replace every leaf of `merged` labelled `output` with a pruned copy
    /// of the child table, then restamp the parent's output label on the
    /// substituted leaves.
    fn attach_child(
        &self,
        tree: &mut Tree,
        merged: NodeId,
        output: i32,
        child_root: NodeId,
    ) -> Result<NodeId> {
        for edge in tree.leaf_edges(merged, true, false) {
            let Some(EdgeTarget::Leaf(leaf)) = tree.edge_target(edge) else {
                continue;
            };
            if self.leaf_output(tree, leaf) != Some(output) {
                continue;
            }
            tree.replace_leaf_with_node(edge, child_root, true)?;
            match tree.edge_target(edge) {
                Some(EdgeTarget::Node(subtree)) => {
                    self.write_outputs(tree, subtree, output);
                }
                Some(EdgeTarget::Leaf(new_leaf)) => {
                    self.set_leaf_output(tree, new_leaf, output);
                }
                None => {}
            }
        }
        tree.free_subtree(EdgeTarget::Node(child_root));
        Ok(merged)
    }
}

/// Collect `(offset, width, value, mask)` constraints of a fully static
/// single-path rule; `None` when the rule has dynamic or non-generic
/// levels.
fn rule_constraints(tree: &Tree, root: NodeId) -> Option<Vec<(usize, usize, u64, u64)>> {
    let mut out = Vec::new();
    let mut cur = root;
    loop {
        let node = tree.node(cur);
        if node.is_dummy() {
            return Some(out);
        }
        let crate::level::FlowLevel::Generic(g) = &node.level else {
            return None;
        };
        if node.level.is_dynamic() {
            return None;
        }
        let edge = *node.edges().first()?;
        out.push((g.offset, g.width.bytes(), edge.data, g.mask));
        match edge.target {
            EdgeTarget::Node(next) => cur = next,
            EdgeTarget::Leaf(_) => return Some(out),
        }
    }
}

/// Debug check: every static rule still reaches its declared output after
/// the merge. Samples shadowed by an earlier rule are skipped.
fn verify_outputs(
    disp: &Dispatcher,
    tree: &mut Tree,
    root: NodeId,
    samples: &[(Vec<(usize, usize, u64, u64)>, i32)],
) {
    // Dynamic nodes learn children from classification; probing them here
    // would plant build-phase state. Verify fully static tables only.
    if tree
        .all_nodes(root)
        .iter()
        .any(|&id| tree.node(id).level.is_dynamic())
    {
        return;
    }
    for (i, (constraints, output)) in samples.iter().enumerate() {
        let len = constraints
            .iter()
            .map(|(off, width, _, _)| off + width)
            .max()
            .unwrap_or(0);
        let mut bytes = vec![0u8; len];
        for (off, width, value, _) in constraints {
            for k in 0..*width {
                bytes[off + k] |= (value >> ((width - 1 - k) * 8)) as u8;
            }
        }
        let shadowed = samples[..i].iter().any(|(earlier, _)| {
            earlier.iter().all(|(off, width, value, mask)| {
                crate::utils::read_be(&bytes, *off, *width) & mask == *value
            })
        });
        if shadowed {
            continue;
        }
        let p = crate::packet::Packet::new(bytes);
        let Some(fcb) = tree.match_packet(root, &p, 0) else {
            panic!("{}: rule sample no longer classifies", disp.name());
        };
        let found = disp.leaf_output(tree, fcb);
        assert_eq!(
            found,
            Some(*output),
            "{}: rule sample reaches output {found:?}, declared {output}",
            disp.name()
        );
    }
}
