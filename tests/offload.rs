#![cfg(feature = "offload")]

use flowctx::dispatcher::Dispatcher;
use flowctx::offload::{self, PatternLayer};
use flowctx::parser::ParseContext;
use flowctx::testing::PacketBuilder;
use flowctx::tree::Tree;
use flowctx::utils::ThreadSet;

#[test]
fn static_prefix_becomes_a_pattern_ending_at_the_dynamic_node() -> anyhow::Result<()> {
    let disp = Dispatcher::new(
        "nat",
        2,
        &["12/0800 && 23/06 && 36/0/FFFF 0", "- 1"],
    );
    let mut tree = Tree::new(8);
    let root = disp.table(&mut tree, ParseContext::Ether)?;
    let root = tree.optimize(root, &ThreadSet::single(0, 1));
    tree.finalize_leaves(root);

    let plan = offload::build_plan(&tree, root, 14);
    assert_eq!(plan.rules.len(), 1);
    assert_eq!(plan.mark_count(), 1);

    let rule = &plan.rules[0];
    assert_eq!(rule.items.len(), 2);
    assert_eq!(rule.items[0].offset, 12);
    assert_eq!(rule.items[0].value, 0x0800);
    assert_eq!(rule.items[0].layer, PatternLayer::Ethernet);
    assert_eq!(rule.items[1].offset, 23);
    assert_eq!(rule.items[1].value, 6);
    assert_eq!(rule.items[1].layer, PatternLayer::Ipv4);

    // The mark's subtree is the dynamic node itself.
    let subtree = plan.subtree(rule.mark).expect("registered subtree");
    assert!(tree.node(subtree).level.is_dynamic());
    Ok(())
}

#[test]
fn mark_shortcut_classifies_like_the_full_walk() -> anyhow::Result<()> {
    let disp = Dispatcher::new(
        "nat",
        2,
        &["12/0800 && 36/0/FFFF 0", "- 1"],
    );
    let mut tree = Tree::new(8);
    let root = disp.table(&mut tree, ParseContext::Ether)?;
    let root = tree.optimize(root, &ThreadSet::single(0, 1));
    tree.finalize_leaves(root);
    let plan = offload::build_plan(&tree, root, 14);
    let mark = plan.rules[0].mark;
    let subtree = plan.subtree(mark).unwrap();

    let p = PacketBuilder::new()
        .ethernet(0x0800)
        .ipv4(6, "10.0.0.1", "10.0.0.2")
        .ports(4000, 443)
        .build();
    // Entering at the marked subtree finds the same flow as the full
    // walk from the root.
    let full = tree.match_packet(root, &p, 0).unwrap();
    let fast = tree.match_packet(subtree, &p, 0).unwrap();
    assert_eq!(full, fast);
    Ok(())
}

#[test]
fn fully_static_trees_emit_no_rules() -> anyhow::Result<()> {
    let disp = Dispatcher::new("cls", 3, &["12/0800 0", "12/0806 1", "- 2"]);
    let mut tree = Tree::new(8);
    let root = disp.table(&mut tree, ParseContext::Ether)?;
    let root = tree.optimize(root, &ThreadSet::single(0, 1));
    let plan = offload::build_plan(&tree, root, 14);
    assert!(plan.rules.is_empty());
    assert_eq!(plan.mark_count(), 0);
    Ok(())
}
