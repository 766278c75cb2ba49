use flowctx::dispatcher::Dispatcher;
use flowctx::level::FlowLevel;
use flowctx::node::EdgeTarget;
use flowctx::packet::Packet;
use flowctx::parser::{self, ParseContext};
use flowctx::testing::PacketBuilder;
use flowctx::tree::Tree;

/// Classify a packet and return the output label it reaches.
fn classify_output(disp: &Dispatcher, tree: &mut Tree, root: flowctx::NodeId, p: &Packet) -> i32 {
    let fcb = tree.match_packet(root, p, 0).expect("classifies");
    disp.leaf_output(tree, fcb).expect("output assigned")
}

fn ether_packet(ethertype: u16) -> Packet {
    PacketBuilder::new().ethernet(ethertype).build()
}

#[test]
fn disjoint_rules_commute_on_packet_outcomes() -> anyhow::Result<()> {
    // Two rules that never match the same packet classify identically
    // regardless of merge order.
    let forward = Dispatcher::new("fwd", 8, &["12/0800 5", "12/0806 7", "- drop"]);
    let reverse = Dispatcher::new("rev", 8, &["12/0806 7", "12/0800 5", "- drop"]);

    let mut t1 = Tree::new(8);
    let mut t2 = Tree::new(8);
    let r1 = forward.table(&mut t1, ParseContext::Ether)?;
    let r2 = reverse.table(&mut t2, ParseContext::Ether)?;

    for ethertype in [0x0800u16, 0x0806, 0x86DD] {
        let p = ether_packet(ethertype);
        let a = t1
            .match_packet(r1, &p, 0)
            .map(|f| forward.leaf_output(&t1, f));
        let b = t2
            .match_packet(r2, &p, 0)
            .map(|f| reverse.leaf_output(&t2, f));
        assert_eq!(a, b, "outcomes diverge for EtherType {ethertype:#x}");
    }
    Ok(())
}

#[test]
fn prune_preserves_classification_along_the_decided_level() -> anyhow::Result<()> {
    let disp = Dispatcher::new(
        "proto",
        3,
        &["12/0800 && 23/06 0", "12/0800 && 23/11 1", "- 2"],
    );
    let mut tree = Tree::new(8);
    let root = disp.table(&mut tree, ParseContext::Ether)?;

    let tcp = PacketBuilder::new()
        .ethernet(0x0800)
        .ipv4(6, "10.0.0.1", "10.0.0.2")
        .build();
    let udp = PacketBuilder::new()
        .ethernet(0x0800)
        .ipv4(17, "10.0.0.1", "10.0.0.2")
        .build();

    let tcp_before = tree.match_packet(root, &tcp, 0).unwrap();
    let udp_before = tree.match_packet(root, &udp, 0).unwrap();

    // Knowing the EtherType is 0x0800 must not change where packets that
    // satisfy that knowledge classify.
    let mut changed = false;
    let pruned = tree
        .prune(root, &FlowLevel::generic(12, 0xFFFF), 0x0800, false, &mut changed)?
        .expect("tree survives the prune");
    assert!(changed);
    let EdgeTarget::Node(pruned_root) = pruned else {
        panic!("pruned tree should still classify on the protocol");
    };

    assert_eq!(tree.match_packet(pruned_root, &tcp, 0), Some(tcp_before));
    assert_eq!(tree.match_packet(pruned_root, &udp, 0), Some(udp_before));
    Ok(())
}

#[test]
fn payload_conflict_aborts_naming_both_elements() -> anyhow::Result<()> {
    // Two elements assign the same payload byte differently on paths that
    // accept the same packets.
    let mut tree = Tree::new(8);
    let r1 = parser::parse(&mut tree, "tcp_state", "12/0800 0", ParseContext::Ether)?;
    tree.pool.get_mut(r1.leaf).write_data(4, &[0x01]);
    let r2 = parser::parse(&mut tree, "nat", "12/0800 0", ParseContext::Ether)?;
    tree.pool.get_mut(r2.leaf).write_data(4, &[0x02]);

    let err = tree
        .combine(r1.root, r2.root, false, true, true)
        .expect_err("conflicting payloads must abort the merge");
    let msg = err.to_string();
    assert!(msg.contains("tcp_state"), "missing first element: {msg}");
    assert!(msg.contains("nat"), "missing second element: {msg}");
    Ok(())
}

#[test]
fn overlapping_rules_merge_compatible_payloads() -> anyhow::Result<()> {
    // Same path, disjoint payload bytes: the merge keeps both.
    let mut tree = Tree::new(8);
    let r1 = parser::parse(&mut tree, "a", "12/0800 0", ParseContext::Ether)?;
    tree.pool.get_mut(r1.leaf).write_data(0, &[0xAA]);
    let r2 = parser::parse(&mut tree, "b", "12/0800 0", ParseContext::Ether)?;
    tree.pool.get_mut(r2.leaf).write_data(5, &[0xBB]);

    let root = tree.combine(r1.root, r2.root, false, true, true)?;
    let p = ether_packet(0x0800);
    let fcb = tree.match_packet(root, &p, 0).unwrap();
    assert_eq!(tree.pool.get(fcb).data()[0], 0xAA);
    assert_eq!(tree.pool.get(fcb).data()[5], 0xBB);
    Ok(())
}

#[test]
fn dynamic_parent_refuses_static_child_with_priority() -> anyhow::Result<()> {
    let mut tree = Tree::new(8);
    let dynamic = parser::parse(&mut tree, "flows", "40/0/FFFF 0", ParseContext::Ether)?;
    let static_rule = parser::parse(&mut tree, "cls", "12/0800 0", ParseContext::Ether)?;
    let err = tree
        .combine(dynamic.root, static_rule.root, false, true, true)
        .expect_err("a dynamic parent cannot own a static child");
    assert!(err.to_string().contains("dynamic"), "{err}");
    Ok(())
}

#[test]
fn dynamic_parent_swaps_below_static_child_without_priority() -> anyhow::Result<()> {
    let mut tree = Tree::new(8);
    let dynamic = parser::parse(&mut tree, "flows", "40/0/FFFF 0", ParseContext::Ether)?;
    let static_rule = parser::parse(&mut tree, "cls", "12/0800 0", ParseContext::Ether)?;
    let root = tree.combine(dynamic.root, static_rule.root, false, false, true)?;
    // The static level ends up on top.
    assert!(!tree.node(root).level.is_dynamic());
    Ok(())
}

#[test]
fn different_level_else_combine_reaches_both_rules() -> anyhow::Result<()> {
    // "23/06 goes to 0, otherwise 34/0050 goes to 1, otherwise 2."
    let disp = Dispatcher::new("mix", 3, &["23/06 0", "34/0050 1", "- 2"]);
    let mut tree = Tree::new(8);
    let root = disp.table(&mut tree, ParseContext::Ether)?;

    let tcp = PacketBuilder::new()
        .ethernet(0x0800)
        .ipv4(6, "10.0.0.1", "10.0.0.2")
        .ports(80, 1234)
        .build();
    // Not TCP, but source port 80.
    let other = PacketBuilder::new()
        .ethernet(0x0800)
        .ipv4(17, "10.0.0.1", "10.0.0.2")
        .ports(80, 1234)
        .build();
    let neither = PacketBuilder::new()
        .ethernet(0x0800)
        .ipv4(17, "10.0.0.1", "10.0.0.2")
        .ports(9999, 1234)
        .build();

    assert_eq!(classify_output(&disp, &mut tree, root, &tcp), 0);
    assert_eq!(classify_output(&disp, &mut tree, root, &other), 1);
    assert_eq!(classify_output(&disp, &mut tree, root, &neither), 2);
    Ok(())
}

#[test]
fn tree_invariants_hold_after_merging() -> anyhow::Result<()> {
    let disp = Dispatcher::new(
        "inv",
        4,
        &[
            "12/0800 && 23/06 0",
            "12/0800 && 23/11 1",
            "12/0806 2",
            "- 3",
        ],
    );
    let mut tree = Tree::new(8);
    let root = disp.table(&mut tree, ParseContext::Ether)?;
    // check() panics on any violated structural invariant.
    tree.check(root);
    for id in tree.all_nodes(root) {
        let node = tree.node(id);
        assert_eq!(node.num(), node.find_num());
    }
    Ok(())
}
