use flowctx::level::FlowLevel;
use flowctx::node::EdgeTarget;
use flowctx::parser::{self, OUTPUT_UNSET, ParseContext};
use flowctx::tree::Tree;

fn tree() -> Tree {
    Tree::new(8)
}

#[test]
fn ethertype_rule_builds_one_keyed_path() -> anyhow::Result<()> {
    let mut t = tree();
    let rule = parser::parse(&mut t, "classifier", "12/0800 0", ParseContext::Ether)?;
    assert_eq!(rule.output, 0);
    assert!(!rule.is_default);

    let root = t.node(rule.root);
    assert!(root.level.equals(&FlowLevel::generic(12, 0xFFFF)));
    assert_eq!(root.num(), 1);
    let edge = root.find(0x0800).expect("keyed child at 0x0800");
    assert_eq!(edge.target, EdgeTarget::Leaf(rule.leaf));
    assert!(root.default.is_none());
    Ok(())
}

#[test]
fn chained_classes_form_a_linear_path() -> anyhow::Result<()> {
    let mut t = tree();
    let rule = parser::parse(
        &mut t,
        "http",
        "12/0800 && 23/06 src port 80 0",
        ParseContext::Ether,
    )?;

    let n12 = t.node(rule.root);
    assert!(n12.level.equals(&FlowLevel::generic(12, 0xFFFF)));
    let EdgeTarget::Node(n23_id) = n12.find(0x0800).unwrap().target else {
        panic!("expected an inner node below the EtherType");
    };
    let n23 = t.node(n23_id);
    assert!(n23.level.equals(&FlowLevel::generic(23, 0xFF)));
    let EdgeTarget::Node(n34_id) = n23.find(6).unwrap().target else {
        panic!("expected an inner node below the protocol");
    };
    let n34 = t.node(n34_id);
    // src port sits 20 bytes into the IP header, itself 14 bytes in.
    assert!(n34.level.equals(&FlowLevel::generic(34, 0xFFFF)));
    assert_eq!(n34.find(80).unwrap().target, EdgeTarget::Leaf(rule.leaf));
    Ok(())
}

#[test]
fn named_classes_resolve_offsets_and_values() -> anyhow::Result<()> {
    let mut t = tree();
    let rule = parser::parse(
        &mut t,
        "router",
        "ip proto udp && dst host 10.1.2.3 4",
        ParseContext::Ether,
    )?;
    let proto = t.node(rule.root);
    assert!(proto.level.equals(&FlowLevel::generic(23, 0xFF)));
    let EdgeTarget::Node(host_id) = proto.find(17).unwrap().target else {
        panic!("expected host node below proto");
    };
    let host = t.node(host_id);
    assert!(host.level.equals(&FlowLevel::generic(30, 0xFFFF_FFFF)));
    assert!(host.find(0x0A01_0203).is_some());
    assert_eq!(rule.output, 4);
    Ok(())
}

#[test]
fn net_class_masks_the_prefix() -> anyhow::Result<()> {
    let mut t = tree();
    let rule = parser::parse(&mut t, "router", "src net 10.0.0.0/8 1", ParseContext::None)?;
    let node = t.node(rule.root);
    assert!(node.level.equals(&FlowLevel::generic(12, 0xFF00_0000)));
    assert!(node.find(0x0A00_0000).is_some());
    Ok(())
}

#[test]
fn mask_only_class_is_dynamic() -> anyhow::Result<()> {
    let mut t = tree();
    let rule = parser::parse(&mut t, "flows", "40/0/FFFF 0", ParseContext::Ether)?;
    let node = t.node(rule.root);
    assert!(node.level.is_dynamic());
    assert_eq!(node.num(), 0);
    // The leaf hangs off the default edge as the per-key prototype.
    assert_eq!(node.default, Some(EdgeTarget::Leaf(rule.leaf)));
    Ok(())
}

#[test]
fn agg_and_thread_classes_are_dynamic() -> anyhow::Result<()> {
    let mut t = tree();
    let agg = parser::parse(&mut t, "flows", "agg 0", ParseContext::Ether)?;
    assert!(matches!(t.node(agg.root).level, FlowLevel::Aggregate));
    assert!(t.node(agg.root).level.is_dynamic());

    let thread = parser::parse(&mut t, "flows", "thread 0", ParseContext::Ether)?;
    assert!(matches!(
        t.node(thread.root).level,
        FlowLevel::Thread { .. }
    ));
    Ok(())
}

#[test]
fn default_rule_drop_and_keep() -> anyhow::Result<()> {
    let mut t = tree();
    let default = parser::parse(&mut t, "classifier", "-", ParseContext::Ether)?;
    assert!(default.is_default);
    assert_eq!(default.output, OUTPUT_UNSET);

    let dropped = parser::parse(&mut t, "classifier", "12/0806 drop", ParseContext::Ether)?;
    assert_eq!(dropped.output, -1);

    let kept = parser::parse(&mut t, "classifier", "12/0800 keep 1", ParseContext::Ether)?;
    assert!(kept.keep);
    assert!(t.pool.get(kept.leaf).keep);
    Ok(())
}

#[test]
fn container_hints_are_recorded() -> anyhow::Result<()> {
    let mut t = tree();
    let rule = parser::parse(&mut t, "flows", "40/0/FFFF:HASH-4 0", ParseContext::Ether)?;
    assert_eq!(
        t.node(rule.root).hint,
        Some(flowctx::node::ContainerHint::Hash(4))
    );
    let rule = parser::parse(&mut t, "flows", "41/0/FF:ARRAY 0", ParseContext::Ether)?;
    assert_eq!(
        t.node(rule.root).hint,
        Some(flowctx::node::ContainerHint::Array)
    );
    Ok(())
}

#[test]
fn else_drop_marker_is_recorded() -> anyhow::Result<()> {
    let mut t = tree();
    let rule = parser::parse(&mut t, "ctx", "12/0800! 0", ParseContext::Ether)?;
    assert!(t.node(rule.root).else_drop);
    Ok(())
}

#[test]
fn malformed_rules_fail() {
    let mut t = tree();
    for bad in ["12//", "nonsense", "ip proto bogus 0", "src host 999.1.1.1 0"] {
        assert!(
            parser::parse(&mut t, "x", bad, ParseContext::Ether).is_err(),
            "{bad:?} should not parse"
        );
    }
}

#[test]
fn printed_path_reparses_to_the_same_tree() -> anyhow::Result<()> {
    let mut t = tree();
    let rule = parser::parse(&mut t, "rt", "12/800/ffff && 23/6/ff 0", ParseContext::Ether)?;
    let printed = parser::unparse(&t, rule.root);
    let reparsed = parser::parse(&mut t, "rt", &format!("{printed} 0"), ParseContext::Ether)?;

    // Same levels and same keyed values, node by node.
    let (mut a, mut b) = (Some(rule.root), Some(reparsed.root));
    while let (Some(na), Some(nb)) = (a, b) {
        let (na, nb) = (t.node(na), t.node(nb));
        assert!(na.level.equals(&nb.level), "levels diverge");
        let (ea, eb) = (na.edges(), nb.edges());
        assert_eq!(
            ea.iter().map(|e| e.data).collect::<Vec<_>>(),
            eb.iter().map(|e| e.data).collect::<Vec<_>>()
        );
        a = ea.first().and_then(|e| e.target.as_node());
        b = eb.first().and_then(|e| e.target.as_node());
    }
    assert_eq!(a, b, "paths have different lengths");
    Ok(())
}
