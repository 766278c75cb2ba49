use flowctx::manager::{ContextConfig, ContextManager};
use flowctx::testing::*;
use flowctx::{Dispatcher, ThreadSet, Timestamp};

fn manager(rules: &[&str], noutputs: usize, config: ContextConfig) -> ContextManager {
    let mut mgr = ContextManager::new(Dispatcher::new("ctx", noutputs, rules), config).unwrap();
    mgr.initialize(&ThreadSet::single(0, 1), Timestamp::from_msec(0))
        .unwrap();
    mgr
}

fn simple_config() -> ContextConfig {
    ContextConfig {
        builder: false,
        ..ContextConfig::default()
    }
}

#[test]
fn ethertype_scenario_classifies_in_order() {
    // Rules: IPv4 to 0, ARP to 1, else 2; one packet of each kind.
    let mut mgr = manager(&ether_classify_rules(), 3, simple_config());
    let batch = BatchBuilder::new()
        .add(PacketBuilder::new().ethernet(0x0800).tag(0).build())
        .add(PacketBuilder::new().ethernet(0x0806).tag(1).build())
        .add(PacketBuilder::new().ethernet(0x86DD).tag(2).build())
        .build();

    let out = mgr.process(batch, 0, Timestamp::from_msec(1));
    assert_flow_runs(&out, &[&[0], &[1], &[2]]);

    // Outputs 0, 1, 2 in that order; exactly three distinct FCBs.
    let outputs: Vec<i32> = out
        .iter()
        .map(|b| mgr.dispatcher().leaf_output(mgr.tree(), b.fcb).unwrap())
        .collect();
    assert_eq!(outputs, vec![0, 1, 2]);
    let distinct: std::collections::HashSet<_> = out.iter().map(|b| b.fcb).collect();
    assert_eq!(distinct.len(), 3);
}

#[test]
fn http_scenario_outputs_and_payload() {
    // Build the table directly so the build-phase shadow mask is visible.
    let disp = Dispatcher::new("http", 2, &http_or_else_rules());
    let mut tree = flowctx::Tree::new(8);
    let root = disp.table(&mut tree, flowctx::ParseContext::Ether).unwrap();

    let http = PacketBuilder::new()
        .ethernet(0x0800)
        .ipv4(6, "10.0.0.1", "10.0.0.2")
        .ports(80, 51000)
        .build();
    let udp = PacketBuilder::new()
        .ethernet(0x0800)
        .ipv4(17, "10.0.0.1", "10.0.0.2")
        .ports(53, 53)
        .build();

    let http_fcb = tree.match_packet(root, &http, 0).unwrap();
    let udp_fcb = tree.match_packet(root, &udp, 0).unwrap();
    assert_eq!(disp.leaf_output(&tree, http_fcb), Some(0));
    assert_eq!(disp.leaf_output(&tree, udp_fcb), Some(1));

    // The HTTP leaf carries output byte 0x00, assigned in the mask.
    let fcb = tree.pool.get(http_fcb);
    assert_eq!(fcb.data()[0], 0x00);
    assert_eq!(fcb.mask()[0], 0xFF);
}

#[test]
fn simple_mode_preserves_global_order() {
    let mut mgr = manager(&ether_classify_rules(), 3, simple_config());
    // Alternating flows force a cut at every boundary.
    let ethertypes = [0x0800u16, 0x0800, 0x0806, 0x0800, 0x0806, 0x0806];
    let batch = BatchBuilder::new().add_each(
        &ethertypes.iter().enumerate().collect::<Vec<_>>(),
        |(i, et)| PacketBuilder::new().ethernet(**et).tag(*i as u8).build(),
    );
    let out = mgr.process(batch.build(), 0, Timestamp::from_msec(1));

    assert_concatenation_in_order(&out, &[0, 1, 2, 3, 4, 5]);
    assert_flow_runs(&out, &[&[0, 1], &[2], &[3], &[4, 5]]);
}

#[test]
fn builder_mode_reassembles_flows() {
    // Flow pattern [A, B, A, A, C, B, A, D] over four TCP flows, with a
    // dynamic level learning one FCB per destination port.
    let mut mgr = manager(
        &["12/0800 && 23/06 && 36/0/FFFF 0", "- 1"],
        2,
        ContextConfig::default(),
    );
    let out = mgr.process(flow_mix_batch(), 0, Timestamp::from_msec(1));

    assert_flow_runs(&out, &[&[0, 2, 3, 6], &[1, 5], &[4], &[7]]);
    assert_permutation_of(&out, &[0, 1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn builder_ring_overflow_emits_oldest_early() {
    // A dynamic rule learns one FCB per EtherType, so 18 interleaved
    // flows exceed the 16-slot ring.
    let mut mgr = manager(&["12/0/FFFF 0", "- 1"], 2, ContextConfig::default());
    let many_flows: Vec<u16> = (0..20).collect();
    let batch = BatchBuilder::new().add_each(&many_flows, |i| {
        PacketBuilder::new()
            .ethernet(0x0800 + (i % 18))
            .tag(*i as u8)
            .build()
    });
    let out = mgr.process(batch.build(), 0, Timestamp::from_msec(1));
    assert!(mgr.counters().builder_forced_flush > 0);
    let total: usize = out.iter().map(|b| b.batch.count()).sum();
    assert_eq!(total, 20);
}

#[test]
fn early_drop_kills_packets_silently() {
    let mut mgr = manager(&["12/0800 0", "- drop"], 1, simple_config());
    let batch = BatchBuilder::new()
        .add(PacketBuilder::new().ethernet(0x0800).tag(0).build())
        .add(PacketBuilder::new().ethernet(0x1234).tag(1).build())
        .add(PacketBuilder::new().ethernet(0x0800).tag(2).build())
        .build();
    let out = mgr.process(batch, 0, Timestamp::from_msec(1));
    assert_eq!(out.len(), 1);
    assert_batch_tags(&out[0], &[0, 2]);
    assert_eq!(mgr.counters().early_dropped, 1);
}

#[test]
fn nocut_keeps_one_run_per_batch() {
    let config = ContextConfig {
        builder: false,
        nocut: true,
        ..ContextConfig::default()
    };
    let mut mgr = manager(&ether_classify_rules(), 3, config);
    let batch = BatchBuilder::new()
        .add(PacketBuilder::new().ethernet(0x0800).tag(0).build())
        .add(PacketBuilder::new().ethernet(0x0806).tag(1).build())
        .build();
    let out = mgr.process(batch, 0, Timestamp::from_msec(1));
    assert_eq!(out.len(), 1);
    assert_batch_tags(&out[0], &[0, 1]);
}

#[test]
fn emitted_batches_hold_references_when_release_is_on() {
    let mut mgr = manager(&ether_classify_rules(), 3, simple_config());
    let batch = BatchBuilder::new()
        .add(PacketBuilder::new().ethernet(0x0800).tag(0).build())
        .add(PacketBuilder::new().ethernet(0x0800).tag(1).build())
        .build();
    let out = mgr.process(batch, 0, Timestamp::from_msec(1));
    assert_eq!(out.len(), 1);
    // One initial reference plus two acquired by the dispatch.
    assert_eq!(mgr.tree().pool.get(out[0].fcb).count(), 3);
}
