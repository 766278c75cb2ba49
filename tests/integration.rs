//! End-to-end flows: nested dispatchers, dynamic state, cache, release
//! and metrics working together.

use flowctx::manager::{ContextConfig, ContextManager};
use flowctx::packet::PacketBatch;
use flowctx::testing::*;
use flowctx::{Dispatcher, ThreadSet, Timestamp};

#[test]
fn nested_dispatchers_classify_through_child_tables() -> anyhow::Result<()> {
    // A parent EtherType classifier with a protocol classifier below its
    // IPv4 output.
    let mut parent = Dispatcher::new("ether", 2, &["12/0800 0", "- 1"]);
    parent.set_child(0, Dispatcher::new("proto", 3, &["23/06 0", "23/11 1", "- 2"]));
    let reserved = parent.assign_offsets(0);

    let mut tree = flowctx::Tree::new(reserved);
    let root = parent.table(&mut tree, flowctx::ParseContext::Ether)?;

    let tcp = PacketBuilder::new()
        .ethernet(0x0800)
        .ipv4(6, "10.0.0.1", "10.0.0.2")
        .build();
    let udp = PacketBuilder::new()
        .ethernet(0x0800)
        .ipv4(17, "10.0.0.1", "10.0.0.2")
        .build();
    let arp = PacketBuilder::new().ethernet(0x0806).build();

    let tcp_fcb = tree.match_packet(root, &tcp, 0).unwrap();
    let udp_fcb = tree.match_packet(root, &udp, 0).unwrap();
    let arp_fcb = tree.match_packet(root, &arp, 0).unwrap();

    // The parent element sees its own outputs...
    assert_eq!(parent.leaf_output(&tree, tcp_fcb), Some(0));
    assert_eq!(parent.leaf_output(&tree, udp_fcb), Some(0));
    assert_eq!(parent.leaf_output(&tree, arp_fcb), Some(1));
    // ...and the child labels live in the child's payload slice.
    assert_ne!(tcp_fcb, udp_fcb);
    Ok(())
}

#[test]
fn dynamic_flows_live_through_cache_release_and_reuse() -> anyhow::Result<()> {
    let config = ContextConfig {
        aggcache: true,
        cache_size: 256,
        cache_ring_size: 4,
        builder: true,
        ..ContextConfig::default()
    };
    let mut mgr = ContextManager::new(
        Dispatcher::new("flows", 2, &["12/0800 && 36/0/FFFF 0", "- 1"]),
        config,
    )?;
    mgr.initialize(&ThreadSet::single(0, 1), Timestamp::from_msec(0))?;

    // First round: four flows learned, cached by aggregate.
    let mut flows = Vec::new();
    for (i, dport) in [443u16, 8080, 53, 22].iter().enumerate() {
        let p = PacketBuilder::new()
            .ethernet(0x0800)
            .ipv4(6, "10.0.0.1", "10.0.0.2")
            .ports(4000, *dport)
            .aggregate(0x1000 + u32::from(*dport))
            .tag(i as u8)
            .build();
        let out = mgr.process(PacketBatch::start_head(p), 0, Timestamp::from_msec(1));
        assert_eq!(out.len(), 1);
        flows.push(out[0].fcb);
    }
    assert_eq!(mgr.counters().cache_miss, 4);

    // Second round hits the cache for every flow.
    for (i, dport) in [443u16, 8080, 53, 22].iter().enumerate() {
        let p = PacketBuilder::new()
            .ethernet(0x0800)
            .ipv4(6, "10.0.0.1", "10.0.0.2")
            .ports(4000, *dport)
            .aggregate(0x1000 + u32::from(*dport))
            .tag(i as u8)
            .build();
        let out = mgr.process(PacketBatch::start_head(p), 0, Timestamp::from_msec(2));
        assert_eq!(out[0].fcb, flows[i]);
    }
    assert_eq!(mgr.counters().cache_hit, 4);

    // Release every flow (two dispatch references each by now).
    let before = mgr.leaves_count();
    for fcb in &flows {
        mgr.release_fcb(*fcb, 2, 0);
    }
    assert_eq!(mgr.leaves_count(), before - 4);

    // Released flow ids can be learned again from scratch.
    let p = PacketBuilder::new()
        .ethernet(0x0800)
        .ipv4(6, "10.0.0.1", "10.0.0.2")
        .ports(4000, 443)
        .aggregate(0x1000 + 443)
        .tag(9)
        .build();
    let out = mgr.process(PacketBatch::start_head(p), 0, Timestamp::from_msec(3));
    assert_eq!(out.len(), 1);
    Ok(())
}

#[test]
fn per_thread_fanout_keeps_cpu_state_disjoint() -> anyhow::Result<()> {
    let config = ContextConfig {
        builder: false,
        ..ContextConfig::default()
    };
    let mut mgr = ContextManager::new(
        Dispatcher::new("flows", 2, &["12/0800 && 36/0/FFFF 0", "- 1"]),
        config,
    )?;
    mgr.initialize(&ThreadSet::all(2), Timestamp::from_msec(0))?;

    let packet = |tag: u8| {
        PacketBuilder::new()
            .ethernet(0x0800)
            .ipv4(6, "10.0.0.1", "10.0.0.2")
            .ports(4000, 443)
            .tag(tag)
            .build()
    };
    let out0 = mgr.process(PacketBatch::start_head(packet(0)), 0, Timestamp::from_msec(1));
    let out1 = mgr.process(PacketBatch::start_head(packet(1)), 1, Timestamp::from_msec(1));
    assert_ne!(
        out0[0].fcb, out1[0].fcb,
        "the same flow on different CPUs owns distinct state"
    );
    Ok(())
}

#[cfg(feature = "metrics")]
#[test]
fn counters_export_through_the_metrics_collector() -> anyhow::Result<()> {
    use flowctx::metrics::MetricsCollector;

    let mut mgr = ContextManager::new(
        Dispatcher::new("cls", 1, &["12/0800 0", "- drop"]),
        ContextConfig {
            builder: false,
            ..ContextConfig::default()
        },
    )?;
    mgr.initialize(&ThreadSet::single(0, 1), Timestamp::from_msec(0))?;
    let batch = BatchBuilder::new()
        .add(PacketBuilder::new().ethernet(0x0800).tag(0).build())
        .add(PacketBuilder::new().ethernet(0x1111).tag(1).build())
        .build();
    mgr.process(batch, 0, Timestamp::from_msec(1));

    let mut collector = MetricsCollector::new();
    mgr.counters().register_into(&mut collector);
    assert_eq!(collector.counter("early_dropped"), Some(1));
    Ok(())
}
