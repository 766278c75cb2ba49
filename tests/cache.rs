use flowctx::manager::{ContextConfig, ContextManager};
use flowctx::packet::{Packet, PacketBatch};
use flowctx::testing::PacketBuilder;
use flowctx::{Dispatcher, ThreadSet, Timestamp};

fn cached_manager(aggtrust: bool) -> ContextManager {
    let config = ContextConfig {
        aggcache: true,
        cache_size: 64,
        cache_ring_size: 4,
        builder: false,
        aggtrust,
        ..ContextConfig::default()
    };
    let mut mgr = ContextManager::new(
        Dispatcher::new("ctx", 2, &["12/0800 && 36/0/FFFF 0", "- 1"]),
        config,
    )
    .unwrap();
    mgr.initialize(&ThreadSet::single(0, 1), Timestamp::from_msec(0))
        .unwrap();
    mgr
}

fn flow_packet(agg: u32, dport: u16) -> Packet {
    PacketBuilder::new()
        .ethernet(0x0800)
        .ipv4(6, "10.0.0.1", "10.0.0.2")
        .ports(4000, dport)
        .aggregate(agg)
        .build()
}

fn one(mgr: &mut ContextManager, p: Packet, at: u64) -> flowctx::FcbId {
    let out = mgr.process(PacketBatch::start_head(p), 0, Timestamp::from_msec(at));
    assert_eq!(out.len(), 1);
    out[0].fcb
}

#[test]
fn identical_aggregate_hits_the_cache_without_a_walk() {
    let mut mgr = cached_manager(false);
    // Separate batches so the in-batch shortcut does not mask the cache.
    let first = one(&mut mgr, flow_packet(0xDEAD_BEEF, 80), 1);
    assert_eq!(mgr.counters().cache_miss, 1);
    assert_eq!(mgr.counters().cache_hit, 0);

    let second = one(&mut mgr, flow_packet(0xDEAD_BEEF, 80), 2);
    assert_eq!(second, first, "cache returned a different FCB");
    assert_eq!(mgr.counters().cache_hit, 1);
    assert_eq!(
        mgr.counters().cache_miss,
        1,
        "the second packet should not have walked the tree"
    );
}

#[test]
fn aggregate_zero_bypasses_the_cache() {
    let mut mgr = cached_manager(false);
    let a = one(&mut mgr, flow_packet(0, 80), 1);
    let b = one(&mut mgr, flow_packet(0, 80), 2);
    assert_eq!(a, b, "same flow still classifies identically");
    assert_eq!(mgr.counters().cache_hit, 0);
    assert_eq!(mgr.counters().cache_miss, 0);
}

#[test]
fn aggregate_collision_classifies_without_replacing() {
    let mut mgr = cached_manager(false);
    // Two different flows with the same aggregate annotation.
    let a = one(&mut mgr, flow_packet(0x1234_5678, 80), 1);
    let b = one(&mut mgr, flow_packet(0x1234_5678, 81), 2);
    assert_ne!(a, b, "the reverse match must catch the collision");
    assert_eq!(mgr.counters().cache_sharing, 1);

    // The original entry survives.
    let again = one(&mut mgr, flow_packet(0x1234_5678, 80), 3);
    assert_eq!(again, a);
    assert_eq!(mgr.counters().cache_hit, 1);
}

#[test]
fn aggtrust_skips_the_reverse_match() {
    let mut mgr = cached_manager(true);
    let a = one(&mut mgr, flow_packet(0x1234_5678, 80), 1);
    // A different flow with the same aggregate is trusted to be the same
    // flow — the documented risk of AGGTRUST.
    let b = one(&mut mgr, flow_packet(0x1234_5678, 81), 2);
    assert_eq!(a, b);
    assert_eq!(mgr.counters().cache_hit, 1);
}

#[test]
fn full_ring_evicts_the_oldest_entry() {
    let config = ContextConfig {
        aggcache: true,
        cache_size: 1,
        cache_ring_size: 2,
        builder: false,
        ..ContextConfig::default()
    };
    let mut mgr = ContextManager::new(
        Dispatcher::new("ctx", 2, &["12/0800 && 36/0/FFFF 0", "- 1"]),
        config,
    )
    .unwrap();
    mgr.initialize(&ThreadSet::single(0, 1), Timestamp::from_msec(0))
        .unwrap();

    // Three aggregates in a single two-slot bucket.
    one(&mut mgr, flow_packet(1, 80), 1);
    one(&mut mgr, flow_packet(2, 81), 2);
    one(&mut mgr, flow_packet(3, 82), 3);
    assert_eq!(mgr.counters().cache_miss, 3);

    // The newest entry is cached, the oldest was evicted.
    one(&mut mgr, flow_packet(3, 82), 4);
    assert_eq!(mgr.counters().cache_hit, 1);
    let misses = mgr.counters().cache_miss;
    one(&mut mgr, flow_packet(1, 80), 5);
    assert_eq!(mgr.counters().cache_miss, misses + 1);
}
