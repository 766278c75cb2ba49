use flowctx::rewriter::{FlowId, InputSpec, Rewriter};
use flowctx::utils::{ThreadSet, Timestamp};

fn flow(dport: u16) -> FlowId {
    FlowId {
        saddr: 0x0A00_0001,
        sport: 4000,
        daddr: 0x0A00_0002,
        dport,
    }
}

fn at(ms: u64) -> Timestamp {
    Timestamp::from_msec(ms)
}

#[test]
fn input_specs_parse_and_reject() {
    assert!(matches!(InputSpec::parse("drop"), Ok(InputSpec::Drop)));
    assert!(matches!(
        InputSpec::parse("nochange 2"),
        Ok(InputSpec::Nochange { foutput: 2 })
    ));
    assert!(matches!(
        InputSpec::parse("keep 0 1"),
        Ok(InputSpec::Keep {
            foutput: 0,
            routput: 1
        })
    ));
    assert!(InputSpec::parse("pattern 1.2.3.4 99 - - 0 1").is_ok());
    for bad in ["", "keep 0", "pattern 1.2.3.4 99 0 1", "frobnicate"] {
        assert!(InputSpec::parse(bad).is_err(), "{bad:?} should not parse");
    }
}

#[test]
fn keep_maps_both_directions() {
    let rw = Rewriter::new(1, &["keep 0 1"]).unwrap();
    let fwd = rw.get_entry(0, 6, &flow(80), 0, at(0)).expect("mapped");
    assert_eq!(fwd.output, 0);
    assert_eq!(fwd.rewritten, flow(80));

    // The reply direction is present and routed to the reply output.
    let (reply, is_reply) = rw.search_entry(0, &flow(80).reply()).expect("reply mapped");
    assert!(is_reply);
    assert_eq!(reply.output, 1);
    assert_eq!(reply.rewritten, flow(80).reply());
}

#[test]
fn pattern_rewrites_the_source() {
    let rw = Rewriter::new(1, &["pattern 192.168.0.1 1000 - - 0 1"]).unwrap();
    let mapping = rw.get_entry(0, 6, &flow(80), 0, at(0)).expect("mapped");
    assert_eq!(mapping.rewritten.saddr, 0xC0A8_0001);
    assert_eq!(mapping.rewritten.sport, 1000);
    assert_eq!(mapping.rewritten.daddr, flow(80).daddr);

    // Replies to the rewritten id map back to the original source.
    let (reply, _) = rw
        .search_entry(0, &mapping.rewritten.reply())
        .expect("reply mapped");
    assert_eq!(reply.rewritten, flow(80).reply());
}

#[test]
fn best_effort_eviction_drops_the_nearest_expiry() {
    // Scenario: capacity 2, flows expiring at t+10, t+20, t+30.
    let mut rw = Rewriter::new(1, &["keep 0 1"]).unwrap();
    rw.set_capacity(2);
    rw.timeouts = [10, 0]; // best-effort only
    rw.get_entry(0, 6, &flow(1), 0, at(0)).unwrap();
    rw.timeouts = [20, 0];
    rw.get_entry(0, 6, &flow(2), 0, at(0)).unwrap();
    rw.timeouts = [30, 0];
    rw.get_entry(0, 6, &flow(3), 0, at(0)).unwrap();

    assert_eq!(rw.size(0), 2);
    assert!(rw.search_entry(0, &flow(1)).is_none(), "F1 must be evicted");
    assert!(
        rw.search_entry(0, &flow(1).reply()).is_none(),
        "F1's reply entry must be gone too"
    );
    assert!(rw.search_entry(0, &flow(2)).is_some());
    assert!(rw.search_entry(0, &flow(3)).is_some());
}

#[test]
fn guarantee_heap_never_keeps_expired_guarantees() {
    let mut rw = Rewriter::new(1, &["keep 0 1"]).unwrap();
    rw.timeouts = [300_000, 5_000];
    for dport in 0..8 {
        rw.get_entry(0, 6, &flow(dport), 0, at(u64::from(dport) * 1000))
            .unwrap();
    }
    let now = at(9_500);
    rw.shift_heap_best_effort(0, now);
    for expiry in rw.guarantee_expiries(0) {
        assert!(
            expiry > now.0,
            "guaranteed flow with past expiry {expiry} survived the shift"
        );
    }
    // Shifted flows are still mapped, now on the best-effort side.
    assert_eq!(rw.size(0), 8);
}

#[test]
fn full_table_of_guarantees_refuses_the_new_flow() {
    let mut rw = Rewriter::new(1, &["keep 0 1"]).unwrap();
    rw.set_capacity(2);
    rw.timeouts = [300_000, 5_000]; // all flows guaranteed
    assert!(rw.get_entry(0, 6, &flow(1), 0, at(0)).is_some());
    assert!(rw.get_entry(0, 6, &flow(2), 0, at(0)).is_some());
    // Admission control: previous guarantees win over the newcomer.
    assert!(rw.get_entry(0, 6, &flow(3), 0, at(1)).is_none());
    assert_eq!(rw.mapping_failures(), 1);
    assert!(rw.search_entry(0, &flow(1)).is_some());
    assert!(rw.search_entry(0, &flow(2)).is_some());
}

#[test]
fn shrink_heap_reaps_expired_flows() {
    let mut rw = Rewriter::new(1, &["keep 0 1"]).unwrap();
    rw.timeouts = [100, 0];
    rw.get_entry(0, 6, &flow(1), 0, at(0)).unwrap();
    rw.get_entry(0, 6, &flow(2), 0, at(50)).unwrap();
    rw.shrink_heap(0, false, at(120));
    assert!(rw.search_entry(0, &flow(1)).is_none());
    assert!(rw.search_entry(0, &flow(2)).is_some());
    rw.shrink_heap(0, true, at(121));
    assert_eq!(rw.size(0), 0);
}

#[test]
fn precopy_migration_copies_alive_flows_to_the_target() {
    let mut rw = Rewriter::new(2, &["keep 0 1"]).unwrap();
    rw.set_migration(true, true);
    rw.timeouts = [1_000, 0];
    rw.get_entry(0, 6, &flow(1), 0, at(0)).unwrap();
    rw.get_entry(0, 6, &flow(2), 0, at(0)).unwrap();
    // This one is already expired at migration time.
    rw.timeouts = [10, 0];
    rw.get_entry(0, 6, &flow(3), 0, at(0)).unwrap();

    let mut target = ThreadSet::none(2);
    target.insert(1);
    rw.migrate(true, &target, at(100));

    assert!(rw.search_entry(1, &flow(1)).is_some());
    assert!(rw.search_entry(1, &flow(2)).is_some());
    assert!(
        rw.search_entry(1, &flow(3)).is_none(),
        "expired flows are not migrated"
    );
    // Reply entries came along.
    assert!(rw.search_entry(1, &flow(1).reply()).is_some());
}

#[test]
fn postcopy_migration_searches_peers_during_the_window() {
    let mut rw = Rewriter::new(2, &["keep 0 1"]).unwrap();
    rw.set_migration(true, false);
    rw.get_entry(0, 6, &flow(1), 0, at(0)).unwrap();

    let mut target = ThreadSet::none(2);
    target.insert(1);
    rw.migrate(true, &target, at(100));

    // A miss on the new core finds the flow on its previous owner.
    let found = rw.get_entry(1, 6, &flow(1), 0, at(200));
    assert!(found.is_some());
    assert!(rw.search_entry(1, &flow(1)).is_some(), "now mapped locally");

    // Outside the window the search stops; unknown flows map fresh.
    let late = rw.get_entry(1, 6, &flow(9), 0, at(100 + 20_000));
    assert!(late.is_some());
}
