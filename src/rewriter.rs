//! Rewriter flow table: per-core flow maps with two-heap expiry.
//!
//! NAT-style elements keep their mappings here. Each CPU owns a map from
//! flow id to entry plus two heaps ordered by expiry: the *guarantee* heap
//! holds flows whose configured guarantee has not run out, the
//! *best-effort* heap holds everything else and is the eviction pool.
//! Flows store their heap position, so an expiry change or a mid-heap
//! removal re-sifts in O(log n).
//!
//! The per-thread map sits behind a read/write lock. The owning thread is
//! the only writer; other threads only read it during a migration window,
//! either copying entries up front (*pre-copy*) or searching peers on a
//! miss for a bounded time after a rebalance (*post-copy*).

use crate::utils::{ThreadSet, Timestamp};
use anyhow::{Context, Result, bail};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::RwLock;

/// Default flow timeout: 5 minutes.
pub const DEFAULT_TIMEOUT_MSEC: u64 = 300_000;
/// Default guarantee: 5 seconds.
pub const DEFAULT_GUARANTEE_MSEC: u64 = 5_000;
/// Default reap interval: 15 minutes.
pub const DEFAULT_GC_INTERVAL_MSEC: u64 = 15 * 60 * 1000;
/// How long a post-copy migration window keeps peers searchable, in ms.
pub const THREAD_MIGRATION_TIMEOUT: u64 = 10_000;

const BEST_EFFORT: usize = 0;
const GUARANTEE: usize = 1;

/// A bidirectional 4-tuple flow id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FlowId {
    /// Source address.
    pub saddr: u32,
    /// Source port.
    pub sport: u16,
    /// Destination address.
    pub daddr: u32,
    /// Destination port.
    pub dport: u16,
}

impl FlowId {
    /// The reply direction: source and destination swapped.
    #[must_use]
    pub fn reply(&self) -> FlowId {
        FlowId {
            saddr: self.daddr,
            sport: self.dport,
            daddr: self.saddr,
            dport: self.sport,
        }
    }
}

/// What an input port does with new flows.
#[derive(Clone, Debug)]
pub enum InputSpec {
    /// Drop unmapped traffic.
    Drop,
    /// Pass without mapping.
    Nochange {
        /// Forward output port.
        foutput: usize,
    },
    /// Map the flow onto itself (track it, rewrite nothing).
    Keep {
        /// Forward output port.
        foutput: usize,
        /// Reply output port.
        routput: usize,
    },
    /// Rewrite source and/or destination.
    Pattern {
        /// Replacement source (address, port); `None` keeps the original.
        new_src: Option<(u32, u16)>,
        /// Replacement destination (address, port).
        new_dst: Option<(u32, u16)>,
        /// Forward output port.
        foutput: usize,
        /// Reply output port.
        routput: usize,
    },
}

fn parse_addr_port(addr: &str, port: &str) -> Result<Option<(u32, u16)>> {
    if addr == "-" {
        return Ok(None);
    }
    let a: std::net::Ipv4Addr = addr.parse().with_context(|| format!("bad address {addr:?}"))?;
    let p: u16 = port.parse().with_context(|| format!("bad port {port:?}"))?;
    Ok(Some((u32::from_be_bytes(a.octets()), p)))
}

impl InputSpec {
    /// Parse one input specification line:
    /// `drop`, `nochange [PORT]`, `keep FPORT RPORT`, or
    /// `pattern SADDR SPORT DADDR DPORT FPORT RPORT` (with `-` keeping a
    /// side unchanged).
    ///
    /// # Errors
    ///
    /// Fails on malformed input; specs are parsed at configure time only.
    pub fn parse(line: &str) -> Result<InputSpec> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some(&kind) = words.first() else {
            bail!("empty input spec");
        };
        match kind {
            "drop" | "discard" => {
                if words.len() > 1 {
                    bail!("syntax error, expected {kind:?}");
                }
                Ok(InputSpec::Drop)
            }
            "pass" | "passthrough" | "nochange" => {
                let foutput = match words.get(1) {
                    Some(w) => w.parse().with_context(|| format!("bad output {w:?}"))?,
                    None => 0,
                };
                Ok(InputSpec::Nochange { foutput })
            }
            "keep" => {
                let [foutput, routput] = ports(&words[1..])?;
                Ok(InputSpec::Keep { foutput, routput })
            }
            "pattern" | "xpattern" => {
                if words.len() != 7 {
                    bail!("syntax error, expected pattern SADDR SPORT DADDR DPORT FPORT RPORT");
                }
                let new_src = parse_addr_port(words[1], words[2])?;
                let new_dst = parse_addr_port(words[3], words[4])?;
                let [foutput, routput] = ports(&words[5..])?;
                Ok(InputSpec::Pattern {
                    new_src,
                    new_dst,
                    foutput,
                    routput,
                })
            }
            other => bail!("unknown input specification {other:?}"),
        }
    }

    /// Compute the rewritten flow id, or `None` when this input drops or
    /// passes unmapped traffic.
    fn rewrite(&self, flowid: &FlowId) -> Option<FlowId> {
        match self {
            InputSpec::Drop | InputSpec::Nochange { .. } => None,
            InputSpec::Keep { .. } => Some(*flowid),
            InputSpec::Pattern {
                new_src, new_dst, ..
            } => {
                let mut out = *flowid;
                if let Some((addr, port)) = new_src {
                    out.saddr = *addr;
                    out.sport = *port;
                }
                if let Some((addr, port)) = new_dst {
                    out.daddr = *addr;
                    out.dport = *port;
                }
                Some(out)
            }
        }
    }

    fn outputs(&self) -> (i32, i32) {
        match self {
            InputSpec::Drop => (-1, -1),
            InputSpec::Nochange { foutput } => (*foutput as i32, -1),
            InputSpec::Keep { foutput, routput }
            | InputSpec::Pattern {
                foutput, routput, ..
            } => (*foutput as i32, *routput as i32),
        }
    }
}

fn ports(words: &[&str]) -> Result<[usize; 2]> {
    if words.len() != 2 {
        bail!("expected a forward and a reply output port");
    }
    Ok([
        words[0].parse().with_context(|| format!("bad port {:?}", words[0]))?,
        words[1].parse().with_context(|| format!("bad port {:?}", words[1]))?,
    ])
}

/// One direction of a mapped flow.
#[derive(Clone, Copy, Debug)]
pub struct FlowEntry {
    /// Key this entry is stored under.
    pub flowid: FlowId,
    /// The flow id packets leave with.
    pub rewritten: FlowId,
    /// Output port for this direction.
    pub output: i32,
}

/// A mapped flow: both directions plus expiry bookkeeping.
#[derive(Clone, Debug)]
pub struct RewriterFlow {
    /// Forward (`[0]`) and reply (`[1]`) entries.
    pub entries: [FlowEntry; 2],
    /// Input spec that created the flow.
    pub input: usize,
    /// IP protocol, zero when unchecked.
    pub ip_p: u8,
    /// True while the guarantee timeout applies.
    pub guaranteed: bool,
    /// Expiry timestamp in ms.
    pub expiry: u64,
    heap_pos: usize,
}

impl RewriterFlow {
    /// True once the flow's expiry is in the past.
    #[must_use]
    pub fn expired(&self, now: Timestamp) -> bool {
        self.expiry <= now.0
    }
}

#[derive(Clone, Copy, Debug)]
struct EntryRef {
    flow: usize,
    reply: bool,
}

#[derive(Debug, Default)]
struct MapState {
    map: HashMap<FlowId, EntryRef>,
    flows: Vec<Option<RewriterFlow>>,
    free: Vec<usize>,
    heaps: [Vec<usize>; 2],
    rebalance: u64,
}

impl MapState {
    fn store(&mut self, flow: RewriterFlow) -> usize {
        if let Some(idx) = self.free.pop() {
            self.flows[idx] = Some(flow);
            idx
        } else {
            self.flows.push(Some(flow));
            self.flows.len() - 1
        }
    }

    fn flow(&self, idx: usize) -> &RewriterFlow {
        self.flows[idx].as_ref().expect("live flow")
    }

    fn flow_mut(&mut self, idx: usize) -> &mut RewriterFlow {
        self.flows[idx].as_mut().expect("live flow")
    }

    fn heap_size(&self) -> usize {
        self.heaps[0].len() + self.heaps[1].len()
    }

    fn heap_push(&mut self, which: usize, idx: usize) {
        self.heaps[which].push(idx);
        let pos = self.heaps[which].len() - 1;
        self.flow_mut(idx).heap_pos = pos;
        self.sift_up(which, pos);
    }

    fn heap_remove(&mut self, which: usize, idx: usize) {
        let pos = self.flow(idx).heap_pos;
        let last = self.heaps[which].len() - 1;
        self.heaps[which].swap(pos, last);
        self.heaps[which].pop();
        if pos < self.heaps[which].len() {
            let moved = self.heaps[which][pos];
            self.flow_mut(moved).heap_pos = pos;
            self.sift_down(which, pos);
            self.sift_up(which, self.flow(moved).heap_pos);
        }
    }

    fn sift_up(&mut self, which: usize, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            let (a, b) = (self.heaps[which][pos], self.heaps[which][parent]);
            if self.flow(a).expiry >= self.flow(b).expiry {
                break;
            }
            self.heaps[which].swap(pos, parent);
            self.flow_mut(a).heap_pos = parent;
            self.flow_mut(b).heap_pos = pos;
            pos = parent;
        }
    }

    fn sift_down(&mut self, which: usize, mut pos: usize) {
        loop {
            let (l, r) = (2 * pos + 1, 2 * pos + 2);
            let len = self.heaps[which].len();
            let mut smallest = pos;
            for child in [l, r] {
                if child < len
                    && self.flow(self.heaps[which][child]).expiry
                        < self.flow(self.heaps[which][smallest]).expiry
                {
                    smallest = child;
                }
            }
            if smallest == pos {
                break;
            }
            let (a, b) = (self.heaps[which][pos], self.heaps[which][smallest]);
            self.heaps[which].swap(pos, smallest);
            self.flow_mut(a).heap_pos = smallest;
            self.flow_mut(b).heap_pos = pos;
            pos = smallest;
        }
    }

    /// Unmap both directions and free the flow.
    fn destroy(&mut self, idx: usize) {
        let flow = self.flow(idx).clone();
        let which = usize::from(flow.guaranteed);
        self.heap_remove(which, idx);
        for (i, entry) in flow.entries.iter().enumerate() {
            if let Some(r) = self.map.get(&entry.flowid) {
                if r.flow == idx && r.reply == (i == 1) {
                    self.map.remove(&entry.flowid);
                }
            }
        }
        self.flows[idx] = None;
        self.free.push(idx);
    }
}

/// Per-core rewriter table. See the module docs for the locking model.
pub struct Rewriter {
    specs: Vec<InputSpec>,
    /// `[0]` best-effort timeout, `[1]` guarantee, both in ms.
    pub timeouts: [u64; 2],
    capacity: usize,
    handle_migration: bool,
    precopy: bool,
    states: Vec<RwLock<MapState>>,
    mapping_failures: std::sync::atomic::AtomicU64,
}

/// A successful lookup: which output to take and the rewritten flow id.
#[derive(Clone, Copy, Debug)]
pub struct Mapping {
    /// Output port.
    pub output: i32,
    /// Flow id to stamp onto the packet.
    pub rewritten: FlowId,
    /// True when matched in the reply direction.
    pub is_reply: bool,
}

impl Rewriter {
    /// A rewriter with one input spec per input port, spread over
    /// `ncpus` per-core tables.
    ///
    /// # Errors
    ///
    /// Fails on malformed input specs.
    pub fn new(ncpus: usize, spec_lines: &[&str]) -> Result<Self> {
        let specs = spec_lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                InputSpec::parse(line).with_context(|| format!("input spec {i}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            specs,
            timeouts: [DEFAULT_TIMEOUT_MSEC, DEFAULT_GUARANTEE_MSEC],
            capacity: i32::MAX as usize,
            handle_migration: false,
            precopy: true,
            states: (0..ncpus.max(1)).map(|_| RwLock::new(MapState::default())).collect(),
            mapping_failures: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Cap the number of flows per core.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// Enable cross-thread flow migration with the given policy.
    pub fn set_migration(&mut self, handle: bool, precopy: bool) {
        self.handle_migration = handle;
        self.precopy = precopy;
    }

    /// Flows currently mapped on `cpu` (both heaps).
    #[must_use]
    pub fn size(&self, cpu: usize) -> usize {
        self.states[cpu].read().expect("lock poisoned").heap_size()
    }

    /// Mappings that failed because the table was full of guaranteed
    /// flows.
    #[must_use]
    pub fn mapping_failures(&self) -> u64 {
        self.mapping_failures.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Look up `flowid` on `cpu`, creating a mapping through input
    /// `input`'s spec on a miss. Returns `None` for dropped traffic.
    pub fn get_entry(
        &self,
        cpu: usize,
        ip_p: u8,
        flowid: &FlowId,
        input: usize,
        now: Timestamp,
    ) -> Option<Mapping> {
        {
            let state = self.states[cpu].read().expect("lock poisoned");
            if let Some(r) = state.map.get(flowid) {
                let flow = state.flow(r.flow);
                if ip_p != 0 && flow.ip_p != 0 && flow.ip_p != ip_p {
                    return None;
                }
                let entry = &flow.entries[usize::from(r.reply)];
                return Some(Mapping {
                    output: entry.output,
                    rewritten: entry.rewritten,
                    is_reply: r.reply,
                });
            }
        }
        let spec = self.specs.get(input)?;

        // A missing flow may live on a peer core right after a rebalance.
        if self.handle_migration && !self.precopy {
            if let Some((rewritten, flow_input)) = self.search_migrate_entry(cpu, flowid, now) {
                return self.add_flow(cpu, ip_p, *flowid, rewritten, flow_input, now);
            }
        }

        match spec {
            InputSpec::Nochange { foutput } => Some(Mapping {
                output: *foutput as i32,
                rewritten: *flowid,
                is_reply: false,
            }),
            InputSpec::Drop => None,
            _ => {
                let rewritten = spec.rewrite(flowid)?;
                self.add_flow(cpu, ip_p, *flowid, rewritten, input, now)
            }
        }
    }

    /// Search peer maps during the post-copy migration window.
    fn search_migrate_entry(
        &self,
        cpu: usize,
        flowid: &FlowId,
        now: Timestamp,
    ) -> Option<(FlowId, usize)> {
        {
            let own = self.states[cpu].read().expect("lock poisoned");
            if own.rebalance == 0 || now.0.saturating_sub(own.rebalance) >= THREAD_MIGRATION_TIMEOUT
            {
                return None;
            }
        }
        for (i, peer) in self.states.iter().enumerate() {
            if i == cpu {
                continue;
            }
            let state = peer.read().expect("lock poisoned");
            if let Some(r) = state.map.get(flowid) {
                let flow = state.flow(r.flow);
                if !r.reply && !flow.expired(now) {
                    debug!("recovered flow from the map of core {i}");
                    return Some((flow.entries[0].rewritten, flow.input));
                }
            }
        }
        None
    }

    /// Install a mapping for both directions on `cpu`, evicting the
    /// nearest-to-expire best-effort flow when over capacity. Returns
    /// `None` when the new flow itself had to give way (admission
    /// control favours existing guarantees).
    pub fn add_flow(
        &self,
        cpu: usize,
        ip_p: u8,
        flowid: FlowId,
        rewritten: FlowId,
        input: usize,
        now: Timestamp,
    ) -> Option<Mapping> {
        let (foutput, routput) = self.specs.get(input)?.outputs();
        let guaranteed = self.timeouts[GUARANTEE] != 0;
        let timeout = if guaranteed {
            self.timeouts[GUARANTEE]
        } else {
            self.timeouts[BEST_EFFORT]
        };
        let flow = RewriterFlow {
            entries: [
                FlowEntry {
                    flowid,
                    rewritten,
                    output: foutput,
                },
                FlowEntry {
                    // The reply direction maps the rewritten id back.
                    flowid: rewritten.reply(),
                    rewritten: flowid.reply(),
                    output: routput,
                },
            ],
            input,
            ip_p,
            guaranteed,
            expiry: now.0 + timeout,
            heap_pos: 0,
        };

        let mut state = self.states[cpu].write().expect("lock poisoned");
        let idx = state.store(flow);
        if let Some(old) = state.map.insert(flowid, EntryRef { flow: idx, reply: false }) {
            // An old mapping for the same id: drop it entirely.
            if old.flow != idx {
                state.destroy(old.flow);
            }
        }
        if let Some(old) = state
            .map
            .insert(rewritten.reply(), EntryRef { flow: idx, reply: true })
        {
            if old.flow != idx {
                state.destroy(old.flow);
            }
        }
        let which = usize::from(guaranteed);
        state.heap_push(which, idx);

        if state.heap_size() > self.capacity {
            debug_assert_eq!(state.heap_size(), self.capacity + 1);
            if self.shrink_for_new_flow(&mut state, idx, now) {
                self.mapping_failures
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return None;
            }
        }
        Some(Mapping {
            output: foutput,
            rewritten,
            is_reply: false,
        })
    }

    /// Move flows with expired guarantees onto the best-effort heap,
    /// giving them the remainder of the best-effort timeout.
    pub fn shift_heap_best_effort(&self, cpu: usize, now: Timestamp) {
        let mut state = self.states[cpu].write().expect("lock poisoned");
        self.shift_locked(&mut state, now);
    }

    fn shift_locked(&self, state: &mut MapState, now: Timestamp) {
        while let Some(&top) = state.heaps[GUARANTEE].first() {
            if !state.flow(top).expired(now) {
                break;
            }
            state.heap_remove(GUARANTEE, top);
            let flow = state.flow_mut(top);
            flow.guaranteed = false;
            flow.expiry = flow.expiry + self.timeouts[BEST_EFFORT] - self.timeouts[GUARANTEE];
            state.heap_push(BEST_EFFORT, top);
        }
    }

    fn shrink_for_new_flow(&self, state: &mut MapState, new_flow: usize, now: Timestamp) -> bool {
        self.shift_locked(state, now);
        // All guaranteed flows now expire in the future; evict the
        // nearest-to-expire best-effort flow, or the new flow itself when
        // there is none (honouring previous guarantees).
        let dead = match state.heaps[BEST_EFFORT].first() {
            Some(&top) => top,
            None => {
                debug_assert!(state.flow(new_flow).guaranteed);
                new_flow
            }
        };
        state.destroy(dead);
        dead == new_flow
    }

    /// Reap expired flows on `cpu`, shrinking to `capacity`
    /// (or to nothing with `clear_all`).
    pub fn shrink_heap(&self, cpu: usize, clear_all: bool, now: Timestamp) {
        let mut state = self.states[cpu].write().expect("lock poisoned");
        self.shift_locked(&mut state, now);
        while let Some(&top) = state.heaps[BEST_EFFORT].first() {
            if !state.flow(top).expired(now) {
                break;
            }
            state.destroy(top);
        }
        let capacity = if clear_all { 0 } else { self.capacity };
        while state.heap_size() > capacity {
            let which = usize::from(state.heaps[BEST_EFFORT].is_empty());
            let top = state.heaps[which][0];
            state.destroy(top);
        }
    }

    /// Look up a mapping without creating one (test and handler use).
    #[must_use]
    pub fn search_entry(&self, cpu: usize, flowid: &FlowId) -> Option<(FlowEntry, bool)> {
        let state = self.states[cpu].read().expect("lock poisoned");
        let r = state.map.get(flowid)?;
        Some((state.flow(r.flow).entries[usize::from(r.reply)], r.reply))
    }

    /// Reconfigure the thread set. `up` activates the cores in `threads`,
    /// otherwise they deactivate. Pre-copy clones alive forward entries
    /// onto the targets now; post-copy stamps a rebalance time so misses
    /// search peers for [`THREAD_MIGRATION_TIMEOUT`] ms.
    pub fn migrate(&self, up: bool, threads: &ThreadSet, now: Timestamp) {
        if self.precopy {
            let (sources, targets): (Vec<usize>, Vec<usize>) = if up {
                (
                    (0..self.states.len()).filter(|&i| !threads.contains(i)).collect(),
                    threads.iter().collect(),
                )
            } else {
                (
                    threads.iter().collect(),
                    (0..self.states.len()).filter(|&i| !threads.contains(i)).collect(),
                )
            };
            for &src in &sources {
                let copies: Vec<RewriterFlow> = {
                    let state = self.states[src].read().expect("lock poisoned");
                    if state.map.is_empty() {
                        continue;
                    }
                    state
                        .map
                        .values()
                        .filter(|r| !r.reply)
                        .map(|r| state.flow(r.flow))
                        .filter(|f| !f.expired(now))
                        .cloned()
                        .collect()
                };
                for &dst in &targets {
                    info!(
                        "migration {}: copying state of core {src} to core {dst}",
                        if up { "up" } else { "down" }
                    );
                    for flow in &copies {
                        self.add_flow(
                            dst,
                            flow.ip_p,
                            flow.entries[0].flowid,
                            flow.entries[0].rewritten,
                            flow.input,
                            now,
                        );
                    }
                }
            }
        } else {
            for (i, state) in self.states.iter().enumerate() {
                let target = if up { threads.contains(i) } else { !threads.contains(i) };
                if target {
                    info!(
                        "core {i} will fetch unknown flows from neighbours for {}ms",
                        THREAD_MIGRATION_TIMEOUT
                    );
                    state.write().expect("lock poisoned").rebalance = now.0;
                }
            }
        }
    }

    /// Snapshot of the guarantee heap's expiries on `cpu` (test use).
    #[must_use]
    pub fn guarantee_expiries(&self, cpu: usize) -> Vec<u64> {
        let state = self.states[cpu].read().expect("lock poisoned");
        state.heaps[GUARANTEE]
            .iter()
            .map(|&i| state.flow(i).expiry)
            .collect()
    }
}
