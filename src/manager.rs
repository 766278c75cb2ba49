//! The context manager: owns the classification tree and drives the
//! packet path.
//!
//! Build side: merges the dispatcher tables, optimises the tree for the
//! active thread set and swaps build-phase leaves for pool FCBs. Packet
//! side: classifies each packet of a batch to an FCB (through the
//! aggregate cache when enabled), validates it, and re-forms output
//! batches in one of two modes — **simple** preserves global packet order
//! and cuts a batch whenever the FCB changes; **builder** reorders packets
//! into same-flow runs through a small ring of pending sub-batches.
//! Timeout machinery lives here too: a per-thread intrusive list of idle
//! FCBs walked by the periodic timer and the idle task, with an adaptive
//! scan threshold.

use crate::cache::{AggregateCache, Probe};
use crate::dispatcher::Dispatcher;
use crate::fcb::{FLAG_TIMEOUT, FLAG_TIMEOUT_INLIST, FcbId, TIMEOUT_SHIFT};
use crate::node::{EdgeTarget, NodeId};
use crate::packet::{Packet, PacketBatch};
use crate::parser::ParseContext;
use crate::tree::Tree;
use crate::utils::{ThreadSet, Timestamp};
use anyhow::{Result, bail};
use log::{debug, info, warn};

/// Size of the builder-mode ring of pending sub-batches. Fixed; a full
/// ring forces the oldest sub-batch out early, which is correct but
/// suboptimal under heavy flow mixing.
pub const BUILDER_RING_SIZE: usize = 16;

/// Default timeout-list scan threshold.
const DEFAULT_THRESH: usize = 64;

/// Configuration of a [`ContextManager`].
#[derive(Clone, Debug)]
pub struct ContextConfig {
    /// Enable the aggregate→FCB cache.
    pub aggcache: bool,
    /// Cache buckets; must be a power of two. Zero disables the cache even
    /// with `aggcache` set.
    pub cache_size: usize,
    /// Slots per cache bucket; must be a power of two.
    pub cache_ring_size: usize,
    /// Use the builder dispatcher (reorders packets into same-flow runs)
    /// instead of the order-preserving simple dispatcher.
    pub builder: bool,
    /// Trust aggregate equality on cache hits, skipping the reverse match.
    /// Off by default: colliding aggregates would share flow state.
    pub aggtrust: bool,
    /// Kill packets whose FCB carries the early-drop flag.
    pub early_drop: bool,
    /// Never cut a batch on FCB change (debugging aid).
    pub nocut: bool,
    /// Run the tree optimiser after merging.
    pub optimize: bool,
    /// Enable the release/timeout machinery.
    pub release: bool,
    /// Period of the cleanup timer in milliseconds; zero disables it.
    pub clean_timer_msec: u64,
    /// Extra FCB payload bytes reserved for cooperating elements, beyond
    /// the dispatchers' output labels.
    pub reserve: usize,
    /// Anchor for protocol-relative rule classes.
    pub context: ParseContext,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            aggcache: false,
            cache_size: 4096,
            cache_ring_size: 8,
            builder: true,
            aggtrust: false,
            early_drop: true,
            nocut: false,
            optimize: true,
            release: true,
            clean_timer_msec: 5000,
            reserve: 0,
            context: ParseContext::Ether,
        }
    }
}

/// An output batch: every packet in it classified to the same FCB.
#[derive(Debug)]
pub struct FlowBatch {
    /// The shared flow control block.
    pub fcb: FcbId,
    /// The packets, in their intra-flow input order.
    pub batch: PacketBatch,
}

/// Hot-path counters, surfaced through the metrics module.
#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct Counters {
    /// Cache probes that returned the right FCB.
    pub cache_hit: u64,
    /// Cache probes that walked the tree.
    pub cache_miss: u64,
    /// Aggregate collisions: same aggregate, different flow.
    pub cache_sharing: u64,
    /// Packets killed by the early-drop flag.
    pub early_dropped: u64,
    /// Packets that classified to nothing.
    pub unclassified: u64,
    /// Builder-ring overflows that forced an early emit.
    pub builder_forced_flush: u64,
    /// FCBs released by the timeout reaper.
    pub timeout_released: u64,
}

/// Per-thread intrusive list of FCBs waiting out their timeout.
#[derive(Debug)]
struct FcbList {
    head: Option<FcbId>,
    count: usize,
    count_thresh: usize,
}

impl Default for FcbList {
    fn default() -> Self {
        Self {
            head: None,
            count: 0,
            count_thresh: DEFAULT_THRESH,
        }
    }
}

#[derive(Debug, Default)]
struct CpuState {
    cache: Option<AggregateCache>,
    old_flows: FcbList,
}

/// The runtime element owning the tree, the pool, the caches and the
/// timeout lists. See the module docs for the lifecycle.
pub struct ContextManager {
    config: ContextConfig,
    dispatcher: Dispatcher,
    tree: Tree,
    root: Option<NodeId>,
    threads: ThreadSet,
    cpus: Vec<CpuState>,
    counters: Counters,
    timer_deadline: Option<Timestamp>,
}

impl ContextManager {
    /// A manager for the element tree rooted at `dispatcher`.
    ///
    /// # Errors
    ///
    /// Fails on an invalid cache geometry.
    pub fn new(dispatcher: Dispatcher, config: ContextConfig) -> Result<Self> {
        if !config.cache_size.is_power_of_two() {
            bail!("cache size must be a power of 2");
        }
        if !config.cache_ring_size.is_power_of_two() {
            bail!("cache ring size must be a power of 2");
        }
        Ok(Self {
            config,
            dispatcher,
            tree: Tree::new(0),
            root: None,
            threads: ThreadSet::single(0, 1),
            cpus: Vec::new(),
            counters: Counters::default(),
            timer_deadline: None,
        })
    }

    /// Build the runtime tree: parse and merge every dispatcher table,
    /// optimise for `threads`, swap leaves for pool FCBs, size the caches.
    /// Must run before the first packet; all fatal errors surface here.
    ///
    /// # Errors
    ///
    /// Fails on rule parse errors, payload conflicts, or a table that
    /// classifies nothing.
    pub fn initialize(&mut self, threads: &ThreadSet, now: Timestamp) -> Result<()> {
        let reserved = self.dispatcher.assign_offsets(0);
        self.tree = Tree::new(reserved + self.config.reserve);
        self.tree.pool.compress(threads);

        let table = self.dispatcher.table(&mut self.tree, self.config.context)?;
        if self.tree.node(table).is_dummy() && self.tree.node(table).num() == 0 {
            bail!("context manager without any classification");
        }
        debug!("table before optimization:\n{}", self.tree.dump(table));
        self.tree.check(table);

        let root = if self.config.optimize {
            self.tree.optimize(table, threads)
        } else {
            table
        };
        self.tree.check(root);
        info!("table after optimization:\n{}", self.tree.dump(root));

        let installed = self.tree.finalize_leaves(root);
        debug!("{installed} runtime FCBs installed");

        let have_dynamic = self
            .tree
            .all_nodes(root)
            .iter()
            .any(|&id| self.tree.node(id).level.is_dynamic());
        if !have_dynamic && self.config.release {
            debug!("table is fully static, timeout machinery will stay idle");
        }

        self.threads = threads.clone();
        self.cpus = (0..threads.len())
            .map(|_| CpuState {
                cache: (self.config.aggcache && self.config.cache_size > 0).then(|| {
                    AggregateCache::new(self.config.cache_size, self.config.cache_ring_size)
                }),
                old_flows: FcbList::default(),
            })
            .collect();
        self.root = Some(root);
        if self.config.release && self.config.clean_timer_msec > 0 {
            self.timer_deadline = Some(now.advanced(self.config.clean_timer_msec));
        }
        Ok(())
    }

    /// The tree root (after [`Self::initialize`]).
    ///
    /// # Panics
    ///
    /// Panics before initialization.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root.expect("manager is initialized")
    }

    /// Borrow the tree.
    #[must_use]
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Mutably borrow the tree.
    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    /// The dispatcher graph root.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The thread set this manager was initialized for.
    #[must_use]
    pub fn threads(&self) -> &ThreadSet {
        &self.threads
    }

    /// Hot-path counters.
    #[must_use]
    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// True when the aggregate cache is active.
    #[must_use]
    pub fn is_dynamic_cache_enabled(&self) -> bool {
        self.config.aggcache && self.config.cache_size > 0
    }

    /// Classify and dispatch one input batch on `cpu`. Emitted batches are
    /// in dispatch order; each holds packets of a single FCB, with `n`
    /// references acquired on it when the release machinery is on.
    pub fn process(&mut self, batch: PacketBatch, cpu: usize, now: Timestamp) -> Vec<FlowBatch> {
        let out = if self.config.builder {
            self.push_batch_builder(batch, cpu, now)
        } else {
            self.push_batch_simple(batch, cpu, now)
        };
        self.check_release_flows(cpu, now);
        out
    }

    /// Classify `p`, maintaining the last-aggregate shortcut.
    fn get_fcb_for(
        &mut self,
        p: &Packet,
        cpu: usize,
        lastagg: &mut u32,
        lastfcb: &mut Option<FcbId>,
    ) -> Option<FcbId> {
        let root = self.root();
        if self.is_dynamic_cache_enabled() {
            let agg = p.aggregate();
            if *lastagg == agg
                && lastfcb.is_some_and(|f| {
                    self.tree.pool.get(f).parent.is_some() && self.tree.reverse_match(f, p, cpu)
                })
            {
                return *lastfcb;
            }
            let fcb = self.get_cache_fcb(p, agg, cpu);
            *lastagg = agg;
            *lastfcb = fcb;
            fcb
        } else {
            self.tree.match_packet(root, p, cpu)
        }
    }

    /// Cache-assisted classification, mirroring the ring semantics: probe,
    /// reverse-match candidates, install on a miss, evict the oldest entry
    /// of a full ring.
    fn get_cache_fcb(&mut self, p: &Packet, agg: u32, cpu: usize) -> Option<FcbId> {
        let root = self.root();
        if agg == 0 {
            return self.tree.match_packet(root, p, cpu);
        }
        let Some(cache) = self.cpus[cpu].cache.as_ref() else {
            return self.tree.match_packet(root, p, cpu);
        };
        match cache.probe(agg) {
            Probe::Candidate(_, fcb) => {
                if self.config.aggtrust
                    || (self.tree.pool.get(fcb).parent.is_some()
                        && self.tree.reverse_match(fcb, p, cpu))
                {
                    self.counters.cache_hit += 1;
                    Some(fcb)
                } else {
                    // Same aggregate, different flow: classify but leave
                    // the entry alone.
                    self.counters.cache_sharing += 1;
                    self.tree.match_packet(root, p, cpu)
                }
            }
            Probe::Empty(slot) => {
                self.counters.cache_miss += 1;
                let fcb = self.tree.match_packet(root, p, cpu)?;
                self.set_fcb_cache(cpu, slot, agg, fcb);
                Some(fcb)
            }
            Probe::Full => {
                self.counters.cache_miss += 1;
                let fcb = self.tree.match_packet(root, p, cpu)?;
                let pool = &self.tree.pool;
                let slot = self.cpus[cpu]
                    .cache
                    .as_mut()
                    .expect("cache checked above")
                    .evict_oldest(agg, |f| pool.get(f).lastseen.0);
                self.set_fcb_cache(cpu, slot, agg, fcb);
                Some(fcb)
            }
        }
    }

    fn set_fcb_cache(&mut self, cpu: usize, slot: usize, agg: u32, fcb: FcbId) {
        let entry = self.tree.pool.get_mut(fcb);
        // An FCB already cached under another aggregate keeps that entry.
        if entry.cache_agg == 0 {
            entry.cache_agg = agg;
            if let Some(cache) = self.cpus[cpu].cache.as_mut() {
                cache.insert_at(slot, agg, fcb);
            }
        }
    }

    /// Drop the cache entry carrying `fcb`, if any.
    fn remove_cache_fcb(&mut self, cpu: usize, fcb: FcbId) {
        let agg = self.tree.pool.get(fcb).cache_agg;
        if agg == 0 {
            return;
        }
        if let Some(cache) = self.cpus[cpu].cache.as_mut() {
            if !cache.remove(agg, fcb) {
                warn!("releasing an FCB that fell out of the cache (agg {agg:#x})");
            }
        }
        self.tree.pool.get_mut(fcb).cache_agg = 0;
    }

    /// Validate the classification result: kill unclassified and
    /// early-drop packets, revive timed-out FCBs whose flow id was reused.
    fn is_valid_fcb(&mut self, fcb: Option<FcbId>, now: Timestamp) -> Option<FcbId> {
        let fcb = match fcb {
            None => {
                self.counters.unclassified += 1;
                return None;
            }
            Some(f) => f,
        };
        if self.config.early_drop && self.tree.pool.get(fcb).is_early_drop() {
            self.counters.early_dropped += 1;
            return None;
        }
        self.check_fcb_still_valid(fcb, now);
        Some(fcb)
    }

    /// A listed FCB past its deadline that shows up again means the flow
    /// id was reused: re-arm the timeout instead of trusting stale state.
    fn check_fcb_still_valid(&mut self, fcb: FcbId, now: Timestamp) {
        let f = self.tree.pool.get_mut(fcb);
        if f.count() == 0 && f.has_timeout() && f.timeout_passed(now) {
            let timeout_bits = f.flags >> TIMEOUT_SHIFT << TIMEOUT_SHIFT;
            f.flags = timeout_bits | FLAG_TIMEOUT | (f.flags & FLAG_TIMEOUT_INLIST);
        }
    }

    fn emit(&mut self, fcb: FcbId, batch: PacketBatch, now: Timestamp, out: &mut Vec<FlowBatch>) {
        let f = self.tree.pool.get_mut(fcb);
        if self.config.release {
            f.acquire(batch.count() as u32);
        }
        f.lastseen = now;
        out.push(FlowBatch { fcb, batch });
    }

    /// Order-preserving dispatch: extend the current run while the FCB
    /// matches, emit on change.
    fn push_batch_simple(
        &mut self,
        batch: PacketBatch,
        cpu: usize,
        now: Timestamp,
    ) -> Vec<FlowBatch> {
        let mut out = Vec::new();
        let mut awaiting: Option<(FcbId, PacketBatch)> = None;
        let mut lastagg = 0u32;
        let mut lastfcb = None;
        for p in batch {
            let found = self.get_fcb_for(&p, cpu, &mut lastagg, &mut lastfcb);
            let Some(fcb) = self.is_valid_fcb(found, now) else {
                continue;
            };
            match &mut awaiting {
                Some((cur, run)) if self.config.nocut || *cur == fcb => run.push(p),
                Some(_) => {
                    let (cur, run) = awaiting.take().expect("checked above");
                    self.emit(cur, run, now, &mut out);
                    awaiting = Some((fcb, PacketBatch::start_head(p)));
                }
                None => awaiting = Some((fcb, PacketBatch::start_head(p))),
            }
        }
        if let Some((cur, run)) = awaiting {
            self.emit(cur, run, now, &mut out);
        }
        out
    }

    /// Builder dispatch: reorder packets into same-FCB runs via a ring of
    /// pending sub-batches; a full ring forces the oldest out.
    fn push_batch_builder(
        &mut self,
        batch: PacketBatch,
        cpu: usize,
        now: Timestamp,
    ) -> Vec<FlowBatch> {
        let mut out = Vec::new();
        let mut ring: [Option<FlowBatch>; BUILDER_RING_SIZE] = std::array::from_fn(|_| None);
        let mut head = 0usize;
        let mut tail = 0usize;
        let mut curbatch: Option<usize> = None;
        let mut lastfcb: Option<FcbId> = None;
        let mut lastagg = 0u32;
        let mut lastmatch = None;

        for p in batch {
            let found = self.get_fcb_for(&p, cpu, &mut lastagg, &mut lastmatch);
            let Some(fcb) = self.is_valid_fcb(found, now) else {
                continue;
            };
            if (self.config.nocut && lastfcb.is_some()) || lastfcb == Some(fcb) {
                let slot = curbatch.expect("continuing a run implies a current batch");
                ring[slot].as_mut().expect("current batch is live").batch.push(p);
            } else {
                // Find a pending sub-batch of the same flow.
                let mut found_slot = None;
                for i in tail..head {
                    let slot = i % BUILDER_RING_SIZE;
                    if ring[slot].as_ref().is_some_and(|b| b.fcb == fcb) {
                        found_slot = Some(slot);
                        break;
                    }
                }
                let slot = match found_slot {
                    Some(slot) => {
                        ring[slot].as_mut().expect("found above").batch.push(p);
                        slot
                    }
                    None => {
                        let slot = head % BUILDER_RING_SIZE;
                        head += 1;
                        if tail % BUILDER_RING_SIZE == head % BUILDER_RING_SIZE {
                            // Ring full: the oldest sub-batch goes out now.
                            let old = ring[tail % BUILDER_RING_SIZE]
                                .take()
                                .expect("full ring slot is live");
                            self.counters.builder_forced_flush += 1;
                            debug!(
                                "builder ring full, emitting batch of {} packets early",
                                old.batch.count()
                            );
                            self.emit(old.fcb, old.batch, now, &mut out);
                            tail += 1;
                        }
                        ring[slot] = Some(FlowBatch {
                            fcb,
                            batch: PacketBatch::start_head(p),
                        });
                        slot
                    }
                };
                curbatch = Some(slot);
            }
            lastfcb = Some(fcb);
        }

        // Flush the ring in arrival order.
        while tail < head {
            if let Some(b) = ring[tail % BUILDER_RING_SIZE].take() {
                self.emit(b.fcb, b.batch, now, &mut out);
            }
            tail += 1;
        }
        out
    }

    /// Drop `n` references taken by dispatch. At zero the FCB either joins
    /// the timeout list (when it has a timeout armed) or is released from
    /// the tree immediately.
    pub fn release_fcb(&mut self, fcb: FcbId, n: u32, cpu: usize) {
        if !self.config.release {
            return;
        }
        if self.tree.pool.get_mut(fcb).release(n) {
            let flags = self.tree.pool.get(fcb).flags;
            if flags & FLAG_TIMEOUT != 0 {
                if flags & FLAG_TIMEOUT_INLIST == 0 {
                    self.release_later(cpu, fcb);
                }
            } else {
                self.do_release(cpu, fcb);
            }
        }
    }

    /// Put `fcb` on this thread's timeout list.
    fn release_later(&mut self, cpu: usize, fcb: FcbId) {
        let list = &mut self.cpus[cpu].old_flows;
        let f = self.tree.pool.get_mut(fcb);
        debug_assert!(f.flags & FLAG_TIMEOUT_INLIST == 0);
        f.next = list.head;
        f.flags |= FLAG_TIMEOUT_INLIST;
        list.head = Some(fcb);
        list.count += 1;
    }

    /// Walk the timeout list: detach re-referenced FCBs, release expired
    /// ones. Returns true when anything was detached or released.
    pub fn check_release(&mut self, cpu: usize, now: Timestamp) -> bool {
        let mut released = false;
        let mut prev: Option<FcbId> = None;
        let mut cur = self.cpus[cpu].old_flows.head;
        while let Some(id) = cur {
            let next = self.tree.pool.get(id).next;
            let count = self.tree.pool.get(id).count();
            if count > 0 {
                // Alive again; drop it from the list.
                released = true;
                self.unlink(cpu, prev, id, next);
                let f = self.tree.pool.get_mut(id);
                f.flags &= !FLAG_TIMEOUT_INLIST;
                f.next = None;
            } else if self.tree.pool.get(id).timeout_passed(now) {
                released = true;
                self.unlink(cpu, prev, id, next);
                self.tree.pool.get_mut(id).flags = 0;
                self.counters.timeout_released += 1;
                self.do_release(cpu, id);
            } else {
                prev = Some(id);
            }
            cur = next;
        }
        released
    }

    fn unlink(&mut self, cpu: usize, prev: Option<FcbId>, _id: FcbId, next: Option<FcbId>) {
        match prev {
            Some(p) => self.tree.pool.get_mut(p).next = next,
            None => self.cpus[cpu].old_flows.head = next,
        }
        self.cpus[cpu].old_flows.count -= 1;
    }

    /// Scan the timeout list when it outgrew its adaptive threshold,
    /// doubling the threshold on overflow and halving it when the list
    /// stays small.
    fn check_release_flows(&mut self, cpu: usize, now: Timestamp) {
        if !self.config.release {
            return;
        }
        let list = &self.cpus[cpu].old_flows;
        if list.count <= list.count_thresh {
            return;
        }
        debug!(
            "forced release: {} listed flows above threshold {}",
            list.count, list.count_thresh
        );
        self.check_release(cpu, now);
        let list = &mut self.cpus[cpu].old_flows;
        if list.count < list.count_thresh / 8 && list.count_thresh > DEFAULT_THRESH {
            list.count_thresh /= 2;
        } else {
            list.count_thresh *= 2;
        }
    }

    /// Periodic cleanup timer; call with the batch timestamp. Reschedules
    /// itself every `clean_timer_msec`.
    pub fn run_timer(&mut self, cpu: usize, now: Timestamp) {
        let Some(deadline) = self.timer_deadline else {
            return;
        };
        if now < deadline {
            return;
        }
        debug!("release timer");
        self.check_release(cpu, now);
        self.timer_deadline = Some(now.advanced(self.config.clean_timer_msec));
    }

    /// Idle-task hook: reap opportunistically, report whether work was
    /// done.
    pub fn run_idle_task(&mut self, cpu: usize, now: Timestamp) -> bool {
        if !self.config.release {
            return false;
        }
        self.check_release(cpu, now)
    }

    /// Release an FCB out of the tree: clear its cache entry, unlink it
    /// from its parent, then walk up releasing empty dynamic nodes,
    /// unsplicing drained growth tables on the way.
    fn do_release(&mut self, cpu: usize, fcb: FcbId) {
        if let Some(f) = self.tree.pool.get_mut(fcb).release_fnt.take() {
            f(self.tree.pool.get_mut(fcb));
        }
        if self.is_dynamic_cache_enabled() {
            self.remove_cache_fcb(cpu, fcb);
        }
        let Some(parent) = self.tree.pool.get(fcb).parent else {
            // Shared static FCB; nothing to unlink.
            self.tree.pool.release(cpu, fcb);
            return;
        };
        let data = self.tree.pool.get(fcb).node_data;
        let mut child = parent;
        self.tree.node_mut(child).remove(data);
        self.tree.pool.release(cpu, fcb);

        let mut data = self.tree.node(child).node_data;
        let mut parent = self.tree.node(child).parent;
        // Release empty dynamic ancestors up to the root.
        while let Some(pid) = parent {
            if !self.tree.node(pid).level.is_dynamic() || self.tree.node(child).num() != 0 {
                break;
            }
            let parent_growing = self.tree.node(pid).growing;
            let child_growing = self.tree.node(child).growing;
            let child_is_default =
                self.tree.node(pid).default == Some(EdgeTarget::Node(child));

            if parent_growing && !child_growing && child_is_default {
                // The non-growing default of a growing table is the
                // original table and must stay.
                break;
            }
            if child_growing {
                let Some(EdgeTarget::Node(subchild)) = self.tree.node(child).default else {
                    break;
                };
                if child_is_default {
                    // The drained replacement was the default path.
                    self.tree.node_mut(child).growing = false;
                    self.tree.node_mut(child).default = None;
                    self.tree.free(child);
                    self.tree.node_mut(pid).default = Some(EdgeTarget::Node(subchild));
                    self.tree.node_mut(subchild).parent = Some(pid);
                } else {
                    if parent_growing {
                        debug!("growing table under an unrelated growing table, keeping it");
                        break;
                    }
                    // Swap the drained replacement for its original table.
                    self.tree.node_mut(pid).remove(data);
                    self.tree.node_mut(child).default = None;
                    self.tree.free(child);
                    self.tree.set_edge(
                        pid,
                        crate::tree::SlotRef::Keyed(data),
                        EdgeTarget::Node(subchild),
                    );
                    break;
                }
            } else {
                // Plain empty per-key duplicate: unlink and free it with
                // its prototype chain.
                self.tree.node_mut(pid).remove(data);
                let def = self.tree.node_mut(child).default.take();
                self.tree.free(child);
                if let Some(proto) = def {
                    self.release_runtime_subtree(cpu, proto);
                }
            }
            child = pid;
            data = self.tree.node(child).node_data;
            parent = self.tree.node(child).parent;
        }
        if let Some(root) = self.root {
            self.tree.check(root);
        }
    }

    /// Free a runtime-duplicated prototype subtree, returning its leaves
    /// to the per-thread pool.
    fn release_runtime_subtree(&mut self, cpu: usize, target: EdgeTarget) {
        match target {
            EdgeTarget::Leaf(id) => {
                let f = self.tree.pool.get_mut(id);
                if f.count() > 0 {
                    f.release(f.count());
                }
                self.tree.pool.release(cpu, id);
            }
            EdgeTarget::Node(id) => {
                for edge in self.tree.node(id).edges() {
                    self.release_runtime_subtree(cpu, edge.target);
                }
                if let Some(def) = self.tree.node_mut(id).default.take() {
                    self.release_runtime_subtree(cpu, def);
                }
                self.tree.free(id);
            }
        }
    }

    /// Number of leaves currently reachable (all edges).
    #[must_use]
    pub fn leaves_count(&self) -> usize {
        let mut distinct = std::collections::HashSet::new();
        for edge in self.tree.leaf_edges(self.root(), true, true) {
            if let Some(EdgeTarget::Leaf(id)) = self.tree.edge_target(edge) {
                distinct.insert(id);
            }
        }
        distinct.len()
    }

    /// Number of leaves reachable through keyed edges only.
    #[must_use]
    pub fn active_leaves_count(&self) -> usize {
        let mut distinct = std::collections::HashSet::new();
        for edge in self.tree.leaf_edges(self.root(), true, false) {
            if let Some(EdgeTarget::Leaf(id)) = self.tree.edge_target(edge) {
                distinct.insert(id);
            }
        }
        distinct.len()
    }

    /// FCBs currently sitting on `cpu`'s timeout list.
    #[must_use]
    pub fn timeout_count(&self, cpu: usize) -> usize {
        self.cpus[cpu].old_flows.count
    }

    /// Render the runtime tree for inspection.
    #[must_use]
    pub fn print_tree(&self) -> String {
        self.tree.dump(self.root())
    }
}
