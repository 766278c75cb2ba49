//! Flow control blocks: the per-flow state owned by classification leaves.
//!
//! An FCB is a fixed-size byte region shared by every element on the path
//! that classified the flow. Elements reserve byte ranges at configure time
//! and read/write their slice at packet time. During tree construction each
//! FCB is allocated at *double* size: the second half is a shadow mask
//! recording which payload bytes have been assigned, so conflicting
//! sub-paths are detected when rules merge (see [`FlowControlBlock::combine_data`]).
//! After leaf replacement FCBs come from the pool at their runtime size and
//! the shadow mask is gone.

use crate::node::NodeId;
use crate::utils::Timestamp;
use anyhow::{Result, bail};
use std::sync::Arc;

/// Index of an FCB inside its pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FcbId(pub(crate) u32);

impl FcbId {
    /// Underlying slot index, for debugging.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Flag: packets classified to this leaf are dropped before dispatch.
pub const FLAG_EARLY_DROP: u32 = 1 << 0;
/// Flag: the FCB wants timeout handling.
pub const FLAG_TIMEOUT: u32 = 1 << 1;
/// Flag: the FCB currently sits on a per-thread timeout list.
pub const FLAG_TIMEOUT_INLIST: u32 = 1 << 2;
/// The FCB timeout in milliseconds lives in the flag bits above this shift.
pub const TIMEOUT_SHIFT: u32 = 16;

/// Callback invoked when an FCB's use count drops to zero.
pub type ReleaseFn = Arc<dyn Fn(&mut FlowControlBlock) + Send + Sync>;

/// Per-flow state block. See the module docs for the build/run lifecycle.
#[derive(Clone)]
pub struct FlowControlBlock {
    /// The key value on the edge that leads to this leaf.
    pub node_data: u64,
    /// The node whose edge currently stores this leaf. `None` once the FCB
    /// is shared by several parents after de-duplication.
    pub parent: Option<NodeId>,
    /// Early-drop / timeout flags plus the timeout value.
    pub flags: u32,
    /// Last time a packet of this flow was dispatched.
    pub lastseen: Timestamp,
    /// Intrusive link for the per-thread timeout list.
    pub next: Option<FcbId>,
    /// Aggregate value under which this FCB sits in the cache (0 = none).
    pub cache_agg: u32,
    use_count: u32,
    data: Vec<u8>,
    data_size: usize,
    build: bool,
    /// Name of the element whose rule produced this leaf, for conflict
    /// reporting during merges.
    pub origin: Option<String>,
    /// `keep` rules: this leaf survives overlapping rules without a
    /// warning and is never overwritten by a later rule.
    pub keep: bool,
    /// Invoked exactly once when the use count reaches zero.
    pub release_fnt: Option<ReleaseFn>,
}

impl std::fmt::Debug for FlowControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowControlBlock")
            .field("node_data", &self.node_data)
            .field("parent", &self.parent)
            .field("flags", &self.flags)
            .field("use_count", &self.use_count)
            .field("data", &&self.data[..self.data_size.min(16)])
            .finish_non_exhaustive()
    }
}

impl FlowControlBlock {
    /// A build-phase FCB: payload plus shadow mask, both zeroed.
    #[must_use]
    pub fn new_build(data_size: usize) -> Self {
        Self {
            node_data: 0,
            parent: None,
            flags: 0,
            lastseen: Timestamp::default(),
            next: None,
            cache_agg: 0,
            use_count: 0,
            data: vec![0; data_size * 2],
            data_size,
            build: true,
            origin: None,
            keep: false,
            release_fnt: None,
        }
    }

    /// A runtime FCB sized for the pool, without a shadow mask.
    #[must_use]
    pub fn new_runtime(data_size: usize) -> Self {
        let mut fcb = Self::new_build(data_size);
        fcb.data = vec![0; data_size];
        fcb.build = false;
        fcb
    }

    /// True while this FCB carries its build-phase shadow mask.
    #[must_use]
    pub fn is_build(&self) -> bool {
        self.build
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// The payload slice.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.data_size]
    }

    /// Mutable payload slice.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.data_size]
    }

    /// The shadow mask slice (build FCBs only).
    #[must_use]
    pub fn mask(&self) -> &[u8] {
        debug_assert!(self.build);
        &self.data[self.data_size..]
    }

    /// Write `bytes` at `offset` in the payload and mark them assigned in
    /// the shadow mask.
    ///
    /// # Panics
    ///
    /// Panics on a non-build FCB or an out-of-range write.
    pub fn write_data(&mut self, offset: usize, bytes: &[u8]) {
        assert!(self.build, "write_data is a build-phase operation");
        assert!(offset + bytes.len() <= self.data_size);
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        for i in offset..offset + bytes.len() {
            self.data[self.data_size + i] = 0xFF;
        }
    }

    /// Merge `other`'s payload into this one under the payload conflict
    /// rule: for each byte, an unassigned side yields to the assigned one,
    /// and two assigned sides must agree.
    ///
    /// # Errors
    ///
    /// Fails when both sides assigned a byte to different values — a user
    /// configuration bug that would mean undefined behaviour at runtime.
    /// The error names both producing elements.
    pub fn combine_data(&mut self, other: &FlowControlBlock) -> Result<()> {
        debug_assert!(self.build && other.build);
        debug_assert_eq!(self.data_size, other.data_size);
        let size = self.data_size;
        for i in 0..size {
            if other.data[size + i] == 0 {
                continue;
            }
            if self.data[size + i] == 0 {
                self.data[i] = other.data[i];
                self.data[size + i] = 0xFF;
            } else if self.data[i] != other.data[i] {
                bail!(
                    "conflicting classification: {} and {} assign different values \
                     ({:#04x}, {:#04x}) to flow byte {}; the two paths accept the \
                     same packets with contradictory per-flow state",
                    self.origin.as_deref().unwrap_or("<unknown element>"),
                    other.origin.as_deref().unwrap_or("<unknown element>"),
                    self.data[i],
                    other.data[i],
                    i,
                );
            }
        }
        Ok(())
    }

    /// True when no payload byte has been assigned.
    #[must_use]
    pub fn is_empty_data(&self) -> bool {
        self.data[..self.data_size].iter().all(|&b| b == 0)
    }

    /// Current use count.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.use_count
    }

    /// Take `n` references.
    pub fn acquire(&mut self, n: u32) {
        self.use_count += n;
    }

    /// Drop `n` references; returns true when the count reaches zero.
    ///
    /// # Panics
    ///
    /// Panics on releasing more references than held.
    pub fn release(&mut self, n: u32) -> bool {
        assert!(self.use_count >= n, "FCB released below zero");
        self.use_count -= n;
        self.use_count == 0
    }

    /// Force the use count (used when swapping build FCBs for pool ones).
    pub fn reset_count(&mut self, n: u32) {
        self.use_count = n;
    }

    /// True if packets of this flow are dropped before dispatch.
    #[must_use]
    pub fn is_early_drop(&self) -> bool {
        self.flags & FLAG_EARLY_DROP != 0
    }

    /// Set or clear the early-drop flag.
    pub fn set_early_drop(&mut self, drop: bool) {
        if drop {
            self.flags |= FLAG_EARLY_DROP;
        } else {
            self.flags &= !FLAG_EARLY_DROP;
        }
    }

    /// True if this FCB participates in timeout handling.
    #[must_use]
    pub fn has_timeout(&self) -> bool {
        self.flags & FLAG_TIMEOUT != 0
    }

    /// The timeout in milliseconds (zero when none).
    #[must_use]
    pub fn timeout_msec(&self) -> u64 {
        u64::from(self.flags >> TIMEOUT_SHIFT)
    }

    /// Arm a timeout of `ms` milliseconds (capped to the flag field).
    pub fn set_timeout(&mut self, ms: u32) {
        let capped = ms.min((1 << (32 - TIMEOUT_SHIFT)) - 1);
        self.flags = (self.flags & ((1 << TIMEOUT_SHIFT) - 1)) | (capped << TIMEOUT_SHIFT);
        if capped > 0 {
            self.flags |= FLAG_TIMEOUT;
        }
    }

    /// True once `lastseen + timeout` is in the past.
    #[must_use]
    pub fn timeout_passed(&self, now: Timestamp) -> bool {
        now.since(self.lastseen) > self.timeout_msec()
    }

    /// Key for leaf de-duplication: two static leaves with equal flags and
    /// byte-equal payload resolve to one pool FCB.
    #[must_use]
    pub fn dedup_key(&self) -> (u32, Vec<u8>) {
        (
            self.flags,
            self.data[..self.data_size].to_vec(),
        )
    }

    /// Deep copy with a fresh use count, keeping payload, mask and flags.
    #[must_use]
    pub fn duplicate(&self, use_count: u32) -> Self {
        let mut copy = self.clone();
        copy.use_count = use_count;
        copy.parent = None;
        copy.next = None;
        copy.cache_agg = 0;
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_takes_assigned_bytes() {
        let mut a = FlowControlBlock::new_build(8);
        let mut b = FlowControlBlock::new_build(8);
        a.write_data(0, &[0x11]);
        b.write_data(4, &[0x22]);
        a.combine_data(&b).unwrap();
        assert_eq!(a.data()[0], 0x11);
        assert_eq!(a.data()[4], 0x22);
        assert_eq!(a.mask()[4], 0xFF);
    }

    #[test]
    fn combine_conflict_names_both_elements() {
        let mut a = FlowControlBlock::new_build(8);
        let mut b = FlowControlBlock::new_build(8);
        a.origin = Some("tcp_state".to_string());
        b.origin = Some("nat".to_string());
        a.write_data(4, &[0x01]);
        b.write_data(4, &[0x02]);
        let err = a.combine_data(&b).unwrap_err().to_string();
        assert!(err.contains("tcp_state"), "{err}");
        assert!(err.contains("nat"), "{err}");
    }

    #[test]
    fn timeout_round_trips_through_flags() {
        let mut fcb = FlowControlBlock::new_build(4);
        fcb.set_timeout(250);
        assert!(fcb.has_timeout());
        assert_eq!(fcb.timeout_msec(), 250);
        fcb.lastseen = Timestamp::from_msec(1000);
        assert!(!fcb.timeout_passed(Timestamp::from_msec(1200)));
        assert!(fcb.timeout_passed(Timestamp::from_msec(1300)));
    }
}
