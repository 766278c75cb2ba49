//! Aggregate→FCB cache.
//!
//! A per-thread associative cache keyed by the 32-bit aggregate annotation.
//! Buckets are rings of `ring_size` entries probed linearly; the hash is
//! `(agg ^ (agg >> 16)) & (cache_size - 1)`. Aggregate zero is a sentinel
//! ("unclassified") and never enters the cache. The cache never owns an
//! FCB: entries are cleared when their FCB is released.

use crate::fcb::FcbId;

/// One cache slot.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheEntry {
    /// Aggregate key; zero marks an empty slot.
    pub agg: u32,
    /// Cached FCB.
    pub fcb: Option<FcbId>,
}

/// Result of probing a bucket ring.
#[derive(Clone, Copy, Debug)]
pub enum Probe {
    /// A slot carries this aggregate; the caller must still reverse-match.
    Candidate(usize, FcbId),
    /// First empty slot of the ring.
    Empty(usize),
    /// Every slot is live with other aggregates.
    Full,
}

/// Per-thread aggregate cache.
#[derive(Debug)]
pub struct AggregateCache {
    slots: Vec<CacheEntry>,
    mask: u32,
    ring_size: usize,
}

impl AggregateCache {
    /// A cache of `cache_size` buckets (power of two) of `ring_size` slots.
    ///
    /// # Panics
    ///
    /// Panics when `cache_size` is not a power of two.
    #[must_use]
    pub fn new(cache_size: usize, ring_size: usize) -> Self {
        assert!(
            cache_size.is_power_of_two(),
            "cache size must be a power of 2"
        );
        Self {
            slots: vec![CacheEntry::default(); cache_size * ring_size],
            mask: cache_size as u32 - 1,
            ring_size,
        }
    }

    fn bucket(&self, agg: u32) -> usize {
        let hash = (agg ^ (agg >> 16)) & self.mask;
        hash as usize * self.ring_size
    }

    /// Probe the ring for `agg`.
    #[must_use]
    pub fn probe(&self, agg: u32) -> Probe {
        debug_assert_ne!(agg, 0, "aggregate 0 bypasses the cache");
        let base = self.bucket(agg);
        for i in 0..self.ring_size {
            let entry = self.slots[base + i];
            if entry.agg == 0 {
                return Probe::Empty(base + i);
            }
            if entry.agg == agg {
                if let Some(fcb) = entry.fcb {
                    return Probe::Candidate(base + i, fcb);
                }
            }
        }
        Probe::Full
    }

    /// Store `(agg, fcb)` at `slot` (a value returned by [`Self::probe`]).
    pub fn insert_at(&mut self, slot: usize, agg: u32, fcb: FcbId) {
        self.slots[slot] = CacheEntry {
            agg,
            fcb: Some(fcb),
        };
    }

    /// Pick the eviction victim in `agg`'s ring: the entry whose FCB was
    /// seen longest ago, decided by `lastseen`. The survivor in slot 0
    /// moves into the victim's place and slot 0 is handed back for the
    /// new entry, so the ring keeps rotating through its slots.
    pub fn evict_oldest(&mut self, agg: u32, lastseen: impl Fn(FcbId) -> u64) -> usize {
        let base = self.bucket(agg);
        let mut oldest = 0usize;
        let mut oldest_seen = u64::MAX;
        for i in 0..self.ring_size {
            if let Some(fcb) = self.slots[base + i].fcb {
                let seen = lastseen(fcb);
                if seen < oldest_seen {
                    oldest_seen = seen;
                    oldest = i;
                }
            }
        }
        if oldest != 0 {
            self.slots[base + oldest] = self.slots[base];
        }
        base
    }

    /// Remove the entry for `(agg, fcb)`, swapping the last live ring slot
    /// into its place. Returns true when the entry was present.
    pub fn remove(&mut self, agg: u32, fcb: FcbId) -> bool {
        if agg == 0 {
            return false;
        }
        let base = self.bucket(agg);
        for i in 0..self.ring_size {
            let entry = self.slots[base + i];
            if entry.agg == agg && entry.fcb == Some(fcb) {
                let mut last = self.ring_size - 1;
                while last > 0 && self.slots[base + last].agg == 0 {
                    last -= 1;
                }
                self.slots[base + i] = self.slots[base + last];
                self.slots[base + last] = CacheEntry::default();
                return true;
            }
        }
        false
    }

    /// Count the live entries carrying `fcb` (test instrumentation).
    #[must_use]
    pub fn find(&self, fcb: FcbId) -> usize {
        self.slots
            .iter()
            .filter(|e| e.agg != 0 && e.fcb == Some(fcb))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_miss_then_hit() {
        let mut cache = AggregateCache::new(16, 4);
        let agg = 0xDEAD_BEEF;
        let Probe::Empty(slot) = cache.probe(agg) else {
            panic!("expected empty slot");
        };
        cache.insert_at(slot, agg, FcbId(7));
        match cache.probe(agg) {
            Probe::Candidate(_, fcb) => assert_eq!(fcb, FcbId(7)),
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[test]
    fn remove_swaps_with_last_live_slot() {
        let mut cache = AggregateCache::new(1, 4);
        // Three aggregates hashing into the single bucket.
        for (i, agg) in [1u32, 2, 3].iter().enumerate() {
            cache.insert_at(i, *agg, FcbId(*agg));
        }
        assert!(cache.remove(1, FcbId(1)));
        assert_eq!(cache.find(FcbId(1)), 0);
        // 3 moved into the vacated slot.
        match cache.probe(3) {
            Probe::Candidate(slot, _) => assert_eq!(slot, 0),
            other => panic!("expected candidate, got {other:?}"),
        }
    }
}
