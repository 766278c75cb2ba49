//! FCB pool: slab storage plus per-thread free lists.
//!
//! All FCBs of one classification tree share a single payload size, fixed
//! when the context manager sums its elements' reservations. Build-phase
//! FCBs are allocated individually at double size (payload + shadow mask);
//! runtime FCBs are recycled through per-thread free lists so allocation
//! never crosses threads.

use crate::fcb::{FcbId, FlowControlBlock};
use crate::utils::ThreadSet;

/// How many runtime FCBs a thread list grows by when it runs dry.
const POOL_CHUNK: usize = 32;

/// Slab of FCBs with per-thread recycling.
#[derive(Debug, Default)]
pub struct FcbPool {
    slots: Vec<Option<FlowControlBlock>>,
    free_slots: Vec<FcbId>,
    lists: Vec<Vec<FcbId>>,
    data_size: usize,
}

impl FcbPool {
    /// A pool of FCBs carrying `data_size` payload bytes each.
    #[must_use]
    pub fn new(data_size: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            lists: vec![Vec::new()],
            data_size,
        }
    }

    /// Payload size of every FCB in this pool.
    #[must_use]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Number of live FCBs.
    #[must_use]
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
            - self.lists.iter().map(Vec::len).sum::<usize>()
    }

    fn store(&mut self, fcb: FlowControlBlock) -> FcbId {
        if let Some(id) = self.free_slots.pop() {
            self.slots[id.0 as usize] = Some(fcb);
            id
        } else {
            let id = FcbId(self.slots.len() as u32);
            self.slots.push(Some(fcb));
            id
        }
    }

    /// Allocate a build-phase FCB (double size, individually owned).
    pub fn init_allocate(&mut self) -> FcbId {
        let fcb = FlowControlBlock::new_build(self.data_size);
        self.store(fcb)
    }

    /// Free a build-phase FCB outright.
    pub fn init_release(&mut self, id: FcbId) {
        debug_assert!(self.slots[id.0 as usize].is_some());
        self.slots[id.0 as usize] = None;
        self.free_slots.push(id);
    }

    /// Allocate a runtime FCB from `cpu`'s free list, refilling it from the
    /// slab when dry.
    pub fn allocate(&mut self, cpu: usize) -> FcbId {
        self.ensure_cpu(cpu);
        if self.lists[cpu].is_empty() {
            for _ in 0..POOL_CHUNK {
                let fcb = FlowControlBlock::new_runtime(self.data_size);
                let id = self.store(fcb);
                self.lists[cpu].push(id);
            }
        }
        let id = self.lists[cpu].pop().expect("refilled above");
        id
    }

    /// Return a runtime FCB to `cpu`'s free list, zeroing its state for
    /// reuse.
    pub fn release(&mut self, cpu: usize, id: FcbId) {
        self.ensure_cpu(cpu);
        let slot = self.slots[id.0 as usize]
            .as_mut()
            .expect("released FCB must be live");
        debug_assert_eq!(slot.count(), 0, "FCB released while referenced");
        *slot = FlowControlBlock::new_runtime(self.data_size);
        self.lists[cpu].push(id);
    }

    /// Restrict the per-thread lists to the active thread set, priming each
    /// active thread with a chunk of ready FCBs.
    pub fn compress(&mut self, threads: &ThreadSet) {
        let want = threads.len().max(1);
        // Recycle lists owned by now-inactive threads.
        for (cpu, list) in self.lists.iter_mut().enumerate() {
            if cpu >= want || !threads.contains(cpu) {
                self.free_slots.append(list);
            }
        }
        self.lists.resize(want, Vec::new());
        for cpu in threads.iter() {
            if self.lists[cpu].is_empty() {
                for _ in 0..POOL_CHUNK {
                    let fcb = FlowControlBlock::new_runtime(self.data_size);
                    let id = self.store(fcb);
                    self.lists[cpu].push(id);
                }
            }
        }
    }

    fn ensure_cpu(&mut self, cpu: usize) {
        if cpu >= self.lists.len() {
            self.lists.resize(cpu + 1, Vec::new());
        }
    }

    /// Borrow an FCB.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not reference a live FCB.
    #[must_use]
    pub fn get(&self, id: FcbId) -> &FlowControlBlock {
        self.slots[id.0 as usize].as_ref().expect("live FCB")
    }

    /// Mutably borrow an FCB.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not reference a live FCB.
    pub fn get_mut(&mut self, id: FcbId) -> &mut FlowControlBlock {
        self.slots[id.0 as usize].as_mut().expect("live FCB")
    }

    /// True if `id` currently references a live FCB.
    #[must_use]
    pub fn contains(&self, id: FcbId) -> bool {
        self.slots
            .get(id.0 as usize)
            .is_some_and(Option::is_some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_release_recycles_slots() {
        let mut pool = FcbPool::new(16);
        let a = pool.allocate(0);
        pool.get_mut(a).data_mut()[3] = 9;
        pool.release(0, a);
        let b = pool.allocate(0);
        // Slot is recycled and its payload zeroed.
        assert_eq!(b, a);
        assert_eq!(pool.get(b).data()[3], 0);
    }

    #[test]
    fn compress_primes_active_threads() {
        let mut pool = FcbPool::new(8);
        let threads = ThreadSet::all(2);
        pool.compress(&threads);
        let a = pool.allocate(0);
        let b = pool.allocate(1);
        assert_ne!(a, b);
    }
}
