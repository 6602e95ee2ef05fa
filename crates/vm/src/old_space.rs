//! Old space: free-list managed storage for tenured objects.
//!
//! Old space is a set of chunks with three pieces of side metadata:
//!
//! - mark bits (one per word) used by the mark-sweep/mark-compact collector,
//! - object-start bits used to locate the object containing an arbitrary
//!   interior address during remembered-set replay and compaction,
//! - the remembered set: card addresses that may contain pointers into new
//!   space, fed by the write barrier and replayed at scavenge start.
//!
//! Free regions inside chunks are stamped with a filler word (a smi holding
//! the region size in bytes) so object iteration can skip them; a real
//! object always starts with a tagged class pointer, so the low bit
//! distinguishes the two.

use std::collections::{HashMap, HashSet};

use crate::object::HeapObject;
use crate::space::{Chunk, WeakCallback, WeakPointer};
use crate::value::{PointerVisitor, Value, WORD_SIZE};

/// Cards are the granularity of the remembered set.
pub const CARD_SIZE: usize = 128;

const FREE_LIST_BUCKETS: usize = 32;

/// Stamp a free region so object iteration can skip it.
fn write_filler(address: usize, size: usize) {
    debug_assert!(size >= WORD_SIZE && size % WORD_SIZE == 0);
    unsafe { *(address as *mut usize) = Value::from_smi(size as isize).raw() }
}

/// Size of the free region starting at a filler word, if it is one.
#[inline]
pub(crate) fn filler_size(word: usize) -> Option<usize> {
    let value = Value::from_raw(word);
    if value.is_smi() {
        Some(value.as_smi() as usize)
    } else {
        None
    }
}

/// Segregated free list: exact buckets for small regions, first-fit for the
/// rest.
struct FreeList {
    buckets: Vec<Vec<usize>>,
    large: Vec<(usize, usize)>,
}

impl FreeList {
    fn new() -> FreeList {
        FreeList {
            buckets: (0..FREE_LIST_BUCKETS).map(|_| Vec::new()).collect(),
            large: Vec::new(),
        }
    }

    fn add_region(&mut self, address: usize, size: usize) {
        debug_assert!(size >= WORD_SIZE && size % WORD_SIZE == 0);
        let words = size / WORD_SIZE;
        if words <= FREE_LIST_BUCKETS {
            self.buckets[words - 1].push(address);
        } else {
            self.large.push((address, size));
        }
    }

    /// Pop a region of at least `size` bytes; returns (address, region size).
    fn allocate(&mut self, size: usize) -> Option<(usize, usize)> {
        let words = size / WORD_SIZE;
        if words <= FREE_LIST_BUCKETS {
            for bucket in words..=FREE_LIST_BUCKETS {
                if let Some(address) = self.buckets[bucket - 1].pop() {
                    return Some((address, bucket * WORD_SIZE));
                }
            }
        }
        for i in 0..self.large.len() {
            if self.large[i].1 >= size {
                let (address, region) = self.large.swap_remove(i);
                return Some((address, region));
            }
        }
        None
    }

    fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.large.clear();
    }
}

/// Destination addresses for one compaction cycle: surviving objects packed
/// toward their chunk's start, in address order.
pub(crate) struct CompactionPlan {
    pub(crate) forwards: HashMap<usize, usize>,
    new_tops: Vec<usize>,
}

/// Rewrites pointers according to a compaction plan.
pub(crate) struct FixPointersVisitor<'a> {
    plan: &'a CompactionPlan,
}

impl<'a> FixPointersVisitor<'a> {
    pub(crate) fn new(plan: &'a CompactionPlan) -> FixPointersVisitor<'a> {
        FixPointersVisitor { plan }
    }
}

impl PointerVisitor for FixPointersVisitor<'_> {
    fn visit(&mut self, slot: &mut Value) {
        let value = *slot;
        if !value.is_heap_object() {
            return;
        }
        if let Some(&target) = self.plan.forwards.get(&value.address()) {
            *slot = Value::from_address(target);
        }
    }
}

struct NewSpaceScan<'a> {
    contains: &'a dyn Fn(usize) -> bool,
    found: bool,
}

impl PointerVisitor for NewSpaceScan<'_> {
    fn visit(&mut self, slot: &mut Value) {
        let value = *slot;
        if value.is_heap_object() && (self.contains)(value.address()) {
            self.found = true;
        }
    }
}

/// Free-list managed space for mature objects.
pub struct OldSpace {
    chunks: Vec<Chunk>,
    chunk_size: usize,
    free_list: FreeList,
    used: usize,
    used_after_last_gc: usize,
    allocation_budget: usize,
    compacting: bool,
    hard_limit_hit: bool,
    weak_pointers: Vec<WeakPointer>,
    remembered_set: HashSet<usize>,
}

impl OldSpace {
    pub fn new(chunk_size: usize, allocation_budget: usize) -> OldSpace {
        debug_assert!(chunk_size % WORD_SIZE == 0);
        OldSpace {
            chunks: Vec::new(),
            chunk_size,
            free_list: FreeList::new(),
            used: 0,
            used_after_last_gc: 0,
            allocation_budget,
            compacting: true,
            hard_limit_hit: false,
            weak_pointers: Vec::new(),
            remembered_set: HashSet::new(),
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn size(&self) -> usize {
        self.chunks.iter().map(|c| c.limit() - c.base()).sum()
    }

    pub fn used_after_last_gc(&self) -> usize {
        self.used_after_last_gc
    }

    pub(crate) fn set_used_after_last_gc(&mut self, used: usize) {
        self.used_after_last_gc = used;
    }

    pub fn allocation_budget(&self) -> usize {
        self.allocation_budget
    }

    pub fn set_allocation_budget(&mut self, budget: usize) {
        self.allocation_budget = budget;
    }

    /// Whether the last collection was a compacting one. The next collection
    /// does the opposite.
    pub fn compacting(&self) -> bool {
        self.compacting
    }

    pub(crate) fn set_compacting(&mut self, compacting: bool) {
        self.compacting = compacting;
    }

    pub(crate) fn clear_hard_limit_hit(&mut self) {
        self.hard_limit_hit = false;
    }

    /// Old-space GC is due when allocation approaches the budget or an
    /// allocation already failed against it.
    pub fn needs_garbage_collection(&self) -> bool {
        self.hard_limit_hit || self.used * 4 >= self.allocation_budget * 3
    }

    /// Widen the budget after a compaction that failed to make real
    /// progress, so the collector does not thrash.
    pub(crate) fn evaluate_pointlessness(&mut self) {
        if self.used_after_last_gc * 4 > self.allocation_budget * 3 {
            self.allocation_budget = self.allocation_budget.saturating_mul(2);
        }
    }

    pub fn contains(&self, address: usize) -> bool {
        self.chunks.iter().any(|c| c.contains(address))
    }

    /// Allocate `size` bytes from the free list or a chunk, or fail against
    /// the allocation budget.
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size % WORD_SIZE == 0 && size > 0);
        if let Some((address, region)) = self.free_list.allocate(size) {
            if region > size {
                write_filler(address + size, region - size);
                self.free_list.add_region(address + size, region - size);
            }
            self.used += size;
            self.set_start_bit(address);
            return Some(address);
        }
        if let Some(chunk) = self.chunks.last_mut() {
            if let Some(address) = chunk.allocate(size) {
                self.used += size;
                self.set_start_bit(address);
                return Some(address);
            }
        }
        if self.used + size > self.allocation_budget {
            self.hard_limit_hit = true;
            return None;
        }
        self.chunks.push(Chunk::new(self.chunk_size.max(size), true));
        let address = self
            .chunks
            .last_mut()
            .and_then(|chunk| chunk.allocate(size))
            .expect("fresh old-space chunk has room");
        self.used += size;
        self.set_start_bit(address);
        Some(address)
    }

    fn set_start_bit(&mut self, address: usize) {
        for chunk in &mut self.chunks {
            if chunk.contains(address) {
                chunk.set_start_bit(address);
                return;
            }
        }
        debug_assert!(false, "start bit outside old space");
    }

    /// Address of the last object start at or before `address`.
    pub(crate) fn object_start_at_or_before(&self, address: usize) -> Option<usize> {
        self.chunks
            .iter()
            .find(|c| c.contains(address))
            .and_then(|c| c.object_start_at_or_before(address))
    }

    /// Allocation top of the chunk containing `address`.
    pub(crate) fn chunk_top_for(&self, address: usize) -> Option<usize> {
        self.chunks.iter().find(|c| c.contains(address)).map(|c| c.top())
    }

    // Remembered set.

    /// Record the card containing a slot that now holds a new-space pointer.
    pub fn record_write(&mut self, slot_address: usize) {
        self.remembered_set.insert(slot_address & !(CARD_SIZE - 1));
    }

    /// Record every card intersecting `[start, end)`.
    pub(crate) fn record_cards_in_range(&mut self, start: usize, end: usize) {
        let mut card = start & !(CARD_SIZE - 1);
        while card < end {
            self.remembered_set.insert(card);
            card += CARD_SIZE;
        }
    }

    pub(crate) fn take_remembered_set(&mut self) -> Vec<usize> {
        self.remembered_set.drain().collect()
    }

    pub(crate) fn clear_remembered_set(&mut self) {
        self.remembered_set.clear();
    }

    /// Whether the card containing `slot_address` is recorded.
    pub fn remembered_set_contains(&self, slot_address: usize) -> bool {
        self.remembered_set
            .contains(&(slot_address & !(CARD_SIZE - 1)))
    }

    pub fn remembered_set_size(&self) -> usize {
        self.remembered_set.len()
    }

    // Marking.

    pub(crate) fn is_marked(&self, address: usize) -> bool {
        self.chunks
            .iter()
            .find(|c| c.contains(address))
            .map(|c| c.is_marked(address))
            .unwrap_or(false)
    }

    pub(crate) fn mark(&mut self, address: usize) -> bool {
        for chunk in &mut self.chunks {
            if chunk.contains(address) {
                return chunk.mark(address);
            }
        }
        false
    }

    pub fn clear_mark_bits(&mut self) {
        for chunk in &mut self.chunks {
            chunk.clear_mark_bits();
        }
    }

    /// Walk all objects in address order, skipping free regions.
    pub fn iterate_objects(&self, mut callback: impl FnMut(HeapObject)) {
        for chunk in &self.chunks {
            let mut cursor = chunk.base();
            while cursor < chunk.top() {
                let word = unsafe { *(cursor as *const usize) };
                if let Some(size) = filler_size(word) {
                    cursor += size;
                    continue;
                }
                let object = HeapObject::from_address(cursor);
                let size = object.size();
                callback(object);
                cursor += size;
            }
        }
    }

    // Weak pointers.

    pub fn register_weak_pointer(&mut self, object: HeapObject, callback: WeakCallback) {
        self.weak_pointers.push(WeakPointer { object, callback });
    }

    pub(crate) fn push_weak_pointer(&mut self, weak: WeakPointer) {
        self.weak_pointers.push(weak);
    }

    /// Run dead-object callbacks and drop their entries. Liveness comes from
    /// the mark bits, so this must run after marking and, when compacting,
    /// before objects move.
    pub(crate) fn process_weak_pointers(&mut self) {
        let mut kept = Vec::new();
        for mut weak in std::mem::take(&mut self.weak_pointers) {
            if self.is_marked(weak.object.address()) {
                kept.push(weak);
            } else {
                (weak.callback)(weak.object);
            }
        }
        self.weak_pointers = kept;
    }

    pub(crate) fn update_weak_pointers_after_compaction(&mut self, plan: &CompactionPlan) {
        for weak in &mut self.weak_pointers {
            if let Some(&target) = plan.forwards.get(&weak.object.address()) {
                weak.object = HeapObject::from_address(target);
            }
        }
    }

    // Sweeping.

    /// Rebuild the free list from dead regions, leaving live objects in
    /// place. Returns the bytes still in use.
    pub(crate) fn sweep(&mut self) -> usize {
        self.free_list.clear();
        let mut used = 0;
        for chunk in &mut self.chunks {
            chunk.clear_start_bits();
            let top = chunk.top();
            let mut cursor = chunk.base();
            let mut free_start: Option<usize> = None;
            let mut regions: Vec<(usize, usize)> = Vec::new();
            while cursor < top {
                let word = unsafe { *(cursor as *const usize) };
                if let Some(size) = filler_size(word) {
                    free_start.get_or_insert(cursor);
                    cursor += size;
                    continue;
                }
                let object = HeapObject::from_address(cursor);
                let size = object.size();
                if chunk.is_marked(cursor) {
                    if let Some(start) = free_start.take() {
                        regions.push((start, cursor - start));
                    }
                    chunk.set_start_bit(cursor);
                    used += size;
                } else {
                    free_start.get_or_insert(cursor);
                }
                cursor += size;
            }
            if let Some(start) = free_start.take() {
                regions.push((start, top - start));
            }
            for (start, size) in regions {
                write_filler(start, size);
                self.free_list.add_region(start, size);
            }
            chunk.clear_mark_bits();
        }
        self.used = used;
        used
    }

    // Compaction.

    /// Compute destination addresses: pack surviving objects toward each
    /// chunk's start, preserving address order.
    pub(crate) fn compute_compaction_plan(&self) -> CompactionPlan {
        let mut forwards = HashMap::new();
        let mut new_tops = Vec::new();
        for chunk in &self.chunks {
            let mut dest = chunk.base();
            let mut cursor = chunk.base();
            while cursor < chunk.top() {
                let word = unsafe { *(cursor as *const usize) };
                if let Some(size) = filler_size(word) {
                    cursor += size;
                    continue;
                }
                let object = HeapObject::from_address(cursor);
                let size = object.size();
                if chunk.is_marked(cursor) {
                    forwards.insert(cursor, dest);
                    dest += size;
                }
                cursor += size;
            }
            new_tops.push(dest);
        }
        CompactionPlan { forwards, new_tops }
    }

    /// Move objects to their planned destinations. Pointers everywhere must
    /// already have been rewritten with [`FixPointersVisitor`]. Rebuilds
    /// object starts, the remembered set, and zeroes freed chunk tails.
    pub(crate) fn compact(&mut self, plan: &CompactionPlan, new_space_contains: &dyn Fn(usize) -> bool) {
        self.free_list.clear();
        self.remembered_set.clear();
        let mut used = 0;
        let mut card_ranges: Vec<(usize, usize)> = Vec::new();
        let mut free_regions: Vec<(usize, usize)> = Vec::new();
        for (i, chunk) in self.chunks.iter_mut().enumerate() {
            chunk.clear_start_bits();
            let old_top = chunk.top();
            let mut cursor = chunk.base();
            while cursor < old_top {
                let word = unsafe { *(cursor as *const usize) };
                if let Some(size) = filler_size(word) {
                    cursor += size;
                    continue;
                }
                let object = HeapObject::from_address(cursor);
                let size = object.size();
                if let Some(&dest) = plan.forwards.get(&cursor) {
                    unsafe {
                        std::ptr::copy(cursor as *const u8, dest as *mut u8, size);
                    }
                    chunk.set_start_bit(dest);
                    let moved = HeapObject::from_address(dest);
                    let mut scan = NewSpaceScan {
                        contains: new_space_contains,
                        found: false,
                    };
                    moved.iterate_pointers(&mut scan);
                    if scan.found {
                        card_ranges.push((dest, dest + size));
                    }
                    used += size;
                }
                cursor += size;
            }
            // Zero the freed tail and hand the whole chunk end to the free
            // list, stamped as one region so iteration can skip it.
            let new_top = plan.new_tops[i];
            let limit = chunk.limit();
            chunk.zero_range(new_top, old_top);
            chunk.set_top(limit);
            chunk.clear_mark_bits();
            if new_top < limit {
                write_filler(new_top, limit - new_top);
                free_regions.push((new_top, limit - new_top));
            }
        }
        for (start, size) in free_regions {
            self.free_list.add_region(start, size);
        }
        for (start, end) in card_ranges {
            self.record_cards_in_range(start, end);
        }
        self.used = used;
    }

    /// Recompute `used` without collecting; only used by validation walks.
    pub fn compute_used(&self) -> usize {
        let mut used = 0;
        self.iterate_objects(|object| used += object.size());
        used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_list_buckets_and_split() {
        let mut list = FreeList::new();
        list.add_region(0x1000, 4 * WORD_SIZE);
        let (address, region) = list.allocate(2 * WORD_SIZE).unwrap();
        assert_eq!(address, 0x1000);
        assert_eq!(region, 4 * WORD_SIZE);
        assert!(list.allocate(WORD_SIZE).is_none());
    }

    #[test]
    fn test_free_list_large_regions() {
        let mut list = FreeList::new();
        list.add_region(0x2000, 64 * WORD_SIZE);
        let (address, region) = list.allocate(40 * WORD_SIZE).unwrap();
        assert_eq!(address, 0x2000);
        assert_eq!(region, 64 * WORD_SIZE);
    }

    #[test]
    fn test_allocation_respects_budget() {
        let mut space = OldSpace::new(1024, 1024);
        assert!(space.allocate(512).is_some());
        assert!(space.allocate(512).is_some());
        assert!(space.allocate(WORD_SIZE).is_none());
        assert!(space.needs_garbage_collection());
    }

    #[test]
    fn test_remembered_set_cards() {
        let mut space = OldSpace::new(1024, 4096);
        space.record_write(0x12345);
        assert!(space.remembered_set_contains(0x12345));
        assert!(space.remembered_set_contains(0x12300));
        assert!(!space.remembered_set_contains(0x12400));
        space.record_write(0x12345 + 8);
        assert_eq!(space.remembered_set_size(), 1);
    }
}
