//! Copying collectors.
//!
//! [`scavenge_new_space`] is the generational new-space collector: a
//! stop-the-world Cheney scavenge that copies survivors into the standby
//! semispace and promotes objects past the tenure age into old space. The
//! grey queue spans both destinations: unscanned to-space objects and a
//! worklist of freshly promoted old-space objects.
//!
//! [`ProgramScavenger`] is the simpler copying pass over the immutable
//! program space, used by the program collector after stacks are cooked.

use crate::heap::TwoSpaceHeap;
use crate::object::HeapObject;
use crate::old_space::{filler_size, OldSpace, CARD_SIZE};
use crate::space::SemiSpace;
use crate::value::{PointerVisitor, Value};

/// Scavenge survivals after which an object is promoted to old space.
pub(crate) const TENURE_AGE: usize = 2;

/// What the scavenge learned for the caller's old-GC decision.
pub(crate) struct ScavengeOutcome {
    pub trigger_old_space_gc: bool,
    pub promoted_bytes: usize,
}

struct Scavenger<'a> {
    from_ranges: Vec<(usize, usize)>,
    to: &'a mut SemiSpace,
    old: &'a mut OldSpace,
    scan_chunk: usize,
    scan_address: usize,
    promoted: Vec<HeapObject>,
    promoted_bytes: usize,
    trigger_old_space_gc: bool,
    // Set when a visited slot ends up pointing into to-space; reset per
    // card and per promoted object to decide remembered-set membership.
    found_new_space_pointer: bool,
}

impl<'a> Scavenger<'a> {
    fn new(
        from_ranges: Vec<(usize, usize)>,
        to: &'a mut SemiSpace,
        old: &'a mut OldSpace,
    ) -> Scavenger<'a> {
        Scavenger {
            from_ranges,
            to,
            old,
            scan_chunk: 0,
            scan_address: 0,
            promoted: Vec::new(),
            promoted_bytes: 0,
            trigger_old_space_gc: false,
            found_new_space_pointer: false,
        }
    }

    #[inline]
    fn in_from_space(&self, address: usize) -> bool {
        self.from_ranges
            .iter()
            .any(|&(base, top)| address >= base && address < top)
    }

    fn copy_object(&mut self, object: HeapObject) -> HeapObject {
        let size = object.size();
        let age = object.age();
        if age >= TENURE_AGE {
            if let Some(address) = self.old.allocate(size) {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        object.address() as *const u8,
                        address as *mut u8,
                        size,
                    );
                }
                let target = HeapObject::from_address(address);
                object.forward_to(target);
                self.promoted.push(target);
                self.promoted_bytes += size;
                return target;
            }
            // Old space is full; fall back to to-space and ask for an
            // old-space collection.
            self.trigger_old_space_gc = true;
        }
        let address = self
            .to
            .allocate(size)
            .expect("to-space allocation inside scavenge");
        unsafe {
            std::ptr::copy_nonoverlapping(object.address() as *const u8, address as *mut u8, size);
        }
        let target = HeapObject::from_address(address);
        target.set_age(age + 1);
        object.forward_to(target);
        target
    }

    /// Replay one remembered-set generation: for each card, scan the objects
    /// intersecting it and drop the card unless it still holds new-space
    /// pointers afterwards.
    fn process_remembered_set(&mut self) {
        let cards = self.old.take_remembered_set();
        for card in cards {
            let Some(start) = self.old.object_start_at_or_before(card) else {
                continue;
            };
            let Some(top) = self.old.chunk_top_for(card) else {
                continue;
            };
            let end = (card + CARD_SIZE).min(top);
            self.found_new_space_pointer = false;
            let mut cursor = start;
            while cursor < end {
                let word = unsafe { *(cursor as *const usize) };
                if let Some(size) = filler_size(word) {
                    cursor += size;
                    continue;
                }
                let object = HeapObject::from_address(cursor);
                let size = object.size();
                object.iterate_pointers(self);
                cursor += size;
            }
            if self.found_new_space_pointer {
                self.old.record_cards_in_range(start, cursor);
            }
        }
    }

    fn next_unscanned_to_object(&mut self) -> Option<HeapObject> {
        loop {
            if self.scan_chunk >= self.to.chunk_count() {
                return None;
            }
            let (base, top) = self.to.chunk_span(self.scan_chunk);
            if self.scan_address < base {
                self.scan_address = base;
            }
            if self.scan_address < top {
                let object = HeapObject::from_address(self.scan_address);
                self.scan_address += object.size();
                return Some(object);
            }
            if self.scan_chunk + 1 < self.to.chunk_count() {
                self.scan_chunk += 1;
                self.scan_address = 0;
            } else {
                return None;
            }
        }
    }

    /// Drain the grey queue: unscanned to-space objects and promoted
    /// old-space objects, until neither produces more work.
    fn process_grey(&mut self) {
        loop {
            let mut found_work = false;
            while let Some(object) = self.next_unscanned_to_object() {
                found_work = true;
                object.iterate_pointers(self);
            }
            while let Some(object) = self.promoted.pop() {
                found_work = true;
                self.found_new_space_pointer = false;
                object.iterate_pointers(self);
                if self.found_new_space_pointer {
                    let start = object.address();
                    self.old.record_cards_in_range(start, start + object.size());
                }
            }
            if !found_work {
                return;
            }
        }
    }
}

impl PointerVisitor for Scavenger<'_> {
    fn visit(&mut self, slot: &mut Value) {
        let value = *slot;
        if !value.is_heap_object() {
            return;
        }
        let address = value.address();
        if !self.in_from_space(address) {
            if self.to.contains(address) {
                self.found_new_space_pointer = true;
            }
            return;
        }
        let object = HeapObject::from_value(value);
        let target = if object.is_forwarded() {
            object.forwarding_target()
        } else {
            self.copy_object(object)
        };
        *slot = target.to_value();
        if self.to.contains(target.address()) {
            self.found_new_space_pointer = true;
        }
    }
}

/// Collect new space. `iterate_roots` must visit every process root, the
/// stack-chain root and the debugger's process pointers.
pub(crate) fn scavenge_new_space(
    heap: &mut TwoSpaceHeap,
    iterate_roots: impl FnOnce(&mut dyn PointerVisitor),
) -> ScavengeOutcome {
    heap.swap_semispaces();
    let trigger;
    let promoted_bytes;
    {
        let (to, from, old) = heap.spaces_mut();
        to.enter_no_allocation_failure_scope();
        let from_ranges = from.chunk_spans();
        let mut scavenger = Scavenger::new(from_ranges, to, old);
        iterate_roots(&mut scavenger);
        scavenger.process_remembered_set();
        scavenger.process_grey();
        promoted_bytes = scavenger.promoted_bytes;
        trigger = scavenger.trigger_old_space_gc
            || promoted_bytes * 4 > scavenger.old.allocation_budget();
    }
    // Weak pointers registered in the (now evacuated) from-space: forward
    // entries whose object survived, run callbacks for the rest.
    let (to, from, old) = heap.spaces_mut();
    for mut weak in from.take_weak_pointers() {
        let object = weak.object;
        if object.is_forwarded() {
            let target = object.forwarding_target();
            weak.object = target;
            if old.contains(target.address()) {
                old.push_weak_pointer(weak);
            } else {
                to.weak_pointers_mut().push(weak);
            }
        } else {
            (weak.callback)(object);
        }
    }
    to.leave_no_allocation_failure_scope();
    from.recycle();
    heap.stats_mut().scavenges += 1;
    heap.stats_mut().bytes_promoted += promoted_bytes as u64;
    ScavengeOutcome {
        trigger_old_space_gc: trigger,
        promoted_bytes,
    }
}

/// Cheney scavenger for the program space. No ages, no promotion: every
/// live object moves to the fresh to-space.
pub(crate) struct ProgramScavenger<'a> {
    from_ranges: Vec<(usize, usize)>,
    to: &'a mut SemiSpace,
    scan_chunk: usize,
    scan_address: usize,
}

impl<'a> ProgramScavenger<'a> {
    pub(crate) fn new(from_ranges: Vec<(usize, usize)>, to: &'a mut SemiSpace) -> ProgramScavenger<'a> {
        ProgramScavenger {
            from_ranges,
            to,
            scan_chunk: 0,
            scan_address: 0,
        }
    }

    #[inline]
    fn in_from_space(&self, address: usize) -> bool {
        self.from_ranges
            .iter()
            .any(|&(base, top)| address >= base && address < top)
    }

    /// Scan to-space until every copied object has been visited.
    pub(crate) fn complete_scavenge(&mut self) {
        loop {
            if self.scan_chunk >= self.to.chunk_count() {
                return;
            }
            let (base, top) = self.to.chunk_span(self.scan_chunk);
            if self.scan_address < base {
                self.scan_address = base;
            }
            if self.scan_address < top {
                let object = HeapObject::from_address(self.scan_address);
                self.scan_address += object.size();
                object.iterate_pointers(self);
                continue;
            }
            if self.scan_chunk + 1 < self.to.chunk_count() {
                self.scan_chunk += 1;
                self.scan_address = 0;
            } else {
                return;
            }
        }
    }
}

impl PointerVisitor for ProgramScavenger<'_> {
    fn visit(&mut self, slot: &mut Value) {
        let value = *slot;
        if !value.is_heap_object() {
            return;
        }
        let address = value.address();
        if !self.in_from_space(address) {
            return;
        }
        let object = HeapObject::from_value(value);
        let target = if object.is_forwarded() {
            object.forwarding_target()
        } else {
            let size = object.size();
            let new_address = self
                .to
                .allocate(size)
                .expect("program to-space allocation inside scavenge");
            unsafe {
                std::ptr::copy_nonoverlapping(
                    object.address() as *const u8,
                    new_address as *mut u8,
                    size,
                );
            }
            let target = HeapObject::from_address(new_address);
            object.forward_to(target);
            target
        };
        *slot = target.to_value();
    }
}
