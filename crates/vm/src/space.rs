//! Chunked memory spaces.
//!
//! A [`Chunk`] is a page-aligned raw arena obtained from the system
//! allocator. Chunks carry side metadata bitmaps (one bit per word) for mark
//! bits and, in old space, object-start bits; both are resettable in
//! O(chunk size / word size).
//!
//! A [`SemiSpace`] is a list of chunks with a bump pointer in the last one.
//! It backs both the new space of the process heap and the program heap.
//! Allocation either bumps, acquires a fresh chunk (when the space may
//! resize or a no-allocation-failure scope is active), or fails so the
//! caller can collect garbage and retry.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};

use crate::object::HeapObject;
use crate::value::WORD_SIZE;

const CHUNK_ALIGNMENT: usize = 4096;

/// A dead-object callback attached to a weak pointer.
pub type WeakCallback = Box<dyn FnMut(HeapObject)>;

/// A weak reference to a heap object, dropped (with its callback run) when
/// the object dies, and updated in place when the object moves.
pub struct WeakPointer {
    pub object: HeapObject,
    pub callback: WeakCallback,
}

/// A contiguous raw arena plus side metadata.
pub(crate) struct Chunk {
    base: usize,
    size: usize,
    /// Allocation top: the address one past the last allocated byte.
    top: usize,
    mark_bits: Vec<u64>,
    start_bits: Vec<u64>,
}

fn bitmap_len(chunk_size: usize) -> usize {
    (chunk_size / WORD_SIZE + 63) / 64
}

impl Chunk {
    pub(crate) fn new(size: usize, with_start_bits: bool) -> Chunk {
        debug_assert!(size % WORD_SIZE == 0);
        let layout = Layout::from_size_align(size, CHUNK_ALIGNMENT).expect("chunk layout");
        let data = unsafe { alloc_zeroed(layout) };
        if data.is_null() {
            handle_alloc_error(layout);
        }
        let base = data as usize;
        Chunk {
            base,
            size,
            top: base,
            mark_bits: vec![0; bitmap_len(size)],
            start_bits: if with_start_bits {
                vec![0; bitmap_len(size)]
            } else {
                Vec::new()
            },
        }
    }

    #[inline]
    pub(crate) fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub(crate) fn limit(&self) -> usize {
        self.base + self.size
    }

    #[inline]
    pub(crate) fn top(&self) -> usize {
        self.top
    }

    pub(crate) fn set_top(&mut self, top: usize) {
        debug_assert!(top >= self.base && top <= self.limit());
        self.top = top;
    }

    #[inline]
    pub(crate) fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.limit()
    }

    /// Bump-allocate `size` bytes, or fail if the chunk is exhausted.
    pub(crate) fn allocate(&mut self, size: usize) -> Option<usize> {
        if self.top + size > self.limit() {
            return None;
        }
        let result = self.top;
        self.top += size;
        Some(result)
    }

    #[inline]
    fn bit_index(&self, address: usize) -> usize {
        debug_assert!(self.contains(address));
        (address - self.base) / WORD_SIZE
    }

    pub(crate) fn is_marked(&self, address: usize) -> bool {
        let index = self.bit_index(address);
        self.mark_bits[index / 64] & (1 << (index % 64)) != 0
    }

    /// Set the mark bit; returns false if it was already set.
    pub(crate) fn mark(&mut self, address: usize) -> bool {
        let index = self.bit_index(address);
        let word = &mut self.mark_bits[index / 64];
        let mask = 1 << (index % 64);
        if *word & mask != 0 {
            return false;
        }
        *word |= mask;
        true
    }

    pub(crate) fn clear_mark_bits(&mut self) {
        self.mark_bits.fill(0);
    }

    pub(crate) fn set_start_bit(&mut self, address: usize) {
        let index = self.bit_index(address);
        self.start_bits[index / 64] |= 1 << (index % 64);
    }

    pub(crate) fn clear_start_bits(&mut self) {
        self.start_bits.fill(0);
    }

    /// Address of the last object start at or before `address`, using the
    /// object-start bitmap. Used to find the object containing an interior
    /// address during remembered-set replay.
    pub(crate) fn object_start_at_or_before(&self, address: usize) -> Option<usize> {
        let mut index = self.bit_index(address);
        loop {
            let word_index = index / 64;
            let word = self.start_bits[word_index] & (!0u64 >> (63 - (index % 64)));
            if word != 0 {
                let bit = 63 - word.leading_zeros() as usize;
                return Some(self.base + (word_index * 64 + bit) * WORD_SIZE);
            }
            if word_index == 0 {
                return None;
            }
            index = word_index * 64 - 1;
        }
    }

    /// Zero the tail of the chunk from `from` to the old top.
    pub(crate) fn zero_range(&mut self, from: usize, to: usize) {
        debug_assert!(from >= self.base && to <= self.limit() && from <= to);
        unsafe {
            std::ptr::write_bytes(from as *mut u8, 0, to - from);
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, CHUNK_ALIGNMENT).expect("chunk layout");
        unsafe { dealloc(self.base as *mut u8, layout) };
    }
}

/// A bump-allocated space made of one or more chunks.
pub struct SemiSpace {
    chunks: Vec<Chunk>,
    chunk_size: usize,
    resizable: bool,
    no_failure_scopes: u32,
    weak_pointers: Vec<WeakPointer>,
}

impl SemiSpace {
    /// An empty space; the first allocation acquires a chunk.
    pub fn new(chunk_size: usize, resizable: bool) -> SemiSpace {
        debug_assert!(chunk_size % WORD_SIZE == 0);
        SemiSpace {
            chunks: Vec::new(),
            chunk_size,
            resizable,
            no_failure_scopes: 0,
            weak_pointers: Vec::new(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Whether acquiring new chunks is allowed outside failure scopes.
    pub fn can_resize(&self) -> bool {
        self.resizable
    }

    /// Bump-allocate `size` bytes (word aligned). Returns `None` when the
    /// space is exhausted and refuses to grow; panics when that happens
    /// inside a no-allocation-failure scope, which is a caller bug.
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size % WORD_SIZE == 0 && size > 0);
        if let Some(chunk) = self.chunks.last_mut() {
            if let Some(address) = chunk.allocate(size) {
                return Some(address);
            }
        }
        if self.resizable || self.no_failure_scopes > 0 || self.chunks.is_empty() {
            let chunk_size = self.chunk_size.max(size);
            self.chunks.push(Chunk::new(chunk_size, false));
            let address = self
                .chunks
                .last_mut()
                .and_then(|chunk| chunk.allocate(size));
            debug_assert!(address.is_some());
            return address;
        }
        None
    }

    /// Enter a scope in which allocation must not fail. Callers pre-arrange
    /// capacity or accept unbudgeted growth; an actual failure aborts.
    pub fn enter_no_allocation_failure_scope(&mut self) {
        self.no_failure_scopes += 1;
    }

    pub fn leave_no_allocation_failure_scope(&mut self) {
        debug_assert!(self.no_failure_scopes > 0);
        self.no_failure_scopes -= 1;
    }

    pub fn used(&self) -> usize {
        self.chunks.iter().map(|c| c.top() - c.base()).sum()
    }

    pub fn size(&self) -> usize {
        self.chunks.iter().map(|c| c.limit() - c.base()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    pub fn contains(&self, address: usize) -> bool {
        self.chunks.iter().any(|c| c.contains(address))
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub(crate) fn chunk_span(&self, index: usize) -> (usize, usize) {
        let chunk = &self.chunks[index];
        (chunk.base(), chunk.top())
    }

    /// The (base, top) spans of all chunks, snapshotting the from-space
    /// extent at the start of a scavenge.
    pub(crate) fn chunk_spans(&self) -> Vec<(usize, usize)> {
        self.chunks.iter().map(|c| (c.base(), c.top())).collect()
    }

    /// Walk all objects in allocation order. The callback must not allocate
    /// into this space; growing walks are done by cursor in the collectors.
    pub fn iterate_objects(&self, mut callback: impl FnMut(HeapObject)) {
        for chunk in &self.chunks {
            let mut cursor = chunk.base();
            while cursor < chunk.top() {
                let object = HeapObject::from_address(cursor);
                let size = object.size();
                callback(object);
                cursor += size;
            }
        }
    }

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

    /// Register a weak pointer to `object` with a dead-object callback.
    pub fn register_weak_pointer(&mut self, object: HeapObject, callback: WeakCallback) {
        self.weak_pointers.push(WeakPointer { object, callback });
    }

    pub(crate) fn take_weak_pointers(&mut self) -> Vec<WeakPointer> {
        std::mem::take(&mut self.weak_pointers)
    }

    pub(crate) fn weak_pointers_mut(&mut self) -> &mut Vec<WeakPointer> {
        &mut self.weak_pointers
    }

    /// Drop all chunks but the first and reset the bump pointer, zeroing the
    /// retained chunk. Used on the from-space after a scavenge.
    pub(crate) fn recycle(&mut self) {
        self.chunks.truncate(1);
        if let Some(chunk) = self.chunks.first_mut() {
            let (base, top) = (chunk.base(), chunk.top());
            chunk.zero_range(base, top);
            chunk.set_top(base);
            chunk.clear_mark_bits();
        }
    }

    /// Offset of `object` from the space start; only meaningful for a
    /// compacted single-chunk space, as produced by a program collection.
    pub fn offset_of(&self, object: HeapObject) -> usize {
        debug_assert!(self.chunks.len() == 1);
        object.address() - self.chunks[0].base()
    }

    /// Inverse of [`SemiSpace::offset_of`].
    pub fn object_at_offset(&self, offset: usize) -> HeapObject {
        debug_assert!(self.chunks.len() == 1);
        HeapObject::from_address(self.chunks[0].base() + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_allocation() {
        let mut space = SemiSpace::new(1024, false);
        let a = space.allocate(16).unwrap();
        let b = space.allocate(16).unwrap();
        assert_eq!(b, a + 16);
        assert_eq!(space.used(), 32);
        assert!(space.contains(a));
        assert!(!space.contains(a + 2048));
    }

    #[test]
    fn test_allocation_fails_when_full_and_fixed_size() {
        let mut space = SemiSpace::new(64, false);
        assert!(space.allocate(64).is_some());
        assert!(space.allocate(WORD_SIZE).is_none());
    }

    #[test]
    fn test_resizable_space_grows() {
        let mut space = SemiSpace::new(64, true);
        assert!(space.allocate(64).is_some());
        assert!(space.allocate(64).is_some());
        assert_eq!(space.chunk_count(), 2);
    }

    #[test]
    fn test_no_allocation_failure_scope_forces_growth() {
        let mut space = SemiSpace::new(64, false);
        assert!(space.allocate(64).is_some());
        space.enter_no_allocation_failure_scope();
        assert!(space.allocate(64).is_some());
        space.leave_no_allocation_failure_scope();
        assert!(space.allocate(64).is_none());
    }

    #[test]
    fn test_mark_bits() {
        let mut space = SemiSpace::new(1024, false);
        let a = space.allocate(32).unwrap();
        assert!(!space.is_marked(a));
        assert!(space.mark(a));
        assert!(!space.mark(a));
        assert!(space.is_marked(a));
        space.clear_mark_bits();
        assert!(!space.is_marked(a));
    }

    #[test]
    fn test_object_start_lookup() {
        let mut chunk = Chunk::new(1024, true);
        let base = chunk.base();
        chunk.set_start_bit(base);
        chunk.set_start_bit(base + 64);
        assert_eq!(chunk.object_start_at_or_before(base + 64), Some(base + 64));
        assert_eq!(chunk.object_start_at_or_before(base + 63), Some(base));
        assert_eq!(chunk.object_start_at_or_before(base + 200), Some(base + 64));
    }
}
