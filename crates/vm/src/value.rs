//! Tagged machine-word values.
//!
//! Every slot the interpreter can see holds a single machine word that is
//! either a small integer (smi) or a pointer to a heap object:
//!
//! - **Smi**:         `...XXXX0`: signed integer shifted left by one.
//! - **Heap object**: `...XXXX1`: object address with the low bit set.
//!
//! Heap objects are always word aligned, so the tag bit never collides with
//! address bits. Collectors move objects by rewriting these words in place.

use std::fmt;

/// Size of a machine word in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Number of bits in a machine word.
pub const WORD_BITS: usize = WORD_SIZE * 8;

const TAG_MASK: usize = 1;
const HEAP_OBJECT_TAG: usize = 1;

/// A tagged machine word: smi or heap-object pointer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(usize);

impl Value {
    /// The smi zero, also used as a chain terminator in a few places.
    pub const ZERO: Value = Value(0);

    #[inline]
    pub const fn from_raw(raw: usize) -> Value {
        Value(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_smi(self) -> bool {
        self.0 & TAG_MASK == 0
    }

    #[inline]
    pub const fn is_heap_object(self) -> bool {
        self.0 & TAG_MASK == HEAP_OBJECT_TAG
    }

    /// Encode a small integer. The value must be in smi range.
    #[inline]
    pub fn from_smi(value: isize) -> Value {
        debug_assert!(Value::is_valid_smi(value as i64), "smi overflow: {}", value);
        Value((value as usize) << 1)
    }

    /// Decode a smi. The value must be a smi.
    #[inline]
    pub fn as_smi(self) -> isize {
        debug_assert!(self.is_smi());
        (self.0 as isize) >> 1
    }

    /// Whether `value` fits in a smi on this host.
    #[inline]
    pub fn is_valid_smi(value: i64) -> bool {
        let limit = 1i64 << (WORD_BITS - 2);
        (-limit..limit).contains(&value)
    }

    /// Whether `value` fits in a smi on a 32-bit host. Snapshots must only
    /// contain smis in this range so they stay portable across word sizes.
    #[inline]
    pub fn is_portable_smi(value: i64) -> bool {
        let limit = 1i64 << 30;
        (-limit..limit).contains(&value)
    }

    /// Tag an object address.
    #[inline]
    pub fn from_address(address: usize) -> Value {
        debug_assert!(address & TAG_MASK == 0, "object address not aligned");
        Value(address | HEAP_OBJECT_TAG)
    }

    /// Untag a heap-object value. The value must be a heap object.
    #[inline]
    pub fn address(self) -> usize {
        debug_assert!(self.is_heap_object());
        self.0 & !TAG_MASK
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_smi() {
            write!(f, "Smi({})", self.as_smi())
        } else {
            write!(f, "HeapObject(0x{:x})", self.address())
        }
    }
}

/// Visits tagged slots, typically to mark or forward what they reference.
///
/// Slots handed to `visit` live inside heap objects, process structs or the
/// program root set; a visitor may rewrite them in place.
pub trait PointerVisitor {
    fn visit(&mut self, slot: &mut Value);

    fn visit_all(&mut self, slots: &mut [Value]) {
        for slot in slots {
            self.visit(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smi_round_trip() {
        for value in [0isize, 1, -1, 42, -42, 1 << 40, -(1 << 40)] {
            let smi = Value::from_smi(value);
            assert!(smi.is_smi());
            assert!(!smi.is_heap_object());
            assert_eq!(smi.as_smi(), value);
        }
    }

    #[test]
    fn test_heap_object_round_trip() {
        let address = 0x1000usize;
        let value = Value::from_address(address);
        assert!(value.is_heap_object());
        assert!(!value.is_smi());
        assert_eq!(value.address(), address);
    }

    #[test]
    fn test_smi_ranges() {
        assert!(Value::is_valid_smi(0));
        assert!(Value::is_valid_smi((1 << 61) - 1));
        assert!(!Value::is_valid_smi(1 << 62));
        assert!(Value::is_portable_smi((1 << 30) - 1));
        assert!(!Value::is_portable_smi(1 << 30));
    }
}
