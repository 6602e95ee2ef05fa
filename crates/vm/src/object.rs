//! Heap-object layout and typed views.
//!
//! Every heap object starts with a two-word header:
//!
//! - word 0: the class pointer, stored as a tagged [`Value`].
//! - word 1: the meta word packing the identity hash (upper half), the
//!   object's age in scavenge survivals, and the forwarded flag the copying
//!   collectors use while moving objects.
//!
//! The class's [`InstanceFormat`] tells the collectors how large an object is
//! and which kind of trailing payload it carries. Objects with raw payloads
//! (strings, byte arrays, bytecode, boxed numbers) contain no traceable words
//! beyond their headers; everything else is iterated slot by slot.
//!
//! `HeapObject` and the typed wrappers are raw address views. They are only
//! meaningful while the address refers to a live object in one of the spaces;
//! all reads and writes go straight to memory.

use crate::value::{PointerVisitor, Value, WORD_BITS, WORD_SIZE};

/// Offset of the class pointer in every heap object.
pub const CLASS_OFFSET: usize = 0;

/// Offset of the meta word (identity hash, age, GC flags).
pub const META_OFFSET: usize = WORD_SIZE;

/// Size of the common object header.
pub const HEADER_SIZE: usize = 2 * WORD_SIZE;

const FORWARDED_BIT: usize = 1;
const AGE_SHIFT: usize = 2;
const AGE_MASK: usize = 0xF;
const HASH_SHIFT: usize = WORD_BITS / 2;

/// Round a byte count up to a whole number of words.
#[inline]
pub fn round_up_to_word(bytes: usize) -> usize {
    (bytes + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

/// Produce a `&mut Value` view of the slot at `address`.
///
/// # Safety
///
/// `address` must point at a live, word-aligned slot inside a heap object,
/// a root field, or process state, and the reference must not outlive the
/// slot or alias another live reference to it.
#[inline]
pub(crate) unsafe fn slot_ref<'a>(address: usize) -> &'a mut Value {
    &mut *(address as *mut Value)
}

/// The layout family of an object, read from its class's format.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ObjectKind {
    Instance = 0,
    Class = 1,
    Array = 2,
    ByteArray = 3,
    OneByteString = 4,
    TwoByteString = 5,
    Function = 6,
    LargeInteger = 7,
    Double = 8,
    Stack = 9,
    Initializer = 10,
    DispatchTableEntry = 11,
    Boxed = 12,
}

/// Extra classification for instances the interpreter special-cases.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Marker {
    None = 0,
    Null = 1,
    False = 2,
    True = 3,
    Coroutine = 4,
    Port = 5,
    Smi = 6,
    Num = 7,
}

/// Packed description of a class's instances: layout kind, marker, and the
/// fixed (header-inclusive) size in words. Stored in the class as a smi, so
/// it survives collections without special handling.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct InstanceFormat(usize);

const KIND_SHIFT: usize = 0;
const MARKER_SHIFT: usize = 8;
const FIXED_SIZE_SHIFT: usize = 16;

impl InstanceFormat {
    fn new(kind: ObjectKind, marker: Marker, fixed_size_words: usize) -> InstanceFormat {
        debug_assert!(fixed_size_words < (1 << 16));
        InstanceFormat(
            ((kind as usize) << KIND_SHIFT)
                | ((marker as usize) << MARKER_SHIFT)
                | (fixed_size_words << FIXED_SIZE_SHIFT),
        )
    }

    /// Format for a plain instance with `fields` pointer fields.
    pub fn instance(fields: usize) -> InstanceFormat {
        InstanceFormat::instance_with_marker(fields, Marker::None)
    }

    pub fn instance_with_marker(fields: usize, marker: Marker) -> InstanceFormat {
        InstanceFormat::new(ObjectKind::Instance, marker, 2 + fields)
    }

    pub fn class() -> InstanceFormat {
        InstanceFormat::new(ObjectKind::Class, Marker::None, 5)
    }

    pub fn array() -> InstanceFormat {
        InstanceFormat::new(ObjectKind::Array, Marker::None, 3)
    }

    pub fn byte_array() -> InstanceFormat {
        InstanceFormat::new(ObjectKind::ByteArray, Marker::None, 3)
    }

    pub fn one_byte_string() -> InstanceFormat {
        InstanceFormat::new(ObjectKind::OneByteString, Marker::None, 3)
    }

    pub fn two_byte_string() -> InstanceFormat {
        InstanceFormat::new(ObjectKind::TwoByteString, Marker::None, 3)
    }

    pub fn function() -> InstanceFormat {
        InstanceFormat::new(ObjectKind::Function, Marker::None, 5)
    }

    pub fn large_integer() -> InstanceFormat {
        InstanceFormat::new(ObjectKind::LargeInteger, Marker::None, 3)
    }

    pub fn double() -> InstanceFormat {
        InstanceFormat::new(ObjectKind::Double, Marker::None, 3)
    }

    pub fn stack() -> InstanceFormat {
        InstanceFormat::new(ObjectKind::Stack, Marker::None, 6)
    }

    pub fn initializer() -> InstanceFormat {
        InstanceFormat::new(ObjectKind::Initializer, Marker::None, 3)
    }

    pub fn dispatch_table_entry() -> InstanceFormat {
        InstanceFormat::new(ObjectKind::DispatchTableEntry, Marker::None, 4)
    }

    pub fn boxed() -> InstanceFormat {
        InstanceFormat::new(ObjectKind::Boxed, Marker::None, 3)
    }

    pub fn num(marker: Marker) -> InstanceFormat {
        InstanceFormat::new(ObjectKind::Instance, marker, 2)
    }

    pub fn kind(self) -> ObjectKind {
        match (self.0 >> KIND_SHIFT) & 0xFF {
            0 => ObjectKind::Instance,
            1 => ObjectKind::Class,
            2 => ObjectKind::Array,
            3 => ObjectKind::ByteArray,
            4 => ObjectKind::OneByteString,
            5 => ObjectKind::TwoByteString,
            6 => ObjectKind::Function,
            7 => ObjectKind::LargeInteger,
            8 => ObjectKind::Double,
            9 => ObjectKind::Stack,
            10 => ObjectKind::Initializer,
            11 => ObjectKind::DispatchTableEntry,
            _ => ObjectKind::Boxed,
        }
    }

    pub fn marker(self) -> Marker {
        match (self.0 >> MARKER_SHIFT) & 0xFF {
            0 => Marker::None,
            1 => Marker::Null,
            2 => Marker::False,
            3 => Marker::True,
            4 => Marker::Coroutine,
            5 => Marker::Port,
            6 => Marker::Smi,
            _ => Marker::Num,
        }
    }

    /// Header-inclusive fixed size in bytes.
    pub fn fixed_size(self) -> usize {
        (self.0 >> FIXED_SIZE_SHIFT) * WORD_SIZE
    }

    pub fn as_value(self) -> Value {
        Value::from_smi(self.0 as isize)
    }

    pub fn from_value(value: Value) -> InstanceFormat {
        InstanceFormat(value.as_smi() as usize)
    }
}

/// An untagged address of a heap object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapObject {
    address: usize,
}

impl HeapObject {
    #[inline]
    pub fn from_address(address: usize) -> HeapObject {
        debug_assert!(address % WORD_SIZE == 0);
        HeapObject { address }
    }

    #[inline]
    pub fn from_value(value: Value) -> HeapObject {
        HeapObject::from_address(value.address())
    }

    #[inline]
    pub fn address(self) -> usize {
        self.address
    }

    #[inline]
    pub fn to_value(self) -> Value {
        Value::from_address(self.address)
    }

    #[inline]
    pub fn word_at(self, offset: usize) -> usize {
        unsafe { *((self.address + offset) as *const usize) }
    }

    #[inline]
    pub fn set_word_at(self, offset: usize, word: usize) {
        unsafe { *((self.address + offset) as *mut usize) = word }
    }

    #[inline]
    pub fn value_at(self, offset: usize) -> Value {
        Value::from_raw(self.word_at(offset))
    }

    #[inline]
    pub fn set_value_at(self, offset: usize, value: Value) {
        self.set_word_at(offset, value.raw());
    }

    /// Address of the slot at `offset`, for visitors and the write barrier.
    #[inline]
    pub fn slot_address(self, offset: usize) -> usize {
        self.address + offset
    }

    pub fn class_value(self) -> Value {
        self.value_at(CLASS_OFFSET)
    }

    pub fn set_class_value(self, class: Value) {
        self.set_value_at(CLASS_OFFSET, class);
    }

    pub fn class(self) -> Class {
        Class::cast(HeapObject::from_value(self.class_value()))
    }

    pub fn format(self) -> InstanceFormat {
        self.class().instance_format()
    }

    // Meta word: identity hash, age, forwarded flag.

    pub fn meta(self) -> usize {
        self.word_at(META_OFFSET)
    }

    pub fn set_meta(self, meta: usize) {
        self.set_word_at(META_OFFSET, meta);
    }

    pub fn identity_hash(self) -> u32 {
        (self.meta() >> HASH_SHIFT) as u32
    }

    pub fn set_identity_hash(self, hash: u32) {
        let meta = self.meta() & ((1 << HASH_SHIFT) - 1);
        self.set_meta(meta | ((hash as usize) << HASH_SHIFT));
    }

    pub fn age(self) -> usize {
        (self.meta() >> AGE_SHIFT) & AGE_MASK
    }

    pub fn set_age(self, age: usize) {
        let meta = self.meta() & !(AGE_MASK << AGE_SHIFT);
        self.set_meta(meta | ((age.min(AGE_MASK)) << AGE_SHIFT));
    }

    pub fn is_forwarded(self) -> bool {
        self.meta() & FORWARDED_BIT != 0
    }

    /// Install a forwarding pointer over this (now dead) copy. The class word
    /// becomes the target pointer; the forwarded flag distinguishes the two.
    pub fn forward_to(self, target: HeapObject) {
        self.set_value_at(CLASS_OFFSET, target.to_value());
        self.set_meta(self.meta() | FORWARDED_BIT);
    }

    pub fn forwarding_target(self) -> HeapObject {
        debug_assert!(self.is_forwarded());
        HeapObject::from_value(self.value_at(CLASS_OFFSET))
    }

    /// Total size in bytes, including the header and any variable part.
    pub fn size(self) -> usize {
        let format = self.format();
        let fixed = format.fixed_size();
        match format.kind() {
            ObjectKind::Array => fixed + Array::cast(self).length() * WORD_SIZE,
            ObjectKind::ByteArray => fixed + round_up_to_word(ByteArray::cast(self).length()),
            ObjectKind::OneByteString => {
                fixed + round_up_to_word(OneByteString::cast(self).length())
            }
            ObjectKind::TwoByteString => {
                fixed + round_up_to_word(TwoByteString::cast(self).length() * 2)
            }
            ObjectKind::Function => {
                let function = Function::cast(self);
                fixed
                    + round_up_to_word(function.bytecode_size())
                    + function.literal_count() * WORD_SIZE
            }
            ObjectKind::Stack => fixed + Stack::cast(self).length() * WORD_SIZE,
            _ => fixed,
        }
    }

    /// Visit every tagged slot of this object, class pointer included.
    ///
    /// Stack slots may hold raw bytecode addresses between frames; those
    /// words only ever point into program-space bytecode, which the data
    /// collectors filter out by address range.
    pub fn iterate_pointers(self, visitor: &mut dyn PointerVisitor) {
        visitor.visit(unsafe { slot_ref(self.slot_address(CLASS_OFFSET)) });
        let format = self.format_of_iterated();
        match format.kind() {
            ObjectKind::Instance => {
                let fields = format.fixed_size() / WORD_SIZE - 2;
                self.visit_slot_range(HEADER_SIZE, fields, visitor);
            }
            ObjectKind::Class => {
                let class = Class::cast(self);
                visitor.visit(unsafe { slot_ref(class.0.slot_address(Class::SUPERCLASS_OFFSET)) });
                visitor.visit(unsafe { slot_ref(class.0.slot_address(Class::METHODS_OFFSET)) });
            }
            ObjectKind::Array => {
                let array = Array::cast(self);
                self.visit_slot_range(Array::ELEMENTS_OFFSET, array.length(), visitor);
            }
            ObjectKind::Function => {
                let function = Function::cast(self);
                let literals = function.literals_offset();
                self.visit_slot_range(literals, function.literal_count(), visitor);
            }
            ObjectKind::Stack => {
                let stack = Stack::cast(self);
                visitor.visit(unsafe { slot_ref(stack.0.slot_address(Stack::NEXT_OFFSET)) });
                self.visit_slot_range(Stack::SLOTS_OFFSET, stack.top(), visitor);
            }
            ObjectKind::Initializer => {
                visitor.visit(unsafe { slot_ref(self.slot_address(Initializer::FUNCTION_OFFSET)) });
            }
            ObjectKind::DispatchTableEntry => {
                visitor
                    .visit(unsafe { slot_ref(self.slot_address(DispatchTableEntry::TARGET_OFFSET)) });
            }
            ObjectKind::Boxed => {
                visitor.visit(unsafe { slot_ref(self.slot_address(Boxed::VALUE_OFFSET)) });
            }
            ObjectKind::ByteArray
            | ObjectKind::OneByteString
            | ObjectKind::TwoByteString
            | ObjectKind::LargeInteger
            | ObjectKind::Double => {}
        }
    }

    // During a program-space scavenge the class may already have been moved
    // and forwarded; its format slot is still intact at the old address, so
    // read the format through the untagged class word without chasing the
    // forwarding pointer.
    fn format_of_iterated(self) -> InstanceFormat {
        let class = HeapObject::from_value(self.class_value());
        InstanceFormat::from_value(class.value_at(Class::FORMAT_OFFSET))
    }

    fn visit_slot_range(self, offset: usize, count: usize, visitor: &mut dyn PointerVisitor) {
        for i in 0..count {
            visitor.visit(unsafe { slot_ref(self.slot_address(offset + i * WORD_SIZE)) });
        }
    }
}

impl std::fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HeapObject(0x{:x})", self.address)
    }
}

macro_rules! typed_view {
    ($name:ident) => {
        /// Typed view over a [`HeapObject`] of the matching kind.
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub struct $name(HeapObject);

        impl $name {
            #[inline]
            pub fn cast(object: HeapObject) -> $name {
                $name(object)
            }

            #[inline]
            pub fn object(self) -> HeapObject {
                self.0
            }

            #[inline]
            pub fn address(self) -> usize {
                self.0.address()
            }

            #[inline]
            pub fn to_value(self) -> Value {
                self.0.to_value()
            }
        }
    };
}

typed_view!(Class);
typed_view!(Array);
typed_view!(ByteArray);
typed_view!(OneByteString);
typed_view!(TwoByteString);
typed_view!(Function);
typed_view!(LargeInteger);
typed_view!(Double);
typed_view!(Stack);
typed_view!(Instance);
typed_view!(Initializer);
typed_view!(DispatchTableEntry);
typed_view!(Boxed);
typed_view!(Coroutine);

impl Class {
    pub const FORMAT_OFFSET: usize = HEADER_SIZE;
    pub const SUPERCLASS_OFFSET: usize = HEADER_SIZE + WORD_SIZE;
    pub const METHODS_OFFSET: usize = HEADER_SIZE + 2 * WORD_SIZE;

    pub fn instance_format(self) -> InstanceFormat {
        InstanceFormat::from_value(self.0.value_at(Class::FORMAT_OFFSET))
    }

    pub fn set_instance_format(self, format: InstanceFormat) {
        self.0.set_value_at(Class::FORMAT_OFFSET, format.as_value());
    }

    pub fn superclass(self) -> Value {
        self.0.value_at(Class::SUPERCLASS_OFFSET)
    }

    pub fn set_superclass(self, superclass: Value) {
        self.0.set_value_at(Class::SUPERCLASS_OFFSET, superclass);
    }

    pub fn methods(self) -> Value {
        self.0.value_at(Class::METHODS_OFFSET)
    }

    pub fn set_methods(self, methods: Value) {
        self.0.set_value_at(Class::METHODS_OFFSET, methods);
    }

    pub fn number_of_instance_fields(self) -> usize {
        debug_assert!(self.instance_format().kind() == ObjectKind::Instance);
        self.instance_format().fixed_size() / WORD_SIZE - 2
    }
}

impl Array {
    pub const LENGTH_OFFSET: usize = HEADER_SIZE;
    pub const ELEMENTS_OFFSET: usize = HEADER_SIZE + WORD_SIZE;

    pub fn length(self) -> usize {
        self.0.value_at(Array::LENGTH_OFFSET).as_smi() as usize
    }

    pub fn set_length(self, length: usize) {
        self.0
            .set_value_at(Array::LENGTH_OFFSET, Value::from_smi(length as isize));
    }

    pub fn get(self, index: usize) -> Value {
        debug_assert!(index < self.length());
        self.0
            .value_at(Array::ELEMENTS_OFFSET + index * WORD_SIZE)
    }

    pub fn set(self, index: usize, value: Value) {
        debug_assert!(index < self.length());
        self.0
            .set_value_at(Array::ELEMENTS_OFFSET + index * WORD_SIZE, value);
    }

    /// Address of element `index`, for the write barrier.
    pub fn element_address(self, index: usize) -> usize {
        self.0.slot_address(Array::ELEMENTS_OFFSET + index * WORD_SIZE)
    }
}

impl ByteArray {
    pub const LENGTH_OFFSET: usize = HEADER_SIZE;
    pub const DATA_OFFSET: usize = HEADER_SIZE + WORD_SIZE;

    pub fn length(self) -> usize {
        self.0.value_at(ByteArray::LENGTH_OFFSET).as_smi() as usize
    }

    pub fn set_length(self, length: usize) {
        self.0
            .set_value_at(ByteArray::LENGTH_OFFSET, Value::from_smi(length as isize));
    }

    pub fn byte_at(self, index: usize) -> u8 {
        debug_assert!(index < self.length());
        unsafe { *((self.address() + ByteArray::DATA_OFFSET + index) as *const u8) }
    }

    pub fn set_byte_at(self, index: usize, byte: u8) {
        debug_assert!(index < self.length());
        unsafe { *((self.address() + ByteArray::DATA_OFFSET + index) as *mut u8) = byte }
    }
}

impl OneByteString {
    pub const LENGTH_OFFSET: usize = HEADER_SIZE;
    pub const DATA_OFFSET: usize = HEADER_SIZE + WORD_SIZE;

    pub fn length(self) -> usize {
        self.0.value_at(OneByteString::LENGTH_OFFSET).as_smi() as usize
    }

    pub fn set_length(self, length: usize) {
        self.0
            .set_value_at(OneByteString::LENGTH_OFFSET, Value::from_smi(length as isize));
    }

    pub fn char_code(self, index: usize) -> u8 {
        debug_assert!(index < self.length());
        unsafe { *((self.address() + OneByteString::DATA_OFFSET + index) as *const u8) }
    }

    pub fn set_char_code(self, index: usize, code: u8) {
        debug_assert!(index < self.length());
        unsafe { *((self.address() + OneByteString::DATA_OFFSET + index) as *mut u8) = code }
    }

    /// Copy the contents out as a `String` (diagnostics and tests).
    pub fn to_string_lossy(self) -> String {
        (0..self.length()).map(|i| self.char_code(i) as char).collect()
    }
}

impl TwoByteString {
    pub const LENGTH_OFFSET: usize = HEADER_SIZE;
    pub const DATA_OFFSET: usize = HEADER_SIZE + WORD_SIZE;

    pub fn length(self) -> usize {
        self.0.value_at(TwoByteString::LENGTH_OFFSET).as_smi() as usize
    }

    pub fn set_length(self, length: usize) {
        self.0
            .set_value_at(TwoByteString::LENGTH_OFFSET, Value::from_smi(length as isize));
    }

    pub fn code_unit(self, index: usize) -> u16 {
        debug_assert!(index < self.length());
        unsafe { *((self.address() + TwoByteString::DATA_OFFSET + index * 2) as *const u16) }
    }

    pub fn set_code_unit(self, index: usize, unit: u16) {
        debug_assert!(index < self.length());
        unsafe { *((self.address() + TwoByteString::DATA_OFFSET + index * 2) as *mut u16) = unit }
    }
}

impl Function {
    pub const ARITY_OFFSET: usize = HEADER_SIZE;
    pub const LITERAL_COUNT_OFFSET: usize = HEADER_SIZE + WORD_SIZE;
    pub const BYTECODE_SIZE_OFFSET: usize = HEADER_SIZE + 2 * WORD_SIZE;
    pub const BYTECODE_OFFSET: usize = HEADER_SIZE + 3 * WORD_SIZE;

    pub fn arity(self) -> usize {
        self.0.value_at(Function::ARITY_OFFSET).as_smi() as usize
    }

    pub fn literal_count(self) -> usize {
        self.0.value_at(Function::LITERAL_COUNT_OFFSET).as_smi() as usize
    }

    pub fn bytecode_size(self) -> usize {
        self.0.value_at(Function::BYTECODE_SIZE_OFFSET).as_smi() as usize
    }

    /// Address of bytecode index `index`; index 0 is the canonical entry.
    pub fn bytecode_address_for(self, index: usize) -> usize {
        debug_assert!(index <= self.bytecode_size());
        self.address() + Function::BYTECODE_OFFSET + index
    }

    pub fn bytecode_at(self, index: usize) -> u8 {
        debug_assert!(index < self.bytecode_size());
        unsafe { *(self.bytecode_address_for(index) as *const u8) }
    }

    pub fn set_bytecode_at(self, index: usize, byte: u8) {
        debug_assert!(index < self.bytecode_size());
        unsafe { *(self.bytecode_address_for(index) as *mut u8) = byte }
    }

    /// Whether `bcp` points inside this function's bytecode.
    pub fn contains_bytecode_address(self, bcp: usize) -> bool {
        let start = self.bytecode_address_for(0);
        bcp >= start && bcp < start + self.bytecode_size()
    }

    pub(crate) fn literals_offset(self) -> usize {
        Function::BYTECODE_OFFSET + round_up_to_word(self.bytecode_size())
    }

    pub fn literal_at(self, index: usize) -> Value {
        debug_assert!(index < self.literal_count());
        self.0.value_at(self.literals_offset() + index * WORD_SIZE)
    }

    pub fn set_literal_at(self, index: usize, value: Value) {
        debug_assert!(index < self.literal_count());
        self.0
            .set_value_at(self.literals_offset() + index * WORD_SIZE, value);
    }
}

impl LargeInteger {
    pub const VALUE_OFFSET: usize = HEADER_SIZE;

    pub fn value(self) -> i64 {
        self.0.word_at(LargeInteger::VALUE_OFFSET) as i64
    }

    pub fn set_value(self, value: i64) {
        self.0.set_word_at(LargeInteger::VALUE_OFFSET, value as usize);
    }
}

impl Double {
    pub const VALUE_OFFSET: usize = HEADER_SIZE;

    pub fn value(self) -> f64 {
        f64::from_bits(self.0.word_at(Double::VALUE_OFFSET) as u64)
    }

    pub fn set_value(self, value: f64) {
        self.0
            .set_word_at(Double::VALUE_OFFSET, value.to_bits() as usize);
    }
}

impl Instance {
    pub const FIELDS_OFFSET: usize = HEADER_SIZE;

    pub fn field(self, index: usize) -> Value {
        self.0.value_at(Instance::FIELDS_OFFSET + index * WORD_SIZE)
    }

    pub fn set_field(self, index: usize, value: Value) {
        self.0
            .set_value_at(Instance::FIELDS_OFFSET + index * WORD_SIZE, value);
    }

    pub fn field_address(self, index: usize) -> usize {
        self.0.slot_address(Instance::FIELDS_OFFSET + index * WORD_SIZE)
    }
}

impl Initializer {
    pub const FUNCTION_OFFSET: usize = HEADER_SIZE;

    pub fn function(self) -> Value {
        self.0.value_at(Initializer::FUNCTION_OFFSET)
    }

    pub fn set_function(self, function: Value) {
        self.0.set_value_at(Initializer::FUNCTION_OFFSET, function);
    }
}

impl DispatchTableEntry {
    pub const TARGET_OFFSET: usize = HEADER_SIZE;
    pub const CODE_OFFSET: usize = HEADER_SIZE + WORD_SIZE;

    pub fn target(self) -> Value {
        self.0.value_at(DispatchTableEntry::TARGET_OFFSET)
    }

    pub fn set_target(self, target: Value) {
        self.0.set_value_at(DispatchTableEntry::TARGET_OFFSET, target);
    }

    pub fn code(self) -> Value {
        self.0.value_at(DispatchTableEntry::CODE_OFFSET)
    }

    pub fn set_code(self, code: Value) {
        self.0.set_value_at(DispatchTableEntry::CODE_OFFSET, code);
    }
}

impl Boxed {
    pub const VALUE_OFFSET: usize = HEADER_SIZE;

    pub fn value(self) -> Value {
        self.0.value_at(Boxed::VALUE_OFFSET)
    }

    pub fn set_value(self, value: Value) {
        self.0.set_value_at(Boxed::VALUE_OFFSET, value);
    }
}

impl Coroutine {
    pub const STACK_FIELD: usize = 0;
    pub const CALLER_FIELD: usize = 1;

    pub fn stack(self) -> Stack {
        Stack::cast(HeapObject::from_value(
            Instance::cast(self.0).field(Coroutine::STACK_FIELD),
        ))
    }

    pub fn set_stack(self, stack: Stack) {
        Instance::cast(self.0).set_field(Coroutine::STACK_FIELD, stack.to_value());
    }

    pub fn caller(self) -> Value {
        Instance::cast(self.0).field(Coroutine::CALLER_FIELD)
    }

    pub fn set_caller(self, caller: Value) {
        Instance::cast(self.0).set_field(Coroutine::CALLER_FIELD, caller);
    }
}

impl Stack {
    pub const LENGTH_OFFSET: usize = HEADER_SIZE;
    pub const TOP_OFFSET: usize = HEADER_SIZE + WORD_SIZE;
    pub const FP_OFFSET: usize = HEADER_SIZE + 2 * WORD_SIZE;
    pub const NEXT_OFFSET: usize = HEADER_SIZE + 3 * WORD_SIZE;
    pub const SLOTS_OFFSET: usize = HEADER_SIZE + 4 * WORD_SIZE;

    /// Slots each frame occupies: function, bytecode pointer, saved fp.
    pub const FRAME_SLOTS: usize = 3;

    pub fn length(self) -> usize {
        self.0.value_at(Stack::LENGTH_OFFSET).as_smi() as usize
    }

    pub fn set_length(self, length: usize) {
        self.0
            .set_value_at(Stack::LENGTH_OFFSET, Value::from_smi(length as isize));
    }

    /// Number of live slots; also the next free slot index.
    pub fn top(self) -> usize {
        self.0.value_at(Stack::TOP_OFFSET).as_smi() as usize
    }

    pub fn set_top(self, top: usize) {
        self.0
            .set_value_at(Stack::TOP_OFFSET, Value::from_smi(top as isize));
    }

    /// Index of the newest frame's saved-fp slot; 0 means no frames.
    pub fn fp(self) -> usize {
        self.0.value_at(Stack::FP_OFFSET).as_smi() as usize
    }

    pub fn set_fp(self, fp: usize) {
        self.0.set_value_at(Stack::FP_OFFSET, Value::from_smi(fp as isize));
    }

    /// Chain link used only while a program collection is in progress.
    pub fn next(self) -> Value {
        self.0.value_at(Stack::NEXT_OFFSET)
    }

    pub fn set_next(self, next: Value) {
        self.0.set_value_at(Stack::NEXT_OFFSET, next);
    }

    pub fn slot(self, index: usize) -> Value {
        debug_assert!(index < self.length());
        self.0.value_at(Stack::SLOTS_OFFSET + index * WORD_SIZE)
    }

    pub fn set_slot(self, index: usize, value: Value) {
        debug_assert!(index < self.length());
        self.0
            .set_value_at(Stack::SLOTS_OFFSET + index * WORD_SIZE, value);
    }

    pub fn slot_raw(self, index: usize) -> usize {
        debug_assert!(index < self.length());
        self.0.word_at(Stack::SLOTS_OFFSET + index * WORD_SIZE)
    }

    pub fn set_slot_raw(self, index: usize, word: usize) {
        debug_assert!(index < self.length());
        self.0
            .set_word_at(Stack::SLOTS_OFFSET + index * WORD_SIZE, word);
    }

    /// Push a value slot; the caller checks capacity beforehand.
    pub fn push(self, value: Value) {
        let top = self.top();
        debug_assert!(top < self.length());
        self.set_slot(top, value);
        self.set_top(top + 1);
    }

    /// Push a frame for `function` executing at `bcp`.
    pub fn push_frame(self, function: Function, bcp: usize) {
        let top = self.top();
        debug_assert!(top + Stack::FRAME_SLOTS <= self.length());
        self.set_slot(top, function.to_value());
        self.set_slot_raw(top + 1, bcp);
        self.set_slot(top + 2, Value::from_smi(self.fp() as isize));
        self.set_fp(top + 2);
        self.set_top(top + 3);
    }

    pub fn frames(self) -> Frames {
        Frames {
            stack: self,
            fp: self.fp(),
        }
    }
}

/// One interpreter frame on a [`Stack`].
#[derive(Clone, Copy)]
pub struct Frame {
    stack: Stack,
    fp: usize,
}

impl Frame {
    pub fn function_value(self) -> Value {
        self.stack.slot(self.fp - 2)
    }

    /// Raw bytecode pointer; only valid while the stack is not cooked.
    pub fn bytecode_pointer(self) -> usize {
        self.stack.slot_raw(self.fp - 1)
    }

    pub fn set_bytecode_pointer(self, bcp: usize) {
        self.stack.set_slot_raw(self.fp - 1, bcp);
    }

    /// The bcp slot as a tagged value; only valid while the stack is cooked.
    pub fn cooked_value(self) -> Value {
        self.stack.slot(self.fp - 1)
    }

    pub fn set_cooked_value(self, value: Value) {
        self.stack.set_slot(self.fp - 1, value);
    }
}

/// Iterates the frames of a stack, newest first.
pub struct Frames {
    stack: Stack,
    fp: usize,
}

impl Iterator for Frames {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.fp == 0 {
            return None;
        }
        let frame = Frame {
            stack: self.stack,
            fp: self.fp,
        };
        self.fp = self.stack.slot(self.fp).as_smi() as usize;
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_format_packing() {
        let format = InstanceFormat::instance_with_marker(3, Marker::Coroutine);
        assert_eq!(format.kind(), ObjectKind::Instance);
        assert_eq!(format.marker(), Marker::Coroutine);
        assert_eq!(format.fixed_size(), 5 * WORD_SIZE);

        let round_tripped = InstanceFormat::from_value(format.as_value());
        assert_eq!(round_tripped.kind(), ObjectKind::Instance);
        assert_eq!(round_tripped.marker(), Marker::Coroutine);
        assert_eq!(round_tripped.fixed_size(), format.fixed_size());
    }

    #[test]
    fn test_meta_word_packing() {
        let mut backing = [0usize; 4];
        let object = HeapObject::from_address(backing.as_mut_ptr() as usize);
        object.set_meta(0);
        object.set_identity_hash(0xDEAD_BEEF);
        object.set_age(3);
        assert_eq!(object.identity_hash(), 0xDEAD_BEEF);
        assert_eq!(object.age(), 3);
        assert!(!object.is_forwarded());

        object.set_age(2);
        assert_eq!(object.identity_hash(), 0xDEAD_BEEF);
        assert_eq!(object.age(), 2);
    }

    #[test]
    fn test_age_saturates() {
        let mut backing = [0usize; 4];
        let object = HeapObject::from_address(backing.as_mut_ptr() as usize);
        object.set_meta(0);
        object.set_age(100);
        assert_eq!(object.age(), 15);
    }
}
