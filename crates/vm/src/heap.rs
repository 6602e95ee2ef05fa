//! The shared process heap and object factories.
//!
//! [`TwoSpaceHeap`] pairs a bump-allocated new space with a free-list old
//! space. New objects allocate in new space; objects at or above the large
//! object limit go straight to old space. Allocation failure is the
//! recoverable [`AllocationFailed`] error: the caller collects garbage and
//! retries, and only terminates the process if the retry fails too.
//!
//! Pointer stores from old space into new space must go through
//! [`TwoSpaceHeap::write_field`], which feeds the remembered set.

use thiserror::Error;

use crate::object::{
    round_up_to_word, Array, Boxed, ByteArray, Class, DispatchTableEntry, Double, Function,
    HeapObject, Initializer, Instance, InstanceFormat, LargeInteger, OneByteString, Stack,
    TwoByteString, CLASS_OFFSET,
};
use crate::old_space::OldSpace;
use crate::space::{SemiSpace, WeakCallback};
use crate::value::{PointerVisitor, Value, WORD_SIZE};

/// Recoverable allocation failure: collect garbage and retry. A second
/// failure after a collection is an out-of-memory condition and surfaces as
/// a process termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("allocation failed; collect garbage and retry")]
pub struct AllocationFailed;

/// Sizing and diagnostics knobs for a program's heaps.
#[derive(Clone, Debug)]
pub struct HeapConfig {
    /// Size of each semispace of the process heap.
    pub semi_space_size: usize,
    /// Chunk size for old space.
    pub old_space_chunk_size: usize,
    /// Initial old-space allocation budget.
    pub initial_old_budget: usize,
    /// Objects at or above this size allocate directly in old space.
    pub large_object_limit: usize,
    /// Chunk size for the program (code/class) heap.
    pub program_chunk_size: usize,
    /// Slot count for newly spawned execution stacks.
    pub initial_stack_slots: usize,
    /// Print collection info to stderr.
    pub debug: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            semi_space_size: 256 * 1024,
            old_space_chunk_size: 256 * 1024,
            initial_old_budget: 1024 * 1024,
            large_object_limit: 8 * 1024,
            program_chunk_size: 128 * 1024,
            initial_stack_slots: 1024,
            debug: false,
        }
    }
}

/// Counters describing GC activity: cheap to update, readable at any time.
#[derive(Clone, Debug, Default)]
pub struct GcStats {
    /// New-space collections performed.
    pub scavenges: u64,
    /// Old-space collections performed (sweeping or compacting).
    pub old_space_collections: u64,
    /// Program-space collections performed.
    pub program_collections: u64,
    /// Bytes promoted from new space to old space.
    pub bytes_promoted: u64,
    /// Bytes handed out by the process-heap allocator.
    pub bytes_allocated: u64,
}

/// Anything that can hand out raw object storage.
pub(crate) trait AllocateRaw {
    fn allocate_raw(&mut self, size: usize) -> Result<usize, AllocationFailed>;
}

impl AllocateRaw for SemiSpace {
    fn allocate_raw(&mut self, size: usize) -> Result<usize, AllocationFailed> {
        self.allocate(size).ok_or(AllocationFailed)
    }
}

/// The data heap shared by every process of a program.
pub struct TwoSpaceHeap {
    space: SemiSpace,
    other: SemiSpace,
    old_space: OldSpace,
    large_object_limit: usize,
    semi_space_size: usize,
    initial_old_budget: usize,
    stats: GcStats,
}

impl AllocateRaw for TwoSpaceHeap {
    fn allocate_raw(&mut self, size: usize) -> Result<usize, AllocationFailed> {
        self.stats.bytes_allocated += size as u64;
        if size >= self.large_object_limit {
            return self.old_space.allocate(size).ok_or(AllocationFailed);
        }
        self.space.allocate(size).ok_or(AllocationFailed)
    }
}

impl TwoSpaceHeap {
    pub fn new(config: &HeapConfig) -> TwoSpaceHeap {
        TwoSpaceHeap {
            space: SemiSpace::new(config.semi_space_size, false),
            other: SemiSpace::new(config.semi_space_size, false),
            old_space: OldSpace::new(config.old_space_chunk_size, config.initial_old_budget),
            large_object_limit: config.large_object_limit,
            semi_space_size: config.semi_space_size,
            initial_old_budget: config.initial_old_budget,
            stats: GcStats::default(),
        }
    }

    pub fn new_space(&self) -> &SemiSpace {
        &self.space
    }

    pub fn new_space_mut(&mut self) -> &mut SemiSpace {
        &mut self.space
    }

    pub fn old_space(&self) -> &OldSpace {
        &self.old_space
    }

    pub fn old_space_mut(&mut self) -> &mut OldSpace {
        &mut self.old_space
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut GcStats {
        &mut self.stats
    }

    pub fn has_empty_new_space(&self) -> bool {
        self.space.is_empty()
    }

    pub fn contains(&self, address: usize) -> bool {
        self.space.contains(address) || self.old_space.contains(address)
    }

    /// Raw allocation entry point for the interpreter: success or failure,
    /// nothing else.
    pub fn allocate(&mut self, size: usize) -> Result<usize, AllocationFailed> {
        self.allocate_raw(round_up_to_word(size))
    }

    /// Store `value` into a pointer field of `object`, recording the card in
    /// the remembered set when this creates an old-to-new pointer.
    pub fn write_field(&mut self, object: HeapObject, offset: usize, value: Value) {
        object.set_value_at(offset, value);
        if value.is_heap_object()
            && self.space.contains(value.address())
            && self.old_space.contains(object.address())
        {
            self.old_space.record_write(object.slot_address(offset));
        }
    }

    /// Register a weak pointer in the space that owns `object`.
    pub fn register_weak_pointer(&mut self, object: HeapObject, callback: WeakCallback) {
        if self.old_space.contains(object.address()) {
            self.old_space.register_weak_pointer(object, callback);
        } else {
            self.space.register_weak_pointer(object, callback);
        }
    }

    pub(crate) fn swap_semispaces(&mut self) {
        std::mem::swap(&mut self.space, &mut self.other);
    }

    /// Split borrows for the scavenger: (to-space, standby/from, old space).
    pub(crate) fn spaces_mut(&mut self) -> (&mut SemiSpace, &mut SemiSpace, &mut OldSpace) {
        (&mut self.space, &mut self.other, &mut self.old_space)
    }

    /// Re-aim the old-space budget after a collection.
    pub(crate) fn adjust_old_allocation_budget(&mut self) {
        let budget = (self.old_space.used_after_last_gc() * 2 + self.semi_space_size)
            .max(self.initial_old_budget);
        self.old_space.set_allocation_budget(budget);
    }

    // Object factories. Large objects land in old space; the factory then
    // re-checks the remembered-set invariant for the initial fill values.

    pub fn create_array(
        &mut self,
        class: Class,
        length: usize,
        fill: Value,
    ) -> Result<Array, AllocationFailed> {
        let array = create_array(self, class, length, fill)?;
        self.record_initial_pointers(array.object());
        Ok(array)
    }

    pub fn create_byte_array(
        &mut self,
        class: Class,
        length: usize,
    ) -> Result<ByteArray, AllocationFailed> {
        create_byte_array(self, class, length)
    }

    pub fn create_one_byte_string(
        &mut self,
        class: Class,
        length: usize,
    ) -> Result<OneByteString, AllocationFailed> {
        create_one_byte_string(self, class, length)
    }

    pub fn create_two_byte_string(
        &mut self,
        class: Class,
        length: usize,
    ) -> Result<TwoByteString, AllocationFailed> {
        create_two_byte_string(self, class, length)
    }

    pub fn create_double(&mut self, class: Class, value: f64) -> Result<Double, AllocationFailed> {
        create_double(self, class, value)
    }

    pub fn create_large_integer(
        &mut self,
        class: Class,
        value: i64,
    ) -> Result<LargeInteger, AllocationFailed> {
        create_large_integer(self, class, value)
    }

    pub fn create_instance(
        &mut self,
        class: Class,
        fill: Value,
    ) -> Result<Instance, AllocationFailed> {
        let instance = create_instance(self, class, fill)?;
        self.record_initial_pointers(instance.object());
        Ok(instance)
    }

    pub fn create_boxed(&mut self, class: Class, value: Value) -> Result<Boxed, AllocationFailed> {
        let boxed = create_boxed(self, class, value)?;
        self.record_initial_pointers(boxed.object());
        Ok(boxed)
    }

    pub fn create_stack(&mut self, class: Class, length: usize) -> Result<Stack, AllocationFailed> {
        create_stack(self, class, length)
    }

    fn record_initial_pointers(&mut self, object: HeapObject) {
        if !self.old_space.contains(object.address()) {
            return;
        }
        struct Scan<'a> {
            space: &'a SemiSpace,
            found: bool,
        }
        impl PointerVisitor for Scan<'_> {
            fn visit(&mut self, slot: &mut Value) {
                let value = *slot;
                if value.is_heap_object() && self.space.contains(value.address()) {
                    self.found = true;
                }
            }
        }
        let mut scan = Scan {
            space: &self.space,
            found: false,
        };
        object.iterate_pointers(&mut scan);
        if scan.found {
            let start = object.address();
            self.old_space
                .record_cards_in_range(start, start + object.size());
        }
    }
}

// Free-standing factories shared by the program heap (a bare semispace) and
// the process heap. Every slot of a new object is initialized here because
// old-space storage may be recycled from the free list.

pub(crate) fn allocate_object<A: AllocateRaw>(
    alloc: &mut A,
    class: Value,
    size: usize,
) -> Result<HeapObject, AllocationFailed> {
    let address = alloc.allocate_raw(size)?;
    let object = HeapObject::from_address(address);
    object.set_value_at(CLASS_OFFSET, class);
    object.set_meta(0);
    Ok(object)
}

pub(crate) fn create_class<A: AllocateRaw>(
    alloc: &mut A,
    format: InstanceFormat,
    meta_class: Value,
    null: Value,
) -> Result<Class, AllocationFailed> {
    let object = allocate_object(alloc, meta_class, InstanceFormat::class().fixed_size())?;
    let class = Class::cast(object);
    class.set_instance_format(format);
    class.set_superclass(null);
    class.set_methods(null);
    Ok(class)
}

/// The meta class is its own class.
pub(crate) fn create_meta_class<A: AllocateRaw>(
    alloc: &mut A,
    null: Value,
) -> Result<Class, AllocationFailed> {
    let object = allocate_object(alloc, Value::ZERO, InstanceFormat::class().fixed_size())?;
    object.set_value_at(CLASS_OFFSET, object.to_value());
    let class = Class::cast(object);
    class.set_instance_format(InstanceFormat::class());
    class.set_superclass(null);
    class.set_methods(null);
    Ok(class)
}

pub(crate) fn create_array<A: AllocateRaw>(
    alloc: &mut A,
    class: Class,
    length: usize,
    fill: Value,
) -> Result<Array, AllocationFailed> {
    let size = InstanceFormat::array().fixed_size() + length * WORD_SIZE;
    let object = allocate_object(alloc, class.to_value(), size)?;
    let array = Array::cast(object);
    array.set_length(length);
    for i in 0..length {
        array.set(i, fill);
    }
    Ok(array)
}

pub(crate) fn create_byte_array<A: AllocateRaw>(
    alloc: &mut A,
    class: Class,
    length: usize,
) -> Result<ByteArray, AllocationFailed> {
    let size = InstanceFormat::byte_array().fixed_size() + round_up_to_word(length);
    let object = allocate_object(alloc, class.to_value(), size)?;
    let bytes = ByteArray::cast(object);
    bytes.set_length(length);
    unsafe {
        std::ptr::write_bytes(
            (object.address() + ByteArray::DATA_OFFSET) as *mut u8,
            0,
            round_up_to_word(length),
        );
    }
    Ok(bytes)
}

pub(crate) fn create_one_byte_string<A: AllocateRaw>(
    alloc: &mut A,
    class: Class,
    length: usize,
) -> Result<OneByteString, AllocationFailed> {
    let size = InstanceFormat::one_byte_string().fixed_size() + round_up_to_word(length);
    let object = allocate_object(alloc, class.to_value(), size)?;
    let string = OneByteString::cast(object);
    string.set_length(length);
    unsafe {
        std::ptr::write_bytes(
            (object.address() + OneByteString::DATA_OFFSET) as *mut u8,
            0,
            round_up_to_word(length),
        );
    }
    Ok(string)
}

pub(crate) fn create_two_byte_string<A: AllocateRaw>(
    alloc: &mut A,
    class: Class,
    length: usize,
) -> Result<TwoByteString, AllocationFailed> {
    let size = InstanceFormat::two_byte_string().fixed_size() + round_up_to_word(length * 2);
    let object = allocate_object(alloc, class.to_value(), size)?;
    let string = TwoByteString::cast(object);
    string.set_length(length);
    unsafe {
        std::ptr::write_bytes(
            (object.address() + TwoByteString::DATA_OFFSET) as *mut u8,
            0,
            round_up_to_word(length * 2),
        );
    }
    Ok(string)
}

pub(crate) fn create_function<A: AllocateRaw>(
    alloc: &mut A,
    class: Class,
    arity: usize,
    bytecode: &[u8],
    literal_count: usize,
    literal_fill: Value,
) -> Result<Function, AllocationFailed> {
    let size = InstanceFormat::function().fixed_size()
        + round_up_to_word(bytecode.len())
        + literal_count * WORD_SIZE;
    let object = allocate_object(alloc, class.to_value(), size)?;
    object.set_value_at(Function::ARITY_OFFSET, Value::from_smi(arity as isize));
    object.set_value_at(
        Function::LITERAL_COUNT_OFFSET,
        Value::from_smi(literal_count as isize),
    );
    object.set_value_at(
        Function::BYTECODE_SIZE_OFFSET,
        Value::from_smi(bytecode.len() as isize),
    );
    let function = Function::cast(object);
    unsafe {
        std::ptr::write_bytes(
            function.bytecode_address_for(0) as *mut u8,
            0,
            round_up_to_word(bytecode.len()),
        );
        std::ptr::copy_nonoverlapping(
            bytecode.as_ptr(),
            function.bytecode_address_for(0) as *mut u8,
            bytecode.len(),
        );
    }
    for i in 0..literal_count {
        function.set_literal_at(i, literal_fill);
    }
    Ok(function)
}

pub(crate) fn create_double<A: AllocateRaw>(
    alloc: &mut A,
    class: Class,
    value: f64,
) -> Result<Double, AllocationFailed> {
    let object = allocate_object(alloc, class.to_value(), InstanceFormat::double().fixed_size())?;
    let double = Double::cast(object);
    double.set_value(value);
    Ok(double)
}

pub(crate) fn create_large_integer<A: AllocateRaw>(
    alloc: &mut A,
    class: Class,
    value: i64,
) -> Result<LargeInteger, AllocationFailed> {
    let object = allocate_object(
        alloc,
        class.to_value(),
        InstanceFormat::large_integer().fixed_size(),
    )?;
    let integer = LargeInteger::cast(object);
    integer.set_value(value);
    Ok(integer)
}

pub(crate) fn create_instance<A: AllocateRaw>(
    alloc: &mut A,
    class: Class,
    fill: Value,
) -> Result<Instance, AllocationFailed> {
    let format = class.instance_format();
    let object = allocate_object(alloc, class.to_value(), format.fixed_size())?;
    let instance = Instance::cast(object);
    for i in 0..class.number_of_instance_fields() {
        instance.set_field(i, fill);
    }
    Ok(instance)
}

pub(crate) fn create_initializer<A: AllocateRaw>(
    alloc: &mut A,
    class: Class,
    function: Value,
) -> Result<Initializer, AllocationFailed> {
    let object = allocate_object(
        alloc,
        class.to_value(),
        InstanceFormat::initializer().fixed_size(),
    )?;
    let initializer = Initializer::cast(object);
    initializer.set_function(function);
    Ok(initializer)
}

pub(crate) fn create_dispatch_table_entry<A: AllocateRaw>(
    alloc: &mut A,
    class: Class,
    fill: Value,
) -> Result<DispatchTableEntry, AllocationFailed> {
    let object = allocate_object(
        alloc,
        class.to_value(),
        InstanceFormat::dispatch_table_entry().fixed_size(),
    )?;
    let entry = DispatchTableEntry::cast(object);
    entry.set_target(fill);
    entry.set_code(Value::ZERO);
    Ok(entry)
}

pub(crate) fn create_boxed<A: AllocateRaw>(
    alloc: &mut A,
    class: Class,
    value: Value,
) -> Result<Boxed, AllocationFailed> {
    let object = allocate_object(alloc, class.to_value(), InstanceFormat::boxed().fixed_size())?;
    let boxed = Boxed::cast(object);
    boxed.set_value(value);
    Ok(boxed)
}

pub(crate) fn create_stack<A: AllocateRaw>(
    alloc: &mut A,
    class: Class,
    length: usize,
) -> Result<Stack, AllocationFailed> {
    let size = InstanceFormat::stack().fixed_size() + length * WORD_SIZE;
    let object = allocate_object(alloc, class.to_value(), size)?;
    let stack = Stack::cast(object);
    stack.set_length(length);
    stack.set_top(0);
    stack.set_fp(0);
    stack.set_next(Value::ZERO);
    for i in 0..length {
        stack.set_slot(i, Value::ZERO);
    }
    Ok(stack)
}
