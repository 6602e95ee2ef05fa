//! The program: heaps, roots, processes, and every collector entry point.
//!
//! A [`Program`] owns the immutable program heap (classes, functions,
//! canonical singletons), the two-space process heap shared by all of its
//! processes, the mutex-protected process list, and the optional debugger
//! state. It is a per-VM object passed around explicitly; only the top
//! level constructs one.
//!
//! The collector entry points live here because they coordinate all of the
//! above: new-space scavenges, alternating sweep/compact old-space
//! collections, and the program collection that moves the code graph while
//! live interpreter stacks are cooked.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::debug_info::DebugInfo;
use crate::heap::{self, AllocationFailed, HeapConfig, TwoSpaceHeap};
use crate::mark_sweep::MarkingVisitor;
use crate::object::{
    Array, Boxed, ByteArray, Class, Coroutine, DispatchTableEntry, Double, Function, HeapObject,
    Initializer, Instance, InstanceFormat, LargeInteger, Marker, ObjectKind, OneByteString, Stack,
    TwoByteString, CLASS_OFFSET,
};
use crate::old_space::FixPointersVisitor;
use crate::process::{Pid, Process, ProcessList, ProcessState, Signal};
use crate::scavenger::{scavenge_new_space, ProgramScavenger};
use crate::space::SemiSpace;
use crate::value::{PointerVisitor, Value, WORD_SIZE};

/// Exit code reported for a compile-time error.
pub const COMPILE_TIME_ERROR_EXIT_CODE: i32 = 254;

/// Exit code reported for an uncaught exception (also used for unhandled
/// signals and killed processes).
pub const UNCAUGHT_EXCEPTION_EXIT_CODE: i32 = 255;

/// How many popular objects the snapshot collector packs at the heap start.
pub const TOP_POPULAR_OBJECTS: usize = 32;

/// The named roots of a program, all in program space.
///
/// `null_object`, `false_object` and `true_object` must be visited first
/// and in that order: the copying collector preserves visit order, and the
/// interpreter classifies booleans by the 2-word spacing between the three
/// singletons.
pub struct ProgramRoots {
    pub null_object: Value,
    pub false_object: Value,
    pub true_object: Value,
    pub meta_class: Value,
    pub object_class: Value,
    pub bool_class: Value,
    pub num_class: Value,
    pub int_class: Value,
    pub smi_class: Value,
    pub large_integer_class: Value,
    pub double_class: Value,
    pub boxed_class: Value,
    pub one_byte_string_class: Value,
    pub two_byte_string_class: Value,
    pub array_class: Value,
    pub byte_array_class: Value,
    pub function_class: Value,
    pub stack_class: Value,
    pub coroutine_class: Value,
    pub port_class: Value,
    pub process_class: Value,
    pub initializer_class: Value,
    pub dispatch_table_entry_class: Value,
    pub empty_array: Value,
    pub empty_string: Value,
    pub raw_retry_after_gc: Value,
    pub raw_wrong_argument_type: Value,
    pub raw_index_out_of_bounds: Value,
    pub raw_illegal_state: Value,
    pub entry: Value,
}

impl ProgramRoots {
    /// Visit every root slot. Order matters for the first three.
    pub fn iterate(&mut self, visitor: &mut dyn PointerVisitor) {
        visitor.visit(&mut self.null_object);
        visitor.visit(&mut self.false_object);
        visitor.visit(&mut self.true_object);
        visitor.visit(&mut self.meta_class);
        visitor.visit(&mut self.object_class);
        visitor.visit(&mut self.bool_class);
        visitor.visit(&mut self.num_class);
        visitor.visit(&mut self.int_class);
        visitor.visit(&mut self.smi_class);
        visitor.visit(&mut self.large_integer_class);
        visitor.visit(&mut self.double_class);
        visitor.visit(&mut self.boxed_class);
        visitor.visit(&mut self.one_byte_string_class);
        visitor.visit(&mut self.two_byte_string_class);
        visitor.visit(&mut self.array_class);
        visitor.visit(&mut self.byte_array_class);
        visitor.visit(&mut self.function_class);
        visitor.visit(&mut self.stack_class);
        visitor.visit(&mut self.coroutine_class);
        visitor.visit(&mut self.port_class);
        visitor.visit(&mut self.process_class);
        visitor.visit(&mut self.initializer_class);
        visitor.visit(&mut self.dispatch_table_entry_class);
        visitor.visit(&mut self.empty_array);
        visitor.visit(&mut self.empty_string);
        visitor.visit(&mut self.raw_retry_after_gc);
        visitor.visit(&mut self.raw_wrong_argument_type);
        visitor.visit(&mut self.raw_index_out_of_bounds);
        visitor.visit(&mut self.raw_illegal_state);
        visitor.visit(&mut self.entry);
    }
}

/// Incoming-pointer tally used by the snapshot collector to pack the most
/// pointed-at objects near the heap start. Ties break by first-encounter
/// order, so the result is deterministic for a given heap.
pub struct PopularityCounter {
    counts: HashMap<usize, usize>,
    entries: Vec<(Value, u32)>,
    most_popular: Vec<Value>,
}

impl PopularityCounter {
    pub fn new() -> PopularityCounter {
        PopularityCounter {
            counts: HashMap::new(),
            entries: Vec::new(),
            most_popular: Vec::new(),
        }
    }

    pub fn find_most_popular(&mut self, limit: usize) {
        let mut indices: Vec<usize> = (0..self.entries.len()).collect();
        indices.sort_by(|&a, &b| {
            self.entries[b]
                .1
                .cmp(&self.entries[a].1)
                .then(a.cmp(&b))
        });
        self.most_popular = indices
            .into_iter()
            .take(limit)
            .map(|i| self.entries[i].0)
            .collect();
    }

    pub fn most_popular(&self) -> &[Value] {
        &self.most_popular
    }
}

impl Default for PopularityCounter {
    fn default() -> Self {
        PopularityCounter::new()
    }
}

impl PointerVisitor for PopularityCounter {
    fn visit(&mut self, slot: &mut Value) {
        let value = *slot;
        if !value.is_heap_object() {
            return;
        }
        let entries = &mut self.entries;
        let index = *self.counts.entry(value.address()).or_insert_with(|| {
            entries.push((value, 0));
            entries.len() - 1
        });
        self.entries[index].1 += 1;
    }
}

/// Boxes smis too large for a 32-bit host into large integers, so snapshots
/// stay portable across word sizes.
struct BigSmiFixer<'a> {
    space: &'a mut SemiSpace,
    large_integer_class: Value,
}

impl BigSmiFixer<'_> {
    /// Growing cursor walk: boxed integers allocated during the walk are
    /// themselves visited, which is harmless (they hold no smis).
    fn run(&mut self) {
        let mut chunk_index = 0;
        while chunk_index < self.space.chunk_count() {
            let (base, _) = self.space.chunk_span(chunk_index);
            let mut cursor = base;
            while cursor < self.space.chunk_span(chunk_index).1 {
                let object = HeapObject::from_address(cursor);
                let size = object.size();
                object.iterate_pointers(self);
                cursor += size;
            }
            chunk_index += 1;
        }
    }
}

impl PointerVisitor for BigSmiFixer<'_> {
    fn visit(&mut self, slot: &mut Value) {
        let value = *slot;
        if !value.is_smi() {
            return;
        }
        let raw = value.as_smi() as i64;
        if Value::is_portable_smi(raw) {
            return;
        }
        let class = Class::cast(HeapObject::from_value(self.large_integer_class));
        let boxed = heap::create_large_integer(self.space, class, raw)
            .expect("program setup allocates inside a no-allocation-failure scope");
        *slot = boxed.to_value();
    }
}

/// Size breakdown of the program heap.
#[derive(Clone, Debug, Default)]
pub struct ProgramStatistics {
    pub heap_bytes: usize,
    pub object_count: usize,
    pub class_count: usize,
    pub array_count: usize,
    pub array_bytes: usize,
    pub string_count: usize,
    pub string_bytes: usize,
    pub function_count: usize,
    pub function_bytes: usize,
    pub bytecode_bytes: usize,
}

/// A per-VM managed program: code heap, data heap, processes, debugger.
pub struct Program {
    config: HeapConfig,
    heap: SemiSpace,
    process_heap: TwoSpaceHeap,
    roots: ProgramRoots,
    process_list: Mutex<ProcessList>,
    stack_chain: Value,
    cooked_stack_deltas: Vec<Vec<usize>>,
    debug_info: Option<DebugInfo>,
    random: SmallRng,
    snapshot_hash: u32,
    loaded_from_snapshot: bool,
    exit_kind: Signal,
}

impl Program {
    /// Construct a program and bootstrap its root set.
    pub fn new(config: HeapConfig) -> Program {
        let mut program_space = SemiSpace::new(config.program_chunk_size, true);
        program_space.enter_no_allocation_failure_scope();
        let roots = bootstrap_roots(&mut program_space)
            .expect("program setup allocates inside a no-allocation-failure scope");
        program_space.leave_no_allocation_failure_scope();
        let process_heap = TwoSpaceHeap::new(&config);
        let program = Program {
            config,
            heap: program_space,
            process_heap,
            roots,
            process_list: Mutex::new(ProcessList::new()),
            stack_chain: Value::ZERO,
            cooked_stack_deltas: Vec::new(),
            debug_info: None,
            random: SmallRng::seed_from_u64(0),
            snapshot_hash: 0,
            loaded_from_snapshot: false,
            exit_kind: Signal::Terminated,
        };
        program.verify_object_placements();
        program
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn roots(&self) -> &ProgramRoots {
        &self.roots
    }

    pub fn program_space(&self) -> &SemiSpace {
        &self.heap
    }

    pub fn process_heap(&self) -> &TwoSpaceHeap {
        &self.process_heap
    }

    pub fn process_heap_mut(&mut self) -> &mut TwoSpaceHeap {
        &mut self.process_heap
    }

    pub fn exit_kind(&self) -> Signal {
        self.exit_kind
    }

    pub fn snapshot_hash(&self) -> u32 {
        self.snapshot_hash
    }

    pub fn was_loaded_from_snapshot(&self) -> bool {
        self.loaded_from_snapshot
    }

    /// Recorded by the snapshot loader after it has populated the heap.
    pub fn mark_loaded_from_snapshot(&mut self, hash: u32) {
        self.loaded_from_snapshot = true;
        self.snapshot_hash = hash;
    }

    pub fn exit_code(&self) -> i32 {
        match self.exit_kind {
            Signal::Terminated => 0,
            Signal::CompileTimeError => COMPILE_TIME_ERROR_EXIT_CODE,
            Signal::UncaughtException | Signal::UnhandledSignal | Signal::Killed => {
                UNCAUGHT_EXCEPTION_EXIT_CODE
            }
            Signal::ShouldKill => unreachable!("a kill request never becomes an exit kind"),
        }
    }

    // Typed root accessors used all over the creation paths.

    pub fn null_object(&self) -> Value {
        self.roots.null_object
    }

    pub fn true_object(&self) -> Value {
        self.roots.true_object
    }

    pub fn false_object(&self) -> Value {
        self.roots.false_object
    }

    fn class_root(&self, root: Value) -> Class {
        Class::cast(HeapObject::from_value(root))
    }

    pub fn array_class(&self) -> Class {
        self.class_root(self.roots.array_class)
    }

    pub fn function_class(&self) -> Class {
        self.class_root(self.roots.function_class)
    }

    pub fn double_class(&self) -> Class {
        self.class_root(self.roots.double_class)
    }

    pub fn large_integer_class(&self) -> Class {
        self.class_root(self.roots.large_integer_class)
    }

    pub fn boxed_class(&self) -> Class {
        self.class_root(self.roots.boxed_class)
    }

    pub fn stack_class(&self) -> Class {
        self.class_root(self.roots.stack_class)
    }

    pub fn coroutine_class(&self) -> Class {
        self.class_root(self.roots.coroutine_class)
    }

    pub fn one_byte_string_class(&self) -> Class {
        self.class_root(self.roots.one_byte_string_class)
    }

    /// The program entry function; set by the loader before the main
    /// process is spawned.
    pub fn entry(&self) -> Option<Function> {
        if self.roots.entry.is_heap_object() {
            Some(Function::cast(HeapObject::from_value(self.roots.entry)))
        } else {
            None
        }
    }

    pub fn set_entry(&mut self, entry: Function) {
        self.roots.entry = entry.to_value();
    }

    // Program-space object creation (setup-time, no-failure allocation).

    pub fn create_class(&mut self, fields: usize) -> Result<Class, AllocationFailed> {
        heap::create_class(
            &mut self.heap,
            InstanceFormat::instance(fields),
            self.roots.meta_class,
            self.roots.null_object,
        )
    }

    pub fn create_array(&mut self, capacity: usize) -> Result<Array, AllocationFailed> {
        let fill = self.roots.null_object;
        self.create_array_with(capacity, fill)
    }

    pub fn create_array_with(
        &mut self,
        capacity: usize,
        initial: Value,
    ) -> Result<Array, AllocationFailed> {
        let class = self.class_root(self.roots.array_class);
        heap::create_array(&mut self.heap, class, capacity, initial)
    }

    pub fn create_byte_array(&mut self, length: usize) -> Result<ByteArray, AllocationFailed> {
        let class = self.class_root(self.roots.byte_array_class);
        heap::create_byte_array(&mut self.heap, class, length)
    }

    pub fn create_double(&mut self, value: f64) -> Result<Double, AllocationFailed> {
        let class = self.double_class();
        heap::create_double(&mut self.heap, class, value)
    }

    pub fn create_function(
        &mut self,
        arity: usize,
        bytecode: &[u8],
        literal_count: usize,
    ) -> Result<Function, AllocationFailed> {
        let class = self.function_class();
        heap::create_function(
            &mut self.heap,
            class,
            arity,
            bytecode,
            literal_count,
            self.roots.null_object,
        )
    }

    pub fn create_large_integer(&mut self, value: i64) -> Result<LargeInteger, AllocationFailed> {
        let class = self.large_integer_class();
        heap::create_large_integer(&mut self.heap, class, value)
    }

    /// A smi when the value fits, a boxed large integer otherwise.
    pub fn create_integer(&mut self, value: i64) -> Result<Value, AllocationFailed> {
        if Value::is_valid_smi(value) {
            Ok(Value::from_smi(value as isize))
        } else {
            Ok(self.create_large_integer(value)?.to_value())
        }
    }

    pub fn create_string_from_ascii(
        &mut self,
        text: &str,
    ) -> Result<OneByteString, AllocationFailed> {
        debug_assert!(text.is_ascii());
        let class = self.class_root(self.roots.one_byte_string_class);
        create_string_from_ascii(&mut self.heap, class, text)
    }

    pub fn create_one_byte_string(
        &mut self,
        bytes: &[u8],
    ) -> Result<OneByteString, AllocationFailed> {
        let class = self.class_root(self.roots.one_byte_string_class);
        let string = heap::create_one_byte_string(&mut self.heap, class, bytes.len())?;
        for (i, &byte) in bytes.iter().enumerate() {
            string.set_char_code(i, byte);
        }
        Ok(string)
    }

    pub fn create_two_byte_string(
        &mut self,
        units: &[u16],
    ) -> Result<TwoByteString, AllocationFailed> {
        let class = self.class_root(self.roots.two_byte_string_class);
        let string = heap::create_two_byte_string(&mut self.heap, class, units.len())?;
        for (i, &unit) in units.iter().enumerate() {
            string.set_code_unit(i, unit);
        }
        Ok(string)
    }

    pub fn create_instance(&mut self, class: Class) -> Result<Instance, AllocationFailed> {
        heap::create_instance(&mut self.heap, class, self.roots.null_object)
    }

    /// A mutable one-slot cell, used for late-bound globals.
    pub fn create_boxed(&mut self, value: Value) -> Result<Boxed, AllocationFailed> {
        let class = self.boxed_class();
        heap::create_boxed(&mut self.heap, class, value)
    }

    pub fn create_initializer(
        &mut self,
        function: Function,
    ) -> Result<Initializer, AllocationFailed> {
        let class = self.class_root(self.roots.initializer_class);
        heap::create_initializer(&mut self.heap, class, function.to_value())
    }

    pub fn create_dispatch_table_entry(
        &mut self,
    ) -> Result<DispatchTableEntry, AllocationFailed> {
        let class = self.class_root(self.roots.dispatch_table_entry_class);
        heap::create_dispatch_table_entry(&mut self.heap, class, self.roots.null_object)
    }

    /// Lazily assigned identity hash, stable across collections because the
    /// header meta word moves with the object.
    pub fn identity_hash(&mut self, object: HeapObject) -> u32 {
        let existing = object.identity_hash();
        if existing != 0 {
            return existing;
        }
        let mut hash = self.random.gen::<u32>();
        while hash == 0 {
            hash = self.random.gen();
        }
        object.set_identity_hash(hash);
        hash
    }

    // Process lifecycle.

    /// Spawn a process sharing this program's heap. Returns the allocation
    /// failure when the execution stack cannot be built; the caller should
    /// collect garbage and retry.
    pub fn spawn_process(&mut self, parent: Option<Pid>) -> Result<Pid, AllocationFailed> {
        let stack_class = self.stack_class();
        let coroutine_class = self.coroutine_class();
        let null = self.roots.null_object;
        let slots = self.config.initial_stack_slots;
        let stack = self.process_heap.create_stack(stack_class, slots)?;
        let coroutine = self.process_heap.create_instance(coroutine_class, null)?;
        self.process_heap.write_field(
            coroutine.object(),
            Instance::FIELDS_OFFSET + Coroutine::STACK_FIELD * WORD_SIZE,
            stack.to_value(),
        );

        let list = self.process_list.get_mut();
        let pid = list.allocate_pid();
        let mut process = Process::new(pid, parent);
        process.set_coroutine(coroutine.to_value());
        if let Some(parent_pid) = parent {
            if let Some(parent_process) = list.get_mut(parent_pid) {
                parent_process.process_triangle_count += 1;
            }
        }
        list.insert(process);
        Ok(pid)
    }

    /// Spawn the main process and push the initial frame executing the
    /// program entry function.
    pub fn spawn_process_for_main(&mut self) -> Result<Pid, AllocationFailed> {
        self.verify_object_placements();
        let pid = self.spawn_process(None)?;
        if let Some(entry) = self.entry() {
            let bcp = entry.bytecode_address_for(0);
            let list = self.process_list.get_mut();
            if let Some(process) = list.get_mut(pid) {
                process.stack().push_frame(entry, bcp);
            }
        }
        Ok(pid)
    }

    /// Clean up `pid` and walk the parent chain: every ancestor whose
    /// triangle count reaches zero is removed and deleted. Returns true if
    /// the whole chain up to the root was torn down. The main process's
    /// exit signal becomes the program exit kind.
    pub fn schedule_process_for_deletion(&mut self, pid: Pid, kind: Signal) -> bool {
        let list = self.process_list.get_mut();
        let Some(process) = list.get_mut(pid) else {
            return false;
        };
        debug_assert!(process.state() == ProcessState::WaitingForChildren);
        process.cleanup(kind);

        let mut exit_kind = None;
        let mut current = Some(pid);
        while let Some(cur) = current {
            let Some(process) = list.get_mut(cur) else {
                break;
            };
            let parent = process.parent();
            process.process_triangle_count -= 1;
            debug_assert!(process.process_triangle_count >= 0);
            if process.process_triangle_count > 0 {
                return false;
            }
            if parent.is_none() {
                exit_kind = Some(process.links().exit_signal());
            }
            list.remove(cur);
            current = parent;
        }
        if let Some(kind) = exit_kind {
            self.exit_kind = kind;
        }
        true
    }

    /// The first live process, by spawn order.
    pub fn main_process(&self) -> Option<Pid> {
        self.process_list.lock().first()
    }

    pub fn process_count(&self) -> usize {
        self.process_list.lock().len()
    }

    /// Run `callback` with the process for `pid`, under the list mutex.
    pub fn with_process<R>(
        &mut self,
        pid: Pid,
        callback: impl FnOnce(&mut Process) -> R,
    ) -> Option<R> {
        self.process_list.get_mut().get_mut(pid).map(callback)
    }

    // Debugger.

    pub fn ensure_debugger_attached(&mut self) -> &mut DebugInfo {
        self.debug_info.get_or_insert_with(DebugInfo::new)
    }

    pub fn debug_info(&self) -> Option<&DebugInfo> {
        self.debug_info.as_ref()
    }

    pub fn debug_info_mut(&mut self) -> Option<&mut DebugInfo> {
        self.debug_info.as_mut()
    }

    /// Interpreter safepoint poll; false when no debugger is attached.
    pub fn should_break(&mut self, bcp: usize, sp: usize) -> bool {
        match self.debug_info.as_mut() {
            Some(info) => info.should_break(bcp, sp),
            None => false,
        }
    }

    // New-space collection.

    /// Scavenge the process heap's new space, then collect old space if the
    /// scavenge asked for it or the budget is exhausted.
    pub fn collect_new_space(&mut self) {
        if self.process_heap.has_empty_new_space() {
            self.collect_old_space_if_needed(false);
            return;
        }
        let trigger;
        {
            let Program {
                process_heap,
                process_list,
                stack_chain,
                debug_info,
                ..
            } = self;
            let list = process_list.get_mut();
            let outcome = scavenge_new_space(process_heap, |visitor| {
                for process in list.iter_mut() {
                    process.iterate_roots(visitor);
                }
                visitor.visit(stack_chain);
                if let Some(info) = debug_info.as_mut() {
                    info.visit_process_pointers(visitor);
                }
            });
            for process in list.iter_mut() {
                process.cleanup_ports();
            }
            trigger = outcome.trigger_old_space_gc;
        }
        if self.config.debug {
            let stats = self.process_heap.stats();
            eprintln!(
                "[GC] scavenge #{}: new {}/{} bytes, old {}/{} bytes",
                stats.scavenges,
                self.process_heap.new_space().used(),
                self.process_heap.new_space().size(),
                self.process_heap.old_space().used(),
                self.process_heap.old_space().size(),
            );
        }
        self.collect_old_space_if_needed(trigger);
    }

    pub fn collect_old_space_if_needed(&mut self, force: bool) {
        if force || self.process_heap.old_space().needs_garbage_collection() {
            self.collect_old_space();
        }
    }

    // Old-space collection.

    pub fn collect_old_space(&mut self) {
        let (used_before, size_before) = {
            let old = self.process_heap.old_space();
            (old.used(), old.size())
        };
        self.perform_shared_garbage_collection();
        if self.config.debug {
            let old = self.process_heap.old_space();
            eprintln!(
                "[GC] old-space #{}: {}/{} -> {}/{} bytes",
                self.process_heap.stats().old_space_collections,
                used_before,
                size_before,
                old.used(),
                old.size(),
            );
        }
    }

    /// Mark everything reachable, then sweep or compact: whichever the last
    /// cycle did not do.
    fn perform_shared_garbage_collection(&mut self) {
        self.mark_shared_heap(false);
        if self.process_heap.old_space().compacting() {
            // The last collection compacted, so fragmentation is low;
            // check for pointless cycles and sweep for speed.
            self.process_heap.old_space_mut().evaluate_pointlessness();
            self.process_heap.old_space_mut().clear_hard_limit_hit();
            self.sweep_shared_heap();
        } else {
            self.process_heap.old_space_mut().clear_hard_limit_hit();
            self.compact_shared_heap();
        }
        self.process_heap.adjust_old_allocation_budget();
        self.process_heap.stats_mut().old_space_collections += 1;
    }

    /// Tri-color mark over old and new space from all shared-heap roots.
    /// With `chain_stacks`, every live stack is linked into `stack_chain`;
    /// returns the number of stacks chained.
    fn mark_shared_heap(&mut self, chain_stacks: bool) -> usize {
        let Program {
            process_heap,
            process_list,
            stack_chain,
            debug_info,
            ..
        } = self;
        let (new_space, _, old_space) = process_heap.spaces_mut();
        let chain = if chain_stacks { Some(stack_chain) } else { None };
        let mut visitor = MarkingVisitor::new(new_space, old_space, chain);
        let list = process_list.get_mut();
        for process in list.iter_mut() {
            process.iterate_roots(&mut visitor);
        }
        if let Some(info) = debug_info.as_mut() {
            info.visit_process_pointers(&mut visitor);
        }
        visitor.process();
        visitor.number_of_stacks()
    }

    /// Non-moving collection: weak refs, ports, then free-list rebuild.
    fn sweep_shared_heap(&mut self) {
        {
            let old = self.process_heap.old_space_mut();
            old.set_compacting(false);
            old.process_weak_pointers();
        }
        for process in self.process_list.get_mut().iter_mut() {
            process.cleanup_ports();
        }
        let used = self.process_heap.old_space_mut().sweep();
        self.process_heap.old_space_mut().set_used_after_last_gc(used);
        // New-space mark bits only exist to catch liveness paths through
        // new space during marking.
        self.process_heap.new_space_mut().clear_mark_bits();
    }

    /// Moving collection: destinations, weak refs, pointer fixup across
    /// both spaces and all roots, then the actual moves.
    fn compact_shared_heap(&mut self) {
        let Program {
            process_heap,
            process_list,
            stack_chain,
            debug_info,
            ..
        } = self;
        let list = process_list.get_mut();

        let plan = {
            let old = process_heap.old_space_mut();
            old.set_compacting(true);
            let plan = old.compute_compaction_plan();
            // Weak processing happens when destinations are known but
            // before anything moves, while the mark bits are still valid.
            old.process_weak_pointers();
            old.update_weak_pointers_after_compaction(&plan);
            plan
        };
        for process in list.iter_mut() {
            process.cleanup_ports();
        }

        {
            let mut fix = FixPointersVisitor::new(&plan);
            process_heap
                .old_space()
                .iterate_objects(|object| object.iterate_pointers(&mut fix));
            process_heap
                .new_space()
                .iterate_objects(|object| object.iterate_pointers(&mut fix));
            for process in list.iter_mut() {
                process.iterate_roots(&mut fix);
            }
            fix.visit(stack_chain);
            if let Some(info) = debug_info.as_mut() {
                info.visit_process_pointers(&mut fix);
            }
        }

        {
            let (new_space, _, old_space) = process_heap.spaces_mut();
            let new_space_ref: &SemiSpace = new_space;
            old_space.compact(&plan, &|address| new_space_ref.contains(address));
            let used = old_space.used();
            old_space.set_used_after_last_gc(used);
            new_space.clear_mark_bits();
        }
    }

    // Program-space collection.

    /// Precise pre-pass, stack chaining, and cooking; afterwards the
    /// program heap may be scavenged.
    pub fn prepare_program_gc(&mut self) {
        // 1) Old-space GC: precise for global reachability.
        self.perform_shared_garbage_collection();
        // 2) New-space GC: now precise because no floating garbage holds
        //    old-to-new pointers.
        self.collect_new_space();
        // 3) Another old-space GC whose side effect chains up every live
        //    stack (including the ones in new space; those do not move).
        let number_of_stacks = self.collect_mutable_garbage_and_chain_stacks();
        self.cook_stacks(number_of_stacks);
    }

    /// Collect the program heap: every live class, function and singleton
    /// moves to a fresh space.
    pub fn collect_program_garbage(&mut self) {
        self.prepare_program_gc();
        self.perform_program_gc();
        self.finish_program_gc();
    }

    /// Scavenge program space into a fresh to-space. Stacks must already be
    /// cooked (see [`Program::prepare_program_gc`]).
    pub fn perform_program_gc(&mut self) {
        let to = SemiSpace::new(self.config.program_chunk_size, true);
        self.perform_program_gc_into(to, None);
    }

    /// Program collection biased for snapshot writing: oversized smis are
    /// boxed first, then `double_class`, `null`, `false`, `true` and the
    /// most popular objects are placed at the heap start.
    pub fn snapshot_gc(&mut self, popularity: &mut PopularityCounter) {
        if WORD_SIZE == 8 {
            self.box_oversized_smis();
        }
        self.collect_program_garbage();

        self.prepare_program_gc();
        self.heap
            .iterate_objects(|object| object.iterate_pointers(&mut *popularity));
        popularity.find_most_popular(TOP_POPULAR_OBJECTS);
        let popular: Vec<Value> = popularity.most_popular().to_vec();
        let to = SemiSpace::new(self.config.program_chunk_size, true);
        self.perform_program_gc_into(to, Some(&popular));
        self.finish_program_gc();
    }

    fn box_oversized_smis(&mut self) {
        let large_integer_class = self.roots.large_integer_class;
        self.heap.enter_no_allocation_failure_scope();
        {
            let mut fixer = BigSmiFixer {
                space: &mut self.heap,
                large_integer_class,
            };
            fixer.run();
        }
        self.heap.leave_no_allocation_failure_scope();
    }

    /// Scavenge program space into `to`. With `popular`, placement is
    /// prioritized for the snapshot layout before the ordinary root walk.
    fn perform_program_gc_into(&mut self, mut to: SemiSpace, popular: Option<&[Value]>) {
        to.enter_no_allocation_failure_scope();
        {
            let Program {
                heap,
                process_heap,
                roots,
                debug_info,
                ..
            } = self;
            let from_ranges = heap.chunk_spans();
            let mut scavenger = ProgramScavenger::new(from_ranges, &mut to);
            if let Some(popular_objects) = popular {
                // The boxed-double class first, for the deserializer; then
                // the three singletons whose relative placement the
                // interpreter depends on; then the popular prefix.
                scavenger.visit(&mut roots.double_class);
                scavenger.visit(&mut roots.null_object);
                scavenger.visit(&mut roots.false_object);
                scavenger.visit(&mut roots.true_object);
                for value in popular_objects {
                    let mut slot = *value;
                    scavenger.visit(&mut slot);
                }
            }
            roots.iterate(&mut scavenger);
            if let Some(info) = debug_info.as_mut() {
                info.visit_program_pointers(&mut scavenger);
            }
            // Forward every program pointer held by the process heap,
            // including the cooked bytecode slots in stacks.
            process_heap
                .new_space()
                .iterate_objects(|object| object.iterate_pointers(&mut scavenger));
            process_heap
                .old_space()
                .iterate_objects(|object| object.iterate_pointers(&mut scavenger));
            scavenger.complete_scavenge();
        }
        to.leave_no_allocation_failure_scope();
        for mut weak in self.heap.take_weak_pointers() {
            if weak.object.is_forwarded() {
                weak.object = weak.object.forwarding_target();
                to.weak_pointers_mut().push(weak);
            } else {
                let object = weak.object;
                (weak.callback)(object);
            }
        }
        self.heap = to;
        self.process_heap.stats_mut().program_collections += 1;
    }

    /// Uncook stacks, rebuild the breakpoint table, verify placements.
    pub fn finish_program_gc(&mut self) {
        self.uncook_and_unchain_stacks();
        if let Some(info) = self.debug_info.as_mut() {
            info.update_breakpoints();
        }
        self.verify_object_placements();
    }

    /// Old-space collection whose marking pass also links every live stack
    /// into `stack_chain`. Returns the number of stacks found.
    fn collect_mutable_garbage_and_chain_stacks(&mut self) -> usize {
        debug_assert!(self.stack_chain == Value::ZERO);
        let number_of_stacks = self.mark_shared_heap(true);
        self.compact_shared_heap();
        self.process_heap.adjust_old_allocation_budget();
        self.process_heap.stats_mut().old_space_collections += 1;
        number_of_stacks
    }

    /// Replace every frame's raw bytecode pointer with the frame's function
    /// and remember the offset. After cooking, stacks hold only object
    /// pointers, which the program scavenger can move and fix.
    fn cook_stacks(&mut self, number_of_stacks: usize) {
        self.cooked_stack_deltas = Vec::with_capacity(number_of_stacks);
        let mut current = self.stack_chain;
        for _ in 0..number_of_stacks {
            let stack = Stack::cast(HeapObject::from_value(current));
            let mut deltas = Vec::new();
            for frame in stack.frames() {
                let function_value = frame.function_value();
                if !function_value.is_heap_object() {
                    continue;
                }
                let function = Function::cast(HeapObject::from_value(function_value));
                let bcp = frame.bytecode_pointer();
                debug_assert!(function.contains_bytecode_address(bcp));
                deltas.push(bcp - function.bytecode_address_for(0));
                frame.set_cooked_value(function_value);
            }
            self.cooked_stack_deltas.push(deltas);
            current = stack.next();
        }
        debug_assert!(current == Value::ZERO);
    }

    /// Restore raw bytecode pointers from (function, delta) and unchain.
    fn uncook_and_unchain_stacks(&mut self) {
        let mut current = self.stack_chain;
        for deltas in std::mem::take(&mut self.cooked_stack_deltas) {
            let stack = Stack::cast(HeapObject::from_value(current));
            let mut index = 0;
            for frame in stack.frames() {
                let value = frame.cooked_value();
                if !value.is_heap_object() {
                    continue;
                }
                let function = Function::cast(HeapObject::from_value(value));
                let bcp = function.bytecode_address_for(0) + deltas[index];
                index += 1;
                frame.set_bytecode_pointer(bcp);
            }
            let next = stack.next();
            stack.set_next(Value::ZERO);
            current = next;
        }
        debug_assert!(current == Value::ZERO);
        self.stack_chain = Value::ZERO;
    }

    /// Offset of a program-space object from the heap start; valid after a
    /// program collection has left a single compacted chunk.
    pub fn offset_of(&self, object: HeapObject) -> usize {
        self.heap.offset_of(object)
    }

    pub fn object_at_offset(&self, offset: usize) -> HeapObject {
        self.heap.object_at_offset(offset)
    }

    /// The interpreter classifies booleans by this layout; a violation
    /// means a collector bug, so abort.
    pub fn verify_object_placements(&self) {
        let null = self.roots.null_object.address();
        let false_object = self.roots.false_object.address();
        let true_object = self.roots.true_object.address();
        assert!(
            false_object == null + 2 * WORD_SIZE && true_object == null + 4 * WORD_SIZE,
            "null/false/true placement violated: 0x{:x} 0x{:x} 0x{:x}",
            null,
            false_object,
            true_object
        );
    }

    /// Walk every live object in all heaps and check that each pointer
    /// lands in program, new, or old space. Used by tests as a shadow
    /// collection.
    pub fn validate_heaps(&mut self) {
        struct Validate<'a> {
            program: &'a SemiSpace,
            new_space_ranges: Vec<(usize, usize)>,
            old: &'a crate::old_space::OldSpace,
        }
        impl PointerVisitor for Validate<'_> {
            fn visit(&mut self, slot: &mut Value) {
                let value = *slot;
                if !value.is_heap_object() {
                    return;
                }
                let address = value.address();
                let ok = self.program.contains(address)
                    || self.old.contains(address)
                    || self
                        .new_space_ranges
                        .iter()
                        .any(|&(base, top)| address >= base && address < top);
                assert!(ok, "pointer 0x{:x} references no live space", address);
            }
        }
        let Program {
            heap,
            process_heap,
            roots,
            process_list,
            stack_chain,
            debug_info,
            ..
        } = self;
        let mut validate = Validate {
            program: heap,
            new_space_ranges: process_heap.new_space().chunk_spans(),
            old: process_heap.old_space(),
        };
        heap.iterate_objects(|object| object.iterate_pointers(&mut validate));
        process_heap
            .new_space()
            .iterate_objects(|object| object.iterate_pointers(&mut validate));
        process_heap
            .old_space()
            .iterate_objects(|object| object.iterate_pointers(&mut validate));
        roots.iterate(&mut validate);
        for process in process_list.get_mut().iter_mut() {
            process.iterate_roots(&mut validate);
        }
        validate.visit(stack_chain);
        if let Some(info) = debug_info.as_mut() {
            info.visit_process_pointers(&mut validate);
            info.visit_program_pointers(&mut validate);
        }
    }

    /// Size breakdown of the program heap.
    pub fn statistics(&self) -> ProgramStatistics {
        let mut stats = ProgramStatistics {
            heap_bytes: self.heap.used(),
            ..ProgramStatistics::default()
        };
        self.heap.iterate_objects(|object| {
            stats.object_count += 1;
            match object.format().kind() {
                ObjectKind::Class => stats.class_count += 1,
                ObjectKind::Array => {
                    stats.array_count += 1;
                    stats.array_bytes += object.size();
                }
                ObjectKind::OneByteString | ObjectKind::TwoByteString => {
                    stats.string_count += 1;
                    stats.string_bytes += object.size();
                }
                ObjectKind::Function => {
                    stats.function_count += 1;
                    stats.function_bytes += object.size();
                    stats.bytecode_bytes += Function::cast(object).bytecode_size();
                }
                _ => {}
            }
        });
        stats
    }

    pub fn print_statistics(&self) {
        let stats = self.statistics();
        eprintln!("program: {} bytes, {} objects", stats.heap_bytes, stats.object_count);
        eprintln!("  classes:   {}", stats.class_count);
        eprintln!("  arrays:    {} ({} bytes)", stats.array_count, stats.array_bytes);
        eprintln!("  strings:   {} ({} bytes)", stats.string_count, stats.string_bytes);
        eprintln!(
            "  functions: {} ({} bytes, {} bytes of bytecode)",
            stats.function_count, stats.function_bytes, stats.bytecode_bytes
        );
    }
}

fn create_string_from_ascii(
    space: &mut SemiSpace,
    class: Class,
    text: &str,
) -> Result<OneByteString, AllocationFailed> {
    let string = heap::create_one_byte_string(space, class, text.len())?;
    for (i, byte) in text.bytes().enumerate() {
        string.set_char_code(i, byte);
    }
    Ok(string)
}

/// Bootstrap the program root set. Null, false and true are allocated
/// back to back before anything else so the boolean-classification layout
/// holds from the start; their classes are patched in once created.
fn bootstrap_roots(space: &mut SemiSpace) -> Result<ProgramRoots, AllocationFailed> {
    use crate::heap::AllocateRaw;

    let null_format = InstanceFormat::instance_with_marker(0, Marker::Null);
    let false_format = InstanceFormat::instance_with_marker(0, Marker::False);
    let true_format = InstanceFormat::instance_with_marker(0, Marker::True);

    let null_object = HeapObject::from_address(space.allocate_raw(null_format.fixed_size())?);
    null_object.set_meta(0);
    let false_object = HeapObject::from_address(space.allocate_raw(false_format.fixed_size())?);
    false_object.set_meta(0);
    let true_object = HeapObject::from_address(space.allocate_raw(true_format.fixed_size())?);
    true_object.set_meta(0);

    // Usable as a fill value already; the class is patched in below.
    let null = null_object.to_value();

    let meta_class = heap::create_meta_class(space, null)?;
    let meta = meta_class.to_value();

    let array_class = heap::create_class(space, InstanceFormat::array(), meta, null)?;
    let empty_array = heap::create_array(space, array_class, 0, null)?;

    let object_class = heap::create_class(space, InstanceFormat::instance(0), meta, null)?;

    let num_class = heap::create_class(space, InstanceFormat::num(Marker::Num), meta, null)?;
    num_class.set_superclass(object_class.to_value());

    let int_class = heap::create_class(space, InstanceFormat::num(Marker::Num), meta, null)?;
    int_class.set_superclass(num_class.to_value());

    let smi_class = heap::create_class(space, InstanceFormat::num(Marker::Smi), meta, null)?;
    smi_class.set_superclass(int_class.to_value());

    let large_integer_class =
        heap::create_class(space, InstanceFormat::large_integer(), meta, null)?;
    large_integer_class.set_superclass(int_class.to_value());

    let double_class = heap::create_class(space, InstanceFormat::double(), meta, null)?;
    double_class.set_superclass(num_class.to_value());

    let boxed_class = heap::create_class(space, InstanceFormat::boxed(), meta, null)?;

    let stack_class = heap::create_class(space, InstanceFormat::stack(), meta, null)?;

    let coroutine_class = heap::create_class(
        space,
        InstanceFormat::instance_with_marker(2, Marker::Coroutine),
        meta,
        null,
    )?;

    let port_class = heap::create_class(
        space,
        InstanceFormat::instance_with_marker(1, Marker::Port),
        meta,
        null,
    )?;

    let process_class = heap::create_class(space, InstanceFormat::instance(1), meta, null)?;

    let initializer_class = heap::create_class(space, InstanceFormat::initializer(), meta, null)?;

    let dispatch_table_entry_class =
        heap::create_class(space, InstanceFormat::dispatch_table_entry(), meta, null)?;

    let one_byte_string_class =
        heap::create_class(space, InstanceFormat::one_byte_string(), meta, null)?;
    one_byte_string_class.set_superclass(object_class.to_value());

    let two_byte_string_class =
        heap::create_class(space, InstanceFormat::two_byte_string(), meta, null)?;
    two_byte_string_class.set_superclass(object_class.to_value());

    let empty_string = heap::create_one_byte_string(space, one_byte_string_class, 0)?;

    let function_class = heap::create_class(space, InstanceFormat::function(), meta, null)?;
    let byte_array_class = heap::create_class(space, InstanceFormat::byte_array(), meta, null)?;

    // Null's class, then the booleans and theirs.
    let null_class = heap::create_class(space, null_format, meta, null)?;
    null_class.set_superclass(object_class.to_value());
    null_object.set_value_at(CLASS_OFFSET, null_class.to_value());

    let bool_class = heap::create_class(space, InstanceFormat::instance(0), meta, null)?;
    bool_class.set_superclass(object_class.to_value());

    let false_class = heap::create_class(space, false_format, meta, null)?;
    false_class.set_superclass(bool_class.to_value());
    false_class.set_methods(empty_array.to_value());
    false_object.set_value_at(CLASS_OFFSET, false_class.to_value());

    let true_class = heap::create_class(space, true_format, meta, null)?;
    true_class.set_superclass(bool_class.to_value());
    true_class.set_methods(empty_array.to_value());
    true_object.set_value_at(CLASS_OFFSET, true_class.to_value());

    let raw_retry_after_gc =
        create_string_from_ascii(space, one_byte_string_class, "Retry after GC.")?;
    let raw_wrong_argument_type =
        create_string_from_ascii(space, one_byte_string_class, "Wrong argument type.")?;
    let raw_index_out_of_bounds =
        create_string_from_ascii(space, one_byte_string_class, "Index out of bounds.")?;
    let raw_illegal_state =
        create_string_from_ascii(space, one_byte_string_class, "Illegal state.")?;

    Ok(ProgramRoots {
        null_object: null,
        false_object: false_object.to_value(),
        true_object: true_object.to_value(),
        meta_class: meta,
        object_class: object_class.to_value(),
        bool_class: bool_class.to_value(),
        num_class: num_class.to_value(),
        int_class: int_class.to_value(),
        smi_class: smi_class.to_value(),
        large_integer_class: large_integer_class.to_value(),
        double_class: double_class.to_value(),
        boxed_class: boxed_class.to_value(),
        one_byte_string_class: one_byte_string_class.to_value(),
        two_byte_string_class: two_byte_string_class.to_value(),
        array_class: array_class.to_value(),
        byte_array_class: byte_array_class.to_value(),
        function_class: function_class.to_value(),
        stack_class: stack_class.to_value(),
        coroutine_class: coroutine_class.to_value(),
        port_class: port_class.to_value(),
        process_class: process_class.to_value(),
        initializer_class: initializer_class.to_value(),
        dispatch_table_entry_class: dispatch_table_entry_class.to_value(),
        empty_array: empty_array.to_value(),
        empty_string: empty_string.to_value(),
        raw_retry_after_gc: raw_retry_after_gc.to_value(),
        raw_wrong_argument_type: raw_wrong_argument_type.to_value(),
        raw_index_out_of_bounds: raw_index_out_of_bounds.to_value(),
        raw_illegal_state: raw_illegal_state.to_value(),
        // Smi zero until the loader installs the entry function.
        entry: Value::ZERO,
    })
}
