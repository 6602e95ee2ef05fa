//! Integration tests for the program collector: stack cooking, breakpoint
//! re-keying, singleton placement, and the snapshot layout.

use tern_vm::heap::HeapConfig;
use tern_vm::object::{Function, HeapObject};
use tern_vm::program::{Program, PopularityCounter};
use tern_vm::value::{Value, WORD_SIZE};

fn test_config() -> HeapConfig {
    HeapConfig {
        semi_space_size: 16 * 1024,
        old_space_chunk_size: 16 * 1024,
        initial_old_budget: 64 * 1024,
        large_object_limit: 2 * 1024,
        program_chunk_size: 64 * 1024,
        initial_stack_slots: 128,
        debug: false,
    }
}

fn program_with_entry(bytecode_len: usize) -> (Program, Function) {
    let mut program = Program::new(test_config());
    let bytecode = vec![0u8; bytecode_len];
    let entry = program.create_function(0, &bytecode, 0).unwrap();
    program.set_entry(entry);
    (program, entry)
}

// ============================================================================
// Stack integrity across a program collection
// ============================================================================

#[test]
fn test_program_gc_preserves_frame_bytecode_offsets() {
    let (mut program, entry) = program_with_entry(32);
    let pid = program.spawn_process_for_main().unwrap();

    // Park the frame 17 bytes into the entry function's bytecode.
    let old_bcp = entry.bytecode_address_for(0) + 17;
    program
        .with_process(pid, |process| {
            let frame = process.stack().frames().next().unwrap();
            frame.set_bytecode_pointer(old_bcp);
        })
        .unwrap();

    let old_entry_address = entry.address();
    program.collect_program_garbage();

    let new_entry = program.entry().unwrap();
    assert_ne!(new_entry.address(), old_entry_address);
    let new_bcp = program
        .with_process(pid, |process| {
            process.stack().frames().next().unwrap().bytecode_pointer()
        })
        .unwrap();
    assert_eq!(new_bcp, new_entry.bytecode_address_for(0) + 17);
    program.validate_heaps();
}

#[test]
fn test_singleton_spacing_holds_after_program_gc() {
    let (mut program, _entry) = program_with_entry(8);
    let _pid = program.spawn_process_for_main().unwrap();
    program.collect_program_garbage();
    // verify_object_placements would abort on violation; check explicitly
    // too so the test documents the invariant.
    let null = program.null_object().address();
    let false_object = program.false_object().address();
    let true_object = program.true_object().address();
    assert_eq!(false_object, null + 2 * WORD_SIZE);
    assert_eq!(true_object, null + 4 * WORD_SIZE);
}

#[test]
fn test_breakpoint_survives_program_gc() {
    let (mut program, entry) = program_with_entry(32);
    let pid = program.spawn_process_for_main().unwrap();
    let _ = pid;

    let id = program.ensure_debugger_attached().set_breakpoint(entry, 17);
    program.collect_program_garbage();

    let new_entry = program.entry().unwrap();
    let new_bcp = new_entry.bytecode_address_for(0) + 17;
    assert!(program.should_break(new_bcp, 0));
    assert_eq!(
        program.debug_info().unwrap().current_breakpoint_id(),
        id
    );
}

// ============================================================================
// Snapshot collection layout
// ============================================================================

#[test]
fn test_snapshot_gc_places_special_objects_first() {
    let mut program = Program::new(test_config());
    let helper = program.create_function(1, &[0u8; 16], 0).unwrap();
    let boxed = program.create_double(3.25).unwrap();
    let entry = program.create_function(0, &[0u8; 24], 2).unwrap();
    entry.set_literal_at(0, helper.to_value());
    entry.set_literal_at(1, boxed.to_value());
    program.set_entry(entry);

    let mut popularity = PopularityCounter::new();
    program.snapshot_gc(&mut popularity);

    // The boxed-double class leads the heap; the three singletons follow,
    // two words apart.
    let double_class = HeapObject::from_value(program.roots().double_class);
    assert_eq!(program.offset_of(double_class), 0);
    let k = program.offset_of(HeapObject::from_value(program.null_object()));
    assert_eq!(k, double_class.size());
    assert_eq!(
        program.offset_of(HeapObject::from_value(program.false_object())),
        k + 2 * WORD_SIZE
    );
    assert_eq!(
        program.offset_of(HeapObject::from_value(program.true_object())),
        k + 4 * WORD_SIZE
    );

    // The entry function's literals survived the move.
    let entry = program.entry().unwrap();
    assert!(entry.literal_at(0).is_heap_object());
    assert!(entry.literal_at(1).is_heap_object());
    program.validate_heaps();
}

// ============================================================================
// Breakpoints
// ============================================================================

#[test]
fn test_set_breakpoint_is_idempotent() {
    let (mut program, entry) = program_with_entry(32);
    let info = program.ensure_debugger_attached();
    let first = info.set_breakpoint(entry, 17);
    let second = info.set_breakpoint(entry, 17);
    assert_eq!(first, second);
    assert_eq!(info.breakpoint_count(), 1);
}

#[test]
fn test_deleted_breakpoint_does_not_fire() {
    let (mut program, entry) = program_with_entry(32);
    let bcp = entry.bytecode_address_for(0) + 17;
    let info = program.ensure_debugger_attached();
    let id = info.set_breakpoint(entry, 17);
    assert!(info.delete_breakpoint(id));
    assert!(!info.delete_breakpoint(id));
    assert!(!program.should_break(bcp, 0));
}

#[test]
fn test_one_shot_breakpoint_fires_exactly_once() {
    let (mut program, entry) = program_with_entry(32);
    let bcp = entry.bytecode_address_for(0) + 5;
    let info = program.ensure_debugger_attached();
    info.set_one_shot_breakpoint(entry, 5);
    assert!(program.should_break(bcp, 0));
    assert!(!program.should_break(bcp, 0));
}

#[test]
fn test_step_over_breakpoint_matches_stack_height() {
    let (mut program, entry) = program_with_entry(32);
    let pid = program.spawn_process_for_main().unwrap();
    let coroutine = program
        .with_process(pid, |process| process.coroutine_value())
        .unwrap();
    let bcp = entry.bytecode_address_for(0) + 10;
    let height = 5;
    program
        .ensure_debugger_attached()
        .set_step_over_breakpoint(entry, 10, coroutine, height);

    // A deeper frame does not match.
    assert!(!program.should_break(bcp, height - 2));
    // The expected height fires, and the one-shot removes itself.
    assert!(program.should_break(bcp, height));
    assert!(!program.should_break(bcp, height));
}

#[test]
fn test_stepping_breaks_everywhere() {
    let (mut program, entry) = program_with_entry(32);
    let bcp = entry.bytecode_address_for(0) + 3;
    let info = program.ensure_debugger_attached();
    info.set_stepping(true);
    assert!(program.should_break(bcp, 0));
    let info = program.ensure_debugger_attached();
    info.set_stepping(false);
    assert!(!program.should_break(bcp, 0));
}
