//! Integration tests for the shared process heap:
//! scavenging, promotion, the write barrier and remembered set, weak
//! pointers, and old-space collection behavior.

use tern_vm::heap::HeapConfig;
use tern_vm::object::{Array, Boxed, HeapObject};
use tern_vm::process::Pid;
use tern_vm::program::Program;
use tern_vm::value::Value;

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

/// Spawn a process whose stack anchors test values.
fn spawn_anchor(program: &mut Program) -> Pid {
    program.spawn_process(None).expect("spawn")
}

/// Push a value onto the process's stack, returning its slot index.
fn anchor(program: &mut Program, pid: Pid, value: Value) -> usize {
    program
        .with_process(pid, |process| {
            let stack = process.stack();
            let index = stack.top();
            stack.push(value);
            index
        })
        .expect("process exists")
}

fn anchored(program: &mut Program, pid: Pid, index: usize) -> Value {
    program
        .with_process(pid, |process| process.stack().slot(index))
        .expect("process exists")
}

// ============================================================================
// Scavenging
// ============================================================================

#[test]
fn test_scavenge_preserves_reachable_objects() {
    let mut program = Program::new(test_config());
    let pid = spawn_anchor(&mut program);

    let class = program.array_class();
    let array = program
        .process_heap_mut()
        .create_array(class, 3, Value::ZERO)
        .unwrap();
    array.set(0, Value::from_smi(7));
    array.set(1, Value::from_smi(-1));
    array.set(2, program.null_object());
    let index = anchor(&mut program, pid, array.to_value());

    program.collect_new_space();

    let moved = Array::cast(HeapObject::from_value(anchored(&mut program, pid, index)));
    assert_eq!(moved.length(), 3);
    assert_eq!(moved.get(0), Value::from_smi(7));
    assert_eq!(moved.get(1), Value::from_smi(-1));
    assert_eq!(moved.get(2), program.null_object());
    assert_eq!(moved.object().class_value(), class.to_value());
    program.validate_heaps();
}

#[test]
fn test_scavenge_collects_unreachable_objects() {
    let mut program = Program::new(test_config());
    let _pid = spawn_anchor(&mut program);

    let class = program.array_class();
    for _ in 0..10 {
        program
            .process_heap_mut()
            .create_array(class, 16, Value::ZERO)
            .unwrap();
    }
    let used_before = program.process_heap().new_space().used();
    program.collect_new_space();
    let used_after = program.process_heap().new_space().used();
    assert!(used_after < used_before);
    program.validate_heaps();
}

#[test]
fn test_allocation_failure_then_gc_and_retry() {
    let mut program = Program::new(test_config());
    let _pid = spawn_anchor(&mut program);

    let class = program.array_class();
    let mut failed = false;
    for _ in 0..10_000 {
        if program
            .process_heap_mut()
            .create_array(class, 64, Value::ZERO)
            .is_err()
        {
            failed = true;
            break;
        }
    }
    assert!(failed, "new space never filled up");

    program.collect_new_space();
    assert!(program
        .process_heap_mut()
        .create_array(class, 64, Value::ZERO)
        .is_ok());
}

// ============================================================================
// Promotion
// ============================================================================

#[test]
fn test_objects_promote_after_surviving_scavenges() {
    let mut program = Program::new(test_config());
    let pid = spawn_anchor(&mut program);

    let class = program.array_class();
    let array = program
        .process_heap_mut()
        .create_array(class, 4, Value::from_smi(9))
        .unwrap();
    let index = anchor(&mut program, pid, array.to_value());

    assert!(program
        .process_heap()
        .new_space()
        .contains(array.address()));

    for _ in 0..3 {
        program.collect_new_space();
    }

    let promoted = anchored(&mut program, pid, index);
    assert!(program
        .process_heap()
        .old_space()
        .contains(promoted.address()));
    let promoted = Array::cast(HeapObject::from_value(promoted));
    assert_eq!(promoted.get(0), Value::from_smi(9));
    program.validate_heaps();
}

#[test]
fn test_boxed_cell_survives_scavenge() {
    let mut program = Program::new(test_config());
    let pid = spawn_anchor(&mut program);

    let class = program.array_class();
    let inner = program
        .process_heap_mut()
        .create_array(class, 1, Value::from_smi(5))
        .unwrap();
    let boxed_class = program.boxed_class();
    let boxed = program
        .process_heap_mut()
        .create_boxed(boxed_class, inner.to_value())
        .unwrap();
    let index = anchor(&mut program, pid, boxed.to_value());

    program.collect_new_space();

    let boxed = Boxed::cast(HeapObject::from_value(anchored(&mut program, pid, index)));
    let inner = Array::cast(HeapObject::from_value(boxed.value()));
    assert_eq!(inner.get(0), Value::from_smi(5));
    program.validate_heaps();
}

#[test]
fn test_large_objects_allocate_in_old_space() {
    let mut program = Program::new(test_config());
    let class = program.array_class();
    // 512 elements is past the large-object limit of the test config.
    let array = program
        .process_heap_mut()
        .create_array(class, 512, Value::ZERO)
        .unwrap();
    assert!(program
        .process_heap()
        .old_space()
        .contains(array.address()));
}

// ============================================================================
// Write barrier and remembered set
// ============================================================================

#[test]
fn test_remembered_set_keeps_new_space_object_alive() {
    let mut program = Program::new(test_config());
    let pid = spawn_anchor(&mut program);

    let class = program.array_class();
    // Old-space container (large), new-space element.
    let old_array = program
        .process_heap_mut()
        .create_array(class, 512, Value::ZERO)
        .unwrap();
    anchor(&mut program, pid, old_array.to_value());
    let new_array = program
        .process_heap_mut()
        .create_array(class, 4, Value::from_smi(7))
        .unwrap();
    assert!(program
        .process_heap()
        .new_space()
        .contains(new_array.address()));

    program.process_heap_mut().write_field(
        old_array.object(),
        Array::ELEMENTS_OFFSET,
        new_array.to_value(),
    );
    assert!(program
        .process_heap()
        .old_space()
        .remembered_set_contains(old_array.element_address(0)));

    // The only path to the new array is the old-to-new pointer.
    program.collect_new_space();

    let element = old_array.get(0);
    assert!(element.is_heap_object());
    assert!(program.process_heap().new_space().contains(element.address()));
    let element = Array::cast(HeapObject::from_value(element));
    assert_eq!(element.get(0), Value::from_smi(7));
    // Still pointing into new space, so the card must still be recorded.
    assert!(program
        .process_heap()
        .old_space()
        .remembered_set_contains(old_array.element_address(0)));
    program.validate_heaps();
}

#[test]
fn test_clean_cards_are_dropped_at_scavenge() {
    let mut program = Program::new(test_config());
    let pid = spawn_anchor(&mut program);

    let class = program.array_class();
    let old_array = program
        .process_heap_mut()
        .create_array(class, 512, Value::ZERO)
        .unwrap();
    anchor(&mut program, pid, old_array.to_value());
    let new_array = program
        .process_heap_mut()
        .create_array(class, 4, Value::ZERO)
        .unwrap();
    program.process_heap_mut().write_field(
        old_array.object(),
        Array::ELEMENTS_OFFSET,
        new_array.to_value(),
    );
    program.collect_new_space();

    // Overwrite the old-to-new pointer; the next scavenge finds nothing in
    // the card and drops it.
    program
        .process_heap_mut()
        .write_field(old_array.object(), Array::ELEMENTS_OFFSET, Value::from_smi(0));
    program.collect_new_space();
    assert!(!program
        .process_heap()
        .old_space()
        .remembered_set_contains(old_array.element_address(0)));
    program.validate_heaps();
}

// ============================================================================
// Weak pointers
// ============================================================================

#[test]
fn test_weak_pointer_callback_runs_for_dead_object() {
    use std::cell::Cell;
    use std::rc::Rc;

    let mut program = Program::new(test_config());
    let _pid = spawn_anchor(&mut program);

    let class = program.array_class();
    let doomed = program
        .process_heap_mut()
        .create_array(class, 2, Value::ZERO)
        .unwrap();
    let fired = Rc::new(Cell::new(false));
    let flag = fired.clone();
    program
        .process_heap_mut()
        .register_weak_pointer(doomed.object(), Box::new(move |_| flag.set(true)));

    program.collect_new_space();
    assert!(fired.get());
}

#[test]
fn test_weak_pointer_survives_with_object() {
    use std::cell::Cell;
    use std::rc::Rc;

    let mut program = Program::new(test_config());
    let pid = spawn_anchor(&mut program);

    let class = program.array_class();
    let survivor = program
        .process_heap_mut()
        .create_array(class, 2, Value::ZERO)
        .unwrap();
    anchor(&mut program, pid, survivor.to_value());
    let fired = Rc::new(Cell::new(false));
    let flag = fired.clone();
    program
        .process_heap_mut()
        .register_weak_pointer(survivor.object(), Box::new(move |_| flag.set(true)));

    program.collect_new_space();
    assert!(!fired.get());
}

// ============================================================================
// Old-space collection
// ============================================================================

#[test]
fn test_old_space_collection_is_idempotent() {
    let mut program = Program::new(test_config());
    let pid = spawn_anchor(&mut program);

    let class = program.array_class();
    let array = program
        .process_heap_mut()
        .create_array(class, 4, Value::from_smi(3))
        .unwrap();
    anchor(&mut program, pid, array.to_value());
    for _ in 0..3 {
        program.collect_new_space();
    }

    program.collect_old_space();
    let used_first = program.process_heap().old_space().used_after_last_gc();
    program.collect_old_space();
    let used_second = program.process_heap().old_space().used_after_last_gc();
    assert_eq!(used_first, used_second);
    program.validate_heaps();
}

#[test]
fn test_old_space_collection_reclaims_garbage() {
    let mut program = Program::new(test_config());
    let _pid = spawn_anchor(&mut program);

    let class = program.array_class();
    // Unreachable large objects go straight to old space.
    for _ in 0..4 {
        program
            .process_heap_mut()
            .create_array(class, 512, Value::ZERO)
            .unwrap();
    }
    let used_before = program.process_heap().old_space().used();
    program.collect_old_space();
    // Sweep, then compact, to exercise both modes.
    program.collect_old_space();
    let used_after = program.process_heap().old_space().used();
    assert!(used_after < used_before);
    program.validate_heaps();
}
