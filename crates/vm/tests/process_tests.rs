//! Integration tests for the process lifecycle: spawning, the initial
//! frame, triangle-counted teardown, and exit-kind capture.

use tern_vm::heap::HeapConfig;
use tern_vm::process::{ProcessState, Signal};
use tern_vm::program::{Program, UNCAUGHT_EXCEPTION_EXIT_CODE};

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

#[test]
fn test_main_process_starts_in_entry_function() {
    let mut program = Program::new(test_config());
    let entry = program.create_function(0, &[0u8; 16], 0).unwrap();
    program.set_entry(entry);

    let pid = program.spawn_process_for_main().unwrap();
    let bcp = program
        .with_process(pid, |process| {
            let frame = process.stack().frames().next().unwrap();
            assert_eq!(frame.function_value(), entry.to_value());
            frame.bytecode_pointer()
        })
        .unwrap();
    assert_eq!(bcp, entry.bytecode_address_for(0));
    assert_eq!(program.main_process(), Some(pid));
}

#[test]
fn test_spawn_links_parent_triangle() {
    let mut program = Program::new(test_config());
    let parent = program.spawn_process(None).unwrap();
    let _child = program.spawn_process(Some(parent)).unwrap();

    let count = program
        .with_process(parent, |process| process.triangle_count())
        .unwrap();
    assert_eq!(count, 2);
}

#[test]
fn test_process_tree_teardown() {
    let mut program = Program::new(test_config());
    // P -> {A, B}, A -> C.
    let p = program.spawn_process(None).unwrap();
    let a = program.spawn_process(Some(p)).unwrap();
    let b = program.spawn_process(Some(p)).unwrap();
    let c = program.spawn_process(Some(a)).unwrap();
    assert_eq!(program.process_count(), 4);

    let kill = |program: &mut Program, pid| {
        program
            .with_process(pid, |process| {
                process.set_state(ProcessState::WaitingForChildren)
            })
            .unwrap();
        program.schedule_process_for_deletion(pid, Signal::Terminated)
    };

    // Children die leaf-first; nothing finishes until the root goes.
    assert!(!kill(&mut program, c));
    assert_eq!(program.process_count(), 3);
    assert!(!kill(&mut program, b));
    assert_eq!(program.process_count(), 2);
    assert!(!kill(&mut program, a));
    assert_eq!(program.process_count(), 1);
    assert_eq!(
        program
            .with_process(p, |process| process.triangle_count())
            .unwrap(),
        1
    );

    assert!(kill(&mut program, p));
    assert_eq!(program.process_count(), 0);
    assert_eq!(program.exit_kind(), Signal::Terminated);
    assert_eq!(program.exit_code(), 0);
}

#[test]
fn test_killed_main_process_sets_exit_code() {
    let mut program = Program::new(test_config());
    let p = program.spawn_process(None).unwrap();
    program
        .with_process(p, |process| {
            process.set_state(ProcessState::WaitingForChildren)
        })
        .unwrap();
    assert!(program.schedule_process_for_deletion(p, Signal::Killed));
    assert_eq!(program.exit_kind(), Signal::Killed);
    assert_eq!(program.exit_code(), UNCAUGHT_EXCEPTION_EXIT_CODE);
}

#[test]
fn test_parent_outlives_children_with_pending_triangle() {
    let mut program = Program::new(test_config());
    let p = program.spawn_process(None).unwrap();
    let a = program.spawn_process(Some(p)).unwrap();

    // Killing the parent first leaves it in the list until the child goes.
    program
        .with_process(p, |process| {
            process.set_state(ProcessState::WaitingForChildren)
        })
        .unwrap();
    assert!(!program.schedule_process_for_deletion(p, Signal::Terminated));
    assert_eq!(program.process_count(), 2);

    program
        .with_process(a, |process| {
            process.set_state(ProcessState::WaitingForChildren)
        })
        .unwrap();
    assert!(program.schedule_process_for_deletion(a, Signal::Terminated));
    assert_eq!(program.process_count(), 0);
}

#[test]
fn test_processes_survive_collections() {
    let mut program = Program::new(test_config());
    let entry = program.create_function(0, &[0u8; 16], 0).unwrap();
    program.set_entry(entry);
    let pid = program.spawn_process_for_main().unwrap();

    program.collect_new_space();
    program.collect_old_space();
    program.collect_program_garbage();

    let frame_function = program
        .with_process(pid, |process| {
            process.stack().frames().next().unwrap().function_value()
        })
        .unwrap();
    assert_eq!(frame_function, program.entry().unwrap().to_value());
    program.validate_heaps();
}
