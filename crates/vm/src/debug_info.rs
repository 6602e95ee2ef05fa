//! Breakpoints and the debugger attachment point.
//!
//! [`DebugInfo`] maps bytecode addresses to [`Breakpoint`] records. The
//! interpreter polls [`DebugInfo::should_break`] at every safepoint; the
//! map is rebuilt after each program collection because functions (and with
//! them every bytecode address) may have moved.
//!
//! A breakpoint's `function` is a program-space pointer and its optional
//! `coroutine` a process-space pointer, so breakpoints participate in both
//! collector families through the two visit methods.

use std::collections::HashMap;

use crate::object::{Function, HeapObject};
use crate::value::{PointerVisitor, Value};

/// Sentinel for "not stopped at any breakpoint".
pub const NO_BREAKPOINT_ID: i32 = -1;

/// A breakpoint at `(function, bytecode_index)`.
///
/// A breakpoint with a coroutine and stack height is a step-over
/// breakpoint: it fires only when the interpreter's stack pointer is at
/// exactly the recorded height, so deeper recursive activations of the same
/// bytecode are skipped.
#[derive(Debug, Clone)]
pub struct Breakpoint {
    function: Value,
    bytecode_index: usize,
    id: i32,
    is_one_shot: bool,
    coroutine: Value,
    stack_height: usize,
}

impl Breakpoint {
    pub fn function(&self) -> Function {
        Function::cast(HeapObject::from_value(self.function))
    }

    pub fn bytecode_index(&self) -> usize {
        self.bytecode_index
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn is_one_shot(&self) -> bool {
        self.is_one_shot
    }

    pub fn coroutine(&self) -> Value {
        self.coroutine
    }

    pub fn stack_height(&self) -> usize {
        self.stack_height
    }

    fn is_step_over(&self) -> bool {
        self.coroutine.is_heap_object()
    }

    fn visit_process_pointers(&mut self, visitor: &mut dyn PointerVisitor) {
        if self.coroutine.is_heap_object() {
            visitor.visit(&mut self.coroutine);
        }
    }

    fn visit_program_pointers(&mut self, visitor: &mut dyn PointerVisitor) {
        visitor.visit(&mut self.function);
    }
}

/// Debugger state for a program: the breakpoint table and stepping mode.
pub struct DebugInfo {
    is_stepping: bool,
    is_at_breakpoint: bool,
    current_breakpoint_id: i32,
    next_breakpoint_id: i32,
    breakpoints: HashMap<usize, Breakpoint>,
}

impl DebugInfo {
    pub fn new() -> DebugInfo {
        DebugInfo {
            is_stepping: false,
            is_at_breakpoint: false,
            current_breakpoint_id: NO_BREAKPOINT_ID,
            next_breakpoint_id: 0,
            breakpoints: HashMap::new(),
        }
    }

    pub fn is_stepping(&self) -> bool {
        self.is_stepping
    }

    pub fn set_stepping(&mut self, stepping: bool) {
        self.is_stepping = stepping;
    }

    pub fn is_at_breakpoint(&self) -> bool {
        self.is_at_breakpoint
    }

    pub fn current_breakpoint_id(&self) -> i32 {
        self.current_breakpoint_id
    }

    pub fn clear_current_breakpoint(&mut self) {
        self.is_at_breakpoint = false;
        self.current_breakpoint_id = NO_BREAKPOINT_ID;
    }

    fn set_current_breakpoint(&mut self, id: i32) {
        self.is_at_breakpoint = true;
        self.current_breakpoint_id = id;
    }

    pub fn breakpoint_count(&self) -> usize {
        self.breakpoints.len()
    }

    /// Decide whether the interpreter must halt at `bcp` with the stack
    /// pointer at slot height `sp`. One-shot breakpoints delete themselves
    /// when they fire; stepping mode halts at every bytecode.
    pub fn should_break(&mut self, bcp: usize, sp: usize) -> bool {
        if let Some(breakpoint) = self.breakpoints.get(&bcp) {
            if breakpoint.is_step_over() && sp != breakpoint.stack_height() {
                return false;
            }
            let id = breakpoint.id();
            let one_shot = breakpoint.is_one_shot();
            self.set_current_breakpoint(id);
            if one_shot {
                self.delete_breakpoint(id);
            }
            return true;
        }
        if self.is_stepping {
            self.set_current_breakpoint(NO_BREAKPOINT_ID);
            return true;
        }
        false
    }

    /// Set a plain breakpoint. Idempotent: setting the same
    /// `(function, bytecode_index)` again returns the existing id.
    pub fn set_breakpoint(&mut self, function: Function, bytecode_index: usize) -> i32 {
        self.set_breakpoint_with(function, bytecode_index, false, Value::ZERO, 0)
    }

    /// Set a one-shot breakpoint that deletes itself when it fires.
    pub fn set_one_shot_breakpoint(&mut self, function: Function, bytecode_index: usize) -> i32 {
        self.set_breakpoint_with(function, bytecode_index, true, Value::ZERO, 0)
    }

    /// Set a step-over breakpoint bound to `coroutine` at `stack_height`.
    pub fn set_step_over_breakpoint(
        &mut self,
        function: Function,
        bytecode_index: usize,
        coroutine: Value,
        stack_height: usize,
    ) -> i32 {
        self.set_breakpoint_with(function, bytecode_index, true, coroutine, stack_height)
    }

    fn set_breakpoint_with(
        &mut self,
        function: Function,
        bytecode_index: usize,
        is_one_shot: bool,
        coroutine: Value,
        stack_height: usize,
    ) -> i32 {
        let bcp = function.bytecode_address_for(0) + bytecode_index;
        if let Some(existing) = self.breakpoints.get(&bcp) {
            return existing.id();
        }
        let id = self.next_breakpoint_id;
        self.next_breakpoint_id += 1;
        self.breakpoints.insert(
            bcp,
            Breakpoint {
                function: function.to_value(),
                bytecode_index,
                id,
                is_one_shot,
                coroutine,
                stack_height,
            },
        );
        id
    }

    pub fn delete_breakpoint(&mut self, id: i32) -> bool {
        let key = self
            .breakpoints
            .iter()
            .find(|(_, breakpoint)| breakpoint.id() == id)
            .map(|(&bcp, _)| bcp);
        match key {
            Some(bcp) => {
                self.breakpoints.remove(&bcp);
                true
            }
            None => false,
        }
    }

    /// Visit breakpoint coroutines (process-space pointers).
    pub(crate) fn visit_process_pointers(&mut self, visitor: &mut dyn PointerVisitor) {
        for breakpoint in self.breakpoints.values_mut() {
            breakpoint.visit_process_pointers(visitor);
        }
    }

    /// Visit breakpoint functions (program-space pointers).
    pub(crate) fn visit_program_pointers(&mut self, visitor: &mut dyn PointerVisitor) {
        for breakpoint in self.breakpoints.values_mut() {
            breakpoint.visit_program_pointers(visitor);
        }
    }

    /// Re-key the table after a program collection: functions moved, the
    /// bytecode indices did not.
    pub(crate) fn update_breakpoints(&mut self) {
        let mut rekeyed = HashMap::with_capacity(self.breakpoints.len());
        for (_, breakpoint) in self.breakpoints.drain() {
            let bcp =
                breakpoint.function().bytecode_address_for(0) + breakpoint.bytecode_index();
            rekeyed.insert(bcp, breakpoint);
        }
        self.breakpoints = rekeyed;
    }
}

impl Default for DebugInfo {
    fn default() -> Self {
        DebugInfo::new()
    }
}
