//! Processes and the program's process list.
//!
//! Every process shares the program's data heap but owns its execution
//! state: a coroutine whose stack it runs on, a port list, and its links.
//! The process triangle count tracks the process itself plus its live
//! descendants; a subtree is torn down only when the whole triangle has
//! terminated, at which point the parent chain is walked and zero-count
//! ancestors are deleted too.
//!
//! The process list is serialized by a `parking_lot` mutex; the collectors
//! iterate it with the mutex held (no mutator runs during a collection).

use std::collections::HashMap;

use crate::object::{Coroutine, HeapObject, Stack};
use crate::port::{cleanup_ports, Port};
use crate::value::{PointerVisitor, Value};

/// Process identifier, unique within a program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u64);

/// Why a process stopped, and how the program will report it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Ran to completion.
    Terminated,
    /// The program had a compile-time error.
    CompileTimeError,
    /// An exception reached the top of the stack.
    UncaughtException,
    /// A linked process died and the signal was not handled.
    UnhandledSignal,
    /// Killed programmatically.
    Killed,
    /// Kill requested; cleanup happens at the next safepoint.
    ShouldKill,
}

/// Scheduling-visible process state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    WaitingForChildren,
    Terminated,
}

/// Link bookkeeping: the signal this process's death will report.
#[derive(Clone, Copy, Debug)]
pub struct Links {
    exit_signal: Signal,
}

impl Links {
    fn new() -> Links {
        Links {
            exit_signal: Signal::Terminated,
        }
    }

    pub fn exit_signal(&self) -> Signal {
        self.exit_signal
    }

    pub(crate) fn set_exit_signal(&mut self, signal: Signal) {
        self.exit_signal = signal;
    }
}

/// A lightweight process. The heap it allocates from is the program's
/// shared two-space heap; the stack it executes on is a heap object hanging
/// off the process's coroutine.
pub struct Process {
    pid: Pid,
    parent: Option<Pid>,
    /// Live processes in this subtree, this process included.
    pub(crate) process_triangle_count: i32,
    coroutine: Value,
    ports: Vec<Port>,
    links: Links,
    allocation_failed: bool,
    state: ProcessState,
}

impl Process {
    pub(crate) fn new(pid: Pid, parent: Option<Pid>) -> Process {
        Process {
            pid,
            parent,
            process_triangle_count: 1,
            coroutine: Value::ZERO,
            ports: Vec::new(),
            links: Links::new(),
            allocation_failed: false,
            state: ProcessState::Running,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    pub fn links(&self) -> &Links {
        &self.links
    }

    /// Live processes in this subtree, this process included.
    pub fn triangle_count(&self) -> i32 {
        self.process_triangle_count
    }

    pub fn allocation_failed(&self) -> bool {
        self.allocation_failed
    }

    pub(crate) fn set_allocation_failed(&mut self, failed: bool) {
        self.allocation_failed = failed;
    }

    /// The coroutine currently executing, as a tagged value (smi zero until
    /// the execution stack is set up).
    pub fn coroutine_value(&self) -> Value {
        self.coroutine
    }

    pub(crate) fn set_coroutine(&mut self, coroutine: Value) {
        self.coroutine = coroutine;
    }

    pub fn coroutine(&self) -> Coroutine {
        Coroutine::cast(HeapObject::from_value(self.coroutine))
    }

    /// The execution stack of the current coroutine.
    pub fn stack(&self) -> Stack {
        self.coroutine().stack()
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn add_port(&mut self, port: Port) {
        self.ports.push(port);
    }

    pub fn port_mut(&mut self, id: u64) -> Option<&mut Port> {
        self.ports.iter_mut().find(|p| p.id() == id)
    }

    /// Sweep out dead ports; run by both collectors after weak processing.
    pub(crate) fn cleanup_ports(&mut self) {
        self.ports = cleanup_ports(std::mem::take(&mut self.ports));
    }

    /// Visit the process's data-heap roots.
    pub fn iterate_roots(&mut self, visitor: &mut dyn PointerVisitor) {
        visitor.visit(&mut self.coroutine);
    }

    /// Tear down process-owned state and record the exit signal.
    pub(crate) fn cleanup(&mut self, kind: Signal) {
        self.links.set_exit_signal(kind);
        self.ports.clear();
        self.state = ProcessState::Terminated;
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("parent", &self.parent)
            .field("triangle_count", &self.process_triangle_count)
            .field("state", &self.state)
            .field("ports", &self.ports.len())
            .finish()
    }
}

/// Insertion-ordered process registry. The first live entry is the main
/// process.
pub(crate) struct ProcessList {
    processes: HashMap<Pid, Process>,
    order: Vec<Pid>,
    next_pid: u64,
}

impl ProcessList {
    pub(crate) fn new() -> ProcessList {
        ProcessList {
            processes: HashMap::new(),
            order: Vec::new(),
            next_pid: 1,
        }
    }

    pub(crate) fn allocate_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    pub(crate) fn insert(&mut self, process: Process) {
        let pid = process.pid();
        self.order.push(pid);
        self.processes.insert(pid, process);
    }

    pub(crate) fn remove(&mut self, pid: Pid) -> Option<Process> {
        self.order.retain(|&p| p != pid);
        self.processes.remove(&pid)
    }

    pub(crate) fn get(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub(crate) fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    pub(crate) fn first(&self) -> Option<Pid> {
        self.order.first().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.processes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Process> {
        self.processes.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_starts_with_itself_in_triangle() {
        let process = Process::new(Pid(1), None);
        assert_eq!(process.process_triangle_count, 1);
        assert_eq!(process.state(), ProcessState::Running);
        assert_eq!(process.links().exit_signal(), Signal::Terminated);
    }

    #[test]
    fn test_cleanup_records_signal_and_clears_ports() {
        let mut process = Process::new(Pid(1), None);
        process.add_port(Port::new(7));
        process.cleanup(Signal::Killed);
        assert_eq!(process.links().exit_signal(), Signal::Killed);
        assert!(process.ports().is_empty());
        assert_eq!(process.state(), ProcessState::Terminated);
    }

    #[test]
    fn test_process_list_order() {
        let mut list = ProcessList::new();
        let a = list.allocate_pid();
        list.insert(Process::new(a, None));
        let b = list.allocate_pid();
        list.insert(Process::new(b, Some(a)));
        assert_eq!(list.first(), Some(a));
        list.remove(a);
        assert_eq!(list.first(), Some(b));
        assert_eq!(list.len(), 1);
    }
}
