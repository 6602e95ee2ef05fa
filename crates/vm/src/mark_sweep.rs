//! Tri-color marking for the old-space collector.
//!
//! Marking covers old space and new space alike: liveness paths that run
//! through new space must keep old objects alive, so new-space objects get
//! mark bits too and the caller clears them after the sweep or compaction.
//! Grey objects live on an explicit marking stack rather than the call
//! stack.
//!
//! As a side effect the visitor can chain every live `Stack` object into a
//! singly linked list through the stacks' `next` slots. The program
//! collector uses one marking pass in this mode to find the stacks it has
//! to cook.

use crate::object::{HeapObject, ObjectKind, Stack};
use crate::old_space::OldSpace;
use crate::space::SemiSpace;
use crate::value::{PointerVisitor, Value};

pub(crate) struct MarkingVisitor<'a> {
    new_space: &'a mut SemiSpace,
    old_space: &'a mut OldSpace,
    marking_stack: Vec<HeapObject>,
    stack_chain: Option<&'a mut Value>,
    number_of_stacks: usize,
}

impl<'a> MarkingVisitor<'a> {
    pub(crate) fn new(
        new_space: &'a mut SemiSpace,
        old_space: &'a mut OldSpace,
        stack_chain: Option<&'a mut Value>,
    ) -> MarkingVisitor<'a> {
        MarkingVisitor {
            new_space,
            old_space,
            marking_stack: Vec::new(),
            stack_chain,
            number_of_stacks: 0,
        }
    }

    pub(crate) fn number_of_stacks(&self) -> usize {
        self.number_of_stacks
    }

    /// Drain the marking stack, greying everything reachable.
    pub(crate) fn process(&mut self) {
        while let Some(object) = self.marking_stack.pop() {
            object.iterate_pointers(self);
        }
    }

    fn mark_and_enqueue(&mut self, object: HeapObject) {
        let address = object.address();
        let newly_marked = if self.new_space.contains(address) {
            self.new_space.mark(address)
        } else if self.old_space.contains(address) {
            self.old_space.mark(address)
        } else {
            // Program-space pointer; the data collectors never follow those.
            false
        };
        if !newly_marked {
            return;
        }
        if let Some(chain) = self.stack_chain.as_deref_mut() {
            if object.format().kind() == ObjectKind::Stack {
                let stack = Stack::cast(object);
                stack.set_next(*chain);
                *chain = stack.to_value();
                self.number_of_stacks += 1;
            }
        }
        self.marking_stack.push(object);
    }
}

impl PointerVisitor for MarkingVisitor<'_> {
    fn visit(&mut self, slot: &mut Value) {
        let value = *slot;
        if !value.is_heap_object() {
            return;
        }
        self.mark_and_enqueue(HeapObject::from_value(value));
    }
}
