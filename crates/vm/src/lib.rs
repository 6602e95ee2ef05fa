//! Tern virtual machine: program and object memory subsystem.
//!
//! A small managed runtime core for embedded targets:
//! - Tagged machine-word values (smis and heap pointers)
//! - Two-generation shared data heap (copying new space, mark-sweep /
//!   mark-compact old space with a card-based remembered set)
//! - Immutable program heap with its own moving collector, able to walk
//!   and relocate live interpreter stacks (cook/uncook)
//! - Process lifecycle with triangle-counted teardown
//! - Breakpoint table with a pointer-update protocol across collections

pub mod debug_info;
pub mod heap;
pub mod mark_sweep;
pub mod object;
pub mod old_space;
pub mod port;
pub mod process;
pub mod program;
pub mod scavenger;
pub mod space;
pub mod value;

pub use debug_info::*;
pub use heap::*;
pub use object::*;
pub use old_space::{OldSpace, CARD_SIZE};
pub use port::*;
pub use process::*;
pub use program::*;
pub use space::{SemiSpace, WeakCallback, WeakPointer};
pub use value::*;
