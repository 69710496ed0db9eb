//! Scheduler slots and ready-queue policies.

pub mod class;
pub mod fifo;
pub mod slot;

pub use class::{level_for, Level, Priority, SchedClass, ThreadKey, NR_LEVELS, ROOT_LEVEL};
pub use fifo::FifoClass;
pub use slot::{Slot, SlotFlags};

/// Default ready-queue policy.
pub type DefaultClass = FifoClass;
