//! Collector proper: safepoints, mutator threads, scheduling, finalization and the GC driver.

pub mod finalizer;
pub mod gc;
pub mod safepoint;
pub mod scheduler;
pub mod thread;

pub use finalizer::{FinalizerProcessor, ProcessorState};
pub use gc::{Epochs, GcState};
pub use safepoint::{SafepointAction, SafepointFlag, ThreadSuspension};
pub use scheduler::{GcConfig, GcScheduler, ThreadSchedulerData};
pub use thread::{Mutator, NativeScope, ThreadRecord, ThreadRegistry, ThreadState};
