//! Stop-the-world mark-sweep garbage collector core.
//!
//! Mutators allocate into thread-local arenas that are periodically published into a shared
//! object store. Any mutator may trigger a collection; the first one to get through becomes the
//! coordinator, stops the others at their safepoints, marks from the global slots, shadow stacks
//! and external references, sweeps the store and hands finalizable objects to a background
//! finalizer thread.
//!
//! ```no_run
//! use stwgc::{GcConfig, Runtime, TypeInfo};
//!
//! static PAIR: TypeInfo = TypeInfo::object("Pair", 2, &[0, 1]);
//!
//! let runtime = Runtime::new(GcConfig::default());
//! let mut thread = runtime.attach_thread();
//! let pair = thread.allocate(&PAIR);
//! thread.push_root(Some(pair));
//! thread.perform_full_gc();
//! assert!(!pair.is_marked());
//! ```

#[macro_use]
pub mod base;
pub mod heap;
pub mod memory;
pub mod roots;
pub mod runtime;

pub use base::formatted_size;
pub use heap::{GcConfig, Mutator, NativeScope};
pub use memory::{ObjectRef, TypeInfo, TypeKind, WeakRef};
pub use roots::{ExternalRef, GlobalSlot};
pub use runtime::Runtime;

#[cfg(test)]
mod tests;
