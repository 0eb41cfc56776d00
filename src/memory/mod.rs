pub mod allocator;
pub mod extra;
pub mod object;
pub mod object_factory;

pub use allocator::{RawAllocator, SystemAllocator};
pub use extra::{WeakRef, WEAK_REFERENCE_TYPE};
pub use object::{ObjectHeader, ObjectRef, TypeInfo, TypeKind};
pub use object_factory::{FinalizerQueue, NodeRef, ObjectStore, SweepStats, ThreadArena};
