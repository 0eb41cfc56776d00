//! Root sets that live outside the object graph.

pub mod external;
pub mod globals;

pub use external::{ExternalNode, ExternalRef, ExternalRegistry, DISPOSED};
pub use globals::{GlobalSlot, GlobalsRegistry, ThreadGlobals};
