pub mod monitor;
pub mod spin;
#[macro_use]
pub mod utils;

pub use monitor::{Monitor, MonitorLock};
pub use spin::{SpinLock, SpinLockGuard};
pub use utils::formatted_size;
