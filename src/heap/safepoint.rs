use std::sync::atomic::{AtomicBool, Ordering};

use atomic::Atomic;

use crate::base::Monitor;

/// What a mutator polling its safepoint has to do.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SafepointAction {
    None,
    /// A collection is running; park until it is over.
    NeedsSuspend,
    /// A collection was requested; the first thread to see this tries to run it.
    NeedsGc,
}

pub struct SafepointFlag(Atomic<SafepointAction>);

impl SafepointFlag {
    pub const fn new() -> Self {
        Self(Atomic::new(SafepointAction::None))
    }

    pub fn get(&self) -> SafepointAction {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, action: SafepointAction) {
        self.0.store(action, Ordering::Release);
    }

    /// Moves the flag from `None` to `NeedsGc`. Concurrent requests coalesce: only one succeeds.
    pub fn try_request_gc(&self) -> bool {
        self.0
            .compare_exchange(
                SafepointAction::None,
                SafepointAction::NeedsGc,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for SafepointFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative suspension of mutators. At most one coordinator holds a suspension request at a
/// time; every other thread parks in [`park`](Self::park) until [`resume`](Self::resume).
pub struct ThreadSuspension {
    requested: AtomicBool,
    monitor: Monitor<()>,
}

impl ThreadSuspension {
    pub fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            monitor: Monitor::new(()),
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Returns `false` if another coordinator already requested suspension.
    pub fn request(&self) -> bool {
        let _lock = self.monitor.lock();
        self.requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Blocks the calling thread while suspension is requested. `suspended` is raised for the
    /// duration so the coordinator can count the thread as stopped.
    pub fn park(&self, suspended: &AtomicBool) {
        let mut lock = self.monitor.lock();
        if !self.is_requested() {
            return;
        }

        suspended.store(true, Ordering::SeqCst);
        log::trace!(target: "gc-safepoint", "{:?} parked", std::thread::current().id());
        lock.wait_while(|_| self.requested.load(Ordering::SeqCst));
        suspended.store(false, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        let lock = self.monitor.lock();
        self.requested.store(false, Ordering::SeqCst);
        lock.notify_all();
    }
}

impl Default for ThreadSuspension {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicUsize, Arc};

    use super::*;

    #[test]
    fn gc_requests_coalesce() {
        let flag = Arc::new(SafepointFlag::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles = (0..8)
            .map(|_| {
                let flag = flag.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if flag.try_request_gc() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(flag.get(), SafepointAction::NeedsGc);

        flag.set(SafepointAction::NeedsSuspend);
        assert!(!flag.try_request_gc());
        flag.set(SafepointAction::None);
        assert!(flag.try_request_gc());
    }

    #[test]
    fn park_until_resumed() {
        let _ = env_logger::builder().is_test(true).try_init();

        static SUSPENDED: [AtomicBool; 4] = [
            AtomicBool::new(false),
            AtomicBool::new(false),
            AtomicBool::new(false),
            AtomicBool::new(false),
        ];

        let suspension = Arc::new(ThreadSuspension::new());
        assert!(suspension.request());
        assert!(!suspension.request());

        let handles = SUSPENDED
            .iter()
            .map(|suspended| {
                let suspension = suspension.clone();
                std::thread::spawn(move || suspension.park(suspended))
            })
            .collect::<Vec<_>>();

        while !SUSPENDED.iter().all(|s| s.load(Ordering::SeqCst)) {
            std::thread::yield_now();
        }

        suspension.resume();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(SUSPENDED.iter().all(|s| !s.load(Ordering::SeqCst)));
        assert!(!suspension.is_requested());

        // Nothing requested: parking returns immediately.
        suspension.park(&SUSPENDED[0]);
        assert!(suspension.request());
        suspension.resume();
    }
}
