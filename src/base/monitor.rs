use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// A mutex paired with the condition variable that announces changes to the data it protects.
pub struct Monitor<T> {
    lock: Mutex<T>,
    condvar: Condvar,
}

impl<T> Monitor<T> {
    pub fn new(val: T) -> Self {
        Self {
            lock: Mutex::new(val),
            condvar: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MonitorLock<'_, T> {
        MonitorLock {
            lock: self.lock.lock(),
            condvar: &self.condvar,
        }
    }

    pub fn notify_all(&self) {
        self.condvar.notify_all();
    }
}

pub struct MonitorLock<'a, T> {
    lock: MutexGuard<'a, T>,
    condvar: &'a Condvar,
}

impl<'a, T> MonitorLock<'a, T> {
    /// Blocks while `condition` holds, re-evaluating it under the lock after every wakeup.
    pub fn wait_while(&mut self, condition: impl FnMut(&mut T) -> bool) {
        self.condvar.wait_while(&mut self.lock, condition);
    }

    pub fn notify_all(&self) {
        self.condvar.notify_all();
    }
}

impl<'a, T> Deref for MonitorLock<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.lock
    }
}

impl<'a, T> DerefMut for MonitorLock<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.lock
    }
}
