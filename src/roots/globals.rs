use std::{
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use parking_lot::Mutex;

use crate::memory::{ObjectHeader, ObjectRef};

/// A global variable holding a reference. Intended to live in a `static`.
pub struct GlobalSlot {
    value: AtomicPtr<ObjectHeader>,
}

impl GlobalSlot {
    pub const fn new() -> Self {
        Self {
            value: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn get(&self) -> Option<ObjectRef> {
        unsafe { ObjectRef::from_raw(self.value.load(Ordering::Acquire)) }
    }

    pub fn set(&self, value: Option<ObjectRef>) {
        let raw = value.map_or(ptr::null_mut(), ObjectRef::as_ptr);
        self.value.store(raw, Ordering::Release);
    }
}

impl Default for GlobalSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Slots registered by one thread that are not yet visible in the registry.
#[derive(Default)]
pub struct ThreadGlobals {
    pending: Vec<&'static GlobalSlot>,
}

impl ThreadGlobals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Process-lifetime set of global slots. Slots are never unregistered.
pub struct GlobalsRegistry {
    slots: Mutex<Vec<&'static GlobalSlot>>,
}

impl GlobalsRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Records `slot` in the thread's pending list; it becomes a root once the thread publishes.
    pub fn register_slot(&self, thread: &mut ThreadGlobals, slot: &'static GlobalSlot) {
        thread.pending.push(slot);
    }

    pub fn publish(&self, thread: &mut ThreadGlobals) {
        if thread.pending.is_empty() {
            return;
        }
        log::trace!(target: "gc-roots", "publishing {} global slots", thread.pending.len());
        self.slots.lock().append(&mut thread.pending);
    }

    /// Snapshot of every published slot. Only sound for root collection while the registering
    /// threads are stopped or have published.
    pub fn collect(&self) -> Vec<&'static GlobalSlot> {
        self.slots.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for GlobalsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static FIRST: GlobalSlot = GlobalSlot::new();
    static SECOND: GlobalSlot = GlobalSlot::new();

    #[test]
    fn registered_after_publish() {
        let registry = GlobalsRegistry::new();
        let mut a = ThreadGlobals::new();
        let mut b = ThreadGlobals::new();

        registry.register_slot(&mut a, &FIRST);
        registry.register_slot(&mut b, &SECOND);
        assert!(registry.is_empty());

        registry.publish(&mut a);
        let slots = registry.collect();
        assert_eq!(slots.len(), 1);
        assert!(ptr::eq(slots[0], &FIRST));
        assert!(a.is_empty());

        registry.publish(&mut b);
        registry.publish(&mut b);
        assert_eq!(registry.len(), 2);
        assert!(FIRST.get().is_none());
    }
}
