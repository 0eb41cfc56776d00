use std::{
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use crossbeam_queue::SegQueue;

use super::object::{ObjectHeader, ObjectRef, TypeInfo};

/// Type of the heap-allocated weak reference boxes. Slot 0 holds the referent and is not traced.
pub static WEAK_REFERENCE_TYPE: TypeInfo =
    TypeInfo::object("WeakReference", 1, &[]).with_finalizer(clear_referent);

fn clear_referent(weak_box: ObjectRef) {
    weak_box.set_raw_slot(0, ptr::null_mut());
}

/// Per-object side data that most objects never need. Currently holds the weak reference box.
pub struct ExtraObjectData {
    owner: ObjectRef,
    weak_box: AtomicPtr<ObjectHeader>,
}

impl ExtraObjectData {
    pub fn weak_box(&self) -> Option<ObjectRef> {
        unsafe { ObjectRef::from_raw(self.weak_box.load(Ordering::Acquire)) }
    }

    /// Installs `weak_box` unless another one won the race; returns the box in effect.
    pub(crate) fn install_weak_box(&self, weak_box: ObjectRef) -> ObjectRef {
        match self.weak_box.compare_exchange(
            ptr::null_mut(),
            weak_box.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => weak_box,
            Err(current) => unsafe { ObjectRef::from_raw(current) }.unwrap_or(weak_box),
        }
    }
}

/// Registry of every live `ExtraObjectData`, swept together with the heap.
pub struct ExtraObjects {
    entries: SegQueue<Box<ExtraObjectData>>,
}

impl ExtraObjects {
    pub fn new() -> Self {
        Self {
            entries: SegQueue::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_or_install(&self, owner: ObjectRef) -> &ExtraObjectData {
        if let Some(extra) = owner.header().extra() {
            return unsafe { &*(extra as *const ExtraObjectData) };
        }

        let mut data = Box::new(ExtraObjectData {
            owner,
            weak_box: AtomicPtr::new(ptr::null_mut()),
        });
        let raw = &mut *data as *mut ExtraObjectData;

        match owner.header().extra.compare_exchange(
            ptr::null_mut(),
            raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.entries.push(data);
                unsafe { &*raw }
            }
            Err(current) => unsafe { &*current },
        }
    }

    /// Releases extra data of unmarked owners and nulls their weak boxes.
    ///
    /// Must run after marking and before the object store is swept, with the world stopped.
    pub fn sweep(&self) -> usize {
        let mut swept = 0;
        for _ in 0..self.entries.len() {
            let Some(data) = self.entries.pop() else {
                break;
            };

            let owner = data.owner;
            if owner.is_marked() || owner.is_permanent() {
                self.entries.push(data);
                continue;
            }

            if let Some(weak_box) = data.weak_box() {
                weak_box.set_raw_slot(0, ptr::null_mut());
            }
            owner.header().extra.store(ptr::null_mut(), Ordering::Release);
            swept += 1;
        }
        swept
    }
}

impl Default for ExtraObjects {
    fn default() -> Self {
        Self::new()
    }
}

/// Weak reference to a managed object, backed by a weak box on the heap.
///
/// The box must itself be kept reachable (for example on the shadow stack) to be read after a
/// collection; its referent is not kept alive by it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WeakRef(ObjectRef);

impl WeakRef {
    pub(crate) fn new(weak_box: ObjectRef) -> Self {
        Self(weak_box)
    }

    pub fn from_box(weak_box: ObjectRef) -> Option<Self> {
        ptr::eq(weak_box.type_info(), &WEAK_REFERENCE_TYPE).then_some(Self(weak_box))
    }

    pub fn as_object(self) -> ObjectRef {
        self.0
    }

    pub fn get(self) -> Option<ObjectRef> {
        unsafe { ObjectRef::from_raw(self.0.raw_slot(0)) }
    }
}
