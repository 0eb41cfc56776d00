//! Mutator threads.
//!
//! A thread is either `Runnable`, in which case it may touch the heap and must poll safepoints,
//! or `Native`, in which case the collector treats it as stopped. Switching back to `Runnable`
//! is a store followed by a check of the suspension request, both sequentially consistent; the
//! coordinator does the same in the opposite order, so either it sees the thread as runnable and
//! waits for it to park, or the thread sees the request and parks on its own.

use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use atomic::Atomic;
use parking_lot::{Mutex, MutexGuard};

use super::{gc, safepoint::SafepointAction, scheduler::ThreadSchedulerData};
use crate::{
    base::formatted_size,
    memory::{
        extra::WEAK_REFERENCE_TYPE, object_factory::payload_size, ObjectRef, ThreadArena,
        TypeInfo, WeakRef,
    },
    roots::{ExternalRef, GlobalSlot, ThreadGlobals},
    runtime::Runtime,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    Runnable,
    Native,
}

/// The part of a mutator the collector looks at.
pub struct ThreadRecord {
    id: usize,
    state: Atomic<ThreadState>,
    suspended: AtomicBool,
    pub(crate) roots: Mutex<Vec<Option<ObjectRef>>>,
}

impl ThreadRecord {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::SeqCst)
    }

    /// Parked at a safepoint or running native code.
    pub fn is_stopped(&self) -> bool {
        self.state() == ThreadState::Native || self.suspended.load(Ordering::SeqCst)
    }
}

pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<ThreadRecord>>>,
    next_id: AtomicUsize,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    /// New threads start in `Native` state so a collection in progress ignores them.
    pub fn register(&self) -> Arc<ThreadRecord> {
        let record = Arc::new(ThreadRecord {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            state: Atomic::new(ThreadState::Native),
            suspended: AtomicBool::new(false),
            roots: Mutex::new(Vec::new()),
        });
        self.threads.lock().push(record.clone());
        log::debug!(
            target: "gc-safepoint",
            "thread #{} ({}) attached",
            record.id,
            std::thread::current().name().unwrap_or("<unnamed>")
        );
        record
    }

    pub fn unregister(&self, record: &ThreadRecord) {
        self.threads
            .lock()
            .retain(|other| !std::ptr::eq(&**other, record));
        log::debug!(target: "gc-safepoint", "thread #{} detached", record.id);
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<Arc<ThreadRecord>>> {
        self.threads.lock()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until every thread but the coordinator is stopped. There is no timeout: a thread
    /// that never polls a safepoint stalls the collection, which is reported periodically.
    pub fn wait_for_suspension(&self, coordinator: usize) {
        let start = Instant::now();
        let mut report_at = Duration::from_secs(1);

        loop {
            let running = self
                .threads
                .lock()
                .iter()
                .filter(|record| record.id != coordinator && !record.is_stopped())
                .count();
            if running == 0 {
                return;
            }

            if start.elapsed() >= report_at {
                log::debug!(
                    target: "gc-safepoint",
                    "still waiting for {} threads to reach a safepoint after {:?}",
                    running,
                    start.elapsed()
                );
                report_at *= 2;
            }
            std::thread::yield_now();
        }
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// GC mutator.
///
/// Allocates objects, holds the thread's shadow stack of roots and cooperates with collections
/// by polling [`safepoint`](Self::safepoint). Bound to the thread that attached it.
pub struct Mutator {
    pub(crate) runtime: Arc<Runtime>,
    pub(crate) record: Arc<ThreadRecord>,
    pub(crate) arena: ThreadArena,
    pub(crate) globals: ThreadGlobals,
    pub(crate) scheduler: ThreadSchedulerData,
    _not_send: PhantomData<*mut ()>,
}

impl Mutator {
    pub(crate) fn attach(runtime: Arc<Runtime>) -> Self {
        let record = runtime.threads.register();
        let mut thread = Self {
            arena: ThreadArena::new(runtime.store.clone()),
            globals: ThreadGlobals::new(),
            scheduler: runtime.scheduler.thread_data(),
            record,
            runtime,
            _not_send: PhantomData,
        };
        thread.set_runnable();
        thread
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn id(&self) -> usize {
        self.record.id()
    }

    /// Allocates a plain object of type `ty` with every slot zeroed.
    pub fn allocate(&mut self, ty: &'static TypeInfo) -> ObjectRef {
        assert!(!ty.is_array(), "{} is an array type", ty.name);
        self.allocate_object(ty, 0)
    }

    pub fn allocate_array(&mut self, ty: &'static TypeInfo, count: usize) -> ObjectRef {
        assert!(ty.is_array(), "{} is not an array type", ty.name);
        self.allocate_object(ty, count)
    }

    /// Allocates an object that is never collected. It must only reference permanent objects.
    pub fn allocate_permanent(&mut self, ty: &'static TypeInfo, count: usize) -> ObjectRef {
        let store = self.runtime.store.clone();
        self.allocate_with(payload_size(ty, count), |_| {
            store.allocate_permanent(ty, count)
        })
    }

    fn allocate_object(&mut self, ty: &'static TypeInfo, count: usize) -> ObjectRef {
        self.allocate_with(payload_size(ty, count), |thread| {
            thread.arena.try_allocate(ty, count)
        })
    }

    fn allocate_with(
        &mut self,
        size: usize,
        mut allocate: impl FnMut(&mut Self) -> Option<ObjectRef>,
    ) -> ObjectRef {
        if self.scheduler.on_safepoint_allocation(size) {
            self.check_heap_size();
        }
        self.poll();

        if let Some(object) = allocate(self) {
            return object;
        }

        log::warn!(
            target: "gc",
            "allocation of {} failed with {} held, collecting",
            formatted_size(size),
            formatted_size(self.runtime.heap_bytes())
        );
        self.perform_full_gc();

        match allocate(self) {
            Some(object) => object,
            None => crate::gc_fatal!(
                "out of memory: cannot allocate {} ({} held after a full collection)",
                formatted_size(size),
                formatted_size(self.runtime.heap_bytes())
            ),
        }
    }

    /// Weak reference to `object`. Every call for the same object returns the same box.
    pub fn weak_reference(&mut self, object: ObjectRef) -> WeakRef {
        if let Some(weak_box) = object.header().extra().and_then(|extra| extra.weak_box()) {
            return WeakRef::new(weak_box);
        }

        let weak_box = if object.is_permanent() {
            self.allocate_permanent(&WEAK_REFERENCE_TYPE, 0)
        } else {
            let base = self.roots_len();
            self.push_root(Some(object));
            let weak_box = self.allocate(&WEAK_REFERENCE_TYPE);
            self.truncate_roots(base);
            weak_box
        };
        weak_box.set_raw_slot(0, object.as_ptr());

        let extra = self.runtime.extras.get_or_install(object);
        WeakRef::new(extra.install_weak_box(weak_box))
    }

    /// Makes `slot` a root once this thread publishes.
    pub fn register_global(&mut self, slot: &'static GlobalSlot) {
        self.runtime.globals.register_slot(&mut self.globals, slot);
    }

    /// External reference with a count of one.
    pub fn create_external_ref(&mut self, object: ObjectRef) -> ExternalRef {
        self.runtime.externals.create(object, 1)
    }

    pub fn push_root(&mut self, object: Option<ObjectRef>) -> usize {
        let mut roots = self.record.roots.lock();
        roots.push(object);
        roots.len() - 1
    }

    pub fn root(&self, index: usize) -> Option<ObjectRef> {
        self.record.roots.lock()[index]
    }

    pub fn set_root(&mut self, index: usize, object: Option<ObjectRef>) {
        self.record.roots.lock()[index] = object;
    }

    pub fn pop_root(&mut self) -> Option<ObjectRef> {
        self.record.roots.lock().pop().flatten()
    }

    pub fn truncate_roots(&mut self, len: usize) {
        self.record.roots.lock().truncate(len);
    }

    pub fn roots_len(&self) -> usize {
        self.record.roots.lock().len()
    }

    /// Safepoint poll. Runs or joins a pending collection.
    pub fn safepoint(&mut self) {
        if self.scheduler.on_safepoint_regular(1) {
            self.check_heap_size();
        }
        self.poll();
    }

    fn poll(&mut self) {
        match self.runtime.gc.flag().get() {
            SafepointAction::None => {}
            SafepointAction::NeedsGc => {
                gc::perform_collection(self);
            }
            SafepointAction::NeedsSuspend => self.suspend_if_requested(),
        }
    }

    fn check_heap_size(&mut self) {
        let heap = self.runtime.heap_bytes();
        if self.runtime.scheduler.should_collect(heap) {
            log::debug!(
                target: "gc",
                "heap at {} (target {}), scheduling collection",
                formatted_size(heap),
                formatted_size(self.runtime.scheduler.target_heap_bytes())
            );
            self.runtime.gc.schedule();
        }
    }

    /// Publishes the arena and pending global slots.
    pub fn publish(&mut self) {
        self.arena.publish();
        self.runtime.globals.publish(&mut self.globals);
    }

    pub(crate) fn suspend_if_requested(&mut self) {
        if !self.runtime.suspension.is_requested() {
            return;
        }
        self.publish();
        self.scheduler.on_stopped_for_gc();
        self.runtime.suspension.park(&self.record.suspended);
    }

    fn set_runnable(&mut self) {
        self.record.state.store(ThreadState::Runnable, Ordering::SeqCst);
        self.suspend_if_requested();
    }

    /// Runs or joins collections until a freshly scheduled epoch has finished. Returns that epoch.
    pub fn perform_full_gc(&mut self) -> u64 {
        let epoch = self.runtime.gc.schedule();
        while !self.runtime.gc.is_finished(epoch) {
            self.poll();
            std::thread::yield_now();
        }
        epoch
    }

    pub fn wait_finished(&mut self, epoch: u64) {
        let runtime = self.runtime.clone();
        let _native = self.enter_native();
        runtime.gc.wait_finished(epoch);
    }

    pub fn wait_finalizers(&mut self, epoch: u64) {
        let runtime = self.runtime.clone();
        let _native = self.enter_native();
        runtime.gc.wait_finalized(epoch);
    }

    /// Leaves managed code until the returned scope is dropped. Collections proceed without
    /// waiting for this thread in the meantime.
    pub fn enter_native(&mut self) -> NativeScope<'_> {
        self.publish();
        self.record.state.store(ThreadState::Native, Ordering::SeqCst);
        NativeScope { thread: self }
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.publish();
        self.record.state.store(ThreadState::Native, Ordering::SeqCst);
        self.runtime.threads.unregister(&self.record);
    }
}

/// Native code region. The thread may not touch managed objects while this is alive.
pub struct NativeScope<'a> {
    thread: &'a mut Mutator,
}

impl NativeScope<'_> {
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.thread.runtime
    }
}

impl Drop for NativeScope<'_> {
    fn drop(&mut self) {
        self.thread.set_runnable();
    }
}
