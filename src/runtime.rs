use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::{
    heap::{
        finalizer::FinalizerProcessor,
        gc::{Epochs, GcState},
        safepoint::ThreadSuspension,
        scheduler::{GcConfig, GcScheduler},
        thread::{Mutator, ThreadRegistry},
    },
    memory::{
        extra::ExtraObjects, FinalizerQueue, ObjectRef, ObjectStore, RawAllocator, SystemAllocator,
    },
    roots::{ExternalRef, ExternalRegistry, GlobalsRegistry},
};

/// Called on the finalizer thread for every collected finalizable object, after its type finalizer.
pub type FinalizerHook = Box<dyn Fn(ObjectRef) + Send + Sync>;

/// Everything a collector instance owns: the object store, root registries, thread registry,
/// safepoint state and finalizer thread. Mutators hold it through an `Arc`; it is torn down
/// after the last of them detached.
pub struct Runtime {
    pub(crate) store: Arc<ObjectStore>,
    pub(crate) globals: GlobalsRegistry,
    pub(crate) externals: Arc<ExternalRegistry>,
    pub(crate) extras: ExtraObjects,
    pub(crate) threads: ThreadRegistry,
    pub(crate) suspension: ThreadSuspension,
    pub(crate) gc: Arc<GcState>,
    pub(crate) scheduler: GcScheduler,
    pub(crate) finalizers: FinalizerProcessor,
    finalizer_hook: Arc<OnceCell<FinalizerHook>>,
}

impl Runtime {
    pub fn new(config: GcConfig) -> Arc<Self> {
        let allocator: Arc<dyn RawAllocator> = match config.max_heap_size {
            Some(limit) => Arc::new(SystemAllocator::with_limit(limit)),
            None => Arc::new(SystemAllocator::new()),
        };
        let store = Arc::new(ObjectStore::new(allocator));
        let gc = Arc::new(GcState::new());
        let finalizer_hook: Arc<OnceCell<FinalizerHook>> = Arc::new(OnceCell::new());

        let finalizers = {
            let store = store.clone();
            let hook = finalizer_hook.clone();
            let gc = gc.clone();
            FinalizerProcessor::new(
                move |queue: FinalizerQueue| {
                    queue.finalize(&store, hook.get().map(|hook| &**hook));
                },
                move |epoch| gc.finalized(epoch),
            )
        };

        log::debug!(target: "gc", "runtime created with {:?}", config);

        Arc::new(Self {
            store,
            globals: GlobalsRegistry::new(),
            externals: Arc::new(ExternalRegistry::new()),
            extras: ExtraObjects::new(),
            threads: ThreadRegistry::new(),
            suspension: ThreadSuspension::new(),
            gc,
            scheduler: GcScheduler::new(config),
            finalizers,
            finalizer_hook,
        })
    }

    pub fn from_env() -> Arc<Self> {
        Self::new(GcConfig::from_env())
    }

    pub fn config(&self) -> &GcConfig {
        self.scheduler.config()
    }

    /// Registers the calling thread as a mutator.
    pub fn attach_thread(self: &Arc<Self>) -> Mutator {
        Mutator::attach(self.clone())
    }

    /// Installs the finalizer hook. Returns `false` if one was installed already.
    pub fn set_finalizer_hook(&self, hook: impl Fn(ObjectRef) + Send + Sync + 'static) -> bool {
        self.finalizer_hook.set(Box::new(hook)).is_ok()
    }

    /// External reference with the given count, creatable from any thread. `object` must be
    /// alive: reachable, or just allocated by a runnable mutator.
    pub fn create_external_ref(&self, object: ObjectRef, rc: i32) -> ExternalRef {
        self.externals.create(object, rc)
    }

    pub fn schedule(&self) -> u64 {
        self.gc.schedule()
    }

    /// Must not be called from an attached thread outside a native scope.
    pub fn wait_finished(&self, epoch: u64) {
        self.gc.wait_finished(epoch);
    }

    /// Must not be called from an attached thread outside a native scope.
    pub fn wait_finalizers(&self, epoch: u64) {
        self.gc.wait_finalized(epoch);
    }

    pub fn epochs(&self) -> Epochs {
        self.gc.epochs()
    }

    pub fn start_finalizer_thread_if_needed(&self) {
        self.finalizers.start_thread_if_needed();
    }

    pub fn stop_finalizer_thread_if_running(&self) {
        self.finalizers.stop_thread_if_running();
    }

    pub fn is_finalizer_thread_running(&self) -> bool {
        self.finalizers.is_running()
    }

    /// Bytes held by the allocator, including unpublished and permanent objects.
    pub fn heap_bytes(&self) -> usize {
        self.store.allocator().allocated_bytes()
    }

    /// Published objects. Exact only while no mutator is running.
    pub fn store_size_unsafe(&self) -> usize {
        self.store.size_unsafe()
    }

    pub fn alive_objects_unsafe(&self) -> Vec<ObjectRef> {
        self.store.objects_unsafe()
    }

    pub fn permanent_objects(&self) -> Vec<ObjectRef> {
        self.store.permanent_objects()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn external_refs(&self) -> &Arc<ExternalRegistry> {
        &self.externals
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.finalizers.stop_thread_if_running();
        crate::gc_assert!(
            self.threads.is_empty(),
            "runtime dropped with {} attached threads",
            self.threads.len()
        );
        log::debug!(
            target: "gc",
            "runtime torn down with {} objects and {} extra entries",
            self.store.size_unsafe(),
            self.extras.len()
        );
    }
}
