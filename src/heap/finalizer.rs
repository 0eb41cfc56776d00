//! Background thread running finalizers of collected objects.
//!
//! Locks are taken in a fixed order: task state (queue, epoch, shutdown), then the thread handle,
//! then the processor state. The processor state doubles as the start-up barrier and has its own
//! monitor, so a scheduler waiting for the thread to start never blocks the thread itself.

use std::{mem, sync::Arc, thread::JoinHandle};

use parking_lot::Mutex;

use crate::{base::Monitor, memory::FinalizerQueue};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcessorState {
    Stopped,
    Starting,
    Running,
    /// Shutdown requested, pending tasks are still being run.
    Draining,
}

struct Tasks {
    queue: FinalizerQueue,
    epoch: u64,
    shutdown: bool,
    new_tasks_allowed: bool,
}

struct Inner {
    tasks: Monitor<Tasks>,
    state: Monitor<ProcessorState>,
    run_batch: Box<dyn Fn(FinalizerQueue) + Send + Sync>,
    epoch_done: Box<dyn Fn(u64) + Send + Sync>,
}

impl Inner {
    fn run(&self, mut finished_epoch: u64) {
        {
            let mut state = self.state.lock();
            *state = ProcessorState::Running;
            state.notify_all();
        }
        log::debug!(target: "gc-finalizer", "finalizer thread started");

        loop {
            let mut tasks = self.tasks.lock();
            tasks.wait_while(|tasks| {
                tasks.queue.is_empty() && tasks.epoch == finished_epoch && !tasks.shutdown
            });

            if tasks.queue.is_empty() && tasks.epoch == finished_epoch {
                tasks.new_tasks_allowed = false;
                crate::gc_assert!(tasks.shutdown, "finalizer thread woke up with nothing to do");
                break;
            }

            let queue = mem::take(&mut tasks.queue);
            let epoch = tasks.epoch;
            drop(tasks);

            let count = queue.len();
            if count > 0 {
                (self.run_batch)(queue);
            }
            log::debug!(
                target: "gc-finalizer",
                "epoch #{}: ran {} finalizers",
                epoch,
                count
            );
            (self.epoch_done)(epoch);
            finished_epoch = epoch;
        }

        log::debug!(target: "gc-finalizer", "finalizer thread stopped");
        let mut state = self.state.lock();
        *state = ProcessorState::Stopped;
        state.notify_all();
    }
}

pub struct FinalizerProcessor {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FinalizerProcessor {
    /// `run_batch` runs the finalizers of one queue on the processor thread; `epoch_done` is told
    /// about every epoch whose finalizers are complete, in epoch order.
    pub fn new(
        run_batch: impl Fn(FinalizerQueue) + Send + Sync + 'static,
        epoch_done: impl Fn(u64) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: Monitor::new(Tasks {
                    queue: FinalizerQueue::new(),
                    epoch: 0,
                    shutdown: false,
                    new_tasks_allowed: true,
                }),
                state: Monitor::new(ProcessorState::Stopped),
                run_batch: Box::new(run_batch),
                epoch_done: Box::new(epoch_done),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ProcessorState {
        *self.inner.state.lock()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            ProcessorState::Running | ProcessorState::Draining
        )
    }

    /// Hands `tasks` over to the finalizer thread and records `epoch` as their epoch. An empty
    /// batch with no thread running completes the epoch right away.
    pub fn schedule_tasks(&self, mut tasks: FinalizerQueue, epoch: u64) {
        let mut state = self.inner.tasks.lock();
        if tasks.is_empty() && !self.is_running() {
            drop(state);
            (self.inner.epoch_done)(epoch);
            return;
        }

        state.wait_while(|state| !state.new_tasks_allowed || state.shutdown);
        self.start_locked(&state);
        state.queue.merge_with(&mut tasks);
        state.epoch = epoch;
        state.notify_all();
    }

    pub fn start_thread_if_needed(&self) {
        let mut state = self.inner.tasks.lock();
        state.wait_while(|state| !state.new_tasks_allowed || state.shutdown);
        self.start_locked(&state);
    }

    fn start_locked(&self, tasks: &Tasks) {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }

        *self.inner.state.lock() = ProcessorState::Starting;
        let inner = self.inner.clone();
        let finished_epoch = tasks.epoch;
        let handle = std::thread::Builder::new()
            .name("gc-finalizer".to_string())
            .spawn(move || inner.run(finished_epoch));

        match handle {
            Ok(handle) => *thread = Some(handle),
            Err(err) => crate::gc_fatal!("failed to start finalizer thread: {}", err),
        }

        let mut state = self.inner.state.lock();
        state.wait_while(|state| *state == ProcessorState::Starting);
    }

    /// Lets the thread drain its queue, then joins it. Scheduling blocks until this returns.
    pub fn stop_thread_if_running(&self) {
        {
            let mut tasks = self.inner.tasks.lock();
            tasks.shutdown = true;
            tasks.notify_all();
        }
        {
            let mut state = self.inner.state.lock();
            if *state == ProcessorState::Running {
                *state = ProcessorState::Draining;
            }
        }

        {
            let mut thread = self.thread.lock();
            if let Some(handle) = thread.take() {
                if handle.join().is_err() {
                    crate::gc_fatal!("finalizer thread panicked");
                }
            }
        }

        let mut tasks = self.inner.tasks.lock();
        crate::gc_assert!(
            tasks.queue.is_empty(),
            "{} finalizers left after the finalizer thread stopped",
            tasks.queue.len()
        );
        tasks.new_tasks_allowed = true;
        tasks.shutdown = false;
        tasks.notify_all();
    }
}

impl Drop for FinalizerProcessor {
    fn drop(&mut self) {
        self.stop_thread_if_running();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::memory::{ObjectStore, SystemAllocator, ThreadArena, TypeInfo};

    static FINALIZABLE: TypeInfo = TypeInfo::object("Finalizable", 0, &[]).with_finalizer(noop);

    fn noop(_: crate::memory::ObjectRef) {}

    struct Fixture {
        store: Arc<ObjectStore>,
        finalized: Arc<AtomicUsize>,
        epochs: Arc<Monitor<Vec<u64>>>,
        processor: FinalizerProcessor,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(ObjectStore::new(Arc::new(SystemAllocator::new())));
            let finalized = Arc::new(AtomicUsize::new(0));
            let epochs = Arc::new(Monitor::new(Vec::new()));

            let processor = {
                let store = store.clone();
                let finalized = finalized.clone();
                let epochs = epochs.clone();
                FinalizerProcessor::new(
                    move |queue| {
                        let count = queue.finalize(&store, None);
                        finalized.fetch_add(count, Ordering::SeqCst);
                    },
                    move |epoch| {
                        let mut epochs = epochs.lock();
                        epochs.push(epoch);
                        epochs.notify_all();
                    },
                )
            };

            Self {
                store,
                finalized,
                epochs,
                processor,
            }
        }

        fn queue(&self, count: usize) -> FinalizerQueue {
            let mut arena = ThreadArena::new(self.store.clone());
            for _ in 0..count {
                arena.allocate(&FINALIZABLE, 0);
            }
            arena.publish();

            let mut queue = FinalizerQueue::new();
            let mut iter = self.store.lock_for_iter();
            while iter.current().is_some() {
                iter.move_and_advance(&mut queue);
            }
            queue
        }

        fn wait_epoch(&self, epoch: u64) {
            let mut epochs = self.epochs.lock();
            epochs.wait_while(|epochs| !epochs.contains(&epoch));
        }
    }

    #[test]
    fn empty_epoch_without_thread() {
        let fixture = Fixture::new();
        fixture.processor.schedule_tasks(FinalizerQueue::new(), 1);

        assert_eq!(*fixture.epochs.lock(), vec![1]);
        assert!(!fixture.processor.is_running());
        assert_eq!(fixture.processor.state(), ProcessorState::Stopped);
    }

    #[test]
    fn runs_tasks_on_its_thread() {
        let _ = env_logger::builder().is_test(true).try_init();
        let fixture = Fixture::new();

        fixture.processor.schedule_tasks(fixture.queue(3), 1);
        assert!(fixture.processor.is_running());
        fixture.wait_epoch(1);
        assert_eq!(fixture.finalized.load(Ordering::SeqCst), 3);

        // Empty epochs go through the running thread, keeping epoch order.
        fixture.processor.schedule_tasks(FinalizerQueue::new(), 2);
        fixture.processor.schedule_tasks(fixture.queue(2), 3);
        fixture.wait_epoch(3);
        assert_eq!(fixture.finalized.load(Ordering::SeqCst), 5);

        let epochs = fixture.epochs.lock().clone();
        assert!(epochs.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(epochs.last(), Some(&3));

        fixture.processor.stop_thread_if_running();
        assert!(!fixture.processor.is_running());
        assert_eq!(fixture.store.allocator().allocated_bytes(), 0);
    }

    #[test]
    fn stop_drains_and_restarts() {
        let fixture = Fixture::new();

        fixture.processor.start_thread_if_needed();
        assert!(fixture.processor.is_running());
        fixture.processor.start_thread_if_needed();

        fixture.processor.schedule_tasks(fixture.queue(10), 1);
        fixture.processor.stop_thread_if_running();
        assert_eq!(fixture.finalized.load(Ordering::SeqCst), 10);
        assert_eq!(*fixture.epochs.lock(), vec![1]);

        // Stopping twice is fine.
        fixture.processor.stop_thread_if_running();

        fixture.processor.schedule_tasks(fixture.queue(1), 2);
        fixture.wait_epoch(2);
        assert_eq!(fixture.finalized.load(Ordering::SeqCst), 11);
    }
}
