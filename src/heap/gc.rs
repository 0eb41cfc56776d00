//! Stop-the-world collection: coordination, marking and sweeping.

use std::time::Instant;

use crossbeam_deque::Worker;

use super::{
    safepoint::{SafepointAction, SafepointFlag},
    thread::Mutator,
};
use crate::{
    base::{formatted_size, Monitor},
    memory::{FinalizerQueue, ObjectRef},
    runtime::Runtime,
};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Epochs {
    pub scheduled: u64,
    pub started: u64,
    pub finished: u64,
    pub finalized: u64,
}

/// Safepoint flag plus epoch bookkeeping. `scheduled >= finished >= finalized` holds at all times.
pub struct GcState {
    flag: SafepointFlag,
    epochs: Monitor<Epochs>,
}

impl GcState {
    pub fn new() -> Self {
        Self {
            flag: SafepointFlag::new(),
            epochs: Monitor::new(Epochs::default()),
        }
    }

    pub fn flag(&self) -> &SafepointFlag {
        &self.flag
    }

    pub fn epochs(&self) -> Epochs {
        *self.epochs.lock()
    }

    /// Requests a collection and returns the epoch that will cover it. Requests made before a
    /// collection starts share its epoch.
    pub fn schedule(&self) -> u64 {
        let epoch = {
            let mut epochs = self.epochs.lock();
            if epochs.scheduled <= epochs.started {
                epochs.scheduled = epochs.started + 1;
            }
            epochs.scheduled
        };
        if self.flag.try_request_gc() {
            log::debug!(target: "gc", "epoch #{} scheduled", epoch);
        }
        epoch
    }

    pub(crate) fn start(&self) -> u64 {
        let mut epochs = self.epochs.lock();
        let epoch = if epochs.scheduled > epochs.started {
            epochs.scheduled
        } else {
            epochs.started + 1
        };
        epochs.started = epoch;
        epochs.scheduled = epochs.scheduled.max(epoch);
        epoch
    }

    /// Marks `epoch` as swept. The flag is re-armed when another epoch got scheduled meanwhile.
    pub(crate) fn finish(&self, epoch: u64) {
        let mut epochs = self.epochs.lock();
        epochs.finished = epoch;
        if epochs.scheduled > epoch {
            self.flag.set(SafepointAction::NeedsGc);
        } else {
            self.flag.set(SafepointAction::None);
        }
        epochs.notify_all();
    }

    pub(crate) fn finalized(&self, epoch: u64) {
        let mut epochs = self.epochs.lock();
        crate::gc_assert!(
            epoch <= epochs.finished,
            "epoch #{} finalized before it finished (finished #{})",
            epoch,
            epochs.finished
        );
        epochs.finalized = epochs.finalized.max(epoch);
        epochs.notify_all();
    }

    pub fn is_finished(&self, epoch: u64) -> bool {
        self.epochs.lock().finished >= epoch
    }

    pub fn wait_finished(&self, epoch: u64) {
        let mut epochs = self.epochs.lock();
        epochs.wait_while(|epochs| epochs.finished < epoch);
    }

    pub fn wait_finalized(&self, epoch: u64) {
        let mut epochs = self.epochs.lock();
        epochs.wait_while(|epochs| epochs.finalized < epoch);
    }
}

impl Default for GcState {
    fn default() -> Self {
        Self::new()
    }
}

/// Tries to become the coordinator and run a collection from `thread`. Returns `false` when
/// another thread is coordinating; `thread` has then been parked until that collection ended.
pub(crate) fn perform_collection(thread: &mut Mutator) -> bool {
    let runtime = thread.runtime.clone();

    if !runtime.suspension.request() {
        thread.suspend_if_requested();
        return false;
    }

    // Lost the race to a coordinator that already served this request.
    if runtime.gc.flag().get() != SafepointAction::NeedsGc {
        runtime.suspension.resume();
        return false;
    }

    let start = Instant::now();
    runtime.gc.flag().set(SafepointAction::NeedsSuspend);
    thread.publish();
    runtime.threads.wait_for_suspension(thread.record.id());
    let epoch = runtime.gc.start();
    log::debug!(
        target: "gc",
        "epoch #{}: world stopped in {:.3}ms",
        epoch,
        start.elapsed().as_micros() as f64 / 1000.0
    );

    let marked = mark(&runtime);
    let weak = runtime.extras.sweep();
    let cleared = runtime.externals.sweep();
    let mut finalizers = FinalizerQueue::new();
    let stats = runtime.store.sweep(&mut finalizers);
    runtime.scheduler.on_gc_finished(stats.alive_bytes);

    runtime.gc.finish(epoch);
    runtime.suspension.resume();
    thread.scheduler.on_stopped_for_gc();

    log::info!(
        target: "gc",
        "GC({}) marked {}, swept {} ({}), finalizable {}, weak cleared {}, external cleared {}, alive {} in {:.3}ms",
        epoch,
        marked,
        stats.swept,
        formatted_size(stats.swept_bytes),
        stats.finalizable,
        weak,
        cleared,
        formatted_size(stats.alive_bytes),
        start.elapsed().as_micros() as f64 / 1000.0
    );

    runtime.finalizers.schedule_tasks(finalizers, epoch);
    true
}

/// Marks everything reachable from the roots. Returns the number of objects marked.
fn mark(runtime: &Runtime) -> usize {
    let worklist = Worker::new_fifo();
    let mut marked = 0;

    let mut visit = |object: ObjectRef| {
        if !object.is_permanent() && object.header().try_mark() {
            marked += 1;
            worklist.push(object);
        }
    };

    for slot in runtime.globals.collect() {
        if let Some(object) = slot.get() {
            visit(object);
        }
    }

    for record in runtime.threads.lock().iter() {
        for object in record.roots.lock().iter().flatten() {
            visit(*object);
        }
    }

    for node in runtime.externals.roots() {
        if let Some(object) = node.object() {
            visit(object);
        }
    }

    while let Some(object) = worklist.pop() {
        object.for_each_reference(&mut visit);
        // The weak box lives as long as its owner; its referent slot is never traced.
        if let Some(weak_box) = object.header().extra().and_then(|extra| extra.weak_box()) {
            visit(weak_box);
        }
    }

    marked
}
