use std::{
    collections::HashSet,
    process::Command,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier,
    },
};

use parking_lot::Mutex;
use rand::Rng;

use crate::{
    heap::{GcConfig, Mutator},
    memory::{ObjectRef, TypeInfo},
    roots::GlobalSlot,
    runtime::Runtime,
};

static NODE: TypeInfo = TypeInfo::object("Node", 2, &[0, 1]);
/// Slot 0 is a reference, slot 1 a tag.
static TAGGED: TypeInfo = TypeInfo::object("Tagged", 2, &[0]);
static ARRAY: TypeInfo = TypeInfo::ref_array("Array");
static BYTES: TypeInfo = TypeInfo::scalar_array("Bytes", 1);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Collections only happen when a test asks for them.
fn manual_config() -> GcConfig {
    GcConfig {
        auto_tune: false,
        target_heap_bytes: usize::MAX,
        ..GcConfig::default()
    }
}

fn runtime() -> Arc<Runtime> {
    init_logger();
    Runtime::new(manual_config())
}

fn alive(runtime: &Runtime) -> HashSet<ObjectRef> {
    runtime.alive_objects_unsafe().into_iter().collect()
}

#[test]
fn reachability() {
    static GLOBAL: GlobalSlot = GlobalSlot::new();

    let runtime = runtime();
    let mut thread = runtime.attach_thread();
    thread.register_global(&GLOBAL);

    let obj1 = thread.allocate(&NODE);
    GLOBAL.set(Some(obj1));
    let obj2 = thread.allocate(&NODE);
    obj1.set_field(0, Some(obj2));

    let obj3 = thread.allocate(&NODE);
    thread.push_root(Some(obj3));
    let obj4 = thread.allocate(&NODE);
    obj3.set_field(1, Some(obj4));

    let obj5 = thread.allocate(&NODE);
    let obj6 = thread.allocate(&NODE);
    obj5.set_field(0, Some(obj6));
    obj6.set_field(0, Some(obj5));

    let epoch = thread.perform_full_gc();
    assert_eq!(epoch, 1);
    assert_eq!(
        alive(&runtime),
        [obj1, obj2, obj3, obj4].into_iter().collect::<HashSet<_>>()
    );
    assert_eq!(runtime.store_size_unsafe(), 4);

    // Survivors are left unmarked.
    for object in [obj1, obj2, obj3, obj4] {
        assert!(!object.is_marked());
    }

    // Nothing changed, so a second run collects nothing.
    assert_eq!(thread.perform_full_gc(), 2);
    assert_eq!(runtime.store_size_unsafe(), 4);

    GLOBAL.set(None);
    thread.pop_root();
    thread.perform_full_gc();
    assert_eq!(runtime.store_size_unsafe(), 0);
    assert_eq!(runtime.epochs().finished, 3);
}

#[test]
fn arrays_are_traced() {
    let runtime = runtime();
    let mut thread = runtime.attach_thread();

    let array = thread.allocate_array(&ARRAY, 8);
    thread.push_root(Some(array));
    for index in (0..8).step_by(2) {
        let element = thread.allocate(&TAGGED);
        element.set_scalar(1, index);
        array.set_element(index, Some(element));
    }
    let bytes = thread.allocate_array(&BYTES, 100);
    array.set_element(1, Some(bytes));
    thread.allocate_array(&BYTES, 100);

    thread.perform_full_gc();
    assert_eq!(runtime.store_size_unsafe(), 6);
    for index in (0..8).step_by(2) {
        assert_eq!(array.element(index).map(|element| element.scalar(1)), Some(index));
    }
    assert_eq!(array.element(1), Some(bytes));
    assert_eq!(array.element(3), None);
}

#[test]
fn weak_reference_nulled() {
    let runtime = runtime();
    let finalized = Arc::new(Mutex::new(Vec::new()));
    {
        let finalized = finalized.clone();
        assert!(runtime.set_finalizer_hook(move |object| {
            finalized.lock().push(object.type_info().name);
        }));
    }
    assert!(!runtime.set_finalizer_hook(|_| {}));

    let mut thread = runtime.attach_thread();

    let kept = thread.allocate(&NODE);
    thread.push_root(Some(kept));
    let kept_weak = thread.weak_reference(kept);

    let object = thread.allocate(&NODE);
    let weak = thread.weak_reference(object);
    let weak_root = thread.push_root(Some(weak.as_object()));
    assert_eq!(weak.get(), Some(object));

    let epoch = thread.perform_full_gc();
    assert_eq!(weak.get(), None);
    assert_eq!(kept_weak.get(), Some(kept));
    assert_eq!(runtime.extras.len(), 1);
    thread.wait_finalizers(epoch);
    assert!(finalized.lock().is_empty());

    // Once the box itself is unreachable its own finalizer runs.
    thread.set_root(weak_root, None);
    let epoch = thread.perform_full_gc();
    thread.wait_finalizers(epoch);
    assert_eq!(*finalized.lock(), vec!["WeakReference"]);
    assert_eq!(kept_weak.get(), Some(kept));
}

#[test]
fn weak_box_dies_with_its_referent() {
    let runtime = runtime();
    let count = Arc::new(AtomicUsize::new(0));
    {
        let count = count.clone();
        runtime.set_finalizer_hook(move |object| {
            assert_eq!(object.type_info().name, "WeakReference");
            count.fetch_add(1, Ordering::SeqCst);
        });
    }

    let mut thread = runtime.attach_thread();
    for _ in 0..10 {
        let object = thread.allocate(&NODE);
        thread.weak_reference(object);
    }
    assert_eq!(runtime.extras.len(), 10);

    let epoch = thread.perform_full_gc();
    thread.wait_finalizers(epoch);
    assert_eq!(count.load(Ordering::SeqCst), 10);
    assert!(runtime.extras.is_empty());
    assert_eq!(runtime.store_size_unsafe(), 0);
}

static FINALIZED_ONCE: AtomicUsize = AtomicUsize::new(0);
static FINALIZED_ONCE_TYPE: TypeInfo =
    TypeInfo::object("FinalizedOnce", 1, &[]).with_finalizer(count_finalized_once);

fn count_finalized_once(_: ObjectRef) {
    FINALIZED_ONCE.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn finalizer_runs_once() {
    let runtime = runtime();
    let mut thread = runtime.attach_thread();

    let array = thread.allocate_array(&ARRAY, 50);
    thread.push_root(Some(array));
    for index in 0..100 {
        let object = thread.allocate(&FINALIZED_ONCE_TYPE);
        if index % 2 == 0 {
            array.set_element(index / 2, Some(object));
        }
    }

    let epoch = thread.perform_full_gc();
    thread.wait_finalizers(epoch);
    assert_eq!(FINALIZED_ONCE.load(Ordering::SeqCst), 50);
    assert!(runtime.is_finalizer_thread_running());

    let epoch = thread.perform_full_gc();
    thread.wait_finalizers(epoch);
    assert_eq!(FINALIZED_ONCE.load(Ordering::SeqCst), 50);

    thread.pop_root();
    let epoch = thread.perform_full_gc();
    thread.wait_finalizers(epoch);
    assert_eq!(FINALIZED_ONCE.load(Ordering::SeqCst), 100);
    assert_eq!(runtime.store_size_unsafe(), 0);

    runtime.stop_finalizer_thread_if_running();
    assert!(!runtime.is_finalizer_thread_running());
}

#[test]
fn empty_epochs_are_finalized_without_a_thread() {
    let runtime = runtime();
    let mut thread = runtime.attach_thread();
    thread.allocate(&NODE);

    let epoch = thread.perform_full_gc();
    thread.wait_finalizers(epoch);
    assert!(!runtime.is_finalizer_thread_running());
    assert_eq!(runtime.epochs().finalized, epoch);

    runtime.start_finalizer_thread_if_needed();
    assert!(runtime.is_finalizer_thread_running());
    let epoch = thread.perform_full_gc();
    thread.wait_finalizers(epoch);
    assert_eq!(runtime.epochs().finalized, epoch);
}

#[test]
fn permanent_objects_are_immune() {
    let runtime = runtime();
    let mut thread = runtime.attach_thread();

    let permanent = thread.allocate_permanent(&NODE, 0);
    let other = thread.allocate_permanent(&NODE, 0);
    permanent.set_field(0, Some(other));
    assert!(permanent.is_permanent());
    let weak = thread.weak_reference(permanent);
    assert!(weak.as_object().is_permanent());

    thread.perform_full_gc();
    thread.perform_full_gc();

    assert_eq!(runtime.store_size_unsafe(), 0);
    let permanents = runtime.permanent_objects();
    assert!(permanents.contains(&permanent));
    assert!(permanents.contains(&other));
    assert!(!permanent.is_marked());
    assert!(!other.is_marked());
    assert_eq!(permanent.field(0), Some(other));
    assert_eq!(weak.get(), Some(permanent));
}

#[test]
fn external_references() {
    let runtime = runtime();
    let mut thread = runtime.attach_thread();

    let object = thread.allocate(&NODE);
    let external = thread.create_external_ref(object);
    let unrooted = runtime.create_external_ref(thread.allocate(&NODE), 0);

    thread.perform_full_gc();
    assert_eq!(alive(&runtime), [object].into_iter().collect::<HashSet<_>>());
    assert_eq!(external.get(), Some(object));
    assert_eq!(unrooted.get(), None);

    external.retain();
    external.release();
    thread.perform_full_gc();
    assert_eq!(external.get(), Some(object));

    external.release();
    assert_eq!(external.count(), 0);
    thread.perform_full_gc();
    assert_eq!(external.get(), None);
    assert_eq!(runtime.store_size_unsafe(), 0);

    drop(external);
    unrooted.dispose();
    thread.perform_full_gc();
    assert!(runtime.external_refs().is_empty());
}

#[test]
fn external_reference_from_foreign_thread() {
    let runtime = runtime();
    let mut thread = runtime.attach_thread();

    let object = thread.allocate(&TAGGED);
    object.set_scalar(1, 42);
    let external = thread.create_external_ref(object);

    // Host code drops the last count on a thread the collector knows nothing about.
    let handle = std::thread::spawn(move || {
        assert_eq!(external.get().map(|object| object.scalar(1)), Some(42));
        external
    });
    let external = handle.join().unwrap();

    thread.perform_full_gc();
    assert_eq!(external.get(), Some(object));
    assert_eq!(object.scalar(1), 42);

    std::thread::spawn(move || external.release()).join().unwrap();
    thread.perform_full_gc();
    assert_eq!(runtime.store_size_unsafe(), 0);
}

#[test]
fn out_of_memory_collects_and_retries() {
    init_logger();
    let runtime = Runtime::new(GcConfig {
        max_heap_size: Some(64 * 1024),
        ..manual_config()
    });
    let mut thread = runtime.attach_thread();

    let kept = thread.allocate(&TAGGED);
    kept.set_scalar(1, 7);
    thread.push_root(Some(kept));

    for _ in 0..10_000 {
        thread.allocate(&NODE);
    }

    assert!(runtime.epochs().finished >= 1);
    assert!(runtime.heap_bytes() <= 64 * 1024);
    assert_eq!(kept.scalar(1), 7);
}

/// Selects the scenario [`aborting_scenario`] runs in a child process.
const ABORT_SCENARIO: &str = "STWGC_ABORT_SCENARIO";

/// Re-runs this test binary restricted to [`aborting_scenario`], checks that the child aborted and
/// returns its stderr.
fn run_aborting(scenario: &str) -> String {
    let output = Command::new(std::env::current_exe().unwrap())
        .args(["tests::aborting_scenario", "--exact", "--nocapture", "--test-threads=1"])
        .env(ABORT_SCENARIO, scenario)
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    assert!(!output.status.success(), "scenario {} exited normally: {}", scenario, stderr);
    stderr
}

#[test]
fn aborting_scenario() {
    let scenario = match std::env::var(ABORT_SCENARIO) {
        Ok(scenario) => scenario,
        Err(_) => return,
    };
    let runtime = Runtime::new(GcConfig {
        max_heap_size: Some(64 * 1024),
        ..manual_config()
    });
    let mut thread = runtime.attach_thread();

    match scenario.as_str() {
        "exhausted" => {
            for _ in 0..100_000 {
                let node = thread.allocate(&NODE);
                thread.push_root(Some(node));
            }
        }
        "huge-array" => {
            thread.allocate_array(&ARRAY, 1 << 61);
        }
        "huge-scalar-array" => {
            thread.allocate_array(&BYTES, usize::MAX);
        }
        _ => unreachable!("unknown scenario {}", scenario),
    }
}

#[test]
fn out_of_memory_after_collection_aborts() {
    let stderr = run_aborting("exhausted");
    assert!(stderr.contains("out of memory"), "{}", stderr);
    assert!(stderr.contains("after a full collection"), "{}", stderr);
}

#[test]
fn oversized_arrays_abort() {
    for scenario in ["huge-array", "huge-scalar-array"] {
        let stderr = run_aborting(scenario);
        assert!(stderr.contains("is too large"), "{}", stderr);
    }
}

#[test]
fn native_threads_do_not_block_collection() {
    let runtime = runtime();
    let barrier = Arc::new(Barrier::new(2));

    let native = {
        let runtime = runtime.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
            let mut thread = runtime.attach_thread();
            let object = thread.allocate(&TAGGED);
            object.set_scalar(1, 1);
            thread.push_root(Some(object));
            thread.allocate(&TAGGED);

            {
                let _native = thread.enter_native();
                barrier.wait();
                barrier.wait();
            }

            assert!(!object.is_marked());
            assert_eq!(object.scalar(1), 1);
            thread.safepoint();
        })
    };

    let mut thread = runtime.attach_thread();
    wait_native(&mut thread, &barrier);
    thread.perform_full_gc();
    assert_eq!(runtime.store_size_unsafe(), 1);
    wait_native(&mut thread, &barrier);

    native.join().unwrap();
}

/// Barrier wait that does not hold up collections.
fn wait_native(thread: &mut Mutator, barrier: &Barrier) {
    let _native = thread.enter_native();
    barrier.wait();
}

#[test]
fn concurrent_mutators() {
    const SLOTS: usize = 16;
    const ITERATIONS: usize = 500;

    init_logger();
    let runtime = Runtime::new(GcConfig {
        auto_tune: true,
        allocation_threshold_bytes: 4 * 1024,
        target_heap_bytes: 64 * 1024,
        min_heap_bytes: 64 * 1024,
        ..GcConfig::default()
    });

    let threads = num_cpus::get().clamp(2, 8);
    let barrier = Arc::new(Barrier::new(threads));
    let handles = (0..threads)
        .map(|id| {
            let runtime = runtime.clone();
            let barrier = barrier.clone();
            std::thread::Builder::new()
                .name(format!("mutator-{}", id))
                .spawn(move || {
                    barrier.wait();
                    let mut rng = rand::thread_rng();
                    let mut thread = runtime.attach_thread();

                    let slots = thread.allocate_array(&ARRAY, SLOTS);
                    thread.push_root(Some(slots));
                    let mut expected = vec![None; SLOTS];

                    for iteration in 0..ITERATIONS {
                        // Garbage chain.
                        let mut previous = None;
                        for _ in 0..rng.gen_range(1..10) {
                            let node = thread.allocate(&NODE);
                            node.set_field(0, previous);
                            previous = Some(node);
                        }

                        let tag = id * ITERATIONS + iteration;
                        let index = rng.gen_range(0..SLOTS);
                        let object = thread.allocate(&TAGGED);
                        object.set_scalar(1, tag);
                        slots.set_element(index, Some(object));
                        expected[index] = Some(tag);

                        if rng.gen_ratio(1, 50) {
                            thread.perform_full_gc();
                        }
                        thread.safepoint();
                    }

                    let actual = (0..SLOTS)
                        .map(|index| slots.element(index).map(|object| object.scalar(1)))
                        .collect::<Vec<_>>();
                    assert_eq!(actual, expected);
                })
                .unwrap()
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.join().unwrap();
    }

    let epochs = runtime.epochs();
    assert!(epochs.finished > 0);
    assert!(epochs.scheduled >= epochs.finished);
    assert_eq!(runtime.thread_count(), 0);
}

#[test]
fn threads_attach_during_collections() {
    init_logger();
    let runtime = runtime();
    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let attachers = (0..4)
        .map(|_| {
            let runtime = runtime.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut attached = 0;
                while !done.load(Ordering::Relaxed) || attached == 0 {
                    let mut thread = runtime.attach_thread();
                    let object = thread.allocate(&NODE);
                    thread.push_root(Some(object));
                    thread.safepoint();
                    assert!(!object.is_marked());
                    attached += 1;
                }
                attached
            })
        })
        .collect::<Vec<_>>();

    let mut thread = runtime.attach_thread();
    let kept = thread.allocate(&TAGGED);
    kept.set_scalar(1, 99);
    thread.push_root(Some(kept));
    for _ in 0..50 {
        thread.perform_full_gc();
    }
    done.store(true, Ordering::Relaxed);

    for attacher in attachers {
        assert!(attacher.join().unwrap() > 0);
    }
    assert_eq!(kept.scalar(1), 99);
    assert!(runtime.epochs().finished >= 50);
}
