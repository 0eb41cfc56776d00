use std::time::Instant;

use stwgc::{formatted_size, GcConfig, Mutator, ObjectRef, Runtime, TypeInfo};

static TREE_NODE: TypeInfo = TypeInfo::object("TreeNode", 2, &[0, 1]);

fn bottom_up_tree(thread: &mut Mutator, depth: usize) -> ObjectRef {
    thread.safepoint();
    let base = thread.roots_len();
    let node = thread.allocate(&TREE_NODE);
    thread.push_root(Some(node));

    if depth > 0 {
        let left = bottom_up_tree(thread, depth - 1);
        node.set_field(0, Some(left));
        let right = bottom_up_tree(thread, depth - 1);
        node.set_field(1, Some(right));
    }

    thread.truncate_roots(base);
    node
}

fn item_check(node: ObjectRef) -> usize {
    match (node.field(0), node.field(1)) {
        (Some(left), Some(right)) => 1 + item_check(left) + item_check(right),
        _ => 1,
    }
}

fn main() {
    env_logger::init();

    let max_depth = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse::<usize>().ok())
        .unwrap_or(16)
        .max(6);
    let min_depth = 4;

    let runtime = Runtime::new(GcConfig::from_env());
    let mut thread = runtime.attach_thread();
    let start = Instant::now();

    let stretch_depth = max_depth + 1;
    let stretch = bottom_up_tree(&mut thread, stretch_depth);
    println!(
        "stretch tree of depth {}\t check: {}",
        stretch_depth,
        item_check(stretch)
    );

    let long_lived = bottom_up_tree(&mut thread, max_depth);
    let long_lived_root = thread.push_root(Some(long_lived));

    for depth in (min_depth..=max_depth).step_by(2) {
        let iterations = 1 << (max_depth - depth + min_depth);
        let mut check = 0;
        for _ in 0..iterations {
            check += item_check(bottom_up_tree(&mut thread, depth));
        }
        println!(
            "{}\t trees of depth {}\t check: {}",
            iterations, depth, check
        );
    }

    let long_lived = thread.root(long_lived_root).map_or(0, item_check);
    println!(
        "long lived tree of depth {}\t check: {}",
        max_depth, long_lived
    );

    let epoch = thread.perform_full_gc();
    thread.wait_finalizers(epoch);
    println!(
        "{} collections, heap {}, {:.3}ms",
        epoch,
        formatted_size(runtime.heap_bytes()),
        start.elapsed().as_micros() as f64 / 1000.0
    );
}
