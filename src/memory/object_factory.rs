//! Object nodes, the per-thread allocation arena and the global object store.
//!
//! Every object lives in a [`Node`]. A fresh node is linked into the allocating thread's
//! [`ThreadArena`] without any synchronisation and later published into the shared
//! [`ObjectStore`] by splicing the whole list at once. A node is owned by exactly one list at any
//! time: an arena, the store or a [`FinalizerQueue`].

use std::{
    alloc::Layout,
    mem::{align_of, size_of},
    panic::AssertUnwindSafe,
    ptr::{self, NonNull},
    sync::Arc,
};

use memoffset::offset_of;

use super::{
    allocator::RawAllocator,
    object::{ObjectHeader, ObjectRef, TypeInfo, PERMANENT, WORD},
};
use crate::base::{formatted_size, SpinLock, SpinLockGuard};

/// Storage of one object. The header is the last field so the payload starts right after the node.
#[repr(C)]
pub struct Node {
    next: *mut Node,
    layout: Layout,
    header: ObjectHeader,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NodeRef(NonNull<Node>);

impl NodeRef {
    pub fn from_object(object: ObjectRef) -> Self {
        unsafe {
            let node = (object.as_ptr() as *mut u8).sub(offset_of!(Node, header)) as *mut Node;
            Self(NonNull::new_unchecked(node))
        }
    }

    pub fn object(self) -> ObjectRef {
        unsafe {
            let header = ptr::addr_of_mut!((*self.0.as_ptr()).header);
            ObjectRef::from_header(NonNull::new_unchecked(header))
        }
    }

    /// Total bytes of the node including its header.
    pub fn size(self) -> usize {
        unsafe { (*self.0.as_ptr()).layout.size() }
    }

    /// Start of the payload.
    pub fn data(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.0.as_ptr() as *mut u8).add(size_of::<Node>())) }
    }

    fn next(self) -> *mut Node {
        unsafe { (*self.0.as_ptr()).next }
    }
}

/// Singly linked list of nodes. `last` is null exactly when `root` is.
pub struct NodeList {
    root: *mut Node,
    last: *mut Node,
    len: usize,
}

unsafe impl Send for NodeList {}

impl NodeList {
    pub const fn new() -> Self {
        Self {
            root: ptr::null_mut(),
            last: ptr::null_mut(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }

    fn push(&mut self, node: NodeRef) {
        let node = node.0.as_ptr();
        unsafe {
            (*node).next = ptr::null_mut();
            if self.last.is_null() {
                self.root = node;
            } else {
                (*self.last).next = node;
            }
        }
        self.last = node;
        self.len += 1;
    }

    /// Moves every node of `other` to the end of this list in O(1).
    pub fn splice(&mut self, other: &mut NodeList) {
        if other.is_empty() {
            return;
        }

        if self.is_empty() {
            self.root = other.root;
        } else {
            unsafe {
                (*self.last).next = other.root;
            }
        }
        self.last = other.last;
        self.len += other.len;
        *other = NodeList::new();
    }

    pub fn pop(&mut self) -> Option<NodeRef> {
        let node = NonNull::new(self.root).map(NodeRef)?;
        self.root = node.next();
        if self.root.is_null() {
            self.last = ptr::null_mut();
        }
        self.len -= 1;
        unsafe {
            (*node.0.as_ptr()).next = ptr::null_mut();
        }
        Some(node)
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeRef> + '_ {
        let mut current = self.root;
        std::iter::from_fn(move || {
            let node = NonNull::new(current).map(NodeRef)?;
            current = node.next();
            Some(node)
        })
    }
}

impl Default for NodeList {
    fn default() -> Self {
        Self::new()
    }
}

fn node_layout(size: usize, align: usize) -> Layout {
    crate::gc_assert!(
        align.is_power_of_two() && align <= WORD,
        "unsupported payload alignment {}",
        align
    );
    match size
        .checked_add(size_of::<Node>())
        .and_then(|total| Layout::from_size_align(total, align_of::<Node>()).ok())
    {
        Some(layout) => layout,
        None => crate::gc_fatal!("object of {} bytes is too large", size),
    }
}

/// Payload size of an instance of `ty` with `count` elements. Aborts if it does not fit in memory.
pub fn payload_size(ty: &TypeInfo, count: usize) -> usize {
    match ty.payload_size(count) {
        Some(size) => size,
        None => crate::gc_fatal!(
            "out of memory: object of {} elements is too large for {}",
            count,
            ty.name
        ),
    }
}

/// Frees a node that is no longer linked anywhere.
unsafe fn free_node(allocator: &dyn RawAllocator, node: NodeRef) {
    let layout = (*node.0.as_ptr()).layout;
    ptr::drop_in_place(node.0.as_ptr());
    allocator.dealloc(node.0.cast(), layout);
}

/// Thread-private allocation arena. Nodes become visible to collections only once published.
pub struct ThreadArena {
    store: Arc<ObjectStore>,
    list: NodeList,
}

impl ThreadArena {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self {
            store,
            list: NodeList::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Allocates a zeroed node with `size` payload bytes. `None` when memory is exhausted.
    pub fn try_allocate_node(
        &mut self,
        size: usize,
        align: usize,
        init: impl FnOnce() -> ObjectHeader,
    ) -> Option<NodeRef> {
        let layout = node_layout(size, align);
        let memory = self.store.allocator.alloc(layout)?;
        let node = memory.cast::<Node>();
        unsafe {
            node.as_ptr().write(Node {
                next: ptr::null_mut(),
                layout,
                header: init(),
            });
        }
        let node = NodeRef(node);
        self.list.push(node);
        Some(node)
    }

    /// Like [`try_allocate_node`](Self::try_allocate_node), aborting the process on exhaustion.
    pub fn allocate_node(
        &mut self,
        size: usize,
        align: usize,
        init: impl FnOnce() -> ObjectHeader,
    ) -> NodeRef {
        match self.try_allocate_node(size, align, init) {
            Some(node) => node,
            None => crate::gc_fatal!(
                "out of memory: cannot allocate {} ({} held)",
                formatted_size(size + size_of::<Node>()),
                formatted_size(self.store.allocator.allocated_bytes())
            ),
        }
    }

    pub fn try_allocate(&mut self, ty: &'static TypeInfo, count: usize) -> Option<ObjectRef> {
        self.try_allocate_node(payload_size(ty, count), WORD, || {
            ObjectHeader::new(ty, count, 0)
        })
        .map(NodeRef::object)
    }

    pub fn allocate(&mut self, ty: &'static TypeInfo, count: usize) -> ObjectRef {
        self.allocate_node(payload_size(ty, count), WORD, || {
            ObjectHeader::new(ty, count, 0)
        })
        .object()
    }

    /// Hands every node of the arena over to the store. No-op when the arena is empty.
    pub fn publish(&mut self) {
        if self.list.is_empty() {
            return;
        }
        log::trace!(target: "gc-arena", "publishing {} objects", self.list.len());
        self.store.nodes.lock().splice(&mut self.list);
    }
}

impl Drop for ThreadArena {
    fn drop(&mut self) {
        self.publish();
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct SweepStats {
    pub alive: usize,
    pub alive_bytes: usize,
    pub swept: usize,
    pub swept_bytes: usize,
    pub finalizable: usize,
}

/// Every published node that a collection has not reclaimed yet.
pub struct ObjectStore {
    nodes: SpinLock<NodeList>,
    permanent: SpinLock<NodeList>,
    allocator: Arc<dyn RawAllocator>,
}

impl ObjectStore {
    pub fn new(allocator: Arc<dyn RawAllocator>) -> Self {
        Self {
            nodes: SpinLock::new(NodeList::new()),
            permanent: SpinLock::new(NodeList::new()),
            allocator,
        }
    }

    pub fn allocator(&self) -> &dyn RawAllocator {
        &*self.allocator
    }

    /// Locks the store for the whole traversal.
    pub fn lock_for_iter(&self) -> StoreIter<'_> {
        let nodes = self.nodes.lock();
        let current = nodes.root;
        StoreIter {
            allocator: &*self.allocator,
            nodes,
            prev: ptr::null_mut(),
            current,
        }
    }

    /// Number of published objects. Exact only while the world is stopped.
    pub fn size_unsafe(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Snapshot of the published objects. Exact only while the world is stopped.
    pub fn objects_unsafe(&self) -> Vec<ObjectRef> {
        self.nodes.lock().iter().map(NodeRef::object).collect()
    }

    /// Allocates an object that is never marked, traced or swept.
    pub fn allocate_permanent(&self, ty: &'static TypeInfo, count: usize) -> Option<ObjectRef> {
        let layout = node_layout(payload_size(ty, count), WORD);
        let node = self.allocator.alloc(layout)?.cast::<Node>();
        unsafe {
            node.as_ptr().write(Node {
                next: ptr::null_mut(),
                layout,
                header: ObjectHeader::new(ty, count, PERMANENT),
            });
        }
        let node = NodeRef(node);
        self.permanent.lock().push(node);
        Some(node.object())
    }

    pub fn permanent_objects(&self) -> Vec<ObjectRef> {
        self.permanent.lock().iter().map(NodeRef::object).collect()
    }

    /// Reclaims every unmarked node and clears the mark bit on survivors. Unmarked nodes whose
    /// type has a finalizer are moved to `finalizers` instead of being freed.
    pub fn sweep(&self, finalizers: &mut FinalizerQueue) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut iter = self.lock_for_iter();

        while let Some(node) = iter.current() {
            let object = node.object();
            if object.header().unmark() {
                stats.alive += 1;
                stats.alive_bytes += node.size();
                iter.advance();
            } else if object.type_info().has_finalizer() {
                stats.finalizable += 1;
                iter.move_and_advance(finalizers);
            } else {
                stats.swept += 1;
                stats.swept_bytes += node.size();
                iter.erase_and_advance();
            }
        }
        stats
    }

    fn free_list(&self, list: &mut NodeList) {
        while let Some(node) = list.pop() {
            unsafe { free_node(&*self.allocator, node) };
        }
    }
}

impl Drop for ObjectStore {
    fn drop(&mut self) {
        let mut nodes = std::mem::take(&mut *self.nodes.lock());
        let mut permanent = std::mem::take(&mut *self.permanent.lock());
        self.free_list(&mut nodes);
        self.free_list(&mut permanent);
    }
}

/// Cursor over the locked store.
pub struct StoreIter<'a> {
    allocator: &'a dyn RawAllocator,
    nodes: SpinLockGuard<'a, NodeList>,
    prev: *mut Node,
    current: *mut Node,
}

impl<'a> StoreIter<'a> {
    pub fn current(&self) -> Option<NodeRef> {
        NonNull::new(self.current).map(NodeRef)
    }

    pub fn advance(&mut self) {
        if let Some(node) = self.current() {
            self.prev = self.current;
            self.current = node.next();
        }
    }

    fn unlink_current(&mut self) -> Option<NodeRef> {
        let node = self.current()?;
        let next = node.next();
        unsafe {
            if self.prev.is_null() {
                self.nodes.root = next;
            } else {
                (*self.prev).next = next;
            }
            (*node.0.as_ptr()).next = ptr::null_mut();
        }
        if self.nodes.last == self.current {
            self.nodes.last = self.prev;
        }
        self.nodes.len -= 1;
        self.current = next;
        Some(node)
    }

    /// Unlinks and frees the current node, moving the cursor to its successor.
    pub fn erase_and_advance(&mut self) {
        if let Some(node) = self.unlink_current() {
            unsafe { free_node(self.allocator, node) };
        }
    }

    /// Unlinks the current node into `queue`, moving the cursor to its successor.
    pub fn move_and_advance(&mut self, queue: &mut FinalizerQueue) {
        if let Some(node) = self.unlink_current() {
            queue.list.push(node);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Unreachable objects waiting for their finalizers. Owns the nodes until [`finalize`] frees them.
///
/// [`finalize`]: FinalizerQueue::finalize
#[derive(Default)]
pub struct FinalizerQueue {
    list: NodeList,
}

impl FinalizerQueue {
    pub const fn new() -> Self {
        Self {
            list: NodeList::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn merge_with(&mut self, other: &mut FinalizerQueue) {
        self.list.splice(&mut other.list);
    }

    pub fn pop(&mut self) -> Option<ObjectRef> {
        self.list.pop().map(NodeRef::object)
    }

    pub fn objects(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.list.iter().map(NodeRef::object)
    }

    /// Runs every finalizer, then `hook`, then releases the object. A panicking finalizer is
    /// logged and the object is released anyway.
    pub fn finalize(
        mut self,
        store: &ObjectStore,
        hook: Option<&(dyn Fn(ObjectRef) + Send + Sync)>,
    ) -> usize {
        let mut count = 0;
        while let Some(node) = self.list.pop() {
            let object = node.object();
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                if let Some(finalize) = object.type_info().finalize {
                    finalize(object);
                }
                if let Some(hook) = hook {
                    hook(object);
                }
            }));
            if result.is_err() {
                log::error!(target: "gc-finalizer", "finalizer of {:?} panicked", object);
            }
            unsafe { free_node(store.allocator(), node) };
            count += 1;
        }
        count
    }
}

impl Drop for FinalizerQueue {
    fn drop(&mut self) {
        debug_assert!(
            self.list.is_empty() || std::thread::panicking(),
            "finalizer queue dropped with {} pending objects",
            self.list.len()
        );
    }
}
