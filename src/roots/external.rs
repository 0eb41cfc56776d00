//! Lock-free registry of references held outside the managed heap.
//!
//! Every node sits on the "all" list from creation until it is disposed and unlinked. A node
//! whose count is positive is additionally linked into the roots list between the `head` and
//! `tail` sentinels. Insertion into the roots list only ever happens at the head; removal is
//! lazy and done by the (single) walker, which unlinks nodes whose count dropped to zero or
//! below as it passes them. A node moves one way only: live, disposed, unlinked from roots,
//! erased from the all list. That ordering is what lets the sweep free nodes without hazard
//! pointers.

use std::{
    fmt,
    ptr::{self, NonNull},
    sync::{
        atomic::{fence, AtomicI32, AtomicPtr, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, MutexGuard};

use crate::memory::{ObjectHeader, ObjectRef};

/// Count stored in a node once its owner gave it up for good.
pub const DISPOSED: i32 = i32::MIN;

pub struct ExternalNode {
    object: AtomicPtr<ObjectHeader>,
    rc: AtomicI32,
    next_root: AtomicPtr<ExternalNode>,
    next: AtomicPtr<ExternalNode>,
}

impl ExternalNode {
    fn new(object: *mut ObjectHeader, rc: i32) -> Self {
        Self {
            object: AtomicPtr::new(object),
            rc: AtomicI32::new(rc),
            next_root: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn object(&self) -> Option<ObjectRef> {
        unsafe { ObjectRef::from_raw(self.object.load(Ordering::Acquire)) }
    }

    pub fn rc(&self) -> i32 {
        self.rc.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.rc() == DISPOSED
    }

    /// Whether the node is currently linked into the roots list.
    pub fn is_in_roots(&self) -> bool {
        !self.next_root.load(Ordering::Acquire).is_null()
    }

    fn as_ptr(&self) -> *mut ExternalNode {
        self as *const ExternalNode as *mut ExternalNode
    }
}

pub struct ExternalRegistry {
    head: NonNull<ExternalNode>,
    tail: NonNull<ExternalNode>,
    all: AtomicPtr<ExternalNode>,
    walker: Mutex<()>,
}

unsafe impl Send for ExternalRegistry {}
unsafe impl Sync for ExternalRegistry {}

impl ExternalRegistry {
    pub fn new() -> Self {
        let tail = Box::into_raw(Box::new(ExternalNode::new(ptr::null_mut(), 0)));
        let head = Box::new(ExternalNode::new(ptr::null_mut(), 0));
        head.next_root.store(tail, Ordering::Relaxed);

        unsafe {
            Self {
                head: NonNull::new_unchecked(Box::into_raw(head)),
                tail: NonNull::new_unchecked(tail),
                all: AtomicPtr::new(ptr::null_mut()),
                walker: Mutex::new(()),
            }
        }
    }

    fn head(&self) -> &ExternalNode {
        unsafe { self.head.as_ref() }
    }

    fn tail(&self) -> *mut ExternalNode {
        self.tail.as_ptr()
    }

    /// Creates a node for `object` with the given initial count. Callable from any thread.
    pub fn create_node(&self, object: ObjectRef, rc: i32) -> NonNull<ExternalNode> {
        crate::gc_assert!(rc >= 0, "initial count {} is negative", rc);
        let node = Box::into_raw(Box::new(ExternalNode::new(object.as_ptr(), rc)));

        let mut first = self.all.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next.store(first, Ordering::Relaxed) };
            match self
                .all
                .compare_exchange_weak(first, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => first = actual,
            }
        }

        let node = unsafe { &*node };
        if rc > 0 {
            self.insert_into_roots_head(node);
        }
        unsafe { NonNull::new_unchecked(node.as_ptr()) }
    }

    /// Handle owning a fresh node with the given count.
    pub fn create(self: &Arc<Self>, object: ObjectRef, rc: i32) -> ExternalRef {
        ExternalRef {
            node: self.create_node(object, rc),
            registry: self.clone(),
        }
    }

    pub fn retain(&self, node: &ExternalNode) {
        let rc = node.rc.fetch_add(1, Ordering::SeqCst);
        crate::gc_assert!(rc >= 0, "retaining external reference with count {}", rc);
        if rc == 0 {
            self.insert_into_roots_head(node);
        }
    }

    /// Drops one count. The node leaves the roots list lazily, on the next walk.
    pub fn release(&self, node: &ExternalNode) {
        let rc = node.rc.fetch_sub(1, Ordering::SeqCst);
        crate::gc_assert!(rc > 0, "releasing external reference with count {}", rc);
    }

    pub fn dispose(&self, node: &ExternalNode) {
        let rc = node.rc.swap(DISPOSED, Ordering::SeqCst);
        crate::gc_assert!(rc >= 0, "external reference disposed twice");
    }

    /// Links `node` right after the head. A no-op if the node is already linked or another
    /// thread is linking it.
    fn insert_into_roots_head(&self, node: &ExternalNode) {
        let head = self.head();
        let mut next = head.next_root.load(Ordering::SeqCst);
        let mut node_next = ptr::null_mut();
        loop {
            if node
                .next_root
                .compare_exchange(node_next, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            node_next = next;

            match head.next_root.compare_exchange_weak(
                next,
                node.as_ptr(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => next = actual,
            }
        }
    }

    /// Unlinks `node`, whose predecessor was `prev` when it was read. Returns the predecessor that
    /// was actually used. Walker only.
    unsafe fn erase_from_roots(
        &self,
        mut prev: *mut ExternalNode,
        node: *mut ExternalNode,
    ) -> *mut ExternalNode {
        let next = (*node).next_root.load(Ordering::SeqCst);
        crate::gc_assert!(!next.is_null(), "erasing a node that is not in the roots list");

        loop {
            match (*prev).next_root.compare_exchange(
                node,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    (*node).next_root.store(ptr::null_mut(), Ordering::SeqCst);
                    return prev;
                }
                Err(_) => {
                    // Only the head is ever written by other threads: something was inserted
                    // in front of `node`.
                    crate::gc_assert!(
                        prev == self.head.as_ptr(),
                        "roots list changed behind the walker"
                    );
                    prev = self.find_root_predecessor(node);
                }
            }
        }
    }

    unsafe fn find_root_predecessor(&self, node: *mut ExternalNode) -> *mut ExternalNode {
        let mut prev = self.head.as_ptr();
        loop {
            let next = (*prev).next_root.load(Ordering::SeqCst);
            if next == node {
                return prev;
            }
            crate::gc_assert!(
                !next.is_null() && next != self.tail(),
                "node vanished from the roots list"
            );
            prev = next;
        }
    }

    /// Next node after `current` with a positive count, or the tail. Nodes with a count of zero
    /// or below are unlinked on the way; if a count went back up while unlinking, the node is
    /// reinserted at the head. Walker only.
    unsafe fn next_root(&self, mut current: *mut ExternalNode) -> *mut ExternalNode {
        loop {
            let candidate = (*current).next_root.load(Ordering::SeqCst);
            crate::gc_assert!(!candidate.is_null(), "roots list is broken");
            if candidate == self.tail() {
                return candidate;
            }

            if (*candidate).rc.load(Ordering::SeqCst) > 0 {
                fence(Ordering::Acquire);
                return candidate;
            }

            current = self.erase_from_roots(current, candidate);
            if (*candidate).rc.load(Ordering::SeqCst) > 0 {
                self.insert_into_roots_head(&*candidate);
            }
        }
    }

    /// Walks the live roots. Holds the walker lock until the iterator is dropped.
    pub fn roots(&self) -> RootsIter<'_> {
        RootsIter {
            _walker: self.walker.lock(),
            registry: self,
            current: self.head.as_ptr(),
        }
    }

    /// Walks the all list, freeing disposed nodes that already left the roots list.
    pub fn lock_for_iter(&self) -> AllIter<'_> {
        AllIter {
            _walker: self.walker.lock(),
            registry: self,
            prev: ptr::null_mut(),
            current: self.all.load(Ordering::Acquire),
        }
    }

    /// Clears the referent of every non-root node whose object is not marked, and frees dead
    /// nodes. Runs with the world stopped, after marking.
    pub fn sweep(&self) -> usize {
        let mut cleared = 0;
        let mut iter = self.lock_for_iter();
        while let Some(node) = iter.next_alive() {
            if node.rc.load(Ordering::Acquire) > 0 {
                continue;
            }
            if let Some(object) = node.object() {
                if !object.is_marked() && !object.is_permanent() {
                    node.object.store(ptr::null_mut(), Ordering::Release);
                    cleared += 1;
                }
            }
        }
        cleared
    }

    /// Nodes on the all list, disposed or not.
    pub fn len(&self) -> usize {
        let _walker = self.walker.lock();
        let mut count = 0;
        let mut node = self.all.load(Ordering::Acquire);
        while !node.is_null() {
            count += 1;
            node = unsafe { (*node).next.load(Ordering::Acquire) };
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.all.load(Ordering::Acquire).is_null()
    }
}

impl Default for ExternalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExternalRegistry {
    fn drop(&mut self) {
        let mut node = *self.all.get_mut();
        while !node.is_null() {
            unsafe {
                let next = (*node).next.load(Ordering::Relaxed);
                drop(Box::from_raw(node));
                node = next;
            }
        }
        unsafe {
            drop(Box::from_raw(self.head.as_ptr()));
            drop(Box::from_raw(self.tail.as_ptr()));
        }
    }
}

pub struct RootsIter<'a> {
    _walker: MutexGuard<'a, ()>,
    registry: &'a ExternalRegistry,
    current: *mut ExternalNode,
}

impl<'a> Iterator for RootsIter<'a> {
    type Item = &'a ExternalNode;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == self.registry.tail() {
            return None;
        }
        let node = unsafe { self.registry.next_root(self.current) };
        self.current = node;
        if node == self.registry.tail() {
            None
        } else {
            Some(unsafe { &*node })
        }
    }
}

pub struct AllIter<'a> {
    _walker: MutexGuard<'a, ()>,
    registry: &'a ExternalRegistry,
    prev: *mut ExternalNode,
    current: *mut ExternalNode,
}

impl<'a> AllIter<'a> {
    /// Next node that is not dead, freeing the dead ones it steps over.
    pub fn next_alive(&mut self) -> Option<&'a ExternalNode> {
        unsafe {
            while !self.current.is_null() {
                let node = self.current;
                let next = (*node).next.load(Ordering::Acquire);

                let dead = (*node).rc.load(Ordering::Acquire) == DISPOSED
                    && (*node).next_root.load(Ordering::Acquire).is_null();
                if !dead {
                    self.prev = node;
                    self.current = next;
                    return Some(&*node);
                }

                self.erase_from_all(node, next);
                self.current = next;
                drop(Box::from_raw(node));
            }
        }
        None
    }

    unsafe fn erase_from_all(&mut self, node: *mut ExternalNode, next: *mut ExternalNode) {
        if self.prev.is_null() {
            match self.registry.all.compare_exchange(
                node,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                // New nodes were pushed in front of `node`.
                Err(first) => {
                    let mut prev = first;
                    while (*prev).next.load(Ordering::Acquire) != node {
                        prev = (*prev).next.load(Ordering::Acquire);
                        crate::gc_assert!(!prev.is_null(), "node vanished from the all list");
                    }
                    self.prev = prev;
                }
            }
        }
        (*self.prev).next.store(next, Ordering::Release);
    }
}

/// Owning handle to an external reference.
///
/// A handle with a positive count keeps its object alive. With a count of zero the object is
/// only weakly referenced: a collection that finds it otherwise unreachable clears the handle.
/// Raising the count from zero must only happen while the object is known to be alive, e.g.
/// from a runnable mutator that reads it through [`get`](Self::get).
pub struct ExternalRef {
    node: NonNull<ExternalNode>,
    registry: Arc<ExternalRegistry>,
}

unsafe impl Send for ExternalRef {}
unsafe impl Sync for ExternalRef {}

impl ExternalRef {
    fn node(&self) -> &ExternalNode {
        unsafe { self.node.as_ref() }
    }

    pub fn get(&self) -> Option<ObjectRef> {
        self.node().object()
    }

    pub fn count(&self) -> i32 {
        self.node().rc()
    }

    pub fn retain(&self) {
        self.registry.retain(self.node());
    }

    pub fn release(&self) {
        self.registry.release(self.node());
    }

    /// Gives the reference up. Equivalent to dropping the handle.
    pub fn dispose(self) {}
}

impl Drop for ExternalRef {
    fn drop(&mut self) {
        self.registry.dispose(self.node());
    }
}

impl fmt::Debug for ExternalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalRef")
            .field("rc", &self.count())
            .field("object", &self.get())
            .finish()
    }
}
