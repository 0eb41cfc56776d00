use std::{
    alloc::Layout,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Source of raw memory for object nodes.
pub trait RawAllocator: Send + Sync {
    /// Returns zeroed memory for `layout`, or `None` when exhausted.
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must come from `alloc` on this allocator with the same `layout`.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout);

    /// Bytes currently handed out.
    fn allocated_bytes(&self) -> usize;
}

/// `std::alloc` backed allocator with an optional cap on the bytes held at once.
pub struct SystemAllocator {
    limit: Option<usize>,
    allocated: AtomicUsize,
}

impl SystemAllocator {
    pub const fn new() -> Self {
        Self {
            limit: None,
            allocated: AtomicUsize::new(0),
        }
    }

    pub const fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            allocated: AtomicUsize::new(0),
        }
    }

    fn reserve(&self, size: usize) -> bool {
        match self.limit {
            None => {
                self.allocated.fetch_add(size, Ordering::Relaxed);
                true
            }
            Some(limit) => self
                .allocated
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |allocated| {
                    allocated.checked_add(size).filter(|total| *total <= limit)
                })
                .is_ok(),
        }
    }
}

impl Default for SystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RawAllocator for SystemAllocator {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        if !self.reserve(layout.size()) {
            return None;
        }

        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) });
        if ptr.is_none() {
            self.allocated.fetch_sub(layout.size(), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
        self.allocated.fetch_sub(layout.size(), Ordering::Relaxed);
    }

    fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}
