use std::{
    fmt,
    mem::size_of,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use super::extra::ExtraObjectData;

pub const WORD: usize = size_of::<usize>();

pub const MARKED: usize = 1;
pub const PERMANENT: usize = 1 << 1;

/// Shape of an object's payload. Every payload slot is one machine word.
#[derive(Clone, Copy, Debug)]
pub enum TypeKind {
    /// Fixed number of slots; `refs` lists the slots holding references.
    Object {
        slots: usize,
        refs: &'static [usize],
    },
    /// Array whose every element is a reference.
    RefArray,
    /// Array of plain data, `element_size` bytes per element.
    ScalarArray { element_size: usize },
}

/// Static type descriptor attached to every object header.
#[derive(Clone, Copy)]
pub struct TypeInfo {
    pub name: &'static str,
    pub kind: TypeKind,
    pub finalize: Option<fn(ObjectRef)>,
}

impl TypeInfo {
    pub const fn object(name: &'static str, slots: usize, refs: &'static [usize]) -> Self {
        Self {
            name,
            kind: TypeKind::Object { slots, refs },
            finalize: None,
        }
    }

    pub const fn ref_array(name: &'static str) -> Self {
        Self {
            name,
            kind: TypeKind::RefArray,
            finalize: None,
        }
    }

    pub const fn scalar_array(name: &'static str, element_size: usize) -> Self {
        Self {
            name,
            kind: TypeKind::ScalarArray { element_size },
            finalize: None,
        }
    }

    pub const fn with_finalizer(self, finalize: fn(ObjectRef)) -> Self {
        Self {
            name: self.name,
            kind: self.kind,
            finalize: Some(finalize),
        }
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalize.is_some()
    }

    pub fn is_array(&self) -> bool {
        !matches!(self.kind, TypeKind::Object { .. })
    }

    /// Number of payload words for an instance, `None` if the payload size overflows `usize`.
    /// `count` is ignored for non-array types.
    pub fn payload_words(&self, count: usize) -> Option<usize> {
        let words = match self.kind {
            TypeKind::Object { slots, .. } => slots,
            TypeKind::RefArray => count,
            TypeKind::ScalarArray { element_size } => {
                count.checked_mul(element_size)?.checked_add(WORD - 1)? / WORD
            }
        };
        words.checked_mul(WORD).map(|_| words)
    }

    pub fn payload_size(&self, count: usize) -> Option<usize> {
        self.payload_words(count)?.checked_mul(WORD)
    }

    fn is_reference_slot(&self, index: usize) -> bool {
        match self.kind {
            TypeKind::Object { refs, .. } => refs.contains(&index),
            TypeKind::RefArray => true,
            TypeKind::ScalarArray { .. } => false,
        }
    }
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("finalizer", &self.finalize.is_some())
            .finish()
    }
}

/// Header in front of every object payload.
///
/// `flags` is only written by the collector while the world is stopped, and once at allocation.
#[repr(C)]
pub struct ObjectHeader {
    type_info: &'static TypeInfo,
    pub(crate) extra: AtomicPtr<ExtraObjectData>,
    count: usize,
    flags: AtomicUsize,
}

impl ObjectHeader {
    pub(crate) fn new(type_info: &'static TypeInfo, count: usize, flags: usize) -> Self {
        Self {
            type_info,
            extra: AtomicPtr::new(ptr::null_mut()),
            count,
            flags: AtomicUsize::new(flags),
        }
    }

    pub fn type_info(&self) -> &'static TypeInfo {
        self.type_info
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_marked(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & MARKED != 0
    }

    pub fn is_permanent(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & PERMANENT != 0
    }

    /// Sets the mark bit, returning `true` if this call was the one that set it.
    pub(crate) fn try_mark(&self) -> bool {
        self.flags.fetch_or(MARKED, Ordering::Relaxed) & MARKED == 0
    }

    /// Clears the mark bit, returning whether it was set.
    pub(crate) fn unmark(&self) -> bool {
        self.flags.fetch_and(!MARKED, Ordering::Relaxed) & MARKED != 0
    }

    pub(crate) fn extra(&self) -> Option<&ExtraObjectData> {
        unsafe { self.extra.load(Ordering::Acquire).as_ref() }
    }
}

/// Handle to a managed object.
///
/// A handle stays valid for as long as the object is reachable from a root. Using a handle to an
/// object that a collection already reclaimed is undefined behaviour, same as any dangling pointer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectRef(NonNull<ObjectHeader>);

unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    pub(crate) unsafe fn from_header(header: NonNull<ObjectHeader>) -> Self {
        Self(header)
    }

    /// # Safety
    ///
    /// `ptr` must be null or point to the header of a live object.
    pub unsafe fn from_raw(ptr: *mut ObjectHeader) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut ObjectHeader {
        self.0.as_ptr()
    }

    pub(crate) fn header(&self) -> &ObjectHeader {
        unsafe { self.0.as_ref() }
    }

    pub fn type_info(self) -> &'static TypeInfo {
        self.header().type_info()
    }

    /// Element count for arrays, slot count for plain objects.
    pub fn len(self) -> usize {
        match self.type_info().kind {
            TypeKind::Object { slots, .. } => slots,
            _ => self.header().count(),
        }
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    pub fn is_marked(self) -> bool {
        self.header().is_marked()
    }

    pub fn is_permanent(self) -> bool {
        self.header().is_permanent()
    }

    fn words(&self) -> usize {
        // Allocation rejects counts whose payload size overflows.
        self.type_info().payload_words(self.header().count()).unwrap_or(0)
    }

    fn slot(&self, index: usize) -> &AtomicUsize {
        let words = self.words();
        assert!(
            index < words,
            "slot {} out of bounds for {} with {} slots",
            index,
            self.type_info().name,
            words
        );
        unsafe {
            let payload = (self.0.as_ptr() as *mut u8).add(size_of::<ObjectHeader>());
            &*(payload as *const AtomicUsize).add(index)
        }
    }

    fn reference_slot(&self, index: usize) -> &AtomicUsize {
        assert!(
            self.type_info().is_reference_slot(index),
            "slot {} of {} is not a reference slot",
            index,
            self.type_info().name
        );
        self.slot(index)
    }

    fn scalar_slot(&self, index: usize) -> &AtomicUsize {
        assert!(
            !self.type_info().is_reference_slot(index),
            "slot {} of {} holds a reference",
            index,
            self.type_info().name
        );
        self.slot(index)
    }

    pub fn field(self, index: usize) -> Option<ObjectRef> {
        let raw = self.reference_slot(index).load(Ordering::Acquire);
        unsafe { Self::from_raw(raw as *mut ObjectHeader) }
    }

    pub fn set_field(self, index: usize, value: Option<ObjectRef>) {
        let raw = value.map_or(0, |obj| obj.as_ptr() as usize);
        self.reference_slot(index).store(raw, Ordering::Release);
    }

    pub fn element(self, index: usize) -> Option<ObjectRef> {
        assert!(
            matches!(self.type_info().kind, TypeKind::RefArray),
            "{} is not a reference array",
            self.type_info().name
        );
        self.field(index)
    }

    pub fn set_element(self, index: usize, value: Option<ObjectRef>) {
        assert!(
            matches!(self.type_info().kind, TypeKind::RefArray),
            "{} is not a reference array",
            self.type_info().name
        );
        self.set_field(index, value)
    }

    /// Plain word stored in a non-reference slot (or word of a scalar array payload).
    pub fn scalar(self, index: usize) -> usize {
        self.scalar_slot(index).load(Ordering::Relaxed)
    }

    pub fn set_scalar(self, index: usize, value: usize) {
        self.scalar_slot(index).store(value, Ordering::Relaxed);
    }

    pub(crate) fn raw_slot(self, index: usize) -> *mut ObjectHeader {
        self.slot(index).load(Ordering::Acquire) as *mut ObjectHeader
    }

    pub(crate) fn set_raw_slot(self, index: usize, value: *mut ObjectHeader) {
        self.slot(index).store(value as usize, Ordering::Release);
    }

    /// Calls `f` with every non-null strong reference held by this object.
    pub(crate) fn for_each_reference(self, mut f: impl FnMut(ObjectRef)) {
        let mut visit = |index: usize| {
            let raw = self.slot(index).load(Ordering::Acquire);
            if let Some(child) = unsafe { Self::from_raw(raw as *mut ObjectHeader) } {
                f(child);
            }
        };

        match self.type_info().kind {
            TypeKind::Object { refs, .. } => refs.iter().copied().for_each(&mut visit),
            TypeKind::RefArray => (0..self.header().count()).for_each(&mut visit),
            TypeKind::ScalarArray { .. } => {}
        }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:p}", self.type_info().name, self.0.as_ptr())
    }
}

impl fmt::Pointer for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.0, f)
    }
}
