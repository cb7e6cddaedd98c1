//! Memory allocators for managed objects.
use std::alloc::{handle_alloc_error, Layout};
use std::fmt::{Debug, Display, Formatter};
use std::ptr::NonNull;
use std::sync::Arc;

/// Debug information attached to an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationSite {
    /// Human readable description of the allocated object.
    pub description: &'static str,
    /// Source file requesting the allocation.
    pub file: &'static str,
    /// Line in `file` requesting the allocation.
    pub line: u32,
}

impl AllocationSite {
    /// Site used when the caller provided no information.
    pub const UNKNOWN: AllocationSite = AllocationSite::new("<unknown>", "<unknown>", 0);

    /// Constructs a new `AllocationSite`.
    pub const fn new(description: &'static str, file: &'static str, line: u32) -> Self {
        Self {
            description,
            file,
            line,
        }
    }
}

impl Default for AllocationSite {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl Display for AllocationSite {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}:{})", self.description, self.file, self.line)
    }
}

/// Interface of a custom memory allocator.
///
/// An object created with an allocator is always freed by the same allocator instance, as the
/// instance is captured next to the object until it is destroyed.
pub trait MemoryAllocator: Send + Sync {
    /// Allocates a block of memory fitting `layout`.
    ///
    /// The size of `layout` is never zero. Returns `None` if the request could not be satisfied.
    fn allocate(&self, layout: Layout, site: &AllocationSite) -> Option<NonNull<u8>>;

    /// Frees a block of memory.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](MemoryAllocator::allocate) of the same
    /// allocator, with the same `layout`, and must not have been freed already.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Shared handle to a [`MemoryAllocator`].
pub type AllocatorRef = Arc<dyn MemoryAllocator>;

/// Allocator forwarding to the global allocator of the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DefaultRawAllocator;

impl MemoryAllocator for DefaultRawAllocator {
    fn allocate(&self, layout: Layout, _site: &AllocationSite) -> Option<NonNull<u8>> {
        debug_assert_ne!(layout.size(), 0);

        // Safety: The layout has a non-zero size.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        // Safety: By the contract of `free` the pointer was allocated by `alloc` with `layout`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Moves `value` into memory owned by `allocator`, or into a `Box` if no allocator is given.
pub(crate) fn allocate_object<T>(
    value: T,
    allocator: Option<&AllocatorRef>,
    site: &AllocationSite,
) -> NonNull<T> {
    let Some(allocator) = allocator else {
        return NonNull::from(Box::leak(Box::new(value)));
    };

    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        std::mem::forget(value);
        return NonNull::dangling();
    }

    let ptr = match allocator.allocate(layout, site) {
        Some(ptr) => ptr.cast::<T>(),
        None => {
            tracing::error!(%site, size = layout.size(), "out of memory");
            handle_alloc_error(layout)
        }
    };
    contract_assert!(
        ptr.as_ptr().is_aligned(),
        "allocator returned a misaligned pointer for {site}"
    );

    // Safety: The memory block is fresh, large enough and aligned for `T`.
    unsafe { ptr.as_ptr().write(value) };
    ptr
}

/// Drops the object and releases its memory with the strategy used by [`allocate_object`].
///
/// # Safety
///
/// `ptr` must stem from a call to [`allocate_object`] with the same `allocator`, and must not be
/// used afterwards.
pub(crate) unsafe fn destroy_object<T: ?Sized>(ptr: NonNull<T>, allocator: Option<AllocatorRef>) {
    let Some(allocator) = allocator else {
        // Safety: Without an allocator the object was allocated by a `Box`.
        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        return;
    };

    // Safety: The object is still alive.
    let layout = Layout::for_value(unsafe { ptr.as_ref() });

    // Safety: The object is alive and owned by the caller.
    unsafe { std::ptr::drop_in_place(ptr.as_ptr()) };
    if layout.size() != 0 {
        // Safety: The block was allocated by this allocator with `layout`.
        unsafe { allocator.free(ptr.cast(), layout) };
    }
}
