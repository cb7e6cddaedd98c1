//! Type-erased holder of a managed object.
use crate::allocator::{destroy_object, AllocatorRef};
use crate::object::{InterfaceId, Object};
use crate::rc_ptr::RcPtr;
use std::fmt::{Debug, Formatter};
use std::ptr::NonNull;

/// Owning, type-erased handle to a managed object, stored inline in its
/// [`ReferenceCounters`](crate::ReferenceCounters).
///
/// The fat object pointer carries the vtable used for dropping and querying the object; the
/// allocator it was created with is captured next to it, so that it is released with the same
/// instance. No additional heap allocation is required.
pub struct ObjectHolder {
    object: NonNull<dyn Object>,
    allocator: Option<AllocatorRef>,
}

static_assertions::assert_eq_size!(ObjectHolder, [usize; 4]);
static_assertions::assert_eq_size!(Option<ObjectHolder>, ObjectHolder);

// Safety: Objects are `Send + Sync` and the holder is the only owner.
unsafe impl Send for ObjectHolder {}

// Safety: Objects are `Send + Sync`.
unsafe impl Sync for ObjectHolder {}

impl ObjectHolder {
    /// Constructs a new holder.
    ///
    /// # Safety
    ///
    /// `object` must have been allocated with `allocator` (or by a `Box` if it is `None`) and
    /// ownership is transferred to the holder.
    pub(crate) unsafe fn new(object: NonNull<dyn Object>, allocator: Option<AllocatorRef>) -> Self {
        Self { object, allocator }
    }

    /// Forwards a capability query to the held object.
    ///
    /// # Safety
    ///
    /// The object must not be destroyed while the call is running.
    pub(crate) unsafe fn query_interface(&self, iid: &InterfaceId) -> Option<RcPtr<dyn Object>> {
        // Safety: Guaranteed by the caller.
        unsafe { self.object.as_ref() }.query_interface(iid)
    }

    /// Drops the object and frees its memory.
    ///
    /// # Safety
    ///
    /// No strong references to the object may remain.
    pub(crate) unsafe fn destroy(self) {
        let Self { object, allocator } = self;

        // Safety: The holder owns the object, which was allocated with `allocator`.
        unsafe { destroy_object(object, allocator) }
    }
}

impl Debug for ObjectHolder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHolder")
            .field("object", &self.object)
            .field("custom_allocator", &self.allocator.is_some())
            .finish()
    }
}
