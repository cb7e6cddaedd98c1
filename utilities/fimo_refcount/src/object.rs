//! Object utilities.
use crate::counters::{RefCount, ReferenceCounters};
use crate::rc_ptr::RcPtr;
use std::any::Any;
use std::fmt::{Debug, Display, Formatter};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Unique id of an interface an object may be queried for.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceId(Uuid);

impl InterfaceId {
    /// Constructs an `InterfaceId` from its 128-bit value.
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Constructs an `InterfaceId` from a [`Uuid`].
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying [`Uuid`].
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Debug for InterfaceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("InterfaceId").field(&self.0).finish()
    }
}

impl Display for InterfaceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0.braced(), f)
    }
}

/// Id of the interface every object supports.
///
/// Querying it returns a reference to the object itself. Weak pointers use it to promote
/// themselves to a strong reference.
pub const IID_UNKNOWN: InterfaceId = InterfaceId::from_u128(0);

/// Upcasting to [`Any`], used for downcasting type-erased objects.
pub trait AsAny: Any {
    /// Returns `self` as a `&dyn Any`.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Interface of a reference counted object.
///
/// Implementors embed a [`ManagedObject`], which they receive from the
/// [`ObjectFactory`](crate::ObjectFactory) when they are constructed. There is no other way to
/// obtain a `ManagedObject`, so every object lives in memory controlled by its counters.
/// The [`impl_object`](crate::impl_object) macro implements the trait for the common case.
pub trait Object: AsAny + Send + Sync {
    /// Returns the reference counting base of the object.
    fn base(&self) -> &ManagedObject;

    /// Asks the object for a reference to itself, viewed as the interface `iid`.
    ///
    /// Returns `None` if the interface is not supported. Every object must support
    /// [`IID_UNKNOWN`]. Implementations are called while the counters of the object are locked
    /// and must not release references to the object.
    fn query_interface(&self, iid: &InterfaceId) -> Option<RcPtr<dyn Object>>;
}

impl Debug for dyn Object {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("type_id", &self.as_any().type_id())
            .field("base", self.base())
            .finish()
    }
}

/// Base of all reference counted objects.
///
/// Holds a non-owning pointer to the [`ReferenceCounters`] controlling the lifetime of the
/// object. The pointer is fixed when the object is constructed. Objects created as children of
/// another object share the counters of their owner.
///
/// A `ManagedObject` can only be obtained from the [`ObjectFactory`](crate::ObjectFactory),
/// and can neither be cloned nor copied. Strong references can only be created once the
/// factory has moved the object to its final location.
pub struct ManagedObject {
    counters: NonNull<ReferenceCounters>,
    placed: AtomicBool,
}

// Safety: `ReferenceCounters` is thread-safe.
unsafe impl Send for ManagedObject {}

// Safety: `ReferenceCounters` is thread-safe.
unsafe impl Sync for ManagedObject {}

impl ManagedObject {
    #[inline]
    pub(crate) fn new(counters: NonNull<ReferenceCounters>) -> Self {
        Self {
            counters,
            placed: AtomicBool::new(false),
        }
    }

    /// Marks the object as moved to the memory it lives in until it is destroyed.
    #[inline]
    pub(crate) fn mark_placed(&self) {
        self.placed.store(true, Ordering::Release);
    }

    /// Returns whether the object has been moved to its final location.
    #[inline]
    pub(crate) fn is_placed(&self) -> bool {
        self.placed.load(Ordering::Acquire)
    }

    /// Returns a pointer to the reference counters of the object.
    ///
    /// The counters are alive as long as the object is alive, or the caller holds a strong or
    /// weak reference. They may already be gone while the object is being dropped.
    #[inline]
    pub fn reference_counters(&self) -> NonNull<ReferenceCounters> {
        self.counters
    }

    /// Adds a strong reference to the object.
    ///
    /// Returns the new number of strong references.
    ///
    /// # Panics
    ///
    /// With contract checks enabled, panics if the object is not alive.
    #[inline]
    pub fn add_ref(&self) -> RefCount {
        // Safety: The object is borrowed, so it and its counters are alive.
        unsafe { self.counters.as_ref() }.add_strong_ref()
    }

    /// Releases a strong reference to the object.
    ///
    /// Returns the remaining number of strong references. The object is destroyed when the
    /// last strong reference is released.
    ///
    /// # Safety
    ///
    /// `this` must point to the base of a live object and the caller must own a strong reference
    /// to it, which is consumed. If the call returns `0`, the object must not be accessed
    /// anymore.
    #[inline]
    pub unsafe fn release(this: *const Self) -> RefCount {
        // Safety: Forwarded to the caller.
        unsafe { Self::release_with(this, || {}) }
    }

    /// Releases a strong reference to the object, invoking `pre_destroy` before the object is
    /// destroyed.
    ///
    /// See [`ReferenceCounters::release_strong_ref_with`] for the contract of the callback.
    ///
    /// # Safety
    ///
    /// See [`ManagedObject::release`].
    #[inline]
    pub unsafe fn release_with(this: *const Self, pre_destroy: impl FnOnce()) -> RefCount {
        // Safety: The object is alive until the reference is released.
        let counters = unsafe { (*this).counters };

        // Safety: Forwarded to the caller.
        unsafe { ReferenceCounters::release_strong_ref_with(counters, pre_destroy) }
    }
}

impl Debug for ManagedObject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedObject")
            .field("counters", &self.counters)
            .field("placed", &self.is_placed())
            .finish()
    }
}
