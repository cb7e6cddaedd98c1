//! Implementation of the `WeakPtr<T>` and `WeakCounters` types.
use crate::counters::{ObjectState, RefCount, ReferenceCounters};
use crate::error::QueryError;
use crate::object::{ManagedObject, Object, IID_UNKNOWN};
use crate::rc_ptr::RcPtr;
use std::fmt::{Debug, Formatter};
use std::ptr::NonNull;

/// A weak reference to a managed object.
///
/// A `WeakPtr` does not keep the object alive, but keeps its [`ReferenceCounters`] alive, so
/// that it can always be asked whether the object is still there. Weak pointers are used to
/// break reference cycles, e.g. between a child and its owner. They are created with
/// [`RcPtr::downgrade`].
pub struct WeakPtr<T: Object + ?Sized> {
    counters: NonNull<ReferenceCounters>,
    object: NonNull<T>,
}

// Safety: Objects are `Send + Sync` and the counters are thread-safe.
unsafe impl<T: Object + ?Sized> Send for WeakPtr<T> {}

// Safety: Objects are `Send + Sync` and the counters are thread-safe.
unsafe impl<T: Object + ?Sized> Sync for WeakPtr<T> {}

impl<T: Object + ?Sized> WeakPtr<T> {
    /// Creates a new weak reference to the object of `ptr`.
    pub(crate) fn new(ptr: &RcPtr<T>) -> Self {
        let counters = RcPtr::reference_counters(ptr);

        // Safety: The counters are kept alive by `ptr`.
        unsafe { counters.as_ref() }.add_weak_ref();
        Self {
            counters,
            object: RcPtr::as_ptr(ptr),
        }
    }

    /// Attempts to obtain a strong reference to the object.
    ///
    /// Returns `None` if the object has been destroyed, or if its teardown has started.
    #[inline]
    pub fn upgrade(&self) -> Option<RcPtr<T>> {
        self.try_upgrade().ok()
    }

    /// Attempts to obtain a strong reference to the object, reporting why it failed.
    pub fn try_upgrade(&self) -> Result<RcPtr<T>, QueryError> {
        // Safety: The counters are kept alive by the weak reference.
        let keep_alive = unsafe { ReferenceCounters::query_object(self.counters, &IID_UNKNOWN) }?;

        // Safety: The object is kept alive by `keep_alive`. Children are kept alive by the
        // owner they share their counters with.
        let object = RcPtr::from_ref(unsafe { self.object.as_ref() });
        drop(keep_alive);
        Ok(object)
    }

    /// Returns whether the object was alive at the time of the call.
    ///
    /// The result may be outdated by the time it is returned; use [`WeakPtr::upgrade`] to access
    /// the object.
    #[inline]
    pub fn is_valid(&self) -> bool {
        let counters = self.counters();
        counters.object_state() == ObjectState::Alive && counters.num_strong_refs() > 0
    }

    /// Returns the number of strong references to the object.
    #[inline]
    pub fn strong_count(&self) -> RefCount {
        self.counters().num_strong_refs()
    }

    /// Returns the number of weak references to the object.
    #[inline]
    pub fn weak_count(&self) -> RefCount {
        self.counters().num_weak_refs()
    }

    /// Returns whether both weak pointers point to the same object.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.object.cast::<()>() == other.object.cast::<()>()
    }

    #[inline]
    fn counters(&self) -> &ReferenceCounters {
        // Safety: The counters are kept alive by the weak reference.
        unsafe { self.counters.as_ref() }
    }
}

impl<T: Object + ?Sized> Clone for WeakPtr<T> {
    #[inline]
    fn clone(&self) -> Self {
        self.counters().add_weak_ref();
        Self {
            counters: self.counters,
            object: self.object,
        }
    }
}

impl<T: Object + ?Sized> Drop for WeakPtr<T> {
    #[inline]
    fn drop(&mut self) {
        // Safety: The weak reference owned by `self` is released.
        unsafe { ReferenceCounters::release_weak_ref(self.counters) };
    }
}

impl<T: Object + ?Sized> Debug for WeakPtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "(WeakPtr)")
    }
}

/// A weak reference to the [`ReferenceCounters`] of an object, without access to the object.
///
/// Unlike a [`WeakPtr`], it can be created while the object is still being constructed, e.g.
/// to observe the lifetime of an owner from one of its children. Dropping it before the
/// object is attached does not destroy the counters, which stay owned by the factory.
pub struct WeakCounters {
    counters: NonNull<ReferenceCounters>,
}

// Safety: The counters are thread-safe.
unsafe impl Send for WeakCounters {}

// Safety: The counters are thread-safe.
unsafe impl Sync for WeakCounters {}

impl WeakCounters {
    /// Creates a new weak reference to the counters of `base`.
    pub fn new(base: &ManagedObject) -> Self {
        let counters = base.reference_counters();

        // Safety: The counters outlive the borrowed base.
        unsafe { counters.as_ref() }.add_weak_ref();
        Self { counters }
    }

    /// Returns the state of the object.
    #[inline]
    pub fn object_state(&self) -> ObjectState {
        self.counters().object_state()
    }

    /// Returns the number of strong references to the object.
    #[inline]
    pub fn strong_count(&self) -> RefCount {
        self.counters().num_strong_refs()
    }

    /// Returns the number of weak references to the object.
    #[inline]
    pub fn weak_count(&self) -> RefCount {
        self.counters().num_weak_refs()
    }

    /// Attempts to obtain a type-erased strong reference to the object.
    #[inline]
    pub fn upgrade(&self) -> Option<RcPtr<dyn Object>> {
        // Safety: The counters are kept alive by the weak reference.
        unsafe { ReferenceCounters::query_object(self.counters, &IID_UNKNOWN) }.ok()
    }

    #[inline]
    fn counters(&self) -> &ReferenceCounters {
        // Safety: The counters are kept alive by the weak reference.
        unsafe { self.counters.as_ref() }
    }
}

impl Clone for WeakCounters {
    #[inline]
    fn clone(&self) -> Self {
        self.counters().add_weak_ref();
        Self {
            counters: self.counters,
        }
    }
}

impl Drop for WeakCounters {
    #[inline]
    fn drop(&mut self) {
        // Safety: The weak reference owned by `self` is released.
        unsafe { ReferenceCounters::release_weak_ref(self.counters) };
    }
}

impl Debug for WeakCounters {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakCounters")
            .field("counters", self.counters())
            .finish()
    }
}
