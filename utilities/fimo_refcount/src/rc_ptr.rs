//! Implementation of the `RcPtr<T>` type.
use crate::counters::{RefCount, ReferenceCounters};
use crate::error::QueryError;
use crate::object::{InterfaceId, Object};
use crate::weak_ptr::WeakPtr;
use std::borrow::Borrow;
use std::fmt::{Debug, Display, Formatter, Pointer};
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

/// A strong reference to a managed object.
///
/// Cloning an `RcPtr` adds a strong reference, dropping it releases one. The object is destroyed
/// when its last strong reference is released.
///
/// The pointer dereferences to `T`, so its own functionality is exposed through associated
/// functions, as in `RcPtr::downgrade(&ptr)`.
pub struct RcPtr<T: Object + ?Sized> {
    ptr: NonNull<T>,
    phantom: PhantomData<T>,
}

// Safety: Objects are `Send + Sync` and the counters are thread-safe.
unsafe impl<T: Object + ?Sized> Send for RcPtr<T> {}

// Safety: Objects are `Send + Sync` and the counters are thread-safe.
unsafe impl<T: Object + ?Sized> Sync for RcPtr<T> {}

impl<T: Object + ?Sized> RcPtr<T> {
    /// Constructs a new `RcPtr` to `object`, adding a strong reference.
    ///
    /// # Panics
    ///
    /// Panics if the object is still being constructed, or if it has no strong references left,
    /// e.g. if it is being dropped.
    #[inline]
    pub fn from_ref(object: &T) -> Self {
        let base = object.base();
        assert!(
            base.is_placed(),
            "attempted to reference an object that is still being constructed"
        );
        base.add_ref();
        Self {
            ptr: NonNull::from(object),
            phantom: PhantomData,
        }
    }

    /// Constructs an `RcPtr` from a raw pointer, adopting one strong reference.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object and the caller must own a strong reference to it, which
    /// is transferred to the returned `RcPtr`, e.g. a pointer returned by [`RcPtr::into_raw`].
    #[inline]
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        Self {
            ptr,
            phantom: PhantomData,
        }
    }

    /// Consumes the `RcPtr`, returning the raw pointer without releasing the reference.
    ///
    /// The pointer can be turned back into an `RcPtr` with [`RcPtr::from_raw`] to avoid a leak.
    #[inline]
    pub fn into_raw(this: Self) -> NonNull<T> {
        let ptr = this.ptr;
        std::mem::forget(this);
        ptr
    }

    /// Returns the raw pointer to the object.
    #[inline]
    pub fn as_ptr(this: &Self) -> NonNull<T> {
        this.ptr
    }

    /// Returns a pointer to the reference counters of the object.
    #[inline]
    pub fn reference_counters(this: &Self) -> NonNull<ReferenceCounters> {
        this.base().reference_counters()
    }

    /// Creates a new weak reference to the object.
    #[inline]
    pub fn downgrade(this: &Self) -> WeakPtr<T> {
        WeakPtr::new(this)
    }

    /// Returns the number of strong references to the object.
    ///
    /// Objects created as children of an owner share the count of the owner.
    #[inline]
    pub fn strong_count(this: &Self) -> RefCount {
        // Safety: The counters are kept alive by `this`.
        unsafe { Self::reference_counters(this).as_ref() }.num_strong_refs()
    }

    /// Returns the number of weak references to the object.
    #[inline]
    pub fn weak_count(this: &Self) -> RefCount {
        // Safety: The counters are kept alive by `this`.
        unsafe { Self::reference_counters(this).as_ref() }.num_weak_refs()
    }

    /// Returns whether both pointers point to the same object.
    #[inline]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr.cast::<()>() == other.ptr.cast::<()>()
    }

    /// Releases the reference, invoking `pre_destroy` if it was the last strong reference.
    ///
    /// See [`ReferenceCounters::release_strong_ref_with`] for the contract of the callback.
    /// Returns the remaining number of strong references.
    pub fn release_with(this: Self, pre_destroy: impl FnOnce()) -> RefCount {
        let counters = Self::reference_counters(&this);
        std::mem::forget(this);

        // Safety: The strong reference owned by `this` is consumed.
        unsafe { ReferenceCounters::release_strong_ref_with(counters, pre_destroy) }
    }

    /// Queries the object for the interface `iid` and downcasts the result to `U`.
    pub fn query<U: Object>(this: &Self, iid: &InterfaceId) -> Result<RcPtr<U>, QueryError> {
        let object = this
            .query_interface(iid)
            .ok_or(QueryError::NotSupported(*iid))?;
        object
            .downcast::<U>()
            .map_err(|_| QueryError::TypeMismatch(*iid))
    }
}

impl<T: Object> RcPtr<T> {
    /// Converts the pointer into a type-erased object pointer.
    #[inline]
    pub fn into_object(this: Self) -> RcPtr<dyn Object> {
        let ptr: NonNull<dyn Object> = Self::into_raw(this);

        // Safety: The reference is transferred.
        unsafe { RcPtr::from_raw(ptr) }
    }
}

impl RcPtr<dyn Object> {
    /// Attempts to downcast the object to a concrete type.
    ///
    /// Returns the original pointer if the object is not a `U`.
    pub fn downcast<U: Object>(self) -> Result<RcPtr<U>, Self> {
        if (*self).as_any().is::<U>() {
            let ptr = RcPtr::into_raw(self).cast::<U>();

            // Safety: The type was checked above and the reference is transferred.
            Ok(unsafe { RcPtr::from_raw(ptr) })
        } else {
            Err(self)
        }
    }
}

impl<T: Object + ?Sized> Drop for RcPtr<T> {
    #[inline]
    fn drop(&mut self) {
        let counters = Self::reference_counters(self);

        // Safety: The strong reference owned by `self` is released.
        unsafe { ReferenceCounters::release_strong_ref(counters) };
    }
}

impl<T: Object + ?Sized> Clone for RcPtr<T> {
    #[inline]
    fn clone(&self) -> Self {
        Self::from_ref(self)
    }
}

impl<T: Object + ?Sized> Deref for RcPtr<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // Safety: The object is kept alive by the strong reference.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: Object + ?Sized> AsRef<T> for RcPtr<T> {
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T: Object + ?Sized> Borrow<T> for RcPtr<T> {
    fn borrow(&self) -> &T {
        self
    }
}

impl<T: Object + Debug + ?Sized> Debug for RcPtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&**self, f)
    }
}

impl<T: Object + Display + ?Sized> Display for RcPtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&**self, f)
    }
}

impl<T: Object + ?Sized> Pointer for RcPtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Pointer::fmt(&self.ptr, f)
    }
}

impl<T: Object + PartialEq + ?Sized> PartialEq for RcPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        (**self).eq(&**other)
    }
}

impl<T: Object + Eq + ?Sized> Eq for RcPtr<T> {}
