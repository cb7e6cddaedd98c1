//! Construction of managed objects.
use crate::allocator::{allocate_object, destroy_object, AllocationSite, AllocatorRef};
use crate::counters::{ObjectState, ReferenceCounters};
use crate::holder::ObjectHolder;
use crate::object::{ManagedObject, Object};
use crate::rc_ptr::RcPtr;
use crate::weak_ptr::WeakCounters;
use std::any::type_name;
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::ptr::NonNull;

/// Factory pairing new objects with their reference counters.
///
/// The factory is the only way to construct a [`ManagedObject`], and therefore the only way to
/// construct an [`Object`]. Objects are either created with fresh counters
/// ([`create`](ObjectFactory::create)) or as children sharing the counters of an owner
/// ([`create_child`](ObjectFactory::create_child)).
///
/// Objects are placed in memory obtained from the allocator of the factory, or on the heap if
/// the factory has none. The allocator is captured and used again when the object is destroyed.
pub struct ObjectFactory {
    allocator: Option<AllocatorRef>,
    site: AllocationSite,
}

impl ObjectFactory {
    /// Constructs a factory allocating objects on the heap.
    pub fn new() -> Self {
        Self {
            allocator: None,
            site: AllocationSite::UNKNOWN,
        }
    }

    /// Constructs a factory allocating objects with `allocator`.
    ///
    /// The [`new_rc_obj`](crate::new_rc_obj) macro fills in the allocation site.
    pub fn with_allocator(allocator: AllocatorRef, site: AllocationSite) -> Self {
        Self {
            allocator: Some(allocator),
            site,
        }
    }

    /// Returns the allocator of the factory.
    pub fn allocator(&self) -> Option<&AllocatorRef> {
        self.allocator.as_ref()
    }

    /// Returns the allocation site reported to the allocator.
    pub fn site(&self) -> &AllocationSite {
        &self.site
    }

    /// Constructs a new object with its own reference counters.
    ///
    /// `ctor` receives the base the object must embed. The returned pointer owns the only strong
    /// reference to the new object.
    ///
    /// If `ctor` fails, its error is returned unchanged and the fresh counters are destroyed.
    /// The same happens if `ctor` panics, before the panic continues to unwind. Weak references
    /// created during the construction may outlive the failure; they keep the counters alive
    /// and observe a destroyed object.
    pub fn create<T, E>(
        &self,
        ctor: impl FnOnce(ManagedObject) -> Result<T, E>,
    ) -> Result<RcPtr<T>, E>
    where
        T: Object,
    {
        let counters = DetachedCounters(ReferenceCounters::allocate(self.allocator.as_ref()));

        let object = match ctor(ManagedObject::new(counters.0)) {
            Ok(object) => object,
            Err(err) => {
                tracing::debug!(
                    object = type_name::<T>(),
                    site = %self.site,
                    "object construction failed, destroying its reference counters"
                );
                return Err(err);
            }
        };
        contract_assert!(
            object.base().reference_counters() == counters.0,
            "`{}` does not embed the base it was constructed with",
            type_name::<T>()
        );

        let ptr = allocate_object(object, self.allocator.as_ref(), &self.site);
        let counters = counters.into_inner();

        // Safety: The object was just allocated and is owned by this function.
        unsafe { ptr.as_ref() }.base().mark_placed();

        // Safety: The object was allocated with the allocator of the factory.
        let holder = unsafe { ObjectHolder::new(ptr, self.allocator.clone()) };

        // Safety: The counters were allocated above and only weak references to them exist.
        unsafe { counters.as_ref() }.attach(holder);
        tracing::trace!(object = type_name::<T>(), site = %self.site, "created managed object");

        // Safety: The attached object starts with one strong reference, which is adopted here.
        Ok(unsafe { RcPtr::from_raw(ptr) })
    }

    /// Constructs a new object sharing the reference counters of `owner`.
    ///
    /// The child lives as long as the returned [`OwnedObject`], which the owner is expected to
    /// store. Strong and weak references to the child count as references to the owner. If
    /// `ctor` fails, its error is returned unchanged and the counters of the owner are left
    /// untouched. The returned handle holds a weak reference to the counters of the owner.
    pub fn create_child<T, E>(
        &self,
        owner: &ManagedObject,
        ctor: impl FnOnce(ManagedObject) -> Result<T, E>,
    ) -> Result<OwnedObject<T>, E>
    where
        T: Object,
    {
        let counters = owner.reference_counters();
        let object = ctor(ManagedObject::new(counters)).inspect_err(|_| {
            tracing::debug!(
                object = type_name::<T>(),
                site = %self.site,
                "child object construction failed"
            );
        })?;
        contract_assert!(
            object.base().reference_counters() == counters,
            "`{}` does not embed the base it was constructed with",
            type_name::<T>()
        );

        let ptr = allocate_object(object, self.allocator.as_ref(), &self.site);

        // Safety: The child was just allocated and is owned by this function.
        unsafe { ptr.as_ref() }.base().mark_placed();
        tracing::trace!(object = type_name::<T>(), site = %self.site, "created child object");

        Ok(OwnedObject {
            ptr,
            allocator: self.allocator.clone(),
            owner: WeakCounters::new(owner),
        })
    }
}

impl Default for ObjectFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ObjectFactory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectFactory")
            .field("custom_allocator", &self.allocator.is_some())
            .field("site", &self.site)
            .finish()
    }
}

/// Counters that are not attached to an object yet.
///
/// Dropping the guard destroys the counters, which happens if the construction of the object
/// fails or panics.
struct DetachedCounters(NonNull<ReferenceCounters>);

impl DetachedCounters {
    fn into_inner(self) -> NonNull<ReferenceCounters> {
        let counters = self.0;
        std::mem::forget(self);
        counters
    }
}

impl Drop for DetachedCounters {
    fn drop(&mut self) {
        // Safety: The counters were never attached and are not used afterwards.
        unsafe { ReferenceCounters::abandon(self.0) }
    }
}

/// Owning handle to a child object created by [`ObjectFactory::create_child`].
///
/// The handle is meant to be stored inside the owner, so that it is dropped when the owner is
/// destroyed. Dropping it then destroys the child with the allocator it was created with.
///
/// References to the child keep the owner alive, so the child may only be destroyed while
/// the owner is being torn down, or when the construction of the owner failed. A handle
/// dropped while the owner is alive leaks the child instead.
pub struct OwnedObject<T: Object> {
    ptr: NonNull<T>,
    allocator: Option<AllocatorRef>,
    owner: WeakCounters,
}

// Safety: Objects are `Send + Sync`.
unsafe impl<T: Object> Send for OwnedObject<T> {}

// Safety: Objects are `Send + Sync`.
unsafe impl<T: Object> Sync for OwnedObject<T> {}

impl<T: Object> Deref for OwnedObject<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: The child is owned by `self`.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: Object> Drop for OwnedObject<T> {
    fn drop(&mut self) {
        // Strong references only exist while the owner is alive. Until it is gone, some of them
        // may point to the child.
        if self.owner.object_state() == ObjectState::Alive {
            tracing::error!(
                object = type_name::<T>(),
                "child object dropped while its owner is alive, leaking it"
            );
            return;
        }

        // Safety: The child was allocated with the captured allocator and is owned by `self`.
        // No strong references remain.
        unsafe { destroy_object(self.ptr, self.allocator.take()) }
    }
}

impl<T: Object + Debug> Debug for OwnedObject<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OwnedObject").field(&**self).finish()
    }
}
