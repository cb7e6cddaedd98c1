//! Reference counters controlling the lifetime of a managed object.
//!
//! A [`ReferenceCounters`] instance is allocated for every object created by the
//! [`ObjectFactory`](crate::ObjectFactory). It tracks the strong and weak references to the
//! object and decides when the object is destroyed, and when the counters destroy themselves.
//!
//! The strong and weak counts are changed without locking. The counters lock serializes only the
//! decisions that read a count together with the object state:
//!
//! - the teardown of the object, once the strong count reached zero,
//! - the release of a weak reference, which may destroy the counters,
//! - the promotion of a weak reference through [`ReferenceCounters::query_object`].
//!
//! Weak promotion is optimistic: the query increments the strong count under the lock and only
//! hands out a reference if the count was positive before, i.e. if no teardown is pending. The
//! increment is always undone afterwards.
use crate::allocator::{allocate_object, destroy_object, AllocationSite, AllocatorRef};
use crate::error::QueryError;
use crate::holder::ObjectHolder;
use crate::object::{InterfaceId, Object};
use crate::rc_ptr::RcPtr;
use crate::sync::SpinMutex;
use std::fmt::{Debug, Formatter};
use std::process::abort;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicIsize, AtomicU8, Ordering};

#[cfg(test)]
mod test;

/// Value type of the reference counts.
pub type RefCount = isize;

/// A soft limit on the number of references of either kind.
///
/// Going above this limit aborts the process.
const MAX_REFCOUNT: RefCount = RefCount::MAX / 2;

/// Lifecycle state of the object controlled by a [`ReferenceCounters`] instance.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectState {
    /// The object is still being constructed.
    NotInitialized = 0,
    /// The object is constructed and reachable.
    Alive = 1,
    /// The object has been torn down.
    Destroyed = 2,
}

impl ObjectState {
    #[inline]
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ObjectState::NotInitialized,
            1 => ObjectState::Alive,
            2 => ObjectState::Destroyed,
            _ => unreachable!("invalid object state {value}"),
        }
    }
}

/// Strong and weak reference counts of a managed object.
///
/// Instances are created by the [`ObjectFactory`](crate::ObjectFactory) and are never moved.
/// They outlive the object and are destroyed once the object is gone and the last weak
/// reference has been released.
pub struct ReferenceCounters {
    strong: AtomicIsize,
    weak: AtomicIsize,
    state: AtomicU8,
    object: SpinMutex<Option<ObjectHolder>>,
    allocator: Option<AllocatorRef>,
}

impl ReferenceCounters {
    const ALLOCATION_SITE: AllocationSite =
        AllocationSite::new("ReferenceCounters", file!(), line!());

    /// Allocates a new detached instance, using `allocator` if given.
    pub(crate) fn allocate(allocator: Option<&AllocatorRef>) -> NonNull<Self> {
        let counters = Self {
            strong: AtomicIsize::new(0),
            weak: AtomicIsize::new(0),
            state: AtomicU8::new(ObjectState::NotInitialized as u8),
            object: SpinMutex::new(None),
            allocator: allocator.cloned(),
        };

        allocate_object(counters, allocator, &Self::ALLOCATION_SITE)
    }

    /// Attaches the constructed object, making it reachable.
    ///
    /// The object starts out with one strong reference, which is owned by the caller.
    pub(crate) fn attach(&self, holder: ObjectHolder) {
        let mut object = self.object.lock();
        contract_assert!(
            self.object_state() == ObjectState::NotInitialized,
            "an object has already been attached to the reference counters"
        );

        *object = Some(holder);
        self.strong.store(1, Ordering::Relaxed);
        self.state.store(ObjectState::Alive as u8, Ordering::Release);
    }

    /// Gives up counters whose object was never attached.
    ///
    /// The counters are destroyed immediately, unless weak references created during the
    /// construction are still alive. In that case the object is marked as destroyed and the
    /// last weak reference destroys the counters.
    ///
    /// # Safety
    ///
    /// `this` must point to live counters without an attached object, and must not be used by
    /// the caller afterwards.
    pub(crate) unsafe fn abandon(this: NonNull<Self>) {
        // Safety: The counters are alive until this function decides otherwise.
        let counters = unsafe { this.as_ref() };

        let object = counters.object.lock();
        contract_assert!(object.is_none(), "abandoned counters with an attached object");
        counters
            .state
            .store(ObjectState::Destroyed as u8, Ordering::Release);
        let weak = counters.weak.load(Ordering::Acquire);
        drop(object);

        if weak == 0 {
            // Safety: No object was attached and no weak references remain.
            unsafe { Self::self_destroy(this) };
        } else {
            tracing::debug!(
                counters = ?this,
                weak,
                "weak references outlive a failed construction"
            );
        }
    }

    /// Returns the current state of the object.
    #[inline]
    pub fn object_state(&self) -> ObjectState {
        ObjectState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns the number of strong references.
    ///
    /// The value may be outdated by the time it is returned and is meant for diagnostics.
    #[inline]
    pub fn num_strong_refs(&self) -> RefCount {
        self.strong.load(Ordering::Relaxed)
    }

    /// Returns the number of weak references.
    ///
    /// The value may be outdated by the time it is returned and is meant for diagnostics.
    #[inline]
    pub fn num_weak_refs(&self) -> RefCount {
        self.weak.load(Ordering::Relaxed)
    }

    /// Adds a strong reference to the object.
    ///
    /// The caller must already hold a reference keeping the object alive, so the increment can
    /// not race with the teardown. Returns the new number of strong references.
    ///
    /// # Panics
    ///
    /// Panics if no strong reference is held, e.g. while the object is being constructed or
    /// destroyed. With contract checks enabled, also panics if the object is not alive.
    #[inline]
    pub fn add_strong_ref(&self) -> RefCount {
        contract_assert!(
            self.object_state() == ObjectState::Alive,
            "attempted to add a strong reference to an object that is not alive"
        );

        let old = self.strong.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            abort();
        }
        if old <= 0 {
            self.strong.fetch_sub(1, Ordering::Relaxed);
            panic!("attempted to add a strong reference to an object without strong references");
        }
        old + 1
    }

    /// Releases a strong reference to the object.
    ///
    /// Returns the remaining number of strong references. Releasing the last strong reference
    /// destroys the object, and the counters if there are no weak references.
    ///
    /// # Safety
    ///
    /// `this` must point to live counters and the caller must own a strong reference, which is
    /// consumed by the call.
    #[inline]
    pub unsafe fn release_strong_ref(this: NonNull<Self>) -> RefCount {
        // Safety: Forwarded to the caller.
        unsafe { Self::release_strong_ref_with(this, || {}) }
    }

    /// Releases a strong reference to the object, invoking `pre_destroy` before the object is
    /// destroyed.
    ///
    /// The callback runs only if this call released the last strong reference. The object is
    /// still intact at that point, but the strong count is already zero: the callback must not
    /// create new strong references to the object, neither directly nor by promoting a weak
    /// reference. Adding one panics, and promotions fail.
    ///
    /// # Safety
    ///
    /// See [`ReferenceCounters::release_strong_ref`].
    pub unsafe fn release_strong_ref_with(
        this: NonNull<Self>,
        pre_destroy: impl FnOnce(),
    ) -> RefCount {
        // Safety: The caller owns a strong reference, so the counters are alive.
        let counters = unsafe { this.as_ref() };
        contract_assert!(
            counters.object_state() == ObjectState::Alive,
            "attempted to release a strong reference to an object that is not alive"
        );

        let count = counters.strong.fetch_sub(1, Ordering::Release) - 1;
        contract_assert!(count >= 0, "inconsistent call to release_strong_ref");

        if count == 0 {
            // Synchronizes with the releases of the other strong references.
            atomic::fence(Ordering::Acquire);
            pre_destroy();

            // Safety: The strong count reached zero in this thread.
            unsafe { Self::destroy_object(this) };
        }

        count
    }

    /// Adds a weak reference.
    ///
    /// The caller must already hold a strong or weak reference, so the counters can not be
    /// destroyed concurrently. Returns the new number of weak references.
    #[inline]
    pub fn add_weak_ref(&self) -> RefCount {
        let old = self.weak.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            abort();
        }
        old + 1
    }

    /// Releases a weak reference.
    ///
    /// Returns the remaining number of weak references. Releasing the last weak reference after
    /// the object has been destroyed destroys the counters.
    ///
    /// # Safety
    ///
    /// `this` must point to live counters and the caller must own a weak reference, which is
    /// consumed by the call.
    pub unsafe fn release_weak_ref(this: NonNull<Self>) -> RefCount {
        // Safety: The caller owns a weak reference, so the counters are alive.
        let counters = unsafe { this.as_ref() };

        // The count must be checked together with the state while holding the lock, otherwise a
        // concurrent teardown and this call could both decide to destroy the counters.
        let object = counters.object.lock();
        let count = counters.weak.fetch_sub(1, Ordering::AcqRel) - 1;
        contract_assert!(count >= 0, "inconsistent call to release_weak_ref");

        // An object under construction is `NotInitialized`. Its counters belong to the factory,
        // even if the last weak reference to them is gone.
        if count == 0 && counters.object_state() == ObjectState::Destroyed {
            contract_assert!(
                counters.strong.load(Ordering::Relaxed) == 0,
                "strong references remain to a destroyed object"
            );
            contract_assert!(object.is_none(), "the object holder must be empty");

            drop(object);

            // Safety: The object is destroyed and no references of either kind remain.
            unsafe { Self::self_destroy(this) };
        }

        count
    }

    /// Tries to obtain a strong reference to the object, viewed as the interface `iid`.
    ///
    /// Fails with [`QueryError::ObjectDestroyed`] if the object is not alive, or if its last
    /// strong reference has already been released and the teardown is pending. Fails with
    /// [`QueryError::NotSupported`] if the object does not implement the interface.
    ///
    /// # Safety
    ///
    /// `this` must point to live counters and the caller must hold a strong or weak reference
    /// for the duration of the call.
    pub unsafe fn query_object(
        this: NonNull<Self>,
        iid: &InterfaceId,
    ) -> Result<RcPtr<dyn Object>, QueryError> {
        // Safety: The caller holds a reference, so the counters are alive.
        let counters = unsafe { this.as_ref() };
        if counters.object_state() != ObjectState::Alive {
            return Err(QueryError::ObjectDestroyed);
        }

        // Queries are serialized, so that a count greater than one after the increment
        // guarantees that at least one real strong reference remains. A count of one means that
        // a concurrent release brought the count to zero and waits for the lock to tear the
        // object down.
        let object = counters.object.lock();
        let strong = counters.strong.fetch_add(1, Ordering::AcqRel) + 1;
        let verified = counters.object_state() == ObjectState::Alive && strong > 1;

        let result = match object.as_ref() {
            Some(holder) if verified => {
                // Safety: The increment keeps the object alive until it is undone.
                unsafe { holder.query_interface(iid) }.ok_or(QueryError::NotSupported(*iid))
            }
            _ => {
                contract_assert!(!verified, "the holder of an alive object is empty");
                Err(QueryError::ObjectDestroyed)
            }
        };

        let remaining = counters.strong.fetch_sub(1, Ordering::AcqRel) - 1;
        drop(object);

        // If the query passed the check but produced no reference and every other strong
        // reference was released in the meantime, those releases all observed a count kept
        // positive by this query. The teardown is therefore up to this thread.
        if verified && remaining == 0 {
            // Safety: The strong count reached zero in this thread.
            unsafe { Self::destroy_object(this) };
        }

        result
    }

    /// Tears down the object after its strong count reached zero.
    ///
    /// # Safety
    ///
    /// Must only be called by the thread whose decrement brought the strong count to zero.
    unsafe fn destroy_object(this: NonNull<Self>) {
        // Safety: The counters are destroyed at the earliest by this function.
        let counters = unsafe { this.as_ref() };

        // A concurrent query may temporarily hold one strong reference.
        debug_assert!(
            matches!(counters.strong.load(Ordering::Relaxed), 0 | 1),
            "unexpected strong count during teardown"
        );

        // Once the lock is acquired, no query is running and the count must be zero.
        let mut object = counters.object.lock();
        let strong = counters.strong.load(Ordering::Acquire);
        let state = counters.object_state();
        contract_assert!(
            strong == 0 && state == ObjectState::Alive,
            "invalid teardown of an object with {strong} strong references in state {state:?}"
        );
        if strong != 0 || state != ObjectState::Alive {
            return;
        }

        // Destroying the object may create and release weak references to these counters.
        // Those must see an empty holder and the final state, so both are updated before the
        // object is gone.
        let holder = object.take();
        counters
            .state
            .store(ObjectState::Destroyed as u8, Ordering::Release);

        // The teardown owns a weak reference until the object is gone, so that only the final
        // `release_weak_ref` destroys the counters.
        counters.weak.fetch_add(1, Ordering::Relaxed);

        // The object may release weak references to these counters while it is dropped, which
        // would deadlock if the lock was still held.
        drop(object);

        if let Some(holder) = holder {
            tracing::trace!(counters = ?this, "destroying managed object");

            // Safety: No strong references remain.
            unsafe { holder.destroy() };
        }

        // Safety: Releases the weak reference acquired above.
        unsafe { Self::release_weak_ref(this) };
    }

    /// Destroys the counters, releasing their memory.
    ///
    /// # Safety
    ///
    /// Must be called at most once, after the last reference to the counters is gone.
    unsafe fn self_destroy(this: NonNull<Self>) {
        tracing::trace!(counters = ?this, "destroying reference counters");

        // Safety: The counters are still alive.
        let allocator = unsafe { this.as_ref() }.allocator.clone();

        // Safety: The counters were allocated with their own allocator.
        unsafe { destroy_object(this, allocator) }
    }
}

impl Drop for ReferenceCounters {
    fn drop(&mut self) {
        let strong = *self.strong.get_mut();
        let weak = *self.weak.get_mut();
        contract_assert!(
            strong == 0 && weak == 0,
            "destroying reference counters with {strong} strong and {weak} weak references"
        );
    }
}

impl Debug for ReferenceCounters {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceCounters")
            .field("strong", &self.num_strong_refs())
            .field("weak", &self.num_weak_refs())
            .field("state", &self.object_state())
            .finish_non_exhaustive()
    }
}
