use crate::{
    AllocationSite, DefaultRawAllocator, InterfaceId, ManagedObject, MemoryAllocator, Object,
    ObjectFactory, ObjectState, QueryError, RcPtr, ReferenceCounters, WeakCounters, WeakPtr,
    IID_UNKNOWN,
};
use std::alloc::Layout;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

const IID_GAUGE: InterfaceId = InterfaceId::from_u128(0x3f0e_2b4c_7a51_4d8e_9c61_d2a0_51b7_e3f4);
const IID_SLOW: InterfaceId = InterfaceId::from_u128(0x8d2c_61a0_0b7e_4f13_a5d9_2e47_c0f8_9b16);

#[derive(Default)]
struct CountingAllocator {
    live: AtomicUsize,
    total: AtomicUsize,
}

impl CountingAllocator {
    fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

impl MemoryAllocator for CountingAllocator {
    fn allocate(&self, layout: Layout, site: &AllocationSite) -> Option<NonNull<u8>> {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        DefaultRawAllocator.allocate(layout, site)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        // Safety: Forwarded to the caller.
        unsafe { DefaultRawAllocator.free(ptr, layout) }
    }
}

struct Gauge {
    base: ManagedObject,
    drops: Arc<AtomicUsize>,
}

impl Drop for Gauge {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

crate::impl_object!(Gauge, base, [IID_GAUGE]);

fn counting_factory() -> (Arc<CountingAllocator>, ObjectFactory) {
    let allocator = Arc::new(CountingAllocator::default());
    let factory = ObjectFactory::with_allocator(allocator.clone(), AllocationSite::UNKNOWN);
    (allocator, factory)
}

fn new_gauge(factory: &ObjectFactory) -> (Arc<AtomicUsize>, RcPtr<Gauge>) {
    let drops = Arc::new(AtomicUsize::new(0));
    let gauge = factory
        .create(|base| {
            Ok::<_, ()>(Gauge {
                base,
                drops: drops.clone(),
            })
        })
        .unwrap();
    (drops, gauge)
}

#[test]
fn strong_lifecycle() {
    let (allocator, factory) = counting_factory();
    let (drops, gauge) = new_gauge(&factory);

    // Object and counters.
    assert_eq!(allocator.live(), 2);
    assert_eq!(RcPtr::strong_count(&gauge), 1);
    assert_eq!(RcPtr::weak_count(&gauge), 0);

    let raw = RcPtr::into_raw(gauge);

    // Safety: The object is kept alive by the reference adopted from `gauge`.
    let base: *const ManagedObject = unsafe { std::ptr::addr_of!((*raw.as_ptr()).base) };

    // Safety: See above.
    assert_eq!(unsafe { (*base).add_ref() }, 2);

    // Safety: Releases the reference added above.
    assert_eq!(unsafe { ManagedObject::release(base) }, 1);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    // Safety: Releases the reference adopted from `gauge`.
    assert_eq!(unsafe { ManagedObject::release(base) }, 0);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(allocator.live(), 0);
    assert_eq!(allocator.total(), 2);
}

#[test]
fn weak_reference_outlives_object() {
    let (allocator, factory) = counting_factory();
    let (drops, gauge) = new_gauge(&factory);

    let counters = RcPtr::reference_counters(&gauge);
    // Safety: The counters are kept alive by `gauge`.
    assert_eq!(unsafe { counters.as_ref() }.add_weak_ref(), 1);

    drop(gauge);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(allocator.live(), 1);

    // Safety: The counters are kept alive by the weak reference added above.
    unsafe {
        assert_eq!(counters.as_ref().object_state(), ObjectState::Destroyed);
        assert_eq!(counters.as_ref().num_strong_refs(), 0);
        assert_eq!(
            ReferenceCounters::query_object(counters, &IID_UNKNOWN).unwrap_err(),
            QueryError::ObjectDestroyed
        );
        assert_eq!(ReferenceCounters::release_weak_ref(counters), 0);
    }
    assert_eq!(allocator.live(), 0);
}

#[test]
fn query_object() {
    let (_, factory) = counting_factory();
    let (_drops, gauge) = new_gauge(&factory);
    let counters = RcPtr::reference_counters(&gauge);

    // Safety: The counters are kept alive by `gauge`.
    let unknown = unsafe { ReferenceCounters::query_object(counters, &IID_UNKNOWN) }.unwrap();
    assert_eq!(RcPtr::strong_count(&gauge), 2);

    let typed = unknown.downcast::<Gauge>().unwrap();
    assert!(RcPtr::ptr_eq(&typed, &gauge));
    drop(typed);
    assert_eq!(RcPtr::strong_count(&gauge), 1);

    // Safety: The counters are kept alive by `gauge`.
    let queried = unsafe { ReferenceCounters::query_object(counters, &IID_GAUGE) };
    assert!(queried.is_ok());
    drop(queried);

    // Safety: The counters are kept alive by `gauge`.
    let unsupported = unsafe { ReferenceCounters::query_object(counters, &IID_SLOW) };
    assert_eq!(unsupported.unwrap_err(), QueryError::NotSupported(IID_SLOW));
    assert_eq!(RcPtr::strong_count(&gauge), 1);
}

#[test]
fn pre_destroy_callback() {
    let (_, factory) = counting_factory();
    let (drops, gauge) = new_gauge(&factory);
    let second = gauge.clone();

    let calls = AtomicUsize::new(0);
    let remaining = RcPtr::release_with(second, || {
        calls.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(remaining, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let remaining = RcPtr::release_with(gauge, || {
        // The object is still intact.
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        calls.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(remaining, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn state_transitions() {
    let (allocator, factory) = counting_factory();
    let drops = Arc::new(AtomicUsize::new(0));
    let mut observer = None;

    let gauge = factory
        .create(|base| {
            let counters = WeakCounters::new(&base);
            assert_eq!(counters.object_state(), ObjectState::NotInitialized);
            assert!(counters.upgrade().is_none());
            observer = Some(counters);
            Ok::<_, ()>(Gauge {
                base,
                drops: drops.clone(),
            })
        })
        .unwrap();

    let observer = observer.unwrap();
    assert_eq!(observer.object_state(), ObjectState::Alive);
    assert_eq!(observer.strong_count(), 1);
    assert_eq!(observer.weak_count(), 1);
    assert!(observer.upgrade().is_some());

    drop(gauge);
    assert_eq!(observer.object_state(), ObjectState::Destroyed);
    assert_eq!(allocator.live(), 1);

    drop(observer);
    assert_eq!(allocator.live(), 0);
}

#[test]
fn failed_construction_releases_counters() {
    let (allocator, factory) = counting_factory();

    let result = factory.create(|base| {
        // A weak reference to the object under construction, released before the failure.
        let _weak = WeakCounters::new(&base);
        assert_eq!(allocator.live(), 1);
        Err::<Gauge, _>("construction failed")
    });

    assert_eq!(result.err(), Some("construction failed"));
    assert_eq!(allocator.live(), 0);
    assert_eq!(allocator.total(), 1);
}

#[test]
fn weak_references_outlive_failed_construction() {
    let (allocator, factory) = counting_factory();

    let observer = match factory.create(|base| Err::<Gauge, _>(WeakCounters::new(&base))) {
        Ok(_) => panic!("construction must fail"),
        Err(observer) => observer,
    };

    assert_eq!(allocator.live(), 1);
    assert_eq!(observer.object_state(), ObjectState::Destroyed);
    assert_eq!(observer.strong_count(), 0);
    assert_eq!(observer.weak_count(), 1);
    assert!(observer.upgrade().is_none());

    let second = observer.clone();
    drop(observer);
    assert_eq!(allocator.live(), 1);

    drop(second);
    assert_eq!(allocator.live(), 0);
    assert_eq!(allocator.total(), 1);
}

#[test]
fn weak_references_during_teardown() {
    struct Reentrant {
        base: ManagedObject,
        upgraded: Arc<AtomicUsize>,
    }

    impl Drop for Reentrant {
        fn drop(&mut self) {
            let counters = WeakCounters::new(&self.base);
            assert_eq!(counters.object_state(), ObjectState::Destroyed);
            if counters.upgrade().is_some() {
                self.upgraded.fetch_add(1, Ordering::SeqCst);
            }
            let clone = counters.clone();
            drop(counters);
            drop(clone);
        }
    }

    crate::impl_object!(Reentrant, base);

    let (allocator, factory) = counting_factory();
    let upgraded = Arc::new(AtomicUsize::new(0));
    let create = || {
        factory
            .create(|base| {
                Ok::<_, ()>(Reentrant {
                    base,
                    upgraded: upgraded.clone(),
                })
            })
            .unwrap()
    };

    // Without outside weak references.
    drop(create());
    assert_eq!(allocator.live(), 0);
    assert_eq!(allocator.total(), 2);

    // With an outside weak reference outliving the object.
    let object = create();
    let weak = RcPtr::downgrade(&object);
    drop(object);
    assert_eq!(allocator.live(), 1);
    assert_eq!(weak.weak_count(), 1);

    drop(weak);
    assert_eq!(allocator.live(), 0);
    assert_eq!(upgraded.load(Ordering::SeqCst), 0);
}

#[test]
fn references_to_unplaced_objects_are_rejected() {
    let (allocator, factory) = counting_factory();
    let (_drops, owner) = new_gauge(&factory);
    let child_drops = Arc::new(AtomicUsize::new(0));

    let result = catch_unwind(AssertUnwindSafe(|| {
        factory.create_child(owner.base(), |base| {
            let child = Gauge {
                base,
                drops: child_drops.clone(),
            };
            let _ = RcPtr::from_ref(&child);
            Ok::<_, ()>(child)
        })
    }));

    assert!(result.is_err());
    assert_eq!(child_drops.load(Ordering::SeqCst), 1);
    assert_eq!(RcPtr::strong_count(&owner), 1);
    assert_eq!(RcPtr::weak_count(&owner), 0);
    assert_eq!(allocator.live(), 2);
}

#[test]
#[should_panic(expected = "without strong references")]
fn pre_destroy_callback_cannot_resurrect() {
    let (_, factory) = counting_factory();
    let (_drops, gauge) = new_gauge(&factory);
    let object = RcPtr::as_ptr(&gauge);

    RcPtr::release_with(gauge, || {
        // Safety: The object is intact until the callback returns.
        let _ = RcPtr::from_ref(unsafe { object.as_ref() });
    });
}

#[test]
#[cfg(any(debug_assertions, feature = "strict_contracts"))]
#[should_panic(expected = "destroying reference counters with 0 strong and 1 weak references")]
fn destroying_referenced_counters() {
    let counters = ReferenceCounters::allocate(None);

    // Safety: The counters were just allocated.
    unsafe { counters.as_ref() }.add_weak_ref();

    // Safety: Deliberately breaks the contract; the destructor of the counters panics.
    unsafe { ReferenceCounters::self_destroy(counters) };
}

#[test]
fn query_completes_teardown() {
    struct SlowGauge {
        base: ManagedObject,
        entered: Arc<Barrier>,
        resume: Arc<Barrier>,
        drops: Arc<AtomicUsize>,
    }

    impl crate::Object for SlowGauge {
        fn base(&self) -> &ManagedObject {
            &self.base
        }

        fn query_interface(&self, iid: &InterfaceId) -> Option<RcPtr<dyn crate::Object>> {
            if *iid == IID_SLOW {
                self.entered.wait();
                self.resume.wait();
                None
            } else if *iid == IID_UNKNOWN {
                Some(RcPtr::<dyn crate::Object>::from_ref(self))
            } else {
                None
            }
        }
    }

    impl Drop for SlowGauge {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    let (allocator, factory) = counting_factory();
    let entered = Arc::new(Barrier::new(2));
    let resume = Arc::new(Barrier::new(2));
    let drops = Arc::new(AtomicUsize::new(0));

    let gauge = factory
        .create(|base| {
            Ok::<_, ()>(SlowGauge {
                base,
                entered: entered.clone(),
                resume: resume.clone(),
                drops: drops.clone(),
            })
        })
        .unwrap();
    let weak = RcPtr::downgrade(&gauge);
    let counters = RcPtr::reference_counters(&gauge);

    struct SendCounters(NonNull<ReferenceCounters>);

    // Safety: The counters are only accessed through their thread-safe API.
    unsafe impl Send for SendCounters {}

    let send_counters = SendCounters(counters);

    std::thread::scope(|s| {
        let query = s.spawn(move || {
            let send_counters = send_counters;
            // Safety: The counters are kept alive by `weak`.
            unsafe { ReferenceCounters::query_object(send_counters.0, &IID_SLOW) }.map(drop)
        });

        // Release the last strong reference while the query keeps the object alive.
        entered.wait();
        drop(gauge);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        resume.wait();

        assert_eq!(query.join().unwrap(), Err(QueryError::NotSupported(IID_SLOW)));
    });

    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(weak.upgrade().is_none());
    assert!(!weak.is_valid());

    drop(weak);
    assert_eq!(allocator.live(), 0);
}

#[test]
fn weak_upgrade() {
    let (_, factory) = counting_factory();
    let (drops, gauge) = new_gauge(&factory);

    let weak: WeakPtr<Gauge> = RcPtr::downgrade(&gauge);
    assert!(weak.is_valid());
    assert_eq!(weak.weak_count(), 1);

    let upgraded = weak.upgrade().unwrap();
    assert!(RcPtr::ptr_eq(&upgraded, &gauge));
    assert_eq!(weak.strong_count(), 2);

    drop(upgraded);
    drop(gauge);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(weak.try_upgrade().err(), Some(QueryError::ObjectDestroyed));
}
