#![allow(dead_code)]

use fimo_refcount::{
    impl_object, AllocationSite, DefaultRawAllocator, InterfaceId, ManagedObject, MemoryAllocator,
    ObjectFactory,
};
use parking_lot::Mutex;
use std::alloc::Layout;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

pub const IID_TRACKED: InterfaceId =
    InterfaceId::from_u128(0x1c4a_77e0_52f3_4b9a_8e26_0d5b_93c1_fa08);

/// Installs a subscriber printing the diagnostics of the crate through the test harness.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fimo_refcount=trace")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Allocator recording every live block, detecting leaks and invalid frees.
#[derive(Debug, Default)]
pub struct TrackingAllocator {
    live: Mutex<HashMap<usize, (Layout, &'static str)>>,
    allocations: AtomicUsize,
    frees: AtomicUsize,
}

impl TrackingAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn live(&self) -> usize {
        self.live.lock().len()
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    /// Descriptions of the blocks that are still allocated.
    pub fn live_descriptions(&self) -> Vec<&'static str> {
        let mut descriptions: Vec<_> = self.live.lock().values().map(|(_, d)| *d).collect();
        descriptions.sort_unstable();
        descriptions
    }

    pub fn assert_no_leaks(&self) {
        assert_eq!(
            self.live_descriptions(),
            Vec::<&'static str>::new(),
            "leaked allocations"
        );
        assert_eq!(self.allocations(), self.frees());
    }

    pub fn factory(self: &Arc<Self>, description: &'static str) -> ObjectFactory {
        ObjectFactory::with_allocator(
            self.clone(),
            AllocationSite::new(description, file!(), line!()),
        )
    }
}

impl MemoryAllocator for TrackingAllocator {
    fn allocate(&self, layout: Layout, site: &AllocationSite) -> Option<NonNull<u8>> {
        let ptr = DefaultRawAllocator.allocate(layout, site)?;
        let previous = self
            .live
            .lock()
            .insert(ptr.as_ptr() as usize, (layout, site.description));
        assert!(previous.is_none(), "block allocated twice");
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Some(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        let entry = self.live.lock().remove(&(ptr.as_ptr() as usize));
        match entry {
            Some((allocated, description)) => {
                assert_eq!(allocated, layout, "`{description}` freed with a different layout");
            }
            None => panic!("free of an unknown or already freed block {ptr:p}"),
        }
        self.frees.fetch_add(1, Ordering::SeqCst);

        // Safety: The block was allocated by the default allocator with `layout`.
        unsafe { DefaultRawAllocator.free(ptr, layout) }
    }
}

/// Counts how often the objects sharing it were dropped.
#[derive(Debug, Default, Clone)]
pub struct DropCounter(Arc<AtomicUsize>);

impl DropCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn record(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Object recording its destruction.
#[derive(Debug)]
pub struct Tracked {
    base: ManagedObject,
    pub value: u32,
    drops: DropCounter,
}

impl Tracked {
    pub fn new(base: ManagedObject, value: u32, drops: &DropCounter) -> Self {
        Self {
            base,
            value,
            drops: drops.clone(),
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.record();
    }
}

impl_object!(Tracked, base, [IID_TRACKED]);
