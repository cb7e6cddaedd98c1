//! Intrusive, thread-safe reference counting for engine objects.
//!
//! Every shared object owns a [`ManagedObject`] base pointing to a separately allocated
//! [`ReferenceCounters`] instance. The counters track strong and weak references and decide,
//! exactly once, when to destroy the object and when to destroy themselves. Objects are only
//! ever created through an [`ObjectFactory`], which pairs the object with its counters and
//! cleans up when the construction fails.
//!
//! # Example
//!
//! ```
//! use fimo_refcount::{impl_object, ManagedObject, ObjectFactory, RcPtr};
//!
//! struct Texture {
//!     base: ManagedObject,
//!     width: u32,
//! }
//!
//! impl_object!(Texture, base);
//!
//! let texture: RcPtr<Texture> = ObjectFactory::new()
//!     .create(|base| Ok::<_, ()>(Texture { base, width: 64 }))
//!     .unwrap();
//! let weak = RcPtr::downgrade(&texture);
//!
//! assert_eq!(texture.width, 64);
//! assert_eq!(weak.upgrade().map(|t| t.width), Some(64));
//!
//! drop(texture);
//! assert!(weak.upgrade().is_none());
//! ```
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links
)]

#[macro_use]
mod macros;

pub mod allocator;
pub mod counters;
pub mod error;
pub mod factory;
pub mod holder;
pub mod object;
pub mod rc_ptr;
pub mod sync;
pub mod weak_ptr;

pub use allocator::{AllocationSite, AllocatorRef, DefaultRawAllocator, MemoryAllocator};
pub use counters::{ObjectState, RefCount, ReferenceCounters};
pub use error::QueryError;
pub use factory::{ObjectFactory, OwnedObject};
pub use object::{AsAny, InterfaceId, ManagedObject, Object, IID_UNKNOWN};
pub use rc_ptr::RcPtr;
pub use sync::{SpinLock, SpinMutex, SpinMutexGuard};
pub use weak_ptr::{WeakCounters, WeakPtr};
