/// Checks a reference counting contract.
///
/// Violations are programming errors of the caller. The check is compiled in debug builds and
/// in builds with the `strict_contracts` feature.
macro_rules! contract_assert {
    ($cond:expr, $($arg:tt)+) => {
        if cfg!(any(debug_assertions, feature = "strict_contracts")) {
            assert!($cond, $($arg)+);
        }
    };
}

/// Implements [`Object`](crate::Object) for a type embedding a
/// [`ManagedObject`](crate::ManagedObject).
///
/// The first argument is the type, the second the name of the field holding the base. The
/// generated `query_interface` answers [`IID_UNKNOWN`](crate::IID_UNKNOWN) and every listed
/// interface id with a new strong reference to the object.
///
/// # Example
///
/// ```
/// use fimo_refcount::{impl_object, InterfaceId, ManagedObject};
///
/// const IID_BUFFER: InterfaceId = InterfaceId::from_u128(0x5a1c_9ff6_1b3e_4d0e_b1c4_6e9e_0c1a_7d21);
///
/// struct Buffer {
///     base: ManagedObject,
///     len: usize,
/// }
///
/// impl_object!(Buffer, base, [IID_BUFFER]);
/// ```
#[macro_export]
macro_rules! impl_object {
    ($ty:ty, $base:ident) => {
        $crate::impl_object!($ty, $base, []);
    };
    ($ty:ty, $base:ident, [$($iid:expr),* $(,)?]) => {
        impl $crate::Object for $ty {
            #[inline]
            fn base(&self) -> &$crate::ManagedObject {
                &self.$base
            }

            fn query_interface(
                &self,
                iid: &$crate::InterfaceId,
            ) -> ::core::option::Option<$crate::RcPtr<dyn $crate::Object>> {
                if *iid == $crate::IID_UNKNOWN $(|| *iid == $iid)* {
                    ::core::option::Option::Some($crate::RcPtr::<dyn $crate::Object>::from_ref(self))
                } else {
                    ::core::option::Option::None
                }
            }
        }
    };
}

/// Constructs an [`ObjectFactory`](crate::ObjectFactory) allocating from the given allocator,
/// tagging the allocation with a description and the current source location.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use fimo_refcount::{
///     impl_object, new_rc_obj, AllocatorRef, DefaultRawAllocator, ManagedObject, RcPtr,
/// };
///
/// struct Sampler {
///     base: ManagedObject,
/// }
///
/// impl_object!(Sampler, base);
///
/// let allocator: AllocatorRef = Arc::new(DefaultRawAllocator);
/// let sampler = new_rc_obj!(allocator, "Sampler")
///     .create(|base| Ok::<_, ()>(Sampler { base }))
///     .unwrap();
/// assert_eq!(RcPtr::strong_count(&sampler), 1);
/// ```
#[macro_export]
macro_rules! new_rc_obj {
    ($allocator:expr, $description:expr) => {
        $crate::ObjectFactory::with_allocator(
            $allocator,
            $crate::AllocationSite::new($description, ::core::file!(), ::core::line!()),
        )
    };
}
