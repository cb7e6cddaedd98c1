//! Error types.
use crate::object::InterfaceId;
use thiserror::Error;

/// Failure of a capability query.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryError {
    /// The object is gone, is being torn down, or was never constructed.
    #[error("the object has been destroyed")]
    ObjectDestroyed,
    /// The object is alive, but does not implement the requested interface.
    #[error("the object does not support the interface {0}")]
    NotSupported(InterfaceId),
    /// The object implements the requested interface, but is not of the requested type.
    #[error("the object providing the interface {0} is not of the requested type")]
    TypeMismatch(InterfaceId),
}
