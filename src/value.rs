//! Type-erased values held by observers.
//!
//! The graph does not care what an observer stores; it only needs to compare
//! two values structurally (equality short-circuit, selectors) and hand them
//! back out to typed code. [`Observable`] is implemented for every
//! `PartialEq + Debug + Send + Sync + 'static` type, so any such `T` can be
//! stored as an [`ObservedValue`].

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// A value that can live inside an observer.
pub trait Observable: Any + Debug + Send + Sync {
    /// Upcast for downcasting back to the concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Structural equality across the type-erased boundary.
    ///
    /// Values of different concrete types are never equal.
    fn dyn_eq(&self, other: &dyn Observable) -> bool;
}

impl<T> Observable for T
where
    T: Any + PartialEq + Debug + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn Observable) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }
}

impl dyn Observable {
    /// Borrow the value as `T` if that is its concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Whether the concrete type is `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Shared, immutable, type-erased value.
pub type ObservedValue = Arc<dyn Observable>;

/// Wrap a concrete value.
pub fn observed<T: Observable>(value: T) -> ObservedValue {
    Arc::new(value)
}

/// Structural equality of two optional values. `None == None`.
pub fn values_equal(a: Option<&ObservedValue>, b: Option<&ObservedValue>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a.dyn_eq(&**b),
        _ => false,
    }
}
