use std::any::{Any, TypeId, type_name};
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::CatalogError;

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = Arc<str>;

/// Type name reported for [`Data::null`].
pub const NULL_TYPE: &str = "null";

/// A single artifact value flowing between tasks.
///
/// The runner never looks inside a `Data`; it only moves it between the
/// catalog and task bodies. Cloning is cheap, the payload is shared. A `Data`
/// can also be *null*, which is what a task returns when it has nothing to
/// say. Catalogs refuse to persist null values.
#[derive(Clone)]
pub struct Data {
    value: Option<Dynamic>,
    type_name: &'static str,
}

impl Data {
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            value: Some(Arc::new(value)),
            type_name: type_name::<T>(),
        }
    }

    pub fn null() -> Self {
        Self {
            value: None,
            type_name: NULL_TYPE,
        }
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// Rust type name of the wrapped value, `"null"` for null data.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn value_type_id(&self) -> Option<TypeId> {
        self.value.as_deref().map(|value| {
            let value: &dyn Any = value;
            value.type_id()
        })
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.as_deref()?.downcast_ref::<T>()
    }

    /// Borrow the value as `T`, failing with a descriptive error when the
    /// artifact holds something else.
    pub fn get<T: Any>(&self) -> Result<&T, CatalogError> {
        self.downcast_ref::<T>()
            .ok_or_else(|| CatalogError::TypeMismatch {
                expected: type_name::<T>().to_string(),
                found: self.type_name.to_string(),
            })
    }
}

impl Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.value {
            Some(_) => write!(f, "Data<{}>", self.type_name),
            None => f.write_str("Data<null>"),
        }
    }
}
