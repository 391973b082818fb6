// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A type-erased, cheaply clonable datum flowing through the task graph.
///
/// Task functions accept and return `Value`s; the scheduler never inspects
/// the payload, it only moves it around. Cloning shares the underlying
/// allocation.
#[derive(Clone)]
pub struct Value(Arc<dyn Any + Send + Sync>);

impl Value {
    /// Wraps an arbitrary datum.
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self(Arc::new(value))
    }

    /// Borrows the payload as `T`, if that is what it is.
    #[must_use]
    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: Any,
    {
        self.0.downcast_ref()
    }

    /// Clones the payload out as `T`, if that is what it is.
    #[must_use]
    pub fn get<T>(&self) -> Option<T>
    where
        T: Any + Clone,
    {
        self.downcast_ref::<T>().cloned()
    }

    /// Whether the payload is a `T`.
    #[must_use]
    pub fn is<T>(&self) -> bool
    where
        T: Any,
    {
        self.0.is::<T>()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Value(..)")
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_to_stored_type() {
        let value = Value::new(42_i64);
        assert_eq!(value.downcast_ref::<i64>(), Some(&42));
        assert!(value.is::<i64>());
    }

    #[test]
    fn downcast_to_wrong_type_is_none() {
        let value = Value::new("text");
        assert_eq!(value.downcast_ref::<i64>(), None);
        assert!(!value.is::<i64>());
    }

    #[test]
    fn get_clones_payload() {
        let value = Value::new(vec![1_i32, 2, 3]);
        assert_eq!(value.get::<Vec<i32>>(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn clones_share_payload() {
        let value = Value::new(String::from("shared"));
        let clone = value.clone();
        assert_eq!(clone.downcast_ref::<String>(), value.downcast_ref::<String>());
    }
}
