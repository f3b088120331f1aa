/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Type-keyed, immutable attribute bags attached to resolver updates,
//! endpoints and addresses.

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

// Values are compared structurally so that two updates carrying equal
// attributes compare equal regardless of where they were built.
trait AttributeValue: Any + Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
    fn eq_value(&self, other: &dyn AttributeValue) -> bool;
}

impl<T: Any + Send + Sync + Eq + Debug> AttributeValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_value(&self, other: &dyn AttributeValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }
}

#[derive(Clone, Debug)]
struct Value(Arc<dyn AttributeValue>);

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_value(other.0.as_ref())
    }
}

impl Eq for Value {}

/// A collection of attributes indexed by their type.
///
/// Attributes are persistent: `add` and `remove` return a new collection and
/// leave the original untouched.  Cloning is cheap.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct Attributes {
    map: Arc<BTreeMap<TypeId, Value>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new Attributes with `value` added, replacing any existing
    /// value of the same type.
    pub fn add<T: Send + Sync + Eq + Debug + 'static>(&self, value: T) -> Self {
        let mut map = (*self.map).clone();
        map.insert(TypeId::of::<T>(), Value(Arc::new(value)));
        Attributes { map: Arc::new(map) }
    }

    /// Gets a reference to the value of type T, if present.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|v| v.0.as_any().downcast_ref())
    }

    /// Returns a new Attributes without a value of type T.
    pub fn remove<T: 'static>(&self) -> Self {
        if !self.map.contains_key(&TypeId::of::<T>()) {
            return self.clone();
        }
        let mut map = (*self.map).clone();
        map.remove(&TypeId::of::<T>());
        Attributes { map: Arc::new(map) }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eq() {
        let a1 = Attributes::new().add(10i32);
        let a2 = a1.clone();
        let a3 = Attributes::new().add(10i32);

        assert_eq!(a1, a2);
        assert_eq!(a1, a3);

        let a4 = Attributes::new().add(10i32).add("foo".to_string());
        assert_ne!(a1, a4);
        assert_ne!(a1, Attributes::new().add(11i32));
    }

    #[test]
    fn test_get() {
        let attrs = Attributes::new().add(42i32).add("hello".to_string());

        assert_eq!(attrs.get::<i32>(), Some(&42));
        assert_eq!(attrs.get::<String>(), Some(&"hello".to_string()));
        assert_eq!(attrs.get::<bool>(), None);
    }

    #[test]
    fn test_remove_leaves_original() {
        let attrs = Attributes::new().add(10i32).add(20u32);
        let removed = attrs.remove::<i32>();

        assert_eq!(attrs.get::<i32>(), Some(&10));
        assert_eq!(removed.get::<i32>(), None);
        assert_eq!(removed.get::<u32>(), Some(&20));
        assert!(Attributes::new().remove::<i32>().is_empty());
    }

    #[test]
    fn test_overwrite() {
        let a1 = Attributes::new().add(10i32);
        let a2 = a1.add(20i32);

        assert_eq!(a1.get::<i32>(), Some(&10));
        assert_eq!(a2.get::<i32>(), Some(&20));
    }
}
