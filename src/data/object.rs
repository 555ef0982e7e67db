//! Entity instances and identity resolution
//!
//! The decoder never constructs entity instances on its own: it asks an
//! [`IdentityMap`] for the instance owning a key, so that the same key always
//! resolves to the same shared object.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::value::Value;

/// A materialized entity instance
#[derive(Debug)]
pub struct EntityObject {
    entity: String,
    key: Vec<Value>,
    /// Loaded column values, keyed by column name
    values: RwLock<BTreeMap<String, Value>>,
}

impl EntityObject {
    pub fn new(entity: impl Into<String>, key: Vec<Value>) -> Self {
        Self {
            entity: entity.into(),
            key,
            values: RwLock::new(BTreeMap::new()),
        }
    }

    /// Entity type name
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Primary key values in key order
    pub fn key(&self) -> &[Value] {
        &self.key
    }

    /// Get a loaded column value, `None` when the column was never loaded
    pub fn get(&self, column: &str) -> Option<Value> {
        self.values.read().get(column).cloned()
    }

    pub fn set(&self, column: impl Into<String>, value: Value) {
        self.values.write().insert(column.into(), value);
    }

    /// Merge freshly loaded columns into the instance
    pub fn merge(&self, columns: impl IntoIterator<Item = (String, Value)>) {
        let mut values = self.values.write();
        for (column, value) in columns {
            values.insert(column, value);
        }
    }

    pub fn is_loaded(&self, column: &str) -> bool {
        self.values.read().contains_key(column)
    }
}

impl PartialEq for EntityObject {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.key == other.key
    }
}

impl Eq for EntityObject {}

impl std::fmt::Display for EntityObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[", self.entity)?;
        for (i, value) in self.key.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, "]")
    }
}

/// Lookup-or-create of entity instances by (entity, key)
pub trait IdentityMap: Send + Sync {
    fn resolve(&self, entity: &str, key: &[Value]) -> Arc<EntityObject>;
}

/// In-memory identity map backed by a concurrent hash map
#[derive(Debug, Default)]
pub struct EntityCache {
    objects: DashMap<(String, Vec<Value>), Arc<EntityObject>>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity: &str, key: &[Value]) -> Option<Arc<EntityObject>> {
        self.objects
            .get(&(entity.to_string(), key.to_vec()))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn clear(&self) {
        self.objects.clear();
    }
}

impl IdentityMap for EntityCache {
    fn resolve(&self, entity: &str, key: &[Value]) -> Arc<EntityObject> {
        self.objects
            .entry((entity.to_string(), key.to_vec()))
            .or_insert_with(|| Arc::new(EntityObject::new(entity, key.to_vec())))
            .value()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_same_instance() {
        let cache = EntityCache::new();
        let a = cache.resolve("Student", &[Value::Int64(1)]);
        let b = cache.resolve("Student", &[Value::Int64(1)]);
        let c = cache.resolve("Student", &[Value::Int64(2)]);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_entity_types_are_separate() {
        let cache = EntityCache::new();
        let group = cache.resolve("Group", &[Value::Int64(101)]);
        let dept = cache.resolve("Department", &[Value::Int64(101)]);
        assert!(!Arc::ptr_eq(&group, &dept));
    }

    #[test]
    fn test_merge_columns() {
        let obj = EntityObject::new("Student", vec![Value::Int64(1)]);
        assert!(!obj.is_loaded("name"));

        obj.merge(vec![
            ("name".to_string(), Value::from("John Smith")),
            ("tel".to_string(), Value::Null),
        ]);

        assert_eq!(obj.get("name"), Some(Value::from("John Smith")));
        assert_eq!(obj.get("tel"), Some(Value::Null));
        assert_eq!(obj.get("picture"), None);
        assert_eq!(obj.to_string(), "Student[1]");
    }
}
