use std::collections::BTreeMap;
use std::sync::Arc;

use super::object::EntityObject;
use super::value::{ScalarKind, Value};

/// A value bound to a free name of a query
#[derive(Debug, Clone)]
pub enum Bound {
    Value(Value),
    Entity(Arc<EntityObject>),
}

/// Kind of a bound value, snapshotted at compile time
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub enum BoundKind {
    Null,
    Scalar(ScalarKind),
    Entity(String),
}

impl Bound {
    pub fn kind(&self) -> BoundKind {
        match self {
            Bound::Value(value) => match value.kind() {
                Some(kind) => BoundKind::Scalar(kind),
                None => BoundKind::Null,
            },
            Bound::Entity(obj) => BoundKind::Entity(obj.entity().to_string()),
        }
    }
}

impl From<Value> for Bound {
    fn from(value: Value) -> Self {
        Bound::Value(value)
    }
}

impl From<Arc<EntityObject>> for Bound {
    fn from(obj: Arc<EntityObject>) -> Self {
        Bound::Entity(obj)
    }
}

impl From<&str> for Bound {
    fn from(value: &str) -> Self {
        Bound::Value(Value::from(value))
    }
}

impl From<i64> for Bound {
    fn from(value: i64) -> Self {
        Bound::Value(Value::Int64(value))
    }
}

/// External parameter bindings: free name -> bound value
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    values: BTreeMap<String, Bound>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Bound>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Bound>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Bound> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Kind signature of the bindings used by a query, in name order
    pub fn signature<'a>(
        &self,
        names: impl IntoIterator<Item = &'a String>,
    ) -> Vec<(String, BoundKind)> {
        let mut signature: Vec<(String, BoundKind)> = names
            .into_iter()
            .filter_map(|name| self.values.get(name).map(|b| (name.clone(), b.kind())))
            .collect();
        signature.sort();
        signature
    }
}
