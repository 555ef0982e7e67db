//! Compiled plans and external parameter specs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::decoder::{decode_row, DecodeError, Decoded, Decoder};
use super::sql::Select;
use crate::data::{Bindings, Bound, EntityObject, IdentityMap, Value};
use crate::query::ast::QueryId;
use crate::schema::{AttrKind, SchemaProvider};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamError {
    #[error("parameter '{0}' is not bound")]
    Unbound(String),

    #[error("cannot evaluate parameter {param}: {reason}")]
    Unresolvable { param: String, reason: String },
}

/// An external parameter: a bound name, an attribute path evaluated on the
/// bound value and an optional key component
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ParamSpec {
    pub name: String,
    pub path: Vec<String>,
    pub component: Option<usize>,
}

/// Intermediate state while walking a parameter path
enum Step {
    Value(Value),
    Object(Arc<EntityObject>),
    Keys { entity: String, key: Vec<Value> },
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, path: Vec<String>) -> Self {
        Self {
            name: name.into(),
            path,
            component: None,
        }
    }

    pub fn extend(&self, attribute: &str) -> Self {
        let mut path = self.path.clone();
        path.push(attribute.to_string());
        Self {
            name: self.name.clone(),
            path,
            component: None,
        }
    }

    pub fn with_component(&self, component: usize) -> Self {
        Self {
            component: Some(component),
            ..self.clone()
        }
    }

    /// Evaluate against the bindings of one execution
    pub fn resolve(
        &self,
        bindings: &Bindings,
        schema: &dyn SchemaProvider,
    ) -> Result<Value, ParamError> {
        let unresolvable = |reason: String| ParamError::Unresolvable {
            param: self.to_string(),
            reason,
        };

        let mut current = match bindings.get(&self.name) {
            Some(Bound::Value(value)) => Step::Value(value.clone()),
            Some(Bound::Entity(obj)) => Step::Object(obj.clone()),
            None => return Err(ParamError::Unbound(self.name.clone())),
        };

        for attribute in &self.path {
            current = match current {
                Step::Value(value) => Step::Value(value.date_part(attribute).ok_or_else(|| {
                    unresolvable(format!("{} value has no attribute '{}'", value.type_name(), attribute))
                })?),
                Step::Object(obj) => {
                    let entity = schema
                        .entity(obj.entity())
                        .map_err(|e| unresolvable(e.to_string()))?;
                    let attr = entity.attribute(attribute).ok_or_else(|| {
                        unresolvable(format!("entity '{}' has no attribute '{}'", obj.entity(), attribute))
                    })?;
                    let not_loaded = || unresolvable(format!("{}.{} is not loaded", obj, attribute));

                    if let Some(pos) = entity.key_position(attribute) {
                        Step::Value(obj.key()[pos].clone())
                    } else {
                        match &attr.kind {
                            AttrKind::Scalar(_) => {
                                Step::Value(obj.get(&attr.columns[0]).ok_or_else(not_loaded)?)
                            }
                            AttrKind::Reference { target, .. } => Step::Keys {
                                entity: target.clone(),
                                key: attr
                                    .columns
                                    .iter()
                                    .map(|c| obj.get(c))
                                    .collect::<Option<Vec<_>>>()
                                    .ok_or_else(not_loaded)?,
                            },
                            AttrKind::Collection { .. } => {
                                return Err(unresolvable(format!("'{}' is a collection", attribute)))
                            }
                        }
                    }
                }
                Step::Keys { entity, key } => {
                    let target = schema
                        .entity(&entity)
                        .map_err(|e| unresolvable(e.to_string()))?;
                    match target.key_position(attribute) {
                        Some(pos) => Step::Value(key[pos].clone()),
                        None => {
                            return Err(unresolvable(format!(
                                "only key attributes of a referenced {} are available",
                                entity
                            )))
                        }
                    }
                }
            };
        }

        let key = match current {
            Step::Value(value) if self.component.is_none() => return Ok(value),
            Step::Value(value) => {
                return Err(unresolvable(format!("{} value has no key", value.type_name())))
            }
            Step::Object(obj) => obj.key().to_vec(),
            Step::Keys { key, .. } => key,
        };
        match self.component {
            Some(i) => key.get(i).cloned(),
            None if key.len() == 1 => key.into_iter().next(),
            None => None,
        }
        .ok_or_else(|| unresolvable("key component out of range".to_string()))
    }
}

impl fmt::Display for ParamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for attribute in &self.path {
            write!(f, ".{}", attribute)?;
        }
        if let Some(component) = self.component {
            write!(f, "[{}]", component)?;
        }
        Ok(())
    }
}

/// How duplicates are treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistinctMode {
    /// `DISTINCT` exactly when the key-uniqueness analysis says rows may repeat
    #[default]
    Auto,
    Distinct,
    WithoutDistinct,
}

impl FromStr for DistinctMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(DistinctMode::Auto),
            "on" | "distinct" => Ok(DistinctMode::Distinct),
            "off" | "without_distinct" => Ok(DistinctMode::WithoutDistinct),
            other => Err(format!("unknown distinct mode '{}'", other)),
        }
    }
}

/// What a plan returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanShape {
    Rows,
    /// `SELECT COUNT(*) FROM (<rows>)`
    Count,
    /// `SELECT EXISTS (<rows>)`
    Exists,
}

/// Immutable result of compiling a query tree
#[derive(Debug, Clone, Serialize)]
pub struct CompiledPlan {
    pub query: QueryId,
    pub mode: DistinctMode,
    pub shape: PlanShape,
    pub sql: String,
    pub params: Vec<ParamSpec>,
    pub distinct: bool,
    /// Rendered projection columns
    pub columns: Vec<String>,
    pub decoders: Vec<Decoder>,
    /// Result rows are tuples
    pub tuple: bool,
    /// Projection expression text per result position
    pub positions: Vec<String>,
    #[serde(skip)]
    pub select: Select,
}

impl CompiledPlan {
    /// Parameter values in placeholder order
    pub fn bind(
        &self,
        bindings: &Bindings,
        schema: &dyn SchemaProvider,
    ) -> Result<Vec<Value>, ParamError> {
        self.params
            .iter()
            .map(|spec| spec.resolve(bindings, schema))
            .collect()
    }

    pub fn decode(&self, row: &[Value], identity: &dyn IdentityMap) -> Result<Decoded, DecodeError> {
        decode_row(&self.decoders, self.tuple, row, identity)
    }
}
