//! Result decoding
//!
//! A plan carries one [`Decoder`] per result position. Decoders read their
//! columns from a raw row, coerce them to the declared kind and resolve
//! entity positions through the caller's [`IdentityMap`].

use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::data::{EntityObject, IdentityMap, ScalarKind, Value};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("row has {found} columns, plan expects {expected}")]
    RowWidth { expected: usize, found: usize },

    #[error("column {index}: cannot decode {found} value as {kind}")]
    Mismatch {
        index: usize,
        kind: ScalarKind,
        found: &'static str,
    },

    #[error("column {index}: invalid date '{text}'")]
    InvalidDate { index: usize, text: String },
}

/// One column of an entity position
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDecoder {
    pub column: String,
    pub index: usize,
    pub kind: ScalarKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decoder {
    Scalar {
        index: usize,
        kind: ScalarKind,
    },
    /// Key columns first; `columns` holds the eager attribute columns
    Entity {
        entity: String,
        key: Vec<ColumnDecoder>,
        columns: Vec<ColumnDecoder>,
    },
}

impl Decoder {
    /// Number of raw columns consumed
    pub fn width(&self) -> usize {
        match self {
            Decoder::Scalar { .. } => 1,
            Decoder::Entity { key, columns, .. } => key.len() + columns.len(),
        }
    }

    fn last_index(&self) -> usize {
        match self {
            Decoder::Scalar { index, .. } => *index,
            Decoder::Entity { key, columns, .. } => key
                .iter()
                .chain(columns)
                .map(|c| c.index)
                .max()
                .unwrap_or(0),
        }
    }

    pub fn decode(&self, row: &[Value], identity: &dyn IdentityMap) -> Result<Decoded, DecodeError> {
        match self {
            Decoder::Scalar { index, kind } => {
                Ok(Decoded::Value(coerce(cell(row, *index)?, *kind, *index)?))
            }
            Decoder::Entity {
                entity,
                key,
                columns,
            } => {
                let key_values = key
                    .iter()
                    .map(|c| coerce(cell(row, c.index)?, c.kind, c.index))
                    .collect::<Result<Vec<_>, _>>()?;

                let nulls = key_values.iter().filter(|v| v.is_null()).count();
                if nulls == key_values.len() {
                    return Ok(Decoded::Value(Value::Null));
                }
                if nulls > 0 {
                    tracing::warn!(entity = %entity, ?key_values, "partially null entity key");
                    return Ok(Decoded::Value(Value::Null));
                }

                let obj = identity.resolve(entity, &key_values);
                let loaded = columns
                    .iter()
                    .map(|c| Ok((c.column.clone(), coerce(cell(row, c.index)?, c.kind, c.index)?)))
                    .collect::<Result<Vec<_>, DecodeError>>()?;
                obj.merge(loaded);
                Ok(Decoded::Entity(obj))
            }
        }
    }
}

fn cell(row: &[Value], index: usize) -> Result<Value, DecodeError> {
    row.get(index).cloned().ok_or(DecodeError::RowWidth {
        expected: index + 1,
        found: row.len(),
    })
}

/// Coerce a raw value to the declared kind
pub fn coerce(value: Value, kind: ScalarKind, index: usize) -> Result<Value, DecodeError> {
    let mismatch = |value: &Value| DecodeError::Mismatch {
        index,
        kind,
        found: value.type_name(),
    };

    match (kind, value) {
        (_, Value::Null) => Ok(Value::Null),
        (ScalarKind::Int, Value::Int64(i)) => Ok(Value::Int64(i)),
        (ScalarKind::Int, Value::Bool(b)) => Ok(Value::Int64(b as i64)),
        (ScalarKind::Int, Value::Float64(f)) if f.fract() == 0.0 => Ok(Value::Int64(f as i64)),
        (ScalarKind::Float, Value::Float64(f)) => Ok(Value::Float64(f)),
        (ScalarKind::Float, Value::Int64(i)) => Ok(Value::Float64(i as f64)),
        (ScalarKind::Str | ScalarKind::Unicode | ScalarKind::LongStr, Value::String(s)) => {
            Ok(Value::String(s))
        }
        (ScalarKind::Date, Value::Date(d)) => Ok(Value::Date(d)),
        (ScalarKind::Date, Value::String(text)) => {
            let date_part = text.get(..10).unwrap_or(&text);
            NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|_| DecodeError::InvalidDate { index, text })
        }
        (ScalarKind::Bytes, Value::Bytes(b)) => Ok(Value::Bytes(b)),
        (ScalarKind::Bytes, Value::String(s)) => Ok(Value::Bytes(s.into_bytes())),
        (ScalarKind::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
        (ScalarKind::Bool, Value::Int64(i)) => Ok(Value::Bool(i != 0)),
        (_, other) => Err(mismatch(&other)),
    }
}

/// Decode a raw row into the plan's result shape
pub fn decode_row(
    decoders: &[Decoder],
    tuple: bool,
    row: &[Value],
    identity: &dyn IdentityMap,
) -> Result<Decoded, DecodeError> {
    let expected = decoders.iter().map(|d| d.last_index() + 1).max().unwrap_or(0);
    if row.len() < expected {
        return Err(DecodeError::RowWidth {
            expected,
            found: row.len(),
        });
    }

    let mut items = decoders
        .iter()
        .map(|d| d.decode(row, identity))
        .collect::<Result<Vec<_>, _>>()?;

    if tuple || items.len() != 1 {
        Ok(Decoded::Tuple(items))
    } else {
        Ok(items.remove(0))
    }
}

/// A materialized result item
#[derive(Debug, Clone)]
pub enum Decoded {
    Value(Value),
    Entity(Arc<EntityObject>),
    Tuple(Vec<Decoded>),
}

impl Decoded {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Decoded::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Arc<EntityObject>> {
        match self {
            Decoded::Entity(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Decoded]> {
        match self {
            Decoded::Tuple(items) => Some(items),
            _ => None,
        }
    }
}

impl PartialEq for Decoded {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Decoded::Value(a), Decoded::Value(b)) => a == b,
            (Decoded::Entity(a), Decoded::Entity(b)) => Arc::ptr_eq(a, b) || a == b,
            (Decoded::Tuple(a), Decoded::Tuple(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Value> for Decoded {
    fn from(value: Value) -> Self {
        Decoded::Value(value)
    }
}

impl fmt::Display for Decoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decoded::Value(v) => write!(f, "{}", v),
            Decoded::Entity(obj) => write!(f, "{}", obj),
            Decoded::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::EntityCache;

    fn student_decoder() -> Decoder {
        Decoder::Entity {
            entity: "Student".to_string(),
            key: vec![ColumnDecoder {
                column: "id".to_string(),
                index: 0,
                kind: ScalarKind::Int,
            }],
            columns: vec![
                ColumnDecoder {
                    column: "name".to_string(),
                    index: 1,
                    kind: ScalarKind::Unicode,
                },
                ColumnDecoder {
                    column: "dob".to_string(),
                    index: 2,
                    kind: ScalarKind::Date,
                },
            ],
        }
    }

    #[test]
    fn test_coerce() {
        assert_eq!(coerce(Value::Int64(1), ScalarKind::Bool, 0).unwrap(), Value::Bool(true));
        assert_eq!(coerce(Value::Int64(3), ScalarKind::Float, 0).unwrap(), Value::Float64(3.0));
        assert_eq!(
            coerce(Value::from("1991-03-20"), ScalarKind::Date, 0).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(1991, 3, 20).unwrap())
        );
        assert_eq!(coerce(Value::Null, ScalarKind::Int, 0).unwrap(), Value::Null);
        assert!(coerce(Value::from("x"), ScalarKind::Int, 2).is_err());
        assert!(matches!(
            coerce(Value::from("March"), ScalarKind::Date, 1),
            Err(DecodeError::InvalidDate { index: 1, .. })
        ));
    }

    #[test]
    fn test_entities_share_identity() {
        let cache = EntityCache::new();
        let decoder = student_decoder();
        let row = vec![Value::Int64(1), Value::from("John Smith"), Value::from("1991-03-20")];

        let a = decoder.decode(&row, &cache).unwrap();
        let b = decoder.decode(&row, &cache).unwrap();
        let (a, b) = (a.as_entity().unwrap(), b.as_entity().unwrap());
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(a.get("name"), Some(Value::from("John Smith")));
        assert_eq!(a.to_string(), "Student[1]");
    }

    #[test]
    fn test_null_key_decodes_to_none() {
        let cache = EntityCache::new();
        let row = vec![Value::Null, Value::Null, Value::Null];
        let decoded = student_decoder().decode(&row, &cache).unwrap();
        assert_eq!(decoded, Decoded::Value(Value::Null));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_decode_tuple_row() {
        let cache = EntityCache::new();
        let decoders = vec![
            Decoder::Scalar {
                index: 0,
                kind: ScalarKind::Unicode,
            },
            Decoder::Scalar {
                index: 1,
                kind: ScalarKind::Int,
            },
        ];
        let row = vec![Value::from("Jing Xia"), Value::Int64(102)];
        let decoded = decode_row(&decoders, true, &row, &cache).unwrap();
        assert_eq!(decoded.to_string(), "('Jing Xia', 102)");

        let err = decode_row(&decoders, true, &row[..1], &cache).unwrap_err();
        assert_eq!(err, DecodeError::RowWidth { expected: 2, found: 1 });
    }
}
