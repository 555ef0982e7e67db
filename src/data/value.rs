use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// Core value types exchanged with the database and bound as parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Date(NaiveDate),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int64(_) => "int",
            Value::Float64(_) => "float",
            Value::String(_) => "str",
            Value::Date(_) => "date",
            Value::Bytes(_) => "bytes",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            Value::Bool(b) => Some(*b as i64),
            Value::Float64(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            Value::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int64(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Scalar kind of a non-null value
    pub fn kind(&self) -> Option<ScalarKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ScalarKind::Bool),
            Value::Int64(_) => Some(ScalarKind::Int),
            Value::Float64(_) => Some(ScalarKind::Float),
            Value::String(_) => Some(ScalarKind::Str),
            Value::Date(_) => Some(ScalarKind::Date),
            Value::Bytes(_) => Some(ScalarKind::Bytes),
        }
    }

    /// Extract a calendar component (`year`, `month`, `day`) from a date value
    pub fn date_part(&self, part: &str) -> Option<Value> {
        let date = self.as_date()?;
        match part {
            "year" => Some(Value::Int64(date.year() as i64)),
            "month" => Some(Value::Int64(date.month() as i64)),
            "day" => Some(Value::Int64(date.day() as i64)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            // Cross-type numeric comparisons
            (Value::Int64(a), Value::Float64(b)) => (*a as f64).to_bits() == b.to_bits(),
            (Value::Float64(a), Value::Int64(b)) => a.to_bits() == (*b as f64).to_bits(),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => b.hash(state),
            // Integral floats hash like their integer so that Int64(3) == Float64(3.0) holds
            Value::Int64(i) => (*i as f64).to_bits().hash(state),
            Value::Float64(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Date(d) => d.hash(state),
            Value::Bytes(b) => b.hash(state),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Float64(a), Value::Float64(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Int64(a), Value::Float64(b)) => {
                (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Value::Float64(a), Value::Int64(b)) => {
                a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal)
            }
            // Different types: order by type discriminant
            _ => self.type_order().cmp(&other.type_order()),
        }
    }
}

impl Value {
    /// Get a numeric order for type comparison
    fn type_order(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int64(_) | Value::Float64(_) => 2,
            Value::String(_) => 4,
            Value::Date(_) => 5,
            Value::Bytes(_) => 6,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int64(i) => write!(f, "{}", i),
            Value::Float64(v) => write!(f, "{:?}", v),
            Value::String(s) => write!(f, "'{}'", s.replace('\'', "\\'")),
            Value::Date(d) => write!(f, "date({}, {}, {})", d.year(), d.month(), d.day()),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int64(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Declared kind of a scalar attribute
///
/// `Str`, `Unicode` and `LongStr` are string subtypes: they share the `Str`
/// base kind for comparison purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    Int,
    Float,
    Str,
    Unicode,
    #[serde(rename = "longstr")]
    LongStr,
    Date,
    Bytes,
    Bool,
}

impl ScalarKind {
    /// Collapse string subtypes onto their base kind
    pub fn base(self) -> ScalarKind {
        match self {
            ScalarKind::Unicode | ScalarKind::LongStr => ScalarKind::Str,
            other => other,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ScalarKind::Int | ScalarKind::Float)
    }

    pub fn is_string(self) -> bool {
        self.base() == ScalarKind::Str
    }

    /// Determine the result kind when two numeric kinds meet in arithmetic
    pub fn merge(self, other: ScalarKind) -> ScalarKind {
        match (self.base(), other.base()) {
            (a, b) if a == b => a,
            (ScalarKind::Int, ScalarKind::Float) | (ScalarKind::Float, ScalarKind::Int) => {
                ScalarKind::Float
            }
            (a, _) => a,
        }
    }
}

impl std::fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarKind::Int => write!(f, "int"),
            ScalarKind::Float => write!(f, "float"),
            ScalarKind::Str => write!(f, "str"),
            ScalarKind::Unicode => write!(f, "unicode"),
            ScalarKind::LongStr => write!(f, "LongStr"),
            ScalarKind::Date => write!(f, "date"),
            ScalarKind::Bytes => write!(f, "bytes"),
            ScalarKind::Bool => write!(f, "bool"),
        }
    }
}
