//! Read-only row records and the tagged value sum they produce.

use std::sync::Arc;

use crate::core::PlexusError;

/// Logical type of a [`Value`], mapped onto wire types during schema
/// inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalType {
    Int32,
    Int64,
    Float32,
    Float64,
    Utf8,
    IntArray,
    LongArray,
    FloatArray,
    DoubleArray,
    List,
    Object,
}

/// A single row value. Closed type set; conversions fail with `TypeMismatch`
/// when the source type cannot represent the target.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Utf8(String),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    List(Vec<Value>),
    /// Catch-all for driver values the wire protocol cannot carry.
    Object(String),
}

impl Value {
    pub fn logical_type(&self) -> Option<LogicalType> {
        match self {
            Value::Null => None,
            Value::Int32(_) => Some(LogicalType::Int32),
            Value::Int64(_) => Some(LogicalType::Int64),
            Value::Float32(_) => Some(LogicalType::Float32),
            Value::Float64(_) => Some(LogicalType::Float64),
            Value::Utf8(_) => Some(LogicalType::Utf8),
            Value::IntArray(_) => Some(LogicalType::IntArray),
            Value::LongArray(_) => Some(LogicalType::LongArray),
            Value::FloatArray(_) => Some(LogicalType::FloatArray),
            Value::DoubleArray(_) => Some(LogicalType::DoubleArray),
            Value::List(_) => Some(LogicalType::List),
            Value::Object(_) => Some(LogicalType::Object),
        }
    }

    /// Arity: element count for array and list values, 1 otherwise.
    pub fn len(&self) -> usize {
        match self {
            Value::IntArray(v) => v.len(),
            Value::LongArray(v) => v.len(),
            Value::FloatArray(v) => v.len(),
            Value::DoubleArray(v) => v.len(),
            Value::List(v) => v.len(),
            _ => 1,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i32(&self) -> Result<i32, PlexusError> {
        match self {
            Value::Int32(v) => Ok(*v),
            Value::Int64(v) => i32::try_from(*v)
                .map_err(|_| mismatch("int32", &format!("int64 value {v} out of range"))),
            other => Err(mismatch("int32", type_name(other))),
        }
    }

    pub fn as_i64(&self) -> Result<i64, PlexusError> {
        match self {
            Value::Int32(v) => Ok(*v as i64),
            Value::Int64(v) => Ok(*v),
            other => Err(mismatch("int64", type_name(other))),
        }
    }

    pub fn as_f32(&self) -> Result<f32, PlexusError> {
        match self {
            Value::Float32(v) => Ok(*v),
            Value::Float64(v) => Ok(*v as f32),
            Value::Int32(v) => Ok(*v as f32),
            Value::Int64(v) => Ok(*v as f32),
            other => Err(mismatch("float32", type_name(other))),
        }
    }

    pub fn as_f64(&self) -> Result<f64, PlexusError> {
        match self {
            Value::Float32(v) => Ok(*v as f64),
            Value::Float64(v) => Ok(*v),
            Value::Int32(v) => Ok(*v as f64),
            Value::Int64(v) => Ok(*v as f64),
            other => Err(mismatch("float64", type_name(other))),
        }
    }

    pub fn as_str(&self) -> Result<&str, PlexusError> {
        match self {
            Value::Utf8(v) => Ok(v),
            other => Err(mismatch("utf8", type_name(other))),
        }
    }

    /// Elements of a variable-length list as `f64`. The variable-length wire
    /// path carries doubles only.
    pub fn as_f64_list(&self) -> Result<Vec<f64>, PlexusError> {
        match self {
            Value::DoubleArray(v) => Ok(v.clone()),
            Value::FloatArray(v) => Ok(v.iter().map(|f| *f as f64).collect()),
            Value::List(items) => items.iter().map(|v| v.as_f64()).collect(),
            other => Err(mismatch("list<float64>", type_name(other))),
        }
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Int32(_) => "int32",
        Value::Int64(_) => "int64",
        Value::Float32(_) => "float32",
        Value::Float64(_) => "float64",
        Value::Utf8(_) => "utf8",
        Value::IntArray(_) => "int32[]",
        Value::LongArray(_) => "int64[]",
        Value::FloatArray(_) => "float32[]",
        Value::DoubleArray(_) => "float64[]",
        Value::List(_) => "list",
        Value::Object(_) => "object",
    }
}

fn mismatch(expected: &str, actual: &str) -> PlexusError {
    PlexusError::TypeMismatch(format!("expected {expected}, got {actual}"))
}

/// Read-only view of one row. Implementations wrap driver-specific records;
/// not required to be thread-safe beyond `Send + Sync` — the producer
/// dispatches one row at a time per partition.
pub trait Row: Send + Sync {
    fn keys(&self) -> &[String];

    fn get(&self, index: usize) -> Option<Value>;

    fn get_named(&self, name: &str) -> Option<Value> {
        let index = self.keys().iter().position(|k| k == name)?;
        self.get(index)
    }
}

pub type BoxRow = Box<dyn Row>;

/// Concrete row over owned values, with field names shared across the
/// stream.
#[derive(Debug, Clone)]
pub struct ValueRow {
    keys: Arc<Vec<String>>,
    values: Vec<Value>,
}

impl ValueRow {
    pub fn new(keys: Arc<Vec<String>>, values: Vec<Value>) -> Self {
        debug_assert_eq!(keys.len(), values.len());
        ValueRow { keys, values }
    }

    /// Test/demo convenience constructor.
    pub fn from_pairs(pairs: Vec<(&str, Value)>) -> Self {
        let keys = Arc::new(pairs.iter().map(|(k, _)| k.to_string()).collect());
        let values = pairs.into_iter().map(|(_, v)| v).collect();
        ValueRow { keys, values }
    }
}

impl Row for ValueRow {
    fn keys(&self) -> &[String] {
        &self.keys
    }

    fn get(&self, index: usize) -> Option<Value> {
        self.values.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_conversions() {
        assert_eq!(Value::Int32(7).as_i64().unwrap(), 7);
        assert_eq!(Value::Int64(7).as_i32().unwrap(), 7);
        assert_eq!(Value::Int64(1).as_f64().unwrap(), 1.0);
        assert_eq!(Value::Float32(2.5).as_f64().unwrap(), 2.5);
        assert_eq!(Value::Utf8("a".into()).as_str().unwrap(), "a");
    }

    #[test]
    fn test_narrowing_out_of_range() {
        let err = Value::Int64(i64::MAX).as_i32().unwrap_err();
        assert!(matches!(err, PlexusError::TypeMismatch(_)));
    }

    #[test]
    fn test_incompatible_conversion_fails() {
        assert!(Value::Utf8("x".into()).as_i64().is_err());
        assert!(Value::Float64(1.0).as_str().is_err());
        assert!(Value::Object("node".into()).as_f64().is_err());
    }

    #[test]
    fn test_list_conversions() {
        let list = Value::List(vec![Value::Float64(1.0), Value::Int64(2)]);
        assert_eq!(list.as_f64_list().unwrap(), vec![1.0, 2.0]);
        assert_eq!(list.len(), 2);

        let bad = Value::List(vec![Value::Utf8("a".into())]);
        assert!(bad.as_f64_list().is_err());
    }

    #[test]
    fn test_arity() {
        assert_eq!(Value::Int64(1).len(), 1);
        assert_eq!(Value::DoubleArray(vec![1.0, 2.0, 3.0]).len(), 3);
    }

    #[test]
    fn test_value_row_access() {
        let row = ValueRow::from_pairs(vec![
            ("id", Value::Int64(42)),
            ("name", Value::Utf8("n".into())),
        ]);
        assert_eq!(row.keys(), &["id".to_string(), "name".to_string()]);
        assert_eq!(row.get(0), Some(Value::Int64(42)));
        assert_eq!(row.get_named("name"), Some(Value::Utf8("n".into())));
        assert_eq!(row.get_named("missing"), None);
        assert_eq!(row.get(5), None);
    }
}
