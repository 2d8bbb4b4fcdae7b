//! Column batch builders.
//!
//! One tagged builder per supported wire type. `finish` hands the built
//! buffers away and leaves the builder empty and reusable; accounting
//! ownership of the produced chunk moves separately through
//! [`crate::memory::Reservation`].

use std::sync::Arc;

use arrow::array::{
    ArrayBuilder, ArrayRef, FixedSizeListBuilder, Float32Builder, Float64Builder, Int32Builder,
    Int64Builder, ListBuilder, StringBuilder,
};
use arrow::datatypes::{DataType, Field, FieldRef};

use crate::core::PlexusError;
use crate::record::{type_name, Value};

pub struct ColumnBuilder {
    name: String,
    nullable: bool,
    kind: BuilderKind,
}

enum BuilderKind {
    Int32(Int32Builder),
    Int64(Int64Builder),
    Float32(Float32Builder),
    Float64(Float64Builder),
    Utf8(StringBuilder),
    FixedSizeList(FixedListKind, i32),
    List(ListBuilder<Float64Builder>),
}

enum FixedListKind {
    Int32(FixedSizeListBuilder<Int32Builder>),
    Int64(FixedSizeListBuilder<Int64Builder>),
    Float32(FixedSizeListBuilder<Float32Builder>),
    Float64(FixedSizeListBuilder<Float64Builder>),
}

impl ColumnBuilder {
    pub fn for_field(field: &Field) -> Result<ColumnBuilder, PlexusError> {
        let kind = match field.data_type() {
            DataType::Int32 => BuilderKind::Int32(Int32Builder::new()),
            DataType::Int64 => BuilderKind::Int64(Int64Builder::new()),
            DataType::Float32 => BuilderKind::Float32(Float32Builder::new()),
            DataType::Float64 => BuilderKind::Float64(Float64Builder::new()),
            DataType::Utf8 => BuilderKind::Utf8(StringBuilder::new()),
            DataType::FixedSizeList(child, stride) => {
                BuilderKind::FixedSizeList(fixed_list_kind(child, *stride)?, *stride)
            }
            DataType::List(child) => match child.data_type() {
                DataType::Float64 => BuilderKind::List(
                    ListBuilder::new(Float64Builder::new()).with_field(child.clone()),
                ),
                other => {
                    return Err(PlexusError::InvalidArgument(format!(
                        "list field '{}' has unsupported element type {other}",
                        field.name()
                    )))
                }
            },
            other => {
                return Err(PlexusError::InvalidArgument(format!(
                    "unsupported column type {other} for field '{}'",
                    field.name()
                )))
            }
        };
        Ok(ColumnBuilder {
            name: field.name().clone(),
            nullable: field.is_nullable(),
            kind,
        })
    }

    /// Rows staged so far.
    pub fn len(&self) -> usize {
        match &self.kind {
            BuilderKind::Int32(b) => b.len(),
            BuilderKind::Int64(b) => b.len(),
            BuilderKind::Float32(b) => b.len(),
            BuilderKind::Float64(b) => b.len(),
            BuilderKind::Utf8(b) => b.len(),
            BuilderKind::FixedSizeList(kind, _) => match kind {
                FixedListKind::Int32(b) => b.len(),
                FixedListKind::Int64(b) => b.len(),
                FixedListKind::Float32(b) => b.len(),
                FixedListKind::Float64(b) => b.len(),
            },
            BuilderKind::List(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(&mut self, value: &Value) -> Result<(), PlexusError> {
        if value.is_null() {
            return self.append_null();
        }
        match &mut self.kind {
            BuilderKind::Int32(b) => b.append_value(value.as_i32()?),
            BuilderKind::Int64(b) => b.append_value(value.as_i64()?),
            BuilderKind::Float32(b) => b.append_value(value.as_f32()?),
            BuilderKind::Float64(b) => b.append_value(value.as_f64()?),
            BuilderKind::Utf8(b) => b.append_value(value.as_str()?),
            BuilderKind::FixedSizeList(kind, stride) => {
                if value.len() != *stride as usize {
                    return Err(PlexusError::InvalidArgument(format!(
                        "field '{}' expects lists of length {stride}, got {}",
                        self.name,
                        value.len()
                    )));
                }
                append_fixed_list(kind, value)?;
            }
            BuilderKind::List(b) => {
                for element in value.as_f64_list()? {
                    b.values().append_value(element);
                }
                b.append(true);
            }
        }
        Ok(())
    }

    pub fn append_null(&mut self) -> Result<(), PlexusError> {
        if !self.nullable {
            return Err(PlexusError::InvalidArgument(format!(
                "null value for non-nullable field '{}'",
                self.name
            )));
        }
        match &mut self.kind {
            BuilderKind::Int32(b) => b.append_null(),
            BuilderKind::Int64(b) => b.append_null(),
            BuilderKind::Float32(b) => b.append_null(),
            BuilderKind::Float64(b) => b.append_null(),
            BuilderKind::Utf8(b) => b.append_null(),
            BuilderKind::FixedSizeList(kind, stride) => {
                // A null fixed-size list still occupies stride child slots.
                match kind {
                    FixedListKind::Int32(b) => {
                        b.values().append_nulls(*stride as usize);
                        b.append(false);
                    }
                    FixedListKind::Int64(b) => {
                        b.values().append_nulls(*stride as usize);
                        b.append(false);
                    }
                    FixedListKind::Float32(b) => {
                        b.values().append_nulls(*stride as usize);
                        b.append(false);
                    }
                    FixedListKind::Float64(b) => {
                        b.values().append_nulls(*stride as usize);
                        b.append(false);
                    }
                }
            }
            BuilderKind::List(b) => b.append_null(),
        }
        Ok(())
    }

    /// Take the built chunk. The builder is left empty and may be reused for
    /// the next batch.
    pub fn finish(&mut self) -> ArrayRef {
        match &mut self.kind {
            BuilderKind::Int32(b) => Arc::new(b.finish()),
            BuilderKind::Int64(b) => Arc::new(b.finish()),
            BuilderKind::Float32(b) => Arc::new(b.finish()),
            BuilderKind::Float64(b) => Arc::new(b.finish()),
            BuilderKind::Utf8(b) => Arc::new(b.finish()),
            BuilderKind::FixedSizeList(kind, _) => match kind {
                FixedListKind::Int32(b) => Arc::new(b.finish()),
                FixedListKind::Int64(b) => Arc::new(b.finish()),
                FixedListKind::Float32(b) => Arc::new(b.finish()),
                FixedListKind::Float64(b) => Arc::new(b.finish()),
            },
            BuilderKind::List(b) => Arc::new(b.finish()),
        }
    }
}

fn fixed_list_kind(child: &FieldRef, stride: i32) -> Result<FixedListKind, PlexusError> {
    let kind = match child.data_type() {
        DataType::Int32 => FixedListKind::Int32(
            FixedSizeListBuilder::new(Int32Builder::new(), stride).with_field(child.clone()),
        ),
        DataType::Int64 => FixedListKind::Int64(
            FixedSizeListBuilder::new(Int64Builder::new(), stride).with_field(child.clone()),
        ),
        DataType::Float32 => FixedListKind::Float32(
            FixedSizeListBuilder::new(Float32Builder::new(), stride).with_field(child.clone()),
        ),
        DataType::Float64 => FixedListKind::Float64(
            FixedSizeListBuilder::new(Float64Builder::new(), stride).with_field(child.clone()),
        ),
        other => {
            return Err(PlexusError::InvalidArgument(format!(
                "unsupported fixed-size list element type {other}"
            )))
        }
    };
    Ok(kind)
}

fn append_fixed_list(kind: &mut FixedListKind, value: &Value) -> Result<(), PlexusError> {
    match (kind, value) {
        (FixedListKind::Int32(b), Value::IntArray(items)) => {
            for item in items {
                b.values().append_value(*item);
            }
            b.append(true);
        }
        (FixedListKind::Int64(b), Value::LongArray(items)) => {
            for item in items {
                b.values().append_value(*item);
            }
            b.append(true);
        }
        (FixedListKind::Float32(b), Value::FloatArray(items)) => {
            for item in items {
                b.values().append_value(*item);
            }
            b.append(true);
        }
        (FixedListKind::Float64(b), Value::DoubleArray(items)) => {
            for item in items {
                b.values().append_value(*item);
            }
            b.append(true);
        }
        (_, other) => {
            return Err(PlexusError::InvalidArgument(format!(
                "invalid array type {}",
                type_name(other)
            )))
        }
    }
    Ok(())
}

/// Map a sample row value to its wire type. Array values become fixed-size
/// lists whose stride is the sample's length.
pub fn arrow_type_of(value: &Value) -> Result<DataType, PlexusError> {
    let item = |dt: DataType| Arc::new(Field::new("item", dt, true));
    match value {
        Value::Int32(_) => Ok(DataType::Int32),
        Value::Int64(_) => Ok(DataType::Int64),
        Value::Float32(_) => Ok(DataType::Float32),
        Value::Float64(_) => Ok(DataType::Float64),
        Value::Utf8(_) => Ok(DataType::Utf8),
        Value::IntArray(v) => Ok(DataType::FixedSizeList(item(DataType::Int32), v.len() as i32)),
        Value::LongArray(v) => Ok(DataType::FixedSizeList(item(DataType::Int64), v.len() as i32)),
        Value::FloatArray(v) => {
            Ok(DataType::FixedSizeList(item(DataType::Float32), v.len() as i32))
        }
        Value::DoubleArray(v) => {
            Ok(DataType::FixedSizeList(item(DataType::Float64), v.len() as i32))
        }
        Value::List(_) => Ok(DataType::List(item(DataType::Float64))),
        other => Err(PlexusError::InvalidArgument(format!(
            "unsupported value type {}",
            type_name(other)
        ))),
    }
}

/// Rough per-row byte footprint of a field, used to size the initial
/// partition reservation before any data lands.
pub fn estimated_row_bytes(field: &Field) -> u64 {
    fn width(dt: &DataType) -> u64 {
        match dt {
            DataType::Int32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Float64 => 8,
            // offset slot plus a modest payload guess
            DataType::Utf8 => 24,
            _ => 8,
        }
    }
    match field.data_type() {
        DataType::FixedSizeList(child, stride) => width(child.data_type()) * (*stride as u64),
        DataType::List(child) => 4 + width(child.data_type()) * 8,
        other => width(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{
        Array, FixedSizeListArray, Float64Array, Int64Array, ListArray, StringArray,
    };

    fn field(name: &str, dt: DataType) -> Field {
        Field::new(name, dt, true)
    }

    #[test]
    fn test_primitive_round_trip() {
        let mut builder = ColumnBuilder::for_field(&field("id", DataType::Int64)).unwrap();
        builder.append(&Value::Int64(1)).unwrap();
        builder.append(&Value::Int64(2)).unwrap();
        builder.append(&Value::Null).unwrap();
        assert_eq!(builder.len(), 3);

        let array = builder.finish();
        let ints = array.as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(ints.value(0), 1);
        assert_eq!(ints.value(1), 2);
        assert!(ints.is_null(2));
    }

    #[test]
    fn test_utf8_round_trip() {
        let mut builder = ColumnBuilder::for_field(&field("name", DataType::Utf8)).unwrap();
        builder.append(&Value::Utf8("héllo".into())).unwrap();
        let array = builder.finish();
        let strings = array.as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(strings.value(0), "héllo");
    }

    #[test]
    fn test_builder_reusable_after_finish() {
        let mut builder = ColumnBuilder::for_field(&field("x", DataType::Float64)).unwrap();
        builder.append(&Value::Float64(1.0)).unwrap();
        let first = builder.finish();
        assert_eq!(first.len(), 1);
        assert_eq!(builder.len(), 0);

        builder.append(&Value::Float64(2.0)).unwrap();
        let second = builder.finish();
        let floats = second.as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(floats.value(0), 2.0);
    }

    #[test]
    fn test_fixed_size_list_round_trip() {
        let dt = DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float64, true)), 3);
        let mut builder = ColumnBuilder::for_field(&field("vec", dt)).unwrap();
        builder
            .append(&Value::DoubleArray(vec![1.0, 2.0, 3.0]))
            .unwrap();
        let array = builder.finish();
        let lists = array.as_any().downcast_ref::<FixedSizeListArray>().unwrap();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists.value_length(), 3);
        let values = lists.value(0);
        let floats = values.as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(floats.value(2), 3.0);
    }

    #[test]
    fn test_fixed_size_list_stride_violation() {
        let dt = DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float64, true)), 3);
        let mut builder = ColumnBuilder::for_field(&field("vec", dt)).unwrap();
        let err = builder
            .append(&Value::DoubleArray(vec![1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(err, PlexusError::InvalidArgument(_)));
    }

    #[test]
    fn test_fixed_size_list_wrong_element_type() {
        let dt = DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Int64, true)), 2);
        let mut builder = ColumnBuilder::for_field(&field("vec", dt)).unwrap();
        let err = builder
            .append(&Value::DoubleArray(vec![1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(err, PlexusError::InvalidArgument(_)));
    }

    #[test]
    fn test_variable_list_is_float64_only() {
        let list_f64 = DataType::List(Arc::new(Field::new("item", DataType::Float64, true)));
        let mut builder = ColumnBuilder::for_field(&field("xs", list_f64)).unwrap();
        builder
            .append(&Value::List(vec![Value::Float64(0.5), Value::Int64(2)]))
            .unwrap();
        let array = builder.finish();
        let lists = array.as_any().downcast_ref::<ListArray>().unwrap();
        let values = lists.value(0);
        let floats = values.as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(floats.value(1), 2.0);

        let list_utf8 = DataType::List(Arc::new(Field::new("item", DataType::Utf8, true)));
        assert!(ColumnBuilder::for_field(&field("bad", list_utf8)).is_err());
    }

    #[test]
    fn test_null_on_non_nullable_field() {
        let strict = Field::new("id", DataType::Int64, false);
        let mut builder = ColumnBuilder::for_field(&strict).unwrap();
        let err = builder.append(&Value::Null).unwrap_err();
        assert!(matches!(err, PlexusError::InvalidArgument(_)));
    }

    #[test]
    fn test_arrow_type_of_samples() {
        assert_eq!(arrow_type_of(&Value::Int64(1)).unwrap(), DataType::Int64);
        assert_eq!(
            arrow_type_of(&Value::FloatArray(vec![0.0; 4])).unwrap(),
            DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), 4)
        );
        assert!(arrow_type_of(&Value::Object("point".into())).is_err());
        assert!(arrow_type_of(&Value::Null).is_err());
    }
}
