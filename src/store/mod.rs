//! Write-side sink: an append-only collection of transferred column chunks
//! with random access by absolute row index across unequal tail chunks.

use arrow::array::{
    Array, ArrayRef, FixedSizeListArray, Float32Array, Float64Array, Int32Array, Int64Array,
    ListArray, StringArray,
};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use log::debug;

use crate::core::PlexusError;
use crate::memory::{Allocator, Reservation};
use crate::record::Value;

struct BatchedColumn {
    chunks: Vec<ArrayRef>,
    reservations: Vec<Reservation>,
    /// Index of the first non-full chunk, or `chunks.len()` when all full.
    watermark: usize,
}

pub struct BatchStore {
    schema: SchemaRef,
    allocator: Allocator,
    columns: Vec<BatchedColumn>,
    row_count: usize,
    /// Fixed by the first append; later appends may be smaller, never larger.
    max_batch_size: usize,
    closed: bool,
}

impl BatchStore {
    pub fn new(schema: SchemaRef, parent: &Allocator, name: &str, cap: u64) -> BatchStore {
        let columns = schema
            .fields()
            .iter()
            .map(|_| BatchedColumn {
                chunks: Vec::new(),
                reservations: Vec::new(),
                watermark: 0,
            })
            .collect();
        BatchStore {
            schema,
            allocator: parent.child(format!("batch-store-{name}"), cap),
            columns,
            row_count: 0,
            max_batch_size: 0,
            closed: false,
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.schema.index_of(name).ok()
    }

    /// Transfer every column of `batch` into the store.
    pub fn append_batch(&mut self, batch: &RecordBatch) -> Result<(), PlexusError> {
        if self.closed {
            return Err(PlexusError::Internal("store used after close".into()));
        }
        let rows = batch.num_rows();
        if rows == 0 {
            return Ok(());
        }
        if self.max_batch_size > 0 && rows > self.max_batch_size {
            return Err(PlexusError::BatchTooLarge(format!(
                "incoming batch of {rows} rows exceeds first-seen batch size {}",
                self.max_batch_size
            )));
        }
        for (index, field) in self.schema.fields().iter().enumerate() {
            let incoming = batch.schema();
            let incoming_field = incoming.field(index);
            if incoming_field.data_type() != field.data_type() {
                return Err(PlexusError::TypeMismatch(format!(
                    "field '{}' expects {}, batch carries {}",
                    field.name(),
                    field.data_type(),
                    incoming_field.data_type()
                )));
            }
        }
        if self.max_batch_size == 0 {
            self.max_batch_size = rows;
        }

        for (index, column) in self.columns.iter_mut().enumerate() {
            let chunk = batch.column(index).clone();
            let reservation = self
                .allocator
                .reserve(chunk.get_array_memory_size() as u64)?;
            column.chunks.push(chunk);
            column.reservations.push(reservation);
            column.watermark = column
                .chunks
                .iter()
                .position(|c| c.len() < self.max_batch_size)
                .unwrap_or(column.chunks.len());
        }
        self.row_count += rows;
        debug!("store row count now {}", self.row_count);
        Ok(())
    }

    /// Logical value at global row `index` of field `field`.
    ///
    /// Chunks at or past the watermark may be shorter than the batch size, so
    /// the lookup degrades from O(1) division to a bounded forward scan.
    pub fn get_by_index(&self, field: usize, index: usize) -> Result<Value, PlexusError> {
        let column = self.columns.get(field).ok_or_else(|| {
            PlexusError::InvalidArgument(format!("field index {field} out of range"))
        })?;
        if index >= self.row_count {
            return Err(PlexusError::InvalidArgument(format!(
                "row index {index} out of range (row count {})",
                self.row_count
            )));
        }

        let chunk_index = index / self.max_batch_size;
        if chunk_index < column.watermark {
            return value_at(&column.chunks[chunk_index], index % self.max_batch_size);
        }

        let mut position = column.watermark * self.max_batch_size;
        for chunk in &column.chunks[column.watermark..] {
            if index - position < chunk.len() {
                return value_at(chunk, index - position);
            }
            position += chunk.len();
        }
        Err(PlexusError::InvalidArgument(format!(
            "row index {index} out of range (row count {})",
            self.row_count
        )))
    }

    pub fn get_i64(&self, field: usize, index: usize) -> Result<i64, PlexusError> {
        self.get_by_index(field, index)?.as_i64()
    }

    pub fn get_str(&self, field: usize, index: usize) -> Result<String, PlexusError> {
        Ok(self.get_by_index(field, index)?.as_str()?.to_string())
    }

    pub fn get_string_list(&self, field: usize, index: usize) -> Result<Vec<String>, PlexusError> {
        match self.get_by_index(field, index)? {
            Value::List(items) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect(),
            other => Err(PlexusError::TypeMismatch(format!(
                "expected list<utf8>, got {}",
                crate::record::type_name(&other)
            ))),
        }
    }

    pub fn get_f64_list(&self, field: usize, index: usize) -> Result<Vec<f64>, PlexusError> {
        self.get_by_index(field, index)?.as_f64_list()
    }

    /// Watermark of one field, exposed for invariant checks.
    pub fn watermark(&self, field: usize) -> Option<usize> {
        self.columns.get(field).map(|c| c.watermark)
    }

    /// Release every chunk, then the allocator. Safe to call twice.
    pub fn close(&mut self) -> Result<(), PlexusError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for column in &mut self.columns {
            column.chunks.clear();
            column.reservations.clear();
        }
        self.allocator.close()
    }
}

fn value_at(chunk: &ArrayRef, offset: usize) -> Result<Value, PlexusError> {
    if chunk.is_null(offset) {
        return Ok(Value::Null);
    }
    let any = chunk.as_any();
    if let Some(ints) = any.downcast_ref::<Int32Array>() {
        return Ok(Value::Int32(ints.value(offset)));
    }
    if let Some(ints) = any.downcast_ref::<Int64Array>() {
        return Ok(Value::Int64(ints.value(offset)));
    }
    if let Some(floats) = any.downcast_ref::<Float32Array>() {
        return Ok(Value::Float32(floats.value(offset)));
    }
    if let Some(floats) = any.downcast_ref::<Float64Array>() {
        return Ok(Value::Float64(floats.value(offset)));
    }
    if let Some(strings) = any.downcast_ref::<StringArray>() {
        return Ok(Value::Utf8(strings.value(offset).to_string()));
    }
    if let Some(lists) = any.downcast_ref::<FixedSizeListArray>() {
        return fixed_list_value(lists, offset);
    }
    if let Some(lists) = any.downcast_ref::<ListArray>() {
        return list_value(&lists.value(offset));
    }
    Err(PlexusError::TypeMismatch(format!(
        "unsupported chunk type {}",
        chunk.data_type()
    )))
}

fn fixed_list_value(lists: &FixedSizeListArray, offset: usize) -> Result<Value, PlexusError> {
    let element = lists.value(offset);
    let any = element.as_any();
    if let Some(ints) = any.downcast_ref::<Int32Array>() {
        return Ok(Value::IntArray(ints.iter().flatten().collect()));
    }
    if let Some(ints) = any.downcast_ref::<Int64Array>() {
        return Ok(Value::LongArray(ints.iter().flatten().collect()));
    }
    if let Some(floats) = any.downcast_ref::<Float32Array>() {
        return Ok(Value::FloatArray(floats.iter().flatten().collect()));
    }
    if let Some(floats) = any.downcast_ref::<Float64Array>() {
        return Ok(Value::DoubleArray(floats.iter().flatten().collect()));
    }
    Err(PlexusError::TypeMismatch(format!(
        "unsupported fixed-size list element type {}",
        element.data_type()
    )))
}

fn list_value(element: &ArrayRef) -> Result<Value, PlexusError> {
    let any = element.as_any();
    if let Some(strings) = any.downcast_ref::<StringArray>() {
        return Ok(Value::List(
            strings
                .iter()
                .map(|s| match s {
                    Some(s) => Value::Utf8(s.to_string()),
                    None => Value::Null,
                })
                .collect(),
        ));
    }
    if let Some(floats) = any.downcast_ref::<Float64Array>() {
        return Ok(Value::List(
            floats
                .iter()
                .map(|f| match f {
                    Some(f) => Value::Float64(f),
                    None => Value::Null,
                })
                .collect(),
        ));
    }
    if let Some(ints) = any.downcast_ref::<Int64Array>() {
        return Ok(Value::List(
            ints.iter()
                .map(|i| match i {
                    Some(i) => Value::Int64(i),
                    None => Value::Null,
                })
                .collect(),
        ));
    }
    Err(PlexusError::TypeMismatch(format!(
        "unsupported list element type {}",
        element.data_type()
    )))
}

impl Drop for BatchStore {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}
