//! Column-major tabular buffer threaded through pipeline steps.
//!
//! A `Frame` is the in-memory currency of the worker pipelines: metric rows
//! stream in from the store, cleaning rules filter them, and the result goes
//! out as parquet via the Arrow interop below. Columns are typed (float,
//! int, string, bool) and nullable.

use std::collections::HashSet;
use std::sync::Arc;

use arrow::array::{
    Array, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{PipelineError, Result};

/// Typed, nullable column storage.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Float(Vec<Option<f64>>),
    Int(Vec<Option<i64>>),
    Str(Vec<Option<String>>),
    Bool(Vec<Option<bool>>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Float(v) => v.len(),
            ColumnData::Int(v) => v.len(),
            ColumnData::Str(v) => v.len(),
            ColumnData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn filtered(&self, mask: &[bool]) -> ColumnData {
        fn keep<T: Clone>(values: &[Option<T>], mask: &[bool]) -> Vec<Option<T>> {
            values
                .iter()
                .zip(mask)
                .filter(|(_, keep)| **keep)
                .map(|(v, _)| v.clone())
                .collect()
        }
        match self {
            ColumnData::Float(v) => ColumnData::Float(keep(v, mask)),
            ColumnData::Int(v) => ColumnData::Int(keep(v, mask)),
            ColumnData::Str(v) => ColumnData::Str(keep(v, mask)),
            ColumnData::Bool(v) => ColumnData::Bool(keep(v, mask)),
        }
    }

    fn taken(&self, indices: &[usize]) -> ColumnData {
        fn take<T: Clone>(values: &[Option<T>], indices: &[usize]) -> Vec<Option<T>> {
            indices.iter().map(|&i| values[i].clone()).collect()
        }
        match self {
            ColumnData::Float(v) => ColumnData::Float(take(v, indices)),
            ColumnData::Int(v) => ColumnData::Int(take(v, indices)),
            ColumnData::Str(v) => ColumnData::Str(take(v, indices)),
            ColumnData::Bool(v) => ColumnData::Bool(take(v, indices)),
        }
    }

    fn append(&mut self, other: &ColumnData) -> Result<()> {
        match (self, other) {
            (ColumnData::Float(a), ColumnData::Float(b)) => a.extend(b.iter().cloned()),
            (ColumnData::Int(a), ColumnData::Int(b)) => a.extend(b.iter().cloned()),
            (ColumnData::Str(a), ColumnData::Str(b)) => a.extend(b.iter().cloned()),
            (ColumnData::Bool(a), ColumnData::Bool(b)) => a.extend(b.iter().cloned()),
            _ => {
                return Err(PipelineError::Frame(
                    "column type mismatch during concat".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Lossy numeric view of the column (bools as 0/1, strings as None).
    pub fn as_f64(&self, row: usize) -> Option<f64> {
        match self {
            ColumnData::Float(v) => v[row],
            ColumnData::Int(v) => v[row].map(|x| x as f64),
            ColumnData::Bool(v) => v[row].map(|b| if b { 1.0 } else { 0.0 }),
            ColumnData::Str(_) => None,
        }
    }

    pub fn as_str(&self, row: usize) -> Option<&str> {
        match self {
            ColumnData::Str(v) => v[row].as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

/// Column-major table. All columns share the same length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    columns: Vec<Column>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.data.len())
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.columns.iter().find(|c| c.name == name).map(|c| &c.data)
    }

    pub fn column_required(&self, name: &str) -> Result<&ColumnData> {
        self.column(name)
            .ok_or_else(|| PipelineError::Frame(format!("missing column '{}'", name)))
    }

    /// Add or replace a column. Length must match existing columns.
    pub fn set_column(&mut self, name: &str, data: ColumnData) -> Result<()> {
        if !self.columns.is_empty() && data.len() != self.num_rows() {
            return Err(PipelineError::Frame(format!(
                "column '{}' length {} does not match frame rows {}",
                name,
                data.len(),
                self.num_rows()
            )));
        }
        if let Some(col) = self.columns.iter_mut().find(|c| c.name == name) {
            col.data = data;
        } else {
            self.columns.push(Column {
                name: name.to_string(),
                data,
            });
        }
        Ok(())
    }

    pub fn drop_column(&mut self, name: &str) {
        self.columns.retain(|c| c.name != name);
    }

    /// Project onto the given columns, preserving the requested order.
    pub fn select(&self, names: &[String]) -> Result<Frame> {
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let col = self
                .columns
                .iter()
                .find(|c| &c.name == name)
                .ok_or_else(|| PipelineError::Frame(format!("missing column '{}'", name)))?;
            columns.push(col.clone());
        }
        Ok(Frame { columns })
    }

    /// Keep rows where `mask` is true.
    pub fn filter(&self, mask: &[bool]) -> Result<Frame> {
        if mask.len() != self.num_rows() {
            return Err(PipelineError::Frame(format!(
                "mask length {} does not match frame rows {}",
                mask.len(),
                self.num_rows()
            )));
        }
        Ok(Frame {
            columns: self
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    data: c.data.filtered(mask),
                })
                .collect(),
        })
    }

    /// Take rows by index.
    pub fn take(&self, indices: &[usize]) -> Result<Frame> {
        if let Some(&max) = indices.iter().max() {
            if max >= self.num_rows() {
                return Err(PipelineError::Frame(format!(
                    "index {} out of bounds for {} rows",
                    max,
                    self.num_rows()
                )));
            }
        }
        Ok(Frame {
            columns: self
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    data: c.data.taken(indices),
                })
                .collect(),
        })
    }

    /// Vertically concatenate frames with identical schemas.
    pub fn concat(frames: &[Frame]) -> Result<Frame> {
        let mut iter = frames.iter().filter(|f| !f.is_empty());
        let Some(first) = iter.next() else {
            return Ok(Frame::new());
        };
        let mut out = first.clone();
        for frame in iter {
            if frame.column_names() != out.column_names() {
                return Err(PipelineError::Frame(
                    "schema mismatch during concat".to_string(),
                ));
            }
            for (dst, src) in out.columns.iter_mut().zip(&frame.columns) {
                dst.data.append(&src.data)?;
            }
        }
        Ok(out)
    }

    /// Deterministic random sample of up to `n` rows.
    pub fn sample(&self, n: usize, seed: u64) -> Result<Frame> {
        let rows = self.num_rows();
        if n >= rows {
            return Ok(self.clone());
        }
        let mut indices: Vec<usize> = (0..rows).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        indices.truncate(n);
        indices.sort_unstable();
        self.take(&indices)
    }

    /// De-duplicate rows on the given key columns, keeping the first
    /// occurrence. String rendering of the key is stable across types.
    pub fn dedup_on(&self, key_columns: &[String]) -> Result<Frame> {
        let keys: Vec<&ColumnData> = key_columns
            .iter()
            .map(|name| self.column_required(name))
            .collect::<Result<_>>()?;

        let mut seen = HashSet::new();
        let mut mask = Vec::with_capacity(self.num_rows());
        for row in 0..self.num_rows() {
            let key: Vec<String> = keys
                .iter()
                .map(|col| match col {
                    ColumnData::Str(v) => format!("s:{:?}", v[row]),
                    ColumnData::Float(v) => format!("f:{:?}", v[row].map(f64::to_bits)),
                    ColumnData::Int(v) => format!("i:{:?}", v[row]),
                    ColumnData::Bool(v) => format!("b:{:?}", v[row]),
                })
                .collect();
            mask.push(seen.insert(key.join("|")));
        }
        self.filter(&mask)
    }

    /// Numeric matrix view over the given columns; missing values become an
    /// error so models never silently train on gaps.
    pub fn to_matrix(&self, feature_columns: &[String]) -> Result<Vec<Vec<f64>>> {
        let cols: Vec<&ColumnData> = feature_columns
            .iter()
            .map(|name| self.column_required(name))
            .collect::<Result<_>>()?;

        let mut rows = Vec::with_capacity(self.num_rows());
        for row in 0..self.num_rows() {
            let mut out = Vec::with_capacity(cols.len());
            for (col, name) in cols.iter().zip(feature_columns) {
                let value = col.as_f64(row).ok_or_else(|| {
                    PipelineError::Frame(format!(
                        "non-numeric or null value in column '{}' at row {}",
                        name, row
                    ))
                })?;
                out.push(value);
            }
            rows.push(out);
        }
        Ok(rows)
    }

    /// Numeric vector view over one column.
    pub fn to_vector(&self, column: &str) -> Result<Vec<f64>> {
        let col = self.column_required(column)?;
        (0..self.num_rows())
            .map(|row| {
                col.as_f64(row).ok_or_else(|| {
                    PipelineError::Frame(format!(
                        "non-numeric or null value in column '{}' at row {}",
                        column, row
                    ))
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Arrow interop
    // ------------------------------------------------------------------

    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let mut fields = Vec::with_capacity(self.columns.len());
        let mut arrays: Vec<Arc<dyn Array>> = Vec::with_capacity(self.columns.len());

        for col in &self.columns {
            match &col.data {
                ColumnData::Float(v) => {
                    fields.push(Field::new(&col.name, DataType::Float64, true));
                    arrays.push(Arc::new(Float64Array::from(v.clone())));
                }
                ColumnData::Int(v) => {
                    fields.push(Field::new(&col.name, DataType::Int64, true));
                    arrays.push(Arc::new(Int64Array::from(v.clone())));
                }
                ColumnData::Str(v) => {
                    fields.push(Field::new(&col.name, DataType::Utf8, true));
                    arrays.push(Arc::new(StringArray::from(v.clone())));
                }
                ColumnData::Bool(v) => {
                    fields.push(Field::new(&col.name, DataType::Boolean, true));
                    arrays.push(Arc::new(BooleanArray::from(v.clone())));
                }
            }
        }

        let schema = Arc::new(Schema::new(fields));
        RecordBatch::try_new(schema, arrays).map_err(PipelineError::from)
    }

    pub fn from_record_batch(batch: &RecordBatch) -> Result<Frame> {
        let mut frame = Frame::new();
        for (field, array) in batch.schema().fields().iter().zip(batch.columns()) {
            let data = match field.data_type() {
                DataType::Float64 => {
                    let arr = array
                        .as_any()
                        .downcast_ref::<Float64Array>()
                        .ok_or_else(|| downcast_err(field.name()))?;
                    ColumnData::Float((0..arr.len()).map(|i| value_at(arr.is_null(i), || arr.value(i))).collect())
                }
                DataType::Int64 => {
                    let arr = array
                        .as_any()
                        .downcast_ref::<Int64Array>()
                        .ok_or_else(|| downcast_err(field.name()))?;
                    ColumnData::Int((0..arr.len()).map(|i| value_at(arr.is_null(i), || arr.value(i))).collect())
                }
                DataType::Utf8 => {
                    let arr = array
                        .as_any()
                        .downcast_ref::<StringArray>()
                        .ok_or_else(|| downcast_err(field.name()))?;
                    ColumnData::Str(
                        (0..arr.len())
                            .map(|i| value_at(arr.is_null(i), || arr.value(i).to_string()))
                            .collect(),
                    )
                }
                DataType::Boolean => {
                    let arr = array
                        .as_any()
                        .downcast_ref::<BooleanArray>()
                        .ok_or_else(|| downcast_err(field.name()))?;
                    ColumnData::Bool((0..arr.len()).map(|i| value_at(arr.is_null(i), || arr.value(i))).collect())
                }
                other => {
                    return Err(PipelineError::Frame(format!(
                        "unsupported arrow type {:?} in column '{}'",
                        other,
                        field.name()
                    )))
                }
            };
            frame.set_column(field.name(), data)?;
        }
        Ok(frame)
    }
}

fn value_at<T>(is_null: bool, get: impl FnOnce() -> T) -> Option<T> {
    if is_null {
        None
    } else {
        Some(get())
    }
}

fn downcast_err(name: &str) -> PipelineError {
    PipelineError::Frame(format!("array downcast failed for column '{}'", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        let mut frame = Frame::new();
        frame
            .set_column(
                "file",
                ColumnData::Str(vec![
                    Some("a.rs".into()),
                    Some("b.rs".into()),
                    Some("a.rs".into()),
                ]),
            )
            .unwrap();
        frame
            .set_column(
                "loc",
                ColumnData::Float(vec![Some(10.0), Some(20.0), Some(10.0)]),
            )
            .unwrap();
        frame
            .set_column(
                "is_buggy",
                ColumnData::Bool(vec![Some(true), Some(false), Some(true)]),
            )
            .unwrap();
        frame
    }

    #[test]
    fn test_filter() {
        let frame = sample_frame();
        let filtered = frame.filter(&[true, false, true]).unwrap();
        assert_eq!(filtered.num_rows(), 2);
        assert_eq!(filtered.column("file").unwrap().as_str(1), Some("a.rs"));
    }

    #[test]
    fn test_select_preserves_order() {
        let frame = sample_frame();
        let selected = frame
            .select(&["loc".to_string(), "file".to_string()])
            .unwrap();
        assert_eq!(selected.column_names(), vec!["loc", "file"]);
        assert!(frame.select(&["missing".to_string()]).is_err());
    }

    #[test]
    fn test_concat_and_schema_mismatch() {
        let frame = sample_frame();
        let combined = Frame::concat(&[frame.clone(), frame.clone()]).unwrap();
        assert_eq!(combined.num_rows(), 6);

        let mut other = sample_frame();
        other.drop_column("loc");
        assert!(Frame::concat(&[frame, other]).is_err());
    }

    #[test]
    fn test_concat_skips_empty() {
        let combined = Frame::concat(&[Frame::new(), sample_frame()]).unwrap();
        assert_eq!(combined.num_rows(), 3);
    }

    #[test]
    fn test_dedup_on() {
        let frame = sample_frame();
        let deduped = frame
            .dedup_on(&["file".to_string(), "loc".to_string()])
            .unwrap();
        assert_eq!(deduped.num_rows(), 2);
    }

    #[test]
    fn test_sample_is_deterministic() {
        let frame = sample_frame();
        let a = frame.sample(2, 42).unwrap();
        let b = frame.sample(2, 42).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.num_rows(), 2);

        // Asking for more rows than present returns the full frame
        assert_eq!(frame.sample(100, 42).unwrap().num_rows(), 3);
    }

    #[test]
    fn test_to_matrix() {
        let frame = sample_frame();
        let matrix = frame
            .to_matrix(&["loc".to_string(), "is_buggy".to_string()])
            .unwrap();
        assert_eq!(matrix, vec![vec![10.0, 1.0], vec![20.0, 0.0], vec![10.0, 1.0]]);

        // String column cannot be viewed numerically
        assert!(frame.to_matrix(&["file".to_string()]).is_err());
    }

    #[test]
    fn test_record_batch_roundtrip() {
        let mut frame = sample_frame();
        frame
            .set_column("nulls", ColumnData::Float(vec![Some(1.0), None, Some(3.0)]))
            .unwrap();

        let batch = frame.to_record_batch().unwrap();
        let restored = Frame::from_record_batch(&batch).unwrap();
        assert_eq!(frame, restored);
    }

    #[test]
    fn test_set_column_length_mismatch() {
        let mut frame = sample_frame();
        assert!(frame
            .set_column("bad", ColumnData::Int(vec![Some(1)]))
            .is_err());
    }
}
