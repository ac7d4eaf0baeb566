//! Parquet (de)serialization of Arrow record batches, in memory.
//!
//! SNAPPY compression, matching every other artifact the platform writes.

use arrow::array::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::{Result, StoreError};

/// Serialize record batches into a parquet byte buffer.
pub fn batches_to_parquet(batches: &[RecordBatch]) -> Result<Vec<u8>> {
    let Some(first) = batches.first() else {
        return Err(StoreError::Parquet(
            parquet::errors::ParquetError::General("no batches to write".to_string()),
        ));
    };

    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .build();

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, first.schema(), Some(props))?;
    for batch in batches {
        writer.write(batch)?;
    }
    writer.close()?;
    Ok(buf)
}

/// Deserialize a parquet byte buffer into record batches.
pub fn parquet_to_batches(data: Vec<u8>) -> Result<Vec<RecordBatch>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(data))?.build()?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn sample_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("file", DataType::Utf8, false),
            Field::new("loc", DataType::Float64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["a.rs", "b.rs"])),
                Arc::new(Float64Array::from(vec![Some(10.0), None])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_parquet_roundtrip() {
        let batch = sample_batch();
        let bytes = batches_to_parquet(&[batch.clone()]).unwrap();
        let restored = parquet_to_batches(bytes).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].num_rows(), 2);
        assert_eq!(restored[0].schema(), batch.schema());
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(batches_to_parquet(&[]).is_err());
    }
}
