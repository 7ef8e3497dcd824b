//! Conversions between wire tuples and Arrow record batches.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryBuilder, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder,
};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, SchemaRef};
use pcq_common::{CqError, Result};
use pcq_ipc::{Datum, Tuple};

/// Whether `row` can be stored under `schema` without a type error.
pub fn row_matches_schema(schema: &SchemaRef, row: &Tuple) -> bool {
    row.values.len() == schema.fields().len()
        && schema
            .fields()
            .iter()
            .zip(&row.values)
            .all(|(f, v)| match (f.data_type(), v) {
                (_, Datum::Null) => f.is_nullable(),
                (DataType::Int64, Datum::Int64(_)) => true,
                (DataType::Float64, Datum::Float64Bits(_) | Datum::Int64(_)) => true,
                (DataType::Utf8, Datum::Utf8(_)) => true,
                (DataType::Boolean, Datum::Bool(_)) => true,
                (DataType::Binary, Datum::Bytes(_)) => true,
                _ => false,
            })
}

pub fn rows_to_batch(schema: &SchemaRef, rows: &[Tuple]) -> Result<RecordBatch> {
    let mut cols = Vec::with_capacity(schema.fields().len());
    for (idx, field) in schema.fields().iter().enumerate() {
        let values = rows.iter().map(|r| r.get_or_null(idx));
        cols.push(datums_to_array(values, rows.len(), field.data_type())?);
    }
    RecordBatch::try_new(Arc::clone(schema), cols)
        .map_err(|e| CqError::Execution(format!("record batch build failed: {e}")))
}

pub fn rows_from_batch(batch: &RecordBatch) -> Result<Vec<Tuple>> {
    let mut rows = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let mut values = Vec::with_capacity(batch.num_columns());
        for col in batch.columns() {
            values.push(datum_from_array(col, row)?);
        }
        rows.push(Tuple::new(values));
    }
    Ok(rows)
}

fn datums_to_array<'a>(
    values: impl Iterator<Item = &'a Datum>,
    len: usize,
    dt: &DataType,
) -> Result<ArrayRef> {
    match dt {
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(len);
            for v in values {
                match v {
                    Datum::Int64(x) => b.append_value(*x),
                    Datum::Null => b.append_null(),
                    _ => {
                        return Err(CqError::Execution(
                            "type mismatch while building Int64 array".to_string(),
                        ));
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Float64 => {
            let mut b = Float64Builder::with_capacity(len);
            for v in values {
                match v {
                    Datum::Float64Bits(x) => b.append_value(f64::from_bits(*x)),
                    Datum::Int64(x) => b.append_value(*x as f64),
                    Datum::Null => b.append_null(),
                    _ => {
                        return Err(CqError::Execution(
                            "type mismatch while building Float64 array".to_string(),
                        ));
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Utf8 => {
            let mut b = StringBuilder::with_capacity(len, len * 8);
            for v in values {
                match v {
                    Datum::Utf8(x) => b.append_value(x),
                    Datum::Null => b.append_null(),
                    _ => {
                        return Err(CqError::Execution(
                            "type mismatch while building Utf8 array".to_string(),
                        ));
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(len);
            for v in values {
                match v {
                    Datum::Bool(x) => b.append_value(*x),
                    Datum::Null => b.append_null(),
                    _ => {
                        return Err(CqError::Execution(
                            "type mismatch while building Boolean array".to_string(),
                        ));
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Binary => {
            let mut b = BinaryBuilder::with_capacity(len, len * 8);
            for v in values {
                match v {
                    Datum::Bytes(x) => b.append_value(x),
                    Datum::Null => b.append_null(),
                    _ => {
                        return Err(CqError::Execution(
                            "type mismatch while building Binary array".to_string(),
                        ));
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        other => Err(CqError::Unsupported(format!(
            "column type not supported in tuples: {other:?}"
        ))),
    }
}

fn datum_from_array(array: &ArrayRef, row: usize) -> Result<Datum> {
    if array.is_null(row) {
        return Ok(Datum::Null);
    }
    match array.data_type() {
        DataType::Int64 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::Int64Array>()
                .ok_or_else(|| CqError::Execution("expected Int64Array".to_string()))?;
            Ok(Datum::Int64(a.value(row)))
        }
        DataType::Float64 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::Float64Array>()
                .ok_or_else(|| CqError::Execution("expected Float64Array".to_string()))?;
            Ok(Datum::float64(a.value(row)))
        }
        DataType::Utf8 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::StringArray>()
                .ok_or_else(|| CqError::Execution("expected StringArray".to_string()))?;
            Ok(Datum::Utf8(a.value(row).to_string()))
        }
        DataType::Boolean => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::BooleanArray>()
                .ok_or_else(|| CqError::Execution("expected BooleanArray".to_string()))?;
            Ok(Datum::Bool(a.value(row)))
        }
        DataType::Binary => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::BinaryArray>()
                .ok_or_else(|| CqError::Execution("expected BinaryArray".to_string()))?;
            Ok(Datum::Bytes(a.value(row).to_vec()))
        }
        other => Err(CqError::Unsupported(format!(
            "column type not supported in tuples: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::{Field, Schema};

    use super::*;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Float64, true),
            Field::new("name", DataType::Utf8, true),
        ]))
    }

    #[test]
    fn converts_rows_to_batch_and_back() {
        let rows = vec![
            Tuple::new(vec![
                Datum::Int64(1),
                Datum::float64(0.5),
                Datum::Utf8("a".to_string()),
            ]),
            Tuple::new(vec![Datum::Int64(2), Datum::Null, Datum::Null]),
        ];
        let batch = rows_to_batch(&schema(), &rows).expect("batch");
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(rows_from_batch(&batch).expect("rows"), rows);
    }

    #[test]
    fn schema_matching_flags_bad_rows() {
        let s = schema();
        assert!(row_matches_schema(
            &s,
            &Tuple::new(vec![Datum::Int64(1), Datum::Int64(2), Datum::Null])
        ));
        assert!(!row_matches_schema(
            &s,
            &Tuple::new(vec![Datum::Null, Datum::Null, Datum::Null])
        ));
        assert!(!row_matches_schema(&s, &Tuple::new(vec![Datum::Int64(1)])));
        assert!(rows_to_batch(
            &s,
            &[Tuple::new(vec![
                Datum::Utf8("x".to_string()),
                Datum::Null,
                Datum::Null
            ])]
        )
        .is_err());
    }
}
