use arrow::array::{ArrayRef, Int64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use common::{Error, Result};
use std::sync::Arc;

/// Bits reserved for the row offset inside one batch.
pub const ROW_BITS: u32 = 33;

/// Monotonic id for row `row` of batch `batch`: the batch index in the upper
/// bits, the row offset in the lower 33. Ids are unique within a run and grow
/// with row order, but are neither dense nor stable across runs.
pub fn monotonic_id(batch: u64, row: u64) -> Result<i64> {
    if row >= 1 << ROW_BITS {
        return Err(Error::Other(format!(
            "Batch {} has more than 2^{} rows",
            batch, ROW_BITS
        )));
    }
    let id = batch
        .checked_shl(ROW_BITS)
        .filter(|shifted| shifted >> ROW_BITS == batch)
        .and_then(|shifted| shifted.checked_add(row))
        .filter(|id| *id <= i64::MAX as u64)
        .ok_or_else(|| Error::Other(format!("Surrogate id overflow at batch {}", batch)))?;
    Ok(id as i64)
}

/// Appends a non-null Int64 id column to every batch.
pub fn assign_surrogate_ids(
    schema: &SchemaRef,
    batches: Vec<RecordBatch>,
    column: &str,
) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    fields.push(Field::new(column, DataType::Int64, false));
    let output_schema = Arc::new(Schema::new(fields));

    let mut output = Vec::with_capacity(batches.len());
    for (index, batch) in batches.into_iter().enumerate() {
        let ids = (0..batch.num_rows() as u64)
            .map(|row| monotonic_id(index as u64, row))
            .collect::<Result<Vec<i64>>>()?;

        let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
        columns.push(Arc::new(Int64Array::from(ids)));
        output.push(RecordBatch::try_new(output_schema.clone(), columns)?);
    }

    Ok((output_schema, output))
}
