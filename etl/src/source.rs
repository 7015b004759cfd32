use crate::schema::with_ordinal;
use crate::storage::{Location, StoreRegistry};
use arrow::array::{ArrayRef, UInt64Array};
use arrow::datatypes::{Schema, SchemaRef};
use arrow::json::ReaderBuilder;
use arrow::record_batch::RecordBatch;
use common::{Error, Result};
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info};

const JSON_EXTENSION: &str = ".json";
const BATCH_SIZE: usize = 8192;

/// Newline-delimited JSON records decoded against an explicit schema.
pub struct SourceBatches {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
    pub files: usize,
    pub rows: usize,
}

/// Reads every `*.json` object under a location, in path order, and numbers
/// the rows across files.
pub struct SourceReader {
    storage: Arc<StoreRegistry>,
}

impl SourceReader {
    pub fn new(storage: Arc<StoreRegistry>) -> Self {
        Self { storage }
    }

    pub async fn read(&self, location: &Location, schema: &Schema) -> Result<SourceBatches> {
        let files = self.storage.list_files(location, JSON_EXTENSION).await?;
        if files.is_empty() {
            return Err(Error::Source(format!(
                "No {} files found under {}",
                JSON_EXTENSION, location
            )));
        }

        let source_schema = Arc::new(schema.clone());
        let output_schema = with_ordinal(schema);
        let mut batches = Vec::new();
        let mut next_ordinal: u64 = 0;

        for meta in &files {
            let bytes = self.storage.get_path(location, &meta.location).await?;
            let decoded = decode_ndjson(source_schema.clone(), bytes.as_ref())
                .map_err(|e| Error::Source(format!("{}: {}", meta.location, e)))?;

            for batch in decoded {
                let rows = batch.num_rows() as u64;
                let ordinals: ArrayRef =
                    Arc::new(UInt64Array::from_iter_values(next_ordinal..next_ordinal + rows));
                next_ordinal += rows;

                let mut columns = batch.columns().to_vec();
                columns.push(ordinals);
                batches.push(RecordBatch::try_new(output_schema.clone(), columns)?);
            }
            debug!(file = %meta.location, "Decoded source file");
        }

        info!(
            location = %location,
            files = files.len(),
            rows = next_ordinal,
            "Loaded source records"
        );

        Ok(SourceBatches {
            schema: output_schema,
            batches,
            files: files.len(),
            rows: next_ordinal as usize,
        })
    }
}

/// Decodes one newline-delimited JSON document. Missing keys decode as null,
/// unknown keys are ignored, and a value of the wrong type is an error.
pub fn decode_ndjson(schema: SchemaRef, data: &[u8]) -> Result<Vec<RecordBatch>> {
    let reader = ReaderBuilder::new(schema)
        .with_batch_size(BATCH_SIZE)
        .build(Cursor::new(data))?;

    let mut batches = Vec::new();
    for batch in reader {
        let batch = batch?;
        if batch.num_rows() > 0 {
            batches.push(batch);
        }
    }
    Ok(batches)
}
