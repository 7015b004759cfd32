use super::{Location, StoreRegistry};
use crate::processor::table::TableSpec;
use arrow::array::{Array, UInt32Array};
use arrow::compute::{concat_batches, take_record_batch};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use common::{Error, Result};
use datafusion::logical_expr::ident;
use datafusion::prelude::*;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Completion marker written last into every table directory.
pub const SUCCESS_MARKER: &str = "_SUCCESS";

/// Directory value used for a null or empty partition column.
pub const DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

const DATA_FILE: &str = "part-00000.parquet";

/// Contents of the `_SUCCESS` marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableManifest {
    pub table: String,
    pub location: String,
    pub partition_by: Vec<String>,
    pub rows: usize,
    pub files: Vec<String>,
}

/// Writes tables as Hive-partitioned Parquet, replacing whatever was there.
pub struct TableWriter {
    storage: Arc<StoreRegistry>,
}

impl TableWriter {
    pub fn new(storage: Arc<StoreRegistry>) -> Self {
        Self { storage }
    }

    /// Sorts the frame on every column, then writes it. Sorting keeps reruns
    /// over the same input byte-identical.
    pub async fn write_frame(&self, table: &TableSpec, df: DataFrame) -> Result<TableManifest> {
        let sorted = sorted_by_all_columns(df)?;
        let schema: SchemaRef = sorted.schema().inner().clone();
        let batches = sorted.collect().await?;
        self.write_batches(table, schema, batches).await
    }

    /// Writes already-ordered batches. Existing objects under the table
    /// location are deleted first.
    pub async fn write_batches(
        &self,
        table: &TableSpec,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<TableManifest> {
        let partitions = split_partitions(&schema, &batches, table.partition_by())?;

        let removed = self.storage.delete_prefix(&table.location).await?;
        if removed > 0 {
            debug!(table = %table.name, removed, "Cleared previous output");
        }

        let props = writer_properties(&table.name);
        let mut files = Vec::with_capacity(partitions.len());
        let mut rows = 0;

        for (key, part) in partitions {
            let mut relative: Vec<String> = table
                .partition_by()
                .iter()
                .zip(key.iter())
                .map(|(column, value)| format!("{}={}", column, value))
                .collect();
            relative.push(DATA_FILE.to_string());

            let mut target = table.location.clone();
            for segment in &relative {
                target = target.child(segment)?;
            }

            rows += part.num_rows();
            let buffer = encode_parquet(&part, props.clone())?;
            self.storage.put(&target, buffer).await?;
            files.push(relative.join("/"));
        }

        let manifest = TableManifest {
            table: table.name.clone(),
            location: table.location.to_string(),
            partition_by: table.partition_by().iter().map(|c| c.to_string()).collect(),
            rows,
            files,
        };
        let marker = table.location.child(SUCCESS_MARKER)?;
        self.storage.put(&marker, serde_json::to_vec_pretty(&manifest)?).await?;

        info!(
            table = %manifest.table,
            location = %manifest.location,
            rows = manifest.rows,
            files = manifest.files.len(),
            "Table written"
        );
        Ok(manifest)
    }

    /// Reads the completion marker of a table, `None` if the table was never
    /// fully written.
    pub async fn read_manifest(&self, location: &Location) -> Result<Option<TableManifest>> {
        let marker = location.child(SUCCESS_MARKER)?;
        match self.storage.get_opt(&marker).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Orders rows on every column, ascending with nulls last.
pub fn sorted_by_all_columns(df: DataFrame) -> Result<DataFrame> {
    let order: Vec<_> = df
        .schema()
        .fields()
        .iter()
        .map(|field| ident(field.name()).sort(true, false))
        .collect();
    Ok(df.sort(order)?)
}

fn writer_properties(table_name: &str) -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![KeyValue {
            key: "table".to_string(),
            value: Some(table_name.to_string()),
        }]))
        .build()
}

fn encode_parquet(batch: &RecordBatch, props: WriterProperties) -> Result<Vec<u8>> {
    let mut buffer: Vec<u8> = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(buffer)
}

/// Groups rows by the string form of their partition values and strips the
/// partition columns from the data. An unpartitioned table always yields one
/// (possibly empty) group.
fn split_partitions(
    schema: &SchemaRef,
    batches: &[RecordBatch],
    partition_by: &[&str],
) -> Result<BTreeMap<Vec<String>, RecordBatch>> {
    let partition_idx = partition_by
        .iter()
        .map(|column| {
            schema.index_of(column).map_err(|_| {
                Error::SchemaMismatch(format!("Partition column '{}' is not in the table", column))
            })
        })
        .collect::<Result<Vec<usize>>>()?;
    let data_idx: Vec<usize> = (0..schema.fields().len())
        .filter(|i| !partition_idx.contains(i))
        .collect();
    let data_schema = Arc::new(schema.project(&data_idx)?);

    let mut pieces: BTreeMap<Vec<String>, Vec<RecordBatch>> = BTreeMap::new();
    if partition_by.is_empty() {
        pieces.insert(Vec::new(), Vec::new());
    }

    for batch in batches {
        let data = batch.project(&data_idx)?;
        if partition_by.is_empty() {
            pieces.entry(Vec::new()).or_default().push(data);
            continue;
        }

        let mut groups: BTreeMap<Vec<String>, Vec<u32>> = BTreeMap::new();
        for row in 0..batch.num_rows() {
            let key = partition_idx
                .iter()
                .map(|&i| partition_value(batch.column(i).as_ref(), row))
                .collect::<Result<Vec<String>>>()?;
            groups.entry(key).or_default().push(row as u32);
        }

        for (key, rows) in groups {
            let taken = take_record_batch(&data, &UInt32Array::from(rows))?;
            pieces.entry(key).or_default().push(taken);
        }
    }

    pieces
        .into_iter()
        .map(|(key, parts)| Ok((key, concat_batches(&data_schema, &parts)?)))
        .collect()
}

/// Directory value of one partition cell, percent-encoded so that any
/// string stays a single path segment.
fn partition_value(column: &dyn Array, row: usize) -> Result<String> {
    if column.is_null(row) {
        return Ok(DEFAULT_PARTITION.to_string());
    }
    let value = array_value_to_string(column, row)?;
    if value.is_empty() {
        Ok(DEFAULT_PARTITION.to_string())
    } else {
        Ok(urlencoding::encode(&value).into_owned())
    }
}
