use crate::processor::table::{TableKind, TableSpec};
use crate::processor::udf::register_udfs;
use crate::source::SourceReader;
use crate::storage::writer::TableWriter;
use crate::storage::{Location, StoreRegistry};
use arrow::datatypes::Schema;
use common::Result;
use common::config::{Settings, SongMatch};
use datafusion::datasource::MemTable;
use datafusion::execution::context::SessionContext;
use datafusion::prelude::{DataFrame, SessionConfig};
use std::sync::Arc;
use tracing::info;

/// Everything a transform needs, created once per run and passed by reference.
pub struct PipelineContext {
    pub ctx: SessionContext,
    pub settings: Settings,
    pub writer: TableWriter,
    pub reader: SourceReader,
    song_source: Location,
    log_source: Location,
    output_root: Location,
    song_match: SongMatch,
}

/// Builds the query session, registers the UDFs and makes every configured
/// location readable by DataFusion.
pub fn create_session(settings: Settings) -> Result<PipelineContext> {
    let mut config = SessionConfig::new();
    if let Some(partitions) = settings.pipeline.target_partitions {
        config = config.with_target_partitions(partitions);
    }
    let ctx = SessionContext::new_with_config(config);
    register_udfs(&ctx)?;

    let song_source = Location::parse(&settings.source.songpath)?;
    let log_source = Location::parse(&settings.source.logpath)?;
    let output_root = Location::parse(&settings.output.output_path)?;
    let song_match = settings.song_match()?;

    let storage = Arc::new(StoreRegistry::new(settings.aws.clone()));
    for location in [&song_source, &log_source, &output_root] {
        storage.register_with(&ctx, location)?;
    }

    info!(
        song_source = %song_source,
        log_source = %log_source,
        output_root = %output_root,
        song_match = %song_match,
        target_partitions = ctx.state().config().target_partitions(),
        "Session created"
    );

    Ok(PipelineContext {
        ctx,
        reader: SourceReader::new(storage.clone()),
        writer: TableWriter::new(storage),
        settings,
        song_source,
        log_source,
        output_root,
        song_match,
    })
}

impl PipelineContext {
    pub fn song_source(&self) -> &Location {
        &self.song_source
    }

    pub fn log_source(&self) -> &Location {
        &self.log_source
    }

    pub fn song_match(&self) -> SongMatch {
        self.song_match
    }

    pub fn table(&self, kind: TableKind) -> Result<TableSpec> {
        TableSpec::new(kind, kind.configured_name(&self.settings.output), &self.output_root)
    }

    /// Loads newline-delimited JSON records into an in-memory DataFrame.
    pub async fn load_source(&self, location: &Location, schema: &Schema) -> Result<DataFrame> {
        let loaded = self.reader.read(location, schema).await?;
        let table = MemTable::try_new(loaded.schema, vec![loaded.batches])?;
        Ok(self.ctx.read_table(Arc::new(table))?)
    }
}
