use super::Transform;
use super::surrogate::assign_surrogate_ids;
use super::table::{TableKind, TableSpec};
use super::udf::{CalendarField, EPOCH_MILLIS_TO_TIMESTAMP, PARTITION_VALUE};
use crate::schema::{
    ORDINAL_COLUMN, SONGPLAY_COLUMNS, SONGPLAY_ID_COLUMN, TIME_COLUMNS, USER_COLUMNS,
    artist_table_read_schema, log_source_schema, song_table_partition_cols, song_table_read_schema,
};
use crate::session::PipelineContext;
use crate::storage::writer::{TableManifest, sorted_by_all_columns};
use arrow::datatypes::{DataType, SchemaRef};
use async_trait::async_trait;
use common::config::SongMatch;
use common::{Error, Result};
use datafusion::common::JoinType;
use datafusion::datasource::MemTable;
use datafusion::execution::registry::FunctionRegistry;
use datafusion::functions_window::expr_fn::row_number;
use datafusion::logical_expr::{ExprFunctionExt, cast, ident};
use datafusion::prelude::*;
use std::sync::Arc;
use tracing::{debug, info};

const RANK_COLUMN: &str = "_rank";

/// Builds users, time and songplays from the listening log.
pub struct EventTransform;

impl EventTransform {
    /// Keeps only play events.
    pub fn plays(events: DataFrame, page: &str) -> Result<DataFrame> {
        Ok(events.filter(ident("page").eq(lit(page)))?)
    }

    /// Every play must carry an integer `ts`.
    pub async fn ensure_timestamps(plays: &DataFrame) -> Result<()> {
        let field = plays.schema().field_with_unqualified_name("ts")?;
        if field.data_type() != &DataType::Int64 {
            return Err(Error::InvalidTimestamp(format!(
                "ts must be Int64, found {}",
                field.data_type()
            )));
        }

        let missing = plays.clone().filter(ident("ts").is_null())?.count().await?;
        if missing > 0 {
            return Err(Error::InvalidTimestamp(format!(
                "{} play events have no ts",
                missing
            )));
        }
        Ok(())
    }

    /// Latest state per user: the row with the greatest `ts`, the earliest
    /// input row on ties.
    pub fn users_table(plays: DataFrame) -> Result<DataFrame> {
        let rank = row_number()
            .partition_by(vec![ident("userId")])
            .order_by(vec![
                ident("ts").sort(false, true),
                ident(ORDINAL_COLUMN).sort(true, false),
            ])
            .build()?
            .alias(RANK_COLUMN);

        let users = plays
            .window(vec![rank])?
            .filter(ident(RANK_COLUMN).eq(lit(1u64)))?
            .select(USER_COLUMNS.iter().map(|c| ident(*c)).collect::<Vec<_>>())?;
        Ok(users)
    }

    /// Adds `start_time` and the calendar columns derived from `ts`.
    pub fn with_calendar_fields(plays: DataFrame, registry: &dyn FunctionRegistry) -> Result<DataFrame> {
        let to_timestamp = registry.udf(EPOCH_MILLIS_TO_TIMESTAMP)?;
        let mut df = plays.with_column("start_time", to_timestamp.call(vec![ident("ts")]))?;

        for field in CalendarField::ALL {
            let udf = registry.udf(&field.udf_name())?;
            df = df.with_column(field.column(), udf.call(vec![ident("start_time")]))?;
        }
        Ok(df)
    }

    pub fn time_table(timed: DataFrame) -> Result<DataFrame> {
        Ok(timed.select_columns(&TIME_COLUMNS)?.distinct()?)
    }

    /// Joins plays to the song dimension and projects the fact columns.
    /// Plays without a matching song are dropped.
    pub fn songplays_table(timed: DataFrame, songs: DataFrame, song_match: SongMatch) -> Result<DataFrame> {
        let mut on = vec![ident("song").eq(ident("title"))];
        if song_match == SongMatch::TitleArtist {
            on.push(ident("artist").eq(ident("artist_name")));
        }

        let facts = timed
            .join_on(songs, JoinType::Inner, on)?
            .filter(ident("song_id").is_not_null())?
            .select(SONGPLAY_COLUMNS.iter().map(|c| ident(*c)).collect::<Vec<_>>())?;
        Ok(facts)
    }

    /// Song dimension as persisted by the catalog stage, narrowed to the join
    /// columns. In `title_artist` mode the artist name is attached.
    async fn read_song_dimension(
        ctx: &PipelineContext,
        songs: &TableSpec,
        artists: &TableSpec,
    ) -> Result<DataFrame> {
        let manifest = ctx
            .writer
            .read_manifest(&songs.location)
            .await?
            .ok_or_else(|| Error::MissingTable {
                table: songs.name.clone(),
                location: songs.location.to_string(),
            })?;
        debug!(table = %manifest.table, rows = manifest.rows, "Song dimension found");

        let stored = if manifest.rows == 0 {
            empty_frame(ctx, song_table_read_schema())?
        } else {
            ctx.ctx
                .read_parquet(
                    songs.location.directory_url(),
                    ParquetReadOptions::default().table_partition_cols(song_table_partition_cols()),
                )
                .await?
        };

        let partition_value = ctx.ctx.udf(PARTITION_VALUE)?;
        let songs_frame = stored.select(vec![
            cast(ident("song_id"), DataType::Utf8).alias("song_id"),
            cast(ident("title"), DataType::Utf8).alias("title"),
            partition_value
                .call(vec![cast(ident("artist_id"), DataType::Utf8)])
                .alias("artist_id"),
        ])?;

        if ctx.song_match() == SongMatch::Title {
            return Ok(songs_frame);
        }

        let manifest = ctx
            .writer
            .read_manifest(&artists.location)
            .await?
            .ok_or_else(|| Error::MissingTable {
                table: artists.name.clone(),
                location: artists.location.to_string(),
            })?;

        let stored = if manifest.rows == 0 {
            empty_frame(ctx, artist_table_read_schema())?
        } else {
            ctx.ctx
                .read_parquet(artists.location.directory_url(), ParquetReadOptions::default())
                .await?
        };
        // one row per (id, name); the artist table may repeat an id with
        // different locations
        let artist_names = stored
            .select(vec![
                cast(ident("artist_id"), DataType::Utf8).alias("artist_key"),
                cast(ident("artist_name"), DataType::Utf8).alias("artist_name"),
            ])?
            .distinct()?;

        let named = songs_frame
            .join_on(
                artist_names,
                JoinType::Inner,
                [ident("artist_id").eq(ident("artist_key"))],
            )?
            .select_columns(&["song_id", "title", "artist_id", "artist_name"])?;
        Ok(named)
    }
}

fn empty_frame(ctx: &PipelineContext, schema: SchemaRef) -> Result<DataFrame> {
    let table = MemTable::try_new(schema, vec![vec![]])?;
    Ok(ctx.ctx.read_table(Arc::new(table))?)
}

#[async_trait]
impl Transform for EventTransform {
    fn name(&self) -> &'static str {
        "events"
    }

    async fn run(&self, ctx: &PipelineContext) -> Result<Vec<TableManifest>> {
        let users_spec = ctx.table(TableKind::Users)?;
        let time_spec = ctx.table(TableKind::Time)?;
        let songplays_spec = ctx.table(TableKind::Songplays)?;
        let songs_spec = ctx.table(TableKind::Songs)?;
        let artists_spec = ctx.table(TableKind::Artists)?;

        let events = ctx.load_source(ctx.log_source(), &log_source_schema()).await?;
        let page = ctx.settings.pipeline.event_page.as_str();
        let plays = Self::plays(events, page)?;
        Self::ensure_timestamps(&plays).await?;
        let selected = plays.clone().count().await?;
        info!(page, plays = selected, "Play events selected");

        let users = Self::users_table(plays.clone())?;
        let users_manifest = ctx.writer.write_frame(&users_spec, users).await?;

        let timed = Self::with_calendar_fields(plays, &ctx.ctx)?;
        let time = Self::time_table(timed.clone())?;
        let time_manifest = ctx.writer.write_frame(&time_spec, time).await?;

        let songs = Self::read_song_dimension(ctx, &songs_spec, &artists_spec).await?;
        let facts = sorted_by_all_columns(Self::songplays_table(timed, songs, ctx.song_match())?)?;
        let schema: SchemaRef = facts.schema().inner().clone();
        let batches = facts.collect().await?;
        let (schema, batches) = assign_surrogate_ids(&schema, batches, SONGPLAY_ID_COLUMN)?;
        let songplays_manifest = ctx
            .writer
            .write_batches(&songplays_spec, schema, batches)
            .await?;

        Ok(vec![users_manifest, time_manifest, songplays_manifest])
    }
}
