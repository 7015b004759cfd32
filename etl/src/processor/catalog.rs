use super::Transform;
use super::table::TableKind;
use crate::schema::{ARTIST_COLUMNS, SONG_COLUMNS, song_source_schema};
use crate::session::PipelineContext;
use crate::storage::writer::TableManifest;
use async_trait::async_trait;
use common::Result;
use datafusion::prelude::*;

/// Builds the songs and artists dimensions from catalog records.
pub struct CatalogTransform;

impl CatalogTransform {
    pub fn songs_table(catalog: DataFrame) -> Result<DataFrame> {
        Ok(catalog.select_columns(&SONG_COLUMNS)?.distinct()?)
    }

    pub fn artists_table(catalog: DataFrame) -> Result<DataFrame> {
        Ok(catalog.select_columns(&ARTIST_COLUMNS)?.distinct()?)
    }
}

#[async_trait]
impl Transform for CatalogTransform {
    fn name(&self) -> &'static str {
        "catalog"
    }

    async fn run(&self, ctx: &PipelineContext) -> Result<Vec<TableManifest>> {
        let songs_spec = ctx.table(TableKind::Songs)?;
        let artists_spec = ctx.table(TableKind::Artists)?;

        let catalog = ctx.load_source(ctx.song_source(), &song_source_schema()).await?;

        let songs = Self::songs_table(catalog.clone())?;
        let songs_manifest = ctx.writer.write_frame(&songs_spec, songs).await?;

        let artists = Self::artists_table(catalog)?;
        let artists_manifest = ctx.writer.write_frame(&artists_spec, artists).await?;

        Ok(vec![songs_manifest, artists_manifest])
    }
}
