pub mod processor;
pub mod schema;
pub mod session;
pub mod source;
pub mod storage;

use common::Result;
use common::config::Settings;
use processor::{CatalogTransform, EventTransform, run_transforms};
use session::{PipelineContext, create_session};
use storage::writer::TableManifest;
use tracing::info;

/// Runs the complete batch job: catalog dimensions first, then the
/// event-derived tables that join against them.
pub async fn run_etl_pipeline(config_path: &str) -> Result<Vec<TableManifest>> {
    let settings = Settings::new(config_path)?;
    info!(config = config_path, "Configuration loaded");

    let ctx = create_session(settings)?;
    run_pipeline(&ctx).await
}

pub async fn run_pipeline(ctx: &PipelineContext) -> Result<Vec<TableManifest>> {
    let manifests = run_transforms(ctx, &[&CatalogTransform, &EventTransform]).await?;
    info!(
        tables = manifests.len(),
        rows = manifests.iter().map(|m| m.rows).sum::<usize>(),
        "Pipeline complete"
    );
    Ok(manifests)
}
