pub mod catalog;
pub mod events;
pub mod surrogate;
pub mod table;
pub mod udf;

pub use catalog::CatalogTransform;
pub use events::EventTransform;
pub use table::{TableKind, TableSpec};

use crate::session::PipelineContext;
use crate::storage::writer::TableManifest;
use async_trait::async_trait;
use common::Result;
use std::time::Instant;
use tracing::info;

/// One stage of the batch job. Stages read sources, derive tables and write
/// them; they share nothing but the context.
#[async_trait]
pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &PipelineContext) -> Result<Vec<TableManifest>>;
}

/// Runs stages strictly in order, stopping at the first failure.
pub async fn run_transforms(
    ctx: &PipelineContext,
    transforms: &[&dyn Transform],
) -> Result<Vec<TableManifest>> {
    let mut written = Vec::new();
    for transform in transforms {
        let started = Instant::now();
        info!(stage = transform.name(), "Stage started");

        let manifests = transform.run(ctx).await?;

        info!(
            stage = transform.name(),
            tables = manifests.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Stage finished"
        );
        written.extend(manifests);
    }
    Ok(written)
}
