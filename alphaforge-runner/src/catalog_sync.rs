//! Refresh the local catalog from the simulation service.

use tracing::info;

use crate::catalog::Catalog;
use crate::error::PipelineError;
use crate::service::{FieldScope, SimulationService};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogSyncReport {
    pub fetched: usize,
    pub upserted: usize,
    pub removed: usize,
}

/// Mirror the service's operator list: local operators the service no longer
/// reports are removed, the rest upserted.
pub fn sync_operators(service: &dyn SimulationService, catalog: &dyn Catalog) -> Result<CatalogSyncReport, PipelineError> {
    let remote = service.list_operators()?;
    let stale: Vec<String> = catalog
        .operators()?
        .into_iter()
        .map(|o| o.name)
        .filter(|name| !remote.iter().any(|r| r.name == *name))
        .collect();

    let removed = if stale.is_empty() { 0 } else { catalog.remove_operators(&stale)? };
    let fetched = remote.len();
    for op in remote {
        catalog.upsert_operator(op)?;
    }
    info!(fetched, removed, "operators synced");
    Ok(CatalogSyncReport {
        fetched,
        upserted: fetched,
        removed,
    })
}

/// Upsert every data field the service lists for `scope`.
pub fn sync_data_fields(
    service: &dyn SimulationService,
    catalog: &dyn Catalog,
    scope: &FieldScope,
) -> Result<CatalogSyncReport, PipelineError> {
    let fields = service.list_fields(scope)?;
    let fetched = fields.len();
    for field in fields {
        catalog.upsert_data_field(field)?;
    }
    info!(region = %scope.region, delay = scope.delay, universe = %scope.universe, fetched, "data fields synced");
    Ok(CatalogSyncReport {
        fetched,
        upserted: fetched,
        removed: 0,
    })
}
