//! Top-level pipeline error.

use thiserror::Error;

use alphaforge_core::domain::TemplateId;
use alphaforge_core::lifecycle::LifecycleError;
use alphaforge_core::sampler::SamplerError;

use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::repository::RepoError;
use crate::service::ServiceError;

/// Errors that stop a pipeline run.
///
/// Per-candidate problems (validation failures, duplicate hashes, failed
/// sub-batches, single P&L fetches) are logged and counted in the run report
/// instead of surfacing here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("repository error: {0}")]
    Repository(#[from] RepoError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("sampler error: {0}")]
    Sampler(#[from] SamplerError),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("unknown template id {0}")]
    UnknownTemplate(TemplateId),

    #[error("worker pool error: {0}")]
    WorkerPool(String),

    #[error("template inference error: {0}")]
    Inference(String),
}
