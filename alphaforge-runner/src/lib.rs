//! AlphaForge Runner: generation, batch simulation, ingestion, catalog sync.
//!
//! This crate builds on `alphaforge-core` to provide:
//! - TOML pipeline configuration
//! - Candidate repository (in-memory and JSON file backed) and filters
//! - Reference catalog of templates, data fields and operators
//! - Simulation service trait, HTTP client and shared rate limiter
//! - Level pipeline with pyramid-weighted field selection and promotion gates
//! - Batch simulation orchestrator over a bounded worker pool
//! - Result and P&L ingestion
//! - Operator/data field sync and template inference

pub mod catalog;
pub mod catalog_sync;
pub mod config;
pub mod error;
pub mod field_select;
pub mod generation;
pub mod http;
pub mod infer;
pub mod ingestion;
pub mod orchestrator;
pub mod promotion;
pub mod rate_limit;
pub mod repository;
pub mod service;

pub use catalog::{Catalog, CatalogData, CatalogError, FieldQuery, InMemoryCatalog};
pub use catalog_sync::{sync_data_fields, sync_operators, CatalogSyncReport};
pub use config::{ConfigError, PipelineConfig};
pub use error::PipelineError;
pub use generation::{batch_no_for, GenerationReport, LevelPipeline};
pub use http::{Credentials, HttpSimulationClient};
pub use infer::{infer_templates, InferenceReport};
pub use ingestion::{result_window, IngestReport, Ingestor, PnlReport};
pub use orchestrator::{plan_sub_batches, requeue_stale, BatchSummary, Orchestrator, SubBatch};
pub use promotion::{Gate, GateFailure, PromotionThresholds};
pub use rate_limit::RateLimiter;
pub use repository::{
    CandidateRepository, CreateOutcome, FileRepository, Filter, InMemoryRepository, Page, RepoError,
};
pub use service::{
    ExternalRecord, FieldScope, ItemOutcome, ItemResult, PyramidCount, ResultQuery, ResultsPage, ServiceError,
    SimulationRequest, SimulationService,
};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn shared_handles_are_send_sync() {
        assert_send::<InMemoryRepository>();
        assert_sync::<InMemoryRepository>();
        assert_send::<FileRepository>();
        assert_sync::<FileRepository>();
        assert_send::<InMemoryCatalog>();
        assert_sync::<InMemoryCatalog>();
        assert_send::<RateLimiter>();
        assert_sync::<RateLimiter>();
        assert_send::<HttpSimulationClient>();
        assert_sync::<HttpSimulationClient>();
    }

    #[test]
    fn worker_payloads_are_send() {
        assert_send::<SimulationRequest>();
        assert_send::<ItemResult>();
        assert_send::<ServiceError>();
        assert_send::<SubBatch>();
        assert_send::<PipelineError>();
    }
}
