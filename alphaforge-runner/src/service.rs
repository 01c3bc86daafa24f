//! Simulation service trait and wire-independent types.
//!
//! The orchestrator, ingestion and catalog sync talk to the service only
//! through [`SimulationService`], so tests can inject doubles and the HTTP
//! client stays swappable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use alphaforge_core::domain::{CandidateId, DataField, ExternalId, Operator, Settings};

/// Structured service errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    #[error("authentication rejected: {0}")]
    Unauthorized(String),

    #[error("rate limited by service (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),
}

impl ServiceError {
    /// Whether the session must be re-established before retrying.
    pub fn needs_reauth(&self) -> bool {
        matches!(self, ServiceError::Unauthorized(_))
    }
}

/// One candidate to simulate.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationRequest {
    pub candidate_id: CandidateId,
    pub expression: String,
    pub settings: Settings,
}

/// Per-item verdict of a batch submission.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// Simulation completed; the service assigned an alpha id.
    Completed { external_id: ExternalId },
    /// Simulation ran and failed (bad expression, data error, ...).
    Failed { reason: String },
    /// No verdict for this item; the candidate stays SIMULATING.
    Unresolved { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemResult {
    pub candidate_id: CandidateId,
    pub outcome: ItemOutcome,
}

/// Filter for paging simulated records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultQuery {
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub status: Option<String>,
}

/// A simulated record as reported by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRecord {
    pub id: ExternalId,
    pub expression: String,
    pub settings: Settings,
    pub status: String,
    pub sharpe: Option<f64>,
    pub fitness: Option<f64>,
    pub operator_count: Option<u32>,
    pub date_created: Option<DateTime<Utc>>,
    pub date_modified: Option<DateTime<Utc>>,
    pub date_submitted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultsPage {
    pub items: Vec<ExternalRecord>,
    /// Total matches reported by the service at the time of the call.
    pub total: usize,
}

/// Data field listing scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldScope {
    pub region: String,
    pub delay: i64,
    pub universe: String,
    pub dataset: Option<String>,
}

/// How many alphas the user already holds in one pyramid bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyramidCount {
    pub region: String,
    pub delay: i64,
    pub category: String,
    pub alpha_count: u64,
}

pub trait SimulationService: Send + Sync {
    /// Simulate a batch of candidates sharing one execution context.
    ///
    /// `Ok` carries one result per request item; `Err` means the whole
    /// batch produced no verdicts.
    fn submit_batch(&self, batch: &[SimulationRequest]) -> Result<Vec<ItemResult>, ServiceError>;

    fn fetch_results_page(&self, query: &ResultQuery, offset: usize, limit: usize) -> Result<ResultsPage, ServiceError>;

    /// P&L record set of one simulated alpha, opaque JSON.
    fn fetch_pnl(&self, id: &ExternalId) -> Result<Value, ServiceError>;

    fn list_operators(&self) -> Result<Vec<Operator>, ServiceError>;

    fn list_fields(&self, scope: &FieldScope) -> Result<Vec<DataField>, ServiceError>;

    fn pyramid_alpha_counts(&self) -> Result<Vec<PyramidCount>, ServiceError>;

    fn reauthenticate(&self) -> Result<(), ServiceError>;
}
