//! Result ingestion: merge simulated records from the service into the
//! candidate store, and fetch P&L record sets.
//!
//! Records are matched to local candidates by external id first, then by
//! identity hash. Records with no local match become new candidates at
//! [`Level::Template`]. Reported states only ever advance a candidate.
//!
//! A results page that keeps failing ends the pass early; what was merged
//! so far stays merged and the report counts the abandoned page.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Offset, TimeZone, Utc};
use tracing::{debug, info, warn};

use alphaforge_core::domain::{Candidate, CandidateDraft, CandidatePatch, Level};
use alphaforge_core::identity::identity_hash;
use alphaforge_core::lifecycle::CandidateState;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::rate_limit::RateLimiter;
use crate::repository::{CandidateRepository, Filter};
use crate::service::{ExternalRecord, ResultQuery, ResultsPage, ServiceError, SimulationService};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub fetched: usize,
    /// Matched on external id.
    pub linked: usize,
    /// Matched on identity hash.
    pub matched_by_hash: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Records without an expression.
    pub skipped: usize,
    /// Pages abandoned after exhausting their retries.
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PnlReport {
    pub attempted: usize,
    pub stored: usize,
    pub failed: usize,
}

/// Results created from yesterday's midnight to tomorrow's midnight in the
/// service's reporting timezone.
pub fn result_window(now: DateTime<Utc>, utc_offset_hours: i32) -> ResultQuery {
    let offset = FixedOffset::east_opt(utc_offset_hours.clamp(-23, 23) * 3600).unwrap_or(Utc.fix());
    let today = now.with_timezone(&offset).date_naive();
    let midnight = |days: i64| {
        (today + ChronoDuration::days(days))
            .and_hms_opt(0, 0, 0)
            .and_then(|local| offset.from_local_datetime(&local).single())
            .map(|dt| dt.with_timezone(&Utc))
    };
    ResultQuery {
        created_from: midnight(-1),
        created_to: midnight(1),
        status: None,
    }
}

/// Patch that merges `record` into `existing`; empty when nothing changes.
pub fn merge_patch(existing: &Candidate, record: &ExternalRecord) -> CandidatePatch {
    let mut patch = CandidatePatch {
        sharpe: record.sharpe,
        fitness: record.fitness,
        operator_count: record.operator_count,
        external_created_at: record.date_created,
        external_modified_at: record.date_modified,
        external_submitted_at: record.date_submitted,
        ..CandidatePatch::default()
    };
    if existing.external_id.is_none() {
        patch.external_id = Some(record.id.clone());
    }
    if let Some(reported) = CandidateState::from_external_status(&record.status) {
        let merged = existing.state.merge_external(reported);
        if merged != existing.state {
            patch.state = Some(merged);
        }
    }

    let mut after = existing.clone();
    after.apply(&patch);
    if after == *existing {
        CandidatePatch::default()
    } else {
        patch
    }
}

fn draft_from_record(record: &ExternalRecord) -> CandidateDraft {
    let mut draft = CandidateDraft::generated(record.expression.clone(), record.settings.clone(), Level::Template);
    draft.state = CandidateState::from_external_status(&record.status).unwrap_or(CandidateState::Simulated);
    draft.sharpe = record.sharpe;
    draft.fitness = record.fitness;
    draft.operator_count = record.operator_count;
    draft.external_id = Some(record.id.clone());
    draft.external_created_at = record.date_created;
    draft.external_modified_at = record.date_modified;
    draft.external_submitted_at = record.date_submitted;
    draft
}

pub struct Ingestor {
    repo: Arc<dyn CandidateRepository>,
    service: Arc<dyn SimulationService>,
    limiter: Arc<RateLimiter>,
    page_size: usize,
    auth_cooldown: Duration,
    retry_attempts: u32,
    retry_cooldown: Duration,
}

impl Ingestor {
    pub fn new(
        repo: Arc<dyn CandidateRepository>,
        service: Arc<dyn SimulationService>,
        limiter: Arc<RateLimiter>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            repo,
            service,
            limiter,
            page_size: config.batch.page_size,
            auth_cooldown: config.rate_limit.auth_cooldown(),
            retry_attempts: config.rate_limit.retry_attempts,
            retry_cooldown: config.rate_limit.retry_cooldown(),
        }
    }

    fn recover(&self, error: &ServiceError) {
        self.limiter.cooldown(self.auth_cooldown);
        if let Err(e) = self.service.reauthenticate() {
            warn!(error = %e, cause = %error, "reauthentication failed");
        }
    }

    /// One results page, retried up to `retry_attempts` times. An expired
    /// session is renewed first; other failures hold the shared limiter for
    /// the fixed retry cooldown.
    fn page(&self, query: &ResultQuery, offset: usize) -> Result<ResultsPage, ServiceError> {
        let mut attempt = 0;
        loop {
            match self.service.fetch_results_page(query, offset, self.page_size) {
                Ok(page) => return Ok(page),
                Err(e) if attempt < self.retry_attempts => {
                    attempt += 1;
                    warn!(offset, attempt, error = %e, "results page failed, retrying");
                    if e.needs_reauth() {
                        self.recover(&e);
                    } else {
                        self.limiter.cooldown(self.retry_cooldown);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn sync_results(&self, query: &ResultQuery) -> Result<IngestReport, PipelineError> {
        let mut report = IngestReport::default();
        let mut offset = 0;
        loop {
            let page = match self.page(query, offset) {
                Ok(page) => page,
                Err(e) => {
                    warn!(offset, error = %e, "giving up on results paging");
                    report.errors += 1;
                    break;
                }
            };
            let n = page.items.len();
            for record in &page.items {
                self.ingest(record, &mut report)?;
            }
            report.fetched += n;
            offset += n;
            if n == 0 {
                if offset < page.total {
                    warn!(offset, total = page.total, "empty results page before reported total");
                }
                break;
            }
        }
        info!(
            fetched = report.fetched,
            linked = report.linked,
            matched_by_hash = report.matched_by_hash,
            created = report.created,
            updated = report.updated,
            errors = report.errors,
            "results synced"
        );
        Ok(report)
    }

    fn ingest(&self, record: &ExternalRecord, report: &mut IngestReport) -> Result<(), PipelineError> {
        let by_id = self
            .repo
            .search_one(&Filter::new().eq("external_id", record.id.as_str()))?;
        let existing = match by_id {
            Some(c) => {
                report.linked += 1;
                Some(c)
            }
            None if record.expression.trim().is_empty() => {
                debug!(external_id = %record.id, "record without expression");
                report.skipped += 1;
                return Ok(());
            }
            None => {
                let hash = identity_hash(&record.expression, &record.settings);
                let found = self.repo.find_by_hash(&hash)?;
                if found.is_some() {
                    report.matched_by_hash += 1;
                }
                found
            }
        };

        match existing {
            Some(candidate) => {
                let patch = merge_patch(&candidate, record);
                if patch.is_empty() {
                    report.unchanged += 1;
                } else {
                    self.repo.update(candidate.id, &patch)?;
                    debug!(
                        candidate = %candidate.id,
                        external_id = %record.id,
                        hash = candidate.expression_hash.short(),
                        "merged record"
                    );
                    report.updated += 1;
                }
            }
            None => {
                let outcome = self.repo.create(draft_from_record(record))?;
                debug!(candidate = %outcome.id(), external_id = %record.id, "new candidate from record");
                report.created += 1;
            }
        }
        Ok(())
    }

    /// Fetch P&L for up to `limit` simulated candidates that lack it.
    ///
    /// A failed fetch triggers reauthentication and the auth cooldown, then
    /// the pass moves on to the next candidate.
    pub fn fetch_pnl(&self, limit: Option<usize>) -> Result<PnlReport, PipelineError> {
        let filter = Filter::new().is_null("external_id", false).is_null("pnl", true);
        let mut candidates = self.repo.search(&filter)?;
        if let Some(limit) = limit {
            candidates.truncate(limit);
        }

        let mut report = PnlReport::default();
        for candidate in candidates {
            let Some(external_id) = candidate.external_id.clone() else {
                continue;
            };
            report.attempted += 1;
            match self.service.fetch_pnl(&external_id) {
                Ok(pnl) => {
                    let patch = CandidatePatch {
                        pnl: Some(pnl),
                        ..CandidatePatch::default()
                    };
                    self.repo.update(candidate.id, &patch)?;
                    report.stored += 1;
                }
                Err(e) => {
                    warn!(
                        candidate = %candidate.id,
                        external_id = %external_id,
                        error = %e,
                        "P&L fetch failed"
                    );
                    report.failed += 1;
                    self.recover(&e);
                }
            }
        }
        info!(attempted = report.attempted, stored = report.stored, failed = report.failed, "P&L pass finished");
        Ok(report)
    }
}
