//! Batch simulation orchestrator.
//!
//! Selects PENDING candidates, groups them by execution context
//! `(region, delay, universe)`, packs each group into sub-batches of
//! `submit_size`, and submits them through a private worker pool of
//! `concurrency` threads.
//!
//! Workers only talk to the simulation service. Every storage write happens
//! on the coordinating thread:
//! - a sub-batch is claimed (PENDING to SIMULATING) in one commit right before
//!   dispatch, and only the rows that were still PENDING are submitted;
//! - its verdicts are committed in one commit when the worker reports back.
//!   A verdict the row's current state no longer admits (another process
//!   already moved it further) is dropped and the rest still commit.
//!
//! A crash therefore leaves only whole sub-batches in SIMULATING, which
//! [`Orchestrator::requeue_stale`] can put back into PENDING. Neither a
//! storage error nor a service error on one sub-batch stops its siblings.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use alphaforge_core::domain::{Candidate, CandidateId, CandidatePatch, ContextKey};
use alphaforge_core::lifecycle::CandidateState;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::rate_limit::RateLimiter;
use crate::repository::{CandidateRepository, Filter};
use crate::service::{ItemOutcome, ItemResult, ServiceError, SimulationRequest, SimulationService};

/// Counts for one orchestrator pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// PENDING candidates matched by the selector.
    pub selected: usize,
    /// Distinct execution contexts.
    pub groups: usize,
    pub sub_batches: usize,
    /// Sub-batches actually handed to a worker.
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    /// Candidates left SIMULATING without a verdict.
    pub unresolved: usize,
    /// Sub-batches whose submission errored as a whole.
    pub errored: usize,
    /// Selected candidates that were no longer PENDING at dispatch.
    pub skipped: usize,
}

/// Candidates of one context, submitted together.
#[derive(Debug, Clone, PartialEq)]
pub struct SubBatch {
    pub context: ContextKey,
    pub requests: Vec<SimulationRequest>,
}

impl SubBatch {
    pub fn ids(&self) -> Vec<CandidateId> {
        self.requests.iter().map(|r| r.candidate_id).collect()
    }
}

/// Group by context (in context order, candidates in input order) and chunk.
pub fn plan_sub_batches(candidates: Vec<Candidate>, submit_size: usize) -> Vec<SubBatch> {
    let mut groups: BTreeMap<ContextKey, Vec<SimulationRequest>> = BTreeMap::new();
    for c in candidates {
        groups.entry(c.context_key()).or_default().push(SimulationRequest {
            candidate_id: c.id,
            expression: c.expression,
            settings: c.settings,
        });
    }
    let size = submit_size.max(1);
    groups
        .into_iter()
        .flat_map(|(context, requests)| {
            requests
                .chunks(size)
                .map(|chunk| SubBatch {
                    context: context.clone(),
                    requests: chunk.to_vec(),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

type WorkerReport = (usize, Result<Vec<ItemResult>, ServiceError>);

pub struct Orchestrator {
    repo: Arc<dyn CandidateRepository>,
    service: Arc<dyn SimulationService>,
    limiter: Arc<RateLimiter>,
    submit_size: usize,
    page_size: usize,
    auth_cooldown: Duration,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
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
            submit_size: config.batch.submit_size,
            page_size: config.batch.page_size,
            auth_cooldown: config.rate_limit.auth_cooldown(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops dispatching further sub-batches once set. Sub-batches
    /// already in flight are still committed.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Every PENDING candidate matching `selector`.
    ///
    /// Pages until a page comes back empty; a short page alone does not end
    /// the scan. An empty page before the reported total is logged.
    pub fn select_pending(&self, selector: &Filter) -> Result<Vec<Candidate>, PipelineError> {
        let filter = selector.clone().and(Filter::state(CandidateState::Pending));
        let mut out = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.repo.search_page(&filter, offset, self.page_size)?;
            let n = page.items.len();
            out.extend(page.items);
            offset += n;
            if n == 0 {
                if offset < page.total {
                    warn!(offset, total = page.total, "empty page before reported total");
                }
                break;
            }
        }
        Ok(out)
    }

    pub fn run_batch(&self, selector: &Filter, concurrency: usize) -> Result<BatchSummary, PipelineError> {
        let concurrency = concurrency.max(1);
        let candidates = self.select_pending(selector)?;
        let mut summary = BatchSummary {
            selected: candidates.len(),
            groups: candidates.iter().map(Candidate::context_key).collect::<HashSet<_>>().len(),
            ..BatchSummary::default()
        };
        let batches = plan_sub_batches(candidates, self.submit_size);
        summary.sub_batches = batches.len();
        if batches.is_empty() {
            info!("no pending candidates");
            return Ok(summary);
        }
        info!(
            selected = summary.selected,
            groups = summary.groups,
            sub_batches = summary.sub_batches,
            concurrency,
            "starting batch run"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency)
            .thread_name(|i| format!("alphaforge-sim-{i}"))
            .build()
            .map_err(|e| PipelineError::WorkerPool(e.to_string()))?;
        let (tx, rx) = mpsc::channel::<WorkerReport>();

        let mut queue = batches.into_iter().enumerate();
        let mut dispatched: HashMap<usize, SubBatch> = HashMap::new();
        let mut remaining = summary.sub_batches;
        loop {
            while dispatched.len() < concurrency && !self.cancel.load(Ordering::Relaxed) {
                let Some((index, planned)) = queue.next() else {
                    break;
                };
                remaining -= 1;
                let Some(batch) = self.claim(planned, &mut summary) else {
                    continue;
                };
                debug!(context = %batch.context, size = batch.requests.len(), "dispatching sub-batch");

                let service = Arc::clone(&self.service);
                let requests = batch.requests.clone();
                let tx = tx.clone();
                pool.spawn(move || {
                    let result = service.submit_batch(&requests);
                    // the coordinator outlives every worker
                    let _ = tx.send((index, result));
                });
                dispatched.insert(index, batch);
                summary.dispatched += 1;
            }
            if dispatched.is_empty() {
                break;
            }
            let (index, result) = rx
                .recv()
                .map_err(|e| PipelineError::WorkerPool(e.to_string()))?;
            if let Some(batch) = dispatched.remove(&index) {
                self.commit(&batch, result, &mut summary);
            }
        }

        if remaining > 0 {
            info!(remaining, "batch run cancelled");
        }
        info!(
            completed = summary.completed,
            failed = summary.failed,
            unresolved = summary.unresolved,
            errored = summary.errored,
            skipped = summary.skipped,
            "batch run finished"
        );
        Ok(summary)
    }

    /// Mark the sub-batch SIMULATING, keeping only the rows still PENDING.
    /// `None` when nothing is left to submit.
    fn claim(&self, mut batch: SubBatch, summary: &mut BatchSummary) -> Option<SubBatch> {
        let ids = batch.ids();
        let claimed: HashSet<CandidateId> =
            match self.repo.claim(&ids, CandidateState::Pending, CandidateState::Simulating) {
                Ok(claimed) => claimed.into_iter().collect(),
                Err(e) => {
                    warn!(
                        context = %batch.context,
                        candidates = ?ids,
                        error = %e,
                        "could not mark sub-batch, skipping it"
                    );
                    summary.skipped += ids.len();
                    return None;
                }
            };
        if claimed.len() < ids.len() {
            let lost: Vec<CandidateId> = ids.iter().copied().filter(|id| !claimed.contains(id)).collect();
            debug!(context = %batch.context, candidates = ?lost, "no longer PENDING, not submitted");
            summary.skipped += lost.len();
            batch.requests.retain(|r| claimed.contains(&r.candidate_id));
        }
        (!batch.requests.is_empty()).then_some(batch)
    }

    /// Apply one sub-batch outcome in a single commit. Candidates without an
    /// applied verdict stay SIMULATING and count as unresolved.
    fn commit(&self, batch: &SubBatch, result: Result<Vec<ItemResult>, ServiceError>, summary: &mut BatchSummary) {
        let items = match result {
            Ok(items) => items,
            Err(e) => {
                summary.errored += 1;
                summary.unresolved += batch.requests.len();
                warn!(
                    context = %batch.context,
                    candidates = ?batch.ids(),
                    error = %e,
                    "sub-batch failed, candidates stay SIMULATING"
                );
                if e.needs_reauth() {
                    self.limiter.cooldown(self.auth_cooldown);
                    if let Err(e) = self.service.reauthenticate() {
                        warn!(error = %e, "reauthentication failed");
                    }
                }
                return;
            }
        };

        let members: HashSet<CandidateId> = batch.ids().into_iter().collect();
        let mut verdicts: BTreeMap<CandidateId, ItemOutcome> = BTreeMap::new();
        for item in items {
            if !members.contains(&item.candidate_id) {
                warn!(candidate = %item.candidate_id, "verdict for a candidate outside the sub-batch");
                continue;
            }
            if let Some(previous) = verdicts.insert(item.candidate_id, item.outcome) {
                warn!(candidate = %item.candidate_id, dropped = ?previous, "repeated verdict, keeping the last");
            }
        }

        let mut updates = Vec::with_capacity(verdicts.len());
        for (candidate_id, outcome) in verdicts {
            match outcome {
                ItemOutcome::Completed { external_id } => {
                    debug!(candidate = %candidate_id, external_id = %external_id, "simulated");
                    updates.push((
                        candidate_id,
                        CandidatePatch {
                            state: Some(CandidateState::Simulated),
                            external_id: Some(external_id),
                            ..CandidatePatch::default()
                        },
                    ));
                }
                ItemOutcome::Failed { reason } => {
                    warn!(candidate = %candidate_id, reason = %reason, "simulation failed");
                    updates.push((candidate_id, CandidatePatch::state(CandidateState::SimulatedFail)));
                }
                ItemOutcome::Unresolved { reason } => {
                    debug!(candidate = %candidate_id, reason = %reason, "no verdict");
                }
            }
        }

        let dropped: HashSet<CandidateId> = match self.repo.update_admitted(&updates) {
            Ok(dropped) => dropped.into_iter().collect(),
            Err(e) => {
                warn!(
                    context = %batch.context,
                    candidates = ?batch.ids(),
                    error = %e,
                    "could not store verdicts, candidates stay SIMULATING"
                );
                summary.unresolved += batch.requests.len();
                return;
            }
        };
        if !dropped.is_empty() {
            warn!(candidates = ?dropped, "verdicts superseded by a later state, not stored");
        }

        let mut applied = 0;
        for (id, patch) in &updates {
            if dropped.contains(id) {
                continue;
            }
            applied += 1;
            match patch.state {
                Some(CandidateState::Simulated) => summary.completed += 1,
                Some(CandidateState::SimulatedFail) => summary.failed += 1,
                _ => {}
            }
        }
        summary.unresolved += batch.requests.len() - applied;
    }

    /// See [`requeue_stale`].
    pub fn requeue_stale(&self, selector: &Filter) -> Result<usize, PipelineError> {
        requeue_stale(self.repo.as_ref(), selector)
    }
}

/// Put SIMULATING candidates that never got an external id back into
/// PENDING. Returns how many were requeued.
pub fn requeue_stale(repo: &dyn CandidateRepository, selector: &Filter) -> Result<usize, PipelineError> {
    let filter = selector
        .clone()
        .and(Filter::state(CandidateState::Simulating))
        .is_null("external_id", true);
    let ids: Vec<CandidateId> = repo.search(&filter)?.iter().map(|c| c.id).collect();
    if ids.is_empty() {
        return Ok(0);
    }
    let n = repo.bulk_update_state(&ids, CandidateState::Pending)?;
    info!(requeued = n, "requeued stale candidates");
    Ok(n)
}
