//! Shared fixtures for runner integration tests: a scriptable simulation
//! service double and catalog builders.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use alphaforge_core::domain::{DataField, DataFieldKind, ExternalId, Level, Operator, Template, TemplateId};
use alphaforge_runner::catalog::{CatalogData, InMemoryCatalog};
use alphaforge_runner::config::PipelineConfig;
use alphaforge_runner::service::{
    ExternalRecord, FieldScope, ItemOutcome, ItemResult, PyramidCount, ResultQuery, ResultsPage, ServiceError,
    SimulationRequest, SimulationService,
};

type SubmitFn = dyn Fn(&[SimulationRequest]) -> Result<Vec<ItemResult>, ServiceError> + Send + Sync;

/// Every item completes with external id `ext-<candidate id>`.
pub fn complete_all(batch: &[SimulationRequest]) -> Result<Vec<ItemResult>, ServiceError> {
    Ok(batch
        .iter()
        .map(|r| ItemResult {
            candidate_id: r.candidate_id,
            outcome: ItemOutcome::Completed {
                external_id: ExternalId::new(format!("ext-{}", r.candidate_id)),
            },
        })
        .collect())
}

pub struct FakeService {
    submit: Box<SubmitFn>,
    delay: Duration,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub submissions: Mutex<Vec<Vec<SimulationRequest>>>,
    pub records: Mutex<Vec<ExternalRecord>>,
    pub page_calls: AtomicUsize,
    /// The next this-many results-page calls time out.
    pub failing_pages: AtomicUsize,
    pub failing_pnl: Mutex<HashSet<String>>,
    pub pnl_calls: AtomicUsize,
    pub reauth_calls: AtomicUsize,
    pub operators: Mutex<Vec<Operator>>,
    pub fields: Mutex<Vec<DataField>>,
    pub pyramids: Mutex<Vec<PyramidCount>>,
}

impl FakeService {
    pub fn new() -> Self {
        Self::with_submit(complete_all)
    }

    pub fn with_submit(
        submit: impl Fn(&[SimulationRequest]) -> Result<Vec<ItemResult>, ServiceError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            submit: Box::new(submit),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            submissions: Mutex::new(Vec::new()),
            records: Mutex::new(Vec::new()),
            page_calls: AtomicUsize::new(0),
            failing_pages: AtomicUsize::new(0),
            failing_pnl: Mutex::new(HashSet::new()),
            pnl_calls: AtomicUsize::new(0),
            reauth_calls: AtomicUsize::new(0),
            operators: Mutex::new(Vec::new()),
            fields: Mutex::new(Vec::new()),
            pyramids: Mutex::new(Vec::new()),
        }
    }

    /// Hold each submission for `delay` so overlapping calls are observable.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn submitted_ids(&self) -> Vec<Vec<u64>> {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.iter().map(|r| r.candidate_id.0).collect())
            .collect()
    }
}

impl SimulationService for FakeService {
    fn submit_batch(&self, batch: &[SimulationRequest]) -> Result<Vec<ItemResult>, ServiceError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.submissions.lock().unwrap().push(batch.to_vec());
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let result = (self.submit)(batch);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn fetch_results_page(&self, _query: &ResultQuery, offset: usize, limit: usize) -> Result<ResultsPage, ServiceError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_pages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ServiceError::Timeout("results page".into()));
        }
        let records = self.records.lock().unwrap();
        let items = records.iter().skip(offset).take(limit).cloned().collect();
        Ok(ResultsPage {
            items,
            total: records.len(),
        })
    }

    fn fetch_pnl(&self, id: &ExternalId) -> Result<Value, ServiceError> {
        self.pnl_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_pnl.lock().unwrap().contains(id.as_str()) {
            return Err(ServiceError::Status {
                status: 500,
                body: "recordset unavailable".into(),
            });
        }
        Ok(json!({"schema": {"name": "pnl"}, "records": [["2026-01-02", 10.5]], "alpha": id.as_str()}))
    }

    fn list_operators(&self) -> Result<Vec<Operator>, ServiceError> {
        Ok(self.operators.lock().unwrap().clone())
    }

    fn list_fields(&self, scope: &FieldScope) -> Result<Vec<DataField>, ServiceError> {
        Ok(self
            .fields
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.region == scope.region && f.delay == scope.delay && f.universe == scope.universe)
            .cloned()
            .collect())
    }

    fn pyramid_alpha_counts(&self) -> Result<Vec<PyramidCount>, ServiceError> {
        Ok(self.pyramids.lock().unwrap().clone())
    }

    fn reauthenticate(&self) -> Result<(), ServiceError> {
        self.reauth_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Catalog fixtures ──

pub fn field(name: &str, kind: DataFieldKind, region: &str, category: &str) -> DataField {
    DataField {
        name: name.into(),
        kind,
        region: region.into(),
        universe: "TOP3000".into(),
        delay: 1,
        category: category.into(),
        sub_category: None,
        description: None,
        coverage: 1.0,
        user_count: 0,
        alpha_count: 0,
    }
}

pub fn template(id: u64, level: Level, body: &str, defaults: &[(&str, &[&str])]) -> Template {
    Template {
        id: TemplateId(id),
        title: format!("t{id}"),
        level,
        body: body.into(),
        default_fields: defaults
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect::<BTreeMap<_, _>>(),
    }
}

pub fn operator(name: &str) -> Operator {
    Operator {
        name: name.into(),
        category: "Time Series".into(),
        definition: format!("{name}(x, d)"),
        scope: vec!["REGULAR".into()],
        description: None,
    }
}

pub fn catalog(templates: Vec<Template>, data_fields: Vec<DataField>) -> InMemoryCatalog {
    InMemoryCatalog::new(CatalogData {
        templates,
        data_fields,
        operators: Vec::new(),
    })
}

/// Config with a fixed seed and no pacing-relevant delays.
pub fn seeded_config(seed: u64) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.generation.seed = Some(seed);
    config.rate_limit.auth_cooldown_secs = 0;
    config.rate_limit.retry_cooldown_secs = 0;
    config
}
