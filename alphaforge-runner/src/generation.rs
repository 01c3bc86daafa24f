//! Level pipeline: expand templates into candidates.
//!
//! - Level 1 binds catalog data fields into level-1 templates.
//! - Level 2 binds level-1 candidates that cleared the level-2 gate into the
//!   `sig1` slot of level-2 templates.
//! - Level 3 does the same with level-2 survivors and `sig2`.
//!
//! Other slots take the literal values listed in the template's
//! `default_fields`. Every run is tagged with a batch number; re-running with
//! the same batch number and seed inserts nothing new because identical
//! candidates collapse on their identity hash.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use alphaforge_core::binding::{render_binding, FieldBinding, ParentRef};
use alphaforge_core::domain::{BatchNo, CandidateDraft, ExpressionHash, Level, Settings, Template, TemplateId};
use alphaforge_core::expression::{compile, normalize, validate};
use alphaforge_core::rng::SeedHierarchy;
use alphaforge_core::sampler::{sample, FieldSpace, SampleOptions};

use crate::catalog::Catalog;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::field_select;
use crate::repository::{CandidateRepository, CreateOutcome, Filter};
use crate::service::SimulationService;

/// Counts for one generation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationReport {
    pub batch_no: BatchNo,
    pub level: Level,
    /// Templates expanded.
    pub templates: usize,
    /// Templates skipped because a slot had nothing to bind.
    pub skipped_templates: usize,
    /// Inputs bound into the level's input slot.
    pub inputs: usize,
    /// Bindings that produced a valid candidate.
    pub generated: usize,
    pub inserted: usize,
    pub deduplicated: usize,
    /// Bindings rejected before persistence.
    pub rejected: usize,
}

impl GenerationReport {
    fn new(batch_no: BatchNo, level: Level) -> Self {
        Self {
            batch_no,
            level,
            templates: 0,
            skipped_templates: 0,
            inputs: 0,
            generated: 0,
            inserted: 0,
            deduplicated: 0,
            rejected: 0,
        }
    }
}

/// Drafts persisted per repository commit.
const INSERT_CHUNK: usize = 2_000;

/// `<YYYY-MM-DD HH:MM:SS>_<level name>`.
pub fn batch_no_for(level: Level, now: DateTime<Utc>) -> BatchNo {
    BatchNo::new(format!("{}_{}", now.format("%Y-%m-%d %H:%M:%S"), level.name()))
}

pub struct LevelPipeline {
    repo: Arc<dyn CandidateRepository>,
    catalog: Arc<dyn Catalog>,
    service: Option<Arc<dyn SimulationService>>,
    config: PipelineConfig,
}

impl LevelPipeline {
    pub fn new(repo: Arc<dyn CandidateRepository>, catalog: Arc<dyn Catalog>, config: PipelineConfig) -> Self {
        Self {
            repo,
            catalog,
            service: None,
            config,
        }
    }

    /// Use the service's pyramid counts to weight level-1 field selection.
    pub fn with_service(mut self, service: Arc<dyn SimulationService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Generate candidates for `level`.
    ///
    /// `parent_scope` narrows the parent selection of levels 2 and 3 (for
    /// example to one batch number); it is ignored for level 1.
    pub fn generate(
        &self,
        level: Level,
        batch_no: Option<BatchNo>,
        parent_scope: &Filter,
    ) -> Result<GenerationReport, PipelineError> {
        let batch_no = batch_no.unwrap_or_else(|| batch_no_for(level, Utc::now()));
        let seeds = self.config.generation.seed.map(SeedHierarchy::new);
        let mut report = GenerationReport::new(batch_no.clone(), level);

        let templates = self.templates_for(level)?;
        if templates.is_empty() {
            warn!(level = %level, "no templates for level");
            return Ok(report);
        }

        let inputs = self.inputs(level, &batch_no, seeds.as_ref(), parent_scope)?;
        report.inputs = inputs.len();
        info!(level = %level, batch_no = %batch_no, templates = templates.len(), inputs = inputs.len(), "generating");

        for template in &templates {
            self.expand(template, level, &batch_no, seeds.as_ref(), &inputs, &mut report)?;
        }

        info!(
            batch_no = %batch_no,
            generated = report.generated,
            inserted = report.inserted,
            deduplicated = report.deduplicated,
            rejected = report.rejected,
            "generation finished"
        );
        Ok(report)
    }

    fn templates_for(&self, level: Level) -> Result<Vec<Template>, PipelineError> {
        let requested = &self.config.generation.templates;
        if requested.is_empty() {
            return Ok(self.catalog.templates(level)?);
        }
        let mut out = Vec::with_capacity(requested.len());
        for &id in requested {
            let template = self.catalog.template(id)?.ok_or(PipelineError::UnknownTemplate(id))?;
            if template.level == level {
                out.push(template);
            } else {
                debug!(template = %id, template_level = %template.level, level = %level, "template belongs to another level");
            }
        }
        Ok(out)
    }

    fn inputs(
        &self,
        level: Level,
        batch_no: &BatchNo,
        seeds: Option<&SeedHierarchy>,
        parent_scope: &Filter,
    ) -> Result<Vec<FieldBinding>, PipelineError> {
        match level {
            Level::Template | Level::First => {
                let mut rng = match seeds {
                    Some(s) => s.rng_for(batch_no, TemplateId(0), "fields"),
                    None => StdRng::from_entropy(),
                };
                let cfg = &self.config.generation;
                let fields = match &self.service {
                    Some(service) => {
                        let pyramids = service.pyramid_alpha_counts()?;
                        field_select::select_fields(self.catalog.as_ref(), &pyramids, cfg, &mut rng)?
                    }
                    None => field_select::all_fields(self.catalog.as_ref(), cfg, &mut rng)?,
                };
                Ok(fields.into_iter().map(FieldBinding::DataField).collect())
            }
            Level::Second | Level::Third => {
                let Some(filter) = self.config.promotion.parent_filter(level) else {
                    return Ok(Vec::new());
                };
                let gates = &self.config.promotion;
                let parents = self.repo.search(&filter.and(parent_scope.clone()))?;
                Ok(parents
                    .iter()
                    .filter(|c| match gates.check(c, level) {
                        Ok(()) => true,
                        Err(reason) => {
                            debug!(candidate = %c.id, ?reason, "parent does not clear the gate");
                            false
                        }
                    })
                    .map(|c| FieldBinding::Candidate(ParentRef::from(c)))
                    .collect())
            }
        }
    }

    fn expand(
        &self,
        template: &Template,
        level: Level,
        batch_no: &BatchNo,
        seeds: Option<&SeedHierarchy>,
        inputs: &[FieldBinding],
        report: &mut GenerationReport,
    ) -> Result<(), PipelineError> {
        let cfg = &self.config.generation;
        let compiled = compile(&template.body);
        let input_slot = level.input_field();

        let mut space: FieldSpace<FieldBinding> = FieldSpace::new();
        for (slot, values) in &template.default_fields {
            if slot != input_slot && compiled.has_slot(slot) {
                space.insert(slot.as_str(), values.iter().map(|v| FieldBinding::from(v.as_str())).collect());
            }
        }
        if compiled.has_slot(input_slot) {
            space.insert(input_slot, inputs.to_vec());
        }

        if let Some(missing) = compiled.slots().into_iter().find(|s| !space.contains(s)) {
            warn!(template = %template.id, slot = missing, "template slot has no values, skipping");
            report.skipped_templates += 1;
            return Ok(());
        }
        report.templates += 1;

        let mut options = SampleOptions::limited(cfg.batch_size);
        if let Some(s) = seeds {
            options = options.with_seed(s.sub_seed(batch_no, template.id, "bindings"));
        }

        let mut drafts = Vec::new();
        for binding in sample(space, &options)? {
            let rendered = match render_binding(&compiled, &binding, input_slot, &self.config.grouping) {
                Ok(r) => r,
                Err(e) => {
                    warn!(template = %template.id, error = %e, "binding rejected");
                    report.rejected += 1;
                    continue;
                }
            };
            let expression = normalize(&rendered.expression);
            if let Err(e) = validate(&expression, cfg.max_expression_len) {
                warn!(template = %template.id, expression = %expression, error = %e, "binding rejected");
                report.rejected += 1;
                continue;
            }

            let settings = self.settings_for(level, rendered.base_settings);
            let mut draft = CandidateDraft::generated(expression, settings, level)
                .with_template(template.id)
                .with_batch_no(batch_no.clone());
            if let Some(parent) = rendered.parent_id {
                draft = draft.with_parent(parent);
            }

            report.generated += 1;
            drafts.push(draft);
            if drafts.len() >= INSERT_CHUNK {
                self.insert(std::mem::take(&mut drafts), report)?;
            }
        }
        self.insert(drafts, report)
    }

    fn insert(&self, drafts: Vec<CandidateDraft>, report: &mut GenerationReport) -> Result<(), PipelineError> {
        if drafts.is_empty() {
            return Ok(());
        }
        let hashes: Vec<ExpressionHash> = drafts.iter().map(|d| d.expression_hash.clone()).collect();
        for (outcome, hash) in self.repo.create_many(drafts)?.into_iter().zip(&hashes) {
            match outcome {
                CreateOutcome::Created(_) => report.inserted += 1,
                CreateOutcome::Duplicate(id) => {
                    debug!(hash = hash.short(), existing = %id, "duplicate candidate");
                    report.deduplicated += 1;
                }
            }
        }
        Ok(())
    }

    /// Level 1 starts from the defaults with the field's context on top;
    /// higher levels inherit the parent's settings. Overrides apply last.
    fn settings_for(&self, level: Level, base: Option<Settings>) -> Settings {
        let cfg = &self.config.generation;
        let base = match (level, base) {
            (Level::Template | Level::First, Some(field)) => cfg.default_settings.merged(&field),
            (Level::Second | Level::Third, Some(parent)) => parent,
            (_, None) => cfg.default_settings.clone(),
        };
        base.merged(&cfg.overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn batch_no_format() {
        let t = Utc.with_ymd_and_hms(2026, 5, 4, 9, 30, 0).unwrap();
        assert_eq!(batch_no_for(Level::First, t).as_str(), "2026-05-04 09:30:00_first_level");
        assert_eq!(batch_no_for(Level::Third, t).as_str(), "2026-05-04 09:30:00_third_level");
    }
}
