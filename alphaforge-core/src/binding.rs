//! Typed slot bindings and their resolution into expression text.
//!
//! A sampled binding maps slot names to [`FieldBinding`]s. Resolution happens
//! once, when the binding is rendered into a template:
//!
//! - data field: `vec_avg(name)` for vector fields, `name` for matrix fields;
//! - candidate: its canonical expression;
//! - literal: itself, except that a slot whose name contains
//!   `country_universe` is wrapped in the grouping operator when the
//!   binding's region belongs to the multi-country group.
//!
//! The region comes from the settings of the level's input slot
//! (`data_field`, `sig1` or `sig2`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::{Candidate, CandidateId, DataField, Settings};
use crate::expression::{CompiledTemplate, ExpressionError};
use crate::sampler::Binding;

/// Slot-name marker that triggers the country grouping rewrite.
pub const COUNTRY_UNIVERSE_MARKER: &str = "country_universe";

/// A candidate used as an input to a higher-level template.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentRef {
    pub id: CandidateId,
    pub expression: String,
    pub settings: Settings,
}

impl From<&Candidate> for ParentRef {
    fn from(c: &Candidate) -> Self {
        Self {
            id: c.id,
            expression: c.expression.clone(),
            settings: c.settings.clone(),
        }
    }
}

/// Value bound to one template slot.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldBinding {
    DataField(DataField),
    Candidate(ParentRef),
    Literal(String),
}

impl FieldBinding {
    /// Settings carried by the bound entity, if any.
    pub fn settings(&self) -> Option<Settings> {
        match self {
            FieldBinding::DataField(f) => Some(f.settings()),
            FieldBinding::Candidate(p) => Some(p.settings.clone()),
            FieldBinding::Literal(_) => None,
        }
    }

    pub fn parent_id(&self) -> Option<CandidateId> {
        match self {
            FieldBinding::Candidate(p) => Some(p.id),
            _ => None,
        }
    }
}

impl From<&str> for FieldBinding {
    fn from(s: &str) -> Self {
        FieldBinding::Literal(s.to_string())
    }
}

/// Regions whose country universe slots need a grouping operator, and the
/// operator itself (`{}` marks where the literal goes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingRule {
    pub regions: Vec<String>,
    pub operator: String,
}

impl Default for GroupingRule {
    fn default() -> Self {
        Self {
            regions: vec!["ASI".into(), "EUR".into(), "GLB".into()],
            operator: "group_cartesian_product(country, {})".into(),
        }
    }
}

impl GroupingRule {
    pub fn applies(&self, slot: &str, region: Option<&str>) -> bool {
        slot.contains(COUNTRY_UNIVERSE_MARKER)
            && region.is_some_and(|r| self.regions.iter().any(|g| g == r))
    }

    pub fn wrap(&self, value: &str) -> String {
        self.operator.replacen("{}", value, 1)
    }
}

/// Text a single binding contributes to the expression.
pub fn resolve(slot: &str, binding: &FieldBinding, region: Option<&str>, grouping: &GroupingRule) -> String {
    match binding {
        FieldBinding::DataField(field) => field.expression_ref(),
        FieldBinding::Candidate(parent) => parent.expression.clone(),
        FieldBinding::Literal(value) if grouping.applies(slot, region) => grouping.wrap(value),
        FieldBinding::Literal(value) => value.clone(),
    }
}

/// Result of rendering one sampled binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub expression: String,
    /// Settings of the input slot's entity, before run overrides.
    pub base_settings: Option<Settings>,
    pub parent_id: Option<CandidateId>,
}

/// Resolve every binding and render `template`.
///
/// `input_slot` names the slot whose entity supplies the execution context
/// (region for grouping, base settings, lineage).
pub fn render_binding(
    template: &CompiledTemplate,
    binding: &Binding<FieldBinding>,
    input_slot: &str,
    grouping: &GroupingRule,
) -> Result<Rendered, ExpressionError> {
    let input = binding.get(input_slot);
    let base_settings = input.and_then(FieldBinding::settings);
    let region = base_settings.as_ref().and_then(|s| s.region().map(str::to_string));

    let text: BTreeMap<String, String> = binding
        .iter()
        .map(|(slot, b)| (slot.clone(), resolve(slot, b, region.as_deref(), grouping)))
        .collect();

    Ok(Rendered {
        expression: template.render(&text)?,
        base_settings,
        parent_id: input.and_then(FieldBinding::parent_id),
    })
}
