//! The candidate (alpha) record and its create/update shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BatchNo, CandidateId, ExpressionHash, ExternalId, TemplateId};
use super::level::Level;
use super::settings::{ContextKey, Settings};
use crate::identity::identity_hash;
use crate::lifecycle::CandidateState;

/// A generated trading-signal expression plus its evaluation context and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub expression_hash: ExpressionHash,
    pub expression: String,
    pub settings: Settings,
    pub level: Level,
    pub template_id: Option<TemplateId>,
    /// Candidate this one was derived from; only set for level ≥ 2.
    pub parent_id: Option<CandidateId>,
    pub batch_no: Option<BatchNo>,
    pub state: CandidateState,
    pub sharpe: Option<f64>,
    pub fitness: Option<f64>,
    pub operator_count: Option<u32>,
    pub external_id: Option<ExternalId>,
    /// Opaque P&L record set as returned by the simulation service.
    pub pnl: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub external_created_at: Option<DateTime<Utc>>,
    pub external_modified_at: Option<DateTime<Utc>>,
    pub external_submitted_at: Option<DateTime<Utc>>,
}

impl Candidate {
    pub fn context_key(&self) -> ContextKey {
        self.settings.context_key()
    }

    /// Materialize a stored record from a draft and an assigned id.
    pub fn from_draft(id: CandidateId, draft: CandidateDraft, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            expression_hash: draft.expression_hash,
            expression: draft.expression,
            settings: draft.settings,
            level: draft.level,
            template_id: draft.template_id,
            parent_id: draft.parent_id,
            batch_no: draft.batch_no,
            state: draft.state,
            sharpe: draft.sharpe,
            fitness: draft.fitness,
            operator_count: draft.operator_count,
            external_id: draft.external_id,
            pnl: None,
            created_at,
            external_created_at: draft.external_created_at,
            external_modified_at: draft.external_modified_at,
            external_submitted_at: draft.external_submitted_at,
        }
    }

    /// Apply every `Some` field of `patch`.
    pub fn apply(&mut self, patch: &CandidatePatch) {
        if let Some(state) = patch.state {
            self.state = state;
        }
        if let Some(ref batch_no) = patch.batch_no {
            self.batch_no = Some(batch_no.clone());
        }
        if let Some(sharpe) = patch.sharpe {
            self.sharpe = Some(sharpe);
        }
        if let Some(fitness) = patch.fitness {
            self.fitness = Some(fitness);
        }
        if let Some(count) = patch.operator_count {
            self.operator_count = Some(count);
        }
        if let Some(ref external_id) = patch.external_id {
            self.external_id = Some(external_id.clone());
        }
        if let Some(ref pnl) = patch.pnl {
            self.pnl = Some(pnl.clone());
        }
        if let Some(ts) = patch.external_created_at {
            self.external_created_at = Some(ts);
        }
        if let Some(ts) = patch.external_modified_at {
            self.external_modified_at = Some(ts);
        }
        if let Some(ts) = patch.external_submitted_at {
            self.external_submitted_at = Some(ts);
        }
    }
}

/// Everything needed to insert a candidate; the repository assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateDraft {
    pub expression_hash: ExpressionHash,
    pub expression: String,
    pub settings: Settings,
    pub level: Level,
    pub template_id: Option<TemplateId>,
    pub parent_id: Option<CandidateId>,
    pub batch_no: Option<BatchNo>,
    pub state: CandidateState,
    pub sharpe: Option<f64>,
    pub fitness: Option<f64>,
    pub operator_count: Option<u32>,
    pub external_id: Option<ExternalId>,
    pub external_created_at: Option<DateTime<Utc>>,
    pub external_modified_at: Option<DateTime<Utc>>,
    pub external_submitted_at: Option<DateTime<Utc>>,
}

impl CandidateDraft {
    /// A freshly generated candidate, PENDING, with its identity hash computed
    /// from `expression` and `settings`.
    pub fn generated(expression: String, settings: Settings, level: Level) -> Self {
        let expression_hash = identity_hash(&expression, &settings);
        Self {
            expression_hash,
            expression,
            settings,
            level,
            template_id: None,
            parent_id: None,
            batch_no: None,
            state: CandidateState::Pending,
            sharpe: None,
            fitness: None,
            operator_count: None,
            external_id: None,
            external_created_at: None,
            external_modified_at: None,
            external_submitted_at: None,
        }
    }

    pub fn with_template(mut self, template_id: TemplateId) -> Self {
        self.template_id = Some(template_id);
        self
    }

    pub fn with_parent(mut self, parent_id: CandidateId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_batch_no(mut self, batch_no: BatchNo) -> Self {
        self.batch_no = Some(batch_no);
        self
    }
}

/// Partial update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidatePatch {
    pub state: Option<CandidateState>,
    pub batch_no: Option<BatchNo>,
    pub sharpe: Option<f64>,
    pub fitness: Option<f64>,
    pub operator_count: Option<u32>,
    pub external_id: Option<ExternalId>,
    pub pnl: Option<serde_json::Value>,
    pub external_created_at: Option<DateTime<Utc>>,
    pub external_modified_at: Option<DateTime<Utc>>,
    pub external_submitted_at: Option<DateTime<Utc>>,
}

impl CandidatePatch {
    pub fn state(state: CandidateState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> CandidateDraft {
        CandidateDraft::generated("ts_mean(close,20)".into(), Settings::default_simulation(), Level::First)
    }

    #[test]
    fn generated_draft_is_pending_with_hash() {
        let d = draft();
        assert_eq!(d.state, CandidateState::Pending);
        assert_eq!(d.expression_hash, identity_hash(&d.expression, &d.settings));
        assert!(d.parent_id.is_none());
    }

    #[test]
    fn apply_only_touches_some_fields() {
        let mut c = Candidate::from_draft(CandidateId(1), draft(), Utc::now());
        c.sharpe = Some(0.5);

        let patch = CandidatePatch {
            fitness: Some(1.1),
            external_id: Some(ExternalId::new("abc")),
            ..CandidatePatch::default()
        };
        c.apply(&patch);

        assert_eq!(c.sharpe, Some(0.5));
        assert_eq!(c.fitness, Some(1.1));
        assert_eq!(c.external_id.as_ref().map(ExternalId::as_str), Some("abc"));
        assert_eq!(c.state, CandidateState::Pending);
    }

    #[test]
    fn empty_patch() {
        assert!(CandidatePatch::default().is_empty());
        assert!(!CandidatePatch::state(CandidateState::Simulating).is_empty());
    }
}
