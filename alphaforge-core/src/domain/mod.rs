//! Domain types for AlphaForge

pub mod candidate;
pub mod catalog;
pub mod ids;
pub mod level;
pub mod settings;

pub use candidate::{Candidate, CandidateDraft, CandidatePatch};
pub use catalog::{DataField, DataFieldKind, Operator, Template};
pub use ids::{BatchNo, CandidateId, ExpressionHash, ExternalId, TemplateId};
pub use level::Level;
pub use settings::{ContextKey, Settings};
