//! AlphaForge Core: domain model, template compiler, sampler, identity, lifecycle.
//!
//! This crate is pure and synchronous:
//! - Domain types (candidates, templates, data fields, operators, settings)
//! - Template compilation and canonical expression text
//! - Bounded random sampling over Cartesian products
//! - Content identity hashing for deduplication
//! - Candidate lifecycle state machine
//! - Typed slot bindings and deterministic seed derivation

pub mod binding;
pub mod domain;
pub mod expression;
pub mod identity;
pub mod lifecycle;
pub mod rng;
pub mod sampler;

pub use binding::{FieldBinding, GroupingRule, ParentRef};
pub use identity::identity_hash;
pub use lifecycle::CandidateState;
pub use sampler::{sample, FieldSpace, SampleOptions};
