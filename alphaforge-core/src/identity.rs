//! Candidate identity, the content key that deduplicates the population.
//!
//! `identity_hash(expression, settings)`:
//! 1. canonicalize the expression (`expression::normalize`);
//! 2. keep only the allow-listed settings keys, serialized as compact JSON
//!    with sorted keys (`BTreeMap` gives deterministic order);
//! 3. concatenate, lower-case, BLAKE3, hex.
//!
//! Two candidates with the same tradable signal under the same risk/universe
//! context collapse to one hash even when unrelated settings (test period,
//! visualization, language, ...) differ.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::{ExpressionHash, Settings};
use crate::expression::normalize;

/// Settings keys that participate in identity.
///
/// Which keys belong here is a policy decision owned by the research team;
/// changing the list re-keys the whole population.
pub const HASH_SETTING_KEYS: [&str; 10] = [
    "region",
    "universe",
    "delay",
    "decay",
    "maxTrade",
    "nanHandling",
    "neutralization",
    "pasteurization",
    "truncation",
    "instrumentType",
];

/// Compact key-sorted JSON of the allow-listed settings.
pub fn identity_settings(settings: &Settings) -> String {
    let subset: BTreeMap<String, Value> = settings.subset(&HASH_SETTING_KEYS);
    // BTreeMap<String, Value> always serializes
    serde_json::to_string(&subset).unwrap_or_default()
}

/// Content hash of a candidate.
pub fn identity_hash(expression: &str, settings: &Settings) -> ExpressionHash {
    let material = format!("{}{}", normalize(expression), identity_settings(settings)).to_lowercase();
    let hash = blake3::hash(material.as_bytes());
    ExpressionHash(hash.to_hex().to_string())
}
