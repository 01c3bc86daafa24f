//! Simulation settings: the evaluation context an expression runs under.
//!
//! Settings are an open key/value map because the simulation service owns
//! the schema; only region, universe and delay are interpreted locally
//! (they form the execution context a submission group must share).
//! Keys use the service's camelCase spelling (`instrumentType`, `nanHandling`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub const REGION: &str = "region";
pub const UNIVERSE: &str = "universe";
pub const DELAY: &str = "delay";

/// Key/value settings map with deterministic (sorted) key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(BTreeMap<String, Value>);

impl Settings {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Service defaults for a regular equity simulation.
    pub fn default_simulation() -> Self {
        let mut s = Self::new();
        s.insert("instrumentType", "EQUITY");
        s.insert(REGION, "USA");
        s.insert(UNIVERSE, "TOP3000");
        s.insert(DELAY, 1);
        s.insert("decay", 5);
        s.insert("neutralization", "SUBINDUSTRY");
        s.insert("truncation", 0.05);
        s.insert("pasteurization", "ON");
        s.insert("testPeriod", "P0Y0M");
        s.insert("unitHandling", "VERIFY");
        s.insert("nanHandling", "ON");
        s.insert("maxTrade", "ON");
        s.insert("language", "FASTEXPR");
        s.insert("visualization", false);
        s
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn region(&self) -> Option<&str> {
        self.0.get(REGION).and_then(Value::as_str)
    }

    pub fn universe(&self) -> Option<&str> {
        self.0.get(UNIVERSE).and_then(Value::as_str)
    }

    /// Delay in days; accepts both numeric and string encodings.
    pub fn delay(&self) -> Option<i64> {
        match self.0.get(DELAY)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Returns `self` with every key of `overrides` applied on top.
    pub fn merged(&self, overrides: &Settings) -> Settings {
        let mut out = self.clone();
        for (k, v) in &overrides.0 {
            out.0.insert(k.clone(), v.clone());
        }
        out
    }

    /// Sub-map restricted to `keys`. Missing keys are skipped.
    pub fn subset(&self, keys: &[&str]) -> BTreeMap<String, Value> {
        keys.iter()
            .filter_map(|k| self.0.get(*k).map(|v| ((*k).to_string(), v.clone())))
            .collect()
    }

    /// Execution context the simulation service requires to be homogeneous
    /// within one submission group.
    pub fn context_key(&self) -> ContextKey {
        ContextKey {
            region: self.region().unwrap_or_default().to_string(),
            delay: self.delay().unwrap_or_default(),
            universe: self.universe().unwrap_or_default().to_string(),
        }
    }
}

impl From<BTreeMap<String, Value>> for Settings {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for Settings {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// `(region, delay, universe)` grouping key for batch submission.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContextKey {
    pub region: String,
    pub delay: i64,
    pub universe: String,
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/D{}/{}", self.region, self.delay, self.universe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_accepts_number_and_string() {
        let mut s = Settings::new();
        s.insert(DELAY, 1);
        assert_eq!(s.delay(), Some(1));
        s.insert(DELAY, "0");
        assert_eq!(s.delay(), Some(0));
        s.insert(DELAY, true);
        assert_eq!(s.delay(), None);
    }

    #[test]
    fn merged_overrides_win() {
        let base = Settings::default_simulation();
        let mut overrides = Settings::new();
        overrides.insert("decay", 10);
        overrides.insert(REGION, "EUR");

        let merged = base.merged(&overrides);
        assert_eq!(merged.get("decay"), Some(&Value::from(10)));
        assert_eq!(merged.region(), Some("EUR"));
        assert_eq!(merged.universe(), Some("TOP3000"));
        // base untouched
        assert_eq!(base.region(), Some("USA"));
    }

    #[test]
    fn subset_skips_missing_keys() {
        let mut s = Settings::new();
        s.insert(REGION, "USA");
        let sub = s.subset(&[REGION, UNIVERSE]);
        assert_eq!(sub.len(), 1);
        assert!(sub.contains_key(REGION));
    }

    #[test]
    fn context_key_groups_by_region_delay_universe() {
        let a = Settings::default_simulation();
        let mut b = a.clone();
        b.insert("decay", 0);
        assert_eq!(a.context_key(), b.context_key());

        b.insert(DELAY, 0);
        assert_ne!(a.context_key(), b.context_key());
        assert_eq!(a.context_key().to_string(), "USA/D1/TOP3000");
    }

    #[test]
    fn serializes_as_plain_object() {
        let mut s = Settings::new();
        s.insert(UNIVERSE, "TOP500");
        s.insert(REGION, "USA");
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, r#"{"region":"USA","universe":"TOP500"}"#);
    }
}
