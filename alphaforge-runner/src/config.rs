//! Pipeline configuration, loaded from TOML.
//!
//! Every section and field has a default, so an empty file (or no file) is
//! a valid configuration. Credentials are never stored here; the service
//! section only names the environment variables that hold them.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use alphaforge_core::binding::GroupingRule;
use alphaforge_core::domain::{Settings, TemplateId};

use crate::promotion::PromotionThresholds;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Full pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub service: ServiceConfig,
    pub rate_limit: RateLimitConfig,
    pub batch: BatchConfig,
    pub generation: GenerationConfig,
    pub promotion: PromotionThresholds,
    pub grouping: GroupingRule,
}

/// Simulation service endpoint and polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Poll interval when the service sends no `Retry-After`.
    pub poll_interval_secs: f64,
    /// Give up polling a simulation after this long.
    pub max_poll_secs: u64,
    pub username_env: String,
    pub password_env: String,
    /// Offset of the service's reporting timezone from UTC, in hours.
    pub utc_offset_hours: i32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.worldquantbrain.com".into(),
            timeout_secs: 60,
            poll_interval_secs: 5.0,
            max_poll_secs: 1800,
            username_env: "ALPHAFORGE_USERNAME".into(),
            password_env: "ALPHAFORGE_PASSWORD".into(),
            utc_offset_hours: -4,
        }
    }
}

impl ServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn max_poll(&self) -> Duration {
        Duration::from_secs(self.max_poll_secs)
    }
}

/// Shared rate limiter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub burst: u32,
    /// One token is added back every `refill_ms`.
    pub refill_ms: u64,
    /// Cooldown after an authentication failure.
    pub auth_cooldown_secs: u64,
    /// Retries of a failed results page before the pass gives up.
    pub retry_attempts: u32,
    /// Fixed wait before each of those retries.
    pub retry_cooldown_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 1,
            refill_ms: 10_000,
            auth_cooldown_secs: 120,
            retry_attempts: 3,
            retry_cooldown_secs: 30,
        }
    }
}

impl RateLimitConfig {
    pub fn refill_every(&self) -> Duration {
        Duration::from_millis(self.refill_ms)
    }

    pub fn auth_cooldown(&self) -> Duration {
        Duration::from_secs(self.auth_cooldown_secs)
    }

    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_secs(self.retry_cooldown_secs)
    }
}

/// Batch simulation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Candidates per multi-simulation request.
    pub submit_size: usize,
    /// Sub-batches in flight at once.
    pub concurrency: usize,
    /// Page size when selecting candidates from the repository.
    pub page_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            submit_size: 10,
            concurrency: 3,
            page_size: 500,
        }
    }
}

/// Generation settings shared by all levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Upper bound on bindings sampled per template, and on selected fields.
    pub batch_size: u64,
    /// Master seed; `None` draws fresh entropy each run.
    pub seed: Option<u64>,
    /// Restrict field selection to these regions (empty = all).
    pub regions: Vec<String>,
    /// Restrict field selection to these categories (empty = all).
    pub categories: Vec<String>,
    /// Fields drawn per pyramid bucket: `field_budget / (alpha_count + 1)`.
    pub field_budget: u64,
    /// Templates to expand (empty = every template of the level).
    pub templates: Vec<TemplateId>,
    /// Longest expression accepted.
    pub max_expression_len: usize,
    /// Base settings for level-1 candidates.
    pub default_settings: Settings,
    /// Applied last, over field or parent settings.
    pub overrides: Settings,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            seed: None,
            regions: Vec::new(),
            categories: Vec::new(),
            field_budget: 400,
            templates: Vec::new(),
            max_expression_len: 4096,
            default_settings: Settings::default_simulation(),
            overrides: Settings::new(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |field: &'static str, v: usize| {
            if v == 0 {
                Err(ConfigError::Invalid {
                    field,
                    reason: "must be at least 1".into(),
                })
            } else {
                Ok(())
            }
        };
        positive("batch.submit_size", self.batch.submit_size)?;
        positive("batch.concurrency", self.batch.concurrency)?;
        positive("batch.page_size", self.batch.page_size)?;
        positive("generation.max_expression_len", self.generation.max_expression_len)?;
        if !self.grouping.operator.contains("{}") {
            return Err(ConfigError::Invalid {
                field: "grouping.operator",
                reason: "must contain a `{}` placeholder".into(),
            });
        }
        if !(self.service.poll_interval_secs.is_finite() && self.service.poll_interval_secs >= 0.0) {
            return Err(ConfigError::Invalid {
                field: "service.poll_interval_secs",
                reason: "must be a non-negative number".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_config_is_default() {
        let c = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(c, PipelineConfig::default());
        assert_eq!(c.batch.submit_size, 10);
        assert_eq!(c.generation.field_budget, 400);
        assert_eq!(c.promotion, PromotionThresholds::default());
    }

    #[test]
    fn sections_override_defaults() {
        let text = r#"
            [batch]
            concurrency = 8

            [generation]
            seed = 42
            regions = ["USA"]
            templates = [3, 4]

            [generation.overrides]
            decay = 0
            neutralization = "MARKET"

            [promotion.level3]
            min_sharpe = 2.0
            min_fitness = 1.5

            [grouping]
            regions = ["EUR"]
        "#;
        let c = PipelineConfig::from_toml_str(text).unwrap();
        assert_eq!(c.batch.concurrency, 8);
        assert_eq!(c.batch.submit_size, 10);
        assert_eq!(c.generation.seed, Some(42));
        assert_eq!(c.generation.templates, vec![TemplateId(3), TemplateId(4)]);
        assert_eq!(c.generation.overrides.get("decay"), Some(&serde_json::json!(0)));
        assert_eq!(c.promotion.level3.min_sharpe, 2.0);
        assert_eq!(c.promotion.level2, PromotionThresholds::default().level2);
        assert_eq!(c.grouping.regions, vec!["EUR".to_string()]);
        assert_eq!(c.grouping.operator, GroupingRule::default().operator);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let err = PipelineConfig::from_toml_str("[batch]\nconcurrency = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "batch.concurrency", .. }));
    }

    #[test]
    fn grouping_operator_needs_placeholder() {
        let err = PipelineConfig::from_toml_str("[grouping]\noperator = \"country\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "grouping.operator", .. }));
    }

    #[test]
    fn load_missing_file_is_default() {
        let tmp = TempDir::new().unwrap();
        let c = PipelineConfig::load(tmp.path().join("absent.toml")).unwrap();
        assert_eq!(c, PipelineConfig::default());

        let path = tmp.path().join("alphaforge.toml");
        std::fs::write(&path, "[rate_limit]\nrefill_ms = 250\n").unwrap();
        let c = PipelineConfig::load(&path).unwrap();
        assert_eq!(c.rate_limit.refill_every(), Duration::from_millis(250));
    }
}
