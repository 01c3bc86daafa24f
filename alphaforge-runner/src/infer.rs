//! Template inference from a data-field listing.
//!
//! Each field in a CSV export (`name`, `description`, `category`) is mapped
//! by keyword heuristics to one or two first-order time-series patterns such
//! as `ts_mean(x,66)`. Every distinct pattern becomes a level-1 template with
//! `x` replaced by the `data_field` slot. Group-only second-order templates
//! (`group_rank`, `group_mean`, `group_std`, `group_zscore`) are added at
//! level 2 with the grouping fields as literal values of a `group` slot.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::info;

use alphaforge_core::domain::{Level, TemplateId};

use crate::catalog::Catalog;
use crate::error::PipelineError;

pub const DEFAULT_GROUP: &str = "SUBINDUSTRY";

/// Second-order patterns; `<sig1/>` is the level-1 signal, `<group/>` the
/// grouping field.
pub const GROUP_TEMPLATES: [(&str, &str); 5] = [
    ("group_rank", "group_rank(<sig1/>, <group/>)"),
    ("group_mean_63", "group_mean(<sig1/>, <group/>, 63)"),
    ("group_mean_252", "group_mean(<sig1/>, <group/>, 252)"),
    ("group_std_66", "group_std(<sig1/>, <group/>, 66)"),
    ("group_zscore", "group_zscore(<sig1/>, <group/>)"),
];

/// One row of the field listing.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldRow {
    #[serde(alias = "Name", default)]
    pub name: Option<String>,
    #[serde(alias = "Description", default)]
    pub description: Option<String>,
    #[serde(alias = "Category", default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferenceReport {
    pub fields: usize,
    /// Pattern to the fields it was inferred for.
    pub mapping: BTreeMap<String, Vec<String>>,
    pub first_order: Vec<TemplateId>,
    pub group: Vec<TemplateId>,
}

fn delta_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(chg|change|delta|pct|percent)\b").expect("delta pattern is valid"))
}

fn dispersion_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(std|stddev|std_dev|volatility|vol)\b").expect("dispersion pattern is valid"))
}

/// Lookback in trading days for an explicit month token.
fn month_days(text: &str) -> Option<u32> {
    if text.contains("1m") || text.starts_with("1_") || text.contains("1 month") {
        Some(21)
    } else if text.contains("3m") || text.contains("3_month") || text.contains("3 month") {
        Some(63)
    } else if text.contains("6m") || text.contains("6_month") || text.contains("6 month") {
        Some(126)
    } else if text.contains("12") {
        Some(252)
    } else {
        None
    }
}

/// First-order patterns for one field. `x` stands for the field.
pub fn infer_patterns(name: &str, description: &str, category: &str) -> Vec<String> {
    let name = name.to_lowercase();
    let desc = description.to_lowercase();
    let both = format!("{name} {desc}");
    let already_delta = delta_re().is_match(&both);
    let already_dispersion = dispersion_re().is_match(&both);
    let one = |p: &str| vec![p.to_string()];

    if let Some(days) = month_days(&name).or_else(|| month_days(&desc)) {
        // a change over a window is not differenced again
        return if already_delta {
            one("ts_rank(x,21)")
        } else {
            vec![format!("ts_mean(x,{days})")]
        };
    }
    if name.contains("chg") || both.contains("percent change") {
        return if already_delta { one("ts_rank(x,21)") } else { one("ts_delta(x,63)") };
    }
    if both.contains("percentile") || both.contains("rank") {
        return one("ts_rank(x,21)");
    }
    if name.contains("std") || desc.contains("standard deviation") {
        return if already_dispersion { one("ts_rank(x,21)") } else { one("ts_std(x,66)") };
    }
    let counts = ["num", "count", "number", "total", "numof"];
    let count_phrases = ["number of", "num of", "count of"];
    if counts.iter().any(|k| name.contains(k)) || count_phrases.iter().any(|k| desc.contains(k)) {
        return if both.contains("total") { one("ts_sum(x,126)") } else { one("ts_delta(x,21)") };
    }
    if category.to_lowercase().contains("analyst") {
        return vec!["ts_mean(x,66)".into(), "ts_delta(x,120)".into()];
    }
    let financial = ["revenue", "net profit", "netprofit", "ntp", "eps", "ebit", "ebitda", "profit"];
    let financial_desc = ["earnings", "revenue", "net profit", "eps"];
    if financial.iter().any(|k| name.contains(k)) || financial_desc.iter().any(|k| desc.contains(k)) {
        return vec!["ts_delta(x,66)".into(), "ts_mean(x,120)".into()];
    }
    if both.contains("mean") || both.contains("average") {
        return one("ts_mean(x,66)");
    }
    one("ts_delta(x,63)")
}

/// Template body for a pattern: `ts_mean(x,66)` -> `ts_mean(<data_field/>, 66)`.
pub fn pattern_body(pattern: &str) -> String {
    pattern.replacen("(x,", "(<data_field/>, ", 1)
}

/// Read field rows from CSV; rows without a name are dropped.
pub fn read_rows<R: Read>(reader: R) -> Result<Vec<FieldRow>, PipelineError> {
    let mut csv = csv::ReaderBuilder::new().flexible(true).trim(csv::Trim::All).from_reader(reader);
    let mut rows = Vec::new();
    for row in csv.deserialize::<FieldRow>() {
        let row = row.map_err(|e| PipelineError::Inference(e.to_string()))?;
        if row.name.as_deref().is_some_and(|n| !n.is_empty()) {
            rows.push(row);
        }
    }
    Ok(rows)
}

/// Pattern -> field names, in CSV order within each pattern.
pub fn infer_mapping(rows: &[FieldRow]) -> BTreeMap<String, Vec<String>> {
    let mut mapping: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in rows {
        let Some(name) = row.name.as_deref() else {
            continue;
        };
        let patterns = infer_patterns(
            name,
            row.description.as_deref().unwrap_or(""),
            row.category.as_deref().unwrap_or(""),
        );
        for p in patterns {
            mapping.entry(p).or_default().push(name.to_string());
        }
    }
    mapping
}

/// Infer templates from a CSV listing and add them to `catalog`.
///
/// `groups` are the grouping fields bound into the second-order templates;
/// empty means [`DEFAULT_GROUP`].
pub fn infer_templates<R: Read>(reader: R, catalog: &dyn Catalog, groups: &[String]) -> Result<InferenceReport, PipelineError> {
    let rows = read_rows(reader)?;
    let mapping = infer_mapping(&rows);

    let mut first_order = Vec::with_capacity(mapping.len());
    for pattern in mapping.keys() {
        first_order.push(catalog.add_template(pattern.clone(), Level::First, pattern_body(pattern), BTreeMap::new())?);
    }

    let groups: Vec<String> = if groups.is_empty() {
        vec![DEFAULT_GROUP.to_string()]
    } else {
        groups.to_vec()
    };
    let mut group = Vec::with_capacity(GROUP_TEMPLATES.len());
    for (title, body) in GROUP_TEMPLATES {
        let defaults = BTreeMap::from([("group".to_string(), groups.clone())]);
        group.push(catalog.add_template(title.to_string(), Level::Second, body.to_string(), defaults)?);
    }

    info!(fields = rows.len(), patterns = mapping.len(), group_templates = group.len(), "templates inferred");
    Ok(InferenceReport {
        fields: rows.len(),
        mapping,
        first_order,
        group,
    })
}
