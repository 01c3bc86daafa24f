//! Reference entities owned by the catalog: templates, data fields, operators.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ids::TemplateId;
use super::level::Level;
use super::settings::{Settings, DELAY, REGION, UNIVERSE};

/// Parameterized expression pattern with `<name/>` slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub title: String,
    pub level: Level,
    /// Raw tagged body, e.g. `<ts_op/>(<data_field/>, <days/>)`.
    pub body: String,
    /// Literal candidate values for slots not bound by the generation level.
    #[serde(default)]
    pub default_fields: BTreeMap<String, Vec<String>>,
}

/// Shape of a data field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataFieldKind {
    Matrix,
    Vector,
}

/// Catalog entry for a named input series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataField {
    pub name: String,
    pub kind: DataFieldKind,
    pub region: String,
    pub universe: String,
    pub delay: i64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub sub_category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub coverage: f64,
    #[serde(default)]
    pub user_count: u64,
    #[serde(default)]
    pub alpha_count: u64,
}

impl DataField {
    /// The field's execution context as settings.
    pub fn settings(&self) -> Settings {
        let mut s = Settings::new();
        s.insert(REGION, self.region.as_str());
        s.insert(UNIVERSE, self.universe.as_str());
        s.insert(DELAY, self.delay);
        s
    }

    /// How the field is referenced inside an expression: vector fields must
    /// be reduced to a matrix first.
    pub fn expression_ref(&self) -> String {
        match self.kind {
            DataFieldKind::Matrix => self.name.clone(),
            DataFieldKind::Vector => format!("vec_avg({})", self.name),
        }
    }
}

/// Operator catalog entry as reported by the simulation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operator {
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub definition: String,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(kind: DataFieldKind) -> DataField {
        DataField {
            name: "close".into(),
            kind,
            region: "USA".into(),
            universe: "TOP3000".into(),
            delay: 1,
            category: "pv".into(),
            sub_category: None,
            description: None,
            coverage: 1.0,
            user_count: 10,
            alpha_count: 10,
        }
    }

    #[test]
    fn vector_fields_are_wrapped() {
        assert_eq!(field(DataFieldKind::Matrix).expression_ref(), "close");
        assert_eq!(field(DataFieldKind::Vector).expression_ref(), "vec_avg(close)");
    }

    #[test]
    fn field_settings_carry_context() {
        let s = field(DataFieldKind::Matrix).settings();
        assert_eq!(s.region(), Some("USA"));
        assert_eq!(s.universe(), Some("TOP3000"));
        assert_eq!(s.delay(), Some(1));
    }

    #[test]
    fn kind_uses_service_spelling() {
        let k: DataFieldKind = serde_json::from_str("\"VECTOR\"").unwrap();
        assert_eq!(k, DataFieldKind::Vector);
    }
}
