//! Reference catalog: templates, data fields, operators.
//!
//! The pipeline only reads templates and data fields; operators and data
//! fields are refreshed from the simulation service by the sync commands.
//! [`InMemoryCatalog`] loads and saves a single JSON document.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use alphaforge_core::domain::{DataField, Level, Operator, Template, TemplateId};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("catalog parse error: {0}")]
    Parse(String),

    #[error("catalog lock poisoned")]
    Poisoned,
}

/// Data field lookup; `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldQuery {
    pub region: Option<String>,
    pub delay: Option<i64>,
    pub category: Option<String>,
}

impl FieldQuery {
    pub fn new(region: impl Into<String>, delay: i64, category: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            delay: Some(delay),
            category: Some(category.into()),
        }
    }

    pub fn matches(&self, field: &DataField) -> bool {
        self.region.as_ref().map_or(true, |r| *r == field.region)
            && self.delay.map_or(true, |d| d == field.delay)
            && self.category.as_ref().map_or(true, |c| *c == field.category)
    }
}

pub trait Catalog: Send + Sync {
    fn template(&self, id: TemplateId) -> Result<Option<Template>, CatalogError>;

    /// All templates of one level, in id order.
    fn templates(&self, level: Level) -> Result<Vec<Template>, CatalogError>;

    fn data_fields(&self, query: &FieldQuery) -> Result<Vec<DataField>, CatalogError>;

    fn operators(&self) -> Result<Vec<Operator>, CatalogError>;

    /// Insert or replace by name.
    fn upsert_operator(&self, operator: Operator) -> Result<(), CatalogError>;

    /// Remove operators by name; returns how many were removed.
    fn remove_operators(&self, names: &[String]) -> Result<usize, CatalogError>;

    /// Insert or replace by `(name, region, universe, delay)`.
    fn upsert_data_field(&self, field: DataField) -> Result<(), CatalogError>;

    /// Insert a template, assigning the next free id. A template with the
    /// same level and body is reused; returns the id either way.
    fn add_template(
        &self,
        title: String,
        level: Level,
        body: String,
        default_fields: BTreeMap<String, Vec<String>>,
    ) -> Result<TemplateId, CatalogError>;
}

/// Serialized catalog document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogData {
    pub templates: Vec<Template>,
    pub data_fields: Vec<DataField>,
    pub operators: Vec<Operator>,
}

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    data: RwLock<CatalogData>,
}

impl InMemoryCatalog {
    pub fn new(data: CatalogData) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Load a catalog file; a missing file yields an empty catalog.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let data: CatalogData =
            serde_json::from_str(&text).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Ok(Self::new(data))
    }

    /// Write the catalog atomically (write to `.tmp`, rename into place).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CatalogError> {
        let path = path.as_ref();
        let io = |source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_string_pretty(&*self.read()?)
            .map_err(|e| CatalogError::Parse(e.to_string()))?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io)?;
        fs::rename(&tmp, path).map_err(io)
    }

    pub fn snapshot(&self) -> Result<CatalogData, CatalogError> {
        Ok(self.read()?.clone())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, CatalogData>, CatalogError> {
        self.data.read().map_err(|_| CatalogError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, CatalogData>, CatalogError> {
        self.data.write().map_err(|_| CatalogError::Poisoned)
    }
}

impl Catalog for InMemoryCatalog {
    fn template(&self, id: TemplateId) -> Result<Option<Template>, CatalogError> {
        Ok(self.read()?.templates.iter().find(|t| t.id == id).cloned())
    }

    fn templates(&self, level: Level) -> Result<Vec<Template>, CatalogError> {
        let mut out: Vec<Template> = self
            .read()?
            .templates
            .iter()
            .filter(|t| t.level == level)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.id);
        Ok(out)
    }

    fn data_fields(&self, query: &FieldQuery) -> Result<Vec<DataField>, CatalogError> {
        Ok(self
            .read()?
            .data_fields
            .iter()
            .filter(|f| query.matches(f))
            .cloned()
            .collect())
    }

    fn operators(&self) -> Result<Vec<Operator>, CatalogError> {
        Ok(self.read()?.operators.clone())
    }

    fn upsert_operator(&self, operator: Operator) -> Result<(), CatalogError> {
        let mut data = self.write()?;
        match data.operators.iter_mut().find(|o| o.name == operator.name) {
            Some(slot) => *slot = operator,
            None => data.operators.push(operator),
        }
        Ok(())
    }

    fn remove_operators(&self, names: &[String]) -> Result<usize, CatalogError> {
        let mut data = self.write()?;
        let before = data.operators.len();
        data.operators.retain(|o| !names.contains(&o.name));
        Ok(before - data.operators.len())
    }

    fn upsert_data_field(&self, field: DataField) -> Result<(), CatalogError> {
        let mut data = self.write()?;
        let same = |f: &DataField| {
            f.name == field.name && f.region == field.region && f.universe == field.universe && f.delay == field.delay
        };
        match data.data_fields.iter().position(same) {
            Some(i) => data.data_fields[i] = field,
            None => data.data_fields.push(field),
        }
        Ok(())
    }

    fn add_template(
        &self,
        title: String,
        level: Level,
        body: String,
        default_fields: BTreeMap<String, Vec<String>>,
    ) -> Result<TemplateId, CatalogError> {
        let mut data = self.write()?;
        if let Some(existing) = data.templates.iter().find(|t| t.level == level && t.body == body) {
            return Ok(existing.id);
        }
        let id = TemplateId(data.templates.iter().map(|t| t.id.0).max().unwrap_or(0) + 1);
        data.templates.push(Template {
            id,
            title,
            level,
            body,
            default_fields,
        });
        Ok(id)
    }
}
