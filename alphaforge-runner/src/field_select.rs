//! Level-1 data field selection.
//!
//! Buckets where the account already holds many alphas get fewer fields:
//! each `(region, delay, category)` bucket contributes
//! `floor(field_budget / (alpha_count + 1))` fields drawn at random from the
//! catalog. The union is shuffled and cut to the generation batch size.

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use alphaforge_core::domain::DataField;

use crate::catalog::{Catalog, CatalogError, FieldQuery};
use crate::config::GenerationConfig;
use crate::service::PyramidCount;

/// Fields drawn for a bucket holding `alpha_count` alphas.
pub fn per_bucket(field_budget: u64, alpha_count: u64) -> usize {
    usize::try_from(field_budget / alpha_count.saturating_add(1)).unwrap_or(usize::MAX)
}

fn allowed(list: &[String], value: &str) -> bool {
    list.is_empty() || list.iter().any(|v| v == value)
}

fn finish<R: Rng + ?Sized>(mut fields: Vec<DataField>, config: &GenerationConfig, rng: &mut R) -> Vec<DataField> {
    fields.shuffle(rng);
    fields.truncate(usize::try_from(config.batch_size).unwrap_or(usize::MAX));
    fields
}

/// Pyramid-weighted selection over the catalog.
pub fn select_fields<R: Rng + ?Sized>(
    catalog: &dyn Catalog,
    pyramids: &[PyramidCount],
    config: &GenerationConfig,
    rng: &mut R,
) -> Result<Vec<DataField>, CatalogError> {
    let mut picked = Vec::new();
    for bucket in pyramids {
        if !allowed(&config.regions, &bucket.region) || !allowed(&config.categories, &bucket.category) {
            continue;
        }
        let n = per_bucket(config.field_budget, bucket.alpha_count);
        if n == 0 {
            continue;
        }
        let query = FieldQuery::new(bucket.region.as_str(), bucket.delay, bucket.category.as_str());
        let candidates = catalog.data_fields(&query)?;
        let before = picked.len();
        picked.extend(candidates.choose_multiple(rng, n).cloned());
        debug!(
            region = %bucket.region,
            delay = bucket.delay,
            category = %bucket.category,
            alpha_count = bucket.alpha_count,
            drawn = picked.len() - before,
            "pyramid bucket"
        );
    }
    Ok(finish(picked, config, rng))
}

/// Selection without pyramid counts: every catalog field in the configured
/// regions and categories.
pub fn all_fields<R: Rng + ?Sized>(
    catalog: &dyn Catalog,
    config: &GenerationConfig,
    rng: &mut R,
) -> Result<Vec<DataField>, CatalogError> {
    let fields = catalog
        .data_fields(&FieldQuery::default())?
        .into_iter()
        .filter(|f| allowed(&config.regions, &f.region) && allowed(&config.categories, &f.category))
        .collect();
    Ok(finish(fields, config, rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogData, InMemoryCatalog};
    use alphaforge_core::domain::DataFieldKind;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn field(name: &str, region: &str, category: &str) -> DataField {
        DataField {
            name: name.into(),
            kind: DataFieldKind::Matrix,
            region: region.into(),
            universe: "TOP3000".into(),
            delay: 1,
            category: category.into(),
            sub_category: None,
            description: None,
            coverage: 1.0,
            user_count: 0,
            alpha_count: 0,
        }
    }

    fn catalog() -> InMemoryCatalog {
        let mut fields = Vec::new();
        for i in 0..30 {
            fields.push(field(&format!("pv_{i}"), "USA", "pv"));
            fields.push(field(&format!("fund_{i}"), "USA", "fundamental"));
            fields.push(field(&format!("eur_{i}"), "EUR", "pv"));
        }
        InMemoryCatalog::new(CatalogData {
            data_fields: fields,
            ..CatalogData::default()
        })
    }

    fn bucket(region: &str, category: &str, alpha_count: u64) -> PyramidCount {
        PyramidCount {
            region: region.into(),
            delay: 1,
            category: category.into(),
            alpha_count,
        }
    }

    #[test]
    fn budget_shrinks_with_alpha_count() {
        assert_eq!(per_bucket(400, 0), 400);
        assert_eq!(per_bucket(400, 3), 100);
        assert_eq!(per_bucket(400, 400), 0);
        assert_eq!(per_bucket(400, u64::MAX), 0);
    }

    #[test]
    fn buckets_draw_weighted_counts() {
        let config = GenerationConfig {
            field_budget: 20,
            ..GenerationConfig::default()
        };
        let pyramids = [bucket("USA", "pv", 1), bucket("USA", "fundamental", 4)];
        let mut rng = StdRng::seed_from_u64(3);
        let fields = select_fields(&catalog(), &pyramids, &config, &mut rng).unwrap();

        let pv = fields.iter().filter(|f| f.category == "pv").count();
        let fund = fields.iter().filter(|f| f.category == "fundamental").count();
        assert_eq!((pv, fund), (10, 4));
        assert!(fields.iter().all(|f| f.region == "USA"));
    }

    #[test]
    fn bucket_larger_than_catalog_takes_everything() {
        let config = GenerationConfig::default();
        let mut rng = StdRng::seed_from_u64(0);
        let fields = select_fields(&catalog(), &[bucket("EUR", "pv", 0)], &config, &mut rng).unwrap();
        assert_eq!(fields.len(), 30);
    }

    #[test]
    fn region_filter_and_truncation() {
        let config = GenerationConfig {
            regions: vec!["EUR".into()],
            batch_size: 5,
            ..GenerationConfig::default()
        };
        let pyramids = [bucket("USA", "pv", 0), bucket("EUR", "pv", 0)];
        let mut rng = StdRng::seed_from_u64(9);
        let fields = select_fields(&catalog(), &pyramids, &config, &mut rng).unwrap();
        assert_eq!(fields.len(), 5);
        assert!(fields.iter().all(|f| f.region == "EUR"));

        let all = all_fields(&catalog(), &config, &mut rng).unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.iter().all(|f| f.region == "EUR"));
    }

    #[test]
    fn seeded_selection_is_reproducible() {
        let config = GenerationConfig {
            field_budget: 12,
            ..GenerationConfig::default()
        };
        let pyramids = [bucket("USA", "pv", 0)];
        let a = select_fields(&catalog(), &pyramids, &config, &mut StdRng::seed_from_u64(5)).unwrap();
        let b = select_fields(&catalog(), &pyramids, &config, &mut StdRng::seed_from_u64(5)).unwrap();
        assert_eq!(a, b);
    }
}
