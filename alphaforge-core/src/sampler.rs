//! Combinatorial sampler: bounded random subsets of a Cartesian product.
//!
//! Given named fields, each bound to an ordered list of candidate values, the
//! sampler yields bindings (one value per field) that are points of the full
//! product space. The product is never materialized:
//!
//! - every point has an index in `0..total` (mixed radix, last field fastest),
//!   decoded on demand;
//! - when `limit < total`, a stride random walk picks `limit` strictly
//!   increasing indices. The range is split into windows of width
//!   `mul = total / limit`; step `i` draws uniformly from
//!   `prev + 1 ..= min(total - (limit - i), prev + mul * step_mul)`, which
//!   always leaves room for the remaining picks.
//!
//! With `randomize`, each value list is shuffled before indexing. A seed makes
//! both the shuffle and the walk reproducible.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use thiserror::Error;

/// One point of the product space.
pub type Binding<T> = BTreeMap<String, T>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SamplerError {
    #[error("product space overflows u128")]
    SpaceTooLarge,
    #[error("step multiplier must be at least 1")]
    InvalidStepMultiplier,
}

/// Named value lists, in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpace<T> {
    fields: Vec<(String, Vec<T>)>,
}

impl<T> Default for FieldSpace<T> {
    fn default() -> Self {
        Self { fields: Vec::new() }
    }
}

impl<T> FieldSpace<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`FieldSpace::insert`].
    pub fn with_field(mut self, name: impl Into<String>, values: Vec<T>) -> Self {
        self.insert(name, values);
        self
    }

    /// Bind `name` to `values`, replacing an existing binding of the same name.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<T>) {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = values;
        } else {
            self.fields.push((name, values));
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of points in the product space.
    pub fn total(&self) -> Result<u128, SamplerError> {
        self.fields.iter().try_fold(1u128, |acc, (_, values)| {
            acc.checked_mul(values.len() as u128)
                .ok_or(SamplerError::SpaceTooLarge)
        })
    }
}

/// Sampling controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleOptions {
    /// Maximum number of bindings; `None` means the whole space.
    pub limit: Option<u64>,
    /// Shuffle each value list before indexing.
    pub randomize: bool,
    /// Seed for shuffling and index selection; `None` draws from OS entropy.
    pub seed: Option<u64>,
    /// Upper bound of a single stride, in windows.
    pub step_mul: u64,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            limit: None,
            randomize: true,
            seed: None,
            step_mul: 2,
        }
    }
}

impl SampleOptions {
    pub fn limited(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_randomize(mut self, randomize: bool) -> Self {
        self.randomize = randomize;
        self
    }
}

// ─── Index selection ─────────────────────────────────────────────────

/// Strictly increasing index stream over `0..total`.
#[derive(Debug)]
pub struct IndexSelector {
    total: u128,
    limit: u128,
    emitted: u128,
    prev: Option<u128>,
    window: u128,
    exhaustive: bool,
    rng: StdRng,
}

impl IndexSelector {
    pub fn new(total: u128, limit: u128, step_mul: u64, rng: StdRng) -> Result<Self, SamplerError> {
        if step_mul == 0 {
            return Err(SamplerError::InvalidStepMultiplier);
        }
        let exhaustive = limit >= total;
        let limit = limit.min(total);
        let window = if exhaustive || limit == 0 {
            1
        } else {
            (total / limit).saturating_mul(step_mul as u128)
        };
        Ok(Self {
            total,
            limit,
            emitted: 0,
            prev: None,
            window,
            exhaustive,
            rng,
        })
    }
}

impl Iterator for IndexSelector {
    type Item = u128;

    fn next(&mut self) -> Option<u128> {
        if self.emitted >= self.limit {
            return None;
        }
        let lo = self.prev.map_or(0, |p| p + 1);
        let idx = if self.exhaustive {
            lo
        } else {
            // room left for the picks still to come
            let ceiling = self.total - (self.limit - self.emitted);
            let stride = lo.saturating_add(self.window - 1);
            let hi = ceiling.min(stride);
            self.rng.gen_range(lo..=hi)
        };
        self.prev = Some(idx);
        self.emitted += 1;
        Some(idx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = usize::try_from(self.limit - self.emitted).unwrap_or(usize::MAX);
        (left, Some(left))
    }
}

// ─── Sampling ────────────────────────────────────────────────────────

/// Lazy stream of bindings. Finite and single-pass.
#[derive(Debug)]
pub struct Sample<T> {
    names: Vec<String>,
    values: Vec<Vec<T>>,
    indices: IndexSelector,
}

impl<T: Clone> Sample<T> {
    fn decode(&self, mut index: u128) -> Binding<T> {
        let mut picks: Vec<usize> = vec![0; self.values.len()];
        for (pos, values) in self.values.iter().enumerate().rev() {
            let radix = values.len() as u128;
            picks[pos] = (index % radix) as usize;
            index /= radix;
        }
        self.names
            .iter()
            .zip(&self.values)
            .zip(picks)
            .map(|((name, values), pick)| (name.clone(), values[pick].clone()))
            .collect()
    }
}

impl<T: Clone> Iterator for Sample<T> {
    type Item = Binding<T>;

    fn next(&mut self) -> Option<Binding<T>> {
        let index = self.indices.next()?;
        Some(self.decode(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.indices.size_hint()
    }
}

/// Sample bindings from `space`.
pub fn sample<T: Clone>(space: FieldSpace<T>, options: &SampleOptions) -> Result<Sample<T>, SamplerError> {
    let total = space.total()?;
    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let (names, mut values): (Vec<String>, Vec<Vec<T>>) = space.fields.into_iter().unzip();
    if options.randomize {
        for v in values.iter_mut() {
            v.shuffle(&mut rng);
        }
    }

    let limit = options.limit.map_or(total, |l| l as u128);
    let indices = IndexSelector::new(total, limit, options.step_mul, rng)?;
    Ok(Sample {
        names,
        values,
        indices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn space() -> FieldSpace<&'static str> {
        FieldSpace::new()
            .with_field("op", vec!["ts_mean", "ts_rank", "ts_std"])
            .with_field("field", vec!["close", "open", "volume", "vwap"])
            .with_field("days", vec!["5", "20"])
    }

    #[test]
    fn total_is_product() {
        assert_eq!(space().total().unwrap(), 24);
        assert_eq!(FieldSpace::<u8>::new().total().unwrap(), 1);
        let empty = FieldSpace::new().with_field("a", Vec::<u8>::new());
        assert_eq!(empty.total().unwrap(), 0);
    }

    #[test]
    fn overflow_is_reported() {
        let mut s = FieldSpace::new();
        for i in 0..40 {
            s.insert(format!("f{i}"), vec![0u8; 1000]);
        }
        assert_eq!(s.total(), Err(SamplerError::SpaceTooLarge));
    }

    #[test]
    fn limit_at_or_above_total_yields_everything_once() {
        let out: Vec<_> = sample(space(), &SampleOptions::limited(100).with_seed(1))
            .unwrap()
            .collect();
        assert_eq!(out.len(), 24);
        let distinct: HashSet<_> = out.iter().map(|b| format!("{b:?}")).collect();
        assert_eq!(distinct.len(), 24);
    }

    #[test]
    fn limited_sample_is_distinct_and_exact() {
        let out: Vec<_> = sample(space(), &SampleOptions::limited(7).with_seed(9))
            .unwrap()
            .collect();
        assert_eq!(out.len(), 7);
        let distinct: HashSet<_> = out.iter().map(|b| format!("{b:?}")).collect();
        assert_eq!(distinct.len(), 7);
        for b in &out {
            assert_eq!(b.len(), 3);
        }
    }

    #[test]
    fn same_seed_same_sample() {
        let a: Vec<_> = sample(space(), &SampleOptions::limited(5).with_seed(42)).unwrap().collect();
        let b: Vec<_> = sample(space(), &SampleOptions::limited(5).with_seed(42)).unwrap().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn without_randomize_order_is_lexicographic() {
        let s = FieldSpace::new()
            .with_field("a", vec![1, 2])
            .with_field("b", vec![10, 20]);
        let out: Vec<_> = sample(s, &SampleOptions::default().with_randomize(false))
            .unwrap()
            .map(|b| (b["a"], b["b"]))
            .collect();
        assert_eq!(out, vec![(1, 10), (1, 20), (2, 10), (2, 20)]);
    }

    #[test]
    fn selector_is_strictly_increasing_and_in_range() {
        let total = 1_000_000_000_000u128;
        let sel = IndexSelector::new(total, 1000, 2, StdRng::seed_from_u64(3)).unwrap();
        let picks: Vec<u128> = sel.collect();
        assert_eq!(picks.len(), 1000);
        assert!(picks.windows(2).all(|w| w[0] < w[1]));
        assert!(*picks.last().unwrap() < total);
    }

    #[test]
    fn selector_limit_equal_total_minus_one() {
        let sel = IndexSelector::new(10, 9, 2, StdRng::seed_from_u64(0)).unwrap();
        let picks: Vec<u128> = sel.collect();
        assert_eq!(picks.len(), 9);
        assert!(picks.windows(2).all(|w| w[0] < w[1]));
        assert!(*picks.last().unwrap() <= 9);
    }

    #[test]
    fn zero_step_multiplier_rejected() {
        let err = IndexSelector::new(10, 2, 0, StdRng::seed_from_u64(0)).unwrap_err();
        assert_eq!(err, SamplerError::InvalidStepMultiplier);
    }

    #[test]
    fn zero_limit_yields_nothing() {
        let out: Vec<_> = sample(space(), &SampleOptions::limited(0)).unwrap().collect();
        assert!(out.is_empty());
    }

    #[test]
    fn insert_replaces_existing_field() {
        let mut s = FieldSpace::new().with_field("a", vec![1, 2, 3]);
        s.insert("a", vec![4]);
        assert_eq!(s.len(), 1);
        assert_eq!(s.total().unwrap(), 1);
    }
}
