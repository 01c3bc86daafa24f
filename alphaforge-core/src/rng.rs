//! Deterministic seed hierarchy for generation runs.
//!
//! A master seed expands into one sub-seed per `(batch, template, scope)`
//! tuple. Derivation is a BLAKE3 hash, so the sub-seed for a template does not
//! depend on which templates were sampled before it or on how many worker
//! threads ran the batch.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::domain::{BatchNo, TemplateId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedHierarchy {
    master_seed: u64,
}

impl SeedHierarchy {
    pub fn new(master_seed: u64) -> Self {
        Self { master_seed }
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    /// Sub-seed for one template within one generation batch.
    ///
    /// `scope` separates independent draws for the same template, e.g. the
    /// parent slot and the operator slots of a second-level template.
    pub fn sub_seed(&self, batch: &BatchNo, template: TemplateId, scope: &str) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.master_seed.to_le_bytes());
        hasher.update(batch.as_str().as_bytes());
        hasher.update(&template.0.to_le_bytes());
        hasher.update(scope.as_bytes());
        let hash = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(head)
    }

    pub fn rng_for(&self, batch: &BatchNo, template: TemplateId, scope: &str) -> StdRng {
        StdRng::seed_from_u64(self.sub_seed(batch, template, scope))
    }
}
