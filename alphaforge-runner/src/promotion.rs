//! Promotion gates between generation levels.
//!
//! A candidate feeds the next level only if it clears that level's gate:
//! - **Level 1 → 2:** `sharpe > 1.2` and `fitness > 1.0`.
//! - **Level 2 → 3:** `sharpe > 1.5` and `fitness > 1.2`.
//!
//! Comparisons are strict. A missing metric never passes.

use serde::{Deserialize, Serialize};

use alphaforge_core::domain::{Candidate, Level};

use crate::repository::Filter;

/// Minimum metrics for one gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    pub min_sharpe: f64,
    pub min_fitness: f64,
}

impl Gate {
    pub fn passes(&self, sharpe: Option<f64>, fitness: Option<f64>) -> bool {
        matches!((sharpe, fitness), (Some(s), Some(f)) if s > self.min_sharpe && f > self.min_fitness)
    }
}

/// Gate thresholds for each promotable level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionThresholds {
    /// Gate a level-1 candidate must clear to seed level 2.
    pub level2: Gate,
    /// Gate a level-2 candidate must clear to seed level 3.
    pub level3: Gate,
}

impl Default for PromotionThresholds {
    fn default() -> Self {
        Self {
            level2: Gate {
                min_sharpe: 1.2,
                min_fitness: 1.0,
            },
            level3: Gate {
                min_sharpe: 1.5,
                min_fitness: 1.2,
            },
        }
    }
}

/// Why a candidate did not clear its gate.
#[derive(Debug, Clone, PartialEq)]
pub enum GateFailure {
    WrongLevel { expected: Level, actual: Level },
    MissingMetrics,
    InsufficientSharpe { sharpe: f64, threshold: f64 },
    InsufficientFitness { fitness: f64, threshold: f64 },
}

impl PromotionThresholds {
    /// Gate guarding entry into `level`; `None` for levels without parents.
    pub fn gate_for(&self, level: Level) -> Option<Gate> {
        match level {
            Level::Second => Some(self.level2),
            Level::Third => Some(self.level3),
            Level::Template | Level::First => None,
        }
    }

    /// Check whether `candidate` may seed `target`.
    pub fn check(&self, candidate: &Candidate, target: Level) -> Result<(), GateFailure> {
        let (Some(gate), Some(parent)) = (self.gate_for(target), target.parent()) else {
            return Err(GateFailure::WrongLevel {
                expected: target,
                actual: candidate.level,
            });
        };
        if candidate.level != parent {
            return Err(GateFailure::WrongLevel {
                expected: parent,
                actual: candidate.level,
            });
        }
        let (Some(sharpe), Some(fitness)) = (candidate.sharpe, candidate.fitness) else {
            return Err(GateFailure::MissingMetrics);
        };
        if sharpe <= gate.min_sharpe {
            return Err(GateFailure::InsufficientSharpe {
                sharpe,
                threshold: gate.min_sharpe,
            });
        }
        if fitness <= gate.min_fitness {
            return Err(GateFailure::InsufficientFitness {
                fitness,
                threshold: gate.min_fitness,
            });
        }
        Ok(())
    }

    /// Repository filter selecting the parents of `target`.
    pub fn parent_filter(&self, target: Level) -> Option<Filter> {
        let gate = self.gate_for(target)?;
        let parent = target.parent()?;
        Some(
            Filter::new()
                .eq("level", u8::from(parent))
                .gt("sharpe", gate.min_sharpe)
                .gt("fitness", gate.min_fitness),
        )
    }
}
