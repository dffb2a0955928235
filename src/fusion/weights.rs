//! Layer weight vector
//!
//! Weights are never trusted to be normalized: every consumer goes through
//! `normalized*`, and calibrator output goes through the floor-aware
//! renormalization before it is persisted as a new version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::Layer;

const EPS: f64 = 1e-12;

/// One weight per evidence layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerWeights {
    pub hard_data: f64,
    pub technical: f64,
    pub behavioral: f64,
    pub economic: f64,
}

impl Default for LayerWeights {
    fn default() -> Self {
        Self {
            hard_data: 0.35,
            technical: 0.25,
            behavioral: 0.20,
            economic: 0.20,
        }
    }
}

impl LayerWeights {
    pub fn new(hard_data: f64, technical: f64, behavioral: f64, economic: f64) -> Self {
        Self {
            hard_data,
            technical,
            behavioral,
            economic,
        }
    }

    pub fn uniform() -> Self {
        Self::new(0.25, 0.25, 0.25, 0.25)
    }

    pub fn get(&self, layer: Layer) -> f64 {
        match layer {
            Layer::HardData => self.hard_data,
            Layer::Technical => self.technical,
            Layer::Behavioral => self.behavioral,
            Layer::Economic => self.economic,
        }
    }

    pub fn set(&mut self, layer: Layer, value: f64) {
        match layer {
            Layer::HardData => self.hard_data = value,
            Layer::Technical => self.technical = value,
            Layer::Behavioral => self.behavioral = value,
            Layer::Economic => self.economic = value,
        }
    }

    pub fn sum(&self) -> f64 {
        Layer::ALL.iter().map(|l| self.get(*l)).sum()
    }

    /// Scale to sum 1; negative or non-finite entries count as zero.
    /// A vector with no positive mass becomes uniform.
    pub fn normalized(&self) -> LayerWeights {
        self.normalized_over(&Layer::ALL)
    }

    /// Scale to sum 1 over `included` only; excluded layers get 0.
    /// Used when a feed is missing for a single fusion run.
    pub fn normalized_over(&self, included: &[Layer]) -> LayerWeights {
        let mut out = LayerWeights::new(0.0, 0.0, 0.0, 0.0);
        if included.is_empty() {
            return out;
        }

        let clean = |w: f64| if w.is_finite() && w > 0.0 { w } else { 0.0 };
        let total: f64 = included.iter().map(|l| clean(self.get(*l))).sum();

        for layer in included {
            let value = if total > EPS {
                clean(self.get(*layer)) / total
            } else {
                1.0 / included.len() as f64
            };
            out.set(*layer, value);
        }
        out
    }

    /// Normalize, then pin any layer below `floor` to the floor and share the
    /// remaining mass proportionally among the rest. Returns the pinned layers.
    pub fn normalize_with_floor(&self, floor: f64) -> (LayerWeights, Vec<Layer>) {
        let floor = floor.clamp(0.0, 1.0 / Layer::ALL.len() as f64);
        let base = self.normalized();
        let mut pinned: Vec<Layer> = Vec::new();

        loop {
            let free: Vec<Layer> = Layer::ALL
                .iter()
                .copied()
                .filter(|l| !pinned.contains(l))
                .collect();
            let remaining = 1.0 - floor * pinned.len() as f64;
            let free_mass: f64 = free.iter().map(|l| base.get(*l)).sum();

            let mut out = LayerWeights::new(0.0, 0.0, 0.0, 0.0);
            for layer in &pinned {
                out.set(*layer, floor);
            }
            for layer in &free {
                let share = if free_mass > EPS {
                    base.get(*layer) / free_mass
                } else {
                    1.0 / free.len() as f64
                };
                out.set(*layer, remaining * share);
            }

            let newly_low: Vec<Layer> = free
                .iter()
                .copied()
                .filter(|l| out.get(*l) < floor - EPS)
                .collect();
            if newly_low.is_empty() || newly_low.len() == free.len() {
                return (out, pinned);
            }
            pinned.extend(newly_low);
        }
    }

    /// Add per-layer adjustments, then floor-aware renormalization
    pub fn apply_adjustments(
        &self,
        adjustments: &HashMap<Layer, f64>,
        floor: f64,
    ) -> (LayerWeights, Vec<Layer>) {
        let mut next = self.normalized();
        for (layer, delta) in adjustments {
            next.set(*layer, next.get(*layer) + delta);
        }
        next.normalize_with_floor(floor)
    }
}

/// Persisted, versioned weight vector. Fusers read the latest version per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightRecord {
    pub version: i64,
    pub weights: LayerWeights,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}
