//! Maximum-likelihood (M-estimator) reweighting in tiers.
//!
//! Up to three tiers run in sequence. When a tier is entered, its tweaking
//! constant is sampled from the cumulative distribution of the current
//! residual z-scores at the tier's quantile, and its influence function
//! turns each residual into a weight multiplier in `[0, 1]`. The next tier
//! is entered once the adjustment has converged under the current one;
//! after the last tier converges the sequence is finished.

use std::f64::consts::{FRAC_PI_2, SQRT_2};

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::statistics::CumulativeDistribution;

/// Influence function families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaximumLikelihoodModel {
    /// Quadratic inside the constant, linear outside.
    Huber,
    /// Huber with a smooth sine transition.
    HuberModified,
    /// Gaussian down-weighting; never reaches zero.
    Welsch,
    /// Redescending; residuals beyond the constant get no weight.
    Chen,
}

impl MaximumLikelihoodModel {
    /// Weight multiplier for residual z-score `z` and tweaking constant `c`.
    ///
    /// Always 1 at `z == 0` and non-increasing in `|z|`.
    pub fn weight(&self, z: f64, c: f64) -> f64 {
        let r = z.abs();
        match self {
            MaximumLikelihoodModel::Huber => {
                if r <= c {
                    1.0
                } else {
                    c / r
                }
            }
            MaximumLikelihoodModel::HuberModified => {
                let x = r / c;
                if x == 0.0 {
                    1.0
                } else if x <= FRAC_PI_2 {
                    x.sin() / x
                } else {
                    1.0 / x
                }
            }
            MaximumLikelihoodModel::Welsch => {
                let x = r / c;
                (-x * x).exp()
            }
            // Normalized to 1 at zero: ((c² − r²) / c²)² inside c.
            MaximumLikelihoodModel::Chen => {
                if r <= c {
                    let t = (c * c - r * r) / (c * c);
                    t * t
                } else {
                    0.0
                }
            }
        }
    }

    /// Residual beyond which the model gives zero weight, if any.
    pub fn weighted_residual_cutoff(&self, c: f64) -> Option<f64> {
        match self {
            MaximumLikelihoodModel::Chen => Some(c),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MaximumLikelihoodModel::Huber => "Huber",
            MaximumLikelihoodModel::HuberModified => "HuberModified",
            MaximumLikelihoodModel::Welsch => "Welsch",
            MaximumLikelihoodModel::Chen => "Chen",
        }
    }
}

/// One configured tier: model and the residual quantile that sets its constant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaximumLikelihoodTier {
    pub model: MaximumLikelihoodModel,
    pub quantile: f64,
}

impl MaximumLikelihoodTier {
    pub fn new(model: MaximumLikelihoodModel, quantile: f64) -> Self {
        Self { model, quantile }
    }
}

/// A tier's influence function with its tweaking constant bound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaximumLikelihoodFunction {
    pub model: MaximumLikelihoodModel,
    pub tweaking_constant: f64,
}

impl MaximumLikelihoodFunction {
    /// Weight multiplier for a residual z-score.
    ///
    /// A degenerate constant (zero residual spread) leaves weights at 1.
    pub fn weight(&self, z: f64) -> f64 {
        if self.tweaking_constant > 0.0 && self.tweaking_constant.is_finite() {
            self.model.weight(z, self.tweaking_constant)
        } else {
            1.0
        }
    }

    pub fn weighted_residual_cutoff(&self) -> Option<f64> {
        self.model.weighted_residual_cutoff(self.tweaking_constant)
    }
}

/// What was used in one tier, kept for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierRecord {
    pub tier: usize,
    pub model: MaximumLikelihoodModel,
    pub quantile: f64,
    pub tweaking_constant: f64,
    /// Iteration in which the tier was entered.
    pub entered_at: usize,
}

/// Result of reporting convergence to the tier sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierTransition {
    /// The next tier will be entered at the start of the next iteration.
    Advanced { tier: usize },
    /// No tiers remain; the adjustment has converged.
    Finished,
}

/// Z-score of a residual: its length in units of the measure sigma, per axis.
pub fn residual_zscore(residual: &Vector2<f64>, sigma: f64) -> f64 {
    residual.norm() / sigma / SQRT_2
}

/// State machine over the configured tiers.
#[derive(Debug, Clone)]
pub struct RobustTiers {
    tiers: Vec<MaximumLikelihoodTier>,
    current: usize,
    entering: bool,
    active: Option<MaximumLikelihoodFunction>,
    /// Tier entered by the iteration in progress.
    pending: Option<TierRecord>,
    records: Vec<TierRecord>,
}

impl RobustTiers {
    pub fn new(tiers: Vec<MaximumLikelihoodTier>) -> Self {
        Self {
            entering: !tiers.is_empty(),
            tiers,
            current: 0,
            active: None,
            pending: None,
            records: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.tiers.is_empty()
    }

    /// Index of the current tier, `None` without robust models.
    pub fn current_tier(&self) -> Option<usize> {
        self.is_enabled().then_some(self.current)
    }

    /// The influence function in effect, if any.
    pub fn active(&self) -> Option<&MaximumLikelihoodFunction> {
        self.active.as_ref()
    }

    pub fn records(&self) -> &[TierRecord] {
        &self.records
    }

    /// Start an iteration. Entering a tier samples its constant from `zscores`.
    ///
    /// Returns the record of a newly entered tier. It is kept in
    /// [`records`](Self::records) once [`complete_iteration`](Self::complete_iteration)
    /// is called.
    pub fn begin_iteration(&mut self, iteration: usize, zscores: &[f64]) -> Option<TierRecord> {
        if !self.entering {
            return None;
        }
        self.entering = false;

        let tier = self.tiers[self.current];
        let tweaking_constant = CumulativeDistribution::new(zscores.iter().copied())
            .value(tier.quantile)
            .unwrap_or(0.0);

        self.active = Some(MaximumLikelihoodFunction {
            model: tier.model,
            tweaking_constant,
        });
        let record = TierRecord {
            tier: self.current,
            model: tier.model,
            quantile: tier.quantile,
            tweaking_constant,
            entered_at: iteration,
        };
        self.pending = Some(record);

        debug!(
            "Tier {} entered: {} at quantile {:.3}, tweaking constant {:.6}",
            self.current,
            tier.model.name(),
            tier.quantile,
            tweaking_constant
        );
        Some(record)
    }

    /// Record the tier entered by the iteration that just succeeded.
    pub fn complete_iteration(&mut self) -> Option<TierRecord> {
        let record = self.pending.take()?;
        self.records.push(record);
        Some(record)
    }

    /// Weight multiplier for a z-score under the active function.
    pub fn weight(&self, zscore: f64) -> f64 {
        self.active.map_or(1.0, |f| f.weight(zscore))
    }

    /// Report that the adjustment converged under the current weighting.
    pub fn on_converged(&mut self) -> TierTransition {
        if self.current + 1 < self.tiers.len() {
            self.current += 1;
            self.entering = true;
            TierTransition::Advanced { tier: self.current }
        } else {
            TierTransition::Finished
        }
    }
}
