//! Bundle results: statistics accumulated over a run.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::control::{ControlNet, PointId, SerialNumber};

use super::controller::BundleState;
use super::image::BundleImage;
use super::robust::TierRecord;
use super::statistics::{CumulativeDistribution, Statistics};

/// Residual statistics of one image (pixels).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageResiduals {
    pub serial: SerialNumber,
    pub sample: Statistics,
    pub line: Statistics,
    /// Residual magnitudes.
    pub total: Statistics,
    /// Accepted measures.
    pub used: usize,
    /// Non-ignored measures.
    pub total_measures: usize,
}

impl ImageResiduals {
    fn new(serial: SerialNumber) -> Self {
        Self {
            serial,
            sample: Statistics::new(),
            line: Statistics::new(),
            total: Statistics::new(),
            used: 0,
            total_measures: 0,
        }
    }
}

/// One iteration, as reported to the history and progress listeners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: usize,
    pub sigma0: f64,
    pub vtpv: f64,
    /// Two per accepted measure used in the solve.
    pub observations: usize,
    pub degrees_of_freedom: i64,
    pub rejected_measures: usize,
    /// Measures left out because their geometry failed after the corrections.
    pub geometry_failures: usize,
    pub excluded_points: usize,
    /// Combined residual RMS after the corrections (pixels).
    pub rms_total: f64,
    /// Largest absolute correction applied to an image coefficient.
    pub max_image_correction: f64,
}

/// Outcome of error propagation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum PropagationStatus {
    #[default]
    NotRequested,
    Completed,
    /// The solution is kept without sigmas.
    Failed(String),
}

/// RMS and extrema of one adjusted point coordinate sigma (meters).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinateSigmaSummary {
    pub rms: f64,
    pub minimum: Option<(f64, PointId)>,
    pub maximum: Option<(f64, PointId)>,
}

impl CoordinateSigmaSummary {
    fn from_values<'a>(values: impl Iterator<Item = (f64, &'a PointId)>) -> Self {
        let mut stats = Statistics::new();
        let mut minimum: Option<(f64, PointId)> = None;
        let mut maximum: Option<(f64, PointId)> = None;
        for (value, id) in values {
            stats.add(value);
            if minimum.as_ref().map_or(true, |(m, _)| value < *m) {
                minimum = Some((value, id.clone()));
            }
            if maximum.as_ref().map_or(true, |(m, _)| value > *m) {
                maximum = Some((value, id.clone()));
            }
        }
        Self {
            rms: stats.rms(),
            minimum,
            maximum,
        }
    }
}

/// Degrees of freedom: observations plus constraints minus unknowns.
pub fn degrees_of_freedom(
    observations: usize,
    constrained_point_parameters: usize,
    constrained_image_parameters: usize,
    unknowns: usize,
) -> i64 {
    (observations + constrained_point_parameters + constrained_image_parameters) as i64
        - unknowns as i64
}

/// Standard deviation of unit weight.
pub fn sigma0(vtpv: f64, degrees_of_freedom: i64) -> f64 {
    if degrees_of_freedom > 0 {
        (vtpv / degrees_of_freedom as f64).sqrt()
    } else {
        vtpv.sqrt()
    }
}

/// Aggregate statistics of a run.
///
/// Created empty, filled in while iterating and read-only once the run
/// has finished.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleResults {
    pub state: BundleState,
    pub sigma0: f64,
    /// Sigma0 of the residuals before the first correction.
    pub initial_sigma0: f64,
    /// Weighted sum of squared residuals.
    pub vtpv: f64,

    pub observations: usize,
    pub rejected_measures: usize,
    pub constrained_point_parameters: usize,
    pub constrained_image_parameters: usize,
    pub unknowns: usize,
    pub image_unknowns: usize,
    pub degrees_of_freedom: i64,
    pub geometry_failures: usize,
    pub excluded_points: usize,

    pub rms_sample: f64,
    pub rms_line: f64,
    pub rms_total: f64,
    /// Weighted residual above which measures were rejected.
    pub rejection_limit: Option<f64>,
    pub image_residuals: Vec<ImageResiduals>,
    /// Weighted residual magnitudes of accepted measures.
    pub residual_distribution: CumulativeDistribution,

    pub iterations: usize,
    pub converged: bool,
    pub history: Vec<IterationSummary>,
    pub tiers: Vec<TierRecord>,

    pub elapsed_seconds: f64,
    pub error_propagation_seconds: f64,
    pub propagation: PropagationStatus,
    /// Point sigma summaries per coordinate, after error propagation.
    pub point_sigmas: Option<[CoordinateSigmaSummary; 3]>,
}

impl BundleResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_sigmas(&self) -> bool {
        self.propagation == PropagationStatus::Completed
    }

    pub fn last_iteration(&self) -> Option<&IterationSummary> {
        self.history.last()
    }

    pub fn image_residuals(&self, serial: &SerialNumber) -> Option<&ImageResiduals> {
        self.image_residuals.iter().find(|r| &r.serial == serial)
    }

    /// Recompute residual statistics from the residuals stored on the network.
    ///
    /// `default_sigma` weighs measures without a sigma of their own.
    /// Measures for which `excluded(point, measure)` holds count towards
    /// their image's total but not towards any statistic.
    pub fn update_residual_statistics(
        &mut self,
        net: &ControlNet,
        images: &[BundleImage],
        default_sigma: f64,
        excluded: impl Fn(usize, usize) -> bool,
    ) {
        let mut per_image: HashMap<&SerialNumber, ImageResiduals> = images
            .iter()
            .map(|img| (&img.serial, ImageResiduals::new(img.serial.clone())))
            .collect();
        let mut sample = Statistics::new();
        let mut line = Statistics::new();
        let mut weighted = Vec::new();
        let mut rejected = 0;

        for (j, point) in net.points().iter().enumerate().filter(|(_, p)| !p.ignored) {
            for (m, measure) in point.measures().iter().enumerate() {
                if measure.ignored {
                    continue;
                }
                let image = per_image.get_mut(&measure.serial);
                if measure.is_rejected() || excluded(j, m) {
                    if measure.is_rejected() {
                        rejected += 1;
                    }
                    if let Some(image) = image {
                        image.total_measures += 1;
                    }
                    continue;
                }
                let r = measure.residual();
                sample.add(r.x);
                line.add(r.y);
                weighted.push(r.norm() / measure.sigma.unwrap_or(default_sigma));
                if let Some(image) = image {
                    image.total_measures += 1;
                    image.used += 1;
                    image.sample.add(r.x);
                    image.line.add(r.y);
                    image.total.add(r.norm());
                }
            }
        }

        self.rms_sample = sample.rms();
        self.rms_line = line.rms();
        self.rms_total = ((sample.sum_squares() + line.sum_squares())
            / (sample.count() as f64).max(1.0))
        .sqrt();
        self.rejected_measures = rejected;
        self.residual_distribution = CumulativeDistribution::new(weighted);
        self.image_residuals = images
            .iter()
            .filter_map(|img| per_image.remove(&img.serial))
            .collect();
    }

    /// Summarize adjusted point sigmas stored on the network.
    pub fn update_point_sigma_summary(&mut self, net: &ControlNet) {
        let sigmas: Vec<_> = net
            .points()
            .iter()
            .filter_map(|p| p.adjusted_sigmas().map(|s| (s, &p.id)))
            .collect();
        if sigmas.is_empty() {
            self.point_sigmas = None;
            return;
        }
        let summary = |k: usize| {
            CoordinateSigmaSummary::from_values(sigmas.iter().map(|(s, id)| (s[k], *id)))
        };
        self.point_sigmas = Some([summary(0), summary(1), summary(2)]);
    }
}
