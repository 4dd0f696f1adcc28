//! ControlNet - container for control points.
//!
//! The network is the adjustment's view of the outside world: it enumerates
//! points and their measures, and exposes the few mutation hooks the bundle
//! needs (rejection flags, adjusted coordinates, corrections, residuals).
//! Points are addressed by ordinal; the ordinal order is stable for the
//! lifetime of the network.

use std::collections::{BTreeSet, HashMap};

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::point::ControlPoint;
use super::types::{PointId, SerialNumber};

/// A control network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlNet {
    /// Network name.
    #[serde(default)]
    pub network_id: String,

    /// Target body name.
    #[serde(default)]
    pub target: String,

    points: Vec<ControlPoint>,
}

impl ControlNet {
    /// Create a new empty network.
    pub fn new(network_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            target: target.into(),
            points: Vec::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Points
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a point, returning its ordinal.
    pub fn add_point(&mut self, point: ControlPoint) -> usize {
        self.points.push(point);
        self.points.len() - 1
    }

    pub fn points(&self) -> &[ControlPoint] {
        &self.points
    }

    pub fn point(&self, ordinal: usize) -> Option<&ControlPoint> {
        self.points.get(ordinal)
    }

    pub fn point_mut(&mut self, ordinal: usize) -> Option<&mut ControlPoint> {
        self.points.get_mut(ordinal)
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    /// Ordinal of the point with the given id.
    pub fn find_point(&self, id: &PointId) -> Option<usize> {
        self.points.iter().position(|p| &p.id == id)
    }

    /// Points that are not ignored.
    pub fn num_valid_points(&self) -> usize {
        self.points.iter().filter(|p| !p.ignored).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Measures
    // ─────────────────────────────────────────────────────────────────────────

    /// Distinct serial numbers referenced by non-ignored measures, sorted.
    pub fn serial_numbers(&self) -> BTreeSet<SerialNumber> {
        self.points
            .iter()
            .filter(|p| !p.ignored)
            .flat_map(|p| p.measures().iter())
            .filter(|m| !m.ignored)
            .map(|m| m.serial.clone())
            .collect()
    }

    pub fn num_measures(&self) -> usize {
        self.points.iter().map(|p| p.num_measures()).sum()
    }

    /// Measures on non-ignored points that are neither ignored nor rejected.
    pub fn num_accepted_measures(&self) -> usize {
        self.points
            .iter()
            .filter(|p| !p.ignored)
            .map(|p| p.num_accepted_measures())
            .sum()
    }

    pub fn num_rejected_measures(&self) -> usize {
        self.points
            .iter()
            .filter(|p| !p.ignored)
            .map(|p| p.num_rejected_measures())
            .sum()
    }

    /// Count of (accepted, total non-ignored) measures per image.
    pub fn measures_per_image(&self) -> HashMap<SerialNumber, (usize, usize)> {
        let mut counts: HashMap<SerialNumber, (usize, usize)> = HashMap::new();
        for point in self.points.iter().filter(|p| !p.ignored) {
            for measure in point.measures().iter().filter(|m| !m.ignored) {
                let entry = counts.entry(measure.serial.clone()).or_default();
                entry.1 += 1;
                if !measure.is_rejected() {
                    entry.0 += 1;
                }
            }
        }
        counts
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutation hooks used by the adjustment
    // ─────────────────────────────────────────────────────────────────────────

    /// Set or clear the rejected flag of a measure. Returns false if the
    /// measure does not exist.
    pub fn set_rejected(&mut self, point: usize, measure: usize, rejected: bool) -> bool {
        match self.points.get_mut(point).and_then(|p| p.measure_mut(measure)) {
            Some(m) => {
                m.set_rejected(rejected);
                true
            }
            None => false,
        }
    }

    pub fn set_residual(&mut self, point: usize, measure: usize, residual: Vector2<f64>) -> bool {
        match self.points.get_mut(point).and_then(|p| p.measure_mut(measure)) {
            Some(m) => {
                m.set_residual(residual);
                true
            }
            None => false,
        }
    }

    pub fn set_adjusted_coordinate(&mut self, point: usize, xyz: Vector3<f64>) -> bool {
        match self.points.get_mut(point) {
            Some(p) => {
                p.set_adjusted_coordinate(xyz);
                true
            }
            None => false,
        }
    }

    pub fn set_corrections(&mut self, point: usize, corrections: Vector3<f64>) -> bool {
        match self.points.get_mut(point) {
            Some(p) => {
                p.set_corrections(corrections);
                true
            }
            None => false,
        }
    }
}
