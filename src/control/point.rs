//! ControlPoint - a ground point with its image measures.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::measure::ControlMeasure;
use super::types::PointId;

/// How strongly a point's ground coordinate is tied to its a-priori value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointType {
    /// Coordinate is known; the point has no unknowns.
    Fixed,
    /// Coordinate is solved but weighted toward its a-priori value.
    Constrained,
    /// Coordinate is solved from the measures alone.
    Free,
}

impl std::fmt::Display for PointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PointType::Fixed => "FIXED",
            PointType::Constrained => "CONSTRAINED",
            PointType::Free => "FREE",
        };
        write!(f, "{}", name)
    }
}

fn zero_vector() -> Vector3<f64> {
    Vector3::zeros()
}

/// A control point.
///
/// Coordinates are body-fixed rectangular kilometers. The adjustment may
/// parameterize them as latitude/longitude/radius; that choice is a run
/// setting and does not change what is stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPoint {
    pub id: PointId,

    pub point_type: PointType,

    /// Ignored points never take part in an adjustment.
    #[serde(default)]
    pub ignored: bool,

    /// A-priori ground coordinate (km).
    apriori: Vector3<f64>,

    /// Adjusted ground coordinate (km). Equal to the a-priori until solved.
    #[serde(default)]
    adjusted: Option<Vector3<f64>>,

    /// A-priori sigmas in meters, per coordinate of the run's coordinate type
    /// (latitude/longitude/radius or X/Y/Z).
    #[serde(default)]
    pub apriori_sigmas: Option<Vector3<f64>>,

    /// Corrections accumulated over the run, in coordinate parameter units.
    #[serde(default = "zero_vector")]
    corrections: Vector3<f64>,

    /// Adjusted sigmas in meters, available after error propagation.
    #[serde(default)]
    adjusted_sigmas: Option<Vector3<f64>>,

    measures: Vec<ControlMeasure>,
}

impl ControlPoint {
    /// Create a new point at the given a-priori coordinate (km).
    pub fn new(id: PointId, point_type: PointType, apriori: Vector3<f64>) -> Self {
        Self {
            id,
            point_type,
            ignored: false,
            apriori,
            adjusted: None,
            apriori_sigmas: None,
            corrections: Vector3::zeros(),
            adjusted_sigmas: None,
            measures: Vec::new(),
        }
    }

    /// Attach a-priori sigmas (meters).
    pub fn with_apriori_sigmas(mut self, sigmas: Vector3<f64>) -> Self {
        self.apriori_sigmas = Some(sigmas);
        self
    }

    pub fn is_fixed(&self) -> bool {
        self.point_type == PointType::Fixed
    }

    pub fn apriori(&self) -> Vector3<f64> {
        self.apriori
    }

    /// Current adjusted coordinate (km).
    pub fn adjusted(&self) -> Vector3<f64> {
        self.adjusted.unwrap_or(self.apriori)
    }

    pub fn set_adjusted_coordinate(&mut self, xyz: Vector3<f64>) {
        self.adjusted = Some(xyz);
    }

    pub fn corrections(&self) -> Vector3<f64> {
        self.corrections
    }

    pub fn set_corrections(&mut self, corrections: Vector3<f64>) {
        self.corrections = corrections;
    }

    pub fn adjusted_sigmas(&self) -> Option<Vector3<f64>> {
        self.adjusted_sigmas
    }

    pub fn set_adjusted_sigmas(&mut self, sigmas: Option<Vector3<f64>>) {
        self.adjusted_sigmas = sigmas;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Measures
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_measure(&mut self, measure: ControlMeasure) {
        self.measures.push(measure);
    }

    pub fn measures(&self) -> &[ControlMeasure] {
        &self.measures
    }

    pub fn measure(&self, index: usize) -> Option<&ControlMeasure> {
        self.measures.get(index)
    }

    pub fn measure_mut(&mut self, index: usize) -> Option<&mut ControlMeasure> {
        self.measures.get_mut(index)
    }

    pub fn num_measures(&self) -> usize {
        self.measures.len()
    }

    /// Measures that are neither ignored nor rejected.
    pub fn num_accepted_measures(&self) -> usize {
        self.measures.iter().filter(|m| m.is_accepted()).count()
    }

    pub fn num_rejected_measures(&self) -> usize {
        self.measures
            .iter()
            .filter(|m| !m.ignored && m.is_rejected())
            .count()
    }

    /// RMS of the recorded residual magnitudes over accepted measures.
    pub fn residual_rms(&self) -> f64 {
        let (sum, n) = self
            .measures
            .iter()
            .filter(|m| m.is_accepted())
            .fold((0.0, 0usize), |(sum, n), m| {
                (sum + m.residual().norm_squared(), n + 1)
            });
        if n == 0 {
            0.0
        } else {
            (sum / n as f64).sqrt()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::SerialNumber;
    use approx::assert_relative_eq;
    use nalgebra::Vector2;

    fn point_with_measures() -> ControlPoint {
        let mut p = ControlPoint::new(
            PointId::new("p1"),
            PointType::Free,
            Vector3::new(1737.4, 0.0, 0.0),
        );
        for serial in ["a", "b", "c"] {
            p.add_measure(ControlMeasure::new(SerialNumber::new(serial), 100.0, 200.0));
        }
        p
    }

    #[test]
    fn test_adjusted_defaults_to_apriori() {
        let mut p = point_with_measures();
        assert_eq!(p.adjusted(), p.apriori());

        p.set_adjusted_coordinate(Vector3::new(1737.5, 0.1, 0.0));
        assert_relative_eq!(p.adjusted().x, 1737.5);
        assert_relative_eq!(p.apriori().x, 1737.4);
    }

    #[test]
    fn test_measure_counts() {
        let mut p = point_with_measures();
        p.measure_mut(0).unwrap().set_rejected(true);
        p.measure_mut(1).unwrap().ignored = true;

        assert_eq!(p.num_measures(), 3);
        assert_eq!(p.num_accepted_measures(), 1);
        assert_eq!(p.num_rejected_measures(), 1);
    }

    #[test]
    fn test_residual_rms_skips_rejected() {
        let mut p = point_with_measures();
        p.measure_mut(0).unwrap().set_residual(Vector2::new(100.0, 0.0));
        p.measure_mut(0).unwrap().set_rejected(true);
        p.measure_mut(1).unwrap().set_residual(Vector2::new(3.0, 4.0));
        p.measure_mut(2).unwrap().set_residual(Vector2::new(0.0, 5.0));

        assert_relative_eq!(p.residual_rms(), 5.0);
    }

    #[test]
    fn test_point_type_display() {
        assert_eq!(PointType::Constrained.to_string(), "CONSTRAINED");
    }
}
