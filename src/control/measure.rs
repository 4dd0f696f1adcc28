//! ControlMeasure - one observation of a control point in one image.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use super::types::SerialNumber;

/// A measured image coordinate of a control point.
///
/// The rejected flag belongs to the adjustment: it is set and cleared by
/// outlier rejection across iterations and is never read from input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMeasure {
    /// Image the measure was made in.
    pub serial: SerialNumber,

    /// Measured sample coordinate (pixels).
    pub sample: f64,

    /// Measured line coordinate (pixels).
    pub line: f64,

    /// Measurement sigma in pixels. Falls back to the run default when unset.
    #[serde(default)]
    pub sigma: Option<f64>,

    /// Ignored measures never take part in an adjustment.
    #[serde(default)]
    pub ignored: bool,

    #[serde(default, skip_deserializing)]
    rejected: bool,

    /// Sample residual (observed - predicted) from the latest solve.
    #[serde(default)]
    residual_sample: f64,

    /// Line residual (observed - predicted) from the latest solve.
    #[serde(default)]
    residual_line: f64,
}

impl ControlMeasure {
    /// Create a new measure at (sample, line) in the given image.
    pub fn new(serial: SerialNumber, sample: f64, line: f64) -> Self {
        Self {
            serial,
            sample,
            line,
            sigma: None,
            ignored: false,
            rejected: false,
            residual_sample: 0.0,
            residual_line: 0.0,
        }
    }

    /// Set an explicit measurement sigma (pixels).
    pub fn with_sigma(mut self, sigma: f64) -> Self {
        self.sigma = Some(sigma);
        self
    }

    /// Measured (sample, line).
    pub fn measured(&self) -> Vector2<f64> {
        Vector2::new(self.sample, self.line)
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected
    }

    pub fn set_rejected(&mut self, rejected: bool) {
        self.rejected = rejected;
    }

    /// Not ignored and not rejected.
    pub fn is_accepted(&self) -> bool {
        !self.ignored && !self.rejected
    }

    /// Residual (sample, line) recorded by the latest solve.
    pub fn residual(&self) -> Vector2<f64> {
        Vector2::new(self.residual_sample, self.residual_line)
    }

    pub fn set_residual(&mut self, residual: Vector2<f64>) {
        self.residual_sample = residual.x;
        self.residual_line = residual.y;
    }

    /// Euclidean length of the residual in pixels.
    pub fn residual_magnitude(&self) -> f64 {
        self.residual().norm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_new_measure_is_accepted() {
        let m = ControlMeasure::new(SerialNumber::new("img1"), 10.0, 20.0);
        assert!(m.is_accepted());
        assert!(!m.is_rejected());
        assert_eq!(m.measured(), Vector2::new(10.0, 20.0));
    }

    #[test]
    fn test_residual_roundtrip() {
        let mut m = ControlMeasure::new(SerialNumber::new("img1"), 0.0, 0.0);
        m.set_residual(Vector2::new(3.0, 4.0));
        assert_relative_eq!(m.residual_magnitude(), 5.0);
    }

    #[test]
    fn test_rejected_flag_is_not_deserialized() {
        let mut m = ControlMeasure::new(SerialNumber::new("img1"), 1.0, 2.0);
        m.set_rejected(true);
        let json = serde_json::to_string(&m).unwrap();
        let back: ControlMeasure = serde_json::from_str(&json).unwrap();
        assert!(!back.is_rejected());
        assert_eq!(back.sample, 1.0);
    }
}
