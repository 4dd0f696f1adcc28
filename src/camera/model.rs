//! The camera-model contract consumed by the adjustment.
//!
//! The bundle treats instrument geometry as a black box. A model must be
//! able to predict where a ground point lands in the image for a given
//! exterior orientation; partial derivatives default to central
//! differences of that prediction, and models with closed-form
//! derivatives override them.

use nalgebra::{Matrix2x3, Matrix2x6, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Step for position and ground-coordinate differences (km).
const POSITION_STEP: f64 = 1e-3;

/// Step for pointing-angle differences (radians).
const ANGLE_STEP: f64 = 1e-7;

/// Instrument position and pointing at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExteriorOrientation {
    /// Body-fixed instrument position (km).
    pub position: Vector3<f64>,

    /// Right ascension, declination, twist (radians).
    pub angles: Vector3<f64>,
}

impl ExteriorOrientation {
    pub fn new(position: Vector3<f64>, angles: Vector3<f64>) -> Self {
        Self { position, angles }
    }

    /// Value of orientation axis `k` (X, Y, Z, RA, DEC, TWIST).
    fn component(&self, k: usize) -> f64 {
        if k < 3 {
            self.position[k]
        } else {
            self.angles[k - 3]
        }
    }

    fn with_component(mut self, k: usize, value: f64) -> Self {
        if k < 3 {
            self.position[k] = value;
        } else {
            self.angles[k - 3] = value;
        }
        self
    }
}

/// Failure to resolve geometry for one measurement.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("ground point is behind the instrument (depth {depth:.6} km)")]
    BehindInstrument { depth: f64 },

    #[error("ground point projects outside the detector at ({sample:.2}, {line:.2})")]
    OutsideDetector { sample: f64, line: f64 },

    #[error("no geometry available at ephemeris time {time}")]
    NoGeometry { time: f64 },
}

/// Ground-to-image model of one image's instrument.
pub trait CameraModel: Send + Sync {
    /// Ephemeris time at which the measured coordinate was acquired.
    fn observation_time(&self, measured: &Vector2<f64>) -> f64;

    /// Predicted (sample, line) of a body-fixed ground point.
    fn predict(
        &self,
        orientation: &ExteriorOrientation,
        ground: &Vector3<f64>,
    ) -> Result<Vector2<f64>, GeometryError>;

    /// d(sample, line) / d(X, Y, Z, RA, DEC, TWIST).
    fn orientation_partials(
        &self,
        orientation: &ExteriorOrientation,
        ground: &Vector3<f64>,
    ) -> Result<Matrix2x6<f64>, GeometryError> {
        let mut partials = Matrix2x6::zeros();
        for k in 0..6 {
            let h = if k < 3 { POSITION_STEP } else { ANGLE_STEP };
            let value = orientation.component(k);
            let plus = self.predict(&orientation.with_component(k, value + h), ground)?;
            let minus = self.predict(&orientation.with_component(k, value - h), ground)?;
            partials.set_column(k, &((plus - minus) / (2.0 * h)));
        }
        Ok(partials)
    }

    /// d(sample, line) / d(ground X, Y, Z).
    fn ground_partials(
        &self,
        orientation: &ExteriorOrientation,
        ground: &Vector3<f64>,
    ) -> Result<Matrix2x3<f64>, GeometryError> {
        let mut partials = Matrix2x3::zeros();
        for k in 0..3 {
            let mut plus = *ground;
            let mut minus = *ground;
            plus[k] += POSITION_STEP;
            minus[k] -= POSITION_STEP;
            let diff = self.predict(orientation, &plus)? - self.predict(orientation, &minus)?;
            partials.set_column(k, &(diff / (2.0 * POSITION_STEP)));
        }
        Ok(partials)
    }
}
