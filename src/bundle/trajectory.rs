//! Image parameter blocks: position and pointing as polynomials in time.
//!
//! Each axis is `Σ c_k s^k` in scaled time `s = (t − base_time) / time_scale`.
//! Position coefficients are kilometers, pointing coefficients radians.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::camera::ExteriorOrientation;

/// The six exterior orientation axes, in image-block order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ImageAxis {
    X,
    Y,
    Z,
    RightAscension,
    Declination,
    Twist,
}

impl ImageAxis {
    pub const ALL: [ImageAxis; 6] = [
        ImageAxis::X,
        ImageAxis::Y,
        ImageAxis::Z,
        ImageAxis::RightAscension,
        ImageAxis::Declination,
        ImageAxis::Twist,
    ];

    /// Column of this axis in a 2x6 orientation partials matrix.
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn is_position(&self) -> bool {
        matches!(self, ImageAxis::X | ImageAxis::Y | ImageAxis::Z)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ImageAxis::X => "X",
            ImageAxis::Y => "Y",
            ImageAxis::Z => "Z",
            ImageAxis::RightAscension => "RA",
            ImageAxis::Declination => "DEC",
            ImageAxis::Twist => "TWI",
        }
    }
}

impl std::fmt::Display for ImageAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Polynomial position and pointing of one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Ephemeris time at which scaled time is zero.
    pub base_time: f64,

    /// Seconds per unit of scaled time.
    pub time_scale: f64,

    /// X, Y, Z coefficients (km).
    pub position: [Vec<f64>; 3],

    /// RA, DEC, TWIST coefficients (radians).
    pub pointing: [Vec<f64>; 3],
}

impl Trajectory {
    /// A trajectory with constant position and pointing.
    pub fn constant(position: Vector3<f64>, angles: Vector3<f64>) -> Self {
        Self {
            base_time: 0.0,
            time_scale: 1.0,
            position: [vec![position.x], vec![position.y], vec![position.z]],
            pointing: [vec![angles.x], vec![angles.y], vec![angles.z]],
        }
    }

    pub fn with_time_base(mut self, base_time: f64, time_scale: f64) -> Self {
        self.base_time = base_time;
        self.time_scale = time_scale;
        self
    }

    pub fn scaled_time(&self, time: f64) -> f64 {
        if self.time_scale == 0.0 {
            time - self.base_time
        } else {
            (time - self.base_time) / self.time_scale
        }
    }

    /// Polynomial basis (1, s, s², …) of length `count` at ephemeris time `time`.
    pub fn basis(&self, time: f64, count: usize) -> Vec<f64> {
        let s = self.scaled_time(time);
        let mut basis = Vec::with_capacity(count);
        let mut term = 1.0;
        for _ in 0..count {
            basis.push(term);
            term *= s;
        }
        basis
    }

    /// Coefficients of one axis.
    pub fn coefficients(&self, axis: ImageAxis) -> &[f64] {
        let k = axis.index();
        if axis.is_position() {
            &self.position[k]
        } else {
            &self.pointing[k - 3]
        }
    }

    pub fn coefficients_mut(&mut self, axis: ImageAxis) -> &mut Vec<f64> {
        let k = axis.index();
        if axis.is_position() {
            &mut self.position[k]
        } else {
            &mut self.pointing[k - 3]
        }
    }

    /// Exterior orientation at ephemeris time `time`.
    pub fn orientation_at(&self, time: f64) -> ExteriorOrientation {
        let s = self.scaled_time(time);
        let eval = |c: &[f64]| c.iter().rev().fold(0.0, |acc, ck| acc * s + ck);
        ExteriorOrientation::new(
            Vector3::new(
                eval(&self.position[0]),
                eval(&self.position[1]),
                eval(&self.position[2]),
            ),
            Vector3::new(
                eval(&self.pointing[0]),
                eval(&self.pointing[1]),
                eval(&self.pointing[2]),
            ),
        )
    }

    /// Zero-pad every axis to at least the given coefficient counts.
    pub fn pad_to(&mut self, position_coefficients: usize, pointing_coefficients: usize) {
        for c in self.position.iter_mut() {
            if c.len() < position_coefficients {
                c.resize(position_coefficients, 0.0);
            }
        }
        for c in self.pointing.iter_mut() {
            if c.len() < pointing_coefficients {
                c.resize(pointing_coefficients, 0.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_orientation_polynomial() {
        let mut t = Trajectory::constant(Vector3::new(10.0, 0.0, 0.0), Vector3::zeros())
            .with_time_base(100.0, 2.0);
        t.position[0] = vec![10.0, 1.0, 0.5];
        t.pointing[2] = vec![0.1, 0.2];

        // s = (104 - 100) / 2 = 2
        let eo = t.orientation_at(104.0);
        assert_relative_eq!(eo.position.x, 10.0 + 2.0 + 0.5 * 4.0);
        assert_relative_eq!(eo.angles.z, 0.1 + 0.4);
    }

    #[test]
    fn test_basis() {
        let t = Trajectory::constant(Vector3::zeros(), Vector3::zeros()).with_time_base(1.0, 0.5);
        assert_eq!(t.basis(2.0, 4), vec![1.0, 2.0, 4.0, 8.0]);
        assert!(t.basis(2.0, 0).is_empty());
    }

    #[test]
    fn test_pad_never_truncates() {
        let mut t = Trajectory::constant(Vector3::new(1.0, 2.0, 3.0), Vector3::zeros());
        t.pointing[0] = vec![0.1, 0.2, 0.3];
        t.pad_to(3, 2);
        assert_eq!(t.coefficients(ImageAxis::Y), &[2.0, 0.0, 0.0]);
        assert_eq!(t.coefficients(ImageAxis::RightAscension).len(), 3);
        assert_eq!(t.coefficients(ImageAxis::Twist), &[0.0, 0.0]);
    }

    #[test]
    fn test_axis_order() {
        let labels: Vec<_> = ImageAxis::ALL.iter().map(|a| a.label()).collect();
        assert_eq!(labels, vec!["X", "Y", "Z", "RA", "DEC", "TWI"]);
        assert_eq!(ImageAxis::Declination.index(), 4);
    }
}
