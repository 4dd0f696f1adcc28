//! Bundle settings: the read-only configuration of one run.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::control::SerialNumber;
use crate::geometry::CoordinateType;

use super::error::BundleError;
use super::robust::MaximumLikelihoodTier;

/// Maximum number of robust tiers.
pub const MAX_TIERS: usize = 3;

/// How the reduced normal equations are factored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SolveMethod {
    /// Assemble the reduced system as one dense matrix.
    Dense,
    /// Keep the block sparsity and use a sparse Cholesky factorization.
    #[default]
    Sparse,
}

/// Which pointing coefficients are solved (`CAMSOLVE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PointingSolveOption {
    None,
    #[default]
    Angles,
    AnglesVelocity,
    AnglesVelocityAcceleration,
    /// Every coefficient of a polynomial of the configured degree.
    All,
}

impl PointingSolveOption {
    /// Solved coefficients per pointing axis.
    pub fn coefficients(&self, degree: usize) -> usize {
        match self {
            PointingSolveOption::None => 0,
            PointingSolveOption::Angles => 1,
            PointingSolveOption::AnglesVelocity => 2,
            PointingSolveOption::AnglesVelocityAcceleration => 3,
            PointingSolveOption::All => degree + 1,
        }
    }
}

/// Which position coefficients are solved (`SPSOLVE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PositionSolveOption {
    #[default]
    None,
    Position,
    PositionVelocity,
    PositionVelocityAcceleration,
    /// Every coefficient of a polynomial of the configured degree.
    All,
}

impl PositionSolveOption {
    /// Solved coefficients per position axis.
    pub fn coefficients(&self, degree: usize) -> usize {
        match self {
            PositionSolveOption::None => 0,
            PositionSolveOption::Position => 1,
            PositionSolveOption::PositionVelocity => 2,
            PositionSolveOption::PositionVelocityAcceleration => 3,
            PositionSolveOption::All => degree + 1,
        }
    }
}

/// Configuration for a bundle adjustment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleSettings {
    /// Factorization strategy for the reduced normal equations.
    pub solve_method: SolveMethod,

    /// Solved pointing coefficients.
    pub pointing: PointingSolveOption,

    /// Polynomial degree used when `pointing` is `All`.
    pub pointing_degree: usize,

    /// Solve the twist angle along with right ascension and declination.
    pub solve_twist: bool,

    /// Solved position coefficients.
    pub position: PositionSolveOption,

    /// Polynomial degree used when `position` is `All`.
    pub position_degree: usize,

    /// Solve point radius (latitudinal coordinates only).
    pub solve_radius: bool,

    /// Parameterization of point coordinates.
    pub coordinate_type: CoordinateType,

    /// Images whose parameters stay fixed.
    pub held_images: Vec<SerialNumber>,

    /// Global point a-priori sigmas (meters) for free points.
    pub point_sigmas: [Option<f64>; 3],

    /// Position a-priori sigmas by coefficient order: m, m/s, m/s².
    pub position_sigmas: Vec<f64>,

    /// Pointing a-priori sigmas by coefficient order: deg, deg/s, deg/s².
    pub pointing_sigmas: Vec<f64>,

    /// Sigma of a measure without its own sigma (pixels).
    pub measure_sigma: f64,

    /// Convergence threshold on the change of sigma0 between iterations.
    pub convergence_threshold: f64,

    /// Maximum number of iterations.
    pub max_iterations: usize,

    /// Reject measures whose weighted residual exceeds the rejection limit.
    pub outlier_rejection: bool,

    /// Rejection limit as a multiple of the residual RMS.
    pub outlier_rejection_multiplier: f64,

    /// Robust reweighting tiers, in order.
    pub maximum_likelihood: Vec<MaximumLikelihoodTier>,

    /// Compute adjusted sigmas after convergence.
    pub error_propagation: bool,

    /// Relative Cholesky pivot below which the reduced system is singular.
    pub singularity_tolerance: f64,
}

impl Default for BundleSettings {
    fn default() -> Self {
        Self {
            solve_method: SolveMethod::Sparse,
            pointing: PointingSolveOption::Angles,
            pointing_degree: 2,
            solve_twist: true,
            position: PositionSolveOption::None,
            position_degree: 2,
            solve_radius: false,
            coordinate_type: CoordinateType::Latitudinal,
            held_images: Vec::new(),
            point_sigmas: [None; 3],
            position_sigmas: Vec::new(),
            pointing_sigmas: Vec::new(),
            measure_sigma: 1.0,
            convergence_threshold: 1e-10,
            max_iterations: 50,
            outlier_rejection: false,
            outlier_rejection_multiplier: 3.0,
            maximum_likelihood: Vec::new(),
            error_propagation: false,
            singularity_tolerance: 1e-14,
        }
    }
}

impl BundleSettings {
    /// Check the configuration before any work is done.
    pub fn validate(&self) -> Result<(), BundleError> {
        if self.pointing == PointingSolveOption::None && self.position == PositionSolveOption::None
        {
            return Err(BundleError::NothingToSolve);
        }
        if self.maximum_likelihood.len() > MAX_TIERS {
            return Err(BundleError::InvalidSettings(format!(
                "at most {} maximum likelihood tiers are supported, {} given",
                MAX_TIERS,
                self.maximum_likelihood.len()
            )));
        }
        for (i, tier) in self.maximum_likelihood.iter().enumerate() {
            if !(tier.quantile > 0.0 && tier.quantile < 1.0) {
                return Err(BundleError::InvalidSettings(format!(
                    "tier {} quantile [{}] must lie strictly between 0 and 1",
                    i, tier.quantile
                )));
            }
        }
        if !(self.convergence_threshold > 0.0) {
            return Err(BundleError::InvalidSettings(format!(
                "convergence threshold [{}] must be positive",
                self.convergence_threshold
            )));
        }
        if self.max_iterations == 0 {
            return Err(BundleError::InvalidSettings(
                "maximum iterations must be at least 1".into(),
            ));
        }
        if !(self.measure_sigma > 0.0) {
            return Err(BundleError::InvalidSettings(format!(
                "measure sigma [{}] must be positive",
                self.measure_sigma
            )));
        }
        if self.outlier_rejection && !(self.outlier_rejection_multiplier > 0.0) {
            return Err(BundleError::InvalidSettings(format!(
                "outlier rejection multiplier [{}] must be positive",
                self.outlier_rejection_multiplier
            )));
        }
        if !(self.singularity_tolerance >= 0.0) {
            return Err(BundleError::InvalidSettings(
                "singularity tolerance must not be negative".into(),
            ));
        }
        let negative_sigma = self
            .point_sigmas
            .iter()
            .flatten()
            .chain(&self.position_sigmas)
            .chain(&self.pointing_sigmas)
            .any(|s| !(*s >= 0.0));
        if negative_sigma {
            return Err(BundleError::InvalidSettings(
                "a-priori sigmas must not be negative".into(),
            ));
        }
        let mut held = HashSet::new();
        for serial in &self.held_images {
            if !held.insert(serial) {
                return Err(BundleError::InvalidSettings(format!(
                    "held image [{}] is listed twice",
                    serial
                )));
            }
        }
        Ok(())
    }

    /// Solved coefficients per position axis.
    pub fn position_coefficients(&self) -> usize {
        self.position.coefficients(self.position_degree)
    }

    /// Solved coefficients per pointing axis.
    pub fn pointing_coefficients(&self) -> usize {
        self.pointing.coefficients(self.pointing_degree)
    }

    /// A-priori sigma of a position coefficient, in km per unit scaled time^order.
    ///
    /// Zero or missing sigmas leave the coefficient unconstrained.
    pub fn position_coefficient_sigma(&self, order: usize, time_scale: f64) -> Option<f64> {
        self.position_sigmas
            .get(order)
            .filter(|s| **s > 0.0)
            .map(|s| s / 1000.0 * time_scale.powi(order as i32))
    }

    /// A-priori sigma of a pointing coefficient, in radians per unit scaled time^order.
    pub fn pointing_coefficient_sigma(&self, order: usize, time_scale: f64) -> Option<f64> {
        self.pointing_sigmas
            .get(order)
            .filter(|s| **s > 0.0)
            .map(|s| s.to_radians() * time_scale.powi(order as i32))
    }

    pub fn is_held(&self, serial: &SerialNumber) -> bool {
        self.held_images.contains(serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::robust::MaximumLikelihoodModel;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = BundleSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.pointing_coefficients(), 1);
        assert_eq!(settings.position_coefficients(), 0);
    }

    #[test]
    fn test_nothing_to_solve() {
        let settings = BundleSettings {
            pointing: PointingSolveOption::None,
            position: PositionSolveOption::None,
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("camera pointing or spacecraft position"));
    }

    #[test]
    fn test_too_many_tiers() {
        let tier = MaximumLikelihoodTier::new(MaximumLikelihoodModel::Huber, 0.5);
        let settings = BundleSettings {
            maximum_likelihood: vec![tier; 4],
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(BundleError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_bad_quantile() {
        let settings = BundleSettings {
            maximum_likelihood: vec![MaximumLikelihoodTier::new(
                MaximumLikelihoodModel::Chen,
                1.0,
            )],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_all_coefficients_follow_degree() {
        let settings = BundleSettings {
            position: PositionSolveOption::All,
            position_degree: 4,
            pointing: PointingSolveOption::AnglesVelocity,
            ..Default::default()
        };
        assert_eq!(settings.position_coefficients(), 5);
        assert_eq!(settings.pointing_coefficients(), 2);
    }

    #[test]
    fn test_coefficient_sigma_units() {
        let settings = BundleSettings {
            position_sigmas: vec![100.0, 10.0],
            pointing_sigmas: vec![0.5, 0.0],
            ..Default::default()
        };
        assert_relative_eq!(settings.position_coefficient_sigma(0, 2.0).unwrap(), 0.1);
        assert_relative_eq!(settings.position_coefficient_sigma(1, 2.0).unwrap(), 0.02);
        assert!(settings.position_coefficient_sigma(2, 2.0).is_none());
        assert_relative_eq!(
            settings.pointing_coefficient_sigma(0, 1.0).unwrap(),
            0.5f64.to_radians()
        );
        assert!(settings.pointing_coefficient_sigma(1, 1.0).is_none());
    }

    #[test]
    fn test_duplicate_held_images() {
        let settings = BundleSettings {
            held_images: vec![SerialNumber::new("a"), SerialNumber::new("a")],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_from_json_use_defaults() {
        let settings: BundleSettings =
            serde_json::from_str(r#"{ "position": "Position", "max_iterations": 5 }"#).unwrap();
        assert_eq!(settings.position, PositionSolveOption::Position);
        assert_eq!(settings.max_iterations, 5);
        assert_eq!(settings.pointing, PointingSolveOption::Angles);
    }
}
