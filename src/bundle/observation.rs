//! Observation equations: residuals and partials of each measure.
//!
//! For a measure at observed `(sample, line)` the camera predicts the image
//! coordinate of the point's current ground position from the image's
//! trajectory evaluated at the measure's ephemeris time. The residual is
//! `observed − predicted` in pixels. Partials with respect to a solved
//! coefficient `c_k` of orientation axis `a` follow the chain rule through
//! the polynomial basis:
//!
//! ```text
//! ∂(s, l)/∂c_k = ∂(s, l)/∂a · s^k
//! ```
//!
//! Point partials are the camera's ground partials times d(xyz)/d(params).
//!
//! Building is read-only on the network, images and index, so points can be
//! processed in parallel.

use std::collections::HashMap;

use nalgebra::{DMatrix, Matrix2x3, Vector2};

use crate::camera::GeometryError;
use crate::control::{ControlPoint, SerialNumber};
use crate::geometry::surface::{parameters_from_rectangular, rectangular_jacobian};
use crate::geometry::CoordinateType;

use super::image::BundleImage;
use super::parameter_index::ParameterIndex;
use super::robust::residual_zscore;

/// Read-shared inputs for building equations.
pub struct ObservationContext<'a> {
    pub images: &'a [BundleImage],
    pub image_lookup: &'a HashMap<SerialNumber, usize>,
    pub index: &'a ParameterIndex,
    pub coordinate_type: CoordinateType,
    /// Sigma for measures without their own (pixels).
    pub default_sigma: f64,
}

/// What to compute for each measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Residuals and partials for accepted measures.
    Linearize,
    /// Residuals only, rejected measures included.
    ResidualsOnly,
}

/// Partials of one observation.
#[derive(Debug, Clone)]
pub struct Linearization {
    /// 2 × block length, `None` when the image is held.
    pub image: Option<DMatrix<f64>>,
    /// With respect to the point's coordinate parameters.
    pub point: Matrix2x3<f64>,
}

/// One measure's observation equation.
#[derive(Debug, Clone)]
pub struct ObservationEquation {
    /// Measure index within its point.
    pub measure: usize,
    /// Image ordinal.
    pub image: usize,
    /// Observed − predicted (pixels).
    pub residual: Vector2<f64>,
    /// Measure sigma (pixels).
    pub sigma: f64,
    pub rejected: bool,
    pub partials: Option<Linearization>,
}

impl ObservationEquation {
    /// A-priori weight 1/σ².
    pub fn weight(&self) -> f64 {
        1.0 / (self.sigma * self.sigma)
    }

    /// Residual length in sigma units.
    pub fn weighted_residual(&self) -> f64 {
        self.residual.norm() / self.sigma
    }

    pub fn zscore(&self) -> f64 {
        residual_zscore(&self.residual, self.sigma)
    }
}

/// All equations of one point.
#[derive(Debug, Clone)]
pub struct PointObservations {
    pub point: usize,
    pub equations: Vec<ObservationEquation>,
    /// Measures the camera could not resolve this time.
    pub geometry_failures: Vec<(usize, GeometryError)>,
}

impl PointObservations {
    pub fn accepted(&self) -> impl Iterator<Item = &ObservationEquation> {
        self.equations.iter().filter(|e| !e.rejected)
    }

    pub fn num_accepted(&self) -> usize {
        self.accepted().count()
    }
}

/// Build the equations of every usable measure of a point.
pub fn build_point_observations(
    ctx: &ObservationContext<'_>,
    ordinal: usize,
    point: &ControlPoint,
    mode: BuildMode,
) -> PointObservations {
    let mut equations = Vec::with_capacity(point.num_measures());
    let mut geometry_failures = Vec::new();

    for (m, measure) in point.measures().iter().enumerate() {
        if measure.ignored || (mode == BuildMode::Linearize && measure.is_rejected()) {
            continue;
        }
        match build_equation(ctx, point, m, mode) {
            Some(Ok(eq)) => equations.push(eq),
            Some(Err(e)) => geometry_failures.push((m, e)),
            None => {}
        }
    }

    PointObservations {
        point: ordinal,
        equations,
        geometry_failures,
    }
}

/// Build one measure's equation. `None` if the measure or its image is unknown.
pub fn build_equation(
    ctx: &ObservationContext<'_>,
    point: &ControlPoint,
    measure_index: usize,
    mode: BuildMode,
) -> Option<Result<ObservationEquation, GeometryError>> {
    let measure = point.measure(measure_index)?;
    let image_ordinal = *ctx.image_lookup.get(&measure.serial)?;
    let image = ctx.images.get(image_ordinal)?;

    let measured = measure.measured();
    let time = image.camera.observation_time(&measured);
    let orientation = image.trajectory.orientation_at(time);
    let ground = point.adjusted();

    let result = (|| -> Result<ObservationEquation, GeometryError> {
        let predicted = image.camera.predict(&orientation, &ground)?;
        let partials = match mode {
            BuildMode::ResidualsOnly => None,
            BuildMode::Linearize => {
                let params = parameters_from_rectangular(ctx.coordinate_type, &ground);
                let point_partials = image.camera.ground_partials(&orientation, &ground)?
                    * rectangular_jacobian(ctx.coordinate_type, &params);

                let image_partials = if ctx.index.is_image_solved(image_ordinal) {
                    let eo_partials = image.camera.orientation_partials(&orientation, &ground)?;
                    let layout = ctx.index.layout();
                    let order = layout
                        .position_coefficients()
                        .max(layout.pointing_coefficients());
                    let basis = image.trajectory.basis(time, order);

                    let mut jac = DMatrix::zeros(2, layout.len());
                    let mut col = 0;
                    for axis in layout.solved_axes() {
                        let axis_partials = eo_partials.column(axis.index());
                        for power in basis.iter().take(layout.coefficients(axis)) {
                            jac.set_column(col, &(axis_partials * *power));
                            col += 1;
                        }
                    }
                    Some(jac)
                } else {
                    None
                };

                Some(Linearization {
                    image: image_partials,
                    point: point_partials,
                })
            }
        };

        Ok(ObservationEquation {
            measure: measure_index,
            image: image_ordinal,
            residual: measured - predicted,
            sigma: measure.sigma.unwrap_or(ctx.default_sigma),
            rejected: measure.is_rejected(),
            partials,
        })
    })();

    Some(result)
}
