//! Error propagation: adjusted sigmas from the inverse normal equations.
//!
//! # Theory
//!
//! With `Q = S⁻¹` the inverse of the reduced system, image covariances are
//! the diagonal blocks `Q_aa`. Point covariances follow from the block
//! inverse of the full normal matrix:
//!
//! ```text
//! C_j = N_jj⁻¹ + N_jj⁻¹ · (Σ_a Σ_b N_ajᵀ Q_ab N_bj) · N_jj⁻¹
//! ```
//!
//! Only the columns of `Q` belonging to solved images are recovered, one
//! image block at a time. Variances are scaled by sigma0².

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector, Matrix3, MatrixXx3, Vector3};
use tracing::debug;

use super::error::BundleError;
use super::normals::PointReduction;
use super::parameter_index::ParameterIndex;
use super::solver::FactoredNormals;

/// Adjusted sigmas in parameter units.
#[derive(Debug, Clone, Default)]
pub struct PropagatedSigmas {
    /// (image ordinal, coefficient sigmas in block order).
    pub images: Vec<(usize, DVector<f64>)>,
    /// (point ordinal, coordinate parameter sigmas).
    pub points: Vec<(usize, Vector3<f64>)>,
}

/// Recover adjusted sigmas for every solved image and reduced point.
///
/// `factor` is `None` when no image carries unknowns.
pub fn propagate(
    factor: Option<&dyn FactoredNormals>,
    index: &ParameterIndex,
    reductions: &[PointReduction],
    sigma0: f64,
) -> Result<PropagatedSigmas, BundleError> {
    let block_len = index.layout().len();
    let dimension = factor.map_or(0, |f| f.dimension());

    let mut columns: BTreeMap<usize, DMatrix<f64>> = BTreeMap::new();
    let mut images = Vec::new();
    for image in index.solved_images() {
        let factor = factor.ok_or_else(|| {
            BundleError::ErrorPropagation("reduced system was not factored".into())
        })?;
        let start = index.image_block(image)?.start;
        let q = factor.inverse_columns(start, block_len);
        let variances = q.view((start, 0), (block_len, block_len)).diagonal();
        images.push((image, sigmas_from_variances(&variances, sigma0, "image", image)?));
        columns.insert(start, q);
    }

    let mut points = Vec::new();
    for reduction in reductions {
        let Some(inverse) = reduction.inverse else {
            continue;
        };

        let mut t = MatrixXx3::zeros(dimension);
        for (start_b, n_bj) in &reduction.couplings {
            if let Some(q_b) = columns.get(start_b) {
                t += q_b * n_bj;
            }
        }
        let mut middle = Matrix3::zeros();
        for (start_a, n_aj) in &reduction.couplings {
            middle += n_aj.transpose() * t.rows(*start_a, n_aj.nrows());
        }

        let covariance = inverse + inverse * middle * inverse;
        let variances = DVector::from_column_slice(covariance.diagonal().as_slice());
        let sigmas = sigmas_from_variances(&variances, sigma0, "point", reduction.point)?;
        points.push((reduction.point, Vector3::new(sigmas[0], sigmas[1], sigmas[2])));
    }

    debug!(
        "Propagated sigmas for {} images and {} points",
        images.len(),
        points.len()
    );
    Ok(PropagatedSigmas { images, points })
}

fn sigmas_from_variances(
    variances: &DVector<f64>,
    sigma0: f64,
    entity: &str,
    ordinal: usize,
) -> Result<DVector<f64>, BundleError> {
    if variances.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(BundleError::ErrorPropagation(format!(
            "invalid variance for {} {}",
            entity, ordinal
        )));
    }
    Ok(variances.map(|v| v.sqrt() * sigma0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix2x3, Vector2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::bundle::normals::{reduce_point, ReducedNormals};
    use crate::bundle::observation::{Linearization, ObservationEquation, PointObservations};
    use crate::bundle::parameter_index::ImageLayout;
    use crate::bundle::settings::SolveMethod;
    use crate::bundle::solver::solver_for;

    const BLOCK: usize = 2;

    fn equation(rng: &mut StdRng, image: usize) -> ObservationEquation {
        ObservationEquation {
            measure: 0,
            image,
            residual: Vector2::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)),
            sigma: 1.0,
            rejected: false,
            partials: Some(Linearization {
                image: Some(DMatrix::from_fn(2, BLOCK, |_, _| rng.gen_range(-1.0..1.0))),
                point: Matrix2x3::from_fn(|_, _| rng.gen_range(-1.0..1.0)),
            }),
        }
    }

    #[test]
    fn test_sigmas_match_full_inverse() {
        let mut rng = StdRng::seed_from_u64(21);
        let index = ParameterIndex::new(ImageLayout::new(0, 1, false), &[false; 3], &[true; 3]);
        let all: Vec<PointObservations> = [[0, 1, 2, 0], [1, 2, 0, 1], [2, 0, 1, 2]]
            .iter()
            .enumerate()
            .map(|(j, imgs)| PointObservations {
                point: j,
                equations: imgs.iter().map(|i| equation(&mut rng, *i)).collect(),
                geometry_failures: Vec::new(),
            })
            .collect();

        // Full normal matrix over images and points
        let n = index.num_unknowns();
        let mut big_n = DMatrix::zeros(n, n);
        for obs in &all {
            for eq in &obs.equations {
                let lin = eq.partials.as_ref().unwrap();
                let mut row = DMatrix::zeros(2, n);
                let start = index.image_start_of(eq.image).unwrap();
                row.view_mut((0, start), (2, BLOCK))
                    .copy_from(lin.image.as_ref().unwrap());
                let p = index.point_offset(obs.point).unwrap();
                row.view_mut((0, p), (2, 3)).copy_from(&lin.point);
                big_n += row.transpose() * &row;
            }
        }
        let full_inverse = big_n.try_inverse().unwrap();

        let reductions: Vec<_> = all
            .iter()
            .map(|o| reduce_point(o, &index, |eq| eq.weight(), None).unwrap())
            .collect();
        let mut normals = ReducedNormals::new(index.image_unknowns());
        for r in &reductions {
            normals.accumulate(r);
        }
        let factor = solver_for(SolveMethod::Sparse, 1e-14).factor(&normals).unwrap();

        let sigma0 = 2.0;
        let sigmas = propagate(Some(factor.as_ref()), &index, &reductions, sigma0).unwrap();

        assert_eq!(sigmas.images.len(), 3);
        for (image, s) in &sigmas.images {
            let start = index.image_start_of(*image).unwrap();
            for k in 0..BLOCK {
                let expected = full_inverse[(start + k, start + k)].sqrt() * sigma0;
                assert_relative_eq!(s[k], expected, epsilon = 1e-9);
            }
        }
        assert_eq!(sigmas.points.len(), 3);
        for (point, s) in &sigmas.points {
            let p = index.point_offset(*point).unwrap();
            for k in 0..3 {
                let expected = full_inverse[(p + k, p + k)].sqrt() * sigma0;
                assert_relative_eq!(s[k], expected, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_negative_variance_fails() {
        let err = sigmas_from_variances(&DVector::from_vec(vec![1.0, -1.0]), 1.0, "point", 4)
            .unwrap_err();
        assert!(matches!(err, BundleError::ErrorPropagation(_)));
    }
}
