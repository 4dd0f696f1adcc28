//! Normal equations with point parameters eliminated.
//!
//! # Theory
//!
//! Ordering unknowns as [images | points], the full normal equations are
//!
//! ```text
//! | N_ii   N_ij | |Δ_i|   |n_i|
//! | N_ijᵀ  N_jj | |Δ_j| = |n_j|
//! ```
//!
//! with `N_jj` block diagonal (one 3x3 block per point). Each point is
//! eliminated on its own:
//!
//! ```text
//! S_ab  -= N_aj · N_jj⁻¹ · N_bjᵀ      (for every image pair a ≤ b seeing point j)
//! r_a   -= N_aj · N_jj⁻¹ · n_j
//! ```
//!
//! so the directly solved system `S Δ_i = r` only spans image unknowns.
//! Point corrections follow by back-substitution:
//!
//! ```text
//! Δ_j = N_jj⁻¹ · (n_j − Σ_a N_ajᵀ Δ_a)
//! ```
//!
//! A [`PointReduction`] holds one point's contribution and everything
//! needed for back-substitution and error propagation. Reductions are
//! computed independently (in parallel) and folded into a
//! [`ReducedNormals`] in point order.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector, Matrix3, MatrixXx3, Vector3};
use nalgebra_sparse::{CooMatrix, CscMatrix};

use super::observation::{ObservationEquation, PointObservations};
use super::parameter_index::ParameterIndex;

/// Relative pivot below which a point block counts as singular.
const POINT_PIVOT_TOLERANCE: f64 = 1e-12;

/// A-priori constraint on a point's coordinate parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointConstraint {
    /// Diagonal weights (1/σ²), zero where unconstrained.
    pub weights: Vector3<f64>,
    /// Current minus a-priori coordinate, in parameter units.
    pub accumulated: Vector3<f64>,
}

/// Why a point could not be reduced this iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointExclusion {
    /// No accepted measure could be linearized.
    NoObservations,
    /// N_jj could not be inverted.
    SingularPointBlock,
}

/// One point's contribution to the reduced normal equations.
#[derive(Debug, Clone)]
pub struct PointReduction {
    pub point: usize,
    /// N_jj⁻¹, `None` for points without unknowns.
    pub inverse: Option<Matrix3<f64>>,
    /// n_j, including the constraint term.
    pub rhs: Vector3<f64>,
    /// (image block start, N_aj) for each solved image, ascending.
    pub couplings: Vec<(usize, MatrixXx3<f64>)>,
    /// Upper-triangle blocks (row start, col start, block) of S.
    blocks: Vec<(usize, usize, DMatrix<f64>)>,
    /// Right-hand side contributions per image block start.
    image_rhs: Vec<(usize, DVector<f64>)>,
}

impl PointReduction {
    /// Δ_j from the solved image corrections (reduced-system ordering).
    pub fn back_substitute(&self, image_corrections: &DVector<f64>) -> Option<Vector3<f64>> {
        let inverse = self.inverse?;
        let mut rhs = self.rhs;
        for (start, n_aj) in &self.couplings {
            let delta_a = image_corrections.rows(*start, n_aj.nrows());
            rhs -= n_aj.transpose() * delta_a;
        }
        Some(inverse * rhs)
    }
}

/// Per-image accumulation inside one point.
struct ImageTerms {
    n_aa: DMatrix<f64>,
    n_a: DVector<f64>,
    n_aj: MatrixXx3<f64>,
}

/// Reduce one point's observations.
///
/// `weight_of` gives the total weight of an equation (a-priori times
/// robust). Points without unknowns only contribute their image blocks.
pub fn reduce_point(
    observations: &PointObservations,
    index: &ParameterIndex,
    weight_of: impl Fn(&ObservationEquation) -> f64,
    constraint: Option<&PointConstraint>,
) -> Result<PointReduction, PointExclusion> {
    let block_len = index.layout().len();
    let solved = index.is_point_solved(observations.point);

    let mut images: BTreeMap<usize, ImageTerms> = BTreeMap::new();
    let mut n_jj = Matrix3::zeros();
    let mut n_j = Vector3::zeros();
    let mut used = 0;

    for eq in observations.accepted() {
        let Some(lin) = &eq.partials else {
            continue;
        };
        used += 1;
        let w = weight_of(eq);
        let jp = &lin.point;

        n_jj += w * jp.transpose() * jp;
        n_j += w * jp.transpose() * eq.residual;

        if let (Some(ja), Some(start)) = (&lin.image, index.image_start_of(eq.image)) {
            let jat = ja.transpose();
            let terms = images.entry(start).or_insert_with(|| ImageTerms {
                n_aa: DMatrix::zeros(block_len, block_len),
                n_a: DVector::zeros(block_len),
                n_aj: MatrixXx3::zeros(block_len),
            });
            terms.n_aa += w * &jat * ja;
            terms.n_a += w * &jat * eq.residual;
            terms.n_aj += w * &jat * jp;
        }
    }

    if solved && used == 0 {
        return Err(PointExclusion::NoObservations);
    }

    if !solved {
        let (blocks, image_rhs) = images
            .into_iter()
            .map(|(start, t)| ((start, start, t.n_aa), (start, t.n_a)))
            .unzip();
        return Ok(PointReduction {
            point: observations.point,
            inverse: None,
            rhs: Vector3::zeros(),
            couplings: Vec::new(),
            blocks,
            image_rhs,
        });
    }

    if let Some(c) = constraint {
        n_jj += Matrix3::from_diagonal(&c.weights);
        n_j -= c.weights.component_mul(&c.accumulated);
    }

    let inverse = invert_point_block(&n_jj).ok_or(PointExclusion::SingularPointBlock)?;

    let terms: Vec<(usize, ImageTerms)> = images.into_iter().collect();
    let mut blocks = Vec::with_capacity(terms.len() * (terms.len() + 1) / 2);
    let mut image_rhs = Vec::with_capacity(terms.len());

    for (i, (start_a, a)) in terms.iter().enumerate() {
        let t_a = &a.n_aj * inverse;
        image_rhs.push((*start_a, &a.n_a - &t_a * n_j));

        for (start_b, b) in terms.iter().skip(i) {
            let schur = &t_a * b.n_aj.transpose();
            let block = if start_a == start_b {
                &a.n_aa - schur
            } else {
                -schur
            };
            blocks.push((*start_a, *start_b, block));
        }
    }

    Ok(PointReduction {
        point: observations.point,
        inverse: Some(inverse),
        rhs: n_j,
        couplings: terms.into_iter().map(|(start, t)| (start, t.n_aj)).collect(),
        blocks,
        image_rhs,
    })
}

/// Inverse of a symmetric point block, `None` when any Cholesky pivot is
/// negligible relative to its own diagonal entry.
fn invert_point_block(n_jj: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let chol = n_jj.cholesky()?;
    let l = chol.l_dirty();
    let well_conditioned = (0..3).all(|i| {
        let d = n_jj[(i, i)];
        d > 0.0 && l[(i, i)] * l[(i, i)] > POINT_PIVOT_TOLERANCE * d
    });
    let inverse = chol.inverse();
    (well_conditioned && inverse.iter().all(|v| v.is_finite())).then_some(inverse)
}

/// Reduced normal equations over image unknowns.
///
/// Stored as symmetric blocks keyed by (row start, col start) with
/// row ≤ col; lower blocks are implied.
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedNormals {
    dimension: usize,
    blocks: BTreeMap<(usize, usize), DMatrix<f64>>,
    rhs: DVector<f64>,
}

impl ReducedNormals {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            blocks: BTreeMap::new(),
            rhs: DVector::zeros(dimension),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn rhs(&self) -> &DVector<f64> {
        &self.rhs
    }

    /// Stored (upper) blocks.
    pub fn blocks(&self) -> impl Iterator<Item = (&(usize, usize), &DMatrix<f64>)> {
        self.blocks.iter()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, row: usize, col: usize) -> Option<&DMatrix<f64>> {
        self.blocks.get(&(row, col))
    }

    /// Add a block at (row, col); blocks below the diagonal are stored transposed.
    pub fn add_block(&mut self, row: usize, col: usize, block: &DMatrix<f64>) {
        let (key, value) = if row <= col {
            ((row, col), block.clone())
        } else {
            ((col, row), block.transpose())
        };
        match self.blocks.get_mut(&key) {
            Some(existing) => *existing += value,
            None => {
                self.blocks.insert(key, value);
            }
        }
    }

    pub fn add_rhs(&mut self, start: usize, values: &DVector<f64>) {
        let mut rows = self.rhs.rows_mut(start, values.len());
        rows += values;
    }

    /// Fold one point's reduction into the system.
    pub fn accumulate(&mut self, reduction: &PointReduction) {
        for (row, col, block) in &reduction.blocks {
            self.add_block(*row, *col, block);
        }
        for (start, values) in &reduction.image_rhs {
            self.add_rhs(*start, values);
        }
    }

    /// Add diagonal a-priori weights on one image block.
    ///
    /// `accumulated` is the correction applied so far; the right-hand side
    /// pulls the parameters back toward their a-priori values.
    pub fn add_diagonal_constraint(
        &mut self,
        start: usize,
        weights: &DVector<f64>,
        accumulated: &DVector<f64>,
    ) {
        let n = weights.len();
        let block = DMatrix::from_diagonal(weights);
        self.add_block(start, start, &block);
        let mut rows = self.rhs.rows_mut(start, n);
        rows -= weights.component_mul(accumulated);
    }

    pub fn diagonal(&self) -> DVector<f64> {
        let mut diag = DVector::zeros(self.dimension);
        for ((row, col), block) in &self.blocks {
            if row == col {
                for k in 0..block.nrows() {
                    diag[row + k] += block[(k, k)];
                }
            }
        }
        diag
    }

    /// Full symmetric dense matrix.
    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.dimension, self.dimension);
        for ((row, col), block) in &self.blocks {
            let shape = block.shape();
            let mut upper = dense.view_mut((*row, *col), shape);
            upper += block;
            if row != col {
                let mut lower = dense.view_mut((*col, *row), (shape.1, shape.0));
                lower += block.transpose();
            }
        }
        dense
    }

    /// Full symmetric sparse matrix in compressed column form.
    pub fn to_csc(&self) -> CscMatrix<f64> {
        let mut coo = CooMatrix::new(self.dimension, self.dimension);
        for ((row, col), block) in &self.blocks {
            for c in 0..block.ncols() {
                for r in 0..block.nrows() {
                    let v = block[(r, c)];
                    coo.push(row + r, col + c, v);
                    if row != col {
                        coo.push(col + c, row + r, v);
                    }
                }
            }
        }
        CscMatrix::from(&coo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix2x3, Vector2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::bundle::observation::Linearization;
    use crate::bundle::parameter_index::ImageLayout;

    const BLOCK: usize = 2;

    fn random_equation(rng: &mut StdRng, image: usize, index: &ParameterIndex) -> ObservationEquation {
        let point = Matrix2x3::from_fn(|_, _| rng.gen_range(-1.0..1.0));
        let image_partials = index
            .is_image_solved(image)
            .then(|| DMatrix::from_fn(2, BLOCK, |_, _| rng.gen_range(-1.0..1.0)));
        ObservationEquation {
            measure: image,
            image,
            residual: Vector2::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)),
            sigma: 0.5,
            rejected: false,
            partials: Some(Linearization {
                image: image_partials,
                point,
            }),
        }
    }

    fn observations(rng: &mut StdRng, index: &ParameterIndex, point: usize, images: &[usize]) -> PointObservations {
        PointObservations {
            point,
            equations: images.iter().map(|i| random_equation(rng, *i, index)).collect(),
            geometry_failures: Vec::new(),
        }
    }

    /// Full (images + points) normal equations built directly.
    fn full_system(index: &ParameterIndex, all: &[PointObservations]) -> (DMatrix<f64>, DVector<f64>) {
        let n = index.num_unknowns();
        let mut big_n = DMatrix::zeros(n, n);
        let mut big_r = DVector::zeros(n);
        for obs in all {
            for eq in &obs.equations {
                let lin = eq.partials.as_ref().unwrap();
                let mut row = DMatrix::zeros(2, n);
                if let Some(start) = index.image_start_of(eq.image) {
                    row.view_mut((0, start), (2, BLOCK))
                        .copy_from(lin.image.as_ref().unwrap());
                }
                if let Ok(p) = index.point_offset(obs.point) {
                    row.view_mut((0, p), (2, 3)).copy_from(&lin.point);
                }
                let w = eq.weight();
                big_n += w * row.transpose() * &row;
                big_r += w * row.transpose() * eq.residual;
            }
        }
        (big_n, big_r)
    }

    #[test]
    fn test_schur_matches_full_solve() {
        let mut rng = StdRng::seed_from_u64(7);
        let index = ParameterIndex::new(
            ImageLayout::new(0, 1, false),
            &[false, false, false],
            &[true, true, true, true],
        );
        let all = vec![
            observations(&mut rng, &index, 0, &[0, 1, 2]),
            observations(&mut rng, &index, 1, &[0, 1]),
            observations(&mut rng, &index, 2, &[1, 2]),
            observations(&mut rng, &index, 3, &[0, 2, 1, 0]),
        ];

        let mut reduced = ReducedNormals::new(index.image_unknowns());
        let reductions: Vec<_> = all
            .iter()
            .map(|o| reduce_point(o, &index, |eq| eq.weight(), None).unwrap())
            .collect();
        for r in &reductions {
            reduced.accumulate(r);
        }

        let s = reduced.to_dense();
        assert_relative_eq!(s, s.transpose(), epsilon = 1e-12);

        let delta_i = s.clone().cholesky().unwrap().solve(reduced.rhs());
        let (big_n, big_r) = full_system(&index, &all);
        let full = big_n.cholesky().unwrap().solve(&big_r);

        assert_relative_eq!(delta_i, full.rows(0, 6).into_owned(), epsilon = 1e-8);
        for r in &reductions {
            let delta_j = r.back_substitute(&delta_i).unwrap();
            let offset = index.point_offset(r.point).unwrap();
            assert_relative_eq!(delta_j, full.fixed_rows::<3>(offset).into_owned(), epsilon = 1e-8);
        }
    }

    #[test]
    fn test_unsolved_point_contributes_image_blocks_only() {
        let mut rng = StdRng::seed_from_u64(11);
        let index = ParameterIndex::new(ImageLayout::new(0, 1, false), &[false, false], &[false]);
        let obs = observations(&mut rng, &index, 0, &[0, 1]);

        let r = reduce_point(&obs, &index, |eq| eq.weight(), None).unwrap();
        assert!(r.inverse.is_none());
        assert!(r.back_substitute(&DVector::zeros(4)).is_none());

        let mut reduced = ReducedNormals::new(4);
        reduced.accumulate(&r);
        assert_eq!(reduced.num_blocks(), 2);
        assert!(reduced.block(0, 2).is_none());
    }

    #[test]
    fn test_single_observation_point_is_singular() {
        let mut rng = StdRng::seed_from_u64(3);
        let index = ParameterIndex::new(ImageLayout::new(0, 1, false), &[false], &[true]);
        let obs = observations(&mut rng, &index, 0, &[0]);

        let err = reduce_point(&obs, &index, |eq| eq.weight(), None).unwrap_err();
        assert_eq!(err, PointExclusion::SingularPointBlock);

        // A-priori weights make the block invertible
        let constraint = PointConstraint {
            weights: Vector3::repeat(1.0),
            accumulated: Vector3::zeros(),
        };
        assert!(reduce_point(&obs, &index, |eq| eq.weight(), Some(&constraint)).is_ok());
    }

    #[test]
    fn test_point_without_observations_is_excluded() {
        let index = ParameterIndex::new(ImageLayout::new(0, 1, false), &[false], &[true]);
        let obs = PointObservations {
            point: 0,
            equations: Vec::new(),
            geometry_failures: Vec::new(),
        };
        assert_eq!(
            reduce_point(&obs, &index, |eq| eq.weight(), None).unwrap_err(),
            PointExclusion::NoObservations
        );
    }

    #[test]
    fn test_sparse_and_dense_forms_agree() {
        let mut normals = ReducedNormals::new(4);
        normals.add_block(0, 0, &DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]));
        normals.add_block(2, 0, &DMatrix::from_row_slice(2, 2, &[0.5, 0.0, 0.2, 0.1]));
        normals.add_block(2, 2, &DMatrix::identity(2, 2));

        let dense = normals.to_dense();
        let csc = normals.to_csc();
        for (r, c, v) in csc.triplet_iter() {
            assert_relative_eq!(dense[(r, c)], *v);
        }
        assert_relative_eq!(dense[(0, 2)], 0.5);
        assert_relative_eq!(dense[(2, 0)], 0.5);
        assert_relative_eq!(dense[(1, 3)], 0.1);
        assert_eq!(normals.diagonal(), DVector::from_vec(vec![4.0, 3.0, 1.0, 1.0]));
    }

    #[test]
    fn test_diagonal_constraint_pulls_back() {
        let mut normals = ReducedNormals::new(2);
        normals.add_diagonal_constraint(
            0,
            &DVector::from_vec(vec![100.0, 0.0]),
            &DVector::from_vec(vec![0.01, 5.0]),
        );
        assert_relative_eq!(normals.rhs()[0], -1.0);
        assert_relative_eq!(normals.rhs()[1], 0.0);
        assert_relative_eq!(normals.to_dense()[(0, 0)], 100.0);
    }
}
