//! Solve strategies for the reduced normal equations.
//!
//! A strategy factors the reduced system once per iteration; the factor
//! then solves for corrections and, after convergence, recovers columns of
//! the inverse for error propagation. Strategies differ only in how they
//! exploit sparsity; their solutions agree to rounding.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use nalgebra_sparse::factorization::CscCholesky;
use tracing::debug;

use super::error::BundleError;
use super::normals::ReducedNormals;
use super::settings::SolveMethod;

/// Factors reduced normal equations.
pub trait NormalSolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Factor the system. Fails with [`BundleError::SingularSystem`].
    fn factor(&self, normals: &ReducedNormals) -> Result<Box<dyn FactoredNormals>, BundleError>;
}

/// A factored reduced system.
pub trait FactoredNormals: Send + Sync {
    fn dimension(&self) -> usize;

    /// Solve `S x = rhs`.
    fn solve(&self, rhs: &DVector<f64>) -> DVector<f64>;

    /// Columns `[start, start + count)` of `S⁻¹`.
    fn inverse_columns(&self, start: usize, count: usize) -> DMatrix<f64>;
}

/// Strategy for a configured solve method.
pub fn solver_for(method: SolveMethod, singularity_tolerance: f64) -> Box<dyn NormalSolver> {
    match method {
        SolveMethod::Dense => Box::new(DenseCholeskySolver::new(singularity_tolerance)),
        SolveMethod::Sparse => Box::new(SparseCholeskySolver::new(singularity_tolerance)),
    }
}

/// Index of the first pivot that is not positive or is negligible against
/// its own diagonal entry.
fn first_weak_pivot(
    pivots: impl Iterator<Item = (usize, f64)>,
    diagonal: &DVector<f64>,
    tolerance: f64,
) -> Option<usize> {
    pivots
        .filter(|(i, l_ii)| {
            let d = diagonal[*i];
            !(d > 0.0) || !(l_ii * l_ii > tolerance * d)
        })
        .map(|(i, _)| i)
        .min()
}

fn unit_columns(dimension: usize, start: usize, count: usize) -> DMatrix<f64> {
    let mut e = DMatrix::zeros(dimension, count);
    for k in 0..count {
        e[(start + k, k)] = 1.0;
    }
    e
}

// ─────────────────────────────────────────────────────────────────────────────
// Dense
// ─────────────────────────────────────────────────────────────────────────────

/// Dense Cholesky over the whole reduced matrix.
#[derive(Debug, Clone)]
pub struct DenseCholeskySolver {
    tolerance: f64,
}

impl DenseCholeskySolver {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }
}

struct DenseFactor {
    chol: Cholesky<f64, Dyn>,
    dimension: usize,
}

impl NormalSolver for DenseCholeskySolver {
    fn name(&self) -> &'static str {
        "dense Cholesky"
    }

    fn factor(&self, normals: &ReducedNormals) -> Result<Box<dyn FactoredNormals>, BundleError> {
        let dimension = normals.dimension();
        let matrix = normals.to_dense();
        let diagonal = matrix.diagonal();

        let chol = Cholesky::new(matrix).ok_or(BundleError::SingularSystem { pivot: None })?;
        let l = chol.l_dirty();
        if let Some(pivot) = first_weak_pivot(
            (0..dimension).map(|i| (i, l[(i, i)])),
            &diagonal,
            self.tolerance,
        ) {
            return Err(BundleError::SingularSystem { pivot: Some(pivot) });
        }

        debug!("Dense Cholesky factored: {} unknowns", dimension);
        Ok(Box::new(DenseFactor { chol, dimension }))
    }
}

impl FactoredNormals for DenseFactor {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn solve(&self, rhs: &DVector<f64>) -> DVector<f64> {
        self.chol.solve(rhs)
    }

    fn inverse_columns(&self, start: usize, count: usize) -> DMatrix<f64> {
        self.chol.solve(&unit_columns(self.dimension, start, count))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sparse
// ─────────────────────────────────────────────────────────────────────────────

/// Sparse Cholesky keeping the image-block sparsity pattern.
#[derive(Debug, Clone)]
pub struct SparseCholeskySolver {
    tolerance: f64,
}

impl SparseCholeskySolver {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }
}

struct SparseFactor {
    chol: CscCholesky<f64>,
    dimension: usize,
}

impl NormalSolver for SparseCholeskySolver {
    fn name(&self) -> &'static str {
        "sparse Cholesky"
    }

    fn factor(&self, normals: &ReducedNormals) -> Result<Box<dyn FactoredNormals>, BundleError> {
        let dimension = normals.dimension();
        let matrix = normals.to_csc();
        let diagonal = normals.diagonal();

        let chol = CscCholesky::factor(&matrix)
            .map_err(|_| BundleError::SingularSystem { pivot: None })?;

        let mut l_diagonal = vec![0.0; dimension];
        for (row, col, value) in chol.l().triplet_iter() {
            if row == col {
                l_diagonal[row] = *value;
            }
        }
        if let Some(pivot) = first_weak_pivot(
            l_diagonal.iter().copied().enumerate(),
            &diagonal,
            self.tolerance,
        ) {
            return Err(BundleError::SingularSystem { pivot: Some(pivot) });
        }

        debug!(
            "Sparse Cholesky factored: {} unknowns, {} non-zeros in L",
            dimension,
            chol.l().nnz()
        );
        Ok(Box::new(SparseFactor { chol, dimension }))
    }
}

impl FactoredNormals for SparseFactor {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn solve(&self, rhs: &DVector<f64>) -> DVector<f64> {
        let b = DMatrix::from_column_slice(self.dimension, 1, rhs.as_slice());
        let x = self.chol.solve(&b);
        DVector::from_column_slice(x.as_slice())
    }

    fn inverse_columns(&self, start: usize, count: usize) -> DMatrix<f64> {
        self.chol.solve(&unit_columns(self.dimension, start, count))
    }
}
