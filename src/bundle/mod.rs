//! Bundle adjustment of image trajectories and ground points.
//!
//! Implements a Gauss-Newton least-squares adjustment with:
//! - Schur reduction of ground points into a reduced image system
//! - Dense or sparse Cholesky solves
//! - Outlier rejection and tiered maximum-likelihood weighting
//! - Optional error propagation for adjusted sigmas

pub mod controller;
pub mod error;
pub mod image;
pub mod normals;
pub mod observation;
pub mod parameter_index;
pub mod propagation;
pub mod results;
pub mod robust;
pub mod settings;
pub mod shared;
pub mod solution;
pub mod solver;
pub mod statistics;
pub mod trajectory;

pub use controller::{
    AbortHandle, BundleAdjust, BundleOutcome, BundleState, BundleStatus, FailureReason,
};
pub use error::{BundleError, ErrorKind};
pub use image::BundleImage;
pub use results::{BundleResults, IterationSummary, PropagationStatus};
pub use robust::{MaximumLikelihoodModel, MaximumLikelihoodTier};
pub use settings::{BundleSettings, PointingSolveOption, PositionSolveOption, SolveMethod};
pub use shared::{run_bundle_shared, SharedBundleResult};
pub use solution::BundleSolutionInfo;
pub use trajectory::{ImageAxis, Trajectory};
