//! BundleAdjust - the iterate, solve and update loop.
//!
//! Each iteration:
//! 1. builds observation equations for every active point (in parallel)
//! 2. weighs them with the a-priori sigmas and the active robust tier
//! 3. eliminates point unknowns and solves the reduced system
//! 4. applies image and point corrections
//! 5. recomputes residuals and, optionally, rejects outliers
//! 6. checks convergence on the change of sigma0
//!
//! A run may be aborted between iterations only, so corrections are never
//! half applied. Numerical failures (singular system, non-finite
//! corrections) end the run with the previous iteration's parameters kept.

use std::collections::{HashMap, HashSet};
use std::f64::consts::{PI, TAU};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use nalgebra::{DVector, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::control::{ControlMeasure, ControlNet, ControlPoint, PointType, SerialNumber};
use crate::geometry::surface::{
    parameters_from_rectangular, rectangular_from_parameters, sigmas_to_meters,
    sigmas_to_parameters,
};
use crate::geometry::CoordinateType;

use super::error::BundleError;
use super::image::BundleImage;
use super::normals::{reduce_point, PointConstraint, PointReduction, ReducedNormals};
use super::observation::{
    build_point_observations, BuildMode, ObservationContext, PointObservations,
};
use super::parameter_index::{ImageLayout, ParameterIndex};
use super::propagation::propagate;
use super::results::{
    degrees_of_freedom, sigma0, BundleResults, IterationSummary, PropagationStatus,
};
use super::robust::{residual_zscore, RobustTiers, TierRecord, TierTransition};
use super::settings::BundleSettings;
use super::solver::{solver_for, FactoredNormals, NormalSolver};
use super::statistics::Statistics;

/// Weight that holds the radius of latitudinal points when it is not solved.
const HELD_RADIUS_WEIGHT: f64 = 1e50;

// ─────────────────────────────────────────────────────────────────────────────
// State, outcome and progress
// ─────────────────────────────────────────────────────────────────────────────

/// Why a run ended in [`BundleState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Maximum iterations reached; best-available parameters are kept.
    DidNotConverge,
    /// Stopped between iterations on request.
    Aborted,
    /// Singular system or non-finite corrections.
    Numerical,
}

/// Where a run is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleState {
    #[default]
    Initializing,
    Iterating {
        iteration: usize,
    },
    ErrorPropagation,
    Converged,
    Failed(FailureReason),
}

impl std::fmt::Display for BundleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BundleState::Initializing => write!(f, "initializing"),
            BundleState::Iterating { iteration } => write!(f, "iteration {}", iteration),
            BundleState::ErrorPropagation => write!(f, "error propagation"),
            BundleState::Converged => write!(f, "converged"),
            BundleState::Failed(FailureReason::DidNotConverge) => write!(f, "did not converge"),
            BundleState::Failed(FailureReason::Aborted) => write!(f, "aborted"),
            BundleState::Failed(FailureReason::Numerical) => write!(f, "failed"),
        }
    }
}

/// How a run that produced results ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleOutcome {
    Converged,
    /// Reported, not fatal: results hold the last iteration's parameters.
    DidNotConverge,
    Aborted,
}

/// Progress messages sent while a run is going.
#[derive(Debug, Clone)]
pub enum BundleStatus {
    State(BundleState),
    Iteration(IterationSummary),
    TierEntered(TierRecord),
    Message(String),
}

/// Request to stop a run at the next iteration boundary.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// A-priori weighting
// ─────────────────────────────────────────────────────────────────────────────

/// A point's constraint and which of its weights come from sigmas.
#[derive(Debug, Clone, Copy)]
struct PointApriori {
    constraint: PointConstraint,
    /// False for the held radius, which does not enter vtpv.
    from_sigmas: [bool; 3],
}

impl PointApriori {
    fn constrained_parameters(&self) -> usize {
        self.constraint.weights.iter().filter(|w| **w > 0.0).count()
    }

    fn vtpv(&self) -> f64 {
        (0..3)
            .filter(|k| self.from_sigmas[*k])
            .map(|k| self.constraint.weights[k] * self.constraint.accumulated[k].powi(2))
            .sum()
    }
}

/// Constraint on a solved point, `None` when its parameters are all free.
fn point_apriori(settings: &BundleSettings, point: &ControlPoint) -> Option<PointApriori> {
    let coordinate_type = settings.coordinate_type;
    let sigmas_m = match point.point_type {
        PointType::Fixed => return None,
        PointType::Constrained => point
            .apriori_sigmas
            .map(|s| [Some(s.x), Some(s.y), Some(s.z)])
            .unwrap_or(settings.point_sigmas),
        PointType::Free => settings.point_sigmas,
    };

    let current = parameters_from_rectangular(coordinate_type, &point.adjusted());
    let apriori = parameters_from_rectangular(coordinate_type, &point.apriori());
    let meters = Vector3::from_fn(|k, _| sigmas_m[k].unwrap_or(0.0));
    let sigmas = sigmas_to_parameters(coordinate_type, &current, &meters);

    let mut weights = Vector3::zeros();
    let mut from_sigmas = [false; 3];
    for k in 0..3 {
        if meters[k] > 0.0 {
            weights[k] = 1.0 / (sigmas[k] * sigmas[k]);
            from_sigmas[k] = true;
        }
    }
    if coordinate_type == CoordinateType::Latitudinal && !settings.solve_radius {
        weights.z = HELD_RADIUS_WEIGHT;
        from_sigmas[2] = false;
    }
    if weights.iter().all(|w| *w == 0.0) {
        return None;
    }

    let mut accumulated = current - apriori;
    if coordinate_type == CoordinateType::Latitudinal {
        accumulated.y = wrap_angle(accumulated.y);
    }
    Some(PointApriori {
        constraint: PointConstraint {
            weights,
            accumulated,
        },
        from_sigmas,
    })
}

fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped == -PI {
        PI
    } else {
        wrapped
    }
}

/// Diagonal a-priori weights of an image block, `None` without sigmas.
fn image_apriori_weights(
    settings: &BundleSettings,
    layout: &ImageLayout,
    time_scale: f64,
) -> Option<DVector<f64>> {
    let mut weights = Vec::with_capacity(layout.len());
    for axis in layout.solved_axes() {
        for order in 0..layout.coefficients(axis) {
            let sigma = if axis.is_position() {
                settings.position_coefficient_sigma(order, time_scale)
            } else {
                settings.pointing_coefficient_sigma(order, time_scale)
            };
            weights.push(sigma.map_or(0.0, |s| 1.0 / (s * s)));
        }
    }
    weights
        .iter()
        .any(|w| *w > 0.0)
        .then(|| DVector::from_vec(weights))
}

// ─────────────────────────────────────────────────────────────────────────────
// BundleAdjust
// ─────────────────────────────────────────────────────────────────────────────

/// Everything one linearization produced.
struct Linearized {
    reductions: Vec<PointReduction>,
    normals: ReducedNormals,
    point_unknowns: usize,
    constrained_point_parameters: usize,
    constrained_image_parameters: usize,
    geometry_failures: usize,
    excluded_points: Vec<usize>,
}

/// A bundle adjustment run over an owned network snapshot.
pub struct BundleAdjust {
    settings: BundleSettings,
    net: ControlNet,
    images: Vec<BundleImage>,
    image_lookup: HashMap<SerialNumber, usize>,
    index: ParameterIndex,
    /// Points that take part (not ignored, at least one usable measure).
    active_points: Vec<bool>,
    image_weights: Vec<Option<DVector<f64>>>,
    /// (point, measure) pairs whose geometry failed in the latest residual pass.
    geometry_excluded: HashSet<(usize, usize)>,
    /// Points left out of the latest linearization.
    excluded_points: HashSet<usize>,
    solver: Box<dyn NormalSolver>,
    tiers: RobustTiers,
    results: BundleResults,
    progress: Option<Sender<BundleStatus>>,
    abort: AbortHandle,
}

impl BundleAdjust {
    /// Validate the settings and inputs and lay out the unknowns.
    ///
    /// Every failure here is a user error; no iteration has run.
    pub fn new(
        settings: BundleSettings,
        net: ControlNet,
        mut images: Vec<BundleImage>,
    ) -> Result<Self, BundleError> {
        settings.validate()?;

        let mut image_lookup = HashMap::with_capacity(images.len());
        for (i, image) in images.iter().enumerate() {
            if image_lookup.insert(image.serial.clone(), i).is_some() {
                return Err(BundleError::DuplicateImage(image.serial.clone()));
            }
        }
        if let Some(serial) = settings
            .held_images
            .iter()
            .find(|s| !image_lookup.contains_key(*s))
        {
            return Err(BundleError::UnknownHeldImage(serial.clone()));
        }

        let mut active_points = Vec::with_capacity(net.num_points());
        let mut accepted_measures = 0;
        for point in net.points() {
            let mut active = false;
            if !point.ignored {
                for measure in point.measures().iter().filter(|m| !m.ignored) {
                    if !image_lookup.contains_key(&measure.serial) {
                        return Err(BundleError::MissingImage(measure.serial.clone()));
                    }
                    active = true;
                    if !measure.is_rejected() {
                        accepted_measures += 1;
                    }
                }
            }
            active_points.push(active);
        }
        if accepted_measures == 0 {
            return Err(BundleError::EmptyNetwork);
        }

        let layout = ImageLayout::from_settings(&settings);
        let held: Vec<bool> = images.iter().map(|img| settings.is_held(&img.serial)).collect();
        for (image, held) in images.iter_mut().zip(&held) {
            image.set_held(*held);
            image.prepare(&layout);
        }
        let solved_points: Vec<bool> = net
            .points()
            .iter()
            .zip(&active_points)
            .map(|(p, active)| *active && !p.is_fixed())
            .collect();
        let index = ParameterIndex::new(layout, &held, &solved_points);

        let image_weights: Vec<Option<DVector<f64>>> = images
            .iter()
            .enumerate()
            .map(|(i, img)| {
                if index.is_image_solved(i) {
                    image_apriori_weights(&settings, &layout, img.trajectory.time_scale)
                } else {
                    None
                }
            })
            .collect();

        let constrained_point_parameters: usize = net
            .points()
            .iter()
            .enumerate()
            .filter(|(j, _)| index.is_point_solved(*j))
            .filter_map(|(_, p)| point_apriori(&settings, p))
            .map(|a| a.constrained_parameters())
            .sum();
        let constrained_image_parameters = count_constrained(&image_weights);
        let observations = 2 * accepted_measures;
        let dof = degrees_of_freedom(
            observations,
            constrained_point_parameters,
            constrained_image_parameters,
            index.num_unknowns(),
        );
        if dof < 0 {
            return Err(BundleError::NegativeDegreesOfFreedom(dof));
        }

        let results = BundleResults {
            observations,
            constrained_point_parameters,
            constrained_image_parameters,
            unknowns: index.num_unknowns(),
            image_unknowns: index.image_unknowns(),
            degrees_of_freedom: dof,
            ..BundleResults::new()
        };

        Ok(Self {
            solver: solver_for(settings.solve_method, settings.singularity_tolerance),
            tiers: RobustTiers::new(settings.maximum_likelihood.clone()),
            settings,
            net,
            images,
            image_lookup,
            index,
            active_points,
            image_weights,
            geometry_excluded: HashSet::new(),
            excluded_points: HashSet::new(),
            results,
            progress: None,
            abort: AbortHandle::new(),
        })
    }

    /// Send state and iteration messages to `sender`.
    pub fn with_progress(mut self, sender: Sender<BundleStatus>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Replace the solve strategy picked from the settings.
    pub fn with_solver(mut self, solver: Box<dyn NormalSolver>) -> Self {
        self.solver = solver;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn settings(&self) -> &BundleSettings {
        &self.settings
    }

    pub fn state(&self) -> BundleState {
        self.results.state
    }

    pub fn results(&self) -> &BundleResults {
        &self.results
    }

    pub fn control_net(&self) -> &ControlNet {
        &self.net
    }

    pub fn images(&self) -> &[BundleImage] {
        &self.images
    }

    pub fn index(&self) -> &ParameterIndex {
        &self.index
    }

    pub fn into_parts(self) -> (ControlNet, Vec<BundleImage>, BundleResults) {
        (self.net, self.images, self.results)
    }

    /// Run until convergence, the iteration limit or an abort request.
    pub fn solve(&mut self) -> Result<BundleOutcome, BundleError> {
        let handle = self.abort.clone();
        self.solve_with(&|| handle.is_aborted())
    }

    /// Run, checking `should_stop` before each iteration.
    pub fn solve_with(
        &mut self,
        should_stop: &dyn Fn() -> bool,
    ) -> Result<BundleOutcome, BundleError> {
        let start = Instant::now();
        self.set_state(BundleState::Initializing);
        info!(
            "Bundle adjustment: {} images ({} held), {} points, {} unknowns, {}",
            self.images.len(),
            self.images.iter().filter(|i| i.is_held()).count(),
            self.active_points.iter().filter(|a| **a).count(),
            self.index.num_unknowns(),
            self.solver.name()
        );

        let failures = self.compute_residuals();
        if failures > 0 {
            let observations = 2 * self.accepted_measures();
            self.results.observations = observations;
            self.results.degrees_of_freedom = degrees_of_freedom(
                observations,
                self.results.constrained_point_parameters,
                self.results.constrained_image_parameters,
                self.results.unknowns,
            );
        }
        let vtpv = self.vtpv(self.constraint_vtpv());
        let mut previous_sigma0 = sigma0(vtpv, self.results.degrees_of_freedom);
        self.results.initial_sigma0 = previous_sigma0;
        self.results.sigma0 = previous_sigma0;
        self.results.vtpv = vtpv;
        self.results.geometry_failures = failures;
        self.update_residual_statistics();

        let mut outcome = BundleOutcome::DidNotConverge;
        for iteration in 1..=self.settings.max_iterations {
            if should_stop() {
                outcome = BundleOutcome::Aborted;
                break;
            }

            let (summary, flags_changed) = match self.iterate(iteration) {
                Ok(step) => step,
                Err(e) => return Err(self.fail(e, start)),
            };

            let change = (summary.sigma0 - previous_sigma0).abs();
            previous_sigma0 = summary.sigma0;
            if !flags_changed && change < self.settings.convergence_threshold {
                match self.tiers.on_converged() {
                    TierTransition::Advanced { tier } => {
                        debug!("Converged under tier {}, entering tier {}", tier - 1, tier);
                    }
                    TierTransition::Finished => {
                        outcome = BundleOutcome::Converged;
                        break;
                    }
                }
            }
        }

        self.results.tiers = self.tiers.records().to_vec();
        match outcome {
            BundleOutcome::Converged => {
                self.results.converged = true;
                if self.settings.error_propagation {
                    self.propagate_errors();
                } else {
                    self.results.propagation = PropagationStatus::NotRequested;
                }
                self.set_state(BundleState::Converged);
            }
            BundleOutcome::DidNotConverge => {
                warn!(
                    "Bundle did not converge after {} iterations (sigma0 {:.6})",
                    self.results.iterations, self.results.sigma0
                );
                self.set_state(BundleState::Failed(FailureReason::DidNotConverge));
            }
            BundleOutcome::Aborted => {
                warn!("Bundle aborted after {} iterations", self.results.iterations);
                self.set_state(BundleState::Failed(FailureReason::Aborted));
            }
        }
        self.results.elapsed_seconds = start.elapsed().as_secs_f64();

        info!(
            "Bundle adjustment {}: {} iterations, sigma0 {:.6} -> {:.6}",
            self.results.state,
            self.results.iterations,
            self.results.initial_sigma0,
            self.results.sigma0
        );
        Ok(outcome)
    }

    // ─────────────────────────────────────────────────────────────────────
    // One iteration
    // ─────────────────────────────────────────────────────────────────────

    fn iterate(&mut self, iteration: usize) -> Result<(IterationSummary, bool), BundleError> {
        self.set_state(BundleState::Iterating { iteration });

        let zscores = self.current_zscores();
        self.tiers.begin_iteration(iteration, &zscores);

        let lin = self.linearize();
        let factor = self.factor(&lin.normals)?;
        let image_corrections = factor
            .as_ref()
            .map_or_else(|| DVector::zeros(0), |f| f.solve(lin.normals.rhs()));
        if image_corrections.iter().any(|v| !v.is_finite()) {
            return Err(BundleError::NonFiniteCorrection { iteration });
        }

        let mut point_corrections = Vec::with_capacity(lin.reductions.len());
        for reduction in &lin.reductions {
            if let Some(delta) = reduction.back_substitute(&image_corrections) {
                if delta.iter().any(|v| !v.is_finite()) {
                    return Err(BundleError::NonFiniteCorrection { iteration });
                }
                point_corrections.push((reduction.point, delta));
            }
        }

        // Nothing has been modified before this point
        self.apply_image_corrections(&image_corrections);
        self.apply_point_corrections(&point_corrections);
        self.excluded_points = lin.excluded_points.iter().copied().collect();
        if let Some(record) = self.tiers.complete_iteration() {
            self.notify(BundleStatus::TierEntered(record));
        }

        let residual_failures = self.compute_residuals();
        let flags_changed = self.settings.outlier_rejection && self.reject_outliers();

        let accepted = self.accepted_measures();
        let dof = degrees_of_freedom(
            2 * accepted,
            lin.constrained_point_parameters,
            lin.constrained_image_parameters,
            self.index.image_unknowns() + lin.point_unknowns,
        );
        let vtpv = self.vtpv(self.constraint_vtpv());
        let s0 = sigma0(vtpv, dof);

        self.update_residual_statistics();
        let summary = IterationSummary {
            iteration,
            sigma0: s0,
            vtpv,
            observations: 2 * accepted,
            degrees_of_freedom: dof,
            rejected_measures: self.results.rejected_measures,
            geometry_failures: residual_failures,
            excluded_points: lin.excluded_points.len(),
            rms_total: self.results.rms_total,
            max_image_correction: image_corrections
                .iter()
                .fold(0.0, |m: f64, v| m.max(v.abs())),
        };

        self.results.iterations = iteration;
        self.results.sigma0 = s0;
        self.results.vtpv = vtpv;
        self.results.observations = summary.observations;
        self.results.degrees_of_freedom = dof;
        self.results.constrained_point_parameters = lin.constrained_point_parameters;
        self.results.constrained_image_parameters = lin.constrained_image_parameters;
        self.results.geometry_failures = summary.geometry_failures;
        self.results.excluded_points = summary.excluded_points;
        self.results.history.push(summary);

        info!(
            "Iteration {}: sigma0 {:.6}, vtpv {:.6}, dof {}, rms {:.4} px, rejected {}",
            iteration,
            s0,
            vtpv,
            dof,
            summary.rms_total,
            summary.rejected_measures
        );
        self.notify(BundleStatus::Iteration(summary));
        Ok((summary, flags_changed))
    }

    fn context(&self) -> ObservationContext<'_> {
        ObservationContext {
            images: &self.images,
            image_lookup: &self.image_lookup,
            index: &self.index,
            coordinate_type: self.settings.coordinate_type,
            default_sigma: self.settings.measure_sigma,
        }
    }

    /// Build, weigh and reduce every active point, then fold the reductions
    /// in point order.
    fn linearize(&self) -> Linearized {
        let ctx = self.context();
        let settings = &self.settings;
        let index = &self.index;
        let tiers = &self.tiers;
        let active = &self.active_points;

        let passes: Vec<_> = self
            .net
            .points()
            .par_iter()
            .enumerate()
            .filter(|(j, _)| active[*j])
            .map(|(j, point)| {
                let observations = build_point_observations(&ctx, j, point, BuildMode::Linearize);
                let apriori = if index.is_point_solved(j) {
                    point_apriori(settings, point)
                } else {
                    None
                };
                let reduction = reduce_point(
                    &observations,
                    index,
                    |eq| eq.weight() * tiers.weight(eq.zscore()),
                    apriori.as_ref().map(|a| &a.constraint),
                );
                (observations, apriori, reduction)
            })
            .collect();

        let mut lin = Linearized {
            reductions: Vec::with_capacity(passes.len()),
            normals: ReducedNormals::new(index.image_unknowns()),
            point_unknowns: 0,
            constrained_point_parameters: 0,
            constrained_image_parameters: 0,
            geometry_failures: 0,
            excluded_points: Vec::new(),
        };

        for (observations, apriori, reduction) in passes {
            let id = &self.net.points()[observations.point].id;
            for (m, err) in &observations.geometry_failures {
                warn!("Point {} measure {} excluded: {}", id, m, err);
            }
            lin.geometry_failures += observations.geometry_failures.len();

            match reduction {
                Ok(reduction) => {
                    if reduction.inverse.is_some() {
                        lin.point_unknowns += 3;
                        if let Some(apriori) = &apriori {
                            lin.constrained_point_parameters += apriori.constrained_parameters();
                        }
                    }
                    lin.normals.accumulate(&reduction);
                    lin.reductions.push(reduction);
                }
                Err(exclusion) => {
                    warn!("Point {} excluded this iteration: {:?}", id, exclusion);
                    lin.excluded_points.push(observations.point);
                }
            }
        }

        let layout = *index.layout();
        for (i, weights) in self.image_weights.iter().enumerate() {
            let (Some(weights), Some(start)) = (weights, index.image_start_of(i)) else {
                continue;
            };
            let accumulated = self.images[i].accumulated_corrections(&layout);
            lin.normals.add_diagonal_constraint(start, weights, &accumulated);
            lin.constrained_image_parameters += weights.iter().filter(|w| **w > 0.0).count();
        }

        debug!(
            "Reduced system: {} unknowns, {} blocks, {} measures and {} points excluded",
            lin.normals.dimension(),
            lin.normals.num_blocks(),
            lin.geometry_failures,
            lin.excluded_points.len()
        );
        lin
    }

    /// Factor the reduced system, `None` when no image has unknowns.
    fn factor(
        &self,
        normals: &ReducedNormals,
    ) -> Result<Option<Box<dyn FactoredNormals>>, BundleError> {
        if normals.dimension() == 0 {
            return Ok(None);
        }
        self.solver.factor(normals).map(Some)
    }

    fn apply_image_corrections(&mut self, corrections: &DVector<f64>) {
        let layout = *self.index.layout();
        let blocks: Vec<(usize, usize)> = self
            .index
            .solved_images()
            .filter_map(|i| self.index.image_start_of(i).map(|start| (i, start)))
            .collect();
        for (i, start) in blocks {
            let delta = &corrections.as_slice()[start..start + layout.len()];
            self.images[i].apply_corrections(&layout, delta);
        }
    }

    fn apply_point_corrections(&mut self, corrections: &[(usize, Vector3<f64>)]) {
        let coordinate_type = self.settings.coordinate_type;
        for (j, delta) in corrections {
            let Some(point) = self.net.point(*j) else {
                continue;
            };
            let params = parameters_from_rectangular(coordinate_type, &point.adjusted()) + delta;
            let accumulated = point.corrections() + delta;
            self.net
                .set_adjusted_coordinate(*j, rectangular_from_parameters(coordinate_type, &params));
            self.net.set_corrections(*j, accumulated);
        }
    }

    /// Store current residuals of every active measure on the network.
    ///
    /// Measures whose geometry failed are excluded until the next pass.
    /// Returns how many there are.
    fn compute_residuals(&mut self) -> usize {
        let ctx = self.context();
        let active = &self.active_points;
        let passes: Vec<PointObservations> = self
            .net
            .points()
            .par_iter()
            .enumerate()
            .filter(|(j, _)| active[*j])
            .map(|(j, point)| build_point_observations(&ctx, j, point, BuildMode::ResidualsOnly))
            .collect();

        self.geometry_excluded.clear();
        for observations in passes {
            self.geometry_excluded.extend(
                observations
                    .geometry_failures
                    .iter()
                    .map(|(m, _)| (observations.point, *m)),
            );
            for eq in &observations.equations {
                self.net
                    .set_residual(observations.point, eq.measure, eq.residual);
            }
        }
        self.geometry_excluded.len()
    }

    fn is_excluded(&self, point: usize, measure: usize) -> bool {
        self.excluded_points.contains(&point) || self.geometry_excluded.contains(&(point, measure))
    }

    fn update_residual_statistics(&mut self) {
        let (points, measures) = (&self.excluded_points, &self.geometry_excluded);
        self.results.update_residual_statistics(
            &self.net,
            &self.images,
            self.settings.measure_sigma,
            |j, m| points.contains(&j) || measures.contains(&(j, m)),
        );
    }

    fn measure_sigma(&self, measure: &ControlMeasure) -> f64 {
        measure.sigma.unwrap_or(self.settings.measure_sigma)
    }

    /// Accepted measures of active points, without excluded ones.
    fn accepted(&self) -> impl Iterator<Item = (usize, usize, &ControlMeasure)> + '_ {
        self.net
            .points()
            .iter()
            .enumerate()
            .filter(move |(j, _)| self.active_points[*j] && !self.excluded_points.contains(j))
            .flat_map(move |(j, p)| {
                p.measures()
                    .iter()
                    .enumerate()
                    .filter(move |(m, measure)| {
                        measure.is_accepted() && !self.geometry_excluded.contains(&(j, *m))
                    })
                    .map(move |(m, measure)| (j, m, measure))
            })
    }

    fn accepted_measures(&self) -> usize {
        self.accepted().count()
    }

    fn current_zscores(&self) -> Vec<f64> {
        self.accepted()
            .map(|(_, _, m)| residual_zscore(&m.residual(), self.measure_sigma(m)))
            .collect()
    }

    /// Weighted sum of squared residuals plus constraint terms.
    fn vtpv(&self, point_vtpv: f64) -> f64 {
        let observations: f64 = self
            .accepted()
            .map(|(_, _, m)| {
                let sigma = self.measure_sigma(m);
                let robust = self.tiers.weight(residual_zscore(&m.residual(), sigma));
                robust * m.residual().norm_squared() / (sigma * sigma)
            })
            .sum();

        let layout = *self.index.layout();
        let images: f64 = self
            .image_weights
            .iter()
            .zip(&self.images)
            .filter_map(|(w, img)| w.as_ref().map(|w| (w, img)))
            .map(|(w, img)| {
                let acc = img.accumulated_corrections(&layout);
                w.iter().zip(acc.iter()).map(|(w, a)| w * a * a).sum::<f64>()
            })
            .sum();

        observations + point_vtpv + images
    }

    fn constraint_vtpv(&self) -> f64 {
        self.net
            .points()
            .iter()
            .enumerate()
            .filter(|(j, _)| self.index.is_point_solved(*j) && !self.excluded_points.contains(j))
            .filter_map(|(_, p)| point_apriori(&self.settings, p))
            .map(|a| a.vtpv())
            .sum()
    }

    /// Flag the worst measure of each point above the rejection limit and
    /// re-admit rejected measures that fell back under it.
    ///
    /// Returns true if any flag changed.
    fn reject_outliers(&mut self) -> bool {
        let rms = self
            .accepted()
            .map(|(_, _, m)| m.residual().norm() / self.measure_sigma(m))
            .collect::<Statistics>()
            .rms();
        let limit = self.settings.outlier_rejection_multiplier * rms;
        self.results.rejection_limit = Some(limit);

        let mut changes = Vec::new();
        for (j, point) in self.net.points().iter().enumerate() {
            if !self.active_points[j] {
                continue;
            }
            let mut accepted = Vec::new();
            for (m, measure) in point.measures().iter().enumerate() {
                if measure.ignored || self.is_excluded(j, m) {
                    continue;
                }
                let weighted = measure.residual().norm() / self.measure_sigma(measure);
                if measure.is_rejected() {
                    if weighted <= limit {
                        changes.push((j, m, false));
                    }
                } else {
                    accepted.push((m, weighted));
                }
            }
            // Keep at least two accepted measures per point
            if accepted.len() < 3 {
                continue;
            }
            if let Some((m, weighted)) = accepted
                .into_iter()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            {
                if weighted > limit {
                    changes.push((j, m, true));
                }
            }
        }

        for (j, m, rejected) in &changes {
            debug!(
                "Point {} measure {} {}",
                self.net.points()[*j].id,
                m,
                if *rejected { "rejected" } else { "re-admitted" }
            );
            self.net.set_rejected(*j, *m, *rejected);
        }
        !changes.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Error propagation and bookkeeping
    // ─────────────────────────────────────────────────────────────────────

    fn propagate_errors(&mut self) {
        self.set_state(BundleState::ErrorPropagation);
        let start = Instant::now();
        let result = self.compute_sigmas();
        self.results.error_propagation_seconds = start.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                self.results.propagation = PropagationStatus::Completed;
                self.results.update_point_sigma_summary(&self.net);
                info!(
                    "Error propagation complete in {:.3} s",
                    self.results.error_propagation_seconds
                );
            }
            Err(e) => {
                warn!("Error propagation failed, keeping solution without sigmas: {}", e);
                for image in &mut self.images {
                    image.set_adjusted_sigmas(None);
                }
                for j in 0..self.net.num_points() {
                    if let Some(point) = self.net.point_mut(j) {
                        point.set_adjusted_sigmas(None);
                    }
                }
                self.results.point_sigmas = None;
                self.results.propagation = PropagationStatus::Failed(e.to_string());
            }
        }
    }

    /// Relinearize at the final parameters and store adjusted sigmas.
    fn compute_sigmas(&mut self) -> Result<(), BundleError> {
        let lin = self.linearize();
        let factor = self.factor(&lin.normals)?;
        let sigmas = propagate(
            factor.as_deref(),
            &self.index,
            &lin.reductions,
            self.results.sigma0,
        )?;

        for (image, s) in sigmas.images {
            self.images[image].set_adjusted_sigmas(Some(s));
        }
        let coordinate_type = self.settings.coordinate_type;
        for (j, s) in sigmas.points {
            if let Some(point) = self.net.point_mut(j) {
                let params = parameters_from_rectangular(coordinate_type, &point.adjusted());
                point.set_adjusted_sigmas(Some(sigmas_to_meters(coordinate_type, &params, &s)));
            }
        }
        Ok(())
    }

    fn fail(&mut self, error: BundleError, start: Instant) -> BundleError {
        warn!("Bundle adjustment failed: {}", error);
        self.results.tiers = self.tiers.records().to_vec();
        self.results.elapsed_seconds = start.elapsed().as_secs_f64();
        self.set_state(BundleState::Failed(FailureReason::Numerical));
        self.notify(BundleStatus::Message(error.to_string()));
        error
    }

    fn set_state(&mut self, state: BundleState) {
        self.results.state = state;
        self.notify(BundleStatus::State(state));
    }

    fn notify(&self, status: BundleStatus) {
        if let Some(sender) = &self.progress {
            // A listener that went away does not stop the run
            let _ = sender.send(status);
        }
    }
}

fn count_constrained(weights: &[Option<DVector<f64>>]) -> usize {
    weights
        .iter()
        .flatten()
        .map(|w| w.iter().filter(|v| **v > 0.0).count())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    use nalgebra::{Matrix2x3, Matrix2x6, Vector2};

    use crate::bundle::error::ErrorKind;
    use crate::bundle::robust::{MaximumLikelihoodModel, MaximumLikelihoodTier};
    use crate::bundle::settings::{PointingSolveOption, PositionSolveOption};
    use crate::camera::{CameraModel, ExteriorOrientation, GeometryError};
    use crate::synthetic::{SyntheticConfig, SyntheticNetwork};

    fn scene() -> SyntheticNetwork {
        SyntheticNetwork::generate(&SyntheticConfig {
            images: 3,
            points: 12,
            ..Default::default()
        })
    }

    /// Camera without geometry for ground near one location.
    struct BlindSpotCamera {
        inner: Arc<dyn CameraModel>,
        center: Vector3<f64>,
        radius: f64,
    }

    impl BlindSpotCamera {
        fn check(&self, ground: &Vector3<f64>) -> Result<(), GeometryError> {
            if (ground - self.center).norm() < self.radius {
                Err(GeometryError::NoGeometry { time: 0.0 })
            } else {
                Ok(())
            }
        }
    }

    impl CameraModel for BlindSpotCamera {
        fn observation_time(&self, measured: &Vector2<f64>) -> f64 {
            self.inner.observation_time(measured)
        }

        fn predict(
            &self,
            orientation: &ExteriorOrientation,
            ground: &Vector3<f64>,
        ) -> Result<Vector2<f64>, GeometryError> {
            self.check(ground)?;
            self.inner.predict(orientation, ground)
        }

        fn orientation_partials(
            &self,
            orientation: &ExteriorOrientation,
            ground: &Vector3<f64>,
        ) -> Result<Matrix2x6<f64>, GeometryError> {
            self.check(ground)?;
            self.inner.orientation_partials(orientation, ground)
        }

        fn ground_partials(
            &self,
            orientation: &ExteriorOrientation,
            ground: &Vector3<f64>,
        ) -> Result<Matrix2x3<f64>, GeometryError> {
            self.check(ground)?;
            self.inner.ground_partials(orientation, ground)
        }
    }

    fn blind(image: &mut BundleImage, center: Vector3<f64>) {
        image.camera = Arc::new(BlindSpotCamera {
            inner: image.camera.clone(),
            center,
            radius: 0.01,
        });
    }

    struct SingularSolver;

    impl NormalSolver for SingularSolver {
        fn name(&self) -> &'static str {
            "singular"
        }

        fn factor(
            &self,
            _normals: &ReducedNormals,
        ) -> Result<Box<dyn FactoredNormals>, BundleError> {
            Err(BundleError::SingularSystem { pivot: None })
        }
    }

    fn assert_dof_consistent(results: &BundleResults, unknowns: usize) {
        assert_eq!(
            results.degrees_of_freedom,
            degrees_of_freedom(
                results.observations,
                results.constrained_point_parameters,
                results.constrained_image_parameters,
                unknowns,
            )
        );
    }

    #[test]
    fn test_wrap_angle() {
        assert_relative_eq!(wrap_angle(TAU + 0.1), 0.1, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(-PI - 0.1), PI - 0.1, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(-PI), PI);
    }

    #[test]
    fn test_nothing_to_solve_fails_before_iterating() {
        let (net, images) = scene().into_parts();
        let settings = BundleSettings {
            pointing: PointingSolveOption::None,
            position: PositionSolveOption::None,
            ..Default::default()
        };
        let err = BundleAdjust::new(settings, net, images).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::User);
        assert_eq!(
            err.to_string(),
            "Must either solve for camera pointing or spacecraft position"
        );
    }

    #[test]
    fn test_missing_and_duplicate_images() {
        let (net, mut images) = scene().into_parts();
        let first = images.remove(0);
        let missing = BundleAdjust::new(BundleSettings::default(), net.clone(), images.clone());
        assert!(matches!(missing, Err(BundleError::MissingImage(_))));

        images.push(first.clone());
        images.push(first);
        let duplicate = BundleAdjust::new(BundleSettings::default(), net, images);
        assert!(matches!(duplicate, Err(BundleError::DuplicateImage(_))));
    }

    #[test]
    fn test_unknown_held_image() {
        let (net, images) = scene().into_parts();
        let settings = BundleSettings {
            held_images: vec![SerialNumber::new("nope")],
            ..Default::default()
        };
        assert!(matches!(
            BundleAdjust::new(settings, net, images),
            Err(BundleError::UnknownHeldImage(_))
        ));
    }

    #[test]
    fn test_empty_network() {
        let (_, images) = scene().into_parts();
        let net = ControlNet::new("empty", "Moon");
        assert!(matches!(
            BundleAdjust::new(BundleSettings::default(), net, images),
            Err(BundleError::EmptyNetwork)
        ));
    }

    #[test]
    fn test_negative_degrees_of_freedom() {
        let (full, images) = scene().into_parts();
        // One free point seen twice: 4 observations against 9 pointing unknowns
        let mut net = ControlNet::new("tiny", "Moon");
        let point = &full.points()[5];
        let mut tiny = ControlPoint::new(point.id.clone(), PointType::Free, point.apriori());
        for m in point.measures().iter().take(2) {
            tiny.add_measure(m.clone());
        }
        net.add_point(tiny);

        let err = BundleAdjust::new(BundleSettings::default(), net, images)
            .err()
            .unwrap();
        assert!(matches!(err, BundleError::NegativeDegreesOfFreedom(_)));
        assert_eq!(err.kind(), ErrorKind::User);
    }

    #[test]
    fn test_setup_counts() {
        let scene = scene();
        let fixed = scene
            .network
            .points()
            .iter()
            .filter(|p| p.is_fixed())
            .count();
        let (net, images) = scene.into_parts();
        let measures = net.num_measures();
        let points = net.num_points();

        let bundle = BundleAdjust::new(BundleSettings::default(), net, images).unwrap();
        let results = bundle.results();
        assert_eq!(results.observations, 2 * measures);
        assert_eq!(results.image_unknowns, 9);
        assert_eq!(results.unknowns, 9 + 3 * (points - fixed));
        // Held radius of each free point
        assert_eq!(results.constrained_point_parameters, points - fixed);
        assert_eq!(bundle.state(), BundleState::Initializing);
    }

    #[test]
    fn test_image_apriori_weights() {
        let settings = BundleSettings {
            pointing_sigmas: vec![0.1],
            ..Default::default()
        };
        let layout = ImageLayout::from_settings(&settings);
        let weights = image_apriori_weights(&settings, &layout, 1.0).unwrap();
        assert_eq!(weights.len(), 3);
        assert_relative_eq!(weights[0], 1.0 / 0.1f64.to_radians().powi(2));
        assert!(image_apriori_weights(&BundleSettings::default(), &layout, 1.0).is_none());
    }

    #[test]
    fn test_failed_geometry_leaves_the_measure_out() {
        let (net, mut images) = scene().into_parts();
        let serial = images[0].serial.clone();
        let (j, m) = net
            .points()
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_fixed() && p.measures().len() >= 3)
            .find_map(|(j, p)| {
                p.measures()
                    .iter()
                    .position(|x| x.serial == serial)
                    .map(|m| (j, m))
            })
            .unwrap();
        blind(&mut images[0], net.points()[j].apriori());
        let measures = net.num_measures();

        let mut bundle = BundleAdjust::new(BundleSettings::default(), net, images).unwrap();
        assert_eq!(bundle.solve().unwrap(), BundleOutcome::Converged);
        assert!(bundle.is_excluded(j, m));

        let results = bundle.results();
        assert_eq!(results.geometry_failures, 1);
        assert_eq!(results.excluded_points, 0);
        assert_eq!(results.observations, 2 * (measures - 1));
        assert_dof_consistent(results, results.unknowns);
        let image = results.image_residuals(&serial).unwrap();
        assert_eq!(image.total_measures - image.used, 1);
        assert_eq!(bundle.accepted_measures(), measures - 1);
    }

    #[test]
    fn test_point_without_usable_measures_is_excluded() {
        let (net, mut images) = scene().into_parts();
        let j = net
            .points()
            .iter()
            .position(|p| !p.is_fixed())
            .unwrap();
        let center = net.points()[j].apriori();
        for image in &mut images {
            blind(image, center);
        }
        let measures = net.num_measures();
        let seen = net.points()[j].measures().len();

        let mut bundle = BundleAdjust::new(BundleSettings::default(), net, images).unwrap();
        assert_eq!(bundle.solve().unwrap(), BundleOutcome::Converged);

        let results = bundle.results();
        assert_eq!(results.excluded_points, 1);
        assert_eq!(results.geometry_failures, seen);
        assert_eq!(results.observations, 2 * (measures - seen));
        assert_dof_consistent(results, results.unknowns - 3);
        assert_eq!(bundle.control_net().points()[j].adjusted(), center);
    }

    #[test]
    fn test_failed_iteration_records_no_tier() {
        let (net, images) = scene().into_parts();
        let settings = BundleSettings {
            maximum_likelihood: vec![MaximumLikelihoodTier::new(
                MaximumLikelihoodModel::Huber,
                0.75,
            )],
            ..Default::default()
        };
        let mut bundle = BundleAdjust::new(settings, net, images)
            .unwrap()
            .with_solver(Box::new(SingularSolver));

        let err = bundle.solve().err().unwrap();
        assert!(matches!(err, BundleError::SingularSystem { .. }));
        assert_eq!(bundle.state(), BundleState::Failed(FailureReason::Numerical));
        assert!(bundle.results().tiers.is_empty());
        assert_eq!(bundle.results().iterations, 0);
    }

    #[test]
    fn test_abort_before_first_iteration() {
        let (net, images) = scene().into_parts();
        let mut bundle = BundleAdjust::new(BundleSettings::default(), net, images).unwrap();
        bundle.abort_handle().abort();
        assert_eq!(bundle.solve().unwrap(), BundleOutcome::Aborted);
        assert_eq!(bundle.results().iterations, 0);
        assert_eq!(bundle.state(), BundleState::Failed(FailureReason::Aborted));
    }
}
