//! Bundle adjustment over a network shared with other threads.
//!
//! The network is only locked while it is copied and while results are
//! written back; the adjustment itself runs on a private snapshot.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Sender;
use parking_lot::RwLock;

use crate::control::ControlNet;

use super::controller::{BundleAdjust, BundleOutcome, BundleStatus};
use super::error::BundleError;
use super::image::BundleImage;
use super::results::BundleResults;
use super::settings::BundleSettings;

/// What a shared run hands back.
pub struct SharedBundleResult {
    pub outcome: BundleOutcome,
    pub results: BundleResults,
    /// Images with adjusted trajectories.
    pub images: Vec<BundleImage>,
    /// Points written back to the shared network.
    pub updated_points: usize,
}

/// PHASE 3: Write adjusted coordinates, sigmas and measure flags back.
///
/// Points are matched by id; points missing from `target` are skipped.
pub fn apply_bundle_results(target: &mut ControlNet, adjusted: &ControlNet) -> usize {
    let mut updated = 0;
    for source in adjusted.points() {
        let Some(j) = target.find_point(&source.id) else {
            continue;
        };
        target.set_adjusted_coordinate(j, source.adjusted());
        target.set_corrections(j, source.corrections());
        let Some(point) = target.point_mut(j) else {
            continue;
        };
        point.set_adjusted_sigmas(source.adjusted_sigmas());
        for (m, measure) in source.measures().iter().enumerate() {
            if let Some(t) = point.measure_mut(m) {
                if t.serial == measure.serial {
                    t.set_rejected(measure.is_rejected());
                    t.set_residual(measure.residual());
                }
            }
        }
        updated += 1;
    }
    updated
}

/// Run a bundle adjustment against a shared network.
///
/// Clearing `running_flag` from another thread stops the run at the next
/// iteration boundary; the last completed iteration is still written back.
pub fn run_bundle_shared(
    net: &RwLock<ControlNet>,
    images: Vec<BundleImage>,
    settings: BundleSettings,
    running_flag: &AtomicBool,
    progress: Option<Sender<BundleStatus>>,
) -> Result<SharedBundleResult, BundleError> {
    running_flag.store(true, Ordering::SeqCst);

    // Phase 1: Collect
    let snapshot = net.read().clone();

    // Phase 2: Solve
    let mut bundle = match BundleAdjust::new(settings, snapshot, images) {
        Ok(b) => b,
        Err(e) => {
            running_flag.store(false, Ordering::SeqCst);
            return Err(e);
        }
    };
    if let Some(sender) = progress {
        bundle = bundle.with_progress(sender);
    }
    let should_stop = || !running_flag.load(Ordering::SeqCst);
    let outcome = bundle.solve_with(&should_stop);
    running_flag.store(false, Ordering::SeqCst);
    let outcome = outcome?;

    // Phase 3: Apply
    let (adjusted, images, results) = bundle.into_parts();
    let updated_points = {
        let mut guard = net.write();
        apply_bundle_results(&mut guard, &adjusted)
    };

    tracing::info!(
        "Shared bundle complete: {} iterations, sigma0 {:.4} -> {:.4}, {} points updated",
        results.iterations,
        results.initial_sigma0,
        results.sigma0,
        updated_points
    );

    Ok(SharedBundleResult {
        outcome,
        results,
        images,
        updated_points,
    })
}
