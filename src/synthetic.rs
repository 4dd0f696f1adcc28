//! Synthetic control networks for tests and demos.
//!
//! A cluster of frame cameras at a fixed altitude looks down at a small
//! patch of a spherical body. Points are scattered over the patch and
//! measured in every image that sees them, optionally with uniform noise.
//! Truth is kept so perturbed runs can be checked against it.

use std::sync::Arc;

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::bundle::image::BundleImage;
use crate::bundle::trajectory::Trajectory;
use crate::camera::{CameraModel, FrameCamera};
use crate::control::{ControlMeasure, ControlNet, ControlPoint, PointId, PointType, SerialNumber};
use crate::geometry::rotation::angles_looking_at;
use crate::geometry::surface::{to_latitudinal, to_rectangular};

/// Configuration for [`SyntheticNetwork::generate`].
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub images: usize,
    pub points: usize,
    /// Body radius (km).
    pub body_radius: f64,
    /// Camera height above the surface (km).
    pub altitude: f64,
    /// Half-width of the square the cameras are spread over (km).
    pub camera_spread: f64,
    /// Half-width of the square the points are spread over (km).
    pub point_spread: f64,
    /// Half-range of point heights above the body radius (km).
    pub relief: f64,
    /// Focal length (pixels).
    pub focal_length: f64,
    /// Detector size (samples, lines).
    pub detector: (f64, f64),
    /// Half-range of uniform measurement noise (pixels).
    pub measure_noise: f64,
    /// The first `fixed_points` points are Fixed.
    pub fixed_points: usize,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            images: 6,
            points: 40,
            body_radius: 1737.4,
            altitude: 100.0,
            camera_spread: 3.0,
            point_spread: 5.0,
            relief: 0.5,
            focal_length: 5000.0,
            detector: (1024.0, 1024.0),
            measure_noise: 0.0,
            fixed_points: 3,
            seed: 42,
        }
    }
}

/// A generated network with the cameras and trajectories that observe it.
#[derive(Debug, Clone)]
pub struct SyntheticNetwork {
    pub network: ControlNet,
    pub cameras: Vec<FrameCamera>,
    /// Trajectories handed to the bundle (perturbed or not).
    pub trajectories: Vec<Trajectory>,
    pub truth_points: Vec<Vector3<f64>>,
    pub truth_trajectories: Vec<Trajectory>,
}

fn uniform(rng: &mut StdRng, half_range: f64) -> f64 {
    if half_range > 0.0 {
        rng.gen_range(-half_range..half_range)
    } else {
        0.0
    }
}

pub fn serial_of(image: usize) -> SerialNumber {
    SerialNumber::new(format!("IMG{}", image))
}

impl SyntheticNetwork {
    pub fn generate(config: &SyntheticConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let radius = config.body_radius;
        let center = Vector3::new(radius, 0.0, 0.0);

        let mut cameras = Vec::with_capacity(config.images);
        let mut trajectories = Vec::with_capacity(config.images);
        for i in 0..config.images {
            let position = Vector3::new(
                radius + config.altitude,
                uniform(&mut rng, config.camera_spread),
                uniform(&mut rng, config.camera_spread),
            );
            let exposure = 100.0 + 10.0 * i as f64;
            let camera = FrameCamera::new(
                config.focal_length,
                config.detector.0 / 2.0,
                config.detector.1 / 2.0,
            )
            .with_exposure_time(exposure)
            .with_detector(config.detector.0, config.detector.1);
            let angles = angles_looking_at(&(center - position));
            cameras.push(camera);
            trajectories.push(Trajectory::constant(position, angles).with_time_base(exposure, 1.0));
        }

        let mut network = ControlNet::new("synthetic", "Moon");
        let mut truth_points = Vec::with_capacity(config.points);
        let angular_spread = config.point_spread / radius;
        let mut attempts = 0;
        while truth_points.len() < config.points && attempts < 10 * config.points.max(1) {
            attempts += 1;
            let ground = to_rectangular(&Vector3::new(
                uniform(&mut rng, angular_spread),
                uniform(&mut rng, angular_spread),
                radius + uniform(&mut rng, config.relief),
            ));

            let ordinal = truth_points.len();
            let point_type = if ordinal < config.fixed_points {
                PointType::Fixed
            } else {
                PointType::Free
            };
            let mut point =
                ControlPoint::new(PointId::new(format!("P{:04}", ordinal + 1)), point_type, ground);
            for (i, (camera, trajectory)) in cameras.iter().zip(&trajectories).enumerate() {
                let orientation = trajectory.orientation_at(camera.exposure_time);
                let Ok(predicted) = camera.predict(&orientation, &ground) else {
                    continue;
                };
                point.add_measure(ControlMeasure::new(
                    serial_of(i),
                    predicted.x + uniform(&mut rng, config.measure_noise),
                    predicted.y + uniform(&mut rng, config.measure_noise),
                ));
            }
            if point.num_measures() < 2 {
                continue;
            }
            network.add_point(point);
            truth_points.push(ground);
        }

        Self {
            network,
            cameras,
            truth_trajectories: trajectories.clone(),
            trajectories,
            truth_points,
        }
    }

    /// Offset every image's constant pointing angles by up to `magnitude` radians.
    pub fn perturb_pointing(mut self, magnitude: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        for trajectory in &mut self.trajectories {
            for angle in &mut trajectory.pointing {
                if let Some(c) = angle.first_mut() {
                    *c += uniform(&mut rng, magnitude);
                }
            }
        }
        self
    }

    /// Move the a-priori latitude and longitude of non-fixed points by up to
    /// `magnitude` km on the surface.
    pub fn perturb_points(mut self, magnitude: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut perturbed = ControlNet::new(
            self.network.network_id.clone(),
            self.network.target.clone(),
        );
        for point in self.network.points() {
            if point.is_fixed() {
                perturbed.add_point(point.clone());
                continue;
            }
            let mut lat_lon_radius = to_latitudinal(&point.apriori());
            let angular = magnitude / lat_lon_radius.z;
            lat_lon_radius.x += uniform(&mut rng, angular);
            lat_lon_radius.y += uniform(&mut rng, angular);

            let mut moved = ControlPoint::new(
                point.id.clone(),
                point.point_type,
                to_rectangular(&lat_lon_radius),
            );
            moved.ignored = point.ignored;
            moved.apriori_sigmas = point.apriori_sigmas;
            for measure in point.measures() {
                moved.add_measure(measure.clone());
            }
            perturbed.add_point(moved);
        }
        self.network = perturbed;
        self
    }

    /// Fresh bundle images over the current trajectories.
    pub fn images(&self) -> Vec<BundleImage> {
        self.cameras
            .iter()
            .zip(&self.trajectories)
            .enumerate()
            .map(|(i, (camera, trajectory))| {
                let camera: Arc<dyn CameraModel> = Arc::new(camera.clone());
                BundleImage::new(serial_of(i), format!("img{}.cub", i), camera, trajectory.clone())
            })
            .collect()
    }

    pub fn into_parts(self) -> (ControlNet, Vec<BundleImage>) {
        let images = self.images();
        (self.network, images)
    }
}
