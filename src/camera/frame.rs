//! Pinhole frame camera.
//!
//! A body-fixed ground point `g` is taken into the instrument frame with the
//! pointing rotation and projected through a pinhole:
//!
//! ```text
//! p = R(ra, dec, twist) · (g − X)
//! sample = s0 + f · p.x / p.z
//! line   = l0 + f · p.y / p.z
//! ```
//!
//! An optional line rate turns the frame into a crude line-scan model: each
//! line is exposed `line_rate` seconds after the previous one, so the
//! observation time depends on the measured line.

use nalgebra::{Matrix2x3, Matrix2x6, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::{pointing_matrix, pointing_partials};

use super::model::{CameraModel, ExteriorOrientation, GeometryError};

/// Pinhole camera with a focal length expressed in pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameCamera {
    /// Focal length (pixels).
    pub focal_length: f64,

    /// Principal point sample (pixels).
    pub principal_sample: f64,

    /// Principal point line (pixels).
    pub principal_line: f64,

    /// Ephemeris time of line 0 (seconds).
    #[serde(default)]
    pub exposure_time: f64,

    /// Seconds between consecutive lines. Zero for a true frame camera.
    #[serde(default)]
    pub line_rate: f64,

    /// Detector size (samples, lines); predictions outside it fail when set.
    #[serde(default)]
    pub detector: Option<(f64, f64)>,
}

impl FrameCamera {
    /// Create a frame camera with the principal point at the given location.
    pub fn new(focal_length: f64, principal_sample: f64, principal_line: f64) -> Self {
        Self {
            focal_length,
            principal_sample,
            principal_line,
            exposure_time: 0.0,
            line_rate: 0.0,
            detector: None,
        }
    }

    pub fn with_exposure_time(mut self, exposure_time: f64) -> Self {
        self.exposure_time = exposure_time;
        self
    }

    pub fn with_line_rate(mut self, line_rate: f64) -> Self {
        self.line_rate = line_rate;
        self
    }

    pub fn with_detector(mut self, samples: f64, lines: f64) -> Self {
        self.detector = Some((samples, lines));
        self
    }

    /// Point in the instrument frame, rejecting points behind the camera.
    fn to_instrument(
        &self,
        orientation: &ExteriorOrientation,
        ground: &Vector3<f64>,
    ) -> Result<Vector3<f64>, GeometryError> {
        let p = pointing_matrix(&orientation.angles) * (ground - orientation.position);
        if p.z <= 0.0 {
            return Err(GeometryError::BehindInstrument { depth: p.z });
        }
        Ok(p)
    }

    /// d(sample, line) / d(instrument-frame point).
    fn projection_partials(&self, p: &Vector3<f64>) -> Matrix2x3<f64> {
        let f = self.focal_length;
        let inv_z = 1.0 / p.z;
        Matrix2x3::new(
            f * inv_z, 0.0, -f * p.x * inv_z * inv_z,
            0.0, f * inv_z, -f * p.y * inv_z * inv_z,
        )
    }
}

impl CameraModel for FrameCamera {
    fn observation_time(&self, measured: &Vector2<f64>) -> f64 {
        self.exposure_time + self.line_rate * measured.y
    }

    fn predict(
        &self,
        orientation: &ExteriorOrientation,
        ground: &Vector3<f64>,
    ) -> Result<Vector2<f64>, GeometryError> {
        let p = self.to_instrument(orientation, ground)?;
        let sample = self.principal_sample + self.focal_length * p.x / p.z;
        let line = self.principal_line + self.focal_length * p.y / p.z;

        if let Some((samples, lines)) = self.detector {
            if sample < 0.0 || sample > samples || line < 0.0 || line > lines {
                return Err(GeometryError::OutsideDetector { sample, line });
            }
        }
        Ok(Vector2::new(sample, line))
    }

    fn orientation_partials(
        &self,
        orientation: &ExteriorOrientation,
        ground: &Vector3<f64>,
    ) -> Result<Matrix2x6<f64>, GeometryError> {
        let p = self.to_instrument(orientation, ground)?;
        let dp = self.projection_partials(&p);
        let rotation = pointing_matrix(&orientation.angles);
        let offset = ground - orientation.position;

        let mut partials = Matrix2x6::zeros();
        partials
            .fixed_view_mut::<2, 3>(0, 0)
            .copy_from(&(-dp * rotation));
        for (k, d_rotation) in pointing_partials(&orientation.angles).iter().enumerate() {
            partials.set_column(3 + k, &(dp * (d_rotation * offset)));
        }
        Ok(partials)
    }

    fn ground_partials(
        &self,
        orientation: &ExteriorOrientation,
        ground: &Vector3<f64>,
    ) -> Result<Matrix2x3<f64>, GeometryError> {
        let p = self.to_instrument(orientation, ground)?;
        Ok(self.projection_partials(&p) * pointing_matrix(&orientation.angles))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::rotation::angles_looking_at;
    use approx::assert_relative_eq;

    /// Uses only `predict`, so the trait's numeric partials are exercised.
    struct NumericFrame(FrameCamera);

    impl CameraModel for NumericFrame {
        fn observation_time(&self, measured: &Vector2<f64>) -> f64 {
            self.0.observation_time(measured)
        }

        fn predict(
            &self,
            orientation: &ExteriorOrientation,
            ground: &Vector3<f64>,
        ) -> Result<Vector2<f64>, GeometryError> {
            self.0.predict(orientation, ground)
        }
    }

    fn looking_down() -> (FrameCamera, ExteriorOrientation) {
        let camera = FrameCamera::new(5000.0, 512.0, 512.0);
        let position = Vector3::new(1837.4, 10.0, 5.0);
        let mut angles = angles_looking_at(&(-position));
        angles.z = 0.2;
        (camera, ExteriorOrientation::new(position, angles))
    }

    #[test]
    fn test_boresight_projects_to_principal_point() {
        let (camera, eo) = looking_down();
        let ground = eo.position + crate::geometry::boresight(&eo.angles) * 100.0;
        let uv = camera.predict(&eo, &ground).unwrap();
        assert_relative_eq!(uv, Vector2::new(512.0, 512.0), epsilon = 1e-9);
    }

    #[test]
    fn test_point_behind_camera_fails() {
        let (camera, eo) = looking_down();
        let ground = eo.position - crate::geometry::boresight(&eo.angles) * 100.0;
        assert!(matches!(
            camera.predict(&eo, &ground),
            Err(GeometryError::BehindInstrument { .. })
        ));
    }

    #[test]
    fn test_detector_bounds() {
        let (camera, eo) = looking_down();
        let camera = camera.with_detector(1024.0, 1024.0);
        let ground = Vector3::new(1737.4, 60.0, 5.0);
        assert!(matches!(
            camera.predict(&eo, &ground),
            Err(GeometryError::OutsideDetector { .. })
        ));
    }

    #[test]
    fn test_analytic_partials_match_numeric() {
        let (camera, eo) = looking_down();
        let ground = Vector3::new(1737.4, 12.0, 3.0);
        let numeric = NumericFrame(camera.clone());

        let analytic_eo = camera.orientation_partials(&eo, &ground).unwrap();
        let numeric_eo = numeric.orientation_partials(&eo, &ground).unwrap();
        for k in 0..6 {
            let scale = analytic_eo.column(k).norm().max(1.0);
            assert!(
                (analytic_eo.column(k) - numeric_eo.column(k)).norm() / scale < 1e-4,
                "orientation column {} differs",
                k
            );
        }

        let analytic_g = camera.ground_partials(&eo, &ground).unwrap();
        let numeric_g = numeric.ground_partials(&eo, &ground).unwrap();
        assert_relative_eq!(analytic_g, numeric_g, epsilon = 1e-4, max_relative = 1e-5);
    }

    #[test]
    fn test_line_rate_observation_time() {
        let camera = FrameCamera::new(1000.0, 0.0, 0.0)
            .with_exposure_time(100.0)
            .with_line_rate(0.01);
        assert_relative_eq!(camera.observation_time(&Vector2::new(5.0, 200.0)), 102.0);
    }
}
