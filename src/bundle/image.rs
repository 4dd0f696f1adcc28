//! BundleImage - one image taking part in an adjustment.

use std::sync::Arc;

use nalgebra::DVector;

use crate::camera::CameraModel;
use crate::control::SerialNumber;

use super::parameter_index::ImageLayout;
use super::trajectory::Trajectory;

/// An image: its camera model and the trajectory being adjusted.
#[derive(Clone)]
pub struct BundleImage {
    pub serial: SerialNumber,

    /// File the image came from, for reporting.
    pub file_name: String,

    pub camera: Arc<dyn CameraModel>,

    /// Current (adjusted) trajectory.
    pub trajectory: Trajectory,

    /// Trajectory before the run.
    initial: Trajectory,

    held: bool,

    /// Adjusted coefficient sigmas in block order, after error propagation.
    adjusted_sigmas: Option<DVector<f64>>,
}

impl BundleImage {
    pub fn new(
        serial: SerialNumber,
        file_name: impl Into<String>,
        camera: Arc<dyn CameraModel>,
        trajectory: Trajectory,
    ) -> Self {
        Self {
            serial,
            file_name: file_name.into(),
            camera,
            initial: trajectory.clone(),
            trajectory,
            held: false,
            adjusted_sigmas: None,
        }
    }

    pub fn initial(&self) -> &Trajectory {
        &self.initial
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub(crate) fn set_held(&mut self, held: bool) {
        self.held = held;
    }

    /// Pad both trajectories to the solved coefficient counts.
    pub(crate) fn prepare(&mut self, layout: &ImageLayout) {
        self.trajectory
            .pad_to(layout.position_coefficients(), layout.pointing_coefficients());
        self.initial
            .pad_to(layout.position_coefficients(), layout.pointing_coefficients());
    }

    /// Current solved coefficients in block order.
    pub fn parameters(&self, layout: &ImageLayout) -> DVector<f64> {
        block_values(&self.trajectory, layout)
    }

    /// Correction accumulated over the run, in block order.
    pub fn accumulated_corrections(&self, layout: &ImageLayout) -> DVector<f64> {
        block_values(&self.trajectory, layout) - block_values(&self.initial, layout)
    }

    /// Add a block-ordered correction to the solved coefficients.
    pub(crate) fn apply_corrections(&mut self, layout: &ImageLayout, delta: &[f64]) {
        let mut k = 0;
        for axis in layout.solved_axes() {
            let coefficients = self.trajectory.coefficients_mut(axis);
            for c in coefficients.iter_mut().take(layout.coefficients(axis)) {
                *c += delta[k];
                k += 1;
            }
        }
    }

    pub fn adjusted_sigmas(&self) -> Option<&DVector<f64>> {
        self.adjusted_sigmas.as_ref()
    }

    pub(crate) fn set_adjusted_sigmas(&mut self, sigmas: Option<DVector<f64>>) {
        self.adjusted_sigmas = sigmas;
    }
}

impl std::fmt::Debug for BundleImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleImage")
            .field("serial", &self.serial)
            .field("file_name", &self.file_name)
            .field("held", &self.held)
            .field("trajectory", &self.trajectory)
            .finish()
    }
}

fn block_values(trajectory: &Trajectory, layout: &ImageLayout) -> DVector<f64> {
    let values: Vec<f64> = layout
        .solved_axes()
        .flat_map(|axis| {
            trajectory
                .coefficients(axis)
                .iter()
                .copied()
                .chain(std::iter::repeat(0.0))
                .take(layout.coefficients(axis))
        })
        .collect();
    DVector::from_vec(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::FrameCamera;
    use crate::bundle::trajectory::ImageAxis;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn image() -> BundleImage {
        BundleImage::new(
            SerialNumber::new("img"),
            "img.cub",
            Arc::new(FrameCamera::new(1000.0, 0.0, 0.0)),
            Trajectory::constant(Vector3::new(1.0, 2.0, 3.0), Vector3::new(0.1, 0.2, 0.3)),
        )
    }

    #[test]
    fn test_corrections_follow_block_order() {
        let layout = ImageLayout::new(1, 2, false);
        let mut img = image();
        img.prepare(&layout);

        assert_eq!(img.parameters(&layout).len(), 7);
        img.apply_corrections(&layout, &[0.5, 0.0, 0.0, 0.01, 0.02, 0.0, 0.0]);

        assert_eq!(img.trajectory.coefficients(ImageAxis::X), &[1.5]);
        let ra = img.trajectory.coefficients(ImageAxis::RightAscension);
        assert_relative_eq!(ra[0], 0.11, epsilon = 1e-15);
        assert_relative_eq!(ra[1], 0.02);
        // Twist is padded but not solved
        assert_eq!(img.trajectory.coefficients(ImageAxis::Twist), &[0.3, 0.0]);

        let acc = img.accumulated_corrections(&layout);
        assert_relative_eq!(acc[0], 0.5, epsilon = 1e-15);
        assert_relative_eq!(acc[4], 0.02, epsilon = 1e-15);
    }
}
